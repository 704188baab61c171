//! 助手进程行协议
//!
//! - 入站：每行一个 JSON 对象，`packetType` 字段选择具体结构
//! - 出站：纯文本命令行（`startScan`、`connect <name>`、`sendBlob <name> <base64>` 等）
//!
//! 通知载荷以破折号分隔的十六进制字节串传输（如 `"01-A2-FF"`），
//! 命令载荷以 base64 编码传输。

use crate::ProtocolError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer};
use std::fmt;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum LinkStatus {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "userDisconnected")]
    UserDisconnected,
    #[serde(rename = "deviceDisconnected")]
    DeviceDisconnected,
}

/// 本机蓝牙状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BluetoothState {
    On,
    Off,
    Unavailable,
}

impl BluetoothState {
    /// 解析状态字符串，未知值按 Off 处理
    pub fn from_status(status: &str) -> Self {
        match status {
            "on" => BluetoothState::On,
            "unavailable" => BluetoothState::Unavailable,
            _ => BluetoothState::Off,
        }
    }

    /// 蓝牙是否已开启
    pub fn is_on(self) -> bool {
        self == BluetoothState::On
    }

    /// 是否存在可用的蓝牙硬件
    pub fn is_available(self) -> bool {
        self != BluetoothState::Unavailable
    }
}

/// 助手进程上报的事件
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "packetType")]
pub enum HelperEvent {
    #[serde(rename = "discovery")]
    Discovery {
        name: String,
        #[serde(default, deserialize_with = "lenient_i16")]
        rssi: Option<i16>,
    },

    #[serde(rename = "notification")]
    Notification { peripheral: String, data: String },

    #[serde(rename = "connection")]
    Connection {
        status: LinkStatus,
        peripheral: String,
        #[serde(rename = "hasV2", default)]
        has_v2: Option<String>,
    },

    #[serde(rename = "bluetoothState")]
    BluetoothState { status: String },

    #[serde(rename = "quit")]
    Quit {
        #[serde(default)]
        reason: Option<String>,
    },

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "ERROR")]
    Error {
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "DEBUG")]
    Debug {
        #[serde(default)]
        message: String,
    },
}

impl HelperEvent {
    /// 解析一行 JSON
    pub fn parse_line(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim()).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    /// 连接事件是否报告了 V2 固件（`hasV2` 为字面量 "True"）
    pub fn reports_v2(has_v2: Option<&str>) -> bool {
        has_v2 == Some("True")
    }
}

/// rssi 字段可能是数字，也可能是数字字符串
fn lenient_i16<'de, D>(deserializer: D) -> Result<Option<i16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_i64().map(|v| v as i16),
        serde_json::Value::String(s) => s.trim().parse::<i16>().ok(),
        _ => None,
    };
    Ok(parsed)
}

/// 发给助手进程的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperCommand {
    StartScan,
    StopScan,
    Connect(String),
    Disconnect(String),
    SendBlob { name: String, data: Vec<u8> },
    Quit,
}

impl fmt::Display for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HelperCommand::StartScan => write!(f, "startScan"),
            HelperCommand::StopScan => write!(f, "stopScan"),
            HelperCommand::Connect(name) => write!(f, "connect {}", name),
            HelperCommand::Disconnect(name) => write!(f, "disconnect {}", name),
            HelperCommand::SendBlob { name, data } => {
                write!(f, "sendBlob {} {}", name, STANDARD.encode(data))
            },
            HelperCommand::Quit => write!(f, "quit"),
        }
    }
}

/// 解码破折号分隔的十六进制字节串（`"01-A2-FF"`）
pub fn decode_dashed_hex(data: &str) -> Result<Vec<u8>, ProtocolError> {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split('-')
        .map(|pair| {
            let pair = pair.trim();
            if pair.len() != 2 {
                return Err(ProtocolError::InvalidHex(data.to_string()));
            }
            let mut byte = [0u8; 1];
            hex::decode_to_slice(pair, &mut byte)
                .map_err(|_| ProtocolError::InvalidHex(data.to_string()))?;
            Ok(byte[0])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_discovery() {
        let event = HelperEvent::parse_line(r#"{"packetType":"discovery","name":"FN1234","rssi":-60}"#)
            .unwrap();
        assert_eq!(
            event,
            HelperEvent::Discovery {
                name: "FN1234".to_string(),
                rssi: Some(-60)
            }
        );

        // rssi 为字符串
        let event =
            HelperEvent::parse_line(r#"{"packetType":"discovery","name":"BB01","rssi":"-71"}"#)
                .unwrap();
        assert!(matches!(event, HelperEvent::Discovery { rssi: Some(-71), .. }));

        // 缺失 rssi
        let event = HelperEvent::parse_line(r#"{"packetType":"discovery","name":"MB01"}"#).unwrap();
        assert!(matches!(event, HelperEvent::Discovery { rssi: None, .. }));
    }

    #[test]
    fn test_parse_connection() {
        let event = HelperEvent::parse_line(
            r#"{"packetType":"connection","status":"connected","peripheral":"FN1234","hasV2":"True"}"#,
        )
        .unwrap();
        match event {
            HelperEvent::Connection {
                status,
                peripheral,
                has_v2,
            } => {
                assert_eq!(status, LinkStatus::Connected);
                assert_eq!(peripheral, "FN1234");
                assert!(HelperEvent::reports_v2(has_v2.as_deref()));
            },
            other => panic!("unexpected event: {:?}", other),
        }

        let event = HelperEvent::parse_line(
            r#"{"packetType":"connection","status":"deviceDisconnected","peripheral":"BB01"}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            HelperEvent::Connection {
                status: LinkStatus::DeviceDisconnected,
                has_v2: None,
                ..
            }
        ));
        assert!(!HelperEvent::reports_v2(Some("False")));
    }

    #[test]
    fn test_parse_misc_events() {
        assert_eq!(
            HelperEvent::parse_line(r#"{"packetType":"ping"}"#).unwrap(),
            HelperEvent::Ping
        );
        assert!(matches!(
            HelperEvent::parse_line(r#"{"packetType":"ERROR","message":"boom"}"#).unwrap(),
            HelperEvent::Error { message } if message == "boom"
        ));
        assert!(matches!(
            HelperEvent::parse_line(r#"{"packetType":"bluetoothState","status":"unavailable"}"#)
                .unwrap(),
            HelperEvent::BluetoothState { status } if status == "unavailable"
        ));
        assert!(matches!(
            HelperEvent::parse_line(r#"{"packetType":"quit"}"#).unwrap(),
            HelperEvent::Quit { reason: None }
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            HelperEvent::parse_line("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(HelperEvent::parse_line(r#"{"packetType":"teleport"}"#).is_err());
    }

    #[test]
    fn test_bluetooth_state() {
        let on = BluetoothState::from_status("on");
        assert!(on.is_on() && on.is_available());
        let off = BluetoothState::from_status("off");
        assert!(!off.is_on() && off.is_available());
        let gone = BluetoothState::from_status("unavailable");
        assert!(!gone.is_on() && !gone.is_available());
    }

    #[test]
    fn test_command_lines() {
        assert_eq!(HelperCommand::StartScan.to_string(), "startScan");
        assert_eq!(HelperCommand::StopScan.to_string(), "stopScan");
        assert_eq!(
            HelperCommand::Connect("FN1234".into()).to_string(),
            "connect FN1234"
        );
        assert_eq!(
            HelperCommand::Disconnect("FN1234".into()).to_string(),
            "disconnect FN1234"
        );
        assert_eq!(
            HelperCommand::SendBlob {
                name: "FN1234".into(),
                data: vec![0x62, 0x70]
            }
            .to_string(),
            "sendBlob FN1234 YnA="
        );
        assert_eq!(HelperCommand::Quit.to_string(), "quit");
    }

    #[test]
    fn test_decode_dashed_hex() {
        assert_eq!(
            decode_dashed_hex("01-A2-ff").unwrap(),
            vec![0x01, 0xA2, 0xFF]
        );
        assert_eq!(decode_dashed_hex("").unwrap(), Vec::<u8>::new());
        assert!(decode_dashed_hex("01-A").is_err());
        assert!(decode_dashed_hex("01-ZZ").is_err());
    }
}
