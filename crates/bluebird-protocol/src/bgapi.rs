//! 串口 Dongle 二进制协议（BGAPI 帧格式）
//!
//! 帧格式：4 字节帧头 + 载荷
//!
//! ```text
//! byte0: 消息类型（0x00 命令/响应，0x80 事件）| 载荷长度高 3 位
//! byte1: 载荷长度低 8 位
//! byte2: 类别 ID（class）
//! byte3: 消息 ID
//! ```
//!
//! 主机发出的命令与设备返回的响应共用 (class, id)；事件由设备主动上报。

use crate::gatt::uuid_to_le_bytes;
use crate::{ProtocolError, read_u8, read_u16_le};
use num_enum::TryFromPrimitive;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 帧头长度
pub const HEADER_LEN: usize = 4;

/// 载荷最大长度（11 位长度字段）
pub const MAX_PAYLOAD_LEN: usize = 0x07FF;

/// 事件标志位
const EVENT_FLAG: u8 = 0x80;

/// 技术类型位（必须为 0，即 Bluetooth Smart）
const TECHNOLOGY_MASK: u8 = 0x78;

/// 连接状态标志：已连接 + 连接完成
pub const CONNECTION_FLAGS_ESTABLISHED: u8 = 0x05;

/// 连接状态标志：连接参数更新
pub const CONNECTION_FLAGS_PARAMETERS_UPDATED: u8 = 0x09;

/// 连接状态标志位：已连接
pub const CONNECTION_FLAG_CONNECTED: u8 = 0x01;

/// 消息类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageClass {
    System = 0,
    Flash = 1,
    Attributes = 2,
    Connection = 3,
    AttClient = 4,
    Sm = 5,
    Gap = 6,
    Hardware = 7,
}

// ============================================================================
// 消息 ID
// ============================================================================

pub mod ids {
    //! (class, id) 常量，命名为 `<类别>_<消息>`

    pub const SYSTEM_RESET: u8 = 0x00;
    pub const SYSTEM_GET_INFO: u8 = 0x08;

    pub const CONNECTION_DISCONNECT: u8 = 0x00;

    pub const ATTCLIENT_READ_BY_GROUP_TYPE: u8 = 0x01;
    pub const ATTCLIENT_FIND_INFORMATION: u8 = 0x03;
    pub const ATTCLIENT_READ_BY_HANDLE: u8 = 0x04;
    pub const ATTCLIENT_ATTRIBUTE_WRITE: u8 = 0x05;
    pub const ATTCLIENT_WRITE_COMMAND: u8 = 0x06;

    pub const GAP_DISCOVER: u8 = 0x02;
    pub const GAP_CONNECT_DIRECT: u8 = 0x03;
    pub const GAP_END_PROCEDURE: u8 = 0x04;
    pub const GAP_SET_SCAN_PARAMETERS: u8 = 0x07;

    // 事件
    pub const EVT_SYSTEM_BOOT: u8 = 0x00;
    pub const EVT_CONNECTION_STATUS: u8 = 0x00;
    pub const EVT_CONNECTION_DISCONNECTED: u8 = 0x04;
    pub const EVT_ATTCLIENT_PROCEDURE_COMPLETED: u8 = 0x01;
    pub const EVT_ATTCLIENT_GROUP_FOUND: u8 = 0x02;
    pub const EVT_ATTCLIENT_FIND_INFORMATION_FOUND: u8 = 0x04;
    pub const EVT_ATTCLIENT_ATTRIBUTE_VALUE: u8 = 0x05;
    pub const EVT_GAP_SCAN_RESPONSE: u8 = 0x00;
}

/// 帧头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub is_event: bool,
    pub payload_len: usize,
    pub class: u8,
    pub id: u8,
}

impl Header {
    /// 解析帧头
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }
        if bytes[0] & TECHNOLOGY_MASK != 0 {
            return Err(ProtocolError::UnknownMessageType(bytes[0]));
        }
        Ok(Self {
            is_event: bytes[0] & EVENT_FLAG != 0,
            payload_len: (((bytes[0] & 0x07) as usize) << 8) | bytes[1] as usize,
            class: bytes[2],
            id: bytes[3],
        })
    }

    /// 编码帧头
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let flag = if self.is_event { EVENT_FLAG } else { 0 };
        [
            flag | ((self.payload_len >> 8) as u8 & 0x07),
            (self.payload_len & 0xFF) as u8,
            self.class,
            self.id,
        ]
    }
}

// ============================================================================
// 蓝牙地址
// ============================================================================

/// 蓝牙设备地址（线上为小端，显示为大端 `AA:BB:CC:DD:EE:FF`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    fn read(bytes: &[u8], offset: usize) -> Result<Self, ProtocolError> {
        let raw = bytes
            .get(offset..offset + 6)
            .ok_or(ProtocolError::Truncated {
                needed: offset + 6,
                available: bytes.len(),
            })?;
        let mut addr = [0u8; 6];
        addr.copy_from_slice(raw);
        Ok(BdAddr(addr))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

impl FromStr for BdAddr {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidField {
            field: "address".to_string(),
            value: s.to_string(),
        };
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(invalid());
        }
        let mut addr = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            addr[5 - i] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(BdAddr(addr))
    }
}

// ============================================================================
// 命令（主机 -> Dongle）
// ============================================================================

/// 扫描模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiscoverMode {
    Limited = 0,
    Generic = 1,
    Observation = 2,
}

/// 主机发出的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SystemReset {
        boot_to_dfu: bool,
    },
    SystemGetInfo,
    ConnectionDisconnect {
        connection: u8,
    },
    AttReadByGroupType {
        connection: u8,
        start: u16,
        end: u16,
        group: Uuid,
    },
    AttFindInformation {
        connection: u8,
        start: u16,
        end: u16,
    },
    AttReadByHandle {
        connection: u8,
        handle: u16,
    },
    /// 带确认的写（用于 CCCD）
    AttAttributeWrite {
        connection: u8,
        handle: u16,
        data: Vec<u8>,
    },
    /// 无确认写（用于命令下发）
    AttWriteCommand {
        connection: u8,
        handle: u16,
        data: Vec<u8>,
    },
    GapDiscover {
        mode: DiscoverMode,
    },
    GapConnectDirect {
        address: BdAddr,
        address_type: u8,
        interval_min: u16,
        interval_max: u16,
        timeout: u16,
        latency: u16,
    },
    GapEndProcedure,
    GapSetScanParameters {
        interval: u16,
        window: u16,
        active: bool,
    },
}

impl Command {
    /// (class, id)
    pub fn class_id(&self) -> (MessageClass, u8) {
        use Command::*;
        match self {
            SystemReset { .. } => (MessageClass::System, ids::SYSTEM_RESET),
            SystemGetInfo => (MessageClass::System, ids::SYSTEM_GET_INFO),
            ConnectionDisconnect { .. } => (MessageClass::Connection, ids::CONNECTION_DISCONNECT),
            AttReadByGroupType { .. } => {
                (MessageClass::AttClient, ids::ATTCLIENT_READ_BY_GROUP_TYPE)
            },
            AttFindInformation { .. } => (MessageClass::AttClient, ids::ATTCLIENT_FIND_INFORMATION),
            AttReadByHandle { .. } => (MessageClass::AttClient, ids::ATTCLIENT_READ_BY_HANDLE),
            AttAttributeWrite { .. } => (MessageClass::AttClient, ids::ATTCLIENT_ATTRIBUTE_WRITE),
            AttWriteCommand { .. } => (MessageClass::AttClient, ids::ATTCLIENT_WRITE_COMMAND),
            GapDiscover { .. } => (MessageClass::Gap, ids::GAP_DISCOVER),
            GapConnectDirect { .. } => (MessageClass::Gap, ids::GAP_CONNECT_DIRECT),
            GapEndProcedure => (MessageClass::Gap, ids::GAP_END_PROCEDURE),
            GapSetScanParameters { .. } => (MessageClass::Gap, ids::GAP_SET_SCAN_PARAMETERS),
        }
    }

    /// 编码载荷（不含帧头）
    fn encode_payload(&self, buf: &mut Vec<u8>) {
        use Command::*;
        match self {
            SystemReset { boot_to_dfu } => buf.push(*boot_to_dfu as u8),
            SystemGetInfo | GapEndProcedure => {},
            ConnectionDisconnect { connection } => buf.push(*connection),
            AttReadByGroupType {
                connection,
                start,
                end,
                group,
            } => {
                buf.push(*connection);
                buf.extend_from_slice(&start.to_le_bytes());
                buf.extend_from_slice(&end.to_le_bytes());
                put_array(buf, &uuid_to_le_bytes(group));
            },
            AttFindInformation {
                connection,
                start,
                end,
            } => {
                buf.push(*connection);
                buf.extend_from_slice(&start.to_le_bytes());
                buf.extend_from_slice(&end.to_le_bytes());
            },
            AttReadByHandle { connection, handle } => {
                buf.push(*connection);
                buf.extend_from_slice(&handle.to_le_bytes());
            },
            AttAttributeWrite {
                connection,
                handle,
                data,
            }
            | AttWriteCommand {
                connection,
                handle,
                data,
            } => {
                buf.push(*connection);
                buf.extend_from_slice(&handle.to_le_bytes());
                put_array(buf, data);
            },
            GapDiscover { mode } => buf.push(*mode as u8),
            GapConnectDirect {
                address,
                address_type,
                interval_min,
                interval_max,
                timeout,
                latency,
            } => {
                buf.extend_from_slice(&address.0);
                buf.push(*address_type);
                buf.extend_from_slice(&interval_min.to_le_bytes());
                buf.extend_from_slice(&interval_max.to_le_bytes());
                buf.extend_from_slice(&timeout.to_le_bytes());
                buf.extend_from_slice(&latency.to_le_bytes());
            },
            GapSetScanParameters {
                interval,
                window,
                active,
            } => {
                buf.extend_from_slice(&interval.to_le_bytes());
                buf.extend_from_slice(&window.to_le_bytes());
                buf.push(*active as u8);
            },
        }
    }

    /// 编码完整帧
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(32);
        self.encode_payload(&mut payload);
        let (class, id) = self.class_id();
        let header = Header {
            is_event: false,
            payload_len: payload.len(),
            class: class as u8,
            id,
        };
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&payload);
        frame
    }
}

/// 写入长度前缀字节数组（uint8array）
fn put_array(buf: &mut Vec<u8>, data: &[u8]) {
    let len = data.len().min(u8::MAX as usize);
    buf.push(len as u8);
    buf.extend_from_slice(&data[..len]);
}

/// 读取长度前缀字节数组（uint8array）
fn read_array(bytes: &[u8], offset: usize) -> Result<Vec<u8>, ProtocolError> {
    let len = read_u8(bytes, offset)? as usize;
    bytes
        .get(offset + 1..offset + 1 + len)
        .map(|slice| slice.to_vec())
        .ok_or(ProtocolError::Truncated {
            needed: offset + 1 + len,
            available: bytes.len(),
        })
}

// ============================================================================
// 响应与事件（Dongle -> 主机）
// ============================================================================

/// 固件信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemInfo {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub build: u16,
    pub ll_version: u16,
    pub protocol_version: u8,
    pub hardware: u8,
}

impl SystemInfo {
    fn parse(p: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            major: read_u16_le(p, 0)?,
            minor: read_u16_le(p, 2)?,
            patch: read_u16_le(p, 4)?,
            build: read_u16_le(p, 6)?,
            ll_version: read_u16_le(p, 8)?,
            protocol_version: read_u8(p, 10)?,
            hardware: read_u8(p, 11)?,
        })
    }
}

impl fmt::Display for SystemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{} build {} (ll {}, protocol {}, hw {})",
            self.major,
            self.minor,
            self.patch,
            self.build,
            self.ll_version,
            self.protocol_version,
            self.hardware
        )
    }
}

/// 命令响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    SystemInfo(SystemInfo),
    ConnectionDisconnect { connection: u8, result: u16 },
    /// attclient 类命令的通用响应（id 区分具体命令）
    AttClient { id: u8, connection: u8, result: u16 },
    GapConnectDirect { result: u16, connection: u8 },
    /// gap 类命令的通用响应
    Gap { id: u8, result: u16 },
    Other { class: u8, id: u8 },
}

/// 设备事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SystemBoot {
        major: u16,
        minor: u16,
        patch: u16,
        build: u16,
    },
    ConnectionStatus {
        connection: u8,
        flags: u8,
        address: BdAddr,
        address_type: u8,
        interval: u16,
        timeout: u16,
        latency: u16,
        bonding: u8,
    },
    ConnectionDisconnected {
        connection: u8,
        reason: u16,
    },
    AttProcedureCompleted {
        connection: u8,
        result: u16,
        handle: u16,
    },
    AttGroupFound {
        connection: u8,
        start: u16,
        end: u16,
        uuid: Vec<u8>,
    },
    AttFindInformationFound {
        connection: u8,
        handle: u16,
        uuid: Vec<u8>,
    },
    AttAttributeValue {
        connection: u8,
        handle: u16,
        kind: u8,
        value: Vec<u8>,
    },
    GapScanResponse {
        rssi: i8,
        packet_type: u8,
        sender: BdAddr,
        address_type: u8,
        bond: u8,
        data: Vec<u8>,
    },
    Other {
        class: u8,
        id: u8,
    },
}

/// Dongle 上报的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Response(Response),
    Event(Event),
}

impl Response {
    fn parse(class: u8, id: u8, p: &[u8]) -> Result<Self, ProtocolError> {
        let response = match MessageClass::try_from(class) {
            Ok(MessageClass::System) if id == ids::SYSTEM_GET_INFO => {
                Response::SystemInfo(SystemInfo::parse(p)?)
            },
            Ok(MessageClass::Connection) if id == ids::CONNECTION_DISCONNECT => {
                Response::ConnectionDisconnect {
                    connection: read_u8(p, 0)?,
                    result: read_u16_le(p, 1)?,
                }
            },
            Ok(MessageClass::AttClient) => Response::AttClient {
                id,
                connection: read_u8(p, 0)?,
                result: read_u16_le(p, 1)?,
            },
            Ok(MessageClass::Gap) if id == ids::GAP_CONNECT_DIRECT => Response::GapConnectDirect {
                result: read_u16_le(p, 0)?,
                connection: read_u8(p, 2)?,
            },
            Ok(MessageClass::Gap) => Response::Gap {
                id,
                result: read_u16_le(p, 0)?,
            },
            _ => Response::Other { class, id },
        };
        Ok(response)
    }
}

impl Event {
    fn parse(class: u8, id: u8, p: &[u8]) -> Result<Self, ProtocolError> {
        use MessageClass as C;
        let event = match (MessageClass::try_from(class), id) {
            (Ok(C::System), ids::EVT_SYSTEM_BOOT) => Event::SystemBoot {
                major: read_u16_le(p, 0)?,
                minor: read_u16_le(p, 2)?,
                patch: read_u16_le(p, 4)?,
                build: read_u16_le(p, 6)?,
            },
            (Ok(C::Connection), ids::EVT_CONNECTION_STATUS) => Event::ConnectionStatus {
                connection: read_u8(p, 0)?,
                flags: read_u8(p, 1)?,
                address: BdAddr::read(p, 2)?,
                address_type: read_u8(p, 8)?,
                interval: read_u16_le(p, 9)?,
                timeout: read_u16_le(p, 11)?,
                latency: read_u16_le(p, 13)?,
                bonding: read_u8(p, 15)?,
            },
            (Ok(C::Connection), ids::EVT_CONNECTION_DISCONNECTED) => {
                Event::ConnectionDisconnected {
                    connection: read_u8(p, 0)?,
                    reason: read_u16_le(p, 1)?,
                }
            },
            (Ok(C::AttClient), ids::EVT_ATTCLIENT_PROCEDURE_COMPLETED) => {
                Event::AttProcedureCompleted {
                    connection: read_u8(p, 0)?,
                    result: read_u16_le(p, 1)?,
                    handle: read_u16_le(p, 3)?,
                }
            },
            (Ok(C::AttClient), ids::EVT_ATTCLIENT_GROUP_FOUND) => Event::AttGroupFound {
                connection: read_u8(p, 0)?,
                start: read_u16_le(p, 1)?,
                end: read_u16_le(p, 3)?,
                uuid: read_array(p, 5)?,
            },
            (Ok(C::AttClient), ids::EVT_ATTCLIENT_FIND_INFORMATION_FOUND) => {
                Event::AttFindInformationFound {
                    connection: read_u8(p, 0)?,
                    handle: read_u16_le(p, 1)?,
                    uuid: read_array(p, 3)?,
                }
            },
            (Ok(C::AttClient), ids::EVT_ATTCLIENT_ATTRIBUTE_VALUE) => Event::AttAttributeValue {
                connection: read_u8(p, 0)?,
                handle: read_u16_le(p, 1)?,
                kind: read_u8(p, 3)?,
                value: read_array(p, 4)?,
            },
            (Ok(C::Gap), ids::EVT_GAP_SCAN_RESPONSE) => Event::GapScanResponse {
                rssi: read_u8(p, 0)? as i8,
                packet_type: read_u8(p, 1)?,
                sender: BdAddr::read(p, 2)?,
                address_type: read_u8(p, 8)?,
                bond: read_u8(p, 9)?,
                data: read_array(p, 10)?,
            },
            _ => Event::Other { class, id },
        };
        Ok(event)
    }
}

impl Message {
    /// 解析一个完整帧，返回消息和消耗的字节数
    ///
    /// 缓冲区不足一帧时返回 `Truncated`。
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let header = Header::parse(bytes)?;
        let total = HEADER_LEN + header.payload_len;
        if bytes.len() < total {
            return Err(ProtocolError::Truncated {
                needed: total,
                available: bytes.len(),
            });
        }
        let payload = &bytes[HEADER_LEN..total];
        let message = if header.is_event {
            Message::Event(Event::parse(header.class, header.id, payload)?)
        } else {
            Message::Response(Response::parse(header.class, header.id, payload)?)
        };
        Ok((message, total))
    }
}

// ============================================================================
// 流式解帧
// ============================================================================

/// 串口字节流解帧器
///
/// 串口读取不保证帧边界，`push` 追加原始字节后反复调用 `next_message` 取出完整帧。
/// 帧头非法时丢弃一个字节重新同步。
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加原始字节
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// 缓冲区中未消费的字节数
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// 取出下一个完整消息
    ///
    /// - `None`: 数据不足一帧
    /// - `Some(Err)`: 帧损坏（已跳过损坏部分）
    pub fn next_message(&mut self) -> Option<Result<Message, ProtocolError>> {
        if self.buffer.len() < HEADER_LEN {
            return None;
        }
        let header = match Header::parse(&self.buffer) {
            Ok(header) => header,
            Err(e) => {
                self.buffer.remove(0);
                return Some(Err(e));
            },
        };
        let total = HEADER_LEN + header.payload_len;
        if self.buffer.len() < total {
            return None;
        }
        let result = Message::decode(&self.buffer[..total]).map(|(message, _)| message);
        self.buffer.drain(..total);
        Some(result)
    }
}

// ============================================================================
// 广播数据（AD structures）
// ============================================================================

/// AD 类型：不完整本地名称
const AD_SHORTENED_LOCAL_NAME: u8 = 0x08;
/// AD 类型：完整本地名称
const AD_COMPLETE_LOCAL_NAME: u8 = 0x09;

/// 从广播数据中提取本地名称（优先完整名称）
pub fn advertised_name(data: &[u8]) -> Option<String> {
    let mut shortened = None;
    let mut offset = 0;
    while offset < data.len() {
        let len = data[offset] as usize;
        if len == 0 || offset + 1 + len > data.len() {
            break;
        }
        let ad_type = data[offset + 1];
        let value = &data[offset + 2..offset + 1 + len];
        match ad_type {
            AD_COMPLETE_LOCAL_NAME => {
                return Some(String::from_utf8_lossy(value).trim().to_string());
            },
            AD_SHORTENED_LOCAL_NAME => {
                shortened = Some(String::from_utf8_lossy(value).trim().to_string());
            },
            _ => {},
        }
        offset += 1 + len;
    }
    shortened
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{PRIMARY_SERVICE_UUID16, uuid_from_u16};

    #[test]
    fn test_header_parse() {
        let header = Header::parse(&[0x80, 0x10, 0x03, 0x00]).unwrap();
        assert!(header.is_event);
        assert_eq!(header.payload_len, 16);
        assert_eq!(header.class, 3);
        assert_eq!(header.id, 0);

        // 长度高 3 位
        let header = Header::parse(&[0x01, 0x02, 0x04, 0x05]).unwrap();
        assert!(!header.is_event);
        assert_eq!(header.payload_len, 0x102);

        assert!(matches!(
            Header::parse(&[0x08, 0x00, 0x00, 0x00]),
            Err(ProtocolError::UnknownMessageType(0x08))
        ));
    }

    #[test]
    fn test_encode_set_scan_parameters() {
        let cmd = Command::GapSetScanParameters {
            interval: 500,
            window: 250,
            active: true,
        };
        assert_eq!(
            cmd.encode(),
            vec![0x00, 0x05, 0x06, 0x07, 0xF4, 0x01, 0xFA, 0x00, 0x01]
        );
    }

    #[test]
    fn test_encode_connect_direct() {
        let cmd = Command::GapConnectDirect {
            address: "00:07:80:AA:BB:CC".parse().unwrap(),
            address_type: 1,
            interval_min: 35,
            interval_max: 40,
            timeout: 0,
            latency: 100,
        };
        let frame = cmd.encode();
        assert_eq!(&frame[..4], &[0x00, 0x0F, 0x06, 0x03]);
        // 地址按小端写入
        assert_eq!(&frame[4..10], &[0xCC, 0xBB, 0xAA, 0x80, 0x07, 0x00]);
        assert_eq!(frame[10], 1);
        assert_eq!(&frame[11..19], &[35, 0, 40, 0, 0, 0, 100, 0]);
    }

    #[test]
    fn test_encode_read_by_group_type() {
        let cmd = Command::AttReadByGroupType {
            connection: 2,
            start: 0x0001,
            end: 0xFFFF,
            group: uuid_from_u16(PRIMARY_SERVICE_UUID16),
        };
        assert_eq!(
            cmd.encode(),
            vec![0x00, 0x08, 0x04, 0x01, 0x02, 0x01, 0x00, 0xFF, 0xFF, 0x02, 0x00, 0x28]
        );
    }

    #[test]
    fn test_encode_write_command() {
        let cmd = Command::AttWriteCommand {
            connection: 0,
            handle: 0x0010,
            data: vec![0x62, 0x70],
        };
        assert_eq!(
            cmd.encode(),
            vec![0x00, 0x06, 0x04, 0x06, 0x00, 0x10, 0x00, 0x02, 0x62, 0x70]
        );
        assert_eq!(Command::SystemGetInfo.encode(), vec![0x00, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn test_decode_connection_status() {
        let frame = [
            0x80, 0x10, 0x03, 0x00, // header
            0x01, 0x05, // connection, flags
            0xCC, 0xBB, 0xAA, 0x80, 0x07, 0x00, // address
            0x01, // address type
            0x28, 0x00, 0x00, 0x00, 0x64, 0x00, // interval, timeout, latency
            0xFF, // bonding
        ];
        let (message, used) = Message::decode(&frame).unwrap();
        assert_eq!(used, frame.len());
        match message {
            Message::Event(Event::ConnectionStatus {
                connection,
                flags,
                address,
                latency,
                ..
            }) => {
                assert_eq!(connection, 1);
                assert_eq!(flags, CONNECTION_FLAGS_ESTABLISHED);
                assert_eq!(address.to_string(), "00:07:80:AA:BB:CC");
                assert_eq!(latency, 100);
            },
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_scan_response() {
        let mut frame = vec![0x80, 0x00, 0x06, 0x00];
        let ad = [0x07, 0x09, b'F', b'N', b'1', b'2', b'3', b'4'];
        let mut payload = vec![(-60i8) as u8, 0x00, 1, 2, 3, 4, 5, 6, 0x01, 0xFF];
        payload.push(ad.len() as u8);
        payload.extend_from_slice(&ad);
        frame[1] = payload.len() as u8;
        frame.extend_from_slice(&payload);

        let (message, _) = Message::decode(&frame).unwrap();
        match message {
            Message::Event(Event::GapScanResponse { rssi, data, .. }) => {
                assert_eq!(rssi, -60);
                assert_eq!(advertised_name(&data).as_deref(), Some("FN1234"));
            },
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_responses() {
        let (message, _) = Message::decode(&[0x00, 0x03, 0x06, 0x03, 0x00, 0x00, 0x02]).unwrap();
        assert_eq!(
            message,
            Message::Response(Response::GapConnectDirect {
                result: 0,
                connection: 2
            })
        );

        let (message, _) =
            Message::decode(&[0x00, 0x03, 0x04, 0x03, 0x01, 0x81, 0x01]).unwrap();
        assert_eq!(
            message,
            Message::Response(Response::AttClient {
                id: ids::ATTCLIENT_FIND_INFORMATION,
                connection: 1,
                result: 0x0181
            })
        );

        let info = [
            0x00, 0x0C, 0x00, 0x08, 1, 0, 4, 0, 2, 0, 0x7B, 0, 3, 0, 1, 1,
        ];
        let (message, _) = Message::decode(&info).unwrap();
        match message {
            Message::Response(Response::SystemInfo(info)) => {
                assert_eq!((info.major, info.minor, info.patch), (1, 4, 2));
                assert_eq!(info.build, 123);
            },
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_truncated_payload() {
        // 长度字段声明 3 字节但只给 1 字节
        let err = Message::decode(&[0x80, 0x03, 0x03, 0x04, 0x01]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn test_frame_decoder_split_reads() {
        let frame = [0x80, 0x03, 0x03, 0x04, 0x01, 0x13, 0x02];
        let mut decoder = FrameDecoder::new();

        decoder.push(&frame[..2]);
        assert!(decoder.next_message().is_none());
        decoder.push(&frame[2..]);
        decoder.push(&frame[..3]);

        let message = decoder.next_message().unwrap().unwrap();
        assert_eq!(
            message,
            Message::Event(Event::ConnectionDisconnected {
                connection: 1,
                reason: 0x0213
            })
        );
        assert!(decoder.next_message().is_none());
        assert_eq!(decoder.pending(), 3);
    }

    #[test]
    fn test_frame_decoder_resync() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0x7F, 0x00, 0x02, 0x06, 0x04, 0x00, 0x00]);
        assert!(decoder.next_message().unwrap().is_err());
        // 跳过坏字节后剩下一帧 gap_end_procedure 响应
        let message = decoder.next_message().unwrap().unwrap();
        assert_eq!(
            message,
            Message::Response(Response::Gap {
                id: ids::GAP_END_PROCEDURE,
                result: 0
            })
        );
    }

    #[test]
    fn test_advertised_name_prefers_complete() {
        let data = [
            0x02, 0x01, 0x06, // flags
            0x03, 0x08, b'F', b'N', // shortened
            0x05, 0x09, b'F', b'N', b'4', b'2', // complete
        ];
        assert_eq!(advertised_name(&data).as_deref(), Some("FN42"));
        assert_eq!(advertised_name(&[0x02, 0x01, 0x06]), None);
        assert_eq!(advertised_name(&[0x05, 0x09, b'x']), None);
    }

    #[test]
    fn test_bdaddr_parse_and_display() {
        let addr: BdAddr = "E1:02:03:04:05:F6".parse().unwrap();
        assert_eq!(addr.0, [0xF6, 0x05, 0x04, 0x03, 0x02, 0xE1]);
        assert_eq!(addr.to_string(), "E1:02:03:04:05:F6");
        assert!("E1:02".parse::<BdAddr>().is_err());
        assert!("zz:02:03:04:05:06".parse::<BdAddr>().is_err());
    }
}
