//! # BlueBird Protocol
//!
//! BlueBird 机器人通信协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `gatt`: 厂商 GATT 服务/特征 UUID 常量
//! - `session`: 设备家族、版本探测与轮询命令字节
//! - `bgapi`: 串口 Dongle 二进制协议（请求/响应/事件帧）
//! - `helper`: 助手进程行协议（JSON 事件 + 文本命令）
//!
//! ## 字节序
//!
//! BGAPI 协议中的多字节整数使用小端字节序，蓝牙地址与 128 位 UUID 同样按小端传输。

pub mod bgapi;
pub mod gatt;
pub mod helper;
pub mod session;

pub use gatt::*;
pub use helper::{BluetoothState, HelperCommand, HelperEvent, LinkStatus};
pub use session::*;

use thiserror::Error;

/// 协议层错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Truncated packet: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid hex payload: {0}")]
    InvalidHex(String),

    #[error("Invalid JSON line: {0}")]
    InvalidJson(String),

    #[error("Invalid value for field {field}: {value}")]
    InvalidField { field: String, value: String },
}

/// 小端字节序读取 u16
pub fn read_u16_le(bytes: &[u8], offset: usize) -> Result<u16, ProtocolError> {
    match bytes.get(offset..offset + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(ProtocolError::Truncated {
            needed: offset + 2,
            available: bytes.len(),
        }),
    }
}

/// 读取单字节
pub fn read_u8(bytes: &[u8], offset: usize) -> Result<u8, ProtocolError> {
    bytes.get(offset).copied().ok_or(ProtocolError::Truncated {
        needed: offset + 1,
        available: bytes.len(),
    })
}
