//! # BlueBird Transport Layer
//!
//! 传输层抽象，为三种后端提供统一的原始链路接口：
//!
//! - `dongle`: 串口 BLE Dongle（BGAPI 二进制协议）
//! - `bus`: 操作系统蓝牙服务（异步系统总线信号）
//! - `helper`: 外部助手进程（标准输入输出行协议）
//!
//! 本层只负责字节/消息的收发，不维护设备状态；状态机在 `bluebird-driver` 中。

use thiserror::Error;

pub use bluebird_protocol::ProtocolError;

pub mod bus;
pub mod dongle;
pub mod helper;

#[cfg(all(feature = "bluez", target_os = "linux"))]
pub mod bluez;

#[cfg(feature = "mock")]
pub mod mock;

pub use bus::{BusObject, BusSignal, DeviceProperties, SignalHandler, SystemBus};
pub use dongle::{DongleLink, DongleRx, DongleTx};
pub use helper::{HelperChannel, LineSink, LineSource, ProcessControl};

#[cfg(feature = "serial")]
pub use dongle::serial::{SerialDongle, SerialDongleRx, SerialDongleTx};

pub use helper::HelperProcess;

/// 传输层统一错误类型
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(#[from] TransportDeviceError),
    #[error("Protocol Error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Read timeout")]
    Timeout,
    #[error("Transport closed")]
    Closed,
    #[error("Transport not started")]
    NotStarted,
}

impl TransportError {
    /// 是否意味着整条链路已不可用（需要重建适配器）
    pub fn is_link_fatal(&self) -> bool {
        match self {
            TransportError::Io(_) | TransportError::Closed => true,
            TransportError::Device(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// 设备/后端错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDeviceErrorKind {
    Unknown,
    NotFound,
    NoAdapter,
    AccessDenied,
    Busy,
    InvalidResponse,
    Backend,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct TransportDeviceError {
    pub kind: TransportDeviceErrorKind,
    pub message: String,
}

impl TransportDeviceError {
    pub fn new(kind: TransportDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            TransportDeviceErrorKind::NoAdapter
                | TransportDeviceErrorKind::AccessDenied
                | TransportDeviceErrorKind::NotFound
        )
    }
}

impl From<String> for TransportDeviceError {
    fn from(message: String) -> Self {
        Self::new(TransportDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for TransportDeviceError {
    fn from(message: &str) -> Self {
        Self::new(TransportDeviceErrorKind::Unknown, message)
    }
}
