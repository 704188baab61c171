//! 驱动层错误类型定义

use crate::device::DeviceState;
use bluebird_protocol::ProtocolError;
use bluebird_transport::TransportError;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 传输层错误
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// 协议解析错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 设备表中没有该名称
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// 设备当前状态不允许该操作
    #[error("Device {name} is busy ({state:?})")]
    DeviceBusy { name: String, state: DeviceState },

    /// 设备未连接或写通道未解析
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// 工作队列已关闭（适配器已 kill）
    #[error("Work queue closed")]
    ChannelClosed,

    /// 操作超时
    #[error("Operation timeout")]
    Timeout,

    /// 没有可用的传输后端
    #[error("No transport available")]
    NoTransport,

    /// 工作线程错误
    #[error("IO thread error: {0}")]
    IoThread(String),

    /// 无效输入
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::Transport(TransportError::Timeout);
        assert!(format!("{}", err).contains("Read timeout"));

        let err = DriverError::Protocol(ProtocolError::InvalidLength {
            expected: 4,
            actual: 2,
        });
        let msg = format!("{}", err);
        assert!(msg.contains("Invalid packet length"), "{}", msg);

        let err = DriverError::DeviceBusy {
            name: "FN1234".to_string(),
            state: DeviceState::ConnectingBegin,
        };
        assert_eq!(format!("{}", err), "Device FN1234 is busy (ConnectingBegin)");

        assert_eq!(
            format!("{}", DriverError::DeviceNotFound("BB01".into())),
            "Device not found: BB01"
        );
        assert_eq!(format!("{}", DriverError::ChannelClosed), "Work queue closed");
    }

    #[test]
    fn test_error_conversion() {
        let transport = TransportError::Closed;
        let err: DriverError = transport.into();
        assert!(matches!(err, DriverError::Transport(TransportError::Closed)));

        let err: DriverError = ProtocolError::UnknownMessageType(0x42).into();
        assert!(matches!(err, DriverError::Protocol(_)));
    }
}
