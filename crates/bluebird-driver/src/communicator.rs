//! 通信器接口
//!
//! 三种后端实现同一个 [`Communicator`] trait。所有操作都是"发出即返回"：
//! 调用方线程只投递工作，结果通过 [`CommunicatorEvents`] 异步上报。

use bluebird_protocol::HardwareVersion;
use std::fmt;
use std::str::FromStr;

/// 后端种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// 串口 BLE Dongle
    Dongle,
    /// 操作系统蓝牙服务
    SystemBus,
    /// 外部助手进程
    Helper,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Dongle => "dongle",
            Backend::SystemBus => "system-bus",
            Backend::Helper => "helper",
        })
    }
}

/// 上报给上层的发现结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub name: String,
    /// 稳定键（地址或对象路径）
    pub key: String,
    pub rssi: i16,
    /// 原始广播数据（后端不提供时为空）
    pub raw: Vec<u8>,
}

/// 适配器事件接收方
pub trait CommunicatorEvents: Send + Sync {
    fn scan_status_changed(&self, scanning: bool);

    fn device_discovered(&self, device: &DiscoveredDevice);

    fn device_connected(&self, name: &str, version: HardwareVersion);

    fn device_disconnected(&self, name: &str, user_initiated: bool);

    fn notification(&self, name: &str, data: &[u8]);

    /// 传输层健康状态
    ///
    /// `has_transport == false` 表示整个适配器需要被替换。
    fn status_changed(&self, has_transport: bool, healthy: bool);
}

/// 通信器接口
pub trait Communicator: Send + Sync {
    fn backend(&self) -> Backend;

    /// 开始扫描（重复调用刷新扫描并重新上报已知设备）
    fn start_discovery(&self);

    fn stop_discovery(&self);

    /// 连接一个空闲的已知设备
    fn request_connection(&self, name: &str);

    /// 从任意非 IDLE 状态断开
    fn request_disconnect(&self, name: &str);

    /// 发送命令字节（仅 CONNECTED 设备，否则丢弃）
    fn send_command(&self, name: &str, data: &[u8]);

    /// 中止进行中的扫描或连接过程
    fn cancel_connection_request(&self);

    /// 停止工作线程、强制断开所有设备并释放传输层（幂等）
    fn kill(&self);

    fn is_running(&self) -> bool;
}

/// 断开原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// 显式请求
    User,
    /// 连接看门狗超时
    Watchdog,
    /// GATT 操作返回非零结果码
    ProtocolError(u16),
    /// 连接请求失败
    ConnectFailed,
    /// 连接过程被取消
    Cancelled,
    /// 链路意外断开
    LinkLost,
    /// 设备被平台移除
    Removed,
}

impl DisconnectReason {
    /// 断开事件的 `user_initiated` 标志
    ///
    /// 只有 CONNECTED 状态下的链路丢失才视为非用户发起。
    pub fn user_initiated(self, prior: crate::device::DeviceState) -> bool {
        match self {
            DisconnectReason::LinkLost => prior != crate::device::DeviceState::Connected,
            _ => true,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::User => write!(f, "user request"),
            DisconnectReason::Watchdog => write!(f, "watchdog timeout"),
            DisconnectReason::ProtocolError(code) => write!(f, "protocol error 0x{:04X}", code),
            DisconnectReason::ConnectFailed => write!(f, "connect failed"),
            DisconnectReason::Cancelled => write!(f, "cancelled"),
            DisconnectReason::LinkLost => write!(f, "link lost"),
            DisconnectReason::Removed => write!(f, "device removed"),
        }
    }
}

/// 后端选择偏好
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPreference {
    /// 按 Dongle -> 系统总线 -> 助手进程 顺序探测
    #[default]
    Auto,
    Dongle,
    SystemBus,
    Helper,
}

impl FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "dongle" => Ok(BackendPreference::Dongle),
            "system-bus" | "systembus" | "bus" => Ok(BackendPreference::SystemBus),
            "helper" => Ok(BackendPreference::Helper),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendPreference::Auto => "auto",
            BackendPreference::Dongle => "dongle",
            BackendPreference::SystemBus => "system-bus",
            BackendPreference::Helper => "helper",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceState;

    #[test]
    fn test_user_initiated_mapping() {
        assert!(DisconnectReason::User.user_initiated(DeviceState::Connected));
        assert!(DisconnectReason::Watchdog.user_initiated(DeviceState::ConnectingBegin));
        assert!(DisconnectReason::ProtocolError(0x0401).user_initiated(DeviceState::Connected));
        assert!(DisconnectReason::Removed.user_initiated(DeviceState::Connected));
        assert!(!DisconnectReason::LinkLost.user_initiated(DeviceState::Connected));
        assert!(DisconnectReason::LinkLost.user_initiated(DeviceState::ConnectingGetVersion));
    }

    #[test]
    fn test_backend_preference_parse() {
        assert_eq!("auto".parse::<BackendPreference>(), Ok(BackendPreference::Auto));
        assert_eq!("System-Bus".parse::<BackendPreference>(), Ok(BackendPreference::SystemBus));
        assert_eq!("helper".parse::<BackendPreference>(), Ok(BackendPreference::Helper));
        assert!("usb".parse::<BackendPreference>().is_err());
        assert_eq!(BackendPreference::SystemBus.to_string(), "system-bus");
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(
            DisconnectReason::ProtocolError(0x0181).to_string(),
            "protocol error 0x0181"
        );
    }
}
