//! 系统蓝牙服务（异步消息总线）抽象
//!
//! 对象以路径标识（如 `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`），
//! 特征值路径是设备路径的子路径。总线信号在传输层自己的线程上触发，
//! 处理函数只能转发，不能持有设备表。

use crate::TransportError;
use std::sync::Arc;
use uuid::Uuid;

/// 设备属性（信号中未出现的字段为 `None`）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceProperties {
    pub name: Option<String>,
    pub address: Option<String>,
    pub rssi: Option<i16>,
    pub connected: Option<bool>,
    /// 广播中的服务 UUID 列表
    pub service_uuids: Vec<Uuid>,
}

/// 托管对象枚举结果
#[derive(Debug, Clone, PartialEq)]
pub enum BusObject {
    Adapter {
        path: String,
    },
    Device {
        path: String,
        properties: DeviceProperties,
    },
    Characteristic {
        path: String,
        device_path: String,
        uuid: Uuid,
    },
}

/// 总线信号
#[derive(Debug, Clone, PartialEq)]
pub enum BusSignal {
    /// 新设备对象出现
    DeviceAppeared {
        path: String,
        properties: DeviceProperties,
    },
    /// 设备下出现 GATT 特征值对象
    CharacteristicAppeared {
        path: String,
        device_path: String,
        uuid: Uuid,
    },
    /// 设备属性变化（RSSI、连接状态等）
    DevicePropertiesChanged {
        path: String,
        properties: DeviceProperties,
    },
    /// 特征值通知
    ValueChanged { path: String, value: Vec<u8> },
    /// 设备对象消失（设备被系统移除）
    DeviceVanished { path: String },
}

impl BusSignal {
    /// 信号关联的对象路径
    pub fn path(&self) -> &str {
        match self {
            BusSignal::DeviceAppeared { path, .. }
            | BusSignal::CharacteristicAppeared { path, .. }
            | BusSignal::DevicePropertiesChanged { path, .. }
            | BusSignal::ValueChanged { path, .. }
            | BusSignal::DeviceVanished { path } => path,
        }
    }
}

/// 信号处理函数
pub type SignalHandler = Arc<dyn Fn(BusSignal) + Send + Sync>;

/// 系统蓝牙服务接口
///
/// 所有方法都可能阻塞（例如 `connect` 会等待链路建立），只应在适配器工作线程上调用。
pub trait SystemBus: Send + Sync {
    /// 列出可用的无线电适配器路径
    fn adapters(&self) -> Result<Vec<String>, TransportError>;

    fn start_discovery(&self, adapter: &str) -> Result<(), TransportError>;

    fn stop_discovery(&self, adapter: &str) -> Result<(), TransportError>;

    /// 枚举总线上所有已知对象
    fn managed_objects(&self) -> Result<Vec<BusObject>, TransportError>;

    /// 设备对象是否仍然存在
    fn device_exists(&self, device: &str) -> Result<bool, TransportError>;

    fn connect(&self, device: &str) -> Result<(), TransportError>;

    fn disconnect(&self, device: &str) -> Result<(), TransportError>;

    fn start_notify(&self, characteristic: &str) -> Result<(), TransportError>;

    fn stop_notify(&self, characteristic: &str) -> Result<(), TransportError>;

    fn write_value(&self, characteristic: &str, value: &[u8]) -> Result<(), TransportError>;

    /// 安装信号处理函数（替换已有的）
    fn set_signal_handler(&self, handler: SignalHandler);

    /// 释放总线连接，之后不再触发任何信号
    fn shutdown(&self) {}
}

/// `child` 是否为 `parent` 的子路径
pub fn is_child_path(parent: &str, child: &str) -> bool {
    child.len() > parent.len()
        && child.starts_with(parent)
        && child.as_bytes()[parent.len()] == b'/'
}
