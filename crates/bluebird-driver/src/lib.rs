//! 驱动层
//!
//! 本 crate 提供 BlueBird 机器人的连接核心，包括：
//! - 适配器运行时（单工作线程 + 定时器线程）
//! - 设备表与连接状态机（IDLE -> CONNECTING_* -> CONNECTED -> DISCONNECTING -> IDLE）
//! - 三种后端：串口 Dongle、系统总线、助手进程
//! - 后端选择（[`CommunicatorBuilder`]）
//!
//! # 线程模型
//!
//! 每个适配器只有一个线程能读写它的设备表。公共接口、读线程、总线信号回调
//! 和定时器都只向工作队列投递工作，结果通过 [`CommunicatorEvents`] 上报。

mod builder;
pub mod communicator;
pub mod config;
pub mod device;
pub mod dongle;
mod error;
pub mod helper;
pub mod runtime;
pub mod session;
pub mod system_bus;

pub use builder::CommunicatorBuilder;
pub use communicator::{
    Backend, BackendPreference, Communicator, CommunicatorEvents, DisconnectReason, DiscoveredDevice,
};
pub use config::{BusConfig, CommunicatorConfig, ConnectionParameters, DongleConfig, HelperConfig, ScanParameters};
pub use device::{ChannelId, ChannelKind, DeviceRecord, DeviceRegistry, DeviceState};
pub use dongle::DongleCommunicator;
pub use error::DriverError;
pub use helper::HelperCommunicator;
pub use system_bus::SystemBusCommunicator;

pub use bluebird_protocol::HardwareVersion;
