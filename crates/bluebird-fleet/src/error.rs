//! 编排层错误类型定义

use bluebird_driver::DriverError;
use std::path::PathBuf;
use thiserror::Error;

/// 配置文件错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// 编排层错误类型
#[derive(Error, Debug)]
pub enum FleetError {
    /// 当前没有运行中的通信器
    #[error("No communicator running")]
    NoCommunicator,

    /// 三个槽位都已占用
    #[error("No free slot")]
    NoFreeSlot,

    /// 设备已绑定在某个活动槽位上
    #[error("Device {name} already bound to slot {slot}")]
    AlreadyBound { name: String, slot: char },

    #[error("Unknown slot: {0}")]
    UnknownSlot(char),

    #[error("Slot {0} is not connected")]
    SlotNotConnected(char),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}
