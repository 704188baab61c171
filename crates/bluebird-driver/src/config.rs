//! 适配器配置
//!
//! 所有时间常量集中在这里，默认值即生产环境使用的值。

use crate::device::DEFAULT_RSSI_THRESHOLD;
use std::path::PathBuf;
use std::time::Duration;

/// 通信器配置
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    /// 连接看门狗（Dongle 与系统总线）
    pub connect_timeout: Duration,
    /// 重新上报发现结果的 RSSI 变化阈值
    pub rssi_threshold: i16,
    pub dongle: DongleConfig,
    pub bus: BusConfig,
    pub helper: HelperConfig,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            rssi_threshold: DEFAULT_RSSI_THRESHOLD,
            dongle: DongleConfig::default(),
            bus: BusConfig::default(),
            helper: HelperConfig::default(),
        }
    }
}

/// 扫描参数（单位为 0.625ms）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParameters {
    pub interval: u16,
    pub window: u16,
    pub active: bool,
}

impl Default for ScanParameters {
    fn default() -> Self {
        Self {
            interval: 500,
            window: 250,
            active: true,
        }
    }
}

/// 直连参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameters {
    /// 连接间隔下限（1.25ms）
    pub interval_min: u16,
    /// 连接间隔上限（1.25ms）
    pub interval_max: u16,
    /// 监督超时（10ms），0 表示使用控制器默认值
    pub timeout: u16,
    pub latency: u16,
    /// 0 = public, 1 = random
    pub address_type: u8,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            interval_min: 35,
            interval_max: 40,
            timeout: 0,
            latency: 100,
            address_type: 1,
        }
    }
}

/// Dongle 适配器配置
#[derive(Debug, Clone)]
pub struct DongleConfig {
    /// 串口路径，`None` 时按 USB VID/PID 查找
    pub port: Option<String>,
    pub scan: ScanParameters,
    pub connection: ConnectionParameters,
    /// 初始化握手（SystemInfo）等待时间
    pub init_timeout: Duration,
    /// 串口读超时，决定读线程响应停止请求的速度
    pub read_timeout: Duration,
    /// 启动时重置的连接句柄数量
    pub max_connections: u8,
}

impl Default for DongleConfig {
    fn default() -> Self {
        Self {
            port: None,
            scan: ScanParameters::default(),
            connection: ConnectionParameters::default(),
            init_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_millis(100),
            max_connections: 3,
        }
    }
}

/// 系统总线适配器配置
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// 扫描自动停止时间
    pub discovery_window: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            discovery_window: Duration::from_secs(8),
        }
    }
}

/// 助手进程适配器配置
#[derive(Debug, Clone)]
pub struct HelperConfig {
    /// 助手程序路径，`None` 时不尝试该后端
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    /// 单个连接请求的超时
    pub connect_timeout: Duration,
    /// 等待首个 bluetoothState 的时间
    pub startup_timeout: Duration,
    /// 发送 quit 后等待进程退出的时间
    pub shutdown_grace: Duration,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            connect_timeout: Duration::from_secs(7),
            startup_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CommunicatorConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.rssi_threshold, 20);
        assert_eq!(config.dongle.connection.interval_min, 35);
        assert_eq!(config.dongle.connection.interval_max, 40);
        assert_eq!(config.dongle.connection.latency, 100);
        assert_eq!(config.dongle.scan, ScanParameters { interval: 500, window: 250, active: true });
        assert_eq!(config.bus.discovery_window, Duration::from_secs(8));
        assert_eq!(config.helper.connect_timeout, Duration::from_secs(7));
    }
}
