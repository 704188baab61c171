//! 会话建立相关的命令字节
//!
//! 核心层不解析传感器数据，只需识别两类载荷：
//! 连接建立阶段的版本响应，以及之后的其他所有通知。

use std::fmt;

/// 设备家族（由广播名称的 2 字母前缀决定）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RobotFamily {
    /// Finch（前缀 "FN"）
    Finch,
    /// Hummingbird（前缀 "BB"）
    Hummingbird,
    /// micro:bit（前缀 "MB"）
    Microbit,
}

impl RobotFamily {
    /// 所有可识别的家族
    pub const ALL: [RobotFamily; 3] = [
        RobotFamily::Finch,
        RobotFamily::Hummingbird,
        RobotFamily::Microbit,
    ];

    /// 名称前缀
    pub fn prefix(self) -> &'static str {
        match self {
            RobotFamily::Finch => "FN",
            RobotFamily::Hummingbird => "BB",
            RobotFamily::Microbit => "MB",
        }
    }

    /// 根据设备名称识别家族，未知前缀返回 `None`
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|family| name.starts_with(family.prefix()))
    }

    /// 版本探测命令
    ///
    /// Finch 使用 0xD4，其余家族使用 0xCF。
    pub fn version_probe(self) -> &'static [u8] {
        match self {
            RobotFamily::Finch => &VERSION_PROBE_FINCH,
            _ => &VERSION_PROBE,
        }
    }
}

/// 是否为可识别的设备名称
pub fn is_supported_name(name: &str) -> bool {
    RobotFamily::from_name(name).is_some()
}

/// 版本探测命令（BB / MB）
pub const VERSION_PROBE: [u8; 1] = [0xCF];

/// 版本探测命令（FN）
pub const VERSION_PROBE_FINCH: [u8; 1] = [0xD4];

/// 开始轮询（V1 固件）
pub const POLL_START_V1: [u8; 2] = [0x62, 0x67];

/// 开始轮询（V2 固件）
pub const POLL_START_V2: [u8; 2] = [0x62, 0x70];

/// 停止轮询
pub const POLL_STOP: [u8; 2] = [0x62, 0x73];

/// 版本响应的最大长度（不含）
pub const VERSION_RESPONSE_MAX_LEN: usize = 10;

/// 传感器通知的最小长度（不含）
pub const SENSOR_PAYLOAD_MIN_LEN: usize = 10;

/// V2 固件在版本响应第 4 字节上的标记
const V2_MARKER: u8 = 0x22;

/// 硬件/固件版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareVersion {
    V1,
    V2,
}

impl HardwareVersion {
    /// 从版本响应载荷解析
    ///
    /// 载荷非空且短于 10 字节时视为版本响应；第 4 字节为 0x22 表示 V2，否则为 V1。
    pub fn from_response(payload: &[u8]) -> Option<Self> {
        if !is_version_response(payload) {
            return None;
        }
        if payload.len() > 3 && payload[3] == V2_MARKER {
            Some(HardwareVersion::V2)
        } else {
            Some(HardwareVersion::V1)
        }
    }

    /// 数值形式（1 或 2）
    pub fn as_number(self) -> u8 {
        match self {
            HardwareVersion::V1 => 1,
            HardwareVersion::V2 => 2,
        }
    }

    pub fn is_v2(self) -> bool {
        self == HardwareVersion::V2
    }

    /// 对应版本的开始轮询命令
    pub fn poll_start(self) -> &'static [u8] {
        match self {
            HardwareVersion::V1 => &POLL_START_V1,
            HardwareVersion::V2 => &POLL_START_V2,
        }
    }
}

impl fmt::Display for HardwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_number())
    }
}

/// 载荷长度是否符合版本响应
pub fn is_version_response(payload: &[u8]) -> bool {
    !payload.is_empty() && payload.len() < VERSION_RESPONSE_MAX_LEN
}

/// 载荷长度是否符合传感器数据
pub fn is_sensor_payload(payload: &[u8]) -> bool {
    payload.len() > SENSOR_PAYLOAD_MIN_LEN
}
