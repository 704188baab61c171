//! 设备记录与设备表
//!
//! 设备表只由适配器工作线程访问，因此这里不做任何同步。

use crate::communicator::Backend;
use crate::runtime::TimerHandle;
use bluebird_protocol::HardwareVersion;
use std::collections::HashMap;
use std::fmt;

/// 默认 RSSI 重新上报阈值
pub const DEFAULT_RSSI_THRESHOLD: i16 = 20;

/// 设备连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Idle,
    ConnectingBegin,
    ConnectingDiscoverServices,
    ConnectingGetVersion,
    Connected,
    Disconnecting,
    /// 终态：平台报告设备已消失
    Removed,
}

impl DeviceState {
    /// 是否处于连接建立过程中
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            DeviceState::ConnectingBegin
                | DeviceState::ConnectingDiscoverServices
                | DeviceState::ConnectingGetVersion
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Idle => "IDLE",
            DeviceState::ConnectingBegin => "CONNECTING_BEGIN",
            DeviceState::ConnectingDiscoverServices => "CONNECTING_DISCOVER_SERVICES",
            DeviceState::ConnectingGetVersion => "CONNECTING_GET_VERSION",
            DeviceState::Connected => "CONNECTED",
            DeviceState::Disconnecting => "DISCONNECTING",
            DeviceState::Removed => "REMOVED",
        };
        f.write_str(s)
    }
}

/// 写/通知通道标识
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelId {
    /// Dongle 属性句柄
    Handle(u16),
    /// 系统总线特征值对象路径
    Path(String),
    /// 由助手进程管理
    Delegated,
}

/// 通道种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Write,
    Notify,
}

/// 正在计时的连接看门狗
#[derive(Debug)]
pub struct Watchdog {
    pub token: u64,
    pub timer: TimerHandle,
}

/// 设备记录
///
/// `X` 为适配器私有的链路数据（Dongle 的连接句柄等）。
#[derive(Debug)]
pub struct DeviceRecord<X> {
    /// 稳定键（地址或平台路径）
    pub key: String,
    /// 显示名称（含家族前缀，冲突时带两位十六进制后缀）
    pub name: String,
    /// 广播中的原始名称
    pub advertised_name: String,
    /// 最近一次上报的信号强度
    pub rssi: i16,
    pub version: Option<HardwareVersion>,
    pub state: DeviceState,
    pub write_channel: Option<ChannelId>,
    pub notify_channel: Option<ChannelId>,
    /// 服务发现阶段已找到、尚未提交的通道
    pub(crate) staged_write: Option<ChannelId>,
    pub(crate) staged_notify: Option<ChannelId>,
    pub backend: Backend,
    pub watchdog: Option<Watchdog>,
    /// 最近一次广播的原始数据
    pub raw: Vec<u8>,
    pub link: X,
}

impl<X> DeviceRecord<X> {
    pub fn new(key: impl Into<String>, name: impl Into<String>, backend: Backend, link: X) -> Self {
        let name = name.into();
        Self {
            key: key.into(),
            advertised_name: name.clone(),
            name,
            rssi: 0,
            version: None,
            state: DeviceState::Idle,
            write_channel: None,
            notify_channel: None,
            staged_write: None,
            staged_notify: None,
            backend,
            watchdog: None,
            raw: Vec::new(),
            link,
        }
    }

    /// 写通道与通知通道是否都已解析
    pub fn channels_resolved(&self) -> bool {
        self.write_channel.is_some() && self.notify_channel.is_some()
    }

    /// 取消看门狗
    pub fn cancel_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.timer.cancel();
        }
    }
}

/// 广播观察结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// 新设备
    New,
    /// 已知设备，名称变化或 RSSI 超过阈值，需要重新上报
    Updated,
    /// 变化不足，不上报
    Unchanged,
}

impl Observation {
    pub fn should_report(self) -> bool {
        self != Observation::Unchanged
    }
}

/// 设备表（按键、名称、写通道、通知通道四个索引）
pub struct DeviceRegistry<X> {
    backend: Backend,
    rssi_threshold: i16,
    records: HashMap<String, DeviceRecord<X>>,
    by_name: HashMap<String, String>,
    by_write: HashMap<ChannelId, String>,
    by_notify: HashMap<ChannelId, String>,
}

impl<X> DeviceRegistry<X> {
    pub fn new(backend: Backend, rssi_threshold: i16) -> Self {
        Self {
            backend,
            rssi_threshold,
            records: HashMap::new(),
            by_name: HashMap::new(),
            by_write: HashMap::new(),
            by_notify: HashMap::new(),
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// 处理一次广播（或 RSSI 变化）
    ///
    /// 新键创建 IDLE 记录；已知键在名称变化或 RSSI 与上次上报值相差达到阈值时重新上报。
    /// `rssi` 为 `None` 表示本次没有信号强度信息。
    pub fn observe(
        &mut self,
        key: &str,
        advertised_name: &str,
        rssi: Option<i16>,
        link: impl FnOnce() -> X,
    ) -> Observation {
        if let Some(record) = self.records.get_mut(key) {
            let renamed = !advertised_name.is_empty() && record.advertised_name != advertised_name;
            let moved = rssi.is_some_and(|rssi| (rssi - record.rssi).abs() >= self.rssi_threshold);
            if !renamed && !moved {
                return Observation::Unchanged;
            }
            // 每次重新上报都刷新基准值
            if let Some(rssi) = rssi {
                record.rssi = rssi;
            }
            if renamed {
                let old_name = record.name.clone();
                self.rename(key, &old_name, advertised_name);
            }
            return Observation::Updated;
        }

        let name = self.make_unique_name(advertised_name);
        let mut record = DeviceRecord::new(key, name.clone(), self.backend, link());
        record.advertised_name = advertised_name.to_string();
        record.rssi = rssi.unwrap_or(0);
        self.by_name.insert(name, key.to_string());
        self.records.insert(key.to_string(), record);
        Observation::New
    }

    fn rename(&mut self, key: &str, old_name: &str, advertised_name: &str) {
        self.by_name.remove(old_name);
        let name = self.make_unique_name(advertised_name);
        self.by_name.insert(name.clone(), key.to_string());
        if let Some(record) = self.records.get_mut(key) {
            record.name = name;
            record.advertised_name = advertised_name.to_string();
        }
    }

    /// 为名称冲突的不同设备生成唯一显示名（追加两位十六进制后缀）
    pub fn make_unique_name(&self, advertised_name: &str) -> String {
        if !self.by_name.contains_key(advertised_name) {
            return advertised_name.to_string();
        }
        (1..=u8::MAX)
            .map(|suffix| format!("{}{:02X}", advertised_name, suffix))
            .find(|candidate| !self.by_name.contains_key(candidate))
            .unwrap_or_else(|| format!("{}{}", advertised_name, self.records.len()))
    }

    pub fn get(&self, key: &str) -> Option<&DeviceRecord<X>> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut DeviceRecord<X>> {
        self.records.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn key_for_name(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(String::as_str)
    }

    pub fn key_for_write(&self, channel: &ChannelId) -> Option<&str> {
        self.by_write.get(channel).map(String::as_str)
    }

    pub fn key_for_notify(&self, channel: &ChannelId) -> Option<&str> {
        self.by_notify.get(channel).map(String::as_str)
    }

    /// 同时提交写/通知通道并建立索引
    pub fn set_channels(&mut self, key: &str, write: ChannelId, notify: ChannelId) {
        if let Some(record) = self.records.get_mut(key) {
            self.by_write.insert(write.clone(), key.to_string());
            self.by_notify.insert(notify.clone(), key.to_string());
            record.write_channel = Some(write);
            record.notify_channel = Some(notify);
        }
    }

    /// 清除通道（含暂存）及其索引
    pub fn clear_channels(&mut self, key: &str) {
        if let Some(record) = self.records.get_mut(key) {
            if let Some(write) = record.write_channel.take() {
                self.by_write.remove(&write);
            }
            if let Some(notify) = record.notify_channel.take() {
                self.by_notify.remove(&notify);
            }
            record.staged_write = None;
            record.staged_notify = None;
        }
    }

    /// 从所有索引中删除记录
    pub fn remove(&mut self, key: &str) -> Option<DeviceRecord<X>> {
        self.clear_channels(key);
        let record = self.records.remove(key)?;
        self.by_name.remove(&record.name);
        Some(record)
    }

    /// 删除所有 IDLE 记录，返回删除数量
    pub fn clear_idle(&mut self) -> usize {
        let idle: Vec<String> = self
            .records
            .values()
            .filter(|r| r.state == DeviceState::Idle)
            .map(|r| r.key.clone())
            .collect();
        for key in &idle {
            self.remove(key);
        }
        idle.len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord<X>> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DeviceRegistry<()> {
        DeviceRegistry::new(Backend::SystemBus, DEFAULT_RSSI_THRESHOLD)
    }

    #[test]
    fn test_rssi_hysteresis() {
        let mut reg = registry();
        assert_eq!(reg.observe("k1", "FN1234", Some(-60), || ()), Observation::New);
        assert_eq!(reg.get("k1").unwrap().state, DeviceState::Idle);

        // 变化 1，不上报
        assert_eq!(
            reg.observe("k1", "FN1234", Some(-61), || ()),
            Observation::Unchanged
        );
        // 与上次上报值 -60 相差 25，上报
        assert_eq!(
            reg.observe("k1", "FN1234", Some(-85), || ()),
            Observation::Updated
        );
        assert_eq!(reg.get("k1").unwrap().rssi, -85);

        // 相差阈值减一，不上报
        assert_eq!(
            reg.observe("k1", "FN1234", Some(-66), || ()),
            Observation::Unchanged
        );
        // 恰好等于阈值，上报
        assert_eq!(
            reg.observe("k1", "FN1234", Some(-65), || ()),
            Observation::Updated
        );
        assert_eq!(reg.get("k1").unwrap().rssi, -65);
        // 无 RSSI 信息
        assert_eq!(reg.observe("k1", "FN1234", None, || ()), Observation::Unchanged);
    }

    #[test]
    fn test_name_change_reports() {
        let mut reg = registry();
        reg.observe("k1", "FN1234", Some(-60), || ());
        assert_eq!(
            reg.observe("k1", "FN9999", Some(-60), || ()),
            Observation::Updated
        );
        assert_eq!(reg.key_for_name("FN9999"), Some("k1"));
        assert_eq!(reg.key_for_name("FN1234"), None);
    }

    #[test]
    fn test_rename_refreshes_rssi_baseline() {
        let mut reg = registry();
        reg.observe("k1", "FN1234", Some(-60), || ());
        // 只改名时 RSSI 变化不足阈值，但基准值仍刷新为 -75
        assert_eq!(
            reg.observe("k1", "FN9999", Some(-75), || ()),
            Observation::Updated
        );
        assert_eq!(reg.get("k1").unwrap().rssi, -75);
        // 相对新基准 -75 只差 5，不上报（相对旧基准 -60 会差 20）
        assert_eq!(
            reg.observe("k1", "FN9999", Some(-80), || ()),
            Observation::Unchanged
        );
    }

    #[test]
    fn test_unique_names() {
        let mut reg = registry();
        reg.observe("k1", "BB0001", Some(-50), || ());
        reg.observe("k2", "BB0001", Some(-50), || ());
        reg.observe("k3", "BB0001", Some(-50), || ());
        assert_eq!(reg.get("k1").unwrap().name, "BB0001");
        assert_eq!(reg.get("k2").unwrap().name, "BB000101");
        assert_eq!(reg.get("k3").unwrap().name, "BB000102");
        assert_eq!(reg.key_for_name("BB000102"), Some("k3"));
    }

    #[test]
    fn test_channel_index_cleanup() {
        let mut reg = registry();
        reg.observe("/dev/a", "MB0001", Some(-50), || ());
        reg.set_channels(
            "/dev/a",
            ChannelId::Path("/dev/a/w".into()),
            ChannelId::Path("/dev/a/n".into()),
        );
        assert!(reg.get("/dev/a").unwrap().channels_resolved());
        assert_eq!(
            reg.key_for_notify(&ChannelId::Path("/dev/a/n".into())),
            Some("/dev/a")
        );

        reg.clear_channels("/dev/a");
        assert!(!reg.get("/dev/a").unwrap().channels_resolved());
        assert_eq!(reg.key_for_write(&ChannelId::Path("/dev/a/w".into())), None);

        reg.set_channels("/dev/a", ChannelId::Handle(1), ChannelId::Handle(2));
        let record = reg.remove("/dev/a").unwrap();
        assert_eq!(record.name, "MB0001");
        assert_eq!(reg.key_for_name("MB0001"), None);
        assert_eq!(reg.key_for_notify(&ChannelId::Handle(2)), None);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_clear_idle_keeps_active() {
        let mut reg = registry();
        reg.observe("a", "FN0001", None, || ());
        reg.observe("b", "FN0002", None, || ());
        reg.get_mut("b").unwrap().state = DeviceState::Connected;
        assert_eq!(reg.clear_idle(), 1);
        assert!(reg.contains("b"));
        assert!(!reg.contains("a"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(DeviceState::ConnectingGetVersion.to_string(), "CONNECTING_GET_VERSION");
        assert!(DeviceState::ConnectingBegin.is_connecting());
        assert!(!DeviceState::Connected.is_connecting());
    }
}
