//! 设备连接状态机
//!
//! 三种适配器共用同一份状态机。适配器负责把各自的传输事件翻译为语义步骤
//! （`link_established` / `channel_found` / `value_received` / `disconnect`），
//! 并通过 [`GattLink`] 提供实际的写入与断链能力。
//!
//! ```text
//! IDLE -> CONNECTING_BEGIN -> CONNECTING_DISCOVER_SERVICES -> CONNECTING_GET_VERSION
//!      -> CONNECTED -> DISCONNECTING -> IDLE
//! 任意状态 -> REMOVED（设备被平台移除）
//! ```

use crate::communicator::{CommunicatorEvents, DiscoveredDevice, DisconnectReason};
use crate::device::{ChannelId, ChannelKind, DeviceRecord, DeviceRegistry, DeviceState, Observation, Watchdog};
use crate::error::DriverError;
use crate::runtime::Scheduler;
use bluebird_protocol::{HardwareVersion, POLL_STOP, RobotFamily, VERSION_PROBE, is_sensor_payload};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// 看门狗到期回调：(设备键, 看门狗令牌)，只应投递工作
pub type WatchdogSink = Arc<dyn Fn(String, u64) + Send + Sync>;

/// 适配器提供的 GATT 操作
///
/// 默认实现通过 `write` 发送版本探测与轮询命令；由外部进程完成会话建立的后端可覆盖为空操作。
pub trait GattLink<X> {
    fn write(&mut self, record: &DeviceRecord<X>, channel: &ChannelId, data: &[u8]) -> Result<(), DriverError>;

    fn set_notify(&mut self, record: &DeviceRecord<X>, channel: &ChannelId, enable: bool) -> Result<(), DriverError>;

    /// 关闭链路（链路已由对端关闭时 `reason` 为 `LinkLost`）
    fn close_link(&mut self, record: &DeviceRecord<X>, reason: DisconnectReason) -> Result<(), DriverError>;

    fn send_probe(&mut self, record: &DeviceRecord<X>) -> Result<(), DriverError> {
        let channel = write_channel(record)?;
        let probe = RobotFamily::from_name(&record.name)
            .map(RobotFamily::version_probe)
            .unwrap_or(&VERSION_PROBE);
        self.write(record, &channel, probe)
    }

    fn start_polling(&mut self, record: &DeviceRecord<X>, version: HardwareVersion) -> Result<(), DriverError> {
        let channel = write_channel(record)?;
        self.write(record, &channel, version.poll_start())
    }

    fn stop_polling(&mut self, record: &DeviceRecord<X>) -> Result<(), DriverError> {
        let channel = write_channel(record)?;
        self.write(record, &channel, &POLL_STOP)
    }
}

fn write_channel<X>(record: &DeviceRecord<X>) -> Result<ChannelId, DriverError> {
    record
        .write_channel
        .clone()
        .ok_or_else(|| DriverError::NotConnected(record.name.clone()))
}

/// 状态机及其设备表
pub struct Session<X> {
    pub registry: DeviceRegistry<X>,
    events: Arc<dyn CommunicatorEvents>,
    scheduler: Arc<Scheduler>,
    on_watchdog: WatchdogSink,
    watchdog_timeout: Duration,
    next_token: u64,
}

impl<X> Session<X> {
    pub fn new(
        registry: DeviceRegistry<X>,
        events: Arc<dyn CommunicatorEvents>,
        scheduler: Arc<Scheduler>,
        watchdog_timeout: Duration,
        on_watchdog: WatchdogSink,
    ) -> Self {
        Self {
            registry,
            events,
            scheduler,
            on_watchdog,
            watchdog_timeout,
            next_token: 1,
        }
    }

    pub fn events(&self) -> &Arc<dyn CommunicatorEvents> {
        &self.events
    }

    pub fn state_of(&self, key: &str) -> Option<DeviceState> {
        self.registry.get(key).map(|r| r.state)
    }

    pub fn key_for_name(&self, name: &str) -> Option<String> {
        self.registry.key_for_name(name).map(str::to_string)
    }

    // ------------------------------------------------------------------------
    // 发现
    // ------------------------------------------------------------------------

    /// 记录一次广播，需要时上报发现事件。返回是否上报。
    pub fn observe(
        &mut self,
        key: &str,
        advertised_name: &str,
        rssi: Option<i16>,
        raw: &[u8],
        link: impl FnOnce() -> X,
    ) -> bool {
        let observation = self.registry.observe(key, advertised_name, rssi, link);
        let Some(record) = self.registry.get_mut(key) else {
            return false;
        };
        if !raw.is_empty() {
            record.raw = raw.to_vec();
        }
        if observation == Observation::New {
            debug!(device = %record.name, key, rssi = record.rssi, "new device");
        }
        if observation.should_report() {
            self.events.device_discovered(&discovered(record));
            return true;
        }
        false
    }

    /// 重新上报所有 IDLE 设备（重启扫描时）
    pub fn report_idle(&self) -> usize {
        let mut count = 0;
        for record in self.registry.iter().filter(|r| r.state == DeviceState::Idle) {
            self.events.device_discovered(&discovered(record));
            count += 1;
        }
        count
    }

    // ------------------------------------------------------------------------
    // 连接建立
    // ------------------------------------------------------------------------

    /// IDLE -> CONNECTING_BEGIN，返回设备键
    pub fn begin_connect(&mut self, name: &str) -> Result<String, DriverError> {
        let key = self
            .key_for_name(name)
            .ok_or_else(|| DriverError::DeviceNotFound(name.to_string()))?;
        let Some(record) = self.registry.get_mut(&key) else {
            return Err(DriverError::DeviceNotFound(name.to_string()));
        };
        if record.state != DeviceState::Idle {
            return Err(DriverError::DeviceBusy {
                name: name.to_string(),
                state: record.state,
            });
        }
        record.state = DeviceState::ConnectingBegin;
        record.version = None;
        info!(device = %name, key = %key, "connecting");
        Ok(key)
    }

    /// 处理连接请求：成功时返回设备键
    ///
    /// 未知设备的请求以 `device_disconnected(name, true)` 回应，调用方据此释放为它保留的资源。
    /// 设备忙时请求被忽略（该设备已有进行中的会话，之后仍会产生断开事件）。
    pub fn request_connect(&mut self, name: &str) -> Option<String> {
        match self.begin_connect(name) {
            Ok(key) => Some(key),
            Err(DriverError::DeviceNotFound(_)) => {
                warn!(device = %name, "connect: device not found");
                self.events.device_disconnected(name, true);
                None
            },
            Err(e) => {
                info!(device = %name, error = %e, "connect request ignored");
                None
            },
        }
    }

    /// 启动（或重启）连接看门狗
    pub fn arm_watchdog(&mut self, key: &str) {
        let token = self.next_token;
        self.next_token += 1;
        let Some(record) = self.registry.get_mut(key) else {
            return;
        };
        record.cancel_watchdog();
        let sink = self.on_watchdog.clone();
        let timer_key = key.to_string();
        let timer = self
            .scheduler
            .schedule(self.watchdog_timeout, move || sink(timer_key, token));
        record.watchdog = Some(Watchdog { token, timer });
        trace!(device = %record.name, token, "watchdog armed");
    }

    /// 看门狗到期：令牌匹配且仍在连接中时强制断开
    pub fn watchdog_fired<L: GattLink<X>>(&mut self, link: &mut L, key: &str, token: u64) -> bool {
        let Some(record) = self.registry.get_mut(key) else {
            return false;
        };
        let current = record.watchdog.as_ref().map(|w| w.token);
        if current != Some(token) || !record.state.is_connecting() {
            trace!(key, token, "stale watchdog ignored");
            return false;
        }
        record.watchdog = None;
        warn!(device = %record.name, state = %record.state, "connection watchdog expired");
        self.disconnect(link, key, DisconnectReason::Watchdog)
    }

    /// CONNECTING_BEGIN -> CONNECTING_DISCOVER_SERVICES
    pub fn link_established(&mut self, key: &str) -> bool {
        let Some(record) = self.registry.get_mut(key) else {
            return false;
        };
        if record.state != DeviceState::ConnectingBegin {
            debug!(device = %record.name, state = %record.state, "link up outside of connect");
            return false;
        }
        record.state = DeviceState::ConnectingDiscoverServices;
        debug!(device = %record.name, "link established, resolving channels");
        true
    }

    /// 记录找到的通道；两个都找到后提交并进入 CONNECTING_GET_VERSION
    pub fn channel_found<L: GattLink<X>>(
        &mut self,
        link: &mut L,
        key: &str,
        kind: ChannelKind,
        channel: ChannelId,
    ) -> bool {
        let Some(record) = self.registry.get_mut(key) else {
            return false;
        };
        if record.state != DeviceState::ConnectingDiscoverServices {
            trace!(device = %record.name, state = %record.state, ?kind, "channel ignored");
            return false;
        }
        let slot = match kind {
            ChannelKind::Write => &mut record.staged_write,
            ChannelKind::Notify => &mut record.staged_notify,
        };
        if slot.is_none() {
            debug!(device = %record.name, ?kind, ?channel, "channel found");
            *slot = Some(channel);
        }
        let (Some(write), Some(notify)) = (record.staged_write.clone(), record.staged_notify.clone())
        else {
            return false;
        };

        self.registry.set_channels(key, write, notify.clone());
        let Some(record) = self.registry.get_mut(key) else {
            return false;
        };
        record.state = DeviceState::ConnectingGetVersion;

        let setup = link
            .set_notify(record, &notify, true)
            .and_then(|_| link.send_probe(record));
        if let Err(e) = setup {
            warn!(device = %record.name, error = %e, "session setup failed");
            self.disconnect(link, key, DisconnectReason::ConnectFailed);
            return false;
        }
        true
    }

    /// 处理通知载荷
    pub fn value_received<L: GattLink<X>>(&mut self, link: &mut L, key: &str, payload: &[u8]) {
        let Some(record) = self.registry.get(key) else {
            trace!(key, "notification for unknown device");
            return;
        };
        match record.state {
            DeviceState::ConnectingGetVersion => match HardwareVersion::from_response(payload) {
                Some(version) => {
                    self.complete_connection(link, key, version);
                },
                None => debug!(
                    device = %record.name,
                    len = payload.len(),
                    "non-version payload during setup"
                ),
            },
            DeviceState::Connected => {
                if is_sensor_payload(payload) {
                    self.events.notification(&record.name, payload);
                } else {
                    warn!(
                        device = %record.name,
                        len = payload.len(),
                        "unexpected short notification dropped"
                    );
                }
            },
            state => trace!(device = %record.name, %state, "notification dropped"),
        }
    }

    /// CONNECTING_GET_VERSION -> CONNECTED
    pub fn complete_connection<L: GattLink<X>>(
        &mut self,
        link: &mut L,
        key: &str,
        version: HardwareVersion,
    ) -> bool {
        let Some(record) = self.registry.get_mut(key) else {
            return false;
        };
        if record.state != DeviceState::ConnectingGetVersion || !record.channels_resolved() {
            debug!(device = %record.name, state = %record.state, "unexpected version");
            return false;
        }
        record.cancel_watchdog();
        record.state = DeviceState::Connected;
        record.version = Some(version);
        info!(device = %record.name, %version, "connected");
        if let Err(e) = link.start_polling(record, version) {
            warn!(device = %record.name, error = %e, "poll start failed");
        }
        self.events.device_connected(&record.name, version);
        true
    }

    // ------------------------------------------------------------------------
    // 断开与移除
    // ------------------------------------------------------------------------

    /// 断开序列：停轮询 -> 关通知 -> 取消看门狗 -> 清通道 -> 关链路 -> IDLE
    ///
    /// 已在 IDLE 或 DISCONNECTING 时直接返回 false，不会重复上报。
    pub fn disconnect<L: GattLink<X>>(&mut self, link: &mut L, key: &str, reason: DisconnectReason) -> bool {
        let Some(record) = self.registry.get_mut(key) else {
            debug!(key, %reason, "disconnect for unknown device");
            return false;
        };
        let prior = record.state;
        match prior {
            DeviceState::Idle | DeviceState::Removed => {
                debug!(device = %record.name, %reason, "already idle");
                return false;
            },
            DeviceState::Disconnecting => {
                warn!(device = %record.name, %reason, "disconnect already in progress");
                return false;
            },
            _ => {},
        }

        info!(device = %record.name, state = %prior, %reason, "disconnecting");
        record.state = DeviceState::Disconnecting;

        if prior == DeviceState::Connected
            && let Err(e) = link.stop_polling(record)
        {
            debug!(device = %record.name, error = %e, "poll stop failed");
        }
        if let Some(notify) = record.notify_channel.clone()
            && let Err(e) = link.set_notify(record, &notify, false)
        {
            debug!(device = %record.name, error = %e, "notify disable failed");
        }
        record.cancel_watchdog();

        self.registry.clear_channels(key);
        let Some(record) = self.registry.get_mut(key) else {
            return false;
        };
        if let Err(e) = link.close_link(record, reason) {
            warn!(device = %record.name, error = %e, "close link failed");
        }
        record.state = DeviceState::Idle;
        record.version = None;

        self.events
            .device_disconnected(&record.name, reason.user_initiated(prior));
        true
    }

    /// 按名称断开（显式请求）
    pub fn request_disconnect<L: GattLink<X>>(&mut self, link: &mut L, name: &str) -> bool {
        match self.key_for_name(name) {
            Some(key) => self.disconnect(link, &key, DisconnectReason::User),
            None => {
                warn!(device = %name, "disconnect: device not found");
                false
            },
        }
    }

    /// 设备被平台移除：必要时先断开，再从所有索引删除
    pub fn remove<L: GattLink<X>>(&mut self, link: &mut L, key: &str) -> Option<DeviceRecord<X>> {
        let state = self.state_of(key)?;
        if state != DeviceState::Idle {
            self.disconnect(link, key, DisconnectReason::Removed);
        }
        let mut record = self.registry.remove(key)?;
        record.state = DeviceState::Removed;
        info!(device = %record.name, key, "device removed");
        Some(record)
    }

    /// 强制断开所有非 IDLE 设备
    pub fn disconnect_all<L: GattLink<X>>(&mut self, link: &mut L, reason: DisconnectReason) -> usize {
        let active: Vec<String> = self
            .registry
            .iter()
            .filter(|r| r.state != DeviceState::Idle)
            .map(|r| r.key.clone())
            .collect();
        active
            .iter()
            .filter(|key| self.disconnect(link, key, reason))
            .count()
    }

    // ------------------------------------------------------------------------
    // 数据
    // ------------------------------------------------------------------------

    /// 向 CONNECTED 设备写入命令，其它情况丢弃并返回错误
    pub fn send<L: GattLink<X>>(&mut self, link: &mut L, name: &str, data: &[u8]) -> Result<(), DriverError> {
        let key = self
            .key_for_name(name)
            .ok_or_else(|| DriverError::DeviceNotFound(name.to_string()))?;
        let record = self
            .registry
            .get(&key)
            .ok_or_else(|| DriverError::DeviceNotFound(name.to_string()))?;
        if record.state != DeviceState::Connected {
            return Err(DriverError::NotConnected(name.to_string()));
        }
        let channel = write_channel(record)?;
        link.write(record, &channel, data)
    }
}

fn discovered<X>(record: &DeviceRecord<X>) -> DiscoveredDevice {
    DiscoveredDevice {
        name: record.name.clone(),
        key: record.key.clone(),
        rssi: record.rssi,
        raw: record.raw.clone(),
    }
}
