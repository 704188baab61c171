//! 系统蓝牙服务适配器
//!
//! 总线信号在传输层线程上触发，处理函数只把信号封装成工作项投递到队列；
//! 设备消失的清理工作插到队首，并先清除该设备所有待执行的工作。
//!
//! 扫描的开始与停止（包括自动停止定时器）都在工作线程上执行，天然互斥。

use crate::communicator::{Backend, Communicator, CommunicatorEvents, DisconnectReason};
use crate::config::{BusConfig, CommunicatorConfig};
use crate::device::{ChannelId, ChannelKind, DeviceRecord, DeviceRegistry, DeviceState};
use crate::error::DriverError;
use crate::runtime::{AdapterRuntime, Scheduler, TimerHandle, WorkQueue};
use crate::session::{GattLink, Session, WatchdogSink};
use bluebird_protocol::{
    NOTIFY_CHARACTERISTIC_UUID, SERVICE_UUID, WRITE_CHARACTERISTIC_UUID, is_supported_name,
};
use bluebird_transport::bus::is_child_path;
use bluebird_transport::{BusObject, BusSignal, DeviceProperties, SystemBus};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// 总线侧 GATT 操作
struct BusGatt {
    bus: Arc<dyn SystemBus>,
}

fn path_of(channel: &ChannelId) -> Result<&str, DriverError> {
    match channel {
        ChannelId::Path(path) => Ok(path),
        other => Err(DriverError::InvalidInput(format!(
            "not a bus object path: {:?}",
            other
        ))),
    }
}

impl GattLink<()> for BusGatt {
    fn write(&mut self, _record: &DeviceRecord<()>, channel: &ChannelId, data: &[u8]) -> Result<(), DriverError> {
        self.bus.write_value(path_of(channel)?, data)?;
        Ok(())
    }

    fn set_notify(&mut self, _record: &DeviceRecord<()>, channel: &ChannelId, enable: bool) -> Result<(), DriverError> {
        let path = path_of(channel)?;
        if enable {
            self.bus.start_notify(path)?;
        } else {
            self.bus.stop_notify(path)?;
        }
        Ok(())
    }

    fn close_link(&mut self, record: &DeviceRecord<()>, reason: DisconnectReason) -> Result<(), DriverError> {
        if reason == DisconnectReason::LinkLost {
            return Ok(());
        }
        self.bus.disconnect(&record.key)?;
        Ok(())
    }
}

struct DiscoveryTimer {
    token: u64,
    timer: TimerHandle,
}

struct BusState {
    session: Session<()>,
    gatt: BusGatt,
    config: BusConfig,
    queue: Arc<WorkQueue<BusState>>,
    scheduler: Arc<Scheduler>,
    adapters: Vec<String>,
    /// 正在计时的自动停止定时器（存在即表示正在扫描）
    discovery: Option<DiscoveryTimer>,
    next_discovery_token: u64,
    /// 首次扫描是否找到了可用的无线电
    had_radio: bool,
    /// 设备路径 -> 已出现的特征值
    known_chars: HashMap<String, Vec<(String, Uuid)>>,
}

impl BusState {
    fn events(&self) -> Arc<dyn CommunicatorEvents> {
        self.session.events().clone()
    }

    /// 导入总线上已有的对象
    fn initialize(&mut self) {
        let objects = match self.gatt.bus.managed_objects() {
            Ok(objects) => objects,
            Err(e) => {
                warn!(error = %e, "managed object enumeration failed");
                return;
            },
        };
        for object in objects {
            match object {
                BusObject::Adapter { path } => trace!(adapter = %path, "radio"),
                BusObject::Device { path, properties } => self.on_device(&path, &properties),
                BusObject::Characteristic {
                    path,
                    device_path,
                    uuid,
                } => self.on_characteristic(&device_path, path, uuid),
            }
        }
    }

    // ------------------------------------------------------------------------
    // 扫描
    // ------------------------------------------------------------------------

    fn arm_discovery_timer(&mut self) {
        let token = self.next_discovery_token;
        self.next_discovery_token += 1;
        let queue = self.queue.clone();
        let timer = self.scheduler.schedule(self.config.discovery_window, move || {
            queue.push("discovery timeout", "", move |s: &mut BusState| {
                s.discovery_expired(token)
            });
        });
        self.discovery = Some(DiscoveryTimer { token, timer });
    }

    fn start_discovery(&mut self) {
        if let Some(active) = self.discovery.take() {
            active.timer.cancel();
            self.arm_discovery_timer();
            if self.had_radio {
                self.revalidate();
                let count = self.session.report_idle();
                debug!(count, "discovery refreshed, re-reported known devices");
                return;
            }
        }

        let adapters = match self.gatt.bus.adapters() {
            Ok(adapters) => adapters,
            Err(e) => {
                warn!(error = %e, "adapter enumeration failed");
                self.discovery = None;
                return;
            },
        };
        let mut started = 0;
        for adapter in &adapters {
            match self.gatt.bus.start_discovery(adapter) {
                Ok(()) => started += 1,
                Err(e) => warn!(adapter = %adapter, error = %e, "start discovery failed"),
            }
        }
        self.adapters = adapters;
        if started == 0 {
            warn!("no radio available for discovery");
            if let Some(active) = self.discovery.take() {
                active.timer.cancel();
            }
            return;
        }
        self.had_radio = true;
        if self.discovery.is_none() {
            self.arm_discovery_timer();
        }
        info!(radios = started, window = ?self.config.discovery_window, "bus discovery started");
        self.events().scan_status_changed(true);
    }

    fn stop_discovery(&mut self) {
        match self.discovery.take() {
            Some(active) => {
                active.timer.cancel();
                self.end_discovery();
            },
            None => info!("spurious stop: discovery not active"),
        }
    }

    fn discovery_expired(&mut self, token: u64) {
        if self.discovery.as_ref().map(|d| d.token) != Some(token) {
            trace!(token, "stale discovery timer");
            return;
        }
        self.discovery = None;
        debug!("discovery window elapsed");
        self.end_discovery();
    }

    fn end_discovery(&mut self) {
        for adapter in &self.adapters {
            if let Err(e) = self.gatt.bus.stop_discovery(adapter) {
                warn!(adapter = %adapter, error = %e, "stop discovery failed");
            }
        }
        info!("bus discovery stopped");
        self.events().scan_status_changed(false);
    }

    /// 重新确认每个已知设备仍在总线上
    fn revalidate(&mut self) {
        for key in self.session.registry.keys() {
            match self.gatt.bus.device_exists(&key) {
                Ok(true) => {},
                Ok(false) => self.device_vanished(&key),
                Err(e) => warn!(key = %key, error = %e, "device check failed"),
            }
        }
    }

    // ------------------------------------------------------------------------
    // 信号分发
    // ------------------------------------------------------------------------

    fn dispatch(&mut self, signal: BusSignal) {
        match signal {
            BusSignal::DeviceAppeared { path, properties } => self.on_device(&path, &properties),
            BusSignal::CharacteristicAppeared {
                path,
                device_path,
                uuid,
            } => self.on_characteristic(&device_path, path, uuid),
            BusSignal::DevicePropertiesChanged { path, properties } => {
                self.on_properties_changed(&path, &properties)
            },
            BusSignal::ValueChanged { path, value } => {
                let channel = ChannelId::Path(path);
                let Some(key) = self.session.registry.key_for_notify(&channel).map(str::to_string)
                else {
                    trace!(path = ?channel, "value for untracked characteristic");
                    return;
                };
                self.session.value_received(&mut self.gatt, &key, &value);
            },
            BusSignal::DeviceVanished { path } => self.device_vanished(&path),
        }
    }

    fn on_device(&mut self, path: &str, properties: &DeviceProperties) {
        let Some(name) = properties.name.as_deref() else {
            trace!(path, "device without name ignored");
            return;
        };
        if !is_supported_name(name) || !properties.service_uuids.contains(&SERVICE_UUID) {
            return;
        }
        if properties.connected == Some(true) && !self.session.registry.contains(path) {
            info!(path, device = %name, "clearing stale link");
            if let Err(e) = self.gatt.bus.disconnect(path) {
                warn!(path, error = %e, "stale link disconnect failed");
            }
        }
        self.session.observe(path, name, properties.rssi, &[], || ());
    }

    fn on_properties_changed(&mut self, path: &str, properties: &DeviceProperties) {
        let Some(state) = self.session.state_of(path) else {
            return;
        };
        if properties.connected == Some(false)
            && !matches!(state, DeviceState::Idle | DeviceState::Disconnecting)
        {
            info!(path, %state, "link dropped");
            self.session
                .disconnect(&mut self.gatt, path, DisconnectReason::LinkLost);
        }
        if properties.rssi.is_some() || properties.name.is_some() {
            let name = properties.name.as_deref().unwrap_or("");
            self.session.observe(path, name, properties.rssi, &[], || ());
        }
    }

    fn on_characteristic(&mut self, device: &str, path: String, uuid: Uuid) {
        let kind = if uuid == WRITE_CHARACTERISTIC_UUID {
            ChannelKind::Write
        } else if uuid == NOTIFY_CHARACTERISTIC_UUID {
            ChannelKind::Notify
        } else {
            return;
        };
        let known = self.known_chars.entry(device.to_string()).or_default();
        if !known.iter().any(|(p, _)| *p == path) {
            known.push((path.clone(), uuid));
        }
        if self.session.state_of(device) == Some(DeviceState::ConnectingDiscoverServices) {
            self.session
                .channel_found(&mut self.gatt, device, kind, ChannelId::Path(path));
        }
    }

    fn device_vanished(&mut self, path: &str) {
        let name = self.session.registry.get(path).map(|r| r.name.clone());
        let purged = self.queue.purge(|item| {
            item.key == path || is_child_path(path, &item.key) || name.as_deref() == Some(item.key.as_str())
        });
        if purged > 0 {
            debug!(path, purged, "pending work purged");
        }
        self.known_chars.remove(path);
        self.known_chars.retain(|device, _| !is_child_path(path, device));
        self.session.remove(&mut self.gatt, path);
    }

    // ------------------------------------------------------------------------
    // 连接
    // ------------------------------------------------------------------------

    fn request_connection(&mut self, name: &str) {
        let Some(key) = self.session.request_connect(name) else {
            return;
        };
        self.session.arm_watchdog(&key);
        // 阻塞工作线程直到总线给出结果，最长可到总线自身的超时。
        // 期间到达的信号和请求在队列中等待，connect 返回后按序处理。
        if let Err(e) = self.gatt.bus.connect(&key) {
            warn!(device = %name, key = %key, error = %e, "bus connect failed");
            self.session
                .disconnect(&mut self.gatt, &key, DisconnectReason::ConnectFailed);
            return;
        }
        if !self.session.link_established(&key) {
            return;
        }
        let replay = self.known_chars.get(&key).cloned().unwrap_or_default();
        for (path, uuid) in replay {
            self.on_characteristic(&key, path, uuid);
        }
    }

    fn cancel(&mut self) {
        if let Some(active) = self.discovery.take() {
            active.timer.cancel();
            self.end_discovery();
        }
        let connecting: Vec<String> = self
            .session
            .registry
            .iter()
            .filter(|r| r.state.is_connecting())
            .map(|r| r.key.clone())
            .collect();
        for key in connecting {
            self.session
                .disconnect(&mut self.gatt, &key, DisconnectReason::Cancelled);
        }
    }

    fn watchdog(&mut self, key: &str, token: u64) {
        self.session.watchdog_fired(&mut self.gatt, key, token);
    }

    fn send_command(&mut self, name: &str, data: &[u8]) {
        if let Err(e) = self.session.send(&mut self.gatt, name, data) {
            warn!(device = %name, error = %e, "command dropped");
        }
    }

    fn release(mut self) {
        if let Some(active) = self.discovery.take() {
            active.timer.cancel();
            for adapter in &self.adapters {
                let _ = self.gatt.bus.stop_discovery(adapter);
            }
        }
        let count = self
            .session
            .disconnect_all(&mut self.gatt, DisconnectReason::User);
        debug!(count, "devices force-disconnected");
        self.gatt.bus.shutdown();
    }
}

/// 系统蓝牙服务通信器
pub struct SystemBusCommunicator {
    runtime: AdapterRuntime<BusState>,
    bus: Arc<dyn SystemBus>,
    running: AtomicBool,
    killed: AtomicBool,
}

impl SystemBusCommunicator {
    /// 在给定总线上启动适配器
    ///
    /// 没有无线电适配器时仍返回实例，但 `is_running()` 为 false，
    /// 并上报 `status_changed(false, true)`。
    pub fn new(
        bus: Arc<dyn SystemBus>,
        config: &CommunicatorConfig,
        events: Arc<dyn CommunicatorEvents>,
    ) -> Result<Self, DriverError> {
        let runtime = AdapterRuntime::new("bus")?;
        let adapters = match bus.adapters() {
            Ok(adapters) => adapters,
            Err(e) => {
                warn!(error = %e, "adapter enumeration failed");
                Vec::new()
            },
        };

        let queue = runtime.queue().clone();
        let sink_queue = queue.clone();
        let on_watchdog: WatchdogSink = Arc::new(move |key: String, token: u64| {
            let item_key = key.clone();
            sink_queue.push("connection watchdog", item_key, move |s: &mut BusState| {
                s.watchdog(&key, token)
            });
        });

        let state = BusState {
            session: Session::new(
                DeviceRegistry::new(Backend::SystemBus, config.rssi_threshold),
                events.clone(),
                runtime.scheduler().clone(),
                config.connect_timeout,
                on_watchdog,
            ),
            gatt: BusGatt { bus: bus.clone() },
            config: config.bus.clone(),
            queue: queue.clone(),
            scheduler: runtime.scheduler().clone(),
            adapters: adapters.clone(),
            discovery: None,
            next_discovery_token: 1,
            had_radio: false,
            known_chars: HashMap::new(),
        };
        runtime.spawn(state)?;

        let communicator = Self {
            runtime,
            bus: bus.clone(),
            running: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        };

        if adapters.is_empty() {
            warn!("no bluetooth radio on the system bus");
            events.status_changed(false, true);
            return Ok(communicator);
        }

        let signal_queue = queue;
        bus.set_signal_handler(Arc::new(move |signal: BusSignal| {
            let key = signal.path().to_string();
            match signal {
                BusSignal::DeviceVanished { path } => {
                    signal_queue.push_front("device vanished", key, move |s: &mut BusState| {
                        s.device_vanished(&path)
                    })
                },
                other => signal_queue.push("bus signal", key, move |s: &mut BusState| s.dispatch(other)),
            };
        }));
        communicator
            .runtime
            .submit("initialize", "", |s: &mut BusState| s.initialize());
        communicator.running.store(true, Ordering::Release);
        info!(radios = adapters.len(), "system bus adapter running");
        events.status_changed(true, true);
        Ok(communicator)
    }

    /// 使用 BlueZ 系统总线
    #[cfg(all(feature = "bluez", target_os = "linux"))]
    pub fn bluez(config: &CommunicatorConfig, events: Arc<dyn CommunicatorEvents>) -> Result<Self, DriverError> {
        let bus = bluebird_transport::bluez::BluezBus::new()?;
        Self::new(Arc::new(bus), config, events)
    }
}

impl Communicator for SystemBusCommunicator {
    fn backend(&self) -> Backend {
        Backend::SystemBus
    }

    fn start_discovery(&self) {
        self.runtime
            .submit("start discovery", "", |s: &mut BusState| s.start_discovery());
    }

    fn stop_discovery(&self) {
        self.runtime
            .submit("stop discovery", "", |s: &mut BusState| s.stop_discovery());
    }

    fn request_connection(&self, name: &str) {
        let device = name.to_string();
        self.runtime
            .submit("request connection", name, move |s: &mut BusState| {
                s.request_connection(&device)
            });
    }

    fn request_disconnect(&self, name: &str) {
        let device = name.to_string();
        self.runtime
            .submit("request disconnect", name, move |s: &mut BusState| {
                s.session.request_disconnect(&mut s.gatt, &device);
            });
    }

    fn send_command(&self, name: &str, data: &[u8]) {
        let device = name.to_string();
        let data = data.to_vec();
        self.runtime
            .submit("send command", name, move |s: &mut BusState| s.send_command(&device, &data));
    }

    fn cancel_connection_request(&self) {
        self.runtime
            .submit("cancel connection", "", |s: &mut BusState| s.cancel());
    }

    fn kill(&self) {
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping system bus adapter");
        self.running.store(false, Ordering::Release);
        match self.runtime.shutdown() {
            Some(state) => state.release(),
            None => {
                warn!("bus worker state lost");
                self.bus.shutdown();
            },
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.killed.load(Ordering::Acquire)
    }
}

impl Drop for SystemBusCommunicator {
    fn drop(&mut self) {
        self.kill();
    }
}
