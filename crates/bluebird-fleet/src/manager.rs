//! 三槽位编排器
//!
//! [`FleetManager`] 把用户请求路由到当前活动的通信器，并把通信器事件映射到槽位状态。
//! 通信器的创建与替换只发生在监督线程上（见 [`supervisor`](crate::supervisor)）。

use crate::config::SupervisorConfig;
use crate::error::FleetError;
use crate::notify::{FrontendNotifier, SensorSink};
use crate::slot::{SlotId, SlotSnapshot, SlotStatus, SlotTable};
use crate::supervisor::{self, CommunicatorFactory, SupervisorSignal};
use arc_swap::ArcSwapOption;
use bluebird_driver::{Communicator, CommunicatorEvents, DiscoveredDevice, DriverError, HardwareVersion};
use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// 当前活动的通信器及其代号
pub(crate) struct ActiveCommunicator {
    pub(crate) communicator: Arc<dyn Communicator>,
    pub(crate) generation: u64,
}

pub(crate) struct FleetShared {
    slots: Mutex<SlotTable>,
    /// 当前通信器报告过的设备名
    known: Mutex<HashSet<String>>,
    pub(crate) active: ArcSwapOption<ActiveCommunicator>,
    /// 最近一次创建的通信器代号，旧代号的事件被忽略
    pub(crate) generation: AtomicU64,
    /// 没有通信器时请求的扫描，通信器就绪后执行
    pub(crate) scan_wanted: AtomicBool,
    frontend: Arc<dyn FrontendNotifier>,
    sensors: Arc<dyn SensorSink>,
    signals: Sender<SupervisorSignal>,
}

impl FleetShared {
    fn active(&self) -> Result<Arc<ActiveCommunicator>, FleetError> {
        self.active.load_full().ok_or(FleetError::NoCommunicator)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    pub(crate) fn frontend(&self) -> &Arc<dyn FrontendNotifier> {
        &self.frontend
    }

    /// 通信器被丢弃时，所有活动槽位视为非用户断开
    pub(crate) fn drop_live_slots(&self) {
        let changed = self.slots.lock().drop_live();
        self.known.lock().clear();
        for (device, snapshot) in changed {
            warn!(slot = %snapshot.id, device = %device, "slot dropped with its communicator");
            self.frontend.slot_changed(&snapshot);
            if snapshot.status == SlotStatus::Dropped {
                self.sensors.receive_disconnection_event(&device, false);
            }
        }
    }
}

/// 通信器事件接收方，按代号过滤过期事件
pub(crate) struct FleetEvents {
    shared: Weak<FleetShared>,
    generation: u64,
}

impl FleetEvents {
    pub(crate) fn new(shared: &Arc<FleetShared>, generation: u64) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            generation,
        }
    }

    fn current(&self) -> Option<Arc<FleetShared>> {
        let shared = self.shared.upgrade()?;
        if shared.is_current(self.generation) {
            Some(shared)
        } else {
            trace!(generation = self.generation, "event from retired communicator");
            None
        }
    }
}

impl CommunicatorEvents for FleetEvents {
    fn scan_status_changed(&self, scanning: bool) {
        if let Some(shared) = self.current() {
            shared.frontend.scan_status_changed(scanning);
        }
    }

    fn device_discovered(&self, device: &DiscoveredDevice) {
        if let Some(shared) = self.current() {
            shared.known.lock().insert(device.name.clone());
            shared.frontend.device_discovered(device);
        }
    }

    fn device_connected(&self, name: &str, version: HardwareVersion) {
        let Some(shared) = self.current() else {
            return;
        };
        let snapshot = shared.slots.lock().mark_connected(name, version);
        match snapshot {
            Some(snapshot) => {
                info!(slot = %snapshot.id, device = %name, %version, "slot connected");
                shared.frontend.slot_changed(&snapshot);
                shared
                    .sensors
                    .receive_connection_event(name, version.is_v2());
            },
            None => {
                warn!(device = %name, "connection without a slot, disconnecting");
                if let Some(active) = shared.active.load_full() {
                    active.communicator.request_disconnect(name);
                }
            },
        }
    }

    fn device_disconnected(&self, name: &str, user_initiated: bool) {
        let Some(shared) = self.current() else {
            return;
        };
        let snapshot = shared
            .slots
            .lock()
            .mark_disconnected(name, user_initiated);
        if let Some(snapshot) = snapshot {
            info!(slot = %snapshot.id, device = %name, user_initiated, status = %snapshot.status, "slot disconnected");
            shared.frontend.slot_changed(&snapshot);
        }
        shared
            .sensors
            .receive_disconnection_event(name, user_initiated);
    }

    fn notification(&self, name: &str, data: &[u8]) {
        let Some(shared) = self.current() else {
            return;
        };
        let slot = {
            let slots = shared.slots.lock();
            slots
                .find(name)
                .filter(|id| slots.status(*id) == SlotStatus::Connected)
        };
        match slot {
            Some(id) => shared.sensors.receive_notification(id, name, data),
            None => trace!(device = %name, len = data.len(), "notification without a connected slot"),
        }
    }

    fn status_changed(&self, has_transport: bool, healthy: bool) {
        let Some(shared) = self.current() else {
            return;
        };
        shared.frontend.ble_status_changed(has_transport, healthy);
        if !has_transport {
            let _ = shared
                .signals
                .send(SupervisorSignal::TransportLost(self.generation));
        }
    }
}

/// 三槽位编排器
///
/// # Example
///
/// ```no_run
/// use bluebird_driver::CommunicatorBuilder;
/// use bluebird_fleet::{FleetManager, FrontendNotifier, SensorSink, SupervisorConfig};
/// # use std::sync::Arc;
/// # fn collaborators() -> (Arc<dyn FrontendNotifier>, Arc<dyn SensorSink>) { unimplemented!() }
///
/// let (frontend, sensors) = collaborators();
/// let fleet = FleetManager::new(CommunicatorBuilder::new(), SupervisorConfig::default(), frontend, sensors)
///     .unwrap();
/// fleet.start_discovery();
/// let slot = fleet.connect("FN1234").unwrap();
/// println!("connecting in slot {}", slot);
/// ```
pub struct FleetManager {
    shared: Arc<FleetShared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl FleetManager {
    /// 创建编排器并启动监督线程
    pub fn new(
        factory: impl CommunicatorFactory,
        config: SupervisorConfig,
        frontend: Arc<dyn FrontendNotifier>,
        sensors: Arc<dyn SensorSink>,
    ) -> Result<Self, FleetError> {
        let (signals, signal_rx) = unbounded();
        let shared = Arc::new(FleetShared {
            slots: Mutex::new(SlotTable::new()),
            known: Mutex::new(HashSet::new()),
            active: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            scan_wanted: AtomicBool::new(false),
            frontend,
            sensors,
            signals,
        });

        let handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("fleet-supervisor".into())
                .spawn(move || supervisor::run(shared, Box::new(factory), signal_rx, config))
                .map_err(|e| DriverError::IoThread(e.to_string()))?
        };

        Ok(Self {
            shared,
            supervisor: Mutex::new(Some(handle)),
        })
    }

    /// 是否有运行中的通信器
    pub fn has_communicator(&self) -> bool {
        self.shared
            .active
            .load_full()
            .is_some_and(|active| active.communicator.is_running())
    }

    /// 开始扫描；没有通信器时延迟到通信器就绪
    pub fn start_discovery(&self) {
        match self.shared.active() {
            Ok(active) => active.communicator.start_discovery(),
            Err(_) => {
                info!("no communicator yet, scan deferred");
                self.shared.scan_wanted.store(true, Ordering::Release);
            },
        }
    }

    pub fn stop_discovery(&self) {
        self.shared.scan_wanted.store(false, Ordering::Release);
        if let Ok(active) = self.shared.active() {
            active.communicator.stop_discovery();
        }
    }

    /// 为设备分配槽位并发起连接，返回槽位编号
    ///
    /// 槽位检查在停止扫描之前完成，被拒绝的请求不会影响扫描。
    pub fn connect(&self, name: &str) -> Result<SlotId, FleetError> {
        let active = self.shared.active()?;
        if !self.shared.known.lock().contains(name) {
            warn!(device = %name, "connect: device not found");
            return Err(DriverError::DeviceNotFound(name.to_string()).into());
        }
        let snapshot = {
            let mut slots = self.shared.slots.lock();
            let id = slots.bind(name)?;
            slots.snapshot(id)
        };
        info!(slot = %snapshot.id, device = %name, "slot bound");
        self.shared.frontend.slot_changed(&snapshot);

        active.communicator.stop_discovery();
        active.communicator.request_connection(name);
        Ok(snapshot.id)
    }

    /// 按设备名断开
    ///
    /// Dropped 与 Connecting 槽位立即释放；已连接槽位在断开事件到达时释放。
    /// 连接中的设备仍会收到断开请求，之后迟到的连接事件按无槽位设备处理。
    pub fn disconnect(&self, name: &str) -> Result<(), FleetError> {
        let released = {
            let mut slots = self.shared.slots.lock();
            match slots.find(name) {
                Some(id) => match slots.status(id) {
                    status @ (SlotStatus::Dropped | SlotStatus::Connecting) => Some((status, slots.release(id))),
                    _ => None,
                },
                None => None,
            }
        };
        if let Some((status, snapshot)) = released {
            info!(slot = %snapshot.id, device = %name, ?status, "slot released");
            self.shared.frontend.slot_changed(&snapshot);
            if status == SlotStatus::Connecting
                && let Ok(active) = self.shared.active()
            {
                active.communicator.request_disconnect(name);
            }
            return Ok(());
        }
        let active = self.shared.active()?;
        active.communicator.request_disconnect(name);
        Ok(())
    }

    pub fn disconnect_slot(&self, letter: char) -> Result<(), FleetError> {
        let id = SlotId::from_letter(letter).ok_or(FleetError::UnknownSlot(letter))?;
        let device = self.shared.slots.lock().device(id).map(str::to_string);
        match device {
            Some(device) => self.disconnect(&device),
            None => Err(FleetError::SlotNotConnected(id.letter())),
        }
    }

    /// 向已连接槽位发送命令字节
    pub fn send_command(&self, letter: char, data: &[u8]) -> Result<(), FleetError> {
        let id = SlotId::from_letter(letter).ok_or(FleetError::UnknownSlot(letter))?;
        let device = self.shared.slots.lock().connected_device(id)?;
        let active = self.shared.active()?;
        active.communicator.send_command(&device, data);
        Ok(())
    }

    pub fn slot(&self, letter: char) -> Result<SlotSnapshot, FleetError> {
        let id = SlotId::from_letter(letter).ok_or(FleetError::UnknownSlot(letter))?;
        Ok(self.shared.slots.lock().snapshot(id))
    }

    pub fn slots(&self) -> Vec<SlotSnapshot> {
        self.shared.slots.lock().snapshots()
    }

    pub fn cancel_connection_request(&self) -> Result<(), FleetError> {
        let active = self.shared.active()?;
        active.communicator.cancel_connection_request();
        Ok(())
    }

    /// 停止监督线程并 kill 当前通信器（幂等）
    pub fn shutdown(&self) {
        let Some(handle) = self.supervisor.lock().take() else {
            return;
        };
        debug!("stopping fleet supervisor");
        let _ = self.shared.signals.send(SupervisorSignal::Shutdown);
        if handle.join().is_err() {
            error!("Fleet supervisor thread panicked");
        }
        if let Some(active) = self.shared.active.swap(None) {
            active.communicator.kill();
        }
        info!("fleet shut down");
    }
}

impl Drop for FleetManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
