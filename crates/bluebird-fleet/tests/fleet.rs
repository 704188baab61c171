//! 编排器集成测试（Mock 通信器）

use bluebird_driver::{
    Backend, Communicator, CommunicatorEvents, DiscoveredDevice, DriverError, HardwareVersion,
};
use bluebird_fleet::{
    CommunicatorFactory, FleetError, FleetManager, FrontendNotifier, SensorSink, SlotId, SlotSnapshot, SlotStatus,
    SupervisorConfig,
};
use parking_lot::Mutex;
use serial_test::serial;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

// ============================================================================
// Mock 通信器
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Call {
    StartDiscovery,
    StopDiscovery,
    Connect(String),
    Disconnect(String),
    Send(String, Vec<u8>),
    Cancel,
    Kill,
}

struct MockCommunicator {
    events: Arc<dyn CommunicatorEvents>,
    calls: Mutex<Vec<Call>>,
    running: AtomicBool,
}

impl MockCommunicator {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    fn discover(&self, name: &str) {
        self.events.device_discovered(&DiscoveredDevice {
            name: name.to_string(),
            key: format!("key-{}", name),
            rssi: -50,
            raw: Vec::new(),
        });
    }

    /// 传输层断开：先停止运行再上报
    fn lose_transport(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.events.status_changed(false, true);
    }
}

impl Communicator for MockCommunicator {
    fn backend(&self) -> Backend {
        Backend::Dongle
    }

    fn start_discovery(&self) {
        self.calls.lock().push(Call::StartDiscovery);
    }

    fn stop_discovery(&self) {
        self.calls.lock().push(Call::StopDiscovery);
    }

    fn request_connection(&self, name: &str) {
        self.calls.lock().push(Call::Connect(name.to_string()));
    }

    fn request_disconnect(&self, name: &str) {
        self.calls.lock().push(Call::Disconnect(name.to_string()));
    }

    fn send_command(&self, name: &str, data: &[u8]) {
        self.calls
            .lock()
            .push(Call::Send(name.to_string(), data.to_vec()));
    }

    fn cancel_connection_request(&self) {
        self.calls.lock().push(Call::Cancel);
    }

    fn kill(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.calls.lock().push(Call::Kill);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
struct MockFactory {
    unavailable: Arc<AtomicBool>,
    created: Arc<Mutex<Vec<Arc<MockCommunicator>>>>,
}

impl MockFactory {
    fn latest(&self) -> Option<Arc<MockCommunicator>> {
        self.created.lock().last().cloned()
    }

    fn created(&self) -> usize {
        self.created.lock().len()
    }
}

impl CommunicatorFactory for MockFactory {
    fn create(&self, events: Arc<dyn CommunicatorEvents>) -> Result<Arc<dyn Communicator>, DriverError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DriverError::NoTransport);
        }
        let communicator = Arc::new(MockCommunicator {
            events,
            calls: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        });
        self.created.lock().push(communicator.clone());
        Ok(communicator)
    }
}

// ============================================================================
// 协作方记录
// ============================================================================

#[derive(Default)]
struct Frontend {
    scans: Mutex<Vec<bool>>,
    discovered: Mutex<Vec<String>>,
    slots: Mutex<Vec<SlotSnapshot>>,
    status: Mutex<Vec<(bool, bool)>>,
}

impl FrontendNotifier for Frontend {
    fn scan_status_changed(&self, scanning: bool) {
        self.scans.lock().push(scanning);
    }

    fn device_discovered(&self, device: &DiscoveredDevice) {
        self.discovered.lock().push(device.name.clone());
    }

    fn slot_changed(&self, slot: &SlotSnapshot) {
        self.slots.lock().push(slot.clone());
    }

    fn ble_status_changed(&self, has_transport: bool, healthy: bool) {
        self.status.lock().push((has_transport, healthy));
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SensorEvent {
    Notification(char, String, Vec<u8>),
    Connected(String, bool),
    Disconnected(String, bool),
}

#[derive(Default)]
struct Sensors {
    events: Mutex<Vec<SensorEvent>>,
}

impl SensorSink for Sensors {
    fn receive_notification(&self, slot: SlotId, name: &str, data: &[u8]) {
        self.events
            .lock()
            .push(SensorEvent::Notification(slot.letter(), name.to_string(), data.to_vec()));
    }

    fn receive_connection_event(&self, name: &str, version_is_two: bool) {
        self.events
            .lock()
            .push(SensorEvent::Connected(name.to_string(), version_is_two));
    }

    fn receive_disconnection_event(&self, name: &str, user_initiated: bool) {
        self.events
            .lock()
            .push(SensorEvent::Disconnected(name.to_string(), user_initiated));
    }
}

struct Fixture {
    factory: MockFactory,
    frontend: Arc<Frontend>,
    sensors: Arc<Sensors>,
    fleet: FleetManager,
}

impl Fixture {
    fn start(factory: MockFactory) -> Self {
        init_logging();
        let frontend = Arc::new(Frontend::default());
        let sensors = Arc::new(Sensors::default());
        let config = SupervisorConfig {
            retry_interval: Duration::from_millis(50),
        };
        let fleet = FleetManager::new(factory.clone(), config, frontend.clone(), sensors.clone()).unwrap();
        Self {
            factory,
            frontend,
            sensors,
            fleet,
        }
    }

    /// 启动并等待第一个通信器就绪
    fn ready() -> Self {
        let fixture = Self::start(MockFactory::default());
        assert!(eventually(|| fixture.fleet.has_communicator()));
        fixture
    }

    fn communicator(&self) -> Arc<MockCommunicator> {
        self.factory.latest().unwrap()
    }

    fn connect(&self, name: &str) -> SlotId {
        self.communicator().discover(name);
        let slot = self.fleet.connect(name).unwrap();
        self.communicator()
            .events
            .device_connected(name, HardwareVersion::V2);
        slot
    }
}

// ============================================================================
// 槽位分配
// ============================================================================

#[test]
fn test_fourth_connection_rejected_without_side_effects() {
    let f = Fixture::ready();
    let comm = f.communicator();
    for name in ["FN0001", "BB0002", "MB0003", "FN0004"] {
        comm.discover(name);
    }
    f.fleet.start_discovery();

    let letters: Vec<char> = ["FN0001", "BB0002", "MB0003"]
        .iter()
        .map(|n| f.fleet.connect(n).unwrap().letter())
        .collect();
    assert_eq!(letters, vec!['A', 'B', 'C']);

    assert!(matches!(f.fleet.connect("FN0004"), Err(FleetError::NoFreeSlot)));
    assert_eq!(comm.count(&Call::StopDiscovery), 3);
    assert_eq!(comm.count(&Call::Connect("FN0004".into())), 0);
    assert_eq!(f.fleet.slots().iter().filter(|s| s.status == SlotStatus::Connecting).count(), 3);
}

#[test]
fn test_connect_unknown_device() {
    let f = Fixture::ready();
    let err = f.fleet.connect("nonexistent").unwrap_err();
    assert!(matches!(err, FleetError::Driver(DriverError::DeviceNotFound(_))));
    assert!(f.communicator().calls().is_empty());
    assert!(f.fleet.slots().iter().all(|s| s.status == SlotStatus::Empty));
}

#[test]
fn test_connect_twice_rejected() {
    let f = Fixture::ready();
    f.communicator().discover("FN0001");
    f.fleet.connect("FN0001").unwrap();
    assert!(matches!(
        f.fleet.connect("FN0001"),
        Err(FleetError::AlreadyBound { slot: 'A', .. })
    ));
}

#[test]
fn test_connection_event_records_version() {
    let f = Fixture::ready();
    let slot = f.connect("FN1234");

    let snapshot = f.fleet.slot(slot.letter()).unwrap();
    assert_eq!(snapshot.status, SlotStatus::Connected);
    assert_eq!(snapshot.version, Some(HardwareVersion::V2));
    assert_eq!(
        f.sensors.events.lock().clone(),
        vec![SensorEvent::Connected("FN1234".into(), true)]
    );
    assert_eq!(f.frontend.slots.lock().last(), Some(&snapshot));
}

// ============================================================================
// 断开
// ============================================================================

#[test]
fn test_user_disconnect_frees_slot() {
    let f = Fixture::ready();
    f.connect("FN1234");
    f.fleet.disconnect_slot('a').unwrap();
    assert_eq!(f.communicator().count(&Call::Disconnect("FN1234".into())), 1);

    f.communicator()
        .events
        .device_disconnected("FN1234", true);
    assert_eq!(f.fleet.slot('A').unwrap().status, SlotStatus::Empty);
    assert!(matches!(f.fleet.disconnect_slot('A'), Err(FleetError::SlotNotConnected('A'))));
}

#[test]
fn test_unsolicited_disconnect_keeps_slot_bound() {
    let f = Fixture::ready();
    f.connect("FN0001");
    f.connect("BB0002");
    f.communicator()
        .events
        .device_disconnected("FN0001", false);

    let dropped = f.fleet.slot('A').unwrap();
    assert_eq!(dropped.status, SlotStatus::Dropped);
    assert_eq!(dropped.device.as_deref(), Some("FN0001"));

    // 同名重连复用原槽位
    assert_eq!(f.fleet.connect("FN0001").unwrap().letter(), 'A');
    f.communicator()
        .events
        .device_disconnected("FN0001", true);

    // 再次掉线后由用户释放
    f.connect("FN0001");
    f.communicator()
        .events
        .device_disconnected("FN0001", false);
    let before = f.communicator().count(&Call::Disconnect("FN0001".into()));
    f.fleet.disconnect("FN0001").unwrap();
    assert_eq!(f.fleet.slot('A').unwrap().status, SlotStatus::Empty);
    assert_eq!(f.communicator().count(&Call::Disconnect("FN0001".into())), before);
}

#[test]
fn test_rejected_connection_frees_slot() {
    let f = Fixture::ready();
    f.communicator().discover("FN0001");
    assert_eq!(f.fleet.connect("FN0001").unwrap().letter(), 'A');
    assert_eq!(f.fleet.slot('A').unwrap().status, SlotStatus::Connecting);

    // 适配器已遗忘该设备，以用户断开回应
    f.communicator()
        .events
        .device_disconnected("FN0001", true);
    assert_eq!(f.fleet.slot('A').unwrap().status, SlotStatus::Empty);

    f.communicator().discover("FN0001");
    assert_eq!(f.fleet.connect("FN0001").unwrap().letter(), 'A');
}

#[test]
fn test_disconnect_while_connecting_releases_slot() {
    let f = Fixture::ready();
    f.communicator().discover("FN0001");
    f.fleet.connect("FN0001").unwrap();

    f.fleet.disconnect("FN0001").unwrap();
    let released = f.fleet.slot('A').unwrap();
    assert_eq!(released.status, SlotStatus::Empty);
    assert_eq!(f.frontend.slots.lock().last(), Some(&released));
    assert_eq!(f.communicator().count(&Call::Disconnect("FN0001".into())), 1);

    // 迟到的连接事件不再占用槽位
    f.communicator()
        .events
        .device_connected("FN0001", HardwareVersion::V1);
    assert!(f.fleet.slots().iter().all(|s| s.status == SlotStatus::Empty));
    assert_eq!(f.communicator().count(&Call::Disconnect("FN0001".into())), 2);
}

// ============================================================================
// 数据
// ============================================================================

#[test]
fn test_notifications_routed_by_name() {
    let f = Fixture::ready();
    f.connect("FN0001");
    f.connect("BB0002");

    let payload = vec![0xAA; 14];
    f.communicator().events.notification("BB0002", &payload);
    f.communicator().events.notification("MB9999", &payload);

    let notifications: Vec<SensorEvent> = f
        .sensors
        .events
        .lock()
        .iter()
        .filter(|e| matches!(e, SensorEvent::Notification(..)))
        .cloned()
        .collect();
    assert_eq!(
        notifications,
        vec![SensorEvent::Notification('B', "BB0002".into(), payload)]
    );
}

#[test]
fn test_send_command_by_slot() {
    let f = Fixture::ready();
    f.connect("FN0001");
    f.fleet.send_command('A', &[0x90, 0x00, 0xFF]).unwrap();
    assert_eq!(
        f.communicator().count(&Call::Send("FN0001".into(), vec![0x90, 0x00, 0xFF])),
        1
    );

    assert!(matches!(f.fleet.send_command('B', &[1]), Err(FleetError::SlotNotConnected('B'))));
    assert!(matches!(f.fleet.send_command('Q', &[1]), Err(FleetError::UnknownSlot('Q'))));
}

#[test]
fn test_cancel_forwarded() {
    let f = Fixture::ready();
    f.fleet.cancel_connection_request().unwrap();
    assert_eq!(f.communicator().count(&Call::Cancel), 1);
}

// ============================================================================
// 监督
// ============================================================================

#[test]
#[serial]
fn test_deferred_scan_starts_when_communicator_appears() {
    let factory = MockFactory::default();
    factory.unavailable.store(true, Ordering::SeqCst);
    let f = Fixture::start(factory);

    f.fleet.start_discovery();
    assert!(matches!(f.fleet.connect("FN0001"), Err(FleetError::NoCommunicator)));
    thread::sleep(Duration::from_millis(120));
    assert_eq!(f.factory.created(), 0);

    f.factory.unavailable.store(false, Ordering::SeqCst);
    assert!(eventually(|| f.fleet.has_communicator()));
    assert!(eventually(|| f.communicator().count(&Call::StartDiscovery) == 1));
}

#[test]
#[serial]
fn test_transport_loss_replaces_communicator() {
    let f = Fixture::ready();
    f.connect("FN0001");
    let old = f.communicator();

    old.lose_transport();
    assert!(eventually(|| f.factory.created() == 2));
    assert!(eventually(|| old.count(&Call::Kill) == 1));
    assert!(eventually(|| f.fleet.has_communicator()));

    assert_eq!(f.fleet.slot('A').unwrap().status, SlotStatus::Dropped);
    assert!(
        f.sensors
            .events
            .lock()
            .contains(&SensorEvent::Disconnected("FN0001".into(), false))
    );
    assert!(f.frontend.status.lock().contains(&(false, true)));

    // 旧通信器的迟到事件被忽略
    let discovered = f.frontend.discovered.lock().len();
    old.discover("BB0002");
    assert_eq!(f.frontend.discovered.lock().len(), discovered);
    f.communicator().discover("BB0002");
    assert_eq!(f.frontend.discovered.lock().len(), discovered + 1);
}

#[test]
#[serial]
fn test_shutdown_kills_communicator() {
    let f = Fixture::ready();
    let comm = f.communicator();
    f.fleet.shutdown();
    assert_eq!(comm.count(&Call::Kill), 1);
    assert!(!f.fleet.has_communicator());
    f.fleet.shutdown();
    assert_eq!(comm.count(&Call::Kill), 1);
    assert!(matches!(f.fleet.cancel_connection_request(), Err(FleetError::NoCommunicator)));
}
