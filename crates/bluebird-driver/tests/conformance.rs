//! 三种后端的一致性测试
//!
//! 同一组场景分别在 Mock Dongle、Mock 系统总线和 Mock 助手进程上运行。

use bluebird_driver::{
    Communicator, CommunicatorConfig, CommunicatorEvents, DiscoveredDevice, DongleCommunicator, HardwareVersion,
    HelperCommunicator, SystemBusCommunicator,
};
use bluebird_protocol::HelperCommand;
use bluebird_protocol::bgapi::{BdAddr, Command};
use bluebird_transport::mock::{BusCall, MockBus, MockDongle, MockHelper};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(3);
const SETTLE: Duration = Duration::from_millis(200);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn test_config() -> CommunicatorConfig {
    let mut config = CommunicatorConfig::default();
    config.connect_timeout = Duration::from_millis(300);
    config.helper.connect_timeout = Duration::from_millis(300);
    config.helper.startup_timeout = Duration::from_secs(2);
    config.dongle.read_timeout = Duration::from_millis(20);
    config
}

// ============================================================================
// 事件记录
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Recorded {
    Scan(bool),
    Discovered { name: String, rssi: i16 },
    Connected { name: String, v2: bool },
    Disconnected { name: String, user_initiated: bool },
    Notification { name: String, data: Vec<u8> },
    Status { has_transport: bool, healthy: bool },
}

#[derive(Default)]
struct RecordingEvents {
    events: Mutex<Vec<Recorded>>,
    changed: Condvar,
}

impl RecordingEvents {
    fn record(&self, event: Recorded) {
        self.events.lock().push(event);
        self.changed.notify_all();
    }

    fn count(&self, predicate: impl Fn(&Recorded) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    /// 等待满足条件的事件数量达到 `n`
    fn wait_count(&self, n: usize, predicate: impl Fn(&Recorded) -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        let mut events = self.events.lock();
        loop {
            if events.iter().filter(|e| predicate(e)).count() >= n {
                return true;
            }
            if self.changed.wait_until(&mut events, deadline).timed_out() {
                return events.iter().filter(|e| predicate(e)).count() >= n;
            }
        }
    }

    fn wait_for(&self, event: Recorded) -> bool {
        self.wait_count(1, |e| *e == event)
    }
}

impl CommunicatorEvents for RecordingEvents {
    fn scan_status_changed(&self, scanning: bool) {
        self.record(Recorded::Scan(scanning));
    }

    fn device_discovered(&self, device: &DiscoveredDevice) {
        self.record(Recorded::Discovered {
            name: device.name.clone(),
            rssi: device.rssi,
        });
    }

    fn device_connected(&self, name: &str, version: HardwareVersion) {
        self.record(Recorded::Connected {
            name: name.to_string(),
            v2: version.is_v2(),
        });
    }

    fn device_disconnected(&self, name: &str, user_initiated: bool) {
        self.record(Recorded::Disconnected {
            name: name.to_string(),
            user_initiated,
        });
    }

    fn notification(&self, name: &str, data: &[u8]) {
        self.record(Recorded::Notification {
            name: name.to_string(),
            data: data.to_vec(),
        });
    }

    fn status_changed(&self, has_transport: bool, healthy: bool) {
        self.record(Recorded::Status {
            has_transport,
            healthy,
        });
    }
}

fn is_discovered(name: &'static str) -> impl Fn(&Recorded) -> bool {
    move |e| matches!(e, Recorded::Discovered { name: n, .. } if n == name)
}

fn is_disconnected(e: &Recorded) -> bool {
    matches!(e, Recorded::Disconnected { .. })
}

fn is_connected(e: &Recorded) -> bool {
    matches!(e, Recorded::Connected { .. })
}

/// 轮询直到条件成立
fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

// ============================================================================
// 适配器夹具
// ============================================================================

trait Harness {
    fn communicator(&self) -> &dyn Communicator;
    fn events(&self) -> &RecordingEvents;
    fn advertise(&self, name: &str, rssi: i16);
    fn notify(&self, name: &str, data: &[u8]);
    fn drop_link(&self, name: &str);
    /// 底层无线电扫描启动次数
    fn scan_starts(&self) -> usize;
    /// 连接过程卡住，永远到不了 CONNECTED
    fn stall_connection(&self);
    fn set_version_v2(&self, v2: bool);
    fn wrote(&self, name: &str, data: &[u8]) -> bool;
}

/// 名称到模拟地址的映射
#[derive(Default)]
struct AddressBook {
    addresses: Mutex<HashMap<String, BdAddr>>,
}

impl AddressBook {
    fn address(&self, name: &str) -> BdAddr {
        let mut addresses = self.addresses.lock();
        let next = addresses.len() as u8 + 1;
        *addresses
            .entry(name.to_string())
            .or_insert(BdAddr([next, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]))
    }

    fn known(&self, name: &str) -> bool {
        self.addresses.lock().contains_key(name)
    }
}

struct DongleHarness {
    dongle: MockDongle,
    addresses: AddressBook,
    events: Arc<RecordingEvents>,
    communicator: DongleCommunicator,
}

impl DongleHarness {
    fn start() -> Self {
        let dongle = MockDongle::new();
        let events = Arc::new(RecordingEvents::default());
        let communicator = DongleCommunicator::with_link(dongle.clone(), &test_config(), events.clone()).unwrap();
        Self {
            dongle,
            addresses: AddressBook::default(),
            events,
            communicator,
        }
    }
}

impl Harness for DongleHarness {
    fn communicator(&self) -> &dyn Communicator {
        &self.communicator
    }

    fn events(&self) -> &RecordingEvents {
        &self.events
    }

    fn advertise(&self, name: &str, rssi: i16) {
        self.dongle.advertise(self.addresses.address(name), name, rssi as i8);
    }

    fn notify(&self, name: &str, data: &[u8]) {
        self.dongle.notify(self.addresses.address(name), data);
    }

    fn drop_link(&self, name: &str) {
        self.dongle.drop_link(self.addresses.address(name));
    }

    fn scan_starts(&self) -> usize {
        self.dongle.count_sent(|c| matches!(c, Command::GapDiscover { .. }))
    }

    fn stall_connection(&self) {
        self.dongle.set_ignore_probe(true);
    }

    fn set_version_v2(&self, v2: bool) {
        self.dongle.set_version_v2(v2);
    }

    fn wrote(&self, name: &str, data: &[u8]) -> bool {
        self.dongle
            .writes_to(self.addresses.address(name))
            .iter()
            .any(|w| w == data)
    }
}

struct BusHarness {
    bus: MockBus,
    addresses: AddressBook,
    events: Arc<RecordingEvents>,
    communicator: SystemBusCommunicator,
}

impl BusHarness {
    fn start() -> Self {
        let bus = MockBus::new();
        let events = Arc::new(RecordingEvents::default());
        let communicator = SystemBusCommunicator::new(Arc::new(bus.clone()), &test_config(), events.clone()).unwrap();
        Self {
            bus,
            addresses: AddressBook::default(),
            events,
            communicator,
        }
    }

    fn path(&self, name: &str) -> String {
        MockBus::device_path(&self.addresses.address(name).to_string())
    }
}

impl Harness for BusHarness {
    fn communicator(&self) -> &dyn Communicator {
        &self.communicator
    }

    fn events(&self) -> &RecordingEvents {
        &self.events
    }

    fn advertise(&self, name: &str, rssi: i16) {
        if self.addresses.known(name) {
            self.bus.set_rssi(&self.path(name), rssi);
        } else {
            self.bus.add_device(&self.path(name), name, rssi);
        }
    }

    fn notify(&self, name: &str, data: &[u8]) {
        self.bus.notify(&self.path(name), data);
    }

    fn drop_link(&self, name: &str) {
        self.bus.drop_link(&self.path(name));
    }

    fn scan_starts(&self) -> usize {
        self.bus.count_calls(|c| matches!(c, BusCall::StartDiscovery(_)))
    }

    fn stall_connection(&self) {
        self.bus.set_ignore_probe(true);
    }

    fn set_version_v2(&self, v2: bool) {
        self.bus.set_version_v2(v2);
    }

    fn wrote(&self, name: &str, data: &[u8]) -> bool {
        self.bus
            .writes_to(&MockBus::write_path(&self.path(name)))
            .iter()
            .any(|w| w == data)
    }
}

struct HelperHarness {
    helper: MockHelper,
    events: Arc<RecordingEvents>,
    communicator: HelperCommunicator,
}

impl HelperHarness {
    fn start() -> Self {
        let helper = MockHelper::new();
        let events = Arc::new(RecordingEvents::default());
        let communicator = HelperCommunicator::with_channel(helper.channel(), &test_config(), events.clone()).unwrap();
        Self {
            helper,
            events,
            communicator,
        }
    }
}

impl Harness for HelperHarness {
    fn communicator(&self) -> &dyn Communicator {
        &self.communicator
    }

    fn events(&self) -> &RecordingEvents {
        &self.events
    }

    fn advertise(&self, name: &str, rssi: i16) {
        self.helper.discover(name, rssi);
    }

    fn notify(&self, name: &str, data: &[u8]) {
        self.helper.notify(name, data);
    }

    fn drop_link(&self, name: &str) {
        self.helper.drop_link(name);
    }

    fn scan_starts(&self) -> usize {
        // 启动探测本身发送一次 startScan
        self.helper.count_sent(|l| l == "startScan").saturating_sub(1)
    }

    fn stall_connection(&self) {
        self.helper.set_ignore_connect(true);
    }

    fn set_version_v2(&self, v2: bool) {
        self.helper.set_version_v2(v2);
    }

    fn wrote(&self, name: &str, data: &[u8]) -> bool {
        let expected = HelperCommand::SendBlob {
            name: name.to_string(),
            data: data.to_vec(),
        }
        .to_string();
        self.helper.count_sent(|l| l == expected) > 0
    }
}

macro_rules! conformance {
    ($($check:ident),* $(,)?) => {
        $(
            mod $check {
                use super::*;

                #[test]
                fn dongle() {
                    init_logging();
                    super::$check(&DongleHarness::start());
                }

                #[test]
                fn system_bus() {
                    init_logging();
                    super::$check(&BusHarness::start());
                }

                #[test]
                fn helper() {
                    init_logging();
                    super::$check(&HelperHarness::start());
                }
            }
        )*
    };
}

conformance!(
    rssi_hysteresis,
    connect_reports_v2,
    connect_reports_v1,
    unknown_device_connect_is_rejected,
    double_disconnect_reports_once,
    restart_discovery_rereports_once,
    watchdog_forces_idle,
    link_loss_is_not_user_initiated,
    notifications_are_forwarded,
    send_command_reaches_connected_device,
    queued_connections_complete,
    kill_disconnects_devices,
);

// ============================================================================
// 场景
// ============================================================================

fn start_scan(h: &dyn Harness) {
    h.communicator().start_discovery();
    assert!(h.events().wait_for(Recorded::Scan(true)));
}

fn discover(h: &dyn Harness, name: &'static str) {
    h.advertise(name, -50);
    assert!(h.events().wait_count(1, is_discovered(name)), "{} not discovered", name);
}

fn connect(h: &dyn Harness, name: &'static str) {
    discover(h, name);
    h.communicator().request_connection(name);
    assert!(
        h.events().wait_count(1, |e| matches!(e, Recorded::Connected { name: n, .. } if n == name)),
        "{} did not connect",
        name
    );
}

fn rssi_hysteresis(h: &dyn Harness) {
    start_scan(h);
    h.advertise("FN1234", -60);
    assert!(h.events().wait_count(1, is_discovered("FN1234")));
    h.advertise("FN1234", -61);
    h.advertise("FN1234", -85);
    assert!(h.events().wait_count(2, is_discovered("FN1234")));
    thread::sleep(SETTLE);

    let reports: Vec<Recorded> = h
        .events()
        .events
        .lock()
        .iter()
        .filter(|e| is_discovered("FN1234")(e))
        .cloned()
        .collect();
    assert_eq!(
        reports,
        vec![
            Recorded::Discovered { name: "FN1234".into(), rssi: -60 },
            Recorded::Discovered { name: "FN1234".into(), rssi: -85 },
        ]
    );
}

fn connect_reports_v2(h: &dyn Harness) {
    start_scan(h);
    connect(h, "FN1234");
    assert_eq!(
        h.events().count(|e| *e == Recorded::Connected { name: "FN1234".into(), v2: true }),
        1
    );
    assert_eq!(h.events().count(is_disconnected), 0);
}

fn connect_reports_v1(h: &dyn Harness) {
    h.set_version_v2(false);
    start_scan(h);
    connect(h, "BB0042");
    assert!(h.events().wait_for(Recorded::Connected { name: "BB0042".into(), v2: false }));
}

fn unknown_device_connect_is_rejected(h: &dyn Harness) {
    start_scan(h);
    discover(h, "FN1234");
    h.communicator().request_connection("nonexistent");
    // 以用户断开回应，调用方据此释放预留
    assert!(h.events().wait_for(Recorded::Disconnected {
        name: "nonexistent".into(),
        user_initiated: true
    }));
    thread::sleep(SETTLE);
    assert_eq!(h.events().count(is_connected), 0);
    assert_eq!(h.events().count(is_disconnected), 1);

    // 其它设备不受影响
    h.communicator().request_connection("FN1234");
    assert!(h.events().wait_for(Recorded::Connected { name: "FN1234".into(), v2: true }));
}

fn double_disconnect_reports_once(h: &dyn Harness) {
    start_scan(h);
    connect(h, "FN1234");

    let communicator = h.communicator();
    thread::scope(|s| {
        s.spawn(|| communicator.request_disconnect("FN1234"));
        s.spawn(|| communicator.request_disconnect("FN1234"));
    });
    assert!(h.events().wait_for(Recorded::Disconnected {
        name: "FN1234".into(),
        user_initiated: true
    }));
    thread::sleep(SETTLE);
    assert_eq!(h.events().count(is_disconnected), 1);
}

fn restart_discovery_rereports_once(h: &dyn Harness) {
    start_scan(h);
    discover(h, "FN1234");
    discover(h, "BB5678");
    assert_eq!(h.scan_starts(), 1);

    h.communicator().start_discovery();
    assert!(h.events().wait_count(2, is_discovered("FN1234")));
    assert!(h.events().wait_count(2, is_discovered("BB5678")));
    thread::sleep(SETTLE);

    assert_eq!(h.events().count(is_discovered("FN1234")), 2);
    assert_eq!(h.events().count(is_discovered("BB5678")), 2);
    assert_eq!(h.scan_starts(), 1);
}

fn watchdog_forces_idle(h: &dyn Harness) {
    h.stall_connection();
    start_scan(h);
    discover(h, "FN1234");
    h.communicator().request_connection("FN1234");

    assert!(h.events().wait_for(Recorded::Disconnected {
        name: "FN1234".into(),
        user_initiated: true
    }));
    thread::sleep(SETTLE);
    assert_eq!(h.events().count(is_connected), 0);
    assert_eq!(h.events().count(is_disconnected), 1);
}

fn link_loss_is_not_user_initiated(h: &dyn Harness) {
    start_scan(h);
    connect(h, "MB0007");
    h.drop_link("MB0007");
    assert!(h.events().wait_for(Recorded::Disconnected {
        name: "MB0007".into(),
        user_initiated: false
    }));
    thread::sleep(SETTLE);
    assert_eq!(h.events().count(is_disconnected), 1);
}

fn notifications_are_forwarded(h: &dyn Harness) {
    start_scan(h);
    connect(h, "FN1234");

    h.notify("FN1234", &[0x01, 0x02]);
    let payload: Vec<u8> = (0u8..14).collect();
    h.notify("FN1234", &payload);
    assert!(h.events().wait_for(Recorded::Notification {
        name: "FN1234".into(),
        data: payload,
    }));
    assert_eq!(h.events().count(|e| matches!(e, Recorded::Notification { .. })), 1);
}

fn send_command_reaches_connected_device(h: &dyn Harness) {
    start_scan(h);
    discover(h, "BB5678");
    // 未连接时丢弃
    h.communicator().send_command("BB5678", &[0x90, 0x01]);
    thread::sleep(SETTLE);
    assert!(!h.wrote("BB5678", &[0x90, 0x01]));

    h.communicator().request_connection("BB5678");
    assert!(h.events().wait_count(1, is_connected));
    h.communicator().send_command("BB5678", &[0x90, 0x02]);
    assert!(eventually(|| h.wrote("BB5678", &[0x90, 0x02])));
}

fn queued_connections_complete(h: &dyn Harness) {
    start_scan(h);
    discover(h, "FN0001");
    discover(h, "BB0002");
    h.communicator().request_connection("FN0001");
    h.communicator().request_connection("BB0002");
    assert!(h.events().wait_count(2, is_connected));
    assert_eq!(h.events().count(is_disconnected), 0);
}

fn kill_disconnects_devices(h: &dyn Harness) {
    start_scan(h);
    connect(h, "FN1234");
    assert!(h.communicator().is_running());

    h.communicator().kill();
    assert!(!h.communicator().is_running());
    assert_eq!(
        h.events().count(|e| *e
            == Recorded::Disconnected {
                name: "FN1234".into(),
                user_initiated: true
            }),
        1
    );

    // 重复 kill 与 kill 后的调用都是空操作
    h.communicator().kill();
    h.communicator().request_connection("FN1234");
    thread::sleep(SETTLE);
    assert_eq!(h.events().count(is_connected), 1);
}

// ============================================================================
// 后端特有行为
// ============================================================================

#[test]
fn dongle_read_failure_reports_transport_loss() {
    init_logging();
    let h = DongleHarness::start();
    h.dongle.fail();
    assert!(h.events().wait_count(1, |e| matches!(e, Recorded::Status { has_transport: false, .. })));
    assert!(eventually(|| !h.communicator.is_running()));
}

#[test]
fn dongle_silent_port_fails_startup() {
    init_logging();
    let dongle = MockDongle::new();
    dongle.set_silent(true);
    let events = Arc::new(RecordingEvents::default());
    let result = DongleCommunicator::with_link(dongle, &test_config(), events);
    assert!(result.is_err());
}

#[test]
fn bus_without_radio_is_not_running() {
    init_logging();
    let events = Arc::new(RecordingEvents::default());
    let communicator =
        SystemBusCommunicator::new(Arc::new(MockBus::without_adapter()), &test_config(), events.clone()).unwrap();
    assert!(!communicator.is_running());
    assert_eq!(
        events.count(|e| *e
            == Recorded::Status {
                has_transport: false,
                healthy: true
            }),
        1
    );
}

#[test]
fn bus_vanished_device_disconnects_and_is_forgotten() {
    init_logging();
    let h = BusHarness::start();
    start_scan(&h);
    connect(&h, "FN1234");
    h.bus.remove_device(&h.path("FN1234"));
    assert!(h.events().wait_count(1, is_disconnected));

    // 已遗忘的设备：请求被拒绝并再次上报断开
    h.communicator().request_connection("FN1234");
    assert!(h.events().wait_count(2, is_disconnected));
    thread::sleep(SETTLE);
    assert_eq!(h.events().count(is_connected), 1);
    assert!(matches!(
        h.events().events.lock().last(),
        Some(Recorded::Disconnected { name, user_initiated: true }) if name == "FN1234"
    ));
}

#[test]
fn bus_connect_failure_returns_to_idle() {
    init_logging();
    let h = BusHarness::start();
    h.bus.set_fail_connect(true);
    start_scan(&h);
    discover(&h, "FN1234");
    h.communicator().request_connection("FN1234");
    assert!(h.events().wait_for(Recorded::Disconnected {
        name: "FN1234".into(),
        user_initiated: true
    }));

    h.bus.set_fail_connect(false);
    h.communicator().request_connection("FN1234");
    assert!(h.events().wait_count(1, is_connected));
}

#[test]
fn helper_eof_reports_transport_loss() {
    init_logging();
    let h = HelperHarness::start();
    h.helper.close();
    assert!(h.events().wait_for(Recorded::Status {
        has_transport: false,
        healthy: true
    }));
    assert!(!h.communicator.is_running());
}

#[test]
fn helper_kill_sends_quit() {
    init_logging();
    let h = HelperHarness::start();
    h.communicator.kill();
    assert_eq!(h.helper.count_sent(|l| l == "quit"), 1);
    assert!(!h.helper.is_alive());
    // kill 期间的 EOF 不算传输层丢失
    thread::sleep(SETTLE);
    assert_eq!(h.events().count(|e| matches!(e, Recorded::Status { has_transport: false, .. })), 0);
}

#[test]
fn helper_radio_off_is_not_running() {
    init_logging();
    let helper = MockHelper::new();
    helper.set_bluetooth_state("off");
    let events = Arc::new(RecordingEvents::default());
    let communicator = HelperCommunicator::with_channel(helper.channel(), &test_config(), events).unwrap();
    assert!(!communicator.is_running());
}
