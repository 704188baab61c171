//! Mock 传输层（无硬件依赖）
//!
//! - [`MockDongle`]: 模拟 BLE Dongle，内置一个厂商 GATT 属性表并自动应答命令
//! - [`MockBus`]: 模拟系统蓝牙服务，信号在调用线程上同步触发
//! - [`MockHelper`]: 模拟助手子进程的行协议
//!
//! 每个 mock 都是可克隆的句柄：一份交给被测适配器，一份留在测试中注入事件和检查调用。

use crate::bus::{BusObject, BusSignal, DeviceProperties, SignalHandler, SystemBus};
use crate::dongle::{DongleLink, DongleRx, DongleTx};
use crate::helper::{HelperChannel, LineSink, LineSource, ProcessControl};
use crate::{TransportDeviceError, TransportDeviceErrorKind, TransportError};
use bluebird_protocol::bgapi::{
    BdAddr, CONNECTION_FLAGS_ESTABLISHED, Command, Event, Message, Response, SystemInfo, ids,
};
use bluebird_protocol::gatt::{
    CCCD_ENABLE_NOTIFY, CCCD_UUID16, CHARACTERISTIC_DECLARATION_UUID16,
    NOTIFY_CHARACTERISTIC_UUID, PRIMARY_SERVICE_UUID16, SERVICE_UUID, WRITE_CHARACTERISTIC_UUID,
    uuid_from_u16, uuid_to_le_bytes,
};
use bluebird_protocol::{VERSION_PROBE, VERSION_PROBE_FINCH};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// 模拟版本响应：第 4 字节 0x22 表示 V2
fn version_response(v2: bool) -> Vec<u8> {
    vec![0x00, 0x00, 0x00, if v2 { 0x22 } else { 0x01 }]
}

fn is_probe(data: &[u8]) -> bool {
    data == VERSION_PROBE || data == VERSION_PROBE_FINCH
}

// ============================================================================
// MockDongle
// ============================================================================

/// 通用访问服务范围
pub const MOCK_GA_SERVICE: (u16, u16) = (0x0001, 0x0003);
/// 厂商服务范围
pub const MOCK_VENDOR_SERVICE: (u16, u16) = (0x000C, 0x0011);
/// 写特征值句柄
pub const MOCK_WRITE_HANDLE: u16 = 0x000E;
/// 通知特征值句柄
pub const MOCK_NOTIFY_HANDLE: u16 = 0x0010;
/// 通知特征的 CCCD 句柄
pub const MOCK_CCCD_HANDLE: u16 = 0x0011;

/// 接收端的输入项
enum DongleInbound {
    Message(Message),
    Fail,
}

struct DongleSim {
    /// 已建立的连接：handle -> 地址
    connections: BTreeMap<u8, BdAddr>,
    next_connection: u8,
    /// 广播过的设备
    known: HashSet<BdAddr>,
    sent: Vec<Command>,
    cccd_enabled: HashSet<u8>,
    read_values: HashMap<u16, Vec<u8>>,
    version_v2: bool,
    stall_connect: bool,
    stall_discovery: bool,
    discovery_error: Option<u16>,
    ignore_probe: bool,
    silent: bool,
}

struct MockDongleShared {
    sim: Mutex<DongleSim>,
    inbox_tx: Sender<DongleInbound>,
    inbox_rx: Receiver<DongleInbound>,
}

/// 模拟 Dongle
#[derive(Clone)]
pub struct MockDongle {
    shared: Arc<MockDongleShared>,
}

impl Default for MockDongle {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDongle {
    pub fn new() -> Self {
        let (inbox_tx, inbox_rx) = unbounded();
        Self {
            shared: Arc::new(MockDongleShared {
                sim: Mutex::new(DongleSim {
                    connections: BTreeMap::new(),
                    next_connection: 0,
                    known: HashSet::new(),
                    sent: Vec::new(),
                    cccd_enabled: HashSet::new(),
                    read_values: HashMap::new(),
                    version_v2: true,
                    stall_connect: false,
                    stall_discovery: false,
                    discovery_error: None,
                    ignore_probe: false,
                    silent: false,
                }),
                inbox_tx,
                inbox_rx,
            }),
        }
    }

    fn push(&self, message: Message) {
        let _ = self.shared.inbox_tx.send(DongleInbound::Message(message));
    }

    fn push_event(&self, event: Event) {
        self.push(Message::Event(event));
    }

    /// 注入一条广播（完整名称 AD 结构）
    pub fn advertise(&self, address: BdAddr, name: &str, rssi: i8) {
        self.shared.sim.lock().known.insert(address);
        let mut data = vec![0x02, 0x01, 0x06];
        data.push(name.len() as u8 + 1);
        data.push(0x09);
        data.extend_from_slice(name.as_bytes());
        self.push_event(Event::GapScanResponse {
            rssi,
            packet_type: 0,
            sender: address,
            address_type: 1,
            bond: 0xFF,
            data,
        });
    }

    /// 模拟链路意外断开（监督超时）
    pub fn drop_link(&self, address: BdAddr) {
        let connection = {
            let mut sim = self.shared.sim.lock();
            let connection = sim
                .connections
                .iter()
                .find(|(_, addr)| **addr == address)
                .map(|(c, _)| *c);
            if let Some(c) = connection {
                sim.connections.remove(&c);
                sim.cccd_enabled.remove(&c);
            }
            connection
        };
        if let Some(connection) = connection {
            self.push_event(Event::ConnectionDisconnected {
                connection,
                reason: 0x0208,
            });
        }
    }

    /// 模拟通知特征上报数据
    pub fn notify(&self, address: BdAddr, value: &[u8]) {
        if let Some(connection) = self.connection_of(address) {
            self.push_event(Event::AttAttributeValue {
                connection,
                handle: MOCK_NOTIFY_HANDLE,
                kind: 1,
                value: value.to_vec(),
            });
        }
    }

    /// 让接收端下一次读取返回 IO 错误
    pub fn fail(&self) {
        let _ = self.shared.inbox_tx.send(DongleInbound::Fail);
    }

    pub fn connection_of(&self, address: BdAddr) -> Option<u8> {
        self.shared
            .sim
            .lock()
            .connections
            .iter()
            .find(|(_, addr)| **addr == address)
            .map(|(c, _)| *c)
    }

    /// 已发送的全部命令
    pub fn sent(&self) -> Vec<Command> {
        self.shared.sim.lock().sent.clone()
    }

    pub fn count_sent(&self, predicate: impl Fn(&Command) -> bool) -> usize {
        self.shared.sim.lock().sent.iter().filter(|c| predicate(c)).count()
    }

    /// 发往某设备写特征的数据
    pub fn writes_to(&self, address: BdAddr) -> Vec<Vec<u8>> {
        let sim = self.shared.sim.lock();
        let connections: HashSet<u8> = sim
            .connections
            .iter()
            .filter(|(_, addr)| **addr == address)
            .map(|(c, _)| *c)
            .collect();
        sim.sent
            .iter()
            .filter_map(|c| match c {
                Command::AttWriteCommand {
                    connection,
                    handle: MOCK_WRITE_HANDLE,
                    data,
                } if connections.contains(connection) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// 所有写特征数据（不区分连接）
    pub fn all_writes(&self) -> Vec<Vec<u8>> {
        self.shared
            .sim
            .lock()
            .sent
            .iter()
            .filter_map(|c| match c {
                Command::AttWriteCommand {
                    handle: MOCK_WRITE_HANDLE,
                    data,
                    ..
                } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn cccd_enabled(&self, address: BdAddr) -> bool {
        match self.connection_of(address) {
            Some(c) => self.shared.sim.lock().cccd_enabled.contains(&c),
            None => false,
        }
    }

    pub fn set_version_v2(&self, v2: bool) {
        self.shared.sim.lock().version_v2 = v2;
    }

    /// 连接请求不再产生 connection_status 事件
    pub fn set_stall_connect(&self, stall: bool) {
        self.shared.sim.lock().stall_connect = stall;
    }

    /// 服务发现请求不再产生任何事件
    pub fn set_stall_discovery(&self, stall: bool) {
        self.shared.sim.lock().stall_discovery = stall;
    }

    /// 服务发现以指定错误码结束
    pub fn set_discovery_error(&self, code: Option<u16>) {
        self.shared.sim.lock().discovery_error = code;
    }

    /// 版本探测不再应答
    pub fn set_ignore_probe(&self, ignore: bool) {
        self.shared.sim.lock().ignore_probe = ignore;
    }

    /// 所有命令都不应答（模拟无响应的串口）
    pub fn set_silent(&self, silent: bool) {
        self.shared.sim.lock().silent = silent;
    }

    pub fn set_read_value(&self, handle: u16, value: Vec<u8>) {
        self.shared.sim.lock().read_values.insert(handle, value);
    }

    /// 模拟 Dongle 的属性表（handle, 类型 UUID）
    fn attributes() -> Vec<(u16, Uuid)> {
        vec![
            (0x0001, uuid_from_u16(PRIMARY_SERVICE_UUID16)),
            (0x0002, uuid_from_u16(CHARACTERISTIC_DECLARATION_UUID16)),
            (0x0003, uuid_from_u16(0x2A00)),
            (0x000C, uuid_from_u16(PRIMARY_SERVICE_UUID16)),
            (0x000D, uuid_from_u16(CHARACTERISTIC_DECLARATION_UUID16)),
            (MOCK_WRITE_HANDLE, WRITE_CHARACTERISTIC_UUID),
            (0x000F, uuid_from_u16(CHARACTERISTIC_DECLARATION_UUID16)),
            (MOCK_NOTIFY_HANDLE, NOTIFY_CHARACTERISTIC_UUID),
            (MOCK_CCCD_HANDLE, uuid_from_u16(CCCD_UUID16)),
        ]
    }

    /// 根据命令生成应答（响应在前，事件在后）
    fn respond(&self, command: &Command) -> Vec<Message> {
        let mut sim = self.shared.sim.lock();
        sim.sent.push(command.clone());
        if sim.silent {
            return Vec::new();
        }

        let mut out = Vec::new();
        match command {
            Command::SystemGetInfo => {
                out.push(Message::Response(Response::SystemInfo(SystemInfo {
                    major: 1,
                    minor: 4,
                    patch: 2,
                    build: 122,
                    ll_version: 2,
                    protocol_version: 1,
                    hardware: 3,
                })));
            },
            Command::SystemReset { .. } => {},
            Command::ConnectionDisconnect { connection } => {
                let existed = sim.connections.remove(connection).is_some();
                sim.cccd_enabled.remove(connection);
                out.push(Message::Response(Response::ConnectionDisconnect {
                    connection: *connection,
                    result: if existed { 0 } else { 0x0186 },
                }));
                if existed {
                    out.push(Message::Event(Event::ConnectionDisconnected {
                        connection: *connection,
                        reason: 0x0216,
                    }));
                }
            },
            Command::GapSetScanParameters { .. } => {
                out.push(Message::Response(Response::Gap {
                    id: ids::GAP_SET_SCAN_PARAMETERS,
                    result: 0,
                }));
            },
            Command::GapDiscover { .. } => {
                out.push(Message::Response(Response::Gap {
                    id: ids::GAP_DISCOVER,
                    result: 0,
                }));
            },
            Command::GapEndProcedure => {
                out.push(Message::Response(Response::Gap {
                    id: ids::GAP_END_PROCEDURE,
                    result: 0,
                }));
            },
            Command::GapConnectDirect {
                address,
                address_type,
                interval_min,
                timeout,
                latency,
                ..
            } => {
                let connection = sim.next_connection;
                sim.next_connection = sim.next_connection.wrapping_add(1);
                out.push(Message::Response(Response::GapConnectDirect {
                    result: 0,
                    connection,
                }));
                if !sim.stall_connect && sim.known.contains(address) {
                    sim.connections.insert(connection, *address);
                    out.push(Message::Event(Event::ConnectionStatus {
                        connection,
                        flags: CONNECTION_FLAGS_ESTABLISHED,
                        address: *address,
                        address_type: *address_type,
                        interval: *interval_min,
                        timeout: *timeout,
                        latency: *latency,
                        bonding: 0xFF,
                    }));
                }
            },
            Command::AttReadByGroupType { connection, .. } => {
                out.push(Message::Response(Response::AttClient {
                    id: ids::ATTCLIENT_READ_BY_GROUP_TYPE,
                    connection: *connection,
                    result: 0,
                }));
                if sim.stall_discovery {
                    return out;
                }
                if let Some(code) = sim.discovery_error {
                    out.push(Message::Event(Event::AttProcedureCompleted {
                        connection: *connection,
                        result: code,
                        handle: 0,
                    }));
                    return out;
                }
                // 故意倒序上报，适配器需自行排序
                out.push(Message::Event(Event::AttGroupFound {
                    connection: *connection,
                    start: MOCK_VENDOR_SERVICE.0,
                    end: MOCK_VENDOR_SERVICE.1,
                    uuid: uuid_to_le_bytes(&SERVICE_UUID),
                }));
                out.push(Message::Event(Event::AttGroupFound {
                    connection: *connection,
                    start: MOCK_GA_SERVICE.0,
                    end: MOCK_GA_SERVICE.1,
                    uuid: 0x1800u16.to_le_bytes().to_vec(),
                }));
                out.push(Message::Event(Event::AttProcedureCompleted {
                    connection: *connection,
                    result: 0,
                    handle: MOCK_VENDOR_SERVICE.1,
                }));
            },
            Command::AttFindInformation {
                connection,
                start,
                end,
            } => {
                out.push(Message::Response(Response::AttClient {
                    id: ids::ATTCLIENT_FIND_INFORMATION,
                    connection: *connection,
                    result: 0,
                }));
                for (handle, uuid) in Self::attributes() {
                    if handle >= *start && handle <= *end {
                        out.push(Message::Event(Event::AttFindInformationFound {
                            connection: *connection,
                            handle,
                            uuid: uuid_to_le_bytes(&uuid),
                        }));
                    }
                }
                out.push(Message::Event(Event::AttProcedureCompleted {
                    connection: *connection,
                    result: 0,
                    handle: *start,
                }));
            },
            Command::AttAttributeWrite {
                connection,
                handle,
                data,
            } => {
                if *handle == MOCK_CCCD_HANDLE {
                    if data.as_slice() == CCCD_ENABLE_NOTIFY {
                        sim.cccd_enabled.insert(*connection);
                    } else {
                        sim.cccd_enabled.remove(connection);
                    }
                }
                out.push(Message::Response(Response::AttClient {
                    id: ids::ATTCLIENT_ATTRIBUTE_WRITE,
                    connection: *connection,
                    result: 0,
                }));
                out.push(Message::Event(Event::AttProcedureCompleted {
                    connection: *connection,
                    result: 0,
                    handle: *handle,
                }));
            },
            Command::AttWriteCommand {
                connection,
                handle,
                data,
            } => {
                out.push(Message::Response(Response::AttClient {
                    id: ids::ATTCLIENT_WRITE_COMMAND,
                    connection: *connection,
                    result: 0,
                }));
                if *handle == MOCK_WRITE_HANDLE && is_probe(data) && !sim.ignore_probe {
                    out.push(Message::Event(Event::AttAttributeValue {
                        connection: *connection,
                        handle: MOCK_NOTIFY_HANDLE,
                        kind: 1,
                        value: version_response(sim.version_v2),
                    }));
                }
            },
            Command::AttReadByHandle { connection, handle } => {
                out.push(Message::Response(Response::AttClient {
                    id: ids::ATTCLIENT_READ_BY_HANDLE,
                    connection: *connection,
                    result: 0,
                }));
                let value = sim.read_values.get(handle).cloned().unwrap_or_else(|| vec![0x42]);
                out.push(Message::Event(Event::AttAttributeValue {
                    connection: *connection,
                    handle: *handle,
                    kind: 0,
                    value,
                }));
            },
        }
        out
    }
}

impl DongleLink for MockDongle {
    type Rx = MockDongleRx;
    type Tx = MockDongleTx;

    fn describe(&self) -> String {
        "mock-dongle".to_string()
    }

    fn split(self) -> Result<(Self::Rx, Self::Tx), TransportError> {
        Ok((
            MockDongleRx {
                inbox: self.shared.inbox_rx.clone(),
            },
            MockDongleTx { dongle: self },
        ))
    }
}

/// Mock Dongle 接收端
pub struct MockDongleRx {
    inbox: Receiver<DongleInbound>,
}

impl DongleRx for MockDongleRx {
    fn receive(&mut self) -> Result<Message, TransportError> {
        match self.inbox.recv_timeout(Duration::from_millis(20)) {
            Ok(DongleInbound::Message(message)) => Ok(message),
            Ok(DongleInbound::Fail) => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock dongle unplugged",
            ))),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }
}

/// Mock Dongle 发送端
pub struct MockDongleTx {
    dongle: MockDongle,
}

impl DongleTx for MockDongleTx {
    fn send(&mut self, command: &Command) -> Result<(), TransportError> {
        for message in self.dongle.respond(command) {
            self.dongle.push(message);
        }
        Ok(())
    }
}

// ============================================================================
// MockBus
// ============================================================================

/// 记录的总线调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCall {
    StartDiscovery(String),
    StopDiscovery(String),
    Connect(String),
    Disconnect(String),
    StartNotify(String),
    StopNotify(String),
    Write { path: String, value: Vec<u8> },
    Shutdown,
}

struct MockBusDevice {
    properties: DeviceProperties,
    connected: bool,
}

struct BusSim {
    adapters: Vec<String>,
    devices: BTreeMap<String, MockBusDevice>,
    calls: Vec<BusCall>,
    version_v2: bool,
    ignore_probe: bool,
    fail_connect: bool,
}

struct MockBusShared {
    sim: Mutex<BusSim>,
    handler: Mutex<Option<SignalHandler>>,
}

/// 模拟系统蓝牙服务
#[derive(Clone)]
pub struct MockBus {
    shared: Arc<MockBusShared>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    /// 默认带一个无线电适配器 `/org/bluez/hci0`
    pub fn new() -> Self {
        Self::with_adapters(vec!["/org/bluez/hci0".to_string()])
    }

    /// 没有任何无线电适配器
    pub fn without_adapter() -> Self {
        Self::with_adapters(Vec::new())
    }

    pub fn with_adapters(adapters: Vec<String>) -> Self {
        Self {
            shared: Arc::new(MockBusShared {
                sim: Mutex::new(BusSim {
                    adapters,
                    devices: BTreeMap::new(),
                    calls: Vec::new(),
                    version_v2: true,
                    ignore_probe: false,
                    fail_connect: false,
                }),
                handler: Mutex::new(None),
            }),
        }
    }

    /// 写特征路径
    pub fn write_path(device: &str) -> String {
        format!("{}/service000c/char000d", device)
    }

    /// 通知特征路径
    pub fn notify_path(device: &str) -> String {
        format!("{}/service000c/char000f", device)
    }

    /// 设备路径（`/org/bluez/hci0/dev_XX_XX_...`）
    pub fn device_path(address: &str) -> String {
        format!("/org/bluez/hci0/dev_{}", address.replace(':', "_"))
    }

    fn emit(&self, signal: BusSignal) {
        let handler = self.shared.handler.lock().clone();
        if let Some(handler) = handler {
            handler(signal);
        }
    }

    fn record(&self, call: BusCall) {
        self.shared.sim.lock().calls.push(call);
    }

    /// 添加一个带厂商服务的设备
    pub fn add_device(&self, path: &str, name: &str, rssi: i16) {
        self.add_device_with(
            path,
            DeviceProperties {
                name: Some(name.to_string()),
                address: None,
                rssi: Some(rssi),
                connected: Some(false),
                service_uuids: vec![SERVICE_UUID],
            },
        );
    }

    pub fn add_device_with(&self, path: &str, properties: DeviceProperties) {
        let connected = properties.connected.unwrap_or(false);
        self.shared.sim.lock().devices.insert(
            path.to_string(),
            MockBusDevice {
                properties: properties.clone(),
                connected,
            },
        );
        self.emit(BusSignal::DeviceAppeared {
            path: path.to_string(),
            properties,
        });
    }

    /// 只放入对象表，不发信号（模拟启动前已存在的设备）
    pub fn preload_device(&self, path: &str, properties: DeviceProperties) {
        let connected = properties.connected.unwrap_or(false);
        self.shared.sim.lock().devices.insert(
            path.to_string(),
            MockBusDevice {
                properties,
                connected,
            },
        );
    }

    pub fn set_rssi(&self, path: &str, rssi: i16) {
        if let Some(device) = self.shared.sim.lock().devices.get_mut(path) {
            device.properties.rssi = Some(rssi);
        }
        self.emit(BusSignal::DevicePropertiesChanged {
            path: path.to_string(),
            properties: DeviceProperties {
                rssi: Some(rssi),
                ..Default::default()
            },
        });
    }

    /// 设备对象从总线上消失
    pub fn remove_device(&self, path: &str) {
        self.shared.sim.lock().devices.remove(path);
        self.emit(BusSignal::DeviceVanished {
            path: path.to_string(),
        });
    }

    /// 对象表里删除设备但不发信号（模拟错过的移除信号）
    pub fn forget_device(&self, path: &str) {
        self.shared.sim.lock().devices.remove(path);
    }

    pub fn drop_link(&self, path: &str) {
        if let Some(device) = self.shared.sim.lock().devices.get_mut(path) {
            device.connected = false;
        }
        self.emit(BusSignal::DevicePropertiesChanged {
            path: path.to_string(),
            properties: DeviceProperties {
                connected: Some(false),
                ..Default::default()
            },
        });
    }

    pub fn notify(&self, device: &str, value: &[u8]) {
        self.emit(BusSignal::ValueChanged {
            path: Self::notify_path(device),
            value: value.to_vec(),
        });
    }

    pub fn calls(&self) -> Vec<BusCall> {
        self.shared.sim.lock().calls.clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&BusCall) -> bool) -> usize {
        self.shared.sim.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    /// 写入某特征的全部数据
    pub fn writes_to(&self, characteristic: &str) -> Vec<Vec<u8>> {
        self.shared
            .sim
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                BusCall::Write { path, value } if path == characteristic => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn set_version_v2(&self, v2: bool) {
        self.shared.sim.lock().version_v2 = v2;
    }

    pub fn set_ignore_probe(&self, ignore: bool) {
        self.shared.sim.lock().ignore_probe = ignore;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.shared.sim.lock().fail_connect = fail;
    }

    pub fn has_handler(&self) -> bool {
        self.shared.handler.lock().is_some()
    }

    fn characteristics(device: &str) -> [(String, Uuid); 2] {
        [
            (Self::write_path(device), WRITE_CHARACTERISTIC_UUID),
            (Self::notify_path(device), NOTIFY_CHARACTERISTIC_UUID),
        ]
    }
}

fn not_found(path: &str) -> TransportError {
    TransportDeviceError::new(TransportDeviceErrorKind::NotFound, path.to_string()).into()
}

impl SystemBus for MockBus {
    fn adapters(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.shared.sim.lock().adapters.clone())
    }

    fn start_discovery(&self, adapter: &str) -> Result<(), TransportError> {
        self.record(BusCall::StartDiscovery(adapter.to_string()));
        Ok(())
    }

    fn stop_discovery(&self, adapter: &str) -> Result<(), TransportError> {
        self.record(BusCall::StopDiscovery(adapter.to_string()));
        Ok(())
    }

    fn managed_objects(&self) -> Result<Vec<BusObject>, TransportError> {
        let sim = self.shared.sim.lock();
        let mut objects: Vec<BusObject> = sim
            .adapters
            .iter()
            .map(|path| BusObject::Adapter { path: path.clone() })
            .collect();
        for (path, device) in &sim.devices {
            objects.push(BusObject::Device {
                path: path.clone(),
                properties: DeviceProperties {
                    connected: Some(device.connected),
                    ..device.properties.clone()
                },
            });
            if device.connected {
                for (char_path, uuid) in Self::characteristics(path) {
                    objects.push(BusObject::Characteristic {
                        path: char_path,
                        device_path: path.clone(),
                        uuid,
                    });
                }
            }
        }
        Ok(objects)
    }

    fn device_exists(&self, device: &str) -> Result<bool, TransportError> {
        Ok(self.shared.sim.lock().devices.contains_key(device))
    }

    fn connect(&self, device: &str) -> Result<(), TransportError> {
        {
            let mut sim = self.shared.sim.lock();
            sim.calls.push(BusCall::Connect(device.to_string()));
            if sim.fail_connect {
                return Err(TransportDeviceError::new(
                    TransportDeviceErrorKind::Backend,
                    "le-connection-abort-by-local",
                )
                .into());
            }
            match sim.devices.get_mut(device) {
                Some(d) => d.connected = true,
                None => return Err(not_found(device)),
            }
        }
        // 服务解析完成后特征值对象出现
        for (path, uuid) in Self::characteristics(device) {
            self.emit(BusSignal::CharacteristicAppeared {
                path,
                device_path: device.to_string(),
                uuid,
            });
        }
        Ok(())
    }

    fn disconnect(&self, device: &str) -> Result<(), TransportError> {
        let was_connected = {
            let mut sim = self.shared.sim.lock();
            sim.calls.push(BusCall::Disconnect(device.to_string()));
            match sim.devices.get_mut(device) {
                Some(d) => std::mem::replace(&mut d.connected, false),
                None => return Err(not_found(device)),
            }
        };
        if was_connected {
            self.emit(BusSignal::DevicePropertiesChanged {
                path: device.to_string(),
                properties: DeviceProperties {
                    connected: Some(false),
                    ..Default::default()
                },
            });
        }
        Ok(())
    }

    fn start_notify(&self, characteristic: &str) -> Result<(), TransportError> {
        self.record(BusCall::StartNotify(characteristic.to_string()));
        Ok(())
    }

    fn stop_notify(&self, characteristic: &str) -> Result<(), TransportError> {
        self.record(BusCall::StopNotify(characteristic.to_string()));
        Ok(())
    }

    fn write_value(&self, characteristic: &str, value: &[u8]) -> Result<(), TransportError> {
        let answer = {
            let mut sim = self.shared.sim.lock();
            sim.calls.push(BusCall::Write {
                path: characteristic.to_string(),
                value: value.to_vec(),
            });
            if is_probe(value) && !sim.ignore_probe && characteristic.ends_with("/char000d") {
                let device = characteristic.trim_end_matches("/service000c/char000d").to_string();
                Some((device, version_response(sim.version_v2)))
            } else {
                None
            }
        };
        if let Some((device, response)) = answer {
            self.emit(BusSignal::ValueChanged {
                path: Self::notify_path(&device),
                value: response,
            });
        }
        Ok(())
    }

    fn set_signal_handler(&self, handler: SignalHandler) {
        *self.shared.handler.lock() = Some(handler);
    }

    fn shutdown(&self) {
        self.record(BusCall::Shutdown);
        *self.shared.handler.lock() = None;
    }
}

// ============================================================================
// MockHelper
// ============================================================================

struct HelperSim {
    sent: Vec<String>,
    version_v2: bool,
    ignore_connect: bool,
    bluetooth_status: String,
}

struct MockHelperShared {
    sim: Mutex<HelperSim>,
    lines_tx: Sender<Option<String>>,
    lines_rx: Receiver<Option<String>>,
    alive: AtomicBool,
}

/// 模拟助手子进程
#[derive(Clone)]
pub struct MockHelper {
    shared: Arc<MockHelperShared>,
}

impl Default for MockHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHelper {
    pub fn new() -> Self {
        let (lines_tx, lines_rx) = unbounded();
        Self {
            shared: Arc::new(MockHelperShared {
                sim: Mutex::new(HelperSim {
                    sent: Vec::new(),
                    version_v2: true,
                    ignore_connect: false,
                    bluetooth_status: "on".to_string(),
                }),
                lines_tx,
                lines_rx,
                alive: AtomicBool::new(true),
            }),
        }
    }

    /// 生成交给适配器的三端链路
    pub fn channel(&self) -> HelperChannel {
        HelperChannel {
            source: Box::new(MockLineSource {
                lines: self.shared.lines_rx.clone(),
            }),
            sink: Box::new(MockLineSink {
                helper: self.clone(),
            }),
            control: Box::new(MockControl {
                helper: self.clone(),
            }),
        }
    }

    /// 注入一行原始输出
    pub fn emit_line(&self, line: impl Into<String>) {
        let _ = self.shared.lines_tx.send(Some(line.into()));
    }

    pub fn discover(&self, name: &str, rssi: i16) {
        self.emit_line(format!(
            r#"{{"packetType":"discovery","name":"{}","rssi":{}}}"#,
            name, rssi
        ));
    }

    /// 以破折号十六进制格式上报通知
    pub fn notify(&self, name: &str, data: &[u8]) {
        let hex: Vec<String> = data.iter().map(|b| format!("{:02X}", b)).collect();
        self.emit_line(format!(
            r#"{{"packetType":"notification","peripheral":"{}","data":"{}"}}"#,
            name,
            hex.join("-")
        ));
    }

    pub fn drop_link(&self, name: &str) {
        self.emit_line(format!(
            r#"{{"packetType":"connection","status":"deviceDisconnected","peripheral":"{}"}}"#,
            name
        ));
    }

    pub fn set_bluetooth_state(&self, status: &str) {
        self.shared.sim.lock().bluetooth_status = status.to_string();
        self.emit_line(format!(
            r#"{{"packetType":"bluetoothState","status":"{}"}}"#,
            status
        ));
    }

    /// 子进程输出结束（EOF）
    pub fn close(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        let _ = self.shared.lines_tx.send(None);
    }

    pub fn sent_lines(&self) -> Vec<String> {
        self.shared.sim.lock().sent.clone()
    }

    pub fn count_sent(&self, predicate: impl Fn(&str) -> bool) -> usize {
        self.shared.sim.lock().sent.iter().filter(|l| predicate(l)).count()
    }

    pub fn set_version_v2(&self, v2: bool) {
        self.shared.sim.lock().version_v2 = v2;
    }

    /// `connect` 命令不再应答
    pub fn set_ignore_connect(&self, ignore: bool) {
        self.shared.sim.lock().ignore_connect = ignore;
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    fn handle_command(&self, line: &str) {
        let replies = {
            let mut sim = self.shared.sim.lock();
            sim.sent.push(line.to_string());
            let mut replies = Vec::new();
            let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
            match verb {
                "startScan" => replies.push(Some(format!(
                    r#"{{"packetType":"bluetoothState","status":"{}"}}"#,
                    sim.bluetooth_status
                ))),
                "connect" if !sim.ignore_connect => replies.push(Some(format!(
                    r#"{{"packetType":"connection","status":"connected","peripheral":"{}","hasV2":"{}"}}"#,
                    rest,
                    if sim.version_v2 { "True" } else { "False" }
                ))),
                "disconnect" => replies.push(Some(format!(
                    r#"{{"packetType":"connection","status":"userDisconnected","peripheral":"{}"}}"#,
                    rest
                ))),
                "quit" => replies.push(None),
                _ => {},
            }
            replies
        };
        for reply in replies {
            if reply.is_none() {
                self.shared.alive.store(false, Ordering::SeqCst);
            }
            let _ = self.shared.lines_tx.send(reply);
        }
    }
}

struct MockLineSource {
    lines: Receiver<Option<String>>,
}

impl LineSource for MockLineSource {
    fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        match self.lines.recv() {
            Ok(line) => Ok(line),
            Err(_) => Ok(None),
        }
    }
}

struct MockLineSink {
    helper: MockHelper,
}

impl LineSink for MockLineSink {
    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        if !self.helper.is_alive() {
            return Err(TransportError::Closed);
        }
        self.helper.handle_command(line);
        Ok(())
    }
}

struct MockControl {
    helper: MockHelper,
}

impl ProcessControl for MockControl {
    fn is_alive(&mut self) -> bool {
        self.helper.is_alive()
    }

    fn terminate(&mut self, _grace: Duration) -> Result<(), TransportError> {
        if self.helper.is_alive() {
            self.helper.close();
        }
        Ok(())
    }
}
