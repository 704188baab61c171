//! Dongle 适配器（BGAPI 串口协议）
//!
//! 线程模型：
//!
//! ```text
//! 读线程:   DongleRx::receive() -> 完成同步读 -> 投递 dispatch(Message)
//! 工作线程: 独占设备表、过程状态和发送端
//! 定时器:   看门狗到期只投递工作
//! ```
//!
//! Dongle 一次只能执行一个连接/服务发现过程，其余连接请求在 FIFO 中等待，
//! 过程真正开始时才启动看门狗。

use crate::communicator::{Backend, Communicator, CommunicatorEvents, DisconnectReason};
use crate::config::{CommunicatorConfig, DongleConfig};
use crate::device::{ChannelId, ChannelKind, DeviceRecord, DeviceRegistry, DeviceState};
use crate::error::DriverError;
use crate::runtime::{AdapterRuntime, WorkQueue};
use crate::session::{GattLink, Session, WatchdogSink};
use bluebird_protocol::bgapi::{
    BdAddr, CONNECTION_FLAG_CONNECTED, Command, DiscoverMode, Event, Message, Response, SystemInfo,
    advertised_name, ids,
};
use bluebird_protocol::{
    CCCD_DISABLE, CCCD_ENABLE_NOTIFY, CCCD_UUID16, NOTIFY_CHARACTERISTIC_UUID,
    PRIMARY_SERVICE_UUID16, WRITE_CHARACTERISTIC_UUID, is_supported_name, uuid_from_le_bytes,
    uuid_from_u16,
};
use bluebird_transport::{DongleLink, DongleRx, DongleTx, TransportError};
use crossbeam_channel::{Sender, bounded};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// 属性句柄最大值
const LAST_HANDLE: u16 = 0xFFFF;

/// Dongle 在无进行中过程时结束过程返回的错误码
const RESULT_DEVICE_IN_WRONG_STATE: u16 = 0x0181;

/// 结果码（十六进制显示）
struct ResultCode(u16);

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Dongle 记录的链路数据
#[derive(Debug, Clone)]
pub struct DongleLinkData {
    pub address: BdAddr,
    pub address_type: u8,
    /// 已建立的连接句柄
    pub connection: Option<u8>,
    /// 通知特征的 CCCD 句柄
    pub cccd: Option<u16>,
    /// 已发出直连请求、尚未建立链路
    pub connecting: bool,
}

impl DongleLinkData {
    fn new(address: BdAddr, address_type: u8) -> Self {
        Self {
            address,
            address_type,
            connection: None,
            cccd: None,
            connecting: false,
        }
    }
}

// ============================================================================
// 同步读
// ============================================================================

enum ReadOutcome {
    Value(Vec<u8>),
    Failed(u16),
    Unavailable(DriverError),
}

struct PendingRead {
    connection: Option<u8>,
    handle: u16,
    outcome: Option<ReadOutcome>,
}

/// 同步读等待槽：调用线程阻塞在条件变量上，读线程直接完成
#[derive(Default)]
struct ReadSlot {
    pending: Mutex<Option<PendingRead>>,
    ready: Condvar,
    /// 串行化同步读
    serial: Mutex<()>,
}

impl ReadSlot {
    fn complete(&self, outcome: ReadOutcome) {
        let mut pending = self.pending.lock();
        if let Some(read) = pending.as_mut()
            && read.outcome.is_none()
        {
            read.outcome = Some(outcome);
            self.ready.notify_all();
        }
    }

    /// 工作线程解析出连接句柄后登记
    fn bind(&self, connection: u8) {
        if let Some(read) = self.pending.lock().as_mut() {
            read.connection = Some(connection);
        }
    }

    /// 读线程：检查消息是否完成了挂起的读
    fn offer(&self, message: &Message) {
        let mut pending = self.pending.lock();
        let Some(read) = pending.as_mut() else {
            return;
        };
        let Some(expected) = read.connection else {
            return;
        };
        if read.outcome.is_some() {
            return;
        }
        let outcome = match message {
            Message::Event(Event::AttAttributeValue {
                connection,
                handle,
                kind: 0,
                value,
            }) if *connection == expected && *handle == read.handle => {
                ReadOutcome::Value(value.clone())
            },
            Message::Event(Event::AttProcedureCompleted {
                connection, result, ..
            }) if *connection == expected && *result != 0 => ReadOutcome::Failed(*result),
            Message::Response(Response::AttClient {
                id: ids::ATTCLIENT_READ_BY_HANDLE,
                connection,
                result,
            }) if *connection == expected && *result != 0 => ReadOutcome::Failed(*result),
            _ => return,
        };
        read.outcome = Some(outcome);
        self.ready.notify_all();
    }
}

// ============================================================================
// GATT 写入端
// ============================================================================

/// 工作线程持有的发送端
struct DongleGatt {
    tx: Box<dyn DongleTx>,
    /// 本轮被关闭链路的设备键，由 `settle` 统一清理适配器表
    closed: Vec<String>,
}

impl DongleGatt {
    fn send(&mut self, command: Command) -> Result<(), DriverError> {
        trace!(?command, "dongle tx");
        self.tx.send(&command).map_err(DriverError::from)
    }

    /// 发送失败只记录日志
    fn send_logged(&mut self, command: Command) {
        let (class, id) = command.class_id();
        if let Err(e) = self.send(command) {
            warn!(?class, id, error = %e, "dongle command failed");
        }
    }
}

fn connection_of(record: &DeviceRecord<DongleLinkData>) -> Result<u8, DriverError> {
    record
        .link
        .connection
        .ok_or_else(|| DriverError::NotConnected(record.name.clone()))
}

fn handle_of(channel: &ChannelId) -> Result<u16, DriverError> {
    match channel {
        ChannelId::Handle(handle) => Ok(*handle),
        other => Err(DriverError::InvalidInput(format!(
            "not an attribute handle: {:?}",
            other
        ))),
    }
}

impl GattLink<DongleLinkData> for DongleGatt {
    fn write(
        &mut self,
        record: &DeviceRecord<DongleLinkData>,
        channel: &ChannelId,
        data: &[u8],
    ) -> Result<(), DriverError> {
        let connection = connection_of(record)?;
        let handle = handle_of(channel)?;
        self.send(Command::AttWriteCommand {
            connection,
            handle,
            data: data.to_vec(),
        })
    }

    fn set_notify(
        &mut self,
        record: &DeviceRecord<DongleLinkData>,
        channel: &ChannelId,
        enable: bool,
    ) -> Result<(), DriverError> {
        let connection = connection_of(record)?;
        let handle = match record.link.cccd {
            Some(cccd) => cccd,
            None => handle_of(channel)? + 1,
        };
        let data = if enable { CCCD_ENABLE_NOTIFY } else { CCCD_DISABLE };
        self.send(Command::AttAttributeWrite {
            connection,
            handle,
            data: data.to_vec(),
        })
    }

    fn close_link(
        &mut self,
        record: &DeviceRecord<DongleLinkData>,
        reason: DisconnectReason,
    ) -> Result<(), DriverError> {
        self.closed.push(record.key.clone());
        if reason == DisconnectReason::LinkLost {
            return Ok(());
        }
        match record.link.connection {
            Some(connection) => self.send(Command::ConnectionDisconnect { connection }),
            // 直连请求尚未完成：结束 GAP 过程即可取消
            None if record.link.connecting => self.send(Command::GapEndProcedure),
            None => Ok(()),
        }
    }
}

// ============================================================================
// 连接过程
// ============================================================================

#[derive(Debug)]
enum Phase {
    /// 已发出直连请求
    Connecting,
    /// 读取主服务
    Services { groups: Vec<(u16, u16)> },
    /// 按服务窗口枚举属性
    Characteristics {
        windows: Vec<(u16, u16)>,
        index: usize,
        attributes: Vec<(u16, Uuid)>,
    },
    /// 通道已提交，等待版本响应
    Session,
}

#[derive(Debug)]
struct Procedure {
    key: String,
    connection: Option<u8>,
    phase: Phase,
}

/// 按起始句柄排序后计算每个服务的属性窗口
///
/// 窗口结束于下一个服务起始句柄减一，最后一个服务结束于 0xFFFF。
fn service_windows(groups: &[(u16, u16)]) -> Vec<(u16, u16)> {
    let mut starts: Vec<u16> = groups.iter().map(|(start, _)| *start).collect();
    starts.sort_unstable();
    starts.dedup();
    starts
        .iter()
        .enumerate()
        .map(|(i, start)| {
            let end = starts
                .get(i + 1)
                .map(|next| next.saturating_sub(1))
                .unwrap_or(LAST_HANDLE);
            (*start, end)
        })
        .collect()
}

/// 从属性表中找出写句柄、通知句柄和通知 CCCD 句柄
fn resolve_handles(attributes: &[(u16, Uuid)]) -> Option<(u16, u16, u16)> {
    let write = attributes
        .iter()
        .find(|(_, uuid)| *uuid == WRITE_CHARACTERISTIC_UUID)?
        .0;
    let notify = attributes
        .iter()
        .find(|(_, uuid)| *uuid == NOTIFY_CHARACTERISTIC_UUID)?
        .0;
    let cccd_uuid = uuid_from_u16(CCCD_UUID16);
    let cccd = attributes
        .iter()
        .filter(|(handle, uuid)| *handle > notify && *uuid == cccd_uuid)
        .map(|(handle, _)| *handle)
        .min()?;
    Some((write, notify, cccd))
}

// ============================================================================
// 工作线程状态
// ============================================================================

struct DongleState {
    session: Session<DongleLinkData>,
    gatt: DongleGatt,
    config: DongleConfig,
    /// 连接句柄 -> 设备键
    connections: HashMap<u8, String>,
    /// 等待执行连接过程的设备
    pending: VecDeque<String>,
    procedure: Option<Procedure>,
    scanning: bool,
    reads: Arc<ReadSlot>,
    init_tx: Option<Sender<SystemInfo>>,
}

impl DongleState {
    fn events(&self) -> Arc<dyn CommunicatorEvents> {
        self.session.events().clone()
    }

    // ------------------------------------------------------------------------
    // 初始化与扫描
    // ------------------------------------------------------------------------

    /// 链路状态复位后查询固件信息
    fn initialize(&mut self) {
        self.gatt.send_logged(Command::GapEndProcedure);
        for connection in 0..self.config.max_connections {
            self.gatt
                .send_logged(Command::ConnectionDisconnect { connection });
        }
        self.gatt.send_logged(Command::SystemGetInfo);
    }

    fn start_discovery(&mut self) {
        if self.scanning {
            let count = self.session.report_idle();
            debug!(count, "scan already active, re-reported known devices");
            return;
        }
        if self.procedure.is_none() {
            self.gatt.send_logged(Command::GapEndProcedure);
        } else {
            debug!("connection in progress, scan procedure not reset");
        }
        let cleared = self.session.registry.clear_idle();
        trace!(cleared, "idle devices cleared");
        let scan = self.config.scan;
        self.gatt.send_logged(Command::GapSetScanParameters {
            interval: scan.interval,
            window: scan.window,
            active: scan.active,
        });
        self.gatt.send_logged(Command::GapDiscover {
            mode: DiscoverMode::Generic,
        });
        self.scanning = true;
        info!("dongle scan started");
        self.events().scan_status_changed(true);
    }

    fn stop_discovery(&mut self) {
        if !self.scanning {
            info!("stop discovery: not scanning");
            return;
        }
        self.end_scan();
    }

    fn end_scan(&mut self) {
        self.gatt.send_logged(Command::GapEndProcedure);
        self.scanning = false;
        info!("dongle scan stopped");
        self.events().scan_status_changed(false);
    }

    // ------------------------------------------------------------------------
    // 连接请求
    // ------------------------------------------------------------------------

    fn request_connection(&mut self, name: &str) {
        if let Some(key) = self.session.request_connect(name) {
            self.pending.push_back(key);
            self.start_next_procedure();
        }
    }

    fn start_next_procedure(&mut self) {
        if self.procedure.is_some() {
            return;
        }
        while let Some(key) = self.pending.pop_front() {
            if self.session.state_of(&key) != Some(DeviceState::ConnectingBegin) {
                continue;
            }
            if self.scanning {
                self.end_scan();
            }
            let params = self.config.connection;
            let Some(record) = self.session.registry.get_mut(&key) else {
                continue;
            };
            record.link.connecting = true;
            let command = Command::GapConnectDirect {
                address: record.link.address,
                address_type: params.address_type,
                interval_min: params.interval_min,
                interval_max: params.interval_max,
                timeout: params.timeout,
                latency: params.latency,
            };
            info!(device = %record.name, address = %record.link.address, "connect procedure started");
            self.procedure = Some(Procedure {
                key: key.clone(),
                connection: None,
                phase: Phase::Connecting,
            });
            self.session.arm_watchdog(&key);
            if let Err(e) = self.gatt.send(command) {
                warn!(key = %key, error = %e, "connect request failed");
                self.session
                    .disconnect(&mut self.gatt, &key, DisconnectReason::ConnectFailed);
                self.settle();
                continue;
            }
            return;
        }
    }

    fn cancel(&mut self) {
        if self.scanning {
            self.end_scan();
        }
        let mut keys: Vec<String> = self.pending.drain(..).collect();
        if let Some(procedure) = self.procedure.as_ref() {
            keys.insert(0, procedure.key.clone());
        }
        for key in keys {
            self.session
                .disconnect(&mut self.gatt, &key, DisconnectReason::Cancelled);
        }
        self.settle();
    }

    /// 清理被断开设备在适配器表中的痕迹，并推进连接 FIFO
    fn settle(&mut self) {
        for key in std::mem::take(&mut self.gatt.closed) {
            self.pending.retain(|k| k != &key);
            self.connections.retain(|_, k| *k != key);
            if let Some(record) = self.session.registry.get_mut(&key) {
                record.link.connection = None;
                record.link.connecting = false;
                record.link.cccd = None;
            }
        }
        if let Some(procedure) = self.procedure.as_ref() {
            let active = self
                .session
                .state_of(&procedure.key)
                .is_some_and(DeviceState::is_connecting);
            if !active {
                trace!(key = %procedure.key, "procedure finished");
                self.procedure = None;
            }
        }
        self.start_next_procedure();
    }

    // ------------------------------------------------------------------------
    // 消息分发
    // ------------------------------------------------------------------------

    fn dispatch(&mut self, message: Message) {
        match message {
            Message::Response(response) => self.on_response(response),
            Message::Event(event) => self.on_event(event),
        }
        self.settle();
    }

    fn on_response(&mut self, response: Response) {
        match response {
            Response::SystemInfo(info) => {
                info!(firmware = %info, "dongle ready");
                if let Some(tx) = self.init_tx.take() {
                    let _ = tx.send(info);
                }
            },
            Response::GapConnectDirect { result, connection } => {
                let Some(procedure) = self.procedure.as_mut() else {
                    return;
                };
                if result != 0 {
                    let key = procedure.key.clone();
                    warn!(key = %key, result = %ResultCode(result), "connect rejected");
                    self.session
                        .disconnect(&mut self.gatt, &key, DisconnectReason::ProtocolError(result));
                } else {
                    procedure.connection = Some(connection);
                }
            },
            Response::AttClient {
                id,
                connection,
                result,
            } if result != 0 => self.on_att_failure(connection, result, id),
            Response::Gap { id, result } if result != 0 => {
                if id == ids::GAP_END_PROCEDURE && result == RESULT_DEVICE_IN_WRONG_STATE {
                    trace!("no procedure to end");
                } else {
                    warn!(id, result = %ResultCode(result), "gap command failed");
                }
            },
            Response::ConnectionDisconnect { connection, result } if result != 0 => {
                trace!(connection, result = %ResultCode(result), "no link to close");
            },
            other => trace!(?other, "dongle response"),
        }
    }

    fn on_att_failure(&mut self, connection: u8, result: u16, id: u8) {
        let in_procedure = self
            .procedure
            .as_ref()
            .is_some_and(|p| p.connection == Some(connection));
        let key = self.connections.get(&connection).cloned();
        let state = key.as_deref().and_then(|k| self.session.state_of(k));
        warn!(
            connection,
            key = key.as_deref().unwrap_or(""),
            state = ?state,
            id,
            result = %ResultCode(result),
            "attribute operation failed"
        );
        if in_procedure && let Some(key) = key {
            self.session
                .disconnect(&mut self.gatt, &key, DisconnectReason::ProtocolError(result));
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::GapScanResponse {
                rssi,
                sender,
                address_type,
                data,
                ..
            } => self.on_advertisement(sender, address_type, rssi, &data),
            Event::ConnectionStatus {
                connection,
                flags,
                address,
                ..
            } => self.on_connection_status(connection, flags, address),
            Event::ConnectionDisconnected { connection, reason } => {
                let Some(key) = self.connections.remove(&connection) else {
                    trace!(connection, "disconnect for untracked connection");
                    return;
                };
                if let Some(record) = self.session.registry.get_mut(&key) {
                    record.link.connection = None;
                }
                info!(key = %key, reason = %ResultCode(reason), "link dropped");
                self.session
                    .disconnect(&mut self.gatt, &key, DisconnectReason::LinkLost);
            },
            Event::AttGroupFound {
                connection,
                start,
                end,
                ..
            } => {
                if let Some(Phase::Services { groups }) = self.phase_for(connection) {
                    groups.push((start, end));
                }
            },
            Event::AttFindInformationFound {
                connection,
                handle,
                uuid,
            } => {
                if let Some(Phase::Characteristics { attributes, .. }) = self.phase_for(connection)
                    && let Some(uuid) = uuid_from_le_bytes(&uuid)
                {
                    attributes.push((handle, uuid));
                }
            },
            Event::AttProcedureCompleted {
                connection, result, ..
            } => self.on_procedure_completed(connection, result),
            Event::AttAttributeValue {
                connection,
                handle,
                value,
                ..
            } => {
                let Some(key) = self.connections.get(&connection).cloned() else {
                    return;
                };
                let channel = ChannelId::Handle(handle);
                if self.session.registry.key_for_notify(&channel) == Some(key.as_str()) {
                    self.session.value_received(&mut self.gatt, &key, &value);
                }
            },
            Event::SystemBoot { major, minor, .. } => {
                warn!(major, minor, "dongle rebooted");
            },
            Event::Other { class, id } => trace!(class, id, "unhandled dongle event"),
        }
    }

    fn phase_for(&mut self, connection: u8) -> Option<&mut Phase> {
        self.procedure
            .as_mut()
            .filter(|p| p.connection == Some(connection))
            .map(|p| &mut p.phase)
    }

    fn on_advertisement(&mut self, sender: BdAddr, address_type: u8, rssi: i8, data: &[u8]) {
        let Some(name) = advertised_name(data) else {
            return;
        };
        if !is_supported_name(&name) {
            return;
        }
        self.session.observe(
            &sender.to_string(),
            &name,
            Some(rssi as i16),
            data,
            || DongleLinkData::new(sender, address_type),
        );
    }

    fn on_connection_status(&mut self, connection: u8, flags: u8, address: BdAddr) {
        if flags & CONNECTION_FLAG_CONNECTED == 0 {
            return;
        }
        if self.connections.contains_key(&connection) {
            trace!(connection, flags, "connection parameters updated");
            return;
        }
        let key = match self.procedure.as_ref() {
            Some(p) if matches!(p.phase, Phase::Connecting) => p.key.clone(),
            _ => {
                warn!(connection, %address, "unexpected connection, closing");
                self.gatt
                    .send_logged(Command::ConnectionDisconnect { connection });
                return;
            },
        };
        let Some(record) = self.session.registry.get_mut(&key) else {
            return;
        };
        if record.link.address != address {
            warn!(connection, %address, expected = %record.link.address, "connection for another peer");
            self.gatt
                .send_logged(Command::ConnectionDisconnect { connection });
            return;
        }
        record.link.connection = Some(connection);
        record.link.connecting = false;
        self.connections.insert(connection, key.clone());
        if !self.session.link_established(&key) {
            return;
        }
        if let Some(procedure) = self.procedure.as_mut() {
            procedure.connection = Some(connection);
            procedure.phase = Phase::Services { groups: Vec::new() };
        }
        self.gatt.send_logged(Command::AttReadByGroupType {
            connection,
            start: 1,
            end: LAST_HANDLE,
            group: uuid_from_u16(PRIMARY_SERVICE_UUID16),
        });
    }

    fn on_procedure_completed(&mut self, connection: u8, result: u16) {
        let Some(procedure) = self
            .procedure
            .as_mut()
            .filter(|p| p.connection == Some(connection))
        else {
            if result != 0 {
                warn!(connection, result = %ResultCode(result), "attribute procedure failed");
            }
            return;
        };
        let key = procedure.key.clone();
        if result != 0 {
            warn!(
                key = %key,
                phase = ?procedure.phase,
                result = %ResultCode(result),
                "service discovery failed"
            );
            self.session
                .disconnect(&mut self.gatt, &key, DisconnectReason::ProtocolError(result));
            return;
        }

        let next = match &mut procedure.phase {
            Phase::Services { groups } => {
                let windows = service_windows(groups);
                debug!(key = %key, services = windows.len(), "primary services found");
                windows.first().copied().map(|first| {
                    procedure.phase = Phase::Characteristics {
                        windows,
                        index: 0,
                        attributes: Vec::new(),
                    };
                    first
                })
            },
            Phase::Characteristics {
                windows,
                index,
                attributes,
            } => {
                *index += 1;
                match windows.get(*index) {
                    Some(window) => Some(*window),
                    None => {
                        let attributes = std::mem::take(attributes);
                        procedure.phase = Phase::Session;
                        self.commit_handles(&key, &attributes);
                        return;
                    },
                }
            },
            Phase::Connecting | Phase::Session => return,
        };

        match next {
            Some((start, end)) => self.gatt.send_logged(Command::AttFindInformation {
                connection,
                start,
                end,
            }),
            None => {
                warn!(key = %key, "no primary services");
                self.session
                    .disconnect(&mut self.gatt, &key, DisconnectReason::ConnectFailed);
            },
        }
    }

    fn commit_handles(&mut self, key: &str, attributes: &[(u16, Uuid)]) {
        let Some((write, notify, cccd)) = resolve_handles(attributes) else {
            warn!(key, attributes = attributes.len(), "vendor characteristics not found");
            self.session
                .disconnect(&mut self.gatt, key, DisconnectReason::ConnectFailed);
            return;
        };
        debug!(key, write, notify, cccd, "vendor characteristics resolved");
        if let Some(record) = self.session.registry.get_mut(key) {
            record.link.cccd = Some(cccd);
        }
        self.session
            .channel_found(&mut self.gatt, key, ChannelKind::Write, ChannelId::Handle(write));
        self.session
            .channel_found(&mut self.gatt, key, ChannelKind::Notify, ChannelId::Handle(notify));
    }

    // ------------------------------------------------------------------------
    // 其它操作
    // ------------------------------------------------------------------------

    fn watchdog(&mut self, key: &str, token: u64) {
        self.session.watchdog_fired(&mut self.gatt, key, token);
        self.settle();
    }

    fn request_disconnect(&mut self, name: &str) {
        self.session.request_disconnect(&mut self.gatt, name);
        self.settle();
    }

    fn send_command(&mut self, name: &str, data: &[u8]) {
        if let Err(e) = self.session.send(&mut self.gatt, name, data) {
            warn!(device = %name, error = %e, "command dropped");
        }
    }

    fn start_read(&mut self, name: &str, handle: u16) {
        let connection = self
            .session
            .key_for_name(name)
            .and_then(|key| self.session.registry.get(&key))
            .filter(|r| r.state == DeviceState::Connected)
            .and_then(|r| r.link.connection);
        let Some(connection) = connection else {
            self.reads
                .complete(ReadOutcome::Unavailable(DriverError::NotConnected(name.to_string())));
            return;
        };
        self.reads.bind(connection);
        if let Err(e) = self.gatt.send(Command::AttReadByHandle { connection, handle }) {
            self.reads.complete(ReadOutcome::Unavailable(e));
        }
    }

    fn transport_lost(&mut self) {
        self.scanning = false;
        error!("dongle transport lost");
        self.events().status_changed(false, false);
    }

    /// 强制断开所有设备并复位固件（kill 的最后一步）
    fn release(mut self) {
        let count = self
            .session
            .disconnect_all(&mut self.gatt, DisconnectReason::User);
        debug!(count, "devices force-disconnected");
        self.gatt
            .send_logged(Command::SystemReset { boot_to_dfu: false });
    }
}

// ============================================================================
// 读线程
// ============================================================================

fn reader_loop(
    mut rx: impl DongleRx,
    queue: Arc<WorkQueue<DongleState>>,
    reads: Arc<ReadSlot>,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Acquire) {
        match rx.receive() {
            Ok(message) => {
                reads.offer(&message);
                if !queue.push("dongle message", "", move |s: &mut DongleState| s.dispatch(message)) {
                    break;
                }
            },
            Err(TransportError::Timeout) => {},
            Err(e) if e.is_link_fatal() => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                error!(error = %e, "dongle read failed");
                running.store(false, Ordering::Release);
                reads.complete(ReadOutcome::Unavailable(DriverError::NoTransport));
                queue.push("transport lost", "", |s: &mut DongleState| s.transport_lost());
                break;
            },
            Err(e) => warn!(error = %e, "discarding malformed dongle frame"),
        }
    }
    trace!("dongle reader exiting");
}

// ============================================================================
// 通信器
// ============================================================================

/// Dongle 通信器
pub struct DongleCommunicator {
    runtime: AdapterRuntime<DongleState>,
    running: Arc<AtomicBool>,
    killed: AtomicBool,
    stop_reader: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    reads: Arc<ReadSlot>,
    description: String,
}

impl DongleCommunicator {
    /// 打开串口 Dongle（未配置端口时按 VID/PID 查找）
    #[cfg(feature = "serial")]
    pub fn open(
        config: &CommunicatorConfig,
        events: Arc<dyn CommunicatorEvents>,
    ) -> Result<Self, DriverError> {
        use bluebird_transport::SerialDongle;

        let path = match &config.dongle.port {
            Some(path) => path.clone(),
            None => SerialDongle::find_port()?,
        };
        let link = SerialDongle::open_with_timeout(&path, config.dongle.read_timeout)?;
        Self::with_link(link, config, events)
    }

    /// 在任意 Dongle 链路上启动适配器，等待固件信息应答
    pub fn with_link<L: DongleLink>(
        link: L,
        config: &CommunicatorConfig,
        events: Arc<dyn CommunicatorEvents>,
    ) -> Result<Self, DriverError> {
        let description = link.describe();
        let runtime = AdapterRuntime::new("dongle")?;
        let (rx, tx) = link.split()?;

        let queue = runtime.queue().clone();
        let sink_queue = queue.clone();
        let on_watchdog: WatchdogSink = Arc::new(move |key: String, token: u64| {
            let item_key = key.clone();
            sink_queue.push("connection watchdog", item_key, move |s: &mut DongleState| {
                s.watchdog(&key, token)
            });
        });

        let reads = Arc::new(ReadSlot::default());
        let (init_tx, init_rx) = bounded(1);
        let state = DongleState {
            session: Session::new(
                DeviceRegistry::new(Backend::Dongle, config.rssi_threshold),
                events,
                runtime.scheduler().clone(),
                config.connect_timeout,
                on_watchdog,
            ),
            gatt: DongleGatt {
                tx: Box::new(tx),
                closed: Vec::new(),
            },
            config: config.dongle.clone(),
            connections: HashMap::new(),
            pending: VecDeque::new(),
            procedure: None,
            scanning: false,
            reads: reads.clone(),
            init_tx: Some(init_tx),
        };
        runtime.spawn(state)?;

        let running = Arc::new(AtomicBool::new(false));
        let stop_reader = Arc::new(AtomicBool::new(false));
        let reader = {
            let reads = reads.clone();
            let stop = stop_reader.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("dongle-reader".into())
                .spawn(move || reader_loop(rx, queue, reads, stop, running))
                .map_err(|e| DriverError::IoThread(e.to_string()))?
        };

        let communicator = Self {
            runtime,
            running,
            killed: AtomicBool::new(false),
            stop_reader,
            reader: Mutex::new(Some(reader)),
            reads,
            description,
        };

        communicator
            .runtime
            .submit("initialize", "", |s: &mut DongleState| s.initialize());
        match init_rx.recv_timeout(config.dongle.init_timeout) {
            Ok(_) => {
                communicator.running.store(true, Ordering::Release);
                info!(link = %communicator.description, "dongle adapter running");
                Ok(communicator)
            },
            Err(_) => {
                warn!(link = %communicator.description, "dongle did not answer");
                communicator.kill();
                Err(DriverError::Timeout)
            },
        }
    }

    /// 同步读取属性值，阻塞调用线程直到应答或超时
    pub fn read_attribute(&self, name: &str, handle: u16, timeout: Duration) -> Result<Vec<u8>, DriverError> {
        let _serial = self.reads.serial.lock();
        *self.reads.pending.lock() = Some(PendingRead {
            connection: None,
            handle,
            outcome: None,
        });
        let device = name.to_string();
        if !self
            .runtime
            .submit("read attribute", name, move |s: &mut DongleState| s.start_read(&device, handle))
        {
            *self.reads.pending.lock() = None;
            return Err(DriverError::ChannelClosed);
        }

        let deadline = Instant::now() + timeout;
        let mut pending = self.reads.pending.lock();
        loop {
            if let Some(outcome) = pending.as_mut().and_then(|read| read.outcome.take()) {
                *pending = None;
                return match outcome {
                    ReadOutcome::Value(value) => Ok(value),
                    ReadOutcome::Failed(code) => Err(DriverError::InvalidInput(format!(
                        "read of handle 0x{:04X} failed with 0x{:04X}",
                        handle, code
                    ))),
                    ReadOutcome::Unavailable(e) => Err(e),
                };
            }
            if self.reads.ready.wait_until(&mut pending, deadline).timed_out() {
                *pending = None;
                return Err(DriverError::Timeout);
            }
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl Communicator for DongleCommunicator {
    fn backend(&self) -> Backend {
        Backend::Dongle
    }

    fn start_discovery(&self) {
        self.runtime
            .submit("start discovery", "", |s: &mut DongleState| s.start_discovery());
    }

    fn stop_discovery(&self) {
        self.runtime
            .submit("stop discovery", "", |s: &mut DongleState| s.stop_discovery());
    }

    fn request_connection(&self, name: &str) {
        let device = name.to_string();
        self.runtime
            .submit("request connection", name, move |s: &mut DongleState| {
                s.request_connection(&device)
            });
    }

    fn request_disconnect(&self, name: &str) {
        let device = name.to_string();
        self.runtime
            .submit("request disconnect", name, move |s: &mut DongleState| {
                s.request_disconnect(&device)
            });
    }

    fn send_command(&self, name: &str, data: &[u8]) {
        let device = name.to_string();
        let data = data.to_vec();
        self.runtime
            .submit("send command", name, move |s: &mut DongleState| s.send_command(&device, &data));
    }

    fn cancel_connection_request(&self) {
        self.runtime
            .submit("cancel connection", "", |s: &mut DongleState| s.cancel());
    }

    fn kill(&self) {
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(link = %self.description, "stopping dongle adapter");
        self.running.store(false, Ordering::Release);
        self.stop_reader.store(true, Ordering::Release);
        if let Some(handle) = self.reader.lock().take()
            && handle.join().is_err()
        {
            error!("Dongle reader thread panicked");
        }
        match self.runtime.shutdown() {
            Some(state) => state.release(),
            None => warn!("dongle worker state lost, transport released without reset"),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.killed.load(Ordering::Acquire)
    }
}

impl Drop for DongleCommunicator {
    fn drop(&mut self) {
        self.kill();
    }
}
