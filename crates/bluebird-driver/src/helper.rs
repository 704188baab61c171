//! 助手进程适配器
//!
//! 助手进程自己完成 GATT 会话建立（服务发现、版本探测、轮询），
//! 适配器只负责串行化连接请求、转发命令和通知，并把连接事件映射到状态机上。
//! 同一时刻只有一个 `connect` 在途，其余请求排队。

use crate::communicator::{Backend, Communicator, CommunicatorEvents, DisconnectReason};
use crate::config::CommunicatorConfig;
use crate::device::{ChannelId, ChannelKind, DeviceRecord, DeviceRegistry, DeviceState};
use crate::error::DriverError;
use crate::runtime::{AdapterRuntime, WorkQueue};
use crate::session::{GattLink, Session, WatchdogSink};
use bluebird_protocol::helper::decode_dashed_hex;
use bluebird_protocol::{
    BluetoothState, HardwareVersion, HelperCommand, HelperEvent, LinkStatus, is_supported_name,
};
use bluebird_transport::{HelperChannel, HelperProcess, LineSink, LineSource, ProcessControl};
use crossbeam_channel::{Sender, bounded};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// 向助手进程写命令
struct HelperGatt {
    sink: Box<dyn LineSink>,
}

impl HelperGatt {
    fn send(&mut self, command: &HelperCommand) -> Result<(), DriverError> {
        let line = command.to_string();
        trace!(line = %line, "helper tx");
        self.sink.write_line(&line)?;
        Ok(())
    }
}

impl GattLink<()> for HelperGatt {
    fn write(&mut self, record: &DeviceRecord<()>, _channel: &ChannelId, data: &[u8]) -> Result<(), DriverError> {
        self.send(&HelperCommand::SendBlob {
            name: record.key.clone(),
            data: data.to_vec(),
        })
    }

    fn set_notify(&mut self, _record: &DeviceRecord<()>, _channel: &ChannelId, _enable: bool) -> Result<(), DriverError> {
        Ok(())
    }

    fn close_link(&mut self, record: &DeviceRecord<()>, reason: DisconnectReason) -> Result<(), DriverError> {
        if reason == DisconnectReason::LinkLost {
            return Ok(());
        }
        self.send(&HelperCommand::Disconnect(record.key.clone()))
    }

    fn send_probe(&mut self, _record: &DeviceRecord<()>) -> Result<(), DriverError> {
        Ok(())
    }

    fn start_polling(&mut self, _record: &DeviceRecord<()>, _version: HardwareVersion) -> Result<(), DriverError> {
        Ok(())
    }

    fn stop_polling(&mut self, _record: &DeviceRecord<()>) -> Result<(), DriverError> {
        Ok(())
    }
}

struct HelperState {
    session: Session<()>,
    gatt: HelperGatt,
    /// 在途的连接请求
    in_flight: Option<String>,
    pending: VecDeque<String>,
    scanning: bool,
    running: Arc<AtomicBool>,
    startup_tx: Option<Sender<BluetoothState>>,
}

impl HelperState {
    fn events(&self) -> Arc<dyn CommunicatorEvents> {
        self.session.events().clone()
    }

    fn send_logged(&mut self, command: HelperCommand) {
        if let Err(e) = self.gatt.send(&command) {
            warn!(command = %command, error = %e, "helper command failed");
        }
    }

    // ------------------------------------------------------------------------
    // 扫描
    // ------------------------------------------------------------------------

    fn start_discovery(&mut self) {
        if self.scanning {
            let count = self.session.report_idle();
            debug!(count, "scan already active, re-reported known devices");
            return;
        }
        self.send_logged(HelperCommand::StartScan);
        self.scanning = true;
        info!("helper scan started");
        self.events().scan_status_changed(true);
    }

    fn stop_discovery(&mut self) {
        if !self.scanning {
            info!("stop discovery: not scanning");
            return;
        }
        self.send_logged(HelperCommand::StopScan);
        self.scanning = false;
        info!("helper scan stopped");
        self.events().scan_status_changed(false);
    }

    // ------------------------------------------------------------------------
    // 连接请求队列
    // ------------------------------------------------------------------------

    fn request_connection(&mut self, name: &str) {
        if let Some(key) = self.session.request_connect(name) {
            self.pending.push_back(key);
            self.advance();
        }
    }

    /// 无在途请求时发出下一个
    fn advance(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        while let Some(key) = self.pending.pop_front() {
            if self.session.state_of(&key) != Some(DeviceState::ConnectingBegin) {
                continue;
            }
            if let Err(e) = self.gatt.send(&HelperCommand::Connect(key.clone())) {
                warn!(device = %key, error = %e, "connect request failed");
                self.session
                    .disconnect(&mut self.gatt, &key, DisconnectReason::ConnectFailed);
                continue;
            }
            debug!(device = %key, queued = self.pending.len(), "connect request sent");
            self.session.arm_watchdog(&key);
            self.in_flight = Some(key);
            return;
        }
    }

    fn finish_in_flight(&mut self, key: &str) {
        if self.in_flight.as_deref() == Some(key) {
            self.in_flight = None;
        }
        self.pending.retain(|k| k != key);
        self.advance();
    }

    fn watchdog(&mut self, key: &str, token: u64) {
        if self.session.watchdog_fired(&mut self.gatt, key, token) {
            warn!(device = %key, "helper connect timed out");
            self.finish_in_flight(key);
        }
    }

    fn cancel(&mut self) {
        if self.scanning {
            self.stop_discovery();
        }
        let mut keys: Vec<String> = self.pending.drain(..).collect();
        if let Some(key) = self.in_flight.take() {
            keys.insert(0, key);
        }
        for key in keys {
            self.session
                .disconnect(&mut self.gatt, &key, DisconnectReason::Cancelled);
        }
    }

    // ------------------------------------------------------------------------
    // 事件分发
    // ------------------------------------------------------------------------

    fn dispatch(&mut self, event: HelperEvent) {
        match event {
            HelperEvent::Discovery { name, rssi } => {
                if is_supported_name(&name) {
                    self.session.observe(&name, &name, rssi, &[], || ());
                }
            },
            HelperEvent::Notification { peripheral, data } => match decode_dashed_hex(&data) {
                Ok(payload) => self.session.value_received(&mut self.gatt, &peripheral, &payload),
                Err(e) => warn!(device = %peripheral, error = %e, "malformed notification"),
            },
            HelperEvent::Connection {
                status,
                peripheral,
                has_v2,
            } => self.on_connection(status, &peripheral, has_v2.as_deref()),
            HelperEvent::BluetoothState { status } => {
                let state = BluetoothState::from_status(&status);
                info!(status = %status, "helper bluetooth state");
                self.running.store(state.is_on(), Ordering::Release);
                if let Some(tx) = self.startup_tx.take() {
                    let _ = tx.send(state);
                }
                self.events()
                    .status_changed(state.is_on(), state.is_available());
            },
            HelperEvent::Quit { reason } => {
                warn!(reason = reason.as_deref().unwrap_or(""), "helper quit");
                self.running.store(false, Ordering::Release);
                self.events().status_changed(false, true);
            },
            HelperEvent::Ping => trace!("helper ping"),
            HelperEvent::Error { message } => warn!(message = %message, "helper error"),
            HelperEvent::Debug { message } => debug!(message = %message, "helper"),
        }
    }

    fn on_connection(&mut self, status: LinkStatus, peripheral: &str, has_v2: Option<&str>) {
        match status {
            LinkStatus::Connected => {
                if self.session.state_of(peripheral) != Some(DeviceState::ConnectingBegin) {
                    warn!(device = %peripheral, "unexpected connection, closing");
                    self.send_logged(HelperCommand::Disconnect(peripheral.to_string()));
                    return;
                }
                let version = if HelperEvent::reports_v2(has_v2) {
                    HardwareVersion::V2
                } else {
                    HardwareVersion::V1
                };
                self.session.link_established(peripheral);
                self.session.channel_found(
                    &mut self.gatt,
                    peripheral,
                    ChannelKind::Write,
                    ChannelId::Delegated,
                );
                self.session.channel_found(
                    &mut self.gatt,
                    peripheral,
                    ChannelKind::Notify,
                    ChannelId::Delegated,
                );
                self.session
                    .complete_connection(&mut self.gatt, peripheral, version);
            },
            LinkStatus::UserDisconnected => {
                self.session
                    .disconnect(&mut self.gatt, peripheral, DisconnectReason::User);
            },
            LinkStatus::DeviceDisconnected => {
                self.session
                    .disconnect(&mut self.gatt, peripheral, DisconnectReason::LinkLost);
            },
        }
        self.finish_in_flight(peripheral);
    }

    fn send_command(&mut self, name: &str, data: &[u8]) {
        if let Err(e) = self.session.send(&mut self.gatt, name, data) {
            warn!(device = %name, error = %e, "command dropped");
        }
    }

    fn transport_lost(&mut self) {
        self.scanning = false;
        self.running.store(false, Ordering::Release);
        error!("helper process output closed");
        self.events().status_changed(false, true);
    }

    /// 强制断开所有设备并请求助手退出
    fn release(mut self) {
        let count = self
            .session
            .disconnect_all(&mut self.gatt, DisconnectReason::User);
        debug!(count, "devices force-disconnected");
        if let Err(e) = self.gatt.send(&HelperCommand::Quit) {
            debug!(error = %e, "quit not delivered");
        }
    }
}

fn reader_loop(
    mut source: Box<dyn LineSource>,
    queue: Arc<WorkQueue<HelperState>>,
    killing: Arc<AtomicBool>,
) {
    loop {
        match source.read_line() {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match HelperEvent::parse_line(&line) {
                    Ok(event) => {
                        let key = event_key(&event);
                        queue.push("helper event", key, move |s: &mut HelperState| s.dispatch(event));
                    },
                    Err(e) => warn!(line = %line, error = %e, "unparseable helper line"),
                }
            },
            Ok(None) => {
                debug!("helper output reached EOF");
                break;
            },
            Err(e) => {
                if !killing.load(Ordering::Acquire) {
                    error!(error = %e, "helper read failed");
                }
                break;
            },
        }
    }
    if !killing.load(Ordering::Acquire) {
        queue.push("helper lost", "", |s: &mut HelperState| s.transport_lost());
    }
}

fn event_key(event: &HelperEvent) -> String {
    match event {
        HelperEvent::Discovery { name, .. } => name.clone(),
        HelperEvent::Notification { peripheral, .. } | HelperEvent::Connection { peripheral, .. } => {
            peripheral.clone()
        },
        _ => String::new(),
    }
}

/// 助手进程通信器
pub struct HelperCommunicator {
    runtime: AdapterRuntime<HelperState>,
    running: Arc<AtomicBool>,
    killing: Arc<AtomicBool>,
    control: Mutex<Option<Box<dyn ProcessControl>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shutdown_grace: Duration,
}

impl HelperCommunicator {
    /// 启动配置中的助手程序
    pub fn spawn(config: &CommunicatorConfig, events: Arc<dyn CommunicatorEvents>) -> Result<Self, DriverError> {
        let program = config.helper.program.as_ref().ok_or(DriverError::NoTransport)?;
        let channel = HelperProcess::new(program)
            .args(config.helper.args.iter().cloned())
            .spawn()?;
        Self::with_channel(channel, config, events)
    }

    /// 在已建立的行链路上启动适配器
    ///
    /// 发送 `startScan` 并等待第一个 `bluetoothState`，随后发送 `stopScan`。
    pub fn with_channel(
        channel: HelperChannel,
        config: &CommunicatorConfig,
        events: Arc<dyn CommunicatorEvents>,
    ) -> Result<Self, DriverError> {
        let HelperChannel {
            source,
            sink,
            control,
        } = channel;
        let runtime = AdapterRuntime::new("helper")?;
        let queue = runtime.queue().clone();
        let sink_queue = queue.clone();
        let on_watchdog: WatchdogSink = Arc::new(move |key: String, token: u64| {
            let item_key = key.clone();
            sink_queue.push("connection watchdog", item_key, move |s: &mut HelperState| {
                s.watchdog(&key, token)
            });
        });

        let running = Arc::new(AtomicBool::new(false));
        let (startup_tx, startup_rx) = bounded(1);
        let state = HelperState {
            session: Session::new(
                DeviceRegistry::new(Backend::Helper, config.rssi_threshold),
                events,
                runtime.scheduler().clone(),
                config.helper.connect_timeout,
                on_watchdog,
            ),
            gatt: HelperGatt { sink },
            in_flight: None,
            pending: VecDeque::new(),
            scanning: false,
            running: running.clone(),
            startup_tx: Some(startup_tx),
        };
        runtime.spawn(state)?;

        let killing = Arc::new(AtomicBool::new(false));
        let reader = {
            let killing = killing.clone();
            thread::Builder::new()
                .name("helper-reader".into())
                .spawn(move || reader_loop(source, queue, killing))
                .map_err(|e| DriverError::IoThread(e.to_string()))?
        };

        let communicator = Self {
            runtime,
            running,
            killing,
            control: Mutex::new(Some(control)),
            reader: Mutex::new(Some(reader)),
            shutdown_grace: config.helper.shutdown_grace,
        };

        communicator
            .runtime
            .submit("startup probe", "", |s: &mut HelperState| {
                s.send_logged(HelperCommand::StartScan)
            });
        match startup_rx.recv_timeout(config.helper.startup_timeout) {
            Ok(state) => {
                communicator
                    .runtime
                    .submit("startup probe done", "", |s: &mut HelperState| {
                        s.send_logged(HelperCommand::StopScan)
                    });
                info!(bluetooth = ?state, "helper adapter started");
                Ok(communicator)
            },
            Err(_) => {
                warn!("helper did not report bluetooth state");
                communicator.kill();
                Err(DriverError::Timeout)
            },
        }
    }
}

impl Communicator for HelperCommunicator {
    fn backend(&self) -> Backend {
        Backend::Helper
    }

    fn start_discovery(&self) {
        self.runtime
            .submit("start discovery", "", |s: &mut HelperState| s.start_discovery());
    }

    fn stop_discovery(&self) {
        self.runtime
            .submit("stop discovery", "", |s: &mut HelperState| s.stop_discovery());
    }

    fn request_connection(&self, name: &str) {
        let device = name.to_string();
        self.runtime
            .submit("request connection", name, move |s: &mut HelperState| {
                s.request_connection(&device)
            });
    }

    fn request_disconnect(&self, name: &str) {
        let device = name.to_string();
        self.runtime
            .submit("request disconnect", name, move |s: &mut HelperState| {
                s.session.request_disconnect(&mut s.gatt, &device);
            });
    }

    fn send_command(&self, name: &str, data: &[u8]) {
        let device = name.to_string();
        let data = data.to_vec();
        self.runtime
            .submit("send command", name, move |s: &mut HelperState| s.send_command(&device, &data));
    }

    fn cancel_connection_request(&self) {
        self.runtime
            .submit("cancel connection", "", |s: &mut HelperState| s.cancel());
    }

    fn kill(&self) {
        if self.killing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping helper adapter");
        self.running.store(false, Ordering::Release);
        match self.runtime.shutdown() {
            Some(state) => state.release(),
            None => warn!("helper worker state lost"),
        }
        if let Some(mut control) = self.control.lock().take()
            && let Err(e) = control.terminate(self.shutdown_grace)
        {
            warn!(error = %e, "helper termination failed");
        }
        if let Some(handle) = self.reader.lock().take()
            && handle.join().is_err()
        {
            error!("Helper reader thread panicked");
        }
    }

    fn is_running(&self) -> bool {
        if self.killing.load(Ordering::Acquire) || !self.running.load(Ordering::Acquire) {
            return false;
        }
        self.control
            .lock()
            .as_mut()
            .is_some_and(|control| control.is_alive())
    }
}

impl Drop for HelperCommunicator {
    fn drop(&mut self) {
        self.kill();
    }
}
