//! BlueZ 系统总线后端（基于 `bluer`）
//!
//! `bluer` 是异步 API：这里持有一个私有 tokio 运行时，同步方法通过 `block_on` 调用，
//! 扫描、属性变化与通知流在运行时任务中消费，并转换为 [`BusSignal`]。
//!
//! 对象路径沿用 BlueZ 的格式：
//! `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service000c/char000d`

use crate::bus::{BusObject, BusSignal, DeviceProperties, SignalHandler, SystemBus};
use crate::{TransportDeviceError, TransportDeviceErrorKind, TransportError};
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures_lite::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const BLUEZ_ROOT: &str = "/org/bluez";

fn adapter_path(name: &str) -> String {
    format!("{}/{}", BLUEZ_ROOT, name)
}

fn device_path(adapter: &str, address: Address) -> String {
    format!(
        "{}/dev_{}",
        adapter_path(adapter),
        address.to_string().replace(':', "_")
    )
}

fn characteristic_path(device: &str, service: u16, characteristic: u16) -> String {
    format!("{}/service{:04x}/char{:04x}", device, service, characteristic)
}

fn adapter_name(path: &str) -> Result<&str, TransportError> {
    path.strip_prefix(BLUEZ_ROOT)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|name| !name.is_empty() && !name.contains('/'))
        .ok_or_else(|| invalid_path(path))
}

/// 解析设备路径为 (适配器名, 地址)
fn parse_device_path(path: &str) -> Result<(String, Address), TransportError> {
    let rest = path
        .strip_prefix(BLUEZ_ROOT)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| invalid_path(path))?;
    let (adapter, device) = rest.split_once('/').ok_or_else(|| invalid_path(path))?;
    let address = device
        .strip_prefix("dev_")
        .map(|a| a.replace('_', ":"))
        .and_then(|a| a.parse::<Address>().ok())
        .ok_or_else(|| invalid_path(path))?;
    Ok((adapter.to_string(), address))
}

fn invalid_path(path: &str) -> TransportError {
    TransportDeviceError::new(
        TransportDeviceErrorKind::InvalidResponse,
        format!("not a BlueZ object path: {}", path),
    )
    .into()
}

fn map_bluer_error(e: bluer::Error) -> TransportError {
    let kind = match e.kind {
        bluer::ErrorKind::NotFound | bluer::ErrorKind::DoesNotExist => {
            TransportDeviceErrorKind::NotFound
        },
        bluer::ErrorKind::NotAuthorized | bluer::ErrorKind::NotPermitted => {
            TransportDeviceErrorKind::AccessDenied
        },
        bluer::ErrorKind::InProgress | bluer::ErrorKind::AlreadyConnected => {
            TransportDeviceErrorKind::Busy
        },
        bluer::ErrorKind::NotReady | bluer::ErrorKind::NotAvailable => {
            TransportDeviceErrorKind::NoAdapter
        },
        _ => TransportDeviceErrorKind::Backend,
    };
    TransportDeviceError::new(kind, e.to_string()).into()
}

async fn read_properties(device: &Device) -> DeviceProperties {
    DeviceProperties {
        name: device.name().await.ok().flatten(),
        address: Some(device.address().to_string()),
        rssi: device.rssi().await.ok().flatten(),
        connected: device.is_connected().await.ok(),
        service_uuids: device
            .uuids()
            .await
            .ok()
            .flatten()
            .map(|uuids| uuids.into_iter().collect())
            .unwrap_or_default(),
    }
}

async fn enumerate_characteristics(
    device: &Device,
    device_path: &str,
) -> bluer::Result<Vec<(String, Uuid, Characteristic)>> {
    let mut found = Vec::new();
    for service in device.services().await? {
        let service_id = service.id();
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            let path = characteristic_path(device_path, service_id, characteristic.id());
            found.push((path, uuid, characteristic));
        }
    }
    Ok(found)
}

/// 运行时任务共享的状态
struct Shared {
    handler: Mutex<Option<SignalHandler>>,
    characteristics: Mutex<HashMap<String, Characteristic>>,
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Shared {
    fn emit(&self, signal: BusSignal) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(signal);
        }
    }

    /// 缓存特征值并上报
    fn publish_characteristics(
        &self,
        device_path: &str,
        found: Vec<(String, Uuid, Characteristic)>,
    ) {
        for (path, uuid, characteristic) in found {
            self.characteristics.lock().insert(path.clone(), characteristic);
            self.emit(BusSignal::CharacteristicAppeared {
                path,
                device_path: device_path.to_string(),
                uuid,
            });
        }
    }

    fn forget_device(&self, device_path: &str) {
        if let Some(watcher) = self.watchers.lock().remove(device_path) {
            watcher.abort();
        }
        self.characteristics
            .lock()
            .retain(|path, _| !crate::bus::is_child_path(device_path, path));
    }
}

/// 监听单个设备的属性变化
fn watch_device(runtime: &Handle, shared: &Arc<Shared>, device: Device, path: String) {
    if shared.watchers.lock().contains_key(&path) {
        return;
    }
    let task_shared = shared.clone();
    let task_path = path.clone();
    let handle = runtime.spawn(async move {
        let events = match device.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Cannot watch {}: {}", task_path, e);
                return;
            },
        };
        futures_lite::pin!(events);
        while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
            let properties = match property {
                DeviceProperty::Rssi(rssi) => DeviceProperties {
                    rssi: Some(rssi),
                    ..Default::default()
                },
                DeviceProperty::Connected(connected) => DeviceProperties {
                    connected: Some(connected),
                    ..Default::default()
                },
                DeviceProperty::Name(name) => DeviceProperties {
                    name: Some(name),
                    ..Default::default()
                },
                DeviceProperty::ServicesResolved(true) => {
                    match enumerate_characteristics(&device, &task_path).await {
                        Ok(found) => task_shared.publish_characteristics(&task_path, found),
                        Err(e) => warn!("GATT enumeration failed for {}: {}", task_path, e),
                    }
                    continue;
                },
                _ => continue,
            };
            task_shared.emit(BusSignal::DevicePropertiesChanged {
                path: task_path.clone(),
                properties,
            });
        }
    });
    shared.watchers.lock().insert(path, handle);
}

/// BlueZ 总线
pub struct BluezBus {
    runtime: Runtime,
    session: Session,
    shared: Arc<Shared>,
    discovery: Mutex<HashMap<String, JoinHandle<()>>>,
    notifiers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BluezBus {
    /// 连接系统总线上的 BlueZ 服务
    pub fn new() -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("bluebird-bluez")
            .enable_all()
            .build()?;
        let session = runtime.block_on(Session::new()).map_err(map_bluer_error)?;
        info!("Connected to BlueZ");
        Ok(Self {
            runtime,
            session,
            shared: Arc::new(Shared {
                handler: Mutex::new(None),
                characteristics: Mutex::new(HashMap::new()),
                watchers: Mutex::new(HashMap::new()),
            }),
            discovery: Mutex::new(HashMap::new()),
            notifiers: Mutex::new(HashMap::new()),
        })
    }

    fn adapter(&self, name: &str) -> Result<Adapter, TransportError> {
        self.session.adapter(name).map_err(map_bluer_error)
    }

    fn device(&self, path: &str) -> Result<Device, TransportError> {
        let (adapter, address) = parse_device_path(path)?;
        self.adapter(&adapter)?.device(address).map_err(map_bluer_error)
    }

    fn characteristic(&self, path: &str) -> Result<Characteristic, TransportError> {
        self.shared
            .characteristics
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| {
                TransportDeviceError::new(TransportDeviceErrorKind::NotFound, path.to_string())
                    .into()
            })
    }
}

impl SystemBus for BluezBus {
    fn adapters(&self) -> Result<Vec<String>, TransportError> {
        let names = self
            .runtime
            .block_on(self.session.adapter_names())
            .map_err(map_bluer_error)?;
        Ok(names.iter().map(|name| adapter_path(name)).collect())
    }

    fn start_discovery(&self, adapter: &str) -> Result<(), TransportError> {
        let name = adapter_name(adapter)?.to_string();
        let bluer_adapter = self.adapter(&name)?;
        self.runtime
            .block_on(bluer_adapter.set_powered(true))
            .map_err(map_bluer_error)?;

        let shared = self.shared.clone();
        let handle = self.runtime.handle().clone();
        let task = self.runtime.spawn(async move {
            let events = match bluer_adapter.discover_devices().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Discovery on {} failed: {}", name, e);
                    return;
                },
            };
            futures_lite::pin!(events);
            while let Some(event) = events.next().await {
                match event {
                    AdapterEvent::DeviceAdded(address) => {
                        let path = device_path(&name, address);
                        let Ok(device) = bluer_adapter.device(address) else {
                            continue;
                        };
                        let properties = read_properties(&device).await;
                        shared.emit(BusSignal::DeviceAppeared {
                            path: path.clone(),
                            properties,
                        });
                        watch_device(&handle, &shared, device, path);
                    },
                    AdapterEvent::DeviceRemoved(address) => {
                        let path = device_path(&name, address);
                        shared.forget_device(&path);
                        shared.emit(BusSignal::DeviceVanished { path });
                    },
                    _ => {},
                }
            }
        });

        if let Some(previous) = self.discovery.lock().insert(adapter.to_string(), task) {
            previous.abort();
        }
        debug!("Discovery started on {}", adapter);
        Ok(())
    }

    fn stop_discovery(&self, adapter: &str) -> Result<(), TransportError> {
        // 丢弃扫描流即停止扫描
        if let Some(task) = self.discovery.lock().remove(adapter) {
            task.abort();
            debug!("Discovery stopped on {}", adapter);
        }
        Ok(())
    }

    fn managed_objects(&self) -> Result<Vec<BusObject>, TransportError> {
        let mut objects = Vec::new();
        let names = self
            .runtime
            .block_on(self.session.adapter_names())
            .map_err(map_bluer_error)?;
        for name in names {
            objects.push(BusObject::Adapter {
                path: adapter_path(&name),
            });
            let adapter = self.adapter(&name)?;
            let addresses = self
                .runtime
                .block_on(adapter.device_addresses())
                .map_err(map_bluer_error)?;
            for address in addresses {
                let Ok(device) = adapter.device(address) else {
                    continue;
                };
                let path = device_path(&name, address);
                let properties = self.runtime.block_on(read_properties(&device));
                let resolved = self
                    .runtime
                    .block_on(device.is_services_resolved())
                    .unwrap_or(false);
                objects.push(BusObject::Device {
                    path: path.clone(),
                    properties,
                });
                if resolved {
                    let found = self
                        .runtime
                        .block_on(enumerate_characteristics(&device, &path))
                        .map_err(map_bluer_error)?;
                    for (char_path, uuid, characteristic) in found {
                        self.shared
                            .characteristics
                            .lock()
                            .insert(char_path.clone(), characteristic);
                        objects.push(BusObject::Characteristic {
                            path: char_path,
                            device_path: path.clone(),
                            uuid,
                        });
                    }
                }
                watch_device(self.runtime.handle(), &self.shared, device, path);
            }
        }
        Ok(objects)
    }

    fn device_exists(&self, device: &str) -> Result<bool, TransportError> {
        let (adapter, address) = parse_device_path(device)?;
        let addresses = self
            .runtime
            .block_on(self.adapter(&adapter)?.device_addresses())
            .map_err(map_bluer_error)?;
        Ok(addresses.contains(&address))
    }

    fn connect(&self, device: &str) -> Result<(), TransportError> {
        let bluer_device = self.device(device)?;
        self.runtime
            .block_on(bluer_device.connect())
            .map_err(map_bluer_error)?;
        watch_device(self.runtime.handle(), &self.shared, bluer_device.clone(), device.to_string());
        // 服务已解析时不会再有 ServicesResolved 变化，直接上报
        if self
            .runtime
            .block_on(bluer_device.is_services_resolved())
            .unwrap_or(false)
        {
            let found = self
                .runtime
                .block_on(enumerate_characteristics(&bluer_device, device))
                .map_err(map_bluer_error)?;
            self.shared.publish_characteristics(device, found);
        }
        Ok(())
    }

    fn disconnect(&self, device: &str) -> Result<(), TransportError> {
        let bluer_device = self.device(device)?;
        self.runtime
            .block_on(bluer_device.disconnect())
            .map_err(map_bluer_error)
    }

    fn start_notify(&self, characteristic: &str) -> Result<(), TransportError> {
        let remote = self.characteristic(characteristic)?;
        let stream = self
            .runtime
            .block_on(remote.notify())
            .map_err(map_bluer_error)?;
        let shared = self.shared.clone();
        let path = characteristic.to_string();
        let task = self.runtime.spawn(async move {
            futures_lite::pin!(stream);
            while let Some(value) = stream.next().await {
                shared.emit(BusSignal::ValueChanged {
                    path: path.clone(),
                    value,
                });
            }
        });
        if let Some(previous) = self.notifiers.lock().insert(characteristic.to_string(), task) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_notify(&self, characteristic: &str) -> Result<(), TransportError> {
        if let Some(task) = self.notifiers.lock().remove(characteristic) {
            task.abort();
        }
        Ok(())
    }

    fn write_value(&self, characteristic: &str, value: &[u8]) -> Result<(), TransportError> {
        let remote = self.characteristic(characteristic)?;
        self.runtime
            .block_on(remote.write(value))
            .map_err(map_bluer_error)
    }

    fn set_signal_handler(&self, handler: SignalHandler) {
        *self.shared.handler.lock() = Some(handler);
    }

    fn shutdown(&self) {
        *self.shared.handler.lock() = None;
        for (_, task) in self.discovery.lock().drain() {
            task.abort();
        }
        for (_, task) in self.notifiers.lock().drain() {
            task.abort();
        }
        for (_, task) in self.shared.watchers.lock().drain() {
            task.abort();
        }
        self.shared.characteristics.lock().clear();
        debug!("BlueZ bus released");
    }
}
