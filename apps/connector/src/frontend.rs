//! 把编排器事件打印到日志与终端

use bluebird_driver::DiscoveredDevice;
use bluebird_fleet::{FrontendNotifier, SensorSink, SlotId, SlotSnapshot};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// 终端前端：记录扫描结果，其余事件写入日志
#[derive(Default)]
pub struct LogFrontend {
    seen: Mutex<BTreeMap<String, i16>>,
}

impl FrontendNotifier for LogFrontend {
    fn scan_status_changed(&self, scanning: bool) {
        if scanning {
            self.seen.lock().clear();
        }
        info!(scanning, "scan status");
    }

    fn device_discovered(&self, device: &DiscoveredDevice) {
        let first = self
            .seen
            .lock()
            .insert(device.name.clone(), device.rssi)
            .is_none();
        if first {
            println!("  found {} ({} dBm)", device.name, device.rssi);
        }
        debug!(device = %device.name, rssi = device.rssi, "discovered");
    }

    fn slot_changed(&self, slot: &SlotSnapshot) {
        println!("  {}", slot);
    }

    fn ble_status_changed(&self, has_transport: bool, healthy: bool) {
        info!(has_transport, healthy, "bluetooth status");
    }
}

impl SensorSink for LogFrontend {
    fn receive_notification(&self, slot: SlotId, name: &str, data: &[u8]) {
        debug!(%slot, device = %name, data = %hex::encode(data), "notification");
    }

    fn receive_connection_event(&self, name: &str, version_is_two: bool) {
        info!(device = %name, version_is_two, "robot connected");
    }

    fn receive_disconnection_event(&self, name: &str, user_initiated: bool) {
        info!(device = %name, user_initiated, "robot disconnected");
    }
}
