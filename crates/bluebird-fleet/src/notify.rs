//! 上下游协作方接口

use crate::slot::{SlotId, SlotSnapshot};
use bluebird_driver::DiscoveredDevice;

/// 前端（GUI 或 Shell）通知，单向，无返回值
pub trait FrontendNotifier: Send + Sync {
    fn scan_status_changed(&self, scanning: bool);

    fn device_discovered(&self, device: &DiscoveredDevice);

    fn slot_changed(&self, slot: &SlotSnapshot);

    /// 传输层状态（`has_transport == false` 表示适配器正在被替换）
    fn ble_status_changed(&self, has_transport: bool, healthy: bool);
}

/// 传感器解码方
///
/// 通知字节不做任何修改直接转发。
pub trait SensorSink: Send + Sync {
    fn receive_notification(&self, slot: SlotId, name: &str, data: &[u8]);

    fn receive_connection_event(&self, name: &str, version_is_two: bool);

    fn receive_disconnection_event(&self, name: &str, user_initiated: bool);
}
