//! 连接槽位
//!
//! 三个槽位按字母 A/B/C 编号，槽位表本身不做 I/O，只负责分配规则。

use crate::error::FleetError;
use bluebird_driver::HardwareVersion;
use std::fmt;

/// 槽位数量（同时连接设备的上限）
pub const SLOT_COUNT: usize = 3;

/// 槽位编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u8);

impl SlotId {
    pub const ALL: [SlotId; SLOT_COUNT] = [SlotId(0), SlotId(1), SlotId(2)];

    pub fn from_index(index: usize) -> Option<Self> {
        (index < SLOT_COUNT).then_some(SlotId(index as u8))
    }

    /// 按字母解析（不区分大小写）
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'A' => Some(SlotId(0)),
            'B' => Some(SlotId(1)),
            'C' => Some(SlotId(2)),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn letter(self) -> char {
        (b'A' + self.0) as char
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// 槽位状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotStatus {
    #[default]
    Empty,
    Connecting,
    Connected,
    /// 曾经连接，被非用户原因断开；保持绑定直到用户处理
    Dropped,
}

impl SlotStatus {
    /// 连接中或已连接
    pub fn is_live(self) -> bool {
        matches!(self, SlotStatus::Connecting | SlotStatus::Connected)
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SlotStatus::Empty => "empty",
            SlotStatus::Connecting => "connecting",
            SlotStatus::Connected => "connected",
            SlotStatus::Dropped => "dropped",
        })
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    status: SlotStatus,
    device: Option<String>,
    version: Option<HardwareVersion>,
}

/// 槽位快照（发给前端）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub status: SlotStatus,
    pub device: Option<String>,
    pub version: Option<HardwareVersion>,
}

impl fmt::Display for SlotSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.status)?;
        if let Some(device) = &self.device {
            write!(f, " {}", device)?;
        }
        if let Some(version) = self.version {
            write!(f, " ({})", version)?;
        }
        Ok(())
    }
}

/// 槽位表
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: [Slot; SLOT_COUNT],
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为设备分配槽位并置为 Connecting
    ///
    /// 已绑定在活动槽位上的名称被拒绝；绑定在 Dropped 槽位上的名称复用该槽位；
    /// 否则使用编号最小的空槽位。
    pub fn bind(&mut self, name: &str) -> Result<SlotId, FleetError> {
        let id = match self.find(name) {
            Some(id) if self.slots[id.index()].status.is_live() => {
                return Err(FleetError::AlreadyBound {
                    name: name.to_string(),
                    slot: id.letter(),
                });
            },
            Some(id) => id,
            None => SlotId::ALL
                .into_iter()
                .find(|id| self.slots[id.index()].status == SlotStatus::Empty)
                .ok_or(FleetError::NoFreeSlot)?,
        };
        self.slots[id.index()] = Slot {
            status: SlotStatus::Connecting,
            device: Some(name.to_string()),
            version: None,
        };
        Ok(id)
    }

    /// 绑定了该设备的槽位
    pub fn find(&self, name: &str) -> Option<SlotId> {
        SlotId::ALL
            .into_iter()
            .find(|id| self.slots[id.index()].device.as_deref() == Some(name))
    }

    /// 记录连接成功与版本
    pub fn mark_connected(&mut self, name: &str, version: HardwareVersion) -> Option<SlotSnapshot> {
        let id = self.find(name)?;
        let slot = &mut self.slots[id.index()];
        slot.status = SlotStatus::Connected;
        slot.version = Some(version);
        Some(self.snapshot(id))
    }

    /// 记录断开：用户发起或从未连上时释放，否则保持绑定并标记 Dropped
    pub fn mark_disconnected(&mut self, name: &str, user_initiated: bool) -> Option<SlotSnapshot> {
        let id = self.find(name)?;
        let slot = &mut self.slots[id.index()];
        if slot.status == SlotStatus::Connected && !user_initiated {
            slot.status = SlotStatus::Dropped;
        } else {
            *slot = Slot::default();
        }
        Some(self.snapshot(id))
    }

    /// 适配器被替换时：已连接的槽位转为 Dropped，连接中的释放
    pub fn drop_live(&mut self) -> Vec<(String, SlotSnapshot)> {
        let mut changed = Vec::new();
        for id in SlotId::ALL {
            let slot = &mut self.slots[id.index()];
            let Some(device) = slot.device.clone() else {
                continue;
            };
            match slot.status {
                SlotStatus::Connected => slot.status = SlotStatus::Dropped,
                SlotStatus::Connecting => *slot = Slot::default(),
                _ => continue,
            }
            changed.push((device, self.snapshot(id)));
        }
        changed
    }

    pub fn release(&mut self, id: SlotId) -> SlotSnapshot {
        self.slots[id.index()] = Slot::default();
        self.snapshot(id)
    }

    pub fn status(&self, id: SlotId) -> SlotStatus {
        self.slots[id.index()].status
    }

    pub fn device(&self, id: SlotId) -> Option<&str> {
        self.slots[id.index()].device.as_deref()
    }

    /// 已连接槽位上的设备名
    pub fn connected_device(&self, id: SlotId) -> Result<String, FleetError> {
        let slot = &self.slots[id.index()];
        match (&slot.device, slot.status) {
            (Some(device), SlotStatus::Connected) => Ok(device.clone()),
            _ => Err(FleetError::SlotNotConnected(id.letter())),
        }
    }

    pub fn snapshot(&self, id: SlotId) -> SlotSnapshot {
        let slot = &self.slots[id.index()];
        SlotSnapshot {
            id,
            status: slot.status,
            device: slot.device.clone(),
            version: slot.version,
        }
    }

    pub fn snapshots(&self) -> Vec<SlotSnapshot> {
        SlotId::ALL.into_iter().map(|id| self.snapshot(id)).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status == SlotStatus::Connected)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_letters() {
        assert_eq!(SlotId::from_letter('b'), SlotId::from_index(1));
        assert_eq!(SlotId::from_letter('D'), None);
        assert_eq!(SlotId::from_index(3), None);
        assert_eq!(SlotId::ALL.map(SlotId::letter), ['A', 'B', 'C']);
    }

    #[test]
    fn test_bind_lowest_free() {
        let mut table = SlotTable::new();
        assert_eq!(table.bind("FN0001").unwrap().letter(), 'A');
        assert_eq!(table.bind("FN0002").unwrap().letter(), 'B');
        table.release(SlotId::ALL[0]);
        assert_eq!(table.bind("FN0003").unwrap().letter(), 'A');
        assert_eq!(table.bind("FN0004").unwrap().letter(), 'C');
        assert!(matches!(table.bind("FN0005"), Err(FleetError::NoFreeSlot)));
    }

    #[test]
    fn test_bind_rejects_live_name() {
        let mut table = SlotTable::new();
        table.bind("BB0001").unwrap();
        assert!(matches!(
            table.bind("BB0001"),
            Err(FleetError::AlreadyBound { slot: 'A', .. })
        ));
        table.mark_connected("BB0001", HardwareVersion::V2);
        assert!(matches!(table.bind("BB0001"), Err(FleetError::AlreadyBound { .. })));
    }

    #[test]
    fn test_non_user_disconnect_keeps_binding() {
        let mut table = SlotTable::new();
        let id = table.bind("MB0001").unwrap();
        table.mark_connected("MB0001", HardwareVersion::V1);

        let snapshot = table.mark_disconnected("MB0001", false).unwrap();
        assert_eq!(snapshot.status, SlotStatus::Dropped);
        assert_eq!(snapshot.device.as_deref(), Some("MB0001"));

        // 同名重连复用原槽位
        table.bind("FN0009").unwrap();
        assert_eq!(table.bind("MB0001").unwrap(), id);
        assert_eq!(table.status(id), SlotStatus::Connecting);
    }

    #[test]
    fn test_user_disconnect_frees_slot() {
        let mut table = SlotTable::new();
        let id = table.bind("FN0001").unwrap();
        table.mark_connected("FN0001", HardwareVersion::V2);
        let snapshot = table.mark_disconnected("FN0001", true).unwrap();
        assert_eq!(snapshot.status, SlotStatus::Empty);
        assert_eq!(table.device(id), None);
    }

    #[test]
    fn test_failed_connect_frees_slot() {
        let mut table = SlotTable::new();
        table.bind("FN0001").unwrap();
        let snapshot = table.mark_disconnected("FN0001", false).unwrap();
        assert_eq!(snapshot.status, SlotStatus::Empty);
    }

    #[test]
    fn test_drop_live() {
        let mut table = SlotTable::new();
        table.bind("FN0001").unwrap();
        table.bind("FN0002").unwrap();
        table.mark_connected("FN0001", HardwareVersion::V2);

        let changed = table.drop_live();
        assert_eq!(changed.len(), 2);
        assert_eq!(table.status(SlotId::ALL[0]), SlotStatus::Dropped);
        assert_eq!(table.status(SlotId::ALL[1]), SlotStatus::Empty);
        assert_eq!(table.connected_count(), 0);
    }

    #[test]
    fn test_connected_device() {
        let mut table = SlotTable::new();
        let id = table.bind("BB0001").unwrap();
        assert!(matches!(table.connected_device(id), Err(FleetError::SlotNotConnected('A'))));
        table.mark_connected("BB0001", HardwareVersion::V1);
        assert_eq!(table.connected_device(id).unwrap(), "BB0001");
        assert_eq!(table.snapshot(id).to_string(), "A: connected BB0001 (v1)");
    }
}
