//! 厂商 GATT 配置常量
//!
//! 三个设备家族共用同一个 UART 风格的 GATT 服务：一个写特征用于下发命令，
//! 一个通知特征用于上报传感器数据。

use uuid::Uuid;

/// 厂商服务 UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// 写特征 UUID（主机 -> 设备）
pub const WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// 通知特征 UUID（设备 -> 主机）
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// 主服务声明（Primary Service）
pub const PRIMARY_SERVICE_UUID16: u16 = 0x2800;

/// 特征声明（Characteristic Declaration）
pub const CHARACTERISTIC_DECLARATION_UUID16: u16 = 0x2803;

/// 客户端特征配置描述符（CCCD）
pub const CCCD_UUID16: u16 = 0x2902;

/// CCCD 写入值：开启通知
pub const CCCD_ENABLE_NOTIFY: [u8; 2] = [0x01, 0x00];

/// CCCD 写入值：关闭通知
pub const CCCD_DISABLE: [u8; 2] = [0x00, 0x00];

/// Bluetooth Base UUID（16 位 UUID 的展开基准）
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// 将 16 位短 UUID 展开为 128 位 UUID
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// 从线上小端字节解析 UUID
///
/// 支持 2 字节（16 位短 UUID）和 16 字节（完整 UUID）两种长度，其余长度返回 `None`。
pub fn uuid_from_le_bytes(bytes: &[u8]) -> Option<Uuid> {
    match bytes.len() {
        2 => Some(uuid_from_u16(u16::from_le_bytes([bytes[0], bytes[1]]))),
        16 => {
            let mut be = [0u8; 16];
            for (dst, src) in be.iter_mut().zip(bytes.iter().rev()) {
                *dst = *src;
            }
            Some(Uuid::from_bytes(be))
        },
        _ => None,
    }
}

/// 将 UUID 编码为线上小端字节
///
/// 可由 16 位短 UUID 表示的返回 2 字节，否则返回 16 字节。
pub fn uuid_to_le_bytes(uuid: &Uuid) -> Vec<u8> {
    if let Some(short) = short_uuid(uuid) {
        return short.to_le_bytes().to_vec();
    }
    uuid.as_bytes().iter().rev().copied().collect()
}

/// 如果 UUID 位于 Bluetooth Base 范围内，返回其 16 位短形式
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let short = (value >> 96) as u32;
    if short <= u16::MAX as u32 && (value & !(0xFFFF_u128 << 96)) == BLUETOOTH_BASE_UUID {
        Some(short as u16)
    } else {
        None
    }
}
