//! 串口 BLE Dongle 链路
//!
//! Dongle 通过 USB CDC 串口暴露 BGAPI 二进制协议。链路拆分为接收端和发送端：
//! 接收端由专用读线程持有，发送端由适配器的工作线程（以及同步读路径）共享。

use crate::TransportError;
use bluebird_protocol::bgapi::{Command, Message};

#[cfg(feature = "serial")]
pub mod serial;

/// 接收端：阻塞读取下一条完整消息
///
/// 实现需要设置读超时，超时返回 `TransportError::Timeout`，
/// 以便读线程周期性检查退出标志。
pub trait DongleRx: Send {
    fn receive(&mut self) -> Result<Message, TransportError>;
}

/// 发送端：编码并写出一条命令
pub trait DongleTx: Send {
    fn send(&mut self, command: &Command) -> Result<(), TransportError>;
}

/// 可拆分的 Dongle 链路
pub trait DongleLink {
    type Rx: DongleRx + 'static;
    type Tx: DongleTx + 'static;

    /// 链路描述（用于日志）
    fn describe(&self) -> String;

    /// 拆分为独立的接收端和发送端
    fn split(self) -> Result<(Self::Rx, Self::Tx), TransportError>;
}
