//! 基于 `serialport` 的 Dongle 串口实现

use super::{DongleLink, DongleRx, DongleTx};
use crate::{TransportDeviceError, TransportDeviceErrorKind, TransportError};
use bluebird_protocol::bgapi::{Command, FrameDecoder, Message};
use serialport::{SerialPort, SerialPortType};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Dongle USB VID（Bluegiga）
pub const DONGLE_USB_VID: u16 = 0x2458;

/// Dongle USB PID（BLED112）
pub const DONGLE_USB_PID: u16 = 0x0001;

/// 串口波特率（USB CDC 下实际被忽略，但需要给出）
pub const BAUD_RATE: u32 = 115_200;

/// 默认读超时（读线程每个超时周期检查一次退出标志）
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// 已打开的 Dongle 串口
pub struct SerialDongle {
    port: Box<dyn SerialPort>,
    path: String,
}

impl SerialDongle {
    /// 打开指定串口
    pub fn open(path: &str) -> Result<Self, TransportError> {
        Self::open_with_timeout(path, DEFAULT_READ_TIMEOUT)
    }

    pub fn open_with_timeout(path: &str, read_timeout: Duration) -> Result<Self, TransportError> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(read_timeout)
            .open()
            .map_err(|e| map_serial_error(path, e))?;
        debug!("Opened dongle serial port {}", path);
        Ok(Self {
            port,
            path: path.to_string(),
        })
    }

    /// 按 USB VID:PID 查找第一个 Dongle 串口
    pub fn find_port() -> Result<String, TransportError> {
        let ports = serialport::available_ports().map_err(|e| map_serial_error("<enumerate>", e))?;
        ports
            .into_iter()
            .find(|info| {
                matches!(
                    &info.port_type,
                    SerialPortType::UsbPort(usb) if usb.vid == DONGLE_USB_VID && usb.pid == DONGLE_USB_PID
                )
            })
            .map(|info| info.port_name)
            .ok_or_else(|| {
                TransportDeviceError::new(
                    TransportDeviceErrorKind::NotFound,
                    format!(
                        "no serial port with USB id {:04x}:{:04x}",
                        DONGLE_USB_VID, DONGLE_USB_PID
                    ),
                )
                .into()
            })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl DongleLink for SerialDongle {
    type Rx = SerialDongleRx;
    type Tx = SerialDongleTx;

    fn describe(&self) -> String {
        format!("serial:{}", self.path)
    }

    fn split(self) -> Result<(Self::Rx, Self::Tx), TransportError> {
        let tx_port = self
            .port
            .try_clone()
            .map_err(|e| map_serial_error(&self.path, e))?;
        Ok((
            SerialDongleRx {
                port: self.port,
                decoder: FrameDecoder::new(),
                buf: [0u8; 256],
            },
            SerialDongleTx { port: tx_port },
        ))
    }
}

/// 串口接收端
pub struct SerialDongleRx {
    port: Box<dyn SerialPort>,
    decoder: FrameDecoder,
    buf: [u8; 256],
}

impl DongleRx for SerialDongleRx {
    fn receive(&mut self) -> Result<Message, TransportError> {
        loop {
            // 先消费缓冲区中已有的完整帧
            while let Some(result) = self.decoder.next_message() {
                match result {
                    Ok(message) => return Ok(message),
                    Err(e) => warn!("Dropping malformed dongle frame: {}", e),
                }
            }

            match self.port.read(&mut self.buf) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => {
                    trace!("dongle rx {} bytes", n);
                    self.decoder.push(&self.buf[..n]);
                },
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(TransportError::Timeout),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }
}

/// 串口发送端
pub struct SerialDongleTx {
    port: Box<dyn SerialPort>,
}

impl DongleTx for SerialDongleTx {
    fn send(&mut self, command: &Command) -> Result<(), TransportError> {
        let frame = command.encode();
        trace!("dongle tx {:?}", command);
        self.port.write_all(&frame)?;
        self.port.flush()?;
        Ok(())
    }
}

/// serialport 错误映射为传输层错误
fn map_serial_error(path: &str, e: serialport::Error) -> TransportError {
    let kind = match e.kind() {
        serialport::ErrorKind::NoDevice => TransportDeviceErrorKind::NotFound,
        serialport::ErrorKind::InvalidInput => TransportDeviceErrorKind::InvalidResponse,
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            TransportDeviceErrorKind::AccessDenied
        },
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => TransportDeviceErrorKind::NotFound,
        serialport::ErrorKind::Io(_) => TransportDeviceErrorKind::Backend,
        serialport::ErrorKind::Unknown => TransportDeviceErrorKind::Unknown,
    };
    TransportDeviceError::new(kind, format!("{}: {}", path, e.description)).into()
}
