//! Builder 模式实现
//!
//! 按偏好选择并启动一个通信器后端。

use crate::communicator::{Backend, BackendPreference, Communicator, CommunicatorEvents};
use crate::config::CommunicatorConfig;
use crate::error::DriverError;
use crate::helper::HelperCommunicator;
use crate::system_bus::SystemBusCommunicator;
use bluebird_transport::SystemBus;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 通信器 Builder
///
/// `build` 只返回处于运行状态的适配器；启动后未运行的实例会被立即 kill。
///
/// # Example
///
/// ```no_run
/// use bluebird_driver::{BackendPreference, CommunicatorBuilder, CommunicatorEvents};
/// # use std::sync::Arc;
/// # fn events() -> Arc<dyn CommunicatorEvents> { unimplemented!() }
///
/// // 自动探测：Dongle -> 系统总线 -> 助手进程
/// let communicator = CommunicatorBuilder::new().build(events()).unwrap();
///
/// // 指定串口
/// let communicator = CommunicatorBuilder::new()
///     .backend(BackendPreference::Dongle)
///     .port("/dev/ttyACM0")
///     .build(events())
///     .unwrap();
/// ```
#[derive(Clone, Default)]
pub struct CommunicatorBuilder {
    preference: BackendPreference,
    config: CommunicatorConfig,
    /// 注入的系统总线实现（未设置时使用平台默认）
    bus: Option<Arc<dyn SystemBus>>,
}

impl CommunicatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 显式指定后端（可选，默认 Auto）
    pub fn backend(mut self, preference: BackendPreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn config(mut self, config: CommunicatorConfig) -> Self {
        self.config = config;
        self
    }

    /// 设置 Dongle 串口路径（可选，默认按 USB VID/PID 查找）
    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.config.dongle.port = Some(port.into());
        self
    }

    /// 设置助手程序（不设置时跳过助手后端）
    ///
    /// ```no_run
    /// use bluebird_driver::{BackendPreference, CommunicatorBuilder};
    ///
    /// let builder = CommunicatorBuilder::new()
    ///     .backend(BackendPreference::Helper)
    ///     .helper_program("/usr/local/bin/bluebird-helper");
    /// ```
    pub fn helper_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.config.helper.program = Some(program.into());
        self
    }

    /// 使用给定的系统总线实现
    pub fn system_bus(mut self, bus: Arc<dyn SystemBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn preference(&self) -> BackendPreference {
        self.preference
    }

    pub fn communicator_config(&self) -> &CommunicatorConfig {
        &self.config
    }

    /// 构建并启动通信器
    ///
    /// # Errors
    /// - `DriverError::NoTransport`: 没有后端进入运行状态
    pub fn build(&self, events: Arc<dyn CommunicatorEvents>) -> Result<Arc<dyn Communicator>, DriverError> {
        let candidates: &[Backend] = match self.preference {
            BackendPreference::Auto => &[Backend::Dongle, Backend::SystemBus, Backend::Helper],
            BackendPreference::Dongle => &[Backend::Dongle],
            BackendPreference::SystemBus => &[Backend::SystemBus],
            BackendPreference::Helper => &[Backend::Helper],
        };

        for &backend in candidates {
            match self.start(backend, events.clone()) {
                Ok(communicator) if communicator.is_running() => {
                    info!(%backend, "communicator started");
                    return Ok(communicator);
                },
                Ok(communicator) => {
                    debug!(%backend, "backend started without transport, discarding");
                    communicator.kill();
                },
                Err(e) => debug!(%backend, error = %e, "backend unavailable"),
            }
        }
        warn!(preference = ?self.preference, "no communicator backend available");
        Err(DriverError::NoTransport)
    }

    fn start(
        &self,
        backend: Backend,
        events: Arc<dyn CommunicatorEvents>,
    ) -> Result<Arc<dyn Communicator>, DriverError> {
        match backend {
            Backend::Dongle => self.start_dongle(events),
            Backend::SystemBus => self.start_bus(events),
            Backend::Helper => {
                let communicator = HelperCommunicator::spawn(&self.config, events)?;
                Ok(Arc::new(communicator))
            },
        }
    }

    #[cfg(feature = "serial")]
    fn start_dongle(&self, events: Arc<dyn CommunicatorEvents>) -> Result<Arc<dyn Communicator>, DriverError> {
        let communicator = crate::dongle::DongleCommunicator::open(&self.config, events)?;
        Ok(Arc::new(communicator))
    }

    #[cfg(not(feature = "serial"))]
    fn start_dongle(&self, _events: Arc<dyn CommunicatorEvents>) -> Result<Arc<dyn Communicator>, DriverError> {
        Err(DriverError::NoTransport)
    }

    fn start_bus(&self, events: Arc<dyn CommunicatorEvents>) -> Result<Arc<dyn Communicator>, DriverError> {
        if let Some(bus) = &self.bus {
            let communicator = SystemBusCommunicator::new(bus.clone(), &self.config, events)?;
            return Ok(Arc::new(communicator));
        }
        self.start_platform_bus(events)
    }

    #[cfg(all(feature = "bluez", target_os = "linux"))]
    fn start_platform_bus(&self, events: Arc<dyn CommunicatorEvents>) -> Result<Arc<dyn Communicator>, DriverError> {
        let communicator = SystemBusCommunicator::bluez(&self.config, events)?;
        Ok(Arc::new(communicator))
    }

    #[cfg(not(all(feature = "bluez", target_os = "linux")))]
    fn start_platform_bus(&self, _events: Arc<dyn CommunicatorEvents>) -> Result<Arc<dyn Communicator>, DriverError> {
        Err(DriverError::NoTransport)
    }
}

impl std::fmt::Debug for CommunicatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicatorBuilder")
            .field("preference", &self.preference)
            .field("config", &self.config)
            .field("bus", &self.bus.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_builder_overrides() {
        let builder = CommunicatorBuilder::new()
            .backend(BackendPreference::Helper)
            .port("/dev/ttyACM1")
            .helper_program("/opt/helper");
        assert_eq!(builder.preference(), BackendPreference::Helper);
        assert_eq!(builder.communicator_config().dongle.port.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(
            builder.communicator_config().helper.program,
            Some(PathBuf::from("/opt/helper"))
        );
        assert_eq!(builder.communicator_config().connect_timeout, Duration::from_secs(3));
    }
}
