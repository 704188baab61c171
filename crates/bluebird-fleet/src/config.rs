//! 网关配置文件
//!
//! TOML 格式，所有时间以毫秒表示。缺失的字段使用默认值：
//!
//! ```toml
//! backend = "auto"          # auto | dongle | system-bus | helper
//! port = "/dev/ttyACM0"
//! rssi_threshold = 20
//! scan_on_start = false
//!
//! [helper]
//! program = "/usr/local/bin/bluebird-helper"
//! args = []
//!
//! [timeouts]
//! connect_ms = 3000
//! helper_connect_ms = 7000
//! helper_startup_ms = 5000
//! discovery_window_ms = 8000
//! retry_interval_ms = 5000
//! ```

use crate::error::ConfigError;
use bluebird_driver::{BackendPreference, CommunicatorBuilder, CommunicatorConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// 后端选择（配置文件中的写法）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendChoice {
    #[default]
    Auto,
    Dongle,
    SystemBus,
    Helper,
}

impl From<BackendChoice> for BackendPreference {
    fn from(choice: BackendChoice) -> Self {
        match choice {
            BackendChoice::Auto => BackendPreference::Auto,
            BackendChoice::Dongle => BackendPreference::Dongle,
            BackendChoice::SystemBus => BackendPreference::SystemBus,
            BackendChoice::Helper => BackendPreference::Helper,
        }
    }
}

impl From<BackendPreference> for BackendChoice {
    fn from(preference: BackendPreference) -> Self {
        match preference {
            BackendPreference::Auto => BackendChoice::Auto,
            BackendPreference::Dongle => BackendChoice::Dongle,
            BackendPreference::SystemBus => BackendChoice::SystemBus,
            BackendPreference::Helper => BackendChoice::Helper,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperSection {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub connect_ms: u64,
    pub helper_connect_ms: u64,
    pub helper_startup_ms: u64,
    pub discovery_window_ms: u64,
    pub retry_interval_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect_ms: 3000,
            helper_connect_ms: 7000,
            helper_startup_ms: 5000,
            discovery_window_ms: 8000,
            retry_interval_ms: 5000,
        }
    }
}

/// 网关配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub backend: BackendChoice,
    pub port: Option<String>,
    pub helper: HelperSection,
    pub timeouts: TimeoutSection,
    pub rssi_threshold: i16,
    pub scan_on_start: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Auto,
            port: None,
            helper: HelperSection::default(),
            timeouts: TimeoutSection::default(),
            rssi_threshold: bluebird_driver::device::DEFAULT_RSSI_THRESHOLD,
            scan_on_start: false,
        }
    }
}

impl GatewayConfig {
    /// 默认配置文件路径：`<config_dir>/bluebird/connector.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("bluebird").join("connector.toml"))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// 加载默认路径下的配置，文件不存在时返回默认值
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                debug!(path = %path.display(), "loading gateway config");
                Self::load(&path)
            },
            _ => Ok(Self::default()),
        }
    }

    pub fn communicator_config(&self) -> CommunicatorConfig {
        let mut config = CommunicatorConfig {
            connect_timeout: Duration::from_millis(self.timeouts.connect_ms),
            rssi_threshold: self.rssi_threshold,
            ..CommunicatorConfig::default()
        };
        config.dongle.port = self.port.clone();
        config.bus.discovery_window = Duration::from_millis(self.timeouts.discovery_window_ms);
        config.helper.program = self.helper.program.clone();
        config.helper.args = self.helper.args.clone();
        config.helper.connect_timeout = Duration::from_millis(self.timeouts.helper_connect_ms);
        config.helper.startup_timeout = Duration::from_millis(self.timeouts.helper_startup_ms);
        config
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            retry_interval: Duration::from_millis(self.timeouts.retry_interval_ms),
        }
    }

    /// 按配置创建通信器 Builder
    pub fn builder(&self) -> CommunicatorBuilder {
        CommunicatorBuilder::new()
            .backend(self.backend.into())
            .config(self.communicator_config())
    }
}

/// 适配器监督线程配置
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// 没有运行中的适配器时的重试间隔
    pub retry_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = GatewayConfig::from_toml_str("").unwrap();
        assert_eq!(config, GatewayConfig::default());

        let communicator = config.communicator_config();
        assert_eq!(communicator.connect_timeout, Duration::from_secs(3));
        assert_eq!(communicator.helper.connect_timeout, Duration::from_secs(7));
        assert_eq!(communicator.bus.discovery_window, Duration::from_secs(8));
        assert_eq!(config.supervisor_config().retry_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_full_config() {
        let config = GatewayConfig::from_toml_str(
            r#"
            backend = "system-bus"
            port = "/dev/ttyACM3"
            rssi_threshold = 12
            scan_on_start = true

            [helper]
            program = "/opt/bluebird/helper"
            args = ["--verbose"]

            [timeouts]
            connect_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.backend, BackendChoice::SystemBus);
        assert!(config.scan_on_start);
        assert_eq!(config.timeouts.connect_ms, 1500);
        assert_eq!(config.timeouts.helper_connect_ms, 7000);

        let communicator = config.communicator_config();
        assert_eq!(communicator.dongle.port.as_deref(), Some("/dev/ttyACM3"));
        assert_eq!(communicator.rssi_threshold, 12);
        assert_eq!(communicator.connect_timeout, Duration::from_millis(1500));
        assert_eq!(communicator.helper.args, vec!["--verbose".to_string()]);
        assert_eq!(config.builder().preference(), BackendPreference::SystemBus);
    }

    #[test]
    fn test_invalid_backend_rejected() {
        let err = GatewayConfig::from_toml_str(r#"backend = "usb""#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backend = \"helper\"\nscan_on_start = true").unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.backend, BackendChoice::Helper);
        assert!(config.scan_on_start);

        let missing = GatewayConfig::load(Path::new("/nonexistent/bluebird.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
