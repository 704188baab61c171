//! 编排层
//!
//! - [`FleetManager`]: 三个连接槽位（A/B/C）与请求路由
//! - [`supervisor`]: 通信器的创建、重试与替换
//! - [`GatewayConfig`]: TOML 配置文件
//!
//! 没有全局单例：编排器在进程启动时显式构造，以 `Weak` 句柄的形式交给通信器作为事件接收方。

pub mod config;
mod error;
mod manager;
pub mod notify;
pub mod slot;
pub mod supervisor;

pub use config::{BackendChoice, GatewayConfig, SupervisorConfig};
pub use error::{ConfigError, FleetError};
pub use manager::FleetManager;
pub use notify::{FrontendNotifier, SensorSink};
pub use slot::{SLOT_COUNT, SlotId, SlotSnapshot, SlotStatus};
pub use supervisor::CommunicatorFactory;
