//! # BlueBird Connector
//!
//! 同时连接至多三台 BlueBird 机器人的交互式网关。
//!
//! ```bash
//! # 自动选择后端（Dongle -> 系统蓝牙 -> 助手进程）
//! bluebird-connector --scan
//!
//! # 指定串口 Dongle
//! bluebird-connector --backend dongle --port /dev/ttyACM0
//! ```
//!
//! ```text
//! bluebird> scan
//! bluebird> connect FN1234
//! bluebird> send A 900000ff
//! bluebird> slots
//! bluebird> exit
//! ```

use anyhow::{Context, Result};
use bluebird_driver::BackendPreference;
use bluebird_fleet::{FleetManager, GatewayConfig};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

mod frontend;
mod shell;

use frontend::LogFrontend;
use shell::Shell;

#[derive(Parser, Debug)]
#[command(name = "bluebird-connector")]
#[command(about = "Interactive gateway for BlueBird robots", long_about = None)]
#[command(version)]
struct Args {
    /// 配置文件（默认 `<config_dir>/bluebird/connector.toml`）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 后端：auto | dongle | system-bus | helper
    #[arg(short, long)]
    backend: Option<BackendPreference>,

    /// Dongle 串口，不指定时自动探测
    #[arg(short, long)]
    port: Option<String>,

    /// 助手进程可执行文件
    #[arg(long)]
    helper: Option<PathBuf>,

    /// 通信器就绪后立即扫描
    #[arg(long)]
    scan: bool,

    /// 日志级别（可被 RUST_LOG 覆盖）
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn gateway_config(&self) -> Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => GatewayConfig::load_default().context("Failed to load default config")?,
        };
        if let Some(backend) = self.backend {
            config.backend = backend.into();
        }
        if let Some(port) = &self.port {
            config.port = Some(port.clone());
        }
        if let Some(helper) = &self.helper {
            config.helper.program = Some(helper.clone());
        }
        config.scan_on_start |= self.scan;
        Ok(config)
    }
}

fn init_logging(level: &str) -> Result<()> {
    let directive = format!("bluebird={}", level)
        .parse()
        .context("Invalid log level")?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to install subscriber")?;

    // 依赖 `log` 的 crate（如 serialport）同样进入 tracing
    tracing_log::LogTracer::init().context("Failed to install log bridge")?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let config = args.gateway_config()?;
    info!(backend = ?config.backend, "starting connector");

    let frontend = Arc::new(LogFrontend::default());
    let fleet = FleetManager::new(
        config.builder(),
        config.supervisor_config(),
        frontend.clone(),
        frontend,
    )?;
    if config.scan_on_start {
        fleet.start_discovery();
    }

    let (interrupt_tx, interrupt_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })
    .context("Failed to install Ctrl+C handler")?;

    let result = Shell::new(&fleet).run(interrupt_rx);
    if let Err(e) = &result {
        warn!(error = %e, "shell stopped");
    }
    fleet.shutdown();
    result
}
