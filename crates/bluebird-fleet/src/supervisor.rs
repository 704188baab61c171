//! 适配器监督线程
//!
//! 唯一负责创建和 kill 通信器的线程。没有运行中的通信器时按固定间隔重试；
//! 通信器报告传输层丢失时立即被唤醒并替换它。

use crate::config::SupervisorConfig;
use crate::manager::{ActiveCommunicator, FleetEvents, FleetShared};
use bluebird_driver::{Communicator, CommunicatorBuilder, CommunicatorEvents, DriverError};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// 通信器工厂
pub trait CommunicatorFactory: Send + 'static {
    fn create(&self, events: Arc<dyn CommunicatorEvents>) -> Result<Arc<dyn Communicator>, DriverError>;
}

impl CommunicatorFactory for CommunicatorBuilder {
    fn create(&self, events: Arc<dyn CommunicatorEvents>) -> Result<Arc<dyn Communicator>, DriverError> {
        self.build(events)
    }
}

pub(crate) enum SupervisorSignal {
    /// 某一代通信器报告 `status_changed(false, _)`
    TransportLost(u64),
    Shutdown,
}

pub(crate) fn run(
    shared: Arc<FleetShared>,
    factory: Box<dyn CommunicatorFactory>,
    signals: Receiver<SupervisorSignal>,
    config: SupervisorConfig,
) {
    debug!(retry = ?config.retry_interval, "fleet supervisor started");
    loop {
        if needs_communicator(&shared) {
            replace(&shared, factory.as_ref());
        }
        match signals.recv_timeout(config.retry_interval) {
            Ok(SupervisorSignal::TransportLost(generation)) => {
                let matches = shared
                    .active
                    .load_full()
                    .is_some_and(|active| active.generation == generation);
                if !matches {
                    debug!(generation, "transport loss from retired communicator");
                }
            },
            Ok(SupervisorSignal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {},
        }
    }
    debug!("fleet supervisor stopped");
}

fn needs_communicator(shared: &FleetShared) -> bool {
    match shared.active.load_full() {
        Some(active) => !active.communicator.is_running(),
        None => true,
    }
}

/// kill 旧通信器（如果有）并尝试创建新的
fn replace(shared: &Arc<FleetShared>, factory: &dyn CommunicatorFactory) {
    if let Some(old) = shared.active.swap(None) {
        warn!(generation = old.generation, backend = %old.communicator.backend(), "communicator lost, replacing");
        // 先换代，旧通信器 kill 时产生的事件被忽略
        shared.generation.fetch_add(1, Ordering::AcqRel);
        shared.drop_live_slots();
        old.communicator.kill();
        shared.frontend().ble_status_changed(false, true);
    }

    let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
    let events: Arc<dyn CommunicatorEvents> = Arc::new(FleetEvents::new(shared, generation));
    match factory.create(events) {
        Ok(communicator) => {
            info!(generation, backend = %communicator.backend(), "communicator ready");
            shared.active.store(Some(Arc::new(ActiveCommunicator {
                communicator: communicator.clone(),
                generation,
            })));
            shared.frontend().ble_status_changed(true, true);
            if shared.scan_wanted.swap(false, Ordering::AcqRel) {
                info!("starting deferred scan");
                communicator.start_discovery();
            }
        },
        Err(e) => debug!(error = %e, "no communicator available, will retry"),
    }
}
