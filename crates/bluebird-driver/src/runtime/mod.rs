//! 适配器运行时：工作队列 + 工作线程 + 定时器
//!
//! 每个适配器实例拥有一个 [`AdapterRuntime`]。设备表只存在于工作线程独占的状态 `S` 中，
//! 其它线程通过 [`AdapterRuntime::submit`] 投递工作。

mod scheduler;
mod work_queue;

pub use scheduler::{Scheduler, TimerHandle};
pub use work_queue::{WorkItem, WorkQueue, Worker};

use crate::error::DriverError;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// 适配器运行时
pub struct AdapterRuntime<S> {
    name: String,
    queue: Arc<WorkQueue<S>>,
    scheduler: Arc<Scheduler>,
    worker: Mutex<Option<Worker<S>>>,
}

impl<S: Send + 'static> AdapterRuntime<S> {
    /// 创建队列与定时器线程（工作线程在 [`spawn`](Self::spawn) 时启动）
    pub fn new(name: &str) -> Result<Self, DriverError> {
        Ok(Self {
            name: name.to_string(),
            queue: Arc::new(WorkQueue::new()),
            scheduler: Arc::new(Scheduler::new(&format!("{}-timer", name))?),
            worker: Mutex::new(None),
        })
    }

    /// 启动工作线程并交出状态
    pub fn spawn(&self, state: S) -> Result<(), DriverError> {
        let worker = Worker::spawn(&format!("{}-worker", self.name), state, self.queue.clone())?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    pub fn queue(&self) -> &Arc<WorkQueue<S>> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// 投递工作，队列已关闭时记录日志并返回 false
    pub fn submit(
        &self,
        description: &str,
        key: &str,
        action: impl FnOnce(&mut S) + Send + 'static,
    ) -> bool {
        let accepted = self.queue.push(description, key, action);
        if !accepted {
            debug!("{}: '{}' ignored, adapter stopped", self.name, description);
        }
        accepted
    }

    /// 停止工作线程并取回状态，重复调用返回 `None`
    pub fn shutdown(&self) -> Option<S> {
        let mut worker = self.worker.lock().take()?;
        worker.shutdown()
    }

    pub fn is_stopped(&self) -> bool {
        self.queue.is_closed()
    }
}
