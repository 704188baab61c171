//! 单所有者工作队列
//!
//! 适配器的全部状态 `S` 只由一个工作线程持有，其它线程（公开接口调用方、
//! 传输层信号线程、定时器线程）只能向队列投递闭包。

use crate::error::DriverError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, trace};

type Action<S> = Box<dyn FnOnce(&mut S) + Send>;

/// 工作项
pub struct WorkItem<S> {
    /// 可读描述（日志用）
    pub description: String,
    /// 关联的设备键，全局工作为空串
    pub key: String,
    action: Action<S>,
}

impl<S> WorkItem<S> {
    pub fn new(
        description: impl Into<String>,
        key: impl Into<String>,
        action: impl FnOnce(&mut S) + Send + 'static,
    ) -> Self {
        Self {
            description: description.into(),
            key: key.into(),
            action: Box::new(action),
        }
    }

    pub fn run(self, state: &mut S) {
        (self.action)(state)
    }
}

struct QueueState<S> {
    items: VecDeque<WorkItem<S>>,
    closed: bool,
}

/// FIFO 工作队列（支持队首插入与按条件清除）
pub struct WorkQueue<S> {
    state: Mutex<QueueState<S>>,
    ready: Condvar,
}

impl<S> Default for WorkQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> WorkQueue<S> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// 追加到队尾，队列已关闭时返回 false
    pub fn push(
        &self,
        description: impl Into<String>,
        key: impl Into<String>,
        action: impl FnOnce(&mut S) + Send + 'static,
    ) -> bool {
        self.enqueue(WorkItem::new(description, key, action), false)
    }

    /// 插入到队首（设备移除工作用）
    pub fn push_front(
        &self,
        description: impl Into<String>,
        key: impl Into<String>,
        action: impl FnOnce(&mut S) + Send + 'static,
    ) -> bool {
        self.enqueue(WorkItem::new(description, key, action), true)
    }

    fn enqueue(&self, item: WorkItem<S>, front: bool) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            trace!("Dropping work '{}' on closed queue", item.description);
            return false;
        }
        if front {
            state.items.push_front(item);
        } else {
            state.items.push_back(item);
        }
        self.ready.notify_one();
        true
    }

    /// 删除所有满足条件的待处理工作，返回删除数量
    pub fn purge(&self, mut predicate: impl FnMut(&WorkItem<S>) -> bool) -> usize {
        let mut state = self.state.lock();
        let before = state.items.len();
        state.items.retain(|item| !predicate(item));
        before - state.items.len()
    }

    /// 阻塞取出下一项，队列关闭后返回 `None`
    pub fn pop(&self) -> Option<WorkItem<S>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            self.ready.wait(&mut state);
        }
    }

    /// 关闭队列，丢弃尚未执行的工作
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.items.clear();
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 工作线程：独占状态 `S` 并依次执行队列中的工作
pub struct Worker<S> {
    queue: Arc<WorkQueue<S>>,
    handle: Option<JoinHandle<S>>,
}

impl<S: Send + 'static> Worker<S> {
    /// 启动具名工作线程
    pub fn spawn(name: &str, state: S, queue: Arc<WorkQueue<S>>) -> Result<Self, DriverError> {
        let thread_queue = queue.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut state = state;
                while let Some(item) = thread_queue.pop() {
                    trace!(work = %item.description, key = %item.key, "run");
                    item.run(&mut state);
                }
                state
            })
            .map_err(|e| DriverError::IoThread(e.to_string()))?;
        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    pub fn queue(&self) -> &Arc<WorkQueue<S>> {
        &self.queue
    }

    /// 关闭队列并等待线程退出，交还状态
    ///
    /// 当前正在执行的工作会先完成。线程 panic 时返回 `None`（状态已在展开时释放）。
    pub fn shutdown(&mut self) -> Option<S> {
        self.queue.close();
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(state) => Some(state),
            Err(_) => {
                error!("Worker thread panicked");
                None
            },
        }
    }
}

impl<S> Drop for Worker<S> {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("Worker thread panicked during drop");
        }
    }
}
