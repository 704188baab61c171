//! 一次性定时器
//!
//! 每个适配器一个定时器线程：截止时间小根堆 + crossbeam 通道，
//! 线程用 `recv_timeout(最近截止时间)` 阻塞等待，不做轮询。
//! 回调在定时器线程上执行，只应向工作队列投递工作。

use crate::error::DriverError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, trace};

type Callback = Box<dyn FnOnce() + Send>;

enum TimerCommand {
    Schedule {
        id: u64,
        deadline: Instant,
        cancelled: Arc<AtomicBool>,
        callback: Callback,
    },
    Shutdown,
}

/// 定时器句柄
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 取消定时器
    ///
    /// 返回后回调不会再开始执行（除非已经被定时器线程取出）。
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// 定时器线程
pub struct Scheduler {
    tx: Sender<TimerCommand>,
    next_id: AtomicU64,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(name: &str) -> Result<Self, DriverError> {
        let (tx, rx) = unbounded();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || timer_loop(rx))
            .map_err(|e| DriverError::IoThread(e.to_string()))?;
        Ok(Self {
            tx,
            next_id: AtomicU64::new(1),
            handle: Some(handle),
        })
    }

    /// 在 `delay` 之后执行一次 `callback`
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let command = TimerCommand::Schedule {
            id,
            deadline: Instant::now() + delay,
            cancelled: cancelled.clone(),
            callback: Box::new(callback),
        };
        if self.tx.send(command).is_err() {
            // 定时器线程已退出：句柄直接处于取消状态
            cancelled.store(true, Ordering::Release);
        }
        TimerHandle { id, cancelled }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.tx.send(TimerCommand::Shutdown);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("Timer thread panicked");
        }
    }
}

struct Pending {
    cancelled: Arc<AtomicBool>,
    callback: Callback,
}

fn timer_loop(rx: Receiver<TimerCommand>) {
    // (截止时间, id) 小根堆；id 保证同一截止时间按调度顺序触发
    let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut pending: HashMap<u64, Pending> = HashMap::new();

    loop {
        let command = match heap.peek() {
            Some(Reverse((deadline, _))) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                rx.recv_timeout(wait)
            },
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match command {
            Ok(TimerCommand::Schedule {
                id,
                deadline,
                cancelled,
                callback,
            }) => {
                heap.push(Reverse((deadline, id)));
                pending.insert(
                    id,
                    Pending {
                        cancelled,
                        callback,
                    },
                );
            },
            Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {},
        }

        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = heap.peek().copied() {
            if deadline > now {
                break;
            }
            heap.pop();
            if let Some(entry) = pending.remove(&id) {
                if entry.cancelled.load(Ordering::Acquire) {
                    trace!(timer = id, "skipped cancelled timer");
                    continue;
                }
                (entry.callback)();
            }
        }
    }
    trace!("Timer thread exiting with {} pending", pending.len());
}
