// 时间来源和周期 tick
// tick 携带订阅时的运行代数，暂停或重置后的旧 tick 会被引擎丢弃

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 引擎读取 tick 的通道，消息内容是运行代数
pub type TickSender = mpsc::UnboundedSender<u64>;
pub type TickReceiver = mpsc::UnboundedReceiver<u64>;

pub fn tick_channel() -> (TickSender, TickReceiver) {
    mpsc::unbounded_channel()
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// 每隔 interval 向 sink 发送 generation，直到句柄被取消或丢弃
    fn subscribe_tick(&self, interval: Duration, generation: u64, sink: TickSender) -> TickHandle;
}

/// 可取消的 tick 订阅，丢弃即取消
pub struct TickHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TickHandle {
    pub fn new<F: FnOnce() + Send + 'static>(cancel: F) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TickHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TickHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// 系统时钟，基于 tokio interval，必须在运行时内使用
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn subscribe_tick(&self, interval: Duration, generation: u64, sink: TickSender) -> TickHandle {
        let handle: JoinHandle<()> = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次 tick 立即返回，跳过
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sink.send(generation).is_err() {
                    break;
                }
            }
        });
        TickHandle::new(move || handle.abort())
    }
}

/// 虚拟时钟，只有调用 advance 才会前进
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    active_subscriptions: Arc<AtomicUsize>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
            active_subscriptions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = match self.now.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *now += by;
    }

    /// 尚未取消的订阅数
    pub fn active_subscriptions(&self) -> usize {
        self.active_subscriptions.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn subscribe_tick(&self, _interval: Duration, _generation: u64, _sink: TickSender) -> TickHandle {
        let counter = Arc::clone(&self.active_subscriptions);
        counter.fetch_add(1, Ordering::SeqCst);
        TickHandle::new(move || {
            counter.fetch_sub(1, Ordering::SeqCst);
        })
    }
}
