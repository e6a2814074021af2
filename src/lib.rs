// 专注计时器：会话计时、任务进度和每日统计

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod ipc;
pub mod models;
pub mod notify;
pub mod pomodoro;
pub mod rules;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigFile, ConfigProvider};
pub use db::Database;
pub use error::{SideEffectStep, StoreError, TimerError};
pub use models::{DailyStats, Priority, Session, SessionKind, Task};
pub use pomodoro::{EngineEvent, EngineParts, RetryPolicy, TickOutcome, TimerEngine, TimerSnapshot, TimerState};
pub use store::{SessionStore, StatsAggregator, TaskStore};
