// 计时引擎依赖的存储接口

use chrono::NaiveDate;

use crate::error::StoreError;
use crate::models::{DailyStats, Session, Task};

/// 会话记录
pub trait SessionStore: Send + Sync {
    /// 写入新会话，返回 id
    fn insert(&self, session: &Session) -> Result<i64, StoreError>;
    fn update(&self, session: &Session) -> Result<(), StoreError>;
    fn get(&self, id: i64) -> Result<Option<Session>, StoreError>;
    /// 未结束的会话（最多一个）
    fn get_open(&self) -> Result<Option<Session>, StoreError>;
    fn sessions_on(&self, day: NaiveDate) -> Result<Vec<Session>, StoreError>;
    fn sessions_for_task(&self, task_id: i64) -> Result<Vec<Session>, StoreError>;
}

/// 任务记录
pub trait TaskStore: Send + Sync {
    fn create(&self, task: &Task) -> Result<i64, StoreError>;
    fn get(&self, id: i64) -> Result<Option<Task>, StoreError>;
    fn list(&self) -> Result<Vec<Task>, StoreError>;
    fn get_current(&self) -> Result<Option<Task>, StoreError>;
    /// 设为当前任务，同时清除其他任务的标记
    fn set_current(&self, id: i64) -> Result<(), StoreError>;
    /// 标记完成；任务已经完成时返回 false
    fn complete(&self, id: i64) -> Result<bool, StoreError>;
    fn delete(&self, id: i64) -> Result<(), StoreError>;
    fn increment_completed_pomodoro(&self, id: i64) -> Result<(), StoreError>;
}

/// 每日统计
pub trait StatsAggregator: Send + Sync {
    fn record_completed_session(&self, session: &Session) -> Result<(), StoreError>;
    fn record_completed_task(&self, day: NaiveDate) -> Result<(), StoreError>;
    /// 没有记录时返回全零
    fn day_stats(&self, day: NaiveDate) -> Result<DailyStats, StoreError>;
    fn range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailyStats>, StoreError>;
}
