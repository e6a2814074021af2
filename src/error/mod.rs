use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

use crate::pomodoro::TimerState;

/// 计时引擎返回给调用方的错误
#[derive(Error, Debug)]
pub enum TimerError {
    /// 已经存在一个未结束的会话
    #[error("a session is already open")]
    AlreadyRunning,

    /// 当前没有可操作的会话
    #[error("no active session")]
    NoActiveSession,

    /// 状态不允许该命令（例如暂停一个已暂停的会话）
    #[error("cannot {command} while {state:?}")]
    InvalidTransition {
        command: &'static str,
        state: TimerState,
    },

    #[error("invalid duration: {ms} ms (must be within 1 ms..=2 h)")]
    InvalidDuration { ms: i64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// 会话记录写入失败，状态转换被挂起
    #[error("failed to persist session: {0}")]
    PersistenceFailure(#[source] StoreError),

    /// 任务或统计更新失败，不影响状态转换
    #[error("{step} update failed: {source}")]
    SideEffectFailure {
        step: SideEffectStep,
        #[source]
        source: StoreError,
    },

    /// 会话已到时但尚未写入，完成前不接受其他命令
    #[error("session completion due at {due} is not persisted yet")]
    CompletionPending {
        session_id: Option<i64>,
        due: DateTime<Utc>,
    },

    /// 引擎任务已退出
    #[error("timer engine is not running")]
    EngineStopped,
}

impl TimerError {
    /// 稳定的错误代码，用于 IPC 响应
    pub fn code(&self) -> &'static str {
        match self {
            TimerError::AlreadyRunning => "already_running",
            TimerError::NoActiveSession => "no_active_session",
            TimerError::InvalidTransition { .. } => "invalid_transition",
            TimerError::InvalidDuration { .. } => "invalid_duration",
            TimerError::InvalidConfig(_) => "invalid_config",
            TimerError::PersistenceFailure(_) => "persistence_failure",
            TimerError::SideEffectFailure { .. } => "side_effect_failure",
            TimerError::CompletionPending { .. } => "completion_pending",
            TimerError::EngineStopped => "engine_stopped",
        }
    }
}

/// 完成流程中可以独立失败的步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectStep {
    TaskProgress,
    Statistics,
}

impl std::fmt::Display for SideEffectStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SideEffectStep::TaskProgress => write!(f, "task progress"),
            SideEffectStep::Statistics => write!(f, "statistics"),
        }
    }
}

/// 存储层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("session {existing} is still open")]
    OpenSessionExists { existing: i64 },

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("{key} = {value} is out of range [{min}, {max}]")]
    OutOfRange {
        key: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}
