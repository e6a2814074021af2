use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 任务名称最大长度
pub const MAX_TASK_NAME_LEN: usize = 100;

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    Focus,
    ShortBreak,
    LongBreak,
}

impl SessionKind {
    pub fn is_break(self) -> bool {
        matches!(self, SessionKind::ShortBreak | SessionKind::LongBreak)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Focus => "focus",
            SessionKind::ShortBreak => "short-break",
            SessionKind::LongBreak => "long-break",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "focus" => Ok(SessionKind::Focus),
            "short-break" => Ok(SessionKind::ShortBreak),
            "long-break" => Ok(SessionKind::LongBreak),
            other => Err(format!("unknown session kind: {other}")),
        }
    }
}

/// 一次计时会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Option<i64>,
    /// 弱引用：任务删除后置空
    pub task_id: Option<i64>,
    pub kind: SessionKind,
    pub scheduled_ms: i64,
    pub start_time: DateTime<Utc>,
    /// 仅在 completed 为 true 时存在
    pub end_time: Option<DateTime<Utc>>,
    pub completed: bool,
    /// 通过重置丢弃的会话
    pub abandoned: bool,
    pub interruptions: u32,
    pub note: String,
}

impl Session {
    pub fn open(
        kind: SessionKind,
        task_id: Option<i64>,
        scheduled_ms: i64,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            task_id,
            kind,
            scheduled_ms,
            start_time,
            end_time: None,
            completed: false,
            abandoned: false,
            interruptions: 0,
            note: String::new(),
        }
    }

    /// 未结束、未完成、未放弃
    pub fn is_open(&self) -> bool {
        self.end_time.is_none() && !self.completed && !self.abandoned
    }

    /// 实际耗时（毫秒），未结束时为 0
    pub fn elapsed_ms(&self) -> i64 {
        match self.end_time {
            Some(end) => (end - self.start_time).num_milliseconds().max(0),
            None => 0,
        }
    }

    /// 实际耗时 / 计划时长，限制在 [0, 1]
    pub fn efficiency(&self) -> f64 {
        if self.scheduled_ms <= 0 {
            return 0.0;
        }
        (self.elapsed_ms() as f64 / self.scheduled_ms as f64).clamp(0.0, 1.0)
    }

    /// 每次打断扣 0.1
    pub fn quality(&self) -> f64 {
        (self.efficiency() - 0.1 * self.interruptions as f64).max(0.0)
    }

    /// 结束时间所在的本地日期
    pub fn local_day(&self) -> NaiveDate {
        self.end_time
            .unwrap_or(self.start_time)
            .with_timezone(&Local)
            .date_naive()
    }
}

/// 任务优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Priority {
    pub fn from_level(level: i32) -> Self {
        match level {
            1 => Priority::Low,
            2 => Priority::Medium,
            _ => Priority::High,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// 任务数据模型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Option<i64>,
    pub name: String,
    pub description: Option<String>,
    pub completed: bool,
    pub is_current: bool,
    pub estimated_pomodoros: u32,
    /// 可以超过预估值（表示超时）
    pub completed_pomodoros: u32,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(name: String) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            name,
            description: None,
            completed: false,
            is_current: false,
            estimated_pomodoros: 0,
            completed_pomodoros: 0,
            priority: Priority::Medium,
            created_at: now,
            updated_at: now,
        }
    }

    /// 名称不能为空且不超过 100 个字符
    pub fn validate(&self) -> Result<(), String> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err("task name must not be blank".to_string());
        }
        if name.chars().count() > MAX_TASK_NAME_LEN {
            return Err(format!(
                "task name must be at most {MAX_TASK_NAME_LEN} characters"
            ));
        }
        Ok(())
    }

    pub fn is_overdue(&self) -> bool {
        self.estimated_pomodoros > 0 && self.completed_pomodoros > self.estimated_pomodoros
    }
}

/// 每日统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub day: NaiveDate,
    pub completed_focus: u32,
    pub completed_breaks: u32,
    pub total_focus_ms: i64,
    pub total_break_ms: i64,
    /// 专注会话质量的滚动平均
    pub average_quality: f64,
    pub completed_tasks: u32,
    pub total_interruptions: u32,
}

impl DailyStats {
    pub fn empty(day: NaiveDate) -> Self {
        Self {
            day,
            completed_focus: 0,
            completed_breaks: 0,
            total_focus_ms: 0,
            total_break_ms: 0,
            average_quality: 0.0,
            completed_tasks: 0,
            total_interruptions: 0,
        }
    }

    /// 合并一个已完成的会话
    pub fn absorb(&mut self, session: &Session) {
        let counted_ms = (session.efficiency() * session.scheduled_ms as f64).round() as i64;
        match session.kind {
            SessionKind::Focus => {
                let n = self.completed_focus as f64;
                self.average_quality = (self.average_quality * n + session.quality()) / (n + 1.0);
                self.completed_focus += 1;
                self.total_focus_ms += counted_ms;
            }
            SessionKind::ShortBreak | SessionKind::LongBreak => {
                self.completed_breaks += 1;
                self.total_break_ms += counted_ms;
            }
        }
        self.total_interruptions += session.interruptions;
    }
}
