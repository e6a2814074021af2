// 计时引擎：持有唯一的活动会话
//
// 命令和 tick 由 runtime 逐个送入；剩余时间每次都按时钟重新计算，不做倒数。
//
// Idle ──start──▶ Running ◀──resume── Paused
//  ▲               │  │ └────pause──────▲
//  │               │  └──tick, remaining ≤ 0──▶ Completed ──start──▶ Running
//  └────reset──────┘

mod completion;
pub mod runtime;

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{Clock, TickHandle, TickSender};
use crate::config::ConfigProvider;
use crate::error::{SideEffectStep, StoreError, TimerError};
use crate::models::{Session, SessionKind};
use crate::rules;
use crate::store::{SessionStore, StatsAggregator, TaskStore};

pub use completion::CompletionReport;

const EVENT_CAPACITY: usize = 256;

/// 计时器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerState {
    Idle,
    Running,
    Paused,
    /// 自然完成，等待下一次 start
    Completed,
}

/// 发给观察者的只读快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub state: TimerState,
    pub session_kind: SessionKind,
    pub remaining_ms: i64,
    pub session_id: Option<i64>,
    pub task_id: Option<i64>,
    pub interruptions: u32,
    /// 建议的下一个会话类型
    pub next_kind: SessionKind,
    pub completed_focus: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Snapshot(TimerSnapshot),
    SessionCompleted {
        session: Session,
        next_kind: SessionKind,
    },
    SideEffectFailed {
        step: SideEffectStep,
        session_id: Option<i64>,
        message: String,
    },
    /// 会话记录写入失败，完成被挂起到下一次 tick
    PersistenceFailed {
        session_id: Option<i64>,
        message: String,
    },
}

/// tick 的处理结果
#[derive(Debug)]
pub enum TickOutcome {
    /// 过期的 tick（已暂停、已重置或属于上一轮）
    Ignored,
    Running { remaining_ms: i64 },
    Completed(Box<CompletionReport>),
}

/// 存储写入的重试策略（指数退避）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// 不等待，适合测试
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base_delay: Duration::ZERO,
        }
    }

    pub async fn run<T, F>(&self, what: &'static str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts => {
                    warn!(what, attempt, error = %e, "store write failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// 引擎的外部依赖
#[derive(Clone)]
pub struct EngineParts {
    pub clock: Arc<dyn Clock>,
    pub sessions: Arc<dyn SessionStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub stats: Arc<dyn StatsAggregator>,
    pub config: Arc<dyn ConfigProvider>,
}

/// 当前运行中的会话
struct ActiveRun {
    session: Session,
    /// 之前各段运行累计的毫秒数
    accumulated_ms: i64,
    /// 运行中时为本段开始时间，暂停时为 None
    resumed_at: Option<DateTime<Utc>>,
    tick: Option<TickHandle>,
}

impl ActiveRun {
    fn active_ms(&self, now: DateTime<Utc>) -> i64 {
        let current = self
            .resumed_at
            .map(|at| (now - at).num_milliseconds().max(0))
            .unwrap_or(0);
        self.accumulated_ms + current
    }

    fn remaining_ms(&self, now: DateTime<Utc>) -> i64 {
        self.session.scheduled_ms - self.active_ms(now)
    }

    fn stop_ticks(&mut self) {
        if let Some(tick) = self.tick.take() {
            tick.cancel();
        }
    }
}

pub struct TimerEngine {
    clock: Arc<dyn Clock>,
    sessions: Arc<dyn SessionStore>,
    tasks: Arc<dyn TaskStore>,
    stats: Arc<dyn StatsAggregator>,
    config: Arc<dyn ConfigProvider>,
    tick_sink: TickSender,
    tick_interval: Duration,
    retry: RetryPolicy,
    events: broadcast::Sender<EngineEvent>,
    state: TimerState,
    active: Option<ActiveRun>,
    /// 每次开始或恢复都会递增，用来识别过期 tick
    generation: u64,
    next_kind: SessionKind,
    idle_remaining_ms: i64,
    completed_focus: u32,
    /// completed_focus 所属的本地日期
    tally_day: NaiveDate,
    last_completed: Option<Session>,
    /// 已到时但会话记录尚未写入时的到期时间
    pending_completion: Option<DateTime<Utc>>,
    /// 重置时未能写入的放弃标记，下次 start 前重试
    unresolved_abandon: Option<Session>,
}

impl TimerEngine {
    /// 创建引擎。遗留的未结束会话（例如进程崩溃）会被标记为放弃。
    pub fn new(parts: EngineParts, tick_sink: TickSender) -> Result<Self, TimerError> {
        if let Some(mut stale) = parts
            .sessions
            .get_open()
            .map_err(TimerError::PersistenceFailure)?
        {
            stale.abandoned = true;
            parts
                .sessions
                .update(&stale)
                .map_err(TimerError::PersistenceFailure)?;
            warn!(session_id = ?stale.id, kind = %stale.kind, "abandoned session left open by a previous run");
        }

        let today = parts.clock.now().with_timezone(&Local).date_naive();
        let completed_focus = match parts.stats.day_stats(today) {
            Ok(stats) => stats.completed_focus,
            Err(e) => {
                warn!(error = %e, "could not read today's statistics, focus tally starts at 0");
                0
            }
        };

        let idle_remaining_ms = parts.config.get().duration_ms(SessionKind::Focus);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            clock: parts.clock,
            sessions: parts.sessions,
            tasks: parts.tasks,
            stats: parts.stats,
            config: parts.config,
            tick_sink,
            tick_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            events,
            state: TimerState::Idle,
            active: None,
            generation: 0,
            next_kind: SessionKind::Focus,
            idle_remaining_ms,
            completed_focus,
            tally_day: today,
            last_completed: None,
            pending_completion: None,
            unresolved_abandon: None,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn next_kind(&self) -> SessionKind {
        self.next_kind
    }

    pub fn completed_focus(&self) -> u32 {
        self.completed_focus
    }

    /// 当前未结束的会话
    pub fn current_session(&self) -> Option<&Session> {
        self.active.as_ref().map(|run| &run.session)
    }

    pub fn last_completed(&self) -> Option<&Session> {
        self.last_completed.as_ref()
    }

    /// 会话已到时，但完成记录还没有写入
    pub fn has_pending_completion(&self) -> bool {
        self.pending_completion.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<EngineEvent> {
        self.events.clone()
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let now = self.clock.now();
        let (session_kind, remaining_ms, session_id, task_id, interruptions) =
            match (&self.active, self.state) {
                (Some(run), _) => (
                    run.session.kind,
                    run.remaining_ms(now).max(0),
                    run.session.id,
                    run.session.task_id,
                    run.session.interruptions,
                ),
                (None, TimerState::Completed) => match &self.last_completed {
                    Some(done) => (done.kind, 0, done.id, done.task_id, done.interruptions),
                    None => (self.next_kind, 0, None, None, 0),
                },
                (None, _) => (self.next_kind, self.idle_remaining_ms, None, None, 0),
            };
        TimerSnapshot {
            state: self.state,
            session_kind,
            remaining_ms,
            session_id,
            task_id,
            interruptions,
            next_kind: self.next_kind,
            completed_focus: self.completed_focus,
            at: now,
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// 开始一个会话。任何地方已有未结束的会话时拒绝，且不做任何修改。
    pub fn start(&mut self, kind: SessionKind) -> Result<TimerSnapshot, TimerError> {
        self.ensure_settled()?;
        if matches!(self.state, TimerState::Running | TimerState::Paused) {
            return Err(TimerError::AlreadyRunning);
        }

        let config = self.config.get();
        config.validate()?;
        let scheduled_ms = config.duration_ms(kind);
        rules::validate_duration(scheduled_ms)?;

        self.retry_abandon()?;
        if let Some(open) = self
            .sessions
            .get_open()
            .map_err(TimerError::PersistenceFailure)?
        {
            warn!(session_id = ?open.id, "start rejected, another session is open");
            return Err(TimerError::AlreadyRunning);
        }

        let task_id = match kind {
            SessionKind::Focus => match self.tasks.get_current() {
                Ok(task) => task.and_then(|t| t.id),
                Err(e) => {
                    warn!(error = %e, "could not read current task, starting unbound");
                    None
                }
            },
            SessionKind::ShortBreak | SessionKind::LongBreak => None,
        };

        let now = self.clock.now();
        let mut session = Session::open(kind, task_id, scheduled_ms, now);
        let id = self.sessions.insert(&session).map_err(|e| match e {
            StoreError::OpenSessionExists { .. } => TimerError::AlreadyRunning,
            other => TimerError::PersistenceFailure(other),
        })?;
        session.id = Some(id);

        self.generation += 1;
        let tick = self
            .clock
            .subscribe_tick(self.tick_interval, self.generation, self.tick_sink.clone());
        self.active = Some(ActiveRun {
            session,
            accumulated_ms: 0,
            resumed_at: Some(now),
            tick: Some(tick),
        });
        self.state = TimerState::Running;

        info!(session_id = id, %kind, scheduled_ms, task_id = ?task_id, "session started");
        Ok(self.emit_snapshot())
    }

    pub fn pause(&mut self) -> Result<TimerSnapshot, TimerError> {
        self.ensure_settled()?;
        self.expect_state("pause", TimerState::Running)?;
        let now = self.clock.now();
        let run = self.active.as_mut().ok_or(TimerError::NoActiveSession)?;
        if let Some(resumed_at) = run.resumed_at.take() {
            run.accumulated_ms += (now - resumed_at).num_milliseconds().max(0);
        }
        run.stop_ticks();
        self.state = TimerState::Paused;

        info!(remaining_ms = run.remaining_ms(now), "session paused");
        Ok(self.emit_snapshot())
    }

    pub fn resume(&mut self) -> Result<TimerSnapshot, TimerError> {
        self.ensure_settled()?;
        self.expect_state("resume", TimerState::Paused)?;
        let now = self.clock.now();
        self.generation += 1;
        let tick = self
            .clock
            .subscribe_tick(self.tick_interval, self.generation, self.tick_sink.clone());
        let run = self.active.as_mut().ok_or(TimerError::NoActiveSession)?;
        run.resumed_at = Some(now);
        run.tick = Some(tick);
        self.state = TimerState::Running;

        info!(remaining_ms = run.remaining_ms(now), "session resumed");
        Ok(self.emit_snapshot())
    }

    /// 丢弃当前会话，不触发任何任务或统计更新
    pub fn reset(&mut self) -> Result<TimerSnapshot, TimerError> {
        self.ensure_settled()?;
        if let Some(mut run) = self.active.take() {
            run.stop_ticks();
            let mut session = run.session;
            session.abandoned = true;
            self.next_kind = session.kind;
            if let Err(e) = self.sessions.update(&session) {
                warn!(session_id = ?session.id, error = %e, "could not mark session abandoned, will retry");
                self.unresolved_abandon = Some(session);
            } else {
                info!(session_id = ?session.id, kind = %session.kind, "session abandoned");
            }
        }
        self.state = TimerState::Idle;
        self.idle_remaining_ms = self.config.get().duration_ms(self.next_kind);
        Ok(self.emit_snapshot())
    }

    /// 记录一次打断，状态不变
    pub fn interrupt(&mut self) -> Result<TimerSnapshot, TimerError> {
        self.ensure_settled()?;
        if !matches!(self.state, TimerState::Running | TimerState::Paused) {
            return Err(TimerError::NoActiveSession);
        }
        let run = self.active.as_mut().ok_or(TimerError::NoActiveSession)?;
        run.session.interruptions += 1;
        if let Err(e) = self.sessions.update(&run.session) {
            warn!(session_id = ?run.session.id, error = %e, "interruption not persisted yet");
        }
        debug!(interruptions = run.session.interruptions, "interruption recorded");
        Ok(self.emit_snapshot())
    }

    /// 为当前会话附加备注，完成时写入
    pub fn set_note(&mut self, note: String) -> Result<TimerSnapshot, TimerError> {
        self.ensure_settled()?;
        let run = self.active.as_mut().ok_or(TimerError::NoActiveSession)?;
        run.session.note = note;
        Ok(self.emit_snapshot())
    }

    /// 处理一次 tick。过期的 tick 会被忽略。
    pub async fn tick(&mut self, generation: u64) -> Result<TickOutcome, TimerError> {
        if generation != self.generation || self.state != TimerState::Running {
            debug!(generation, current = self.generation, state = ?self.state, "ignoring stale tick");
            return Ok(TickOutcome::Ignored);
        }
        if let Some(due) = self.pending_completion {
            let report = self.complete(due).await?;
            return Ok(TickOutcome::Completed(Box::new(report)));
        }
        let now = self.clock.now();
        let remaining_ms = match &self.active {
            Some(run) => run.remaining_ms(now),
            None => return Ok(TickOutcome::Ignored),
        };
        if remaining_ms > 0 {
            self.emit_snapshot();
            return Ok(TickOutcome::Running { remaining_ms });
        }
        let report = self.complete(now).await?;
        Ok(TickOutcome::Completed(Box::new(report)))
    }

    /// 重试被挂起的完成流程。没有挂起的完成时返回 None。
    pub async fn settle(&mut self) -> Result<Option<CompletionReport>, TimerError> {
        match self.pending_completion {
            Some(due) => self.complete(due).await.map(Some),
            None => Ok(None),
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn expect_state(&self, command: &'static str, expected: TimerState) -> Result<(), TimerError> {
        match self.state {
            state if state == expected => Ok(()),
            TimerState::Idle | TimerState::Completed => Err(TimerError::NoActiveSession),
            state => Err(TimerError::InvalidTransition { command, state }),
        }
    }

    fn ensure_settled(&self) -> Result<(), TimerError> {
        match (self.pending_completion, &self.active) {
            (Some(due), Some(run)) => Err(TimerError::CompletionPending {
                session_id: run.session.id,
                due,
            }),
            _ => Ok(()),
        }
    }

    fn retry_abandon(&mut self) -> Result<(), TimerError> {
        if let Some(session) = self.unresolved_abandon.take() {
            if let Err(e) = self.sessions.update(&session) {
                self.unresolved_abandon = Some(session);
                return Err(TimerError::PersistenceFailure(e));
            }
            info!(session_id = ?session.id, "stale session marked abandoned");
        }
        Ok(())
    }

    fn emit(&self, event: EngineEvent) {
        // 没有订阅者时发送会失败，忽略
        let _ = self.events.send(event);
    }

    fn emit_snapshot(&self) -> TimerSnapshot {
        let snapshot = self.snapshot();
        self.emit(EngineEvent::Snapshot(snapshot.clone()));
        snapshot
    }
}
