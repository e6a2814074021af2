// 自然完成后的处理流程：写入会话 -> 任务进度 -> 每日统计 -> 下一个会话

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{EngineEvent, TimerEngine, TimerState};
use crate::error::{SideEffectStep, StoreError, TimerError};
use crate::models::{Session, SessionKind};
use crate::rules;

/// 一次完成的结果
#[derive(Debug)]
pub struct CompletionReport {
    pub session: Session,
    pub next_kind: SessionKind,
    pub auto_started: bool,
    /// 任务或统计更新失败（不影响完成本身）
    pub side_effect_failures: Vec<TimerError>,
    pub auto_start_error: Option<TimerError>,
}

impl TimerEngine {
    pub(super) async fn complete(&mut self, now: DateTime<Utc>) -> Result<CompletionReport, TimerError> {
        let mut session = match &self.active {
            Some(run) => run.session.clone(),
            None => return Err(TimerError::NoActiveSession),
        };
        session.end_time = Some(now);
        session.completed = true;

        // 会话记录是唯一可信来源，写不进去就不能宣布完成
        let sessions = Arc::clone(&self.sessions);
        if let Err(e) = self
            .retry
            .run("persist session", || sessions.update(&session))
            .await
        {
            error!(session_id = ?session.id, error = %e, "completion held back, session not persisted");
            self.pending_completion = Some(now);
            self.emit(EngineEvent::PersistenceFailed {
                session_id: session.id,
                message: e.to_string(),
            });
            return Err(TimerError::PersistenceFailure(e));
        }

        self.pending_completion = None;
        if let Some(mut run) = self.active.take() {
            run.stop_ticks();
        }
        self.state = TimerState::Completed;
        info!(
            session_id = ?session.id,
            kind = %session.kind,
            elapsed_ms = session.elapsed_ms(),
            interruptions = session.interruptions,
            "session completed"
        );

        let mut side_effect_failures = Vec::new();

        if session.kind == SessionKind::Focus {
            if let Some(task_id) = session.task_id {
                let tasks = Arc::clone(&self.tasks);
                let result = self
                    .retry
                    .run("task progress", || tasks.increment_completed_pomodoro(task_id))
                    .await;
                if let Err(e) = result {
                    side_effect_failures.push(self.side_effect_failed(
                        SideEffectStep::TaskProgress,
                        &session,
                        e,
                    ));
                }
            }
        }

        let stats = Arc::clone(&self.stats);
        let result = self
            .retry
            .run("statistics", || stats.record_completed_session(&session))
            .await;
        if let Err(e) = result {
            side_effect_failures.push(self.side_effect_failed(SideEffectStep::Statistics, &session, e));
        }

        let config = self.config.get();
        let next_kind = match session.kind {
            SessionKind::Focus => {
                // 跨过午夜后计数从新的一天重新开始
                let day = session.local_day();
                if day != self.tally_day {
                    self.tally_day = day;
                    self.completed_focus = 0;
                }
                self.completed_focus += 1;
                rules::next_session_kind(self.completed_focus, &config)
            }
            SessionKind::ShortBreak | SessionKind::LongBreak => SessionKind::Focus,
        };
        self.next_kind = next_kind;
        self.idle_remaining_ms = config.duration_ms(next_kind);
        self.last_completed = Some(session.clone());

        self.emit_snapshot();
        self.emit(EngineEvent::SessionCompleted {
            session: session.clone(),
            next_kind,
        });

        let mut auto_started = false;
        let mut auto_start_error = None;
        if rules::should_auto_start(next_kind, &config) {
            match self.start(next_kind) {
                Ok(_) => auto_started = true,
                Err(e) => {
                    warn!(%next_kind, error = %e, "auto-start failed");
                    auto_start_error = Some(e);
                }
            }
        }

        Ok(CompletionReport {
            session,
            next_kind,
            auto_started,
            side_effect_failures,
            auto_start_error,
        })
    }

    fn side_effect_failed(
        &self,
        step: SideEffectStep,
        session: &Session,
        source: StoreError,
    ) -> TimerError {
        warn!(session_id = ?session.id, %step, error = %source, "side effect failed, continuing");
        self.emit(EngineEvent::SideEffectFailed {
            step,
            session_id: session.id,
            message: source.to_string(),
        });
        TimerError::SideEffectFailure { step, source }
    }
}
