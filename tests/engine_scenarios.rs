// 使用虚拟时钟的引擎场景测试

mod common;

use chrono::Duration;
use std::sync::Arc;

use common::{harness, harness_on, start_time, Harness, Probe};
use focus_timer::pomodoro::runtime;
use focus_timer::{
    Config, Database, EngineEvent, SessionKind, SessionStore, SideEffectStep, StatsAggregator,
    Task, TaskStore, TickOutcome, TimerError, TimerState,
};

/// 每次前进一秒并 tick，直到会话完成
async fn tick_until_complete(h: &mut Harness, max_secs: u32) -> (u32, TickOutcome) {
    for second in 1..=max_secs {
        h.clock.advance(Duration::seconds(1));
        let outcome = h.engine.tick(h.engine.generation()).await.unwrap();
        if matches!(outcome, TickOutcome::Completed(_)) {
            return (second, outcome);
        }
    }
    panic!("session did not complete within {max_secs} seconds");
}

fn completed_report(outcome: TickOutcome) -> Box<focus_timer::pomodoro::CompletionReport> {
    match outcome {
        TickOutcome::Completed(report) => report,
        other => panic!("expected completion, got {other:?}"),
    }
}

fn seed_focus_sessions(db: &Database, count: u32) {
    for _ in 0..count {
        let mut session = focus_timer::Session::open(SessionKind::Focus, None, 25 * 60_000, start_time());
        session.end_time = Some(start_time());
        session.completed = true;
        db.record_completed_session(&session).unwrap();
    }
}

#[tokio::test]
async fn fourth_focus_earns_a_long_break() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    seed_focus_sessions(&db, 3);
    let mut h = harness_on(db, Config::default());
    assert_eq!(h.engine.completed_focus(), 3);

    h.engine.start(SessionKind::Focus).unwrap();
    let (seconds, outcome) = tick_until_complete(&mut h, 2000).await;
    assert_eq!(seconds, 1500);

    let report = completed_report(outcome);
    assert_eq!(h.engine.state(), TimerState::Completed);
    assert_eq!(h.engine.completed_focus(), 4);
    assert_eq!(report.next_kind, SessionKind::LongBreak);
    assert!(!report.auto_started);
    assert_eq!(h.engine.snapshot().next_kind, SessionKind::LongBreak);
}

#[tokio::test]
async fn paused_session_completes_with_full_efficiency() {
    let mut h = harness(Config::default());
    h.engine.start(SessionKind::Focus).unwrap();

    h.clock.advance(Duration::minutes(10));
    h.engine.pause().unwrap();
    h.engine.resume().unwrap();

    h.clock.advance(Duration::minutes(15));
    let report = completed_report(h.engine.tick(h.engine.generation()).await.unwrap());

    assert_eq!(report.session.elapsed_ms(), 25 * 60_000);
    assert_eq!(report.session.efficiency(), 1.0);
    assert!(report.session.completed);
    assert!(report.session.end_time.is_some());
}

#[tokio::test]
async fn remaining_time_comes_from_the_clock_not_tick_count() {
    let mut h = harness(Config::default());
    h.engine.start(SessionKind::Focus).unwrap();

    // 一次迟到很久的 tick 也会按实际经过的时间计算
    h.clock.advance(Duration::minutes(24));
    match h.engine.tick(h.engine.generation()).await.unwrap() {
        TickOutcome::Running { remaining_ms } => assert_eq!(remaining_ms, 60_000),
        other => panic!("expected running, got {other:?}"),
    }

    h.clock.advance(Duration::minutes(5));
    let report = completed_report(h.engine.tick(h.engine.generation()).await.unwrap());
    assert_eq!(report.session.elapsed_ms(), 29 * 60_000);
}

#[tokio::test]
async fn bound_task_and_statistics_advance_exactly_once() {
    let mut h = harness(Config::default());
    let task_id = h.db.create(&Task::new("write chapter".into())).unwrap();
    h.db.set_current(task_id).unwrap();

    let started = h.engine.start(SessionKind::Focus).unwrap();
    assert_eq!(started.task_id, Some(task_id));

    h.clock.advance(Duration::minutes(25));
    let report = completed_report(h.engine.tick(h.engine.generation()).await.unwrap());
    assert!(report.side_effect_failures.is_empty());

    let task = TaskStore::get(h.db.as_ref(), task_id).unwrap().unwrap();
    assert_eq!(task.completed_pomodoros, 1);
    assert!(!task.completed);
    assert!(task.is_current);

    let stats = h.db.day_stats(report.session.local_day()).unwrap();
    assert_eq!(stats.completed_focus, 1);
    assert_eq!(stats.total_focus_ms, 25 * 60_000);
    assert!((stats.average_quality - 1.0).abs() < 1e-9);

    let stored = SessionStore::get(h.db.as_ref(), report.session.id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(stored, report.session);
}

#[tokio::test]
async fn breaks_never_bind_the_current_task() {
    let mut h = harness(Config::default());
    let task_id = h.db.create(&Task::new("inbox zero".into())).unwrap();
    h.db.set_current(task_id).unwrap();

    let started = h.engine.start(SessionKind::ShortBreak).unwrap();
    assert_eq!(started.task_id, None);

    h.clock.advance(Duration::minutes(5));
    let report = completed_report(h.engine.tick(h.engine.generation()).await.unwrap());
    assert_eq!(report.next_kind, SessionKind::Focus);
    assert_eq!(Probe::count(&h.probe.task_increments), 0);
    assert_eq!(h.engine.completed_focus(), 0);
}

#[tokio::test]
async fn restart_abandons_stale_open_session() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let stale = focus_timer::Session::open(SessionKind::Focus, None, 25 * 60_000, start_time());
    let stale_id = SessionStore::insert(db.as_ref(), &stale).unwrap();

    let h = harness_on(db.clone(), Config::default());
    assert_eq!(h.engine.state(), TimerState::Idle);
    assert!(h.engine.current_session().is_none());
    assert!(db.get_open().unwrap().is_none());

    let record = SessionStore::get(db.as_ref(), stale_id).unwrap().unwrap();
    assert!(record.abandoned);
    assert!(!record.completed);
    assert_eq!(record.end_time, None);
}

#[tokio::test]
async fn reset_has_no_side_effects() {
    let mut h = harness(Config::default());
    let task_id = h.db.create(&Task::new("bound".into())).unwrap();
    h.db.set_current(task_id).unwrap();

    let started = h.engine.start(SessionKind::Focus).unwrap();
    h.clock.advance(Duration::minutes(24));
    h.engine.reset().unwrap();

    assert_eq!(Probe::count(&h.probe.task_increments), 0);
    assert_eq!(Probe::count(&h.probe.stats_records), 0);

    let record = SessionStore::get(h.db.as_ref(), started.session_id.unwrap())
        .unwrap()
        .unwrap();
    assert!(record.abandoned);
    assert!(!record.is_open());
    assert_eq!(h.clock.active_subscriptions(), 0);

    // 重置后之前的 tick 不再生效
    h.clock.advance(Duration::minutes(5));
    let outcome = h.engine.tick(h.engine.generation()).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Ignored));
}

#[tokio::test]
async fn start_while_active_changes_nothing() {
    let mut h = harness(Config::default());
    let running = h.engine.start(SessionKind::Focus).unwrap();
    h.clock.advance(Duration::minutes(1));

    let before = h.engine.snapshot();
    assert!(matches!(
        h.engine.start(SessionKind::ShortBreak),
        Err(TimerError::AlreadyRunning)
    ));
    assert_eq!(h.engine.snapshot(), before);

    h.engine.pause().unwrap();
    let before = h.engine.snapshot();
    assert!(matches!(
        h.engine.start(SessionKind::Focus),
        Err(TimerError::AlreadyRunning)
    ));
    assert_eq!(h.engine.snapshot(), before);

    let open = h.db.get_open().unwrap().unwrap();
    assert_eq!(open.id, running.session_id);
}

#[tokio::test]
async fn open_record_from_elsewhere_blocks_start() {
    let mut h = harness(Config::default());
    let foreign = focus_timer::Session::open(SessionKind::Focus, None, 60_000, start_time());
    SessionStore::insert(h.db.as_ref(), &foreign).unwrap();

    assert!(matches!(
        h.engine.start(SessionKind::Focus),
        Err(TimerError::AlreadyRunning)
    ));
    assert_eq!(h.engine.state(), TimerState::Idle);
    assert_eq!(h.clock.active_subscriptions(), 0);
}

#[tokio::test]
async fn completion_is_processed_exactly_once() {
    let mut h = harness(Config::default());
    h.engine.start(SessionKind::Focus).unwrap();
    let generation = h.engine.generation();

    h.clock.advance(Duration::minutes(30));
    assert!(matches!(
        h.engine.tick(generation).await.unwrap(),
        TickOutcome::Completed(_)
    ));
    for _ in 0..3 {
        h.clock.advance(Duration::seconds(1));
        assert!(matches!(
            h.engine.tick(generation).await.unwrap(),
            TickOutcome::Ignored
        ));
    }
    assert_eq!(Probe::count(&h.probe.stats_records), 1);
    assert_eq!(h.engine.completed_focus(), 1);
    assert_eq!(h.clock.active_subscriptions(), 0);
}

#[tokio::test]
async fn persistence_failure_holds_back_completion() {
    let mut h = harness(Config::default());
    let mut events = h.engine.subscribe();
    h.engine.start(SessionKind::Focus).unwrap();
    h.clock.advance(Duration::minutes(25));

    // 三次重试全部失败
    Probe::fail(&h.probe.faults.session_update, 3);
    let err = h.engine.tick(h.engine.generation()).await.unwrap_err();
    assert!(matches!(err, TimerError::PersistenceFailure(_)));
    assert_eq!(h.engine.state(), TimerState::Running);
    assert!(h.engine.current_session().unwrap().is_open());
    assert_eq!(Probe::count(&h.probe.stats_records), 0);
    assert_eq!(Probe::count(&h.probe.task_increments), 0);

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::PersistenceFailed { .. }) {
            saw_failure = true;
        }
        assert!(!matches!(event, EngineEvent::SessionCompleted { .. }));
    }
    assert!(saw_failure);

    // 下一次 tick 重试成功
    h.clock.advance(Duration::seconds(1));
    let report = completed_report(h.engine.tick(h.engine.generation()).await.unwrap());
    assert!(report.session.completed);
    assert_eq!(h.engine.state(), TimerState::Completed);
    assert!(h.db.get_open().unwrap().is_none());
}

#[tokio::test]
async fn commands_wait_for_held_back_completion() {
    let mut h = harness(Config::default());
    h.engine.start(SessionKind::Focus).unwrap();
    let id = h.engine.current_session().and_then(|s| s.id).unwrap();
    h.clock.advance(Duration::minutes(25));

    Probe::fail(&h.probe.faults.session_update, 3);
    assert!(h.engine.tick(h.engine.generation()).await.is_err());
    assert!(h.engine.has_pending_completion());

    // 到时的会话不能被重置成放弃
    assert!(matches!(h.engine.reset(), Err(TimerError::CompletionPending { .. })));
    assert!(matches!(h.engine.pause(), Err(TimerError::CompletionPending { .. })));
    assert!(matches!(h.engine.interrupt(), Err(TimerError::CompletionPending { .. })));
    let stored = SessionStore::get(h.db.as_ref(), id).unwrap().unwrap();
    assert!(stored.is_open());
    assert!(!stored.abandoned);

    h.clock.advance(Duration::minutes(5));
    let report = h.engine.settle().await.unwrap().unwrap();
    assert!(!h.engine.has_pending_completion());
    assert_eq!(report.session.end_time, Some(start_time() + Duration::minutes(25)));
    assert_eq!(report.session.efficiency(), 1.0);

    let snapshot = h.engine.reset().unwrap();
    assert_eq!(snapshot.state, TimerState::Idle);
    let stored = SessionStore::get(h.db.as_ref(), id).unwrap().unwrap();
    assert!(stored.completed);
    assert!(!stored.abandoned);
    assert_eq!(h.db.day_stats(stored.local_day()).unwrap().completed_focus, 1);
    assert!(h.engine.settle().await.unwrap().is_none());
}

#[tokio::test]
async fn queued_command_persists_held_back_completion_first() {
    let mut h = harness(Config::default());
    h.engine.start(SessionKind::Focus).unwrap();
    let id = h.engine.current_session().and_then(|s| s.id).unwrap();
    h.clock.advance(Duration::minutes(25));
    Probe::fail(&h.probe.faults.session_update, 3);
    assert!(h.engine.tick(h.engine.generation()).await.is_err());

    let Harness { engine, db, ticks, .. } = h;
    let (handle, task) = runtime::spawn(engine, ticks);

    let snapshot = handle.reset().await.unwrap();
    assert_eq!(snapshot.state, TimerState::Idle);
    let stored = SessionStore::get(db.as_ref(), id).unwrap().unwrap();
    assert!(stored.completed);
    assert!(!stored.abandoned);
    assert_eq!(db.day_stats(stored.local_day()).unwrap().completed_focus, 1);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn focus_tally_restarts_after_midnight() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    seed_focus_sessions(&db, 2);
    let mut h = harness_on(db, Config::default());
    assert_eq!(h.engine.completed_focus(), 2);

    h.engine.start(SessionKind::Focus).unwrap();
    let (_, outcome) = tick_until_complete(&mut h, 2000).await;
    assert_eq!(completed_report(outcome).next_kind, SessionKind::ShortBreak);
    assert_eq!(h.engine.completed_focus(), 3);

    // 第二天的第一个专注不应该触发长休息
    h.clock.advance(Duration::days(1));
    h.engine.start(SessionKind::Focus).unwrap();
    let (_, outcome) = tick_until_complete(&mut h, 2000).await;
    let report = completed_report(outcome);
    assert_eq!(report.next_kind, SessionKind::ShortBreak);
    assert_eq!(h.engine.completed_focus(), 1);
    assert_eq!(h.db.day_stats(report.session.local_day()).unwrap().completed_focus, 1);
}

#[tokio::test]
async fn transient_persistence_failure_is_retried() {
    let mut h = harness(Config::default());
    h.engine.start(SessionKind::Focus).unwrap();
    h.clock.advance(Duration::minutes(25));

    Probe::fail(&h.probe.faults.session_update, 2);
    let report = completed_report(h.engine.tick(h.engine.generation()).await.unwrap());
    assert!(report.session.completed);
    assert_eq!(Probe::count(&h.probe.session_updates), 3);
}

#[tokio::test]
async fn task_failure_does_not_block_statistics() {
    let mut h = harness(Config::default());
    let task_id = h.db.create(&Task::new("flaky".into())).unwrap();
    h.db.set_current(task_id).unwrap();
    let mut events = h.engine.subscribe();

    h.engine.start(SessionKind::Focus).unwrap();
    h.clock.advance(Duration::minutes(25));
    Probe::fail(&h.probe.faults.task_increment, u32::MAX);

    let report = completed_report(h.engine.tick(h.engine.generation()).await.unwrap());
    assert_eq!(h.engine.state(), TimerState::Completed);
    assert_eq!(report.side_effect_failures.len(), 1);
    assert!(matches!(
        report.side_effect_failures[0],
        TimerError::SideEffectFailure {
            step: SideEffectStep::TaskProgress,
            ..
        }
    ));
    assert_eq!(Probe::count(&h.probe.task_increments), 3);

    let stats = h.db.day_stats(report.session.local_day()).unwrap();
    assert_eq!(stats.completed_focus, 1);
    let task = TaskStore::get(h.db.as_ref(), task_id).unwrap().unwrap();
    assert_eq!(task.completed_pomodoros, 0);

    let mut surfaced = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::SideEffectFailed { step, .. } = event {
            assert_eq!(step, SideEffectStep::TaskProgress);
            surfaced = true;
        }
    }
    assert!(surfaced);
}

#[tokio::test]
async fn statistics_failure_still_completes() {
    let mut h = harness(Config::default());
    h.engine.start(SessionKind::Focus).unwrap();
    h.clock.advance(Duration::minutes(25));
    Probe::fail(&h.probe.faults.stats_record, u32::MAX);

    let report = completed_report(h.engine.tick(h.engine.generation()).await.unwrap());
    assert!(matches!(
        report.side_effect_failures.as_slice(),
        [TimerError::SideEffectFailure {
            step: SideEffectStep::Statistics,
            ..
        }]
    ));
    assert_eq!(h.engine.completed_focus(), 1);
    assert_eq!(report.next_kind, SessionKind::ShortBreak);
}

#[tokio::test]
async fn auto_start_chains_into_the_break() {
    let config = Config {
        auto_start_breaks: true,
        ..Config::default()
    };
    let mut h = harness(config);
    h.engine.start(SessionKind::Focus).unwrap();
    h.clock.advance(Duration::minutes(25));

    let report = completed_report(h.engine.tick(h.engine.generation()).await.unwrap());
    assert!(report.auto_started);
    assert_eq!(h.engine.state(), TimerState::Running);
    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.session_kind, SessionKind::ShortBreak);
    assert_eq!(snapshot.remaining_ms, 5 * 60_000);
    assert_eq!(h.clock.active_subscriptions(), 1);

    // 休息结束后不自动开始专注
    h.clock.advance(Duration::minutes(5));
    let report = completed_report(h.engine.tick(h.engine.generation()).await.unwrap());
    assert!(!report.auto_started);
    assert_eq!(report.next_kind, SessionKind::Focus);
    assert_eq!(h.engine.state(), TimerState::Completed);
}

#[tokio::test]
async fn explicit_start_overrides_the_suggestion() {
    let mut h = harness(Config::default());
    h.engine.start(SessionKind::Focus).unwrap();
    h.clock.advance(Duration::minutes(25));
    h.engine.tick(h.engine.generation()).await.unwrap();
    assert_eq!(h.engine.next_kind(), SessionKind::ShortBreak);

    let snapshot = h.engine.start(SessionKind::LongBreak).unwrap();
    assert_eq!(snapshot.state, TimerState::Running);
    assert_eq!(snapshot.session_kind, SessionKind::LongBreak);
    assert_eq!(snapshot.remaining_ms, 15 * 60_000);
}

#[tokio::test]
async fn interruptions_lower_quality() {
    let mut h = harness(Config::default());
    h.engine.start(SessionKind::Focus).unwrap();
    h.engine.interrupt().unwrap();
    h.engine.pause().unwrap();
    let snapshot = h.engine.interrupt().unwrap();
    assert_eq!(snapshot.interruptions, 2);
    assert_eq!(snapshot.state, TimerState::Paused);
    h.engine.resume().unwrap();
    h.engine.set_note("two calls".into()).unwrap();

    h.clock.advance(Duration::minutes(25));
    let report = completed_report(h.engine.tick(h.engine.generation()).await.unwrap());
    assert_eq!(report.session.interruptions, 2);
    assert_eq!(report.session.note, "two calls");
    assert!((report.session.quality() - 0.8).abs() < 1e-9);

    let stats = h.db.day_stats(report.session.local_day()).unwrap();
    assert_eq!(stats.total_interruptions, 2);
}

#[tokio::test]
async fn failed_abandon_is_retried_before_next_start() {
    let mut h = harness(Config::default());
    h.engine.start(SessionKind::Focus).unwrap();

    Probe::fail(&h.probe.faults.session_update, 1);
    h.engine.reset().unwrap();
    assert_eq!(h.engine.state(), TimerState::Idle);
    assert!(h.db.get_open().unwrap().is_some());

    let snapshot = h.engine.start(SessionKind::Focus).unwrap();
    assert_eq!(snapshot.state, TimerState::Running);
    let open = h.db.get_open().unwrap().unwrap();
    assert_eq!(open.id, snapshot.session_id);
}

#[tokio::test]
async fn observers_see_every_transition() {
    let mut h = harness(Config::default());
    let mut events = h.engine.subscribe();

    h.engine.start(SessionKind::Focus).unwrap();
    h.clock.advance(Duration::minutes(1));
    h.engine.tick(h.engine.generation()).await.unwrap();
    h.engine.pause().unwrap();
    h.engine.resume().unwrap();
    h.clock.advance(Duration::minutes(24));
    h.engine.tick(h.engine.generation()).await.unwrap();

    let mut states = Vec::new();
    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::Snapshot(snapshot) => states.push(snapshot.state),
            EngineEvent::SessionCompleted { session, next_kind } => {
                completed = Some((session.kind, next_kind));
            }
            _ => {}
        }
    }
    assert_eq!(
        states,
        vec![
            TimerState::Running,
            TimerState::Running,
            TimerState::Paused,
            TimerState::Running,
            TimerState::Completed,
        ]
    );
    assert_eq!(completed, Some((SessionKind::Focus, SessionKind::ShortBreak)));
}

#[tokio::test]
async fn invalid_configuration_rejects_start() {
    let config = Config {
        focus_minutes: 0,
        ..Config::default()
    };
    let db = Arc::new(Database::open_in_memory().unwrap());
    let mut h = harness_on(db, config);
    assert!(matches!(
        h.engine.start(SessionKind::Focus),
        Err(TimerError::InvalidDuration { ms: 0 })
    ));
    assert_eq!(h.engine.state(), TimerState::Idle);
    assert!(h.db.get_open().unwrap().is_none());
}
