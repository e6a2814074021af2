#![allow(dead_code)]

use chrono::{NaiveDate, TimeZone, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use focus_timer::clock::{tick_channel, TickReceiver};
use focus_timer::{
    Config, DailyStats, Database, EngineParts, ManualClock, RetryPolicy, Session, SessionStore,
    StatsAggregator, StoreError, Task, TaskStore, TimerEngine,
};

/// 每个存储的注入失败次数
#[derive(Default)]
pub struct Faults {
    pub session_update: AtomicU32,
    pub task_increment: AtomicU32,
    pub stats_record: AtomicU32,
}

pub struct Probe {
    pub db: Arc<Database>,
    pub faults: Faults,
    pub session_updates: AtomicU32,
    pub task_increments: AtomicU32,
    pub stats_records: AtomicU32,
}

impl Probe {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            faults: Faults::default(),
            session_updates: AtomicU32::new(0),
            task_increments: AtomicU32::new(0),
            stats_records: AtomicU32::new(0),
        }
    }

    pub fn fail(counter: &AtomicU32, times: u32) {
        counter.store(times, Ordering::SeqCst);
    }

    pub fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn injected() -> StoreError {
    StoreError::Unavailable("injected failure".into())
}

impl SessionStore for Probe {
    fn insert(&self, session: &Session) -> Result<i64, StoreError> {
        SessionStore::insert(self.db.as_ref(), session)
    }

    fn update(&self, session: &Session) -> Result<(), StoreError> {
        self.session_updates.fetch_add(1, Ordering::SeqCst);
        if take_fault(&self.faults.session_update) {
            return Err(injected());
        }
        self.db.update(session)
    }

    fn get(&self, id: i64) -> Result<Option<Session>, StoreError> {
        SessionStore::get(self.db.as_ref(), id)
    }

    fn get_open(&self) -> Result<Option<Session>, StoreError> {
        self.db.get_open()
    }

    fn sessions_on(&self, day: NaiveDate) -> Result<Vec<Session>, StoreError> {
        self.db.sessions_on(day)
    }

    fn sessions_for_task(&self, task_id: i64) -> Result<Vec<Session>, StoreError> {
        self.db.sessions_for_task(task_id)
    }
}

impl TaskStore for Probe {
    fn create(&self, task: &Task) -> Result<i64, StoreError> {
        self.db.create(task)
    }

    fn get(&self, id: i64) -> Result<Option<Task>, StoreError> {
        TaskStore::get(self.db.as_ref(), id)
    }

    fn list(&self) -> Result<Vec<Task>, StoreError> {
        self.db.list()
    }

    fn get_current(&self) -> Result<Option<Task>, StoreError> {
        self.db.get_current()
    }

    fn set_current(&self, id: i64) -> Result<(), StoreError> {
        self.db.set_current(id)
    }

    fn complete(&self, id: i64) -> Result<bool, StoreError> {
        self.db.complete(id)
    }

    fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.db.delete(id)
    }

    fn increment_completed_pomodoro(&self, id: i64) -> Result<(), StoreError> {
        self.task_increments.fetch_add(1, Ordering::SeqCst);
        if take_fault(&self.faults.task_increment) {
            return Err(injected());
        }
        self.db.increment_completed_pomodoro(id)
    }
}

impl StatsAggregator for Probe {
    fn record_completed_session(&self, session: &Session) -> Result<(), StoreError> {
        self.stats_records.fetch_add(1, Ordering::SeqCst);
        if take_fault(&self.faults.stats_record) {
            return Err(injected());
        }
        self.db.record_completed_session(session)
    }

    fn record_completed_task(&self, day: NaiveDate) -> Result<(), StoreError> {
        self.db.record_completed_task(day)
    }

    fn day_stats(&self, day: NaiveDate) -> Result<DailyStats, StoreError> {
        self.db.day_stats(day)
    }

    fn range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailyStats>, StoreError> {
        self.db.range(from, to)
    }
}

pub struct Harness {
    pub engine: TimerEngine,
    pub clock: ManualClock,
    pub db: Arc<Database>,
    pub probe: Arc<Probe>,
    pub ticks: TickReceiver,
}

pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
}

pub fn harness(config: Config) -> Harness {
    harness_on(Arc::new(Database::open_in_memory().unwrap()), config)
}

/// 在已有数据库上构建引擎，相当于进程重启
pub fn harness_on(db: Arc<Database>, config: Config) -> Harness {
    let clock = ManualClock::new(start_time());
    let probe = Arc::new(Probe::new(db.clone()));
    let (tx, ticks) = tick_channel();
    let parts = EngineParts {
        clock: Arc::new(clock.clone()),
        sessions: probe.clone(),
        tasks: probe.clone(),
        stats: probe.clone(),
        config: Arc::new(config),
    };
    let engine = TimerEngine::new(parts, tx)
        .unwrap()
        .with_retry(RetryPolicy::immediate(3));
    Harness {
        engine,
        clock,
        db,
        probe,
        ticks,
    }
}
