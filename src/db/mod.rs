use chrono::{DateTime, Local, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::models::{DailyStats, Priority, Session, SessionKind, Task};
use crate::store::{SessionStore, StatsAggregator, TaskStore};

const SESSION_COLUMNS: &str = "id, task_id, kind, scheduled_ms, start_time, end_time, completed,
                               abandoned, interruptions, note";

const TASK_COLUMNS: &str = "id, name, description, completed, is_current, estimated_pomodoros,
                            completed_pomodoros, priority, created_at, updated_at";

const STATS_COLUMNS: &str = "day, completed_focus, completed_breaks, total_focus_ms, total_break_ms,
                             average_quality, completed_tasks, total_interruptions";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// 打开或创建数据库
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// 内存数据库
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 初始化数据库schema
    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT,
                completed INTEGER NOT NULL DEFAULT 0,
                is_current INTEGER NOT NULL DEFAULT 0,
                estimated_pomodoros INTEGER NOT NULL DEFAULT 0,
                completed_pomodoros INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER,
                kind TEXT NOT NULL,
                scheduled_ms INTEGER NOT NULL CHECK (scheduled_ms > 0),
                start_time TEXT NOT NULL,
                end_time TEXT,
                completed INTEGER NOT NULL DEFAULT 0,
                abandoned INTEGER NOT NULL DEFAULT 0,
                interruptions INTEGER NOT NULL DEFAULT 0 CHECK (interruptions >= 0),
                note TEXT NOT NULL DEFAULT '',
                FOREIGN KEY(task_id) REFERENCES tasks(id) ON DELETE SET NULL
            );

            CREATE TABLE IF NOT EXISTS daily_stats (
                day TEXT PRIMARY KEY,
                completed_focus INTEGER NOT NULL DEFAULT 0,
                completed_breaks INTEGER NOT NULL DEFAULT 0,
                total_focus_ms INTEGER NOT NULL DEFAULT 0,
                total_break_ms INTEGER NOT NULL DEFAULT 0,
                average_quality REAL NOT NULL DEFAULT 0,
                completed_tasks INTEGER NOT NULL DEFAULT 0,
                total_interruptions INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_task_id ON sessions(task_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_start_time ON sessions(start_time);
            CREATE INDEX IF NOT EXISTS idx_tasks_current ON tasks(is_current);
            "#,
        )?;
        Ok(())
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_day(raw: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| StoreError::Corrupt(format!("bad day {raw:?}: {e}")))
}

/// 行数据先按原始类型读出，再在外面做解析，避免在 rusqlite 回调里处理自定义错误
struct SessionRow {
    id: i64,
    task_id: Option<i64>,
    kind: String,
    scheduled_ms: i64,
    start_time: String,
    end_time: Option<String>,
    completed: bool,
    abandoned: bool,
    interruptions: u32,
    note: String,
}

impl SessionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            kind: row.get(2)?,
            scheduled_ms: row.get(3)?,
            start_time: row.get(4)?,
            end_time: row.get(5)?,
            completed: row.get::<_, i32>(6)? != 0,
            abandoned: row.get::<_, i32>(7)? != 0,
            interruptions: row.get(8)?,
            note: row.get(9)?,
        })
    }

    fn into_session(self) -> Result<Session, StoreError> {
        Ok(Session {
            id: Some(self.id),
            task_id: self.task_id,
            kind: self.kind.parse::<SessionKind>().map_err(StoreError::Corrupt)?,
            scheduled_ms: self.scheduled_ms,
            start_time: parse_time(&self.start_time)?,
            end_time: self.end_time.as_deref().map(parse_time).transpose()?,
            completed: self.completed,
            abandoned: self.abandoned,
            interruptions: self.interruptions,
            note: self.note,
        })
    }
}

struct TaskRow {
    id: i64,
    name: String,
    description: Option<String>,
    completed: bool,
    is_current: bool,
    estimated_pomodoros: u32,
    completed_pomodoros: u32,
    priority: i32,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            completed: row.get::<_, i32>(3)? != 0,
            is_current: row.get::<_, i32>(4)? != 0,
            estimated_pomodoros: row.get(5)?,
            completed_pomodoros: row.get(6)?,
            priority: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        Ok(Task {
            id: Some(self.id),
            name: self.name,
            description: self.description,
            completed: self.completed,
            is_current: self.is_current,
            estimated_pomodoros: self.estimated_pomodoros,
            completed_pomodoros: self.completed_pomodoros,
            priority: Priority::from_level(self.priority),
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

struct StatsRow {
    day: String,
    completed_focus: u32,
    completed_breaks: u32,
    total_focus_ms: i64,
    total_break_ms: i64,
    average_quality: f64,
    completed_tasks: u32,
    total_interruptions: u32,
}

impl StatsRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            day: row.get(0)?,
            completed_focus: row.get(1)?,
            completed_breaks: row.get(2)?,
            total_focus_ms: row.get(3)?,
            total_break_ms: row.get(4)?,
            average_quality: row.get(5)?,
            completed_tasks: row.get(6)?,
            total_interruptions: row.get(7)?,
        })
    }

    fn into_stats(self) -> Result<DailyStats, StoreError> {
        Ok(DailyStats {
            day: parse_day(&self.day)?,
            completed_focus: self.completed_focus,
            completed_breaks: self.completed_breaks,
            total_focus_ms: self.total_focus_ms,
            total_break_ms: self.total_break_ms,
            average_quality: self.average_quality,
            completed_tasks: self.completed_tasks,
            total_interruptions: self.total_interruptions,
        })
    }
}

fn find_open(conn: &Connection) -> Result<Option<Session>, StoreError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE end_time IS NULL AND completed = 0 AND abandoned = 0
                 ORDER BY id DESC LIMIT 1"
            ),
            [],
            SessionRow::read,
        )
        .optional()?;
    row.map(SessionRow::into_session).transpose()
}

fn load_stats(conn: &Connection, day: NaiveDate) -> Result<DailyStats, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {STATS_COLUMNS} FROM daily_stats WHERE day = ?1"),
            params![day.format("%Y-%m-%d").to_string()],
            StatsRow::read,
        )
        .optional()?;
    match row {
        Some(row) => row.into_stats(),
        None => Ok(DailyStats::empty(day)),
    }
}

fn save_stats(conn: &Connection, stats: &DailyStats) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO daily_stats (day, completed_focus, completed_breaks, total_focus_ms,
                                  total_break_ms, average_quality, completed_tasks, total_interruptions)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(day) DO UPDATE SET
             completed_focus = excluded.completed_focus,
             completed_breaks = excluded.completed_breaks,
             total_focus_ms = excluded.total_focus_ms,
             total_break_ms = excluded.total_break_ms,
             average_quality = excluded.average_quality,
             completed_tasks = excluded.completed_tasks,
             total_interruptions = excluded.total_interruptions",
        params![
            stats.day.format("%Y-%m-%d").to_string(),
            stats.completed_focus,
            stats.completed_breaks,
            stats.total_focus_ms,
            stats.total_break_ms,
            stats.average_quality,
            stats.completed_tasks,
            stats.total_interruptions,
        ],
    )?;
    Ok(())
}

// ==================== Sessions ====================

impl SessionStore for Database {
    fn insert(&self, session: &Session) -> Result<i64, StoreError> {
        let conn = self.conn();
        if session.is_open() {
            if let Some(existing) = find_open(&conn)? {
                return Err(StoreError::OpenSessionExists {
                    existing: existing.id.unwrap_or_default(),
                });
            }
        }
        conn.execute(
            "INSERT INTO sessions (task_id, kind, scheduled_ms, start_time, end_time, completed,
                                   abandoned, interruptions, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.task_id,
                session.kind.as_str(),
                session.scheduled_ms,
                session.start_time.to_rfc3339(),
                session.end_time.map(|d| d.to_rfc3339()),
                session.completed as i32,
                session.abandoned as i32,
                session.interruptions,
                session.note,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update(&self, session: &Session) -> Result<(), StoreError> {
        let id = session
            .id
            .ok_or_else(|| StoreError::Corrupt("cannot update a session without id".into()))?;
        let changed = self.conn().execute(
            "UPDATE sessions SET task_id = ?1, kind = ?2, scheduled_ms = ?3, start_time = ?4,
                                 end_time = ?5, completed = ?6, abandoned = ?7,
                                 interruptions = ?8, note = ?9
             WHERE id = ?10",
            params![
                session.task_id,
                session.kind.as_str(),
                session.scheduled_ms,
                session.start_time.to_rfc3339(),
                session.end_time.map(|d| d.to_rfc3339()),
                session.completed as i32,
                session.abandoned as i32,
                session.interruptions,
                session.note,
                id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "session",
                id,
            });
        }
        Ok(())
    }

    fn get(&self, id: i64) -> Result<Option<Session>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
                SessionRow::read,
            )
            .optional()?;
        row.map(SessionRow::into_session).transpose()
    }

    fn get_open(&self) -> Result<Option<Session>, StoreError> {
        find_open(&self.conn())
    }

    fn sessions_on(&self, day: NaiveDate) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY start_time ASC"
        ))?;
        let rows = stmt
            .query_map([], SessionRow::read)?
            .collect::<Result<Vec<_>, _>>()?;

        // 按本地日期过滤，存储的是 UTC 时间
        let mut sessions = Vec::new();
        for row in rows {
            let session = row.into_session()?;
            if session.start_time.with_timezone(&Local).date_naive() == day {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    fn sessions_for_task(&self, task_id: i64) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE task_id = ?1 ORDER BY start_time DESC"
        ))?;
        let rows = stmt
            .query_map(params![task_id], SessionRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }
}

// ==================== Tasks ====================

impl TaskStore for Database {
    fn create(&self, task: &Task) -> Result<i64, StoreError> {
        task.validate().map_err(StoreError::InvalidTask)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tasks (name, description, completed, is_current, estimated_pomodoros,
                               completed_pomodoros, priority, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?8)",
            params![
                task.name.trim(),
                task.description,
                task.completed as i32,
                task.estimated_pomodoros,
                task.completed_pomodoros,
                task.priority as i32,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get(&self, id: i64) -> Result<Option<Task>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                TaskRow::read,
            )
            .optional()?;
        row.map(TaskRow::into_task).transpose()
    }

    fn list(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY completed ASC, priority DESC, id ASC"
        ))?;
        let rows = stmt
            .query_map([], TaskRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    fn get_current(&self) -> Result<Option<Task>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE is_current = 1 LIMIT 1"),
                [],
                TaskRow::read,
            )
            .optional()?;
        row.map(TaskRow::into_task).transpose()
    }

    fn set_current(&self, id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let exists: Option<i64> = tx
            .query_row("SELECT id FROM tasks WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound { entity: "task", id });
        }
        tx.execute("UPDATE tasks SET is_current = 0 WHERE is_current = 1", [])?;
        tx.execute(
            "UPDATE tasks SET is_current = 1, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn complete(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE tasks SET completed = 1, updated_at = ?1 WHERE id = ?2 AND completed = 0",
            params![Utc::now().to_rfc3339(), id],
        )?;
        if changed == 1 {
            return Ok(true);
        }
        let exists: Option<i64> = conn
            .query_row("SELECT id FROM tasks WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound { entity: "task", id }),
        }
    }

    fn delete(&self, id: i64) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound { entity: "task", id });
        }
        Ok(())
    }

    fn increment_completed_pomodoro(&self, id: i64) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE tasks SET completed_pomodoros = completed_pomodoros + 1, updated_at = ?1
             WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound { entity: "task", id });
        }
        Ok(())
    }
}

// ==================== Statistics ====================

impl StatsAggregator for Database {
    fn record_completed_session(&self, session: &Session) -> Result<(), StoreError> {
        if !session.completed {
            return Err(StoreError::Corrupt(
                "only completed sessions are aggregated".into(),
            ));
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut stats = load_stats(&tx, session.local_day())?;
        stats.absorb(session);
        save_stats(&tx, &stats)?;
        tx.commit()?;
        Ok(())
    }

    fn record_completed_task(&self, day: NaiveDate) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut stats = load_stats(&tx, day)?;
        stats.completed_tasks += 1;
        save_stats(&tx, &stats)?;
        tx.commit()?;
        Ok(())
    }

    fn day_stats(&self, day: NaiveDate) -> Result<DailyStats, StoreError> {
        load_stats(&self.conn(), day)
    }

    fn range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailyStats>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATS_COLUMNS} FROM daily_stats WHERE day >= ?1 AND day <= ?2 ORDER BY day ASC"
        ))?;
        let rows = stmt
            .query_map(
                params![
                    from.format("%Y-%m-%d").to_string(),
                    to.format("%Y-%m-%d").to_string()
                ],
                StatsRow::read,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(StatsRow::into_stats).collect()
    }
}
