//! Embedded SQLite store
//!
//! The transactional adapter: every penalty/completion triple runs inside a
//! real database transaction, so the atomicity contract of [`GameStore`]
//! holds for free. Blocking rusqlite work is moved off the async runtime
//! with `spawn_blocking`; one connection behind a mutex serializes writers.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{
    event, Character, EventLogEntry, GameState, Habit, HabitDraft, Penalty, Rewards, Task,
    TaskDraft, TaskStatus, User, HABIT_PENALTY_HP, HABIT_REWARD, TASK_PENALTY_HP,
};
use crate::store::{GameStore, PenaltyOutcome};
use crate::types::{GrindstoneError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    email         TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    timezone      TEXT NOT NULL DEFAULT 'UTC',
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS characters (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id          INTEGER NOT NULL UNIQUE REFERENCES users(id),
    name             TEXT NOT NULL,
    level            INTEGER NOT NULL DEFAULT 1,
    xp               INTEGER NOT NULL DEFAULT 0,
    coins            INTEGER NOT NULL DEFAULT 0,
    hp               INTEGER NOT NULL DEFAULT 100,
    max_hp           INTEGER NOT NULL DEFAULT 100,
    stats_json       TEXT NOT NULL DEFAULT '{}',
    last_active_date TEXT,
    version          INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS tasks (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id      INTEGER NOT NULL REFERENCES users(id),
    title        TEXT NOT NULL,
    difficulty   TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'ACTIVE',
    rewards_json TEXT NOT NULL DEFAULT '{}',
    penalty_json TEXT NOT NULL DEFAULT '{}',
    aspects_json TEXT NOT NULL DEFAULT '[]',
    deadline     TEXT,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS habits (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id             INTEGER NOT NULL REFERENCES users(id),
    title               TEXT NOT NULL,
    difficulty          TEXT NOT NULL,
    is_active           INTEGER NOT NULL DEFAULT 1,
    streak              INTEGER NOT NULL DEFAULT 0,
    last_completed_date TEXT,
    last_penalized_date TEXT,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS event_log (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id      INTEGER NOT NULL REFERENCES users(id),
    event_type   TEXT NOT NULL,
    details_json TEXT NOT NULL DEFAULT '{}',
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_activity (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id       INTEGER NOT NULL REFERENCES users(id),
    activity_type TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status_deadline ON tasks(status, deadline);
CREATE INDEX IF NOT EXISTS idx_habits_reset ON habits(is_active, last_completed_date);
CREATE INDEX IF NOT EXISTS idx_event_log_user ON event_log(user_id);
"#;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(db)?;
        Self::init(conn)
    }

    /// Private in-memory database, used by tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        // WAL lets the reconciliation pass write while readers proceed
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| GrindstoneError::Database("store mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| GrindstoneError::Database(format!("blocking task failed: {e}")))?
    }
}

// --- error and time helpers ---

fn db(e: rusqlite::Error) -> GrindstoneError {
    GrindstoneError::Database(e.to_string())
}

fn fetch(e: rusqlite::Error) -> GrindstoneError {
    GrindstoneError::Fetch(e.to_string())
}

fn rowerr(e: rusqlite::Error) -> GrindstoneError {
    GrindstoneError::RowUpdate(e.to_string())
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| GrindstoneError::Database(format!("bad timestamp '{s}': {e}")))
}

fn date_str(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| GrindstoneError::Database(format!("bad date '{s}': {e}")))
}

// --- raw row types (strings out of SQLite, hydrated into domain types) ---

struct RawTask {
    id: i64,
    user_id: i64,
    title: String,
    difficulty: String,
    status: String,
    rewards_json: String,
    penalty_json: String,
    aspects_json: String,
    deadline: Option<String>,
    created_at: String,
}

const TASK_COLUMNS: &str =
    "id, user_id, title, difficulty, status, rewards_json, penalty_json, aspects_json, deadline, created_at";

impl RawTask {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            difficulty: row.get(3)?,
            status: row.get(4)?,
            rewards_json: row.get(5)?,
            penalty_json: row.get(6)?,
            aspects_json: row.get(7)?,
            deadline: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn hydrate(self) -> Result<Task> {
        Ok(Task {
            id: self.id,
            user_id: self.user_id,
            title: self.title,
            difficulty: self.difficulty.parse()?,
            status: self.status.parse()?,
            rewards: serde_json::from_str(&self.rewards_json)
                .map_err(|e| GrindstoneError::Database(format!("bad rewards_json: {e}")))?,
            penalty: serde_json::from_str(&self.penalty_json)
                .map_err(|e| GrindstoneError::Database(format!("bad penalty_json: {e}")))?,
            aspects: serde_json::from_str(&self.aspects_json)
                .map_err(|e| GrindstoneError::Database(format!("bad aspects_json: {e}")))?,
            deadline: self.deadline.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct RawHabit {
    id: i64,
    user_id: i64,
    title: String,
    difficulty: String,
    is_active: bool,
    streak: i64,
    last_completed_date: Option<String>,
    last_penalized_date: Option<String>,
    created_at: String,
}

const HABIT_COLUMNS: &str =
    "id, user_id, title, difficulty, is_active, streak, last_completed_date, last_penalized_date, created_at";

impl RawHabit {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            difficulty: row.get(3)?,
            is_active: row.get(4)?,
            streak: row.get(5)?,
            last_completed_date: row.get(6)?,
            last_penalized_date: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn hydrate(self) -> Result<Habit> {
        Ok(Habit {
            id: self.id,
            user_id: self.user_id,
            title: self.title,
            difficulty: self.difficulty.parse()?,
            is_active: self.is_active,
            streak: self.streak.max(0) as u32,
            last_completed_date: self.last_completed_date.as_deref().map(parse_date).transpose()?,
            last_penalized_date: self.last_penalized_date.as_deref().map(parse_date).transpose()?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct RawCharacter {
    id: i64,
    user_id: i64,
    name: String,
    level: i64,
    xp: i64,
    coins: i64,
    hp: i64,
    max_hp: i64,
    stats_json: String,
    last_active_date: Option<String>,
    version: i64,
}

const CHARACTER_COLUMNS: &str =
    "id, user_id, name, level, xp, coins, hp, max_hp, stats_json, last_active_date, version";

impl RawCharacter {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            level: row.get(3)?,
            xp: row.get(4)?,
            coins: row.get(5)?,
            hp: row.get(6)?,
            max_hp: row.get(7)?,
            stats_json: row.get(8)?,
            last_active_date: row.get(9)?,
            version: row.get(10)?,
        })
    }

    fn hydrate(self) -> Result<Character> {
        Ok(Character {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            level: self.level,
            xp: self.xp,
            coins: self.coins,
            hp: self.hp,
            max_hp: self.max_hp,
            stats: serde_json::from_str(&self.stats_json)
                .map_err(|e| GrindstoneError::Database(format!("bad stats_json: {e}")))?,
            last_active_date: self.last_active_date.as_deref().map(parse_ts).transpose()?,
            version: self.version,
        })
    }
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn hydrate_user(raw: (i64, String, String, String, String)) -> Result<User> {
    Ok(User {
        id: raw.0,
        email: raw.1,
        password_hash: raw.2,
        timezone: raw.3,
        created_at: parse_ts(&raw.4)?,
    })
}

fn load_character(conn: &Connection, user_id: i64) -> Result<Character> {
    let raw = conn
        .query_row(
            &format!("SELECT {CHARACTER_COLUMNS} FROM characters WHERE user_id = ?1"),
            params![user_id],
            RawCharacter::from_row,
        )
        .optional()
        .map_err(db)?
        .ok_or_else(|| GrindstoneError::NotFound("character".into()))?;
    raw.hydrate()
}

#[async_trait]
impl GameStore for SqliteStore {
    async fn register_user(
        &self,
        email: &str,
        password_hash: &str,
        character_name: &str,
    ) -> Result<User> {
        let email = email.to_string();
        let password_hash = password_hash.to_string();
        let character_name = character_name.to_string();

        self.with_conn(move |conn| {
            let now = ts(Utc::now());
            let tx = conn.transaction().map_err(db)?;

            let inserted = tx.execute(
                "INSERT INTO users (email, password_hash, timezone, created_at) VALUES (?1, ?2, 'UTC', ?3)",
                params![email, password_hash, now],
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
                {
                    return Err(GrindstoneError::EmailTaken);
                }
                Err(e) => return Err(db(e)),
            }
            let user_id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO characters (user_id, name) VALUES (?1, ?2)",
                params![user_id, character_name],
            )
            .map_err(db)?;

            tx.execute(
                "INSERT INTO event_log (user_id, event_type, details_json, created_at) VALUES (?1, 'ACCOUNT_CREATED', ?2, ?3)",
                params![user_id, event::account_created_details(&email).to_string(), now],
            )
            .map_err(db)?;

            tx.commit().map_err(db)?;

            Ok(User {
                id: user_id,
                email,
                password_hash,
                timezone: "UTC".into(),
                created_at: parse_ts(&now)?,
            })
        })
        .await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = email.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, email, password_hash, timezone, created_at FROM users WHERE email = ?1",
                params![email],
                user_from_row,
            )
            .optional()
            .map_err(db)?
            .map(hydrate_user)
            .transpose()
        })
        .await
    }

    async fn record_login(&self, user_id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO user_activity (user_id, activity_type, created_at) VALUES (?1, 'LOGIN', ?2)",
                params![user_id, ts(Utc::now())],
            )
            .map_err(db)?;
            Ok(())
        })
        .await
    }

    async fn fetch_state(&self, user_id: i64) -> Result<GameState> {
        self.with_conn(move |conn| {
            let character = load_character(conn, user_id)?;

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ?1 ORDER BY id"
                ))
                .map_err(db)?;
            let raw_tasks = stmt
                .query_map(params![user_id], RawTask::from_row)
                .map_err(db)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db)?;
            let tasks = raw_tasks
                .into_iter()
                .map(RawTask::hydrate)
                .collect::<Result<Vec<_>>>()?;

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {HABIT_COLUMNS} FROM habits WHERE user_id = ?1 ORDER BY id"
                ))
                .map_err(db)?;
            let raw_habits = stmt
                .query_map(params![user_id], RawHabit::from_row)
                .map_err(db)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db)?;
            let habits = raw_habits
                .into_iter()
                .map(RawHabit::hydrate)
                .collect::<Result<Vec<_>>>()?;

            Ok(GameState {
                character,
                tasks,
                habits,
            })
        })
        .await
    }

    async fn touch_last_active(&self, user_id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            let n = conn
                .execute(
                    "UPDATE characters SET last_active_date = ?1 WHERE user_id = ?2",
                    params![ts(Utc::now()), user_id],
                )
                .map_err(db)?;
            if n == 0 {
                return Err(GrindstoneError::NotFound("character".into()));
            }
            Ok(())
        })
        .await
    }

    async fn events_for_user(&self, user_id: i64) -> Result<Vec<EventLogEntry>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, user_id, event_type, details_json, created_at FROM event_log WHERE user_id = ?1 ORDER BY id",
                )
                .map_err(db)?;
            let raw = stmt
                .query_map(params![user_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(db)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db)?;

            raw.into_iter()
                .map(|(id, user_id, event_type, details_json, created_at)| {
                    Ok(EventLogEntry {
                        id,
                        user_id,
                        event_type: event_type.parse()?,
                        details: serde_json::from_str(&details_json).map_err(|e| {
                            GrindstoneError::Database(format!("bad details_json: {e}"))
                        })?,
                        created_at: parse_ts(&created_at)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn create_task(
        &self,
        user_id: i64,
        draft: &TaskDraft,
        rewards: Rewards,
        penalty: Penalty,
    ) -> Result<Task> {
        let draft = draft.clone();
        self.with_conn(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO tasks (user_id, title, difficulty, status, rewards_json, penalty_json, aspects_json, deadline, created_at)
                 VALUES (?1, ?2, ?3, 'ACTIVE', ?4, ?5, ?6, ?7, ?8)",
                params![
                    user_id,
                    draft.title,
                    draft.difficulty.as_str(),
                    serde_json::json!(rewards).to_string(),
                    serde_json::json!(penalty).to_string(),
                    serde_json::json!(draft.aspects).to_string(),
                    draft.deadline.map(ts),
                    ts(now),
                ],
            )
            .map_err(rowerr)?;

            Ok(Task {
                id: conn.last_insert_rowid(),
                user_id,
                title: draft.title,
                difficulty: draft.difficulty,
                status: TaskStatus::Active,
                rewards,
                penalty,
                aspects: draft.aspects,
                deadline: draft.deadline,
                created_at: now,
            })
        })
        .await
    }

    async fn complete_task(&self, user_id: i64, task_id: i64) -> Result<Rewards> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db)?;

            let row = tx
                .query_row(
                    "SELECT status, rewards_json FROM tasks WHERE id = ?1 AND user_id = ?2",
                    params![task_id, user_id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()
                .map_err(db)?;

            let (status, rewards_json) =
                row.ok_or_else(|| GrindstoneError::NotFound("task".into()))?;
            match status.parse::<TaskStatus>()? {
                TaskStatus::Completed => return Err(GrindstoneError::AlreadyCompleted),
                TaskStatus::Failed => return Err(GrindstoneError::TaskNotActive),
                TaskStatus::Active => {}
            }
            let rewards: Rewards = serde_json::from_str(&rewards_json)
                .map_err(|e| GrindstoneError::Database(format!("bad rewards_json: {e}")))?;

            let n = tx
                .execute(
                    "UPDATE tasks SET status = 'COMPLETED' WHERE id = ?1 AND status = 'ACTIVE'",
                    params![task_id],
                )
                .map_err(rowerr)?;
            if n == 0 {
                return Err(GrindstoneError::TaskNotActive);
            }

            tx.execute(
                "UPDATE characters SET xp = xp + ?1, coins = coins + ?2, version = version + 1 WHERE user_id = ?3",
                params![rewards.xp, rewards.coins, user_id],
            )
            .map_err(rowerr)?;

            tx.execute(
                "INSERT INTO event_log (user_id, event_type, details_json, created_at) VALUES (?1, 'TASK_COMPLETE', ?2, ?3)",
                params![
                    user_id,
                    event::task_complete_details(task_id, rewards).to_string(),
                    ts(Utc::now()),
                ],
            )
            .map_err(rowerr)?;

            tx.commit().map_err(db)?;
            Ok(rewards)
        })
        .await
    }

    async fn create_habit(&self, user_id: i64, draft: &HabitDraft) -> Result<Habit> {
        let draft = draft.clone();
        self.with_conn(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO habits (user_id, title, difficulty, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![user_id, draft.title, draft.difficulty.as_str(), ts(now)],
            )
            .map_err(rowerr)?;

            Ok(Habit {
                id: conn.last_insert_rowid(),
                user_id,
                title: draft.title,
                difficulty: draft.difficulty,
                is_active: true,
                streak: 0,
                last_completed_date: None,
                last_penalized_date: None,
                created_at: now,
            })
        })
        .await
    }

    async fn complete_habit(&self, user_id: i64, habit_id: i64, today: NaiveDate) -> Result<u32> {
        self.with_conn(move |conn| {
            let today_str = date_str(today);
            let tx = conn.transaction().map_err(db)?;

            let row = tx
                .query_row(
                    "SELECT streak, last_completed_date FROM habits WHERE id = ?1 AND user_id = ?2",
                    params![habit_id, user_id],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
                )
                .optional()
                .map_err(db)?;

            let (streak, last_completed) =
                row.ok_or_else(|| GrindstoneError::NotFound("habit".into()))?;
            if last_completed.as_deref() == Some(today_str.as_str()) {
                return Err(GrindstoneError::AlreadyCompletedToday);
            }

            tx.execute(
                "UPDATE habits SET streak = streak + 1, last_completed_date = ?1 WHERE id = ?2",
                params![today_str, habit_id],
            )
            .map_err(rowerr)?;

            tx.execute(
                "UPDATE characters SET xp = xp + ?1, coins = coins + ?2, version = version + 1 WHERE user_id = ?3",
                params![HABIT_REWARD.xp, HABIT_REWARD.coins, user_id],
            )
            .map_err(rowerr)?;

            tx.commit().map_err(db)?;
            Ok((streak + 1).max(0) as u32)
        })
        .await
    }

    async fn delinquent_habits(&self, cutoff: NaiveDate) -> Result<Vec<Habit>> {
        self.with_conn(move |conn| {
            let cutoff_str = date_str(cutoff);
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {HABIT_COLUMNS} FROM habits
                     WHERE is_active = 1
                       AND (last_completed_date IS NULL OR last_completed_date < ?1)
                       AND substr(created_at, 1, 10) <= ?1
                       AND (last_penalized_date IS NULL OR last_penalized_date <> ?1)
                     ORDER BY id"
                ))
                .map_err(fetch)?;
            let raw = stmt
                .query_map(params![cutoff_str], RawHabit::from_row)
                .map_err(fetch)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(fetch)?;
            raw.into_iter().map(RawHabit::hydrate).collect()
        })
        .await
    }

    async fn overdue_tasks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status = 'ACTIVE' AND deadline IS NOT NULL AND deadline < ?1
                     ORDER BY id"
                ))
                .map_err(fetch)?;
            let raw = stmt
                .query_map(params![ts(cutoff)], RawTask::from_row)
                .map_err(fetch)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(fetch)?;
            raw.into_iter().map(RawTask::hydrate).collect()
        })
        .await
    }

    async fn apply_habit_penalty(&self, habit: &Habit, cutoff: NaiveDate) -> Result<PenaltyOutcome> {
        let habit_id = habit.id;
        let user_id = habit.user_id;
        self.with_conn(move |conn| {
            let cutoff_str = date_str(cutoff);
            let tx = conn.transaction().map_err(db)?;

            // The stamp is the idempotency guard: a second run for the same
            // cutoff matches zero rows and applies nothing. The delinquency
            // condition is re-asserted here too, so a completion committed
            // after the candidate fetch makes this a no-op instead of
            // clobbering the fresh streak.
            let n = tx
                .execute(
                    "UPDATE habits SET streak = 0, last_penalized_date = ?1
                     WHERE id = ?2
                       AND (last_penalized_date IS NULL OR last_penalized_date <> ?1)
                       AND (last_completed_date IS NULL OR last_completed_date < ?1)",
                    params![cutoff_str, habit_id],
                )
                .map_err(rowerr)?;
            if n == 0 {
                return Ok(PenaltyOutcome::AlreadyApplied);
            }

            tx.execute(
                "UPDATE characters SET hp = MAX(1, hp - ?1), version = version + 1 WHERE user_id = ?2",
                params![HABIT_PENALTY_HP, user_id],
            )
            .map_err(rowerr)?;

            tx.execute(
                "INSERT INTO event_log (user_id, event_type, details_json, created_at) VALUES (?1, 'PENALTY_HABIT', ?2, ?3)",
                params![
                    user_id,
                    event::habit_penalty_details(habit_id, HABIT_PENALTY_HP).to_string(),
                    ts(Utc::now()),
                ],
            )
            .map_err(rowerr)?;

            tx.commit().map_err(db)?;
            Ok(PenaltyOutcome::Applied)
        })
        .await
    }

    async fn fail_overdue_task(&self, task: &Task) -> Result<PenaltyOutcome> {
        let task_id = task.id;
        let user_id = task.user_id;
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db)?;

            // Forward-only status machine doubles as the guard
            let n = tx
                .execute(
                    "UPDATE tasks SET status = 'FAILED' WHERE id = ?1 AND status = 'ACTIVE'",
                    params![task_id],
                )
                .map_err(rowerr)?;
            if n == 0 {
                return Ok(PenaltyOutcome::AlreadyApplied);
            }

            tx.execute(
                "UPDATE characters SET hp = MAX(1, hp - ?1), version = version + 1 WHERE user_id = ?2",
                params![TASK_PENALTY_HP, user_id],
            )
            .map_err(rowerr)?;

            tx.execute(
                "INSERT INTO event_log (user_id, event_type, details_json, created_at) VALUES (?1, 'PENALTY_TASK', ?2, ?3)",
                params![
                    user_id,
                    event::task_penalty_details(task_id, TASK_PENALTY_HP).to_string(),
                    ts(Utc::now()),
                ],
            )
            .map_err(rowerr)?;

            tx.commit().map_err(db)?;
            Ok(PenaltyOutcome::Applied)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Difficulty, EventType};
    use chrono::TimeZone;

    fn exec(store: &SqliteStore, sql: &str, params: impl rusqlite::Params) {
        store.conn.lock().unwrap().execute(sql, params).unwrap();
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn seeded_user(store: &SqliteStore) -> i64 {
        store
            .register_user("jin@example.com", "hash", "jin")
            .await
            .unwrap()
            .id
    }

    fn habit_draft(title: &str) -> HabitDraft {
        HabitDraft {
            title: title.to_string(),
            difficulty: Difficulty::Easy,
        }
    }

    #[tokio::test]
    async fn register_creates_character_and_audit_event() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = store
            .register_user("jin@example.com", "hash", "jin")
            .await
            .unwrap();

        let state = store.fetch_state(user.id).await.unwrap();
        assert_eq!(state.character.name, "jin");
        assert_eq!(state.character.hp, 100);
        assert_eq!(state.character.version, 1);

        let events = store.events_for_user(user.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, crate::model::EventType::AccountCreated);
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.register_user("a@b.c", "h", "a").await.unwrap();
        let err = store.register_user("a@b.c", "h2", "a2").await.unwrap_err();
        assert!(matches!(err, GrindstoneError::EmailTaken));
    }

    #[tokio::test]
    async fn find_user_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.register_user("a@b.c", "h", "a").await.unwrap();

        let found = store.find_user_by_email("a@b.c").await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().timezone, "UTC");

        assert!(store.find_user_by_email("nope@b.c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn data_survives_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grindstone.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            let user_id = seeded_user(&store).await;
            store
                .create_habit(user_id, &habit_draft("meditate"))
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let user = store
            .find_user_by_email("jin@example.com")
            .await
            .unwrap()
            .unwrap();
        let state = store.fetch_state(user.id).await.unwrap();
        assert_eq!(state.habits.len(), 1);
        assert_eq!(state.habits[0].title, "meditate");
    }

    #[tokio::test]
    async fn habit_penalty_cycle_is_transactional_and_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user_id = seeded_user(&store).await;
        let habit = store
            .create_habit(user_id, &habit_draft("meditate"))
            .await
            .unwrap();
        // Backdate the creation so the grace window has passed
        exec(
            &store,
            "UPDATE habits SET created_at = '2024-01-01T09:00:00Z', streak = 6 WHERE id = ?1",
            params![habit.id],
        );

        let cutoff = date(2024, 1, 9);
        let delinquent = store.delinquent_habits(cutoff).await.unwrap();
        assert_eq!(delinquent.len(), 1);
        assert_eq!(delinquent[0].id, habit.id);

        let outcome = store
            .apply_habit_penalty(&delinquent[0], cutoff)
            .await
            .unwrap();
        assert_eq!(outcome, PenaltyOutcome::Applied);

        let state = store.fetch_state(user_id).await.unwrap();
        assert_eq!(state.habits[0].streak, 0);
        assert_eq!(state.habits[0].last_penalized_date, Some(cutoff));
        assert_eq!(state.character.hp, 100 - HABIT_PENALTY_HP);
        assert_eq!(state.character.version, 2);

        let events = store.events_for_user(user_id).await.unwrap();
        let penalty = events
            .iter()
            .find(|e| e.event_type == EventType::PenaltyHabit)
            .unwrap();
        assert_eq!(penalty.details["habitId"], habit.id);
        assert_eq!(penalty.details["penalty"]["hp"], HABIT_PENALTY_HP);

        // Replays stop at the last_penalized_date guard
        let again = store
            .apply_habit_penalty(&delinquent[0], cutoff)
            .await
            .unwrap();
        assert_eq!(again, PenaltyOutcome::AlreadyApplied);
        let state = store.fetch_state(user_id).await.unwrap();
        assert_eq!(state.character.hp, 100 - HABIT_PENALTY_HP);

        // No longer a candidate either
        assert!(store.delinquent_habits(cutoff).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completion_racing_the_penalty_write_wins() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user_id = seeded_user(&store).await;
        let habit = store
            .create_habit(user_id, &habit_draft("meditate"))
            .await
            .unwrap();
        exec(
            &store,
            "UPDATE habits SET created_at = '2024-01-01T09:00:00Z', streak = 6 WHERE id = ?1",
            params![habit.id],
        );

        let cutoff = date(2024, 1, 9);
        let candidates = store.delinquent_habits(cutoff).await.unwrap();
        assert_eq!(candidates.len(), 1);

        // Player checks in between the candidate fetch and the penalty write
        store
            .complete_habit(user_id, habit.id, date(2024, 1, 10))
            .await
            .unwrap();

        let outcome = store
            .apply_habit_penalty(&candidates[0], cutoff)
            .await
            .unwrap();
        assert_eq!(outcome, PenaltyOutcome::AlreadyApplied);

        let state = store.fetch_state(user_id).await.unwrap();
        assert_eq!(state.habits[0].streak, 7);
        assert_eq!(state.habits[0].last_completed_date, Some(date(2024, 1, 10)));
        assert!(state.habits[0].last_penalized_date.is_none());
        assert_eq!(state.character.hp, 100);

        let events = store.events_for_user(user_id).await.unwrap();
        assert!(!events
            .iter()
            .any(|e| e.event_type == EventType::PenaltyHabit));
    }

    #[tokio::test]
    async fn habit_completed_on_cutoff_is_not_a_candidate() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user_id = seeded_user(&store).await;
        let habit = store
            .create_habit(user_id, &habit_draft("stretch"))
            .await
            .unwrap();
        exec(
            &store,
            "UPDATE habits SET created_at = '2024-01-01T09:00:00Z', \
             last_completed_date = '2024-01-09' WHERE id = ?1",
            params![habit.id],
        );

        assert!(store
            .delinquent_habits(date(2024, 1, 9))
            .await
            .unwrap()
            .is_empty());
        // ...but it misses the next day
        assert_eq!(
            store.delinquent_habits(date(2024, 1, 10)).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn habit_created_today_gets_the_grace_window() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user_id = seeded_user(&store).await;
        store
            .create_habit(user_id, &habit_draft("journal"))
            .await
            .unwrap();

        // created_at is now, cutoff is yesterday
        let cutoff = (Utc::now() - chrono::Duration::days(1)).date_naive();
        assert!(store.delinquent_habits(cutoff).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overdue_task_fails_once_and_floors_hp() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user_id = seeded_user(&store).await;
        exec(
            &store,
            "UPDATE characters SET hp = 6 WHERE user_id = ?1",
            params![user_id],
        );

        let draft = TaskDraft {
            title: "file taxes".to_string(),
            difficulty: Difficulty::Hard,
            aspects: vec!["discipline".to_string()],
            deadline: Some(Utc.with_ymd_and_hms(2024, 1, 9, 23, 0, 0).unwrap()),
        };
        let task = store
            .create_task(
                user_id,
                &draft,
                Difficulty::Hard.rewards(),
                Difficulty::Hard.default_penalty(),
            )
            .await
            .unwrap();

        let cutoff = Utc.with_ymd_and_hms(2024, 1, 10, 0, 5, 0).unwrap();
        let overdue = store.overdue_tasks(cutoff).await.unwrap();
        assert_eq!(overdue.len(), 1);

        let outcome = store.fail_overdue_task(&overdue[0]).await.unwrap();
        assert_eq!(outcome, PenaltyOutcome::Applied);

        let state = store.fetch_state(user_id).await.unwrap();
        assert_eq!(state.tasks[0].status, TaskStatus::Failed);
        assert_eq!(state.tasks[0].aspects, vec!["discipline".to_string()]);
        assert_eq!(state.character.hp, 1);

        // The status CAS is the guard
        let again = store.fail_overdue_task(&overdue[0]).await.unwrap();
        assert_eq!(again, PenaltyOutcome::AlreadyApplied);

        // And a failed task cannot be completed afterwards
        let err = store.complete_task(user_id, task.id).await.unwrap_err();
        assert!(matches!(err, GrindstoneError::TaskNotActive));
    }

    #[tokio::test]
    async fn completed_task_is_never_overdue() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user_id = seeded_user(&store).await;
        let draft = TaskDraft {
            title: "ship release".to_string(),
            difficulty: Difficulty::Medium,
            aspects: vec![],
            deadline: Some(Utc.with_ymd_and_hms(2024, 1, 9, 23, 0, 0).unwrap()),
        };
        let task = store
            .create_task(
                user_id,
                &draft,
                Difficulty::Medium.rewards(),
                Difficulty::Medium.default_penalty(),
            )
            .await
            .unwrap();
        store.complete_task(user_id, task.id).await.unwrap();

        let cutoff = Utc.with_ymd_and_hms(2024, 1, 10, 0, 5, 0).unwrap();
        assert!(store.overdue_tasks(cutoff).await.unwrap().is_empty());

        let state = store.fetch_state(user_id).await.unwrap();
        assert_eq!(state.character.xp, Difficulty::Medium.rewards().xp);
    }

    #[tokio::test]
    async fn habit_completion_streak_and_daily_guard() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user_id = seeded_user(&store).await;
        let habit = store
            .create_habit(user_id, &habit_draft("run"))
            .await
            .unwrap();

        let today = date(2024, 1, 10);
        assert_eq!(store.complete_habit(user_id, habit.id, today).await.unwrap(), 1);
        let err = store
            .complete_habit(user_id, habit.id, today)
            .await
            .unwrap_err();
        assert!(matches!(err, GrindstoneError::AlreadyCompletedToday));

        // Next day continues the streak
        assert_eq!(
            store
                .complete_habit(user_id, habit.id, date(2024, 1, 11))
                .await
                .unwrap(),
            2
        );

        let state = store.fetch_state(user_id).await.unwrap();
        assert_eq!(state.character.xp, 2 * HABIT_REWARD.xp);
        assert_eq!(state.character.coins, 2 * HABIT_REWARD.coins);
    }
}
