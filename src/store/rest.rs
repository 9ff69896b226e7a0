//! REST-backed network store
//!
//! Adapter for a PostgREST-style relational API (Supabase and friends). The
//! backend offers no multi-statement transactions to the client, so the
//! atomicity contract is met with guarded writes instead:
//!
//! - habit penalties and task failures are conditional PATCHes whose filter
//!   doubles as the idempotency guard (zero matched rows = already applied)
//! - the contended character row carries a monotonic `version` column;
//!   updates are compare-and-swap on it with bounded retry, so a completion
//!   racing the reconciliation pass can never clobber an hp write
//! - the event-log insert comes last; a crash mid-triple can lose an audit
//!   row but can never double-apply a penalty

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::model::{
    event, Character, Difficulty, EventLogEntry, EventType, GameState, Habit, HabitDraft, Penalty,
    Rewards, Task, TaskDraft, TaskStatus, User, HABIT_PENALTY_HP, HABIT_REWARD, TASK_PENALTY_HP,
};
use crate::store::{GameStore, PenaltyOutcome};
use crate::types::{GrindstoneError, Result};

use async_trait::async_trait;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const CAS_MAX_RETRIES: u32 = 5;

pub struct RestStore {
    http: Client,
    base_url: String,
}

impl RestStore {
    /// `base_url` is the REST root (e.g. `https://xyz.supabase.co/rest/v1`);
    /// `service_key` is sent as both the api key and the bearer token.
    pub fn new(base_url: &str, service_key: &str) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        let key_value = header::HeaderValue::from_str(service_key)
            .map_err(|e| GrindstoneError::Config(format!("invalid service key: {e}")))?;
        headers.insert("apikey", key_value);
        let bearer = header::HeaderValue::from_str(&format!("Bearer {service_key}"))
            .map_err(|e| GrindstoneError::Config(format!("invalid service key: {e}")))?;
        headers.insert(header::AUTHORIZATION, bearer);

        let http = Client::builder()
            .default_headers(headers)
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| GrindstoneError::Config(format!("http client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    async fn read_body(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(GrindstoneError::Database(format!("HTTP {status}: {body}")))
    }

    async fn get_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let resp = self
            .http
            .get(self.url(table))
            .query(query)
            .send()
            .await
            .map_err(|e| GrindstoneError::Database(format!("GET {table}: {e}")))?;
        Self::read_body(resp)
            .await?
            .json()
            .await
            .map_err(|e| GrindstoneError::Database(format!("GET {table} body: {e}")))
    }

    /// Conditional update; returns the rows that matched the filter
    async fn patch_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
        body: &Value,
    ) -> Result<Vec<T>> {
        let resp = self
            .http
            .patch(self.url(table))
            .query(query)
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await
            .map_err(|e| GrindstoneError::Database(format!("PATCH {table}: {e}")))?;
        Self::read_body(resp)
            .await?
            .json()
            .await
            .map_err(|e| GrindstoneError::Database(format!("PATCH {table} body: {e}")))
    }

    async fn insert_row(&self, table: &str, body: &Value) -> Result<()> {
        let resp = self
            .http
            .post(self.url(table))
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await
            .map_err(|e| GrindstoneError::Database(format!("POST {table}: {e}")))?;
        Self::read_body(resp).await.map(|_| ())
    }

    async fn insert_returning<T: DeserializeOwned>(&self, table: &str, body: &Value) -> Result<T> {
        let resp = self
            .http
            .post(self.url(table))
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await
            .map_err(|e| GrindstoneError::Database(format!("POST {table}: {e}")))?;
        let mut rows: Vec<T> = Self::read_body(resp)
            .await?
            .json()
            .await
            .map_err(|e| GrindstoneError::Database(format!("POST {table} body: {e}")))?;
        rows.pop()
            .ok_or_else(|| GrindstoneError::Database(format!("POST {table}: empty representation")))
    }

    /// Compare-and-swap update of the character row. Re-reads, applies
    /// `mutate`, and writes back filtered on the version it read; a missed
    /// swap means a concurrent writer won and the loop retries.
    async fn update_character_cas<F>(&self, user_id: i64, mutate: F) -> Result<Character>
    where
        F: Fn(&mut Character) + Send + Sync,
    {
        for attempt in 0..CAS_MAX_RETRIES {
            let mut rows: Vec<CharacterRow> = self
                .get_rows("characters", &[("user_id", format!("eq.{user_id}"))])
                .await?;
            let row = rows
                .pop()
                .ok_or_else(|| GrindstoneError::NotFound("character".into()))?;

            let mut character: Character = row.into();
            let expected = character.version;
            mutate(&mut character);
            character.version = expected + 1;

            let swapped: Vec<CharacterRow> = self
                .patch_rows(
                    "characters",
                    &[
                        ("user_id", format!("eq.{user_id}")),
                        ("version", format!("eq.{expected}")),
                    ],
                    &json!({
                        "xp": character.xp,
                        "coins": character.coins,
                        "hp": character.hp,
                        "version": character.version,
                    }),
                )
                .await?;

            if !swapped.is_empty() {
                return Ok(character);
            }

            // No backoff after the last attempt; fail straight away
            if attempt + 1 < CAS_MAX_RETRIES {
                debug!(user_id, attempt, "character version conflict, retrying");
                tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt + 1))).await;
            }
        }

        Err(GrindstoneError::Conflict(format!("character of user {user_id}")))
    }
}

fn as_fetch(e: GrindstoneError) -> GrindstoneError {
    match e {
        GrindstoneError::Database(m) => GrindstoneError::Fetch(m),
        other => other,
    }
}

fn as_row_update(e: GrindstoneError) -> GrindstoneError {
    match e {
        GrindstoneError::Database(m) => GrindstoneError::RowUpdate(m),
        other => other,
    }
}

// --- wire rows ---

#[derive(Debug, Deserialize)]
struct UserRow {
    id: i64,
    email: String,
    password_hash: String,
    timezone: String,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(r: UserRow) -> Self {
        User {
            id: r.id,
            email: r.email,
            password_hash: r.password_hash,
            timezone: r.timezone,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CharacterRow {
    id: i64,
    user_id: i64,
    name: String,
    level: i64,
    xp: i64,
    coins: i64,
    hp: i64,
    max_hp: i64,
    #[serde(default)]
    stats: BTreeMap<String, i64>,
    last_active_date: Option<DateTime<Utc>>,
    version: i64,
}

impl From<CharacterRow> for Character {
    fn from(r: CharacterRow) -> Self {
        Character {
            id: r.id,
            user_id: r.user_id,
            name: r.name,
            level: r.level,
            xp: r.xp,
            coins: r.coins,
            hp: r.hp,
            max_hp: r.max_hp,
            stats: r.stats,
            last_active_date: r.last_active_date,
            version: r.version,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TaskRow {
    id: i64,
    user_id: i64,
    title: String,
    difficulty: Difficulty,
    status: TaskStatus,
    rewards: Rewards,
    penalty: Penalty,
    #[serde(default)]
    aspects: Vec<String>,
    deadline: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<TaskRow> for Task {
    fn from(r: TaskRow) -> Self {
        Task {
            id: r.id,
            user_id: r.user_id,
            title: r.title,
            difficulty: r.difficulty,
            status: r.status,
            rewards: r.rewards,
            penalty: r.penalty,
            aspects: r.aspects,
            deadline: r.deadline,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HabitRow {
    id: i64,
    user_id: i64,
    title: String,
    difficulty: Difficulty,
    is_active: bool,
    streak: u32,
    last_completed_date: Option<NaiveDate>,
    last_penalized_date: Option<NaiveDate>,
    created_at: DateTime<Utc>,
}

impl From<HabitRow> for Habit {
    fn from(r: HabitRow) -> Self {
        Habit {
            id: r.id,
            user_id: r.user_id,
            title: r.title,
            difficulty: r.difficulty,
            is_active: r.is_active,
            streak: r.streak,
            last_completed_date: r.last_completed_date,
            last_penalized_date: r.last_penalized_date,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventRow {
    id: i64,
    user_id: i64,
    event_type: EventType,
    details: Value,
    created_at: DateTime<Utc>,
}

impl From<EventRow> for EventLogEntry {
    fn from(r: EventRow) -> Self {
        EventLogEntry {
            id: r.id,
            user_id: r.user_id,
            event_type: r.event_type,
            details: r.details,
            created_at: r.created_at,
        }
    }
}

#[async_trait]
impl GameStore for RestStore {
    async fn register_user(
        &self,
        email: &str,
        password_hash: &str,
        character_name: &str,
    ) -> Result<User> {
        // No transaction across tables here; the user row is the anchor and
        // the unique email constraint is the dedupe guard.
        let resp = self
            .http
            .post(self.url("users"))
            .header("Prefer", "return=representation")
            .json(&json!({
                "email": email,
                "password_hash": password_hash,
                "timezone": "UTC",
                "created_at": Utc::now(),
            }))
            .send()
            .await
            .map_err(|e| GrindstoneError::Database(format!("POST users: {e}")))?;
        if resp.status() == StatusCode::CONFLICT {
            return Err(GrindstoneError::EmailTaken);
        }
        let mut rows: Vec<UserRow> = Self::read_body(resp)
            .await?
            .json()
            .await
            .map_err(|e| GrindstoneError::Database(format!("POST users body: {e}")))?;
        let user = rows
            .pop()
            .ok_or_else(|| GrindstoneError::Database("POST users: empty representation".into()))?;

        self.insert_row(
            "characters",
            &json!({
                "user_id": user.id,
                "name": character_name,
                "level": 1,
                "xp": 0,
                "coins": 0,
                "hp": 100,
                "max_hp": 100,
                "stats": {},
                "version": 1,
            }),
        )
        .await?;

        self.insert_row(
            "event_log",
            &json!({
                "user_id": user.id,
                "event_type": EventType::AccountCreated.as_str(),
                "details": event::account_created_details(email),
                "created_at": Utc::now(),
            }),
        )
        .await?;

        Ok(user.into())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let mut rows: Vec<UserRow> = self
            .get_rows("users", &[("email", format!("eq.{email}"))])
            .await?;
        Ok(rows.pop().map(Into::into))
    }

    async fn record_login(&self, user_id: i64) -> Result<()> {
        self.insert_row(
            "user_activity",
            &json!({
                "user_id": user_id,
                "activity_type": "LOGIN",
                "created_at": Utc::now(),
            }),
        )
        .await
    }

    async fn fetch_state(&self, user_id: i64) -> Result<GameState> {
        let eq_user = ("user_id", format!("eq.{user_id}"));
        let order = ("order", "id.asc".to_string());

        let mut characters: Vec<CharacterRow> =
            self.get_rows("characters", &[eq_user.clone()]).await?;
        let character = characters
            .pop()
            .ok_or_else(|| GrindstoneError::NotFound("character".into()))?;

        let tasks: Vec<TaskRow> = self
            .get_rows("tasks", &[eq_user.clone(), order.clone()])
            .await?;
        let habits: Vec<HabitRow> = self.get_rows("habits", &[eq_user, order]).await?;

        Ok(GameState {
            character: character.into(),
            tasks: tasks.into_iter().map(Into::into).collect(),
            habits: habits.into_iter().map(Into::into).collect(),
        })
    }

    async fn touch_last_active(&self, user_id: i64) -> Result<()> {
        // Timestamp-only write; a lost update is harmless, so no CAS
        let rows: Vec<CharacterRow> = self
            .patch_rows(
                "characters",
                &[("user_id", format!("eq.{user_id}"))],
                &json!({ "last_active_date": Utc::now() }),
            )
            .await?;
        if rows.is_empty() {
            return Err(GrindstoneError::NotFound("character".into()));
        }
        Ok(())
    }

    async fn events_for_user(&self, user_id: i64) -> Result<Vec<EventLogEntry>> {
        let rows: Vec<EventRow> = self
            .get_rows(
                "event_log",
                &[
                    ("user_id", format!("eq.{user_id}")),
                    ("order", "id.asc".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create_task(
        &self,
        user_id: i64,
        draft: &TaskDraft,
        rewards: Rewards,
        penalty: Penalty,
    ) -> Result<Task> {
        let row: TaskRow = self
            .insert_returning(
                "tasks",
                &json!({
                    "user_id": user_id,
                    "title": draft.title,
                    "difficulty": draft.difficulty,
                    "status": TaskStatus::Active,
                    "rewards": rewards,
                    "penalty": penalty,
                    "aspects": draft.aspects,
                    "deadline": draft.deadline,
                    "created_at": Utc::now(),
                }),
            )
            .await
            .map_err(as_row_update)?;
        Ok(row.into())
    }

    async fn complete_task(&self, user_id: i64, task_id: i64) -> Result<Rewards> {
        let mut rows: Vec<TaskRow> = self
            .get_rows(
                "tasks",
                &[
                    ("id", format!("eq.{task_id}")),
                    ("user_id", format!("eq.{user_id}")),
                ],
            )
            .await?;
        let task = rows
            .pop()
            .ok_or_else(|| GrindstoneError::NotFound("task".into()))?;

        match task.status {
            TaskStatus::Completed => return Err(GrindstoneError::AlreadyCompleted),
            TaskStatus::Failed => return Err(GrindstoneError::TaskNotActive),
            TaskStatus::Active => {}
        }
        let rewards = task.rewards;

        // CAS on the status: loses the race gracefully if the reset job
        // failed this task in the meantime
        let swapped: Vec<TaskRow> = self
            .patch_rows(
                "tasks",
                &[
                    ("id", format!("eq.{task_id}")),
                    ("status", "eq.ACTIVE".to_string()),
                ],
                &json!({ "status": TaskStatus::Completed }),
            )
            .await
            .map_err(as_row_update)?;
        if swapped.is_empty() {
            return Err(GrindstoneError::TaskNotActive);
        }

        self.update_character_cas(user_id, |c| c.award(rewards.xp, rewards.coins))
            .await?;

        self.insert_row(
            "event_log",
            &json!({
                "user_id": user_id,
                "event_type": EventType::TaskComplete.as_str(),
                "details": event::task_complete_details(task_id, rewards),
                "created_at": Utc::now(),
            }),
        )
        .await
        .map_err(as_row_update)?;

        Ok(rewards)
    }

    async fn create_habit(&self, user_id: i64, draft: &HabitDraft) -> Result<Habit> {
        let row: HabitRow = self
            .insert_returning(
                "habits",
                &json!({
                    "user_id": user_id,
                    "title": draft.title,
                    "difficulty": draft.difficulty,
                    "is_active": true,
                    "streak": 0,
                    "created_at": Utc::now(),
                }),
            )
            .await
            .map_err(as_row_update)?;
        Ok(row.into())
    }

    async fn complete_habit(&self, user_id: i64, habit_id: i64, today: NaiveDate) -> Result<u32> {
        let mut rows: Vec<HabitRow> = self
            .get_rows(
                "habits",
                &[
                    ("id", format!("eq.{habit_id}")),
                    ("user_id", format!("eq.{user_id}")),
                ],
            )
            .await?;
        let habit = rows
            .pop()
            .ok_or_else(|| GrindstoneError::NotFound("habit".into()))?;

        if habit.last_completed_date == Some(today) {
            return Err(GrindstoneError::AlreadyCompletedToday);
        }

        // Guarded increment: the filter rejects a duplicate completion that
        // raced us between the read and this write
        let swapped: Vec<HabitRow> = self
            .patch_rows(
                "habits",
                &[
                    ("id", format!("eq.{habit_id}")),
                    (
                        "or",
                        format!("(last_completed_date.is.null,last_completed_date.neq.{today})"),
                    ),
                ],
                &json!({
                    "streak": habit.streak + 1,
                    "last_completed_date": today,
                }),
            )
            .await
            .map_err(as_row_update)?;
        let updated = match swapped.into_iter().next() {
            Some(row) => row,
            None => return Err(GrindstoneError::AlreadyCompletedToday),
        };

        self.update_character_cas(user_id, |c| c.award(HABIT_REWARD.xp, HABIT_REWARD.coins))
            .await?;

        Ok(updated.streak)
    }

    async fn delinquent_habits(&self, cutoff: NaiveDate) -> Result<Vec<Habit>> {
        // Server-side filter is a coarse candidate query; the exact rule
        // (creation grace, penalized-for marker) is re-checked here so all
        // adapters share one definition.
        let rows: Vec<HabitRow> = self
            .get_rows(
                "habits",
                &[
                    ("is_active", "eq.true".to_string()),
                    (
                        "or",
                        format!("(last_completed_date.is.null,last_completed_date.lt.{cutoff})"),
                    ),
                    ("order", "id.asc".to_string()),
                ],
            )
            .await
            .map_err(as_fetch)?;

        Ok(rows
            .into_iter()
            .map(Habit::from)
            .filter(|h| h.is_delinquent(cutoff) && !h.penalized_for(cutoff))
            .collect())
    }

    async fn overdue_tasks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = self
            .get_rows(
                "tasks",
                &[
                    ("status", "eq.ACTIVE".to_string()),
                    ("deadline", format!("lt.{}", cutoff.to_rfc3339())),
                    ("order", "id.asc".to_string()),
                ],
            )
            .await
            .map_err(as_fetch)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn apply_habit_penalty(&self, habit: &Habit, cutoff: NaiveDate) -> Result<PenaltyOutcome> {
        // Stamp first: once last_penalized_date carries the cutoff, replays
        // and concurrent runs stop here, before any hp write. The second
        // filter re-asserts delinquency, so a completion committed after the
        // candidate fetch turns this into a no-op.
        let stamped: Vec<HabitRow> = self
            .patch_rows(
                "habits",
                &[
                    ("id", format!("eq.{}", habit.id)),
                    (
                        "or",
                        format!("(last_penalized_date.is.null,last_penalized_date.neq.{cutoff})"),
                    ),
                    (
                        "or",
                        format!("(last_completed_date.is.null,last_completed_date.lt.{cutoff})"),
                    ),
                ],
                &json!({
                    "streak": 0,
                    "last_penalized_date": cutoff,
                }),
            )
            .await
            .map_err(as_row_update)?;
        if stamped.is_empty() {
            return Ok(PenaltyOutcome::AlreadyApplied);
        }

        self.update_character_cas(habit.user_id, |c| c.apply_hp_penalty(HABIT_PENALTY_HP))
            .await?;

        self.insert_row(
            "event_log",
            &json!({
                "user_id": habit.user_id,
                "event_type": EventType::PenaltyHabit.as_str(),
                "details": event::habit_penalty_details(habit.id, HABIT_PENALTY_HP),
                "created_at": Utc::now(),
            }),
        )
        .await
        .map_err(as_row_update)?;

        Ok(PenaltyOutcome::Applied)
    }

    async fn fail_overdue_task(&self, task: &Task) -> Result<PenaltyOutcome> {
        let swapped: Vec<TaskRow> = self
            .patch_rows(
                "tasks",
                &[
                    ("id", format!("eq.{}", task.id)),
                    ("status", "eq.ACTIVE".to_string()),
                ],
                &json!({ "status": TaskStatus::Failed }),
            )
            .await
            .map_err(as_row_update)?;
        if swapped.is_empty() {
            return Ok(PenaltyOutcome::AlreadyApplied);
        }

        self.update_character_cas(task.user_id, |c| c.apply_hp_penalty(TASK_PENALTY_HP))
            .await?;

        self.insert_row(
            "event_log",
            &json!({
                "user_id": task.user_id,
                "event_type": EventType::PenaltyTask.as_str(),
                "details": event::task_penalty_details(task.id, TASK_PENALTY_HP),
                "created_at": Utc::now(),
            }),
        )
        .await
        .map_err(as_row_update)?;

        Ok(PenaltyOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let store = RestStore::new("https://db.example.com/rest/v1/", "key").unwrap();
        assert_eq!(store.url("habits"), "https://db.example.com/rest/v1/habits");
    }

    #[test]
    fn habit_row_deserializes_postgrest_shape() {
        let json = r#"{
            "id": 3,
            "user_id": 1,
            "title": "stretch",
            "difficulty": "EASY",
            "is_active": true,
            "streak": 4,
            "last_completed_date": "2024-01-04",
            "last_penalized_date": null,
            "created_at": "2024-01-01T08:30:00+00:00"
        }"#;
        let row: HabitRow = serde_json::from_str(json).unwrap();
        let habit: Habit = row.into();
        assert_eq!(habit.streak, 4);
        assert_eq!(habit.difficulty, Difficulty::Easy);
        assert!(habit.is_delinquent(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()));
    }
}
