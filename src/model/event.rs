//! Append-only audit log of game-state-affecting events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::model::task::Rewards;
use crate::types::GrindstoneError;

/// Event tag, stored as its SCREAMING_SNAKE name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    AccountCreated,
    TaskComplete,
    PenaltyHabit,
    PenaltyTask,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AccountCreated => "ACCOUNT_CREATED",
            EventType::TaskComplete => "TASK_COMPLETE",
            EventType::PenaltyHabit => "PENALTY_HABIT",
            EventType::PenaltyTask => "PENALTY_TASK",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = GrindstoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCOUNT_CREATED" => Ok(EventType::AccountCreated),
            "TASK_COMPLETE" => Ok(EventType::TaskComplete),
            "PENALTY_HABIT" => Ok(EventType::PenaltyHabit),
            "PENALTY_TASK" => Ok(EventType::PenaltyTask),
            other => Err(GrindstoneError::Database(format!(
                "unknown event type '{other}'"
            ))),
        }
    }
}

/// One immutable audit record; never updated or deleted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: i64,
    pub user_id: i64,
    pub event_type: EventType,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

/// Payload for `PENALTY_HABIT`
pub fn habit_penalty_details(habit_id: i64, hp: i64) -> Value {
    json!({ "habitId": habit_id, "penalty": { "hp": hp } })
}

/// Payload for `PENALTY_TASK`
pub fn task_penalty_details(task_id: i64, hp: i64) -> Value {
    json!({ "taskId": task_id, "penalty": { "hp": hp } })
}

/// Payload for `TASK_COMPLETE`
pub fn task_complete_details(task_id: i64, rewards: Rewards) -> Value {
    json!({ "taskId": task_id, "rewards": { "xp": rewards.xp, "coins": rewards.coins } })
}

/// Payload for `ACCOUNT_CREATED`
pub fn account_created_details(email: &str) -> Value {
    json!({ "email": email })
}
