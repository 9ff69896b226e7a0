//! Habit row: recurring protocol tracked by a daily completion streak

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::model::task::Difficulty;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Habit {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub difficulty: Difficulty,
    pub is_active: bool,
    /// Consecutive calendar days completed; resets to 0 on a missed day.
    /// A calendar day contributes at most one increment.
    pub streak: u32,
    pub last_completed_date: Option<NaiveDate>,
    /// Idempotency marker: the cutoff date of the last reset run that
    /// penalized this habit. Re-running the reset for the same date skips
    /// rows already carrying that date.
    pub last_penalized_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl Habit {
    /// Delinquency rule as of cutoff date `cutoff`: active, not completed
    /// on or after the cutoff, and created early enough to owe a completion
    /// (habits created after the cutoff date get a grace cycle).
    pub fn is_delinquent(&self, cutoff: NaiveDate) -> bool {
        self.is_active
            && self.last_completed_date.map(|d| d < cutoff).unwrap_or(true)
            && self.created_at.date_naive() <= cutoff
    }

    /// Whether a reset run for `cutoff` already penalized this habit
    pub fn penalized_for(&self, cutoff: NaiveDate) -> bool {
        self.last_penalized_date == Some(cutoff)
    }
}

/// Fields accepted when creating a habit
#[derive(Debug, Clone, Deserialize)]
pub struct HabitDraft {
    pub title: String,
    pub difficulty: Difficulty,
}
