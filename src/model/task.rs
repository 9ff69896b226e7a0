//! Task row: one-off mission with optional deadline and forward-only status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::GrindstoneError;

/// Task/habit difficulty tier, stored as its SCREAMING_SNAKE name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Difficulty {
    VeryEasy,
    Easy,
    Medium,
    Hard,
    VeryHard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::VeryEasy => "VERY_EASY",
            Difficulty::Easy => "EASY",
            Difficulty::Medium => "MEDIUM",
            Difficulty::Hard => "HARD",
            Difficulty::VeryHard => "VERY_HARD",
        }
    }

    /// Rewards granted when a task of this difficulty is completed
    pub fn rewards(&self) -> Rewards {
        match self {
            Difficulty::VeryEasy => Rewards { xp: 5, coins: 2 },
            Difficulty::Easy => Rewards { xp: 10, coins: 5 },
            Difficulty::Medium => Rewards { xp: 20, coins: 10 },
            Difficulty::Hard => Rewards { xp: 35, coins: 20 },
            Difficulty::VeryHard => Rewards { xp: 50, coins: 30 },
        }
    }

    /// Penalty recorded on the task row at creation time. The daily reset
    /// applies its own fixed hp penalty; this field feeds future per-task
    /// penalty tuning and the client display.
    pub fn default_penalty(&self) -> Penalty {
        Penalty { hp: 5, coins: 0 }
    }
}

impl std::str::FromStr for Difficulty {
    type Err = GrindstoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VERY_EASY" => Ok(Difficulty::VeryEasy),
            "EASY" => Ok(Difficulty::Easy),
            "MEDIUM" => Ok(Difficulty::Medium),
            "HARD" => Ok(Difficulty::Hard),
            "VERY_HARD" => Ok(Difficulty::VeryHard),
            other => Err(GrindstoneError::Database(format!(
                "unknown difficulty '{other}'"
            ))),
        }
    }
}

/// Task status. Transitions are forward-only: Active -> Completed or
/// Active -> Failed, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Active,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "ACTIVE",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = GrindstoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(TaskStatus::Active),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(GrindstoneError::Database(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rewards {
    pub xp: i64,
    pub coins: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Penalty {
    pub hp: i64,
    pub coins: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub difficulty: Difficulty,
    pub status: TaskStatus,
    pub rewards: Rewards,
    pub penalty: Penalty,
    /// Life aspects this task contributes to (balance wheel categories)
    #[serde(default)]
    pub aspects: Vec<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Overdue rule: still active and the deadline has passed as of the
    /// given instant. Tasks are judged against the invocation instant, not
    /// the habit cutoff date.
    pub fn is_overdue(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Active
            && self.deadline.map(|d| d < cutoff).unwrap_or(false)
    }
}

/// Fields accepted when creating a task
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDraft {
    pub title: String,
    pub difficulty: Difficulty,
    #[serde(default)]
    pub aspects: Vec<String>,
    pub deadline: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn task(status: TaskStatus, deadline: Option<DateTime<Utc>>) -> Task {
        Task {
            id: 1,
            user_id: 1,
            title: "slay the inbox".into(),
            difficulty: Difficulty::Medium,
            status,
            rewards: Difficulty::Medium.rewards(),
            penalty: Difficulty::Medium.default_penalty(),
            aspects: vec![],
            deadline,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn overdue_requires_active_status_and_past_deadline() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 0, 5, 0).unwrap();
        let past = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let future = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();

        assert!(task(TaskStatus::Active, Some(past)).is_overdue(now));
        assert!(!task(TaskStatus::Active, Some(future)).is_overdue(now));
        assert!(!task(TaskStatus::Active, None).is_overdue(now));
        assert!(!task(TaskStatus::Completed, Some(past)).is_overdue(now));
        assert!(!task(TaskStatus::Failed, Some(past)).is_overdue(now));
    }

    #[test]
    fn difficulty_round_trips_through_str() {
        for d in [
            Difficulty::VeryEasy,
            Difficulty::Easy,
            Difficulty::Medium,
            Difficulty::Hard,
            Difficulty::VeryHard,
        ] {
            assert_eq!(d.as_str().parse::<Difficulty>().unwrap(), d);
        }
    }

    #[test]
    fn harder_tasks_reward_more() {
        assert!(Difficulty::VeryHard.rewards().xp > Difficulty::VeryEasy.rewards().xp);
        assert!(Difficulty::Hard.rewards().coins > Difficulty::Easy.rewards().coins);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Active).unwrap(),
            "\"ACTIVE\""
        );
        assert_eq!(
            serde_json::to_string(&Difficulty::VeryHard).unwrap(),
            "\"VERY_HARD\""
        );
    }
}
