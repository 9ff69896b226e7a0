//! Domain model for the tracker
//!
//! Entities mirror the store schema: a `User` owns one `Character` plus any
//! number of `Task` and `Habit` rows, and every game-state-affecting action
//! appends an `EventLogEntry`. The delinquency/overdue predicates and the hp
//! floor live here so every store adapter and the reconciliation engine
//! share one definition of the rules.

pub mod character;
pub mod event;
pub mod habit;
pub mod task;
pub mod user;

pub use character::{hp_after_penalty, Character, MIN_HP};
pub use event::{EventLogEntry, EventType};
pub use habit::{Habit, HabitDraft};
pub use task::{Difficulty, Penalty, Rewards, Task, TaskDraft, TaskStatus};
pub use user::User;

use serde::{Deserialize, Serialize};

/// Hit points removed from a character per delinquent habit
pub const HABIT_PENALTY_HP: i64 = 5;

/// Hit points removed from a character per overdue task
pub const TASK_PENALTY_HP: i64 = 10;

/// Fixed reward for completing a habit on a given day
pub const HABIT_REWARD: Rewards = Rewards { xp: 10, coins: 5 };

/// Full game state for one user, as served to the embedding layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameState {
    pub character: Character,
    pub tasks: Vec<Task>,
    pub habits: Vec<Habit>,
}
