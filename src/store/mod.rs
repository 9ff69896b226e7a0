//! Store abstraction over the persistence backends
//!
//! The reconciliation engine and the services are written once against
//! [`GameStore`]; each adapter supplies the same atomic units in its own
//! consistency idiom:
//!
//! - [`sqlite::SqliteStore`]: embedded store, every multi-row unit inside a
//!   real transaction
//! - [`rest::RestStore`]: PostgREST-style network store, conditional updates
//!   plus a version compare-and-swap on the character row
//! - [`memory::MemoryStore`]: in-process store for dev mode and tests
//!
//! The contract for every penalty/completion operation is that the triple
//! {primary-entity update, character update, event-log insert} is atomic
//! relative to concurrent writers of the same character, or at minimum
//! guarded so that replays and races cannot double-apply.

pub mod memory;
pub mod rest;
pub mod sqlite;

pub use memory::MemoryStore;
pub use rest::RestStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::model::{
    EventLogEntry, GameState, Habit, HabitDraft, Penalty, Rewards, Task, TaskDraft, User,
};
use crate::types::Result;

/// Result of an idempotency-guarded penalty write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyOutcome {
    /// The penalty was applied by this call
    Applied,
    /// A previous run (or a concurrent one) already applied it; no-op
    AlreadyApplied,
}

/// Persistence operations shared by the services and the reconciliation
/// engine. Constructed once at process start and passed around as
/// `Arc<dyn GameStore>`; there is no global store handle.
#[async_trait]
pub trait GameStore: Send + Sync {
    // --- accounts ---

    /// Insert a user, their starting character, and an ACCOUNT_CREATED
    /// event as one unit. Fails with `EmailTaken` on a duplicate email.
    async fn register_user(
        &self,
        email: &str,
        password_hash: &str,
        character_name: &str,
    ) -> Result<User>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Append a LOGIN row to the per-user activity ledger
    async fn record_login(&self, user_id: i64) -> Result<()>;

    // --- game state ---

    /// Character plus all tasks and habits for a user, with structured
    /// sub-fields materialized
    async fn fetch_state(&self, user_id: i64) -> Result<GameState>;

    /// Bump the character's last_active_date to now
    async fn touch_last_active(&self, user_id: i64) -> Result<()>;

    /// Audit trail for a user, oldest first
    async fn events_for_user(&self, user_id: i64) -> Result<Vec<EventLogEntry>>;

    // --- tasks ---

    async fn create_task(
        &self,
        user_id: i64,
        draft: &TaskDraft,
        rewards: Rewards,
        penalty: Penalty,
    ) -> Result<Task>;

    /// Transition ACTIVE -> COMPLETED, award the task's rewards to the
    /// character, and log TASK_COMPLETE, atomically. Rejects
    /// `AlreadyCompleted` / `TaskNotActive` on non-ACTIVE tasks.
    async fn complete_task(&self, user_id: i64, task_id: i64) -> Result<Rewards>;

    // --- habits ---

    async fn create_habit(&self, user_id: i64, draft: &HabitDraft) -> Result<Habit>;

    /// Increment the streak, stamp last_completed_date, and award the fixed
    /// habit reward, atomically. Rejects `AlreadyCompletedToday` when the
    /// habit was already completed on `today`.
    async fn complete_habit(&self, user_id: i64, habit_id: i64, today: NaiveDate) -> Result<u32>;

    // --- reconciliation ---

    /// Habits delinquent as of the cutoff date, excluding rows already
    /// penalized for that date
    async fn delinquent_habits(&self, cutoff: NaiveDate) -> Result<Vec<Habit>>;

    /// ACTIVE tasks whose deadline has passed as of the cutoff instant
    async fn overdue_tasks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Reset the streak, stamp last_penalized_date with the cutoff, floor-
    /// decrement the owner's hp, and log PENALTY_HABIT, atomically. The
    /// stamp doubles as the idempotency guard, and delinquency is
    /// revalidated against the live row inside the atomic unit, so a
    /// completion committed after the candidate fetch makes this a no-op.
    async fn apply_habit_penalty(&self, habit: &Habit, cutoff: NaiveDate) -> Result<PenaltyOutcome>;

    /// Transition ACTIVE -> FAILED, floor-decrement the owner's hp, and log
    /// PENALTY_TASK, atomically. The status transition is the guard.
    async fn fail_overdue_task(&self, task: &Task) -> Result<PenaltyOutcome>;
}
