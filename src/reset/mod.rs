//! Daily reconciliation
//!
//! Once per day the engine sweeps the whole store for habits that missed
//! yesterday and tasks whose deadline has passed, and applies the penalties
//! the players earned. The sweep is built to be safe to re-run: every
//! penalty write is guarded in the store, so a crash-and-restart or an
//! overlapping run converges on the same outcome.
//!
//! Failure policy: a failed candidate query drops that category for this
//! run (the next run picks the rows up again); a failed row write drops
//! that row only. Neither aborts the sweep.

pub mod scheduler;

pub use scheduler::{spawn_daily_reset_task, ScheduleConfig};

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, error, info, warn};

use crate::store::{GameStore, PenaltyOutcome};

/// The two reference points of one reset run.
///
/// Habits are judged against a calendar date (did you complete it by the end
/// of yesterday), tasks against the run instant (is the deadline behind us
/// right now). The asymmetry is deliberate: habits are daily obligations,
/// task deadlines are exact timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetCutoffs {
    /// Yesterday, in UTC. Habits not completed on or after this date owe a
    /// penalty.
    pub habit_cutoff: NaiveDate,
    /// The run instant. Tasks with a deadline strictly before it have
    /// failed.
    pub task_cutoff: DateTime<Utc>,
}

impl ResetCutoffs {
    pub fn for_run(now: DateTime<Utc>) -> Self {
        Self {
            habit_cutoff: (now - Duration::days(1)).date_naive(),
            task_cutoff: now,
        }
    }
}

/// Tally of one reset run, for the operator log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    pub habits_penalized: u64,
    pub tasks_failed: u64,
    /// Rows or category fetches that errored and were skipped
    pub errors: u64,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn GameStore>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn GameStore>) -> Self {
        Self { store }
    }

    /// One full sweep: habits first, then tasks. Never returns an error;
    /// failures are tallied in the summary and logged.
    pub async fn run_daily_reset(&self, now: DateTime<Utc>) -> ResetSummary {
        let cutoffs = ResetCutoffs::for_run(now);
        let mut summary = ResetSummary::default();

        info!(
            habit_cutoff = %cutoffs.habit_cutoff,
            task_cutoff = %cutoffs.task_cutoff,
            "daily reset starting"
        );

        self.sweep_habits(&cutoffs, &mut summary).await;
        self.sweep_tasks(&cutoffs, &mut summary).await;

        info!(
            habits_penalized = summary.habits_penalized,
            tasks_failed = summary.tasks_failed,
            errors = summary.errors,
            "daily reset complete"
        );
        summary
    }

    async fn sweep_habits(&self, cutoffs: &ResetCutoffs, summary: &mut ResetSummary) {
        let habits = match self.store.delinquent_habits(cutoffs.habit_cutoff).await {
            Ok(habits) => habits,
            Err(e) => {
                error!(error = %e, "delinquent-habit fetch failed, skipping habit sweep");
                summary.errors += 1;
                return;
            }
        };

        for habit in habits {
            // Re-check against the shared predicate; the candidate query may
            // be coarser than the rule (and rows can change under us)
            if !habit.is_delinquent(cutoffs.habit_cutoff) || habit.penalized_for(cutoffs.habit_cutoff)
            {
                continue;
            }

            match self
                .store
                .apply_habit_penalty(&habit, cutoffs.habit_cutoff)
                .await
            {
                Ok(PenaltyOutcome::Applied) => {
                    debug!(habit_id = habit.id, user_id = habit.user_id, "habit penalized");
                    summary.habits_penalized += 1;
                }
                Ok(PenaltyOutcome::AlreadyApplied) => {
                    debug!(habit_id = habit.id, "habit penalty already applied, skipping");
                }
                Err(e) => {
                    warn!(habit_id = habit.id, error = %e, "habit penalty failed, skipping row");
                    summary.errors += 1;
                }
            }
        }
    }

    async fn sweep_tasks(&self, cutoffs: &ResetCutoffs, summary: &mut ResetSummary) {
        let tasks = match self.store.overdue_tasks(cutoffs.task_cutoff).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "overdue-task fetch failed, skipping task sweep");
                summary.errors += 1;
                return;
            }
        };

        for task in tasks {
            if !task.is_overdue(cutoffs.task_cutoff) {
                continue;
            }

            match self.store.fail_overdue_task(&task).await {
                Ok(PenaltyOutcome::Applied) => {
                    debug!(task_id = task.id, user_id = task.user_id, "overdue task failed");
                    summary.tasks_failed += 1;
                }
                Ok(PenaltyOutcome::AlreadyApplied) => {
                    debug!(task_id = task.id, "task already left ACTIVE, skipping");
                }
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "task failure write failed, skipping row");
                    summary.errors += 1;
                }
            }
        }
    }
}
