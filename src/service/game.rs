//! Game actions: state reads, task/habit creation and completion

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::model::{EventLogEntry, GameState, Habit, HabitDraft, Rewards, Task, TaskDraft};
use crate::store::GameStore;
use crate::types::{GrindstoneError, Result};

pub struct GameService {
    store: Arc<dyn GameStore>,
}

impl GameService {
    pub fn new(store: Arc<dyn GameStore>) -> Self {
        Self { store }
    }

    /// Character plus tasks and habits for the user
    pub async fn state(&self, user_id: i64) -> Result<GameState> {
        self.store.fetch_state(user_id).await
    }

    /// Audit trail for the user, oldest first
    pub async fn events(&self, user_id: i64) -> Result<Vec<EventLogEntry>> {
        self.store.events_for_user(user_id).await
    }

    /// Activity ping from the client; refreshes last_active_date
    pub async fn heartbeat(&self, user_id: i64) -> Result<()> {
        self.store.touch_last_active(user_id).await
    }

    /// Create a task; rewards and penalty derive from the difficulty
    pub async fn create_task(&self, user_id: i64, draft: TaskDraft) -> Result<Task> {
        let title = draft.title.trim();
        if title.is_empty() {
            return Err(GrindstoneError::Validation("task title is empty".into()));
        }
        let draft = TaskDraft {
            title: title.to_string(),
            ..draft
        };

        let rewards = draft.difficulty.rewards();
        let penalty = draft.difficulty.default_penalty();
        let task = self
            .store
            .create_task(user_id, &draft, rewards, penalty)
            .await?;
        info!(user_id, task_id = task.id, "task created");
        Ok(task)
    }

    /// Complete a task and collect its rewards. Only ACTIVE tasks qualify;
    /// a FAILED task stays failed.
    pub async fn complete_task(&self, user_id: i64, task_id: i64) -> Result<Rewards> {
        let rewards = self.store.complete_task(user_id, task_id).await?;
        info!(
            user_id,
            task_id,
            xp = rewards.xp,
            coins = rewards.coins,
            "task completed"
        );
        Ok(rewards)
    }

    pub async fn create_habit(&self, user_id: i64, draft: HabitDraft) -> Result<Habit> {
        let title = draft.title.trim();
        if title.is_empty() {
            return Err(GrindstoneError::Validation("habit title is empty".into()));
        }
        let draft = HabitDraft {
            title: title.to_string(),
            ..draft
        };

        let habit = self.store.create_habit(user_id, &draft).await?;
        info!(user_id, habit_id = habit.id, "habit created");
        Ok(habit)
    }

    /// Check in a habit for today; returns the new streak. At most one
    /// completion per calendar day.
    pub async fn complete_habit(&self, user_id: i64, habit_id: i64) -> Result<u32> {
        let today = Utc::now().date_naive();
        let streak = self.store.complete_habit(user_id, habit_id, today).await?;
        info!(user_id, habit_id, streak, "habit completed");
        Ok(streak)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Difficulty, TaskStatus, HABIT_REWARD};
    use crate::store::MemoryStore;

    async fn service_with_user() -> (GameService, i64) {
        let store = Arc::new(MemoryStore::new());
        let user = store
            .register_user("kira@example.com", "hash", "kira")
            .await
            .unwrap();
        (GameService::new(store), user.id)
    }

    fn draft(title: &str, difficulty: Difficulty) -> TaskDraft {
        TaskDraft {
            title: title.to_string(),
            difficulty,
            aspects: vec![],
            deadline: None,
        }
    }

    #[tokio::test]
    async fn task_rewards_follow_difficulty() {
        let (svc, user_id) = service_with_user().await;
        let task = svc
            .create_task(user_id, draft("write report", Difficulty::Hard))
            .await
            .unwrap();
        assert_eq!(task.rewards, Difficulty::Hard.rewards());
        assert_eq!(task.status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn blank_titles_are_rejected() {
        let (svc, user_id) = service_with_user().await;
        let task = svc.create_task(user_id, draft("   ", Difficulty::Easy)).await;
        assert!(matches!(task, Err(GrindstoneError::Validation(_))));

        let habit = svc
            .create_habit(
                user_id,
                HabitDraft {
                    title: "".to_string(),
                    difficulty: Difficulty::Easy,
                },
            )
            .await;
        assert!(matches!(habit, Err(GrindstoneError::Validation(_))));
    }

    #[tokio::test]
    async fn completing_a_task_awards_and_locks_it() {
        let (svc, user_id) = service_with_user().await;
        let task = svc
            .create_task(user_id, draft("write report", Difficulty::Medium))
            .await
            .unwrap();

        let rewards = svc.complete_task(user_id, task.id).await.unwrap();
        assert_eq!(rewards, Difficulty::Medium.rewards());

        let state = svc.state(user_id).await.unwrap();
        assert_eq!(state.character.xp, rewards.xp);
        assert_eq!(state.character.coins, rewards.coins);
        assert_eq!(state.tasks[0].status, TaskStatus::Completed);

        let again = svc.complete_task(user_id, task.id).await;
        assert!(matches!(again, Err(GrindstoneError::AlreadyCompleted)));
    }

    #[tokio::test]
    async fn habit_completion_is_once_per_day() {
        let (svc, user_id) = service_with_user().await;
        let habit = svc
            .create_habit(
                user_id,
                HabitDraft {
                    title: "stretch".to_string(),
                    difficulty: Difficulty::Easy,
                },
            )
            .await
            .unwrap();

        let streak = svc.complete_habit(user_id, habit.id).await.unwrap();
        assert_eq!(streak, 1);

        let again = svc.complete_habit(user_id, habit.id).await;
        assert!(matches!(again, Err(GrindstoneError::AlreadyCompletedToday)));

        let state = svc.state(user_id).await.unwrap();
        assert_eq!(state.character.xp, HABIT_REWARD.xp);
        assert_eq!(state.character.coins, HABIT_REWARD.coins);
    }
}
