//! End-to-end reconciliation flows against the in-process store

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use grindstone::auth::TokenIssuer;
use grindstone::model::{
    Difficulty, EventType, Habit, TaskDraft, TaskStatus, HABIT_PENALTY_HP, TASK_PENALTY_HP,
};
use grindstone::reset::ReconciliationEngine;
use grindstone::service::{AccountService, GameService};
use grindstone::store::MemoryStore;

fn services(store: Arc<MemoryStore>) -> (AccountService, GameService) {
    (
        AccountService::new(store.clone(), TokenIssuer::new("test-secret")),
        GameService::new(store),
    )
}

fn overdue_draft(title: &str) -> TaskDraft {
    TaskDraft {
        title: title.to_string(),
        difficulty: Difficulty::Medium,
        aspects: vec![],
        deadline: Some(Utc::now() - Duration::hours(2)),
    }
}

fn stale_habit(user_id: i64) -> Habit {
    Habit {
        id: 0,
        user_id,
        title: "meditate".to_string(),
        difficulty: Difficulty::Easy,
        is_active: true,
        streak: 9,
        last_completed_date: None,
        last_penalized_date: None,
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
    }
}

#[tokio::test]
async fn missed_deadline_fails_the_task_but_spares_fresh_habits() {
    let store = Arc::new(MemoryStore::new());
    let (accounts, game) = services(store.clone());

    let session = accounts
        .register("mira@example.com", "hunter22hunter")
        .await
        .unwrap();
    let user_id = session.user.id;

    game.create_task(user_id, overdue_draft("submit thesis"))
        .await
        .unwrap();
    // Created today, so the creation-day grace window applies
    game.create_habit(
        user_id,
        grindstone::model::HabitDraft {
            title: "stretch".to_string(),
            difficulty: Difficulty::Easy,
        },
    )
    .await
    .unwrap();

    let engine = ReconciliationEngine::new(store.clone());
    let summary = engine.run_daily_reset(Utc::now()).await;
    assert_eq!(summary.tasks_failed, 1);
    assert_eq!(summary.habits_penalized, 0);
    assert_eq!(summary.errors, 0);

    let state = game.state(user_id).await.unwrap();
    assert_eq!(state.tasks[0].status, TaskStatus::Failed);
    assert_eq!(state.character.hp, 100 - TASK_PENALTY_HP);
    assert_eq!(state.habits[0].streak, 0);
    assert!(state.habits[0].last_penalized_date.is_none());

    let events = game.events(user_id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::PenaltyTask));
    assert!(!events
        .iter()
        .any(|e| e.event_type == EventType::PenaltyHabit));
}

#[tokio::test]
async fn completing_before_the_sweep_beats_the_deadline_penalty() {
    let store = Arc::new(MemoryStore::new());
    let (accounts, game) = services(store.clone());

    let user_id = accounts
        .register("mira@example.com", "hunter22hunter")
        .await
        .unwrap()
        .user
        .id;
    let task = game
        .create_task(user_id, overdue_draft("submit thesis"))
        .await
        .unwrap();

    // Player finishes late but before the reconciliation runs
    game.complete_task(user_id, task.id).await.unwrap();

    let engine = ReconciliationEngine::new(store.clone());
    let summary = engine.run_daily_reset(Utc::now()).await;
    assert_eq!(summary.tasks_failed, 0);

    let state = game.state(user_id).await.unwrap();
    assert_eq!(state.tasks[0].status, TaskStatus::Completed);
    assert_eq!(state.character.hp, 100);
    assert_eq!(state.character.xp, Difficulty::Medium.rewards().xp);
}

#[tokio::test]
async fn stale_habit_is_penalized_and_locked_out_of_completion_for_failed_tasks() {
    let store = Arc::new(MemoryStore::new());
    let (accounts, game) = services(store.clone());

    let user_id = accounts
        .register("mira@example.com", "hunter22hunter")
        .await
        .unwrap()
        .user
        .id;
    let habit = store.seed_habit(stale_habit(user_id)).unwrap();
    let task = game
        .create_task(user_id, overdue_draft("submit thesis"))
        .await
        .unwrap();

    let engine = ReconciliationEngine::new(store.clone());
    let summary = engine.run_daily_reset(Utc::now()).await;
    assert_eq!(summary.habits_penalized, 1);
    assert_eq!(summary.tasks_failed, 1);

    let state = game.state(user_id).await.unwrap();
    assert_eq!(state.character.hp, 100 - HABIT_PENALTY_HP - TASK_PENALTY_HP);
    assert_eq!(state.habits[0].streak, 0);

    // Task status only moves forward; a failed task stays failed
    let err = game.complete_task(user_id, task.id).await.unwrap_err();
    assert!(matches!(err, grindstone::GrindstoneError::TaskNotActive));

    // The penalized habit can still be checked in today and restart its streak
    let streak = game.complete_habit(user_id, habit.id).await.unwrap();
    assert_eq!(streak, 1);
}

#[tokio::test]
async fn repeated_sweeps_settle_to_a_fixed_point() {
    let store = Arc::new(MemoryStore::new());
    let (accounts, game) = services(store.clone());

    let user_id = accounts
        .register("mira@example.com", "hunter22hunter")
        .await
        .unwrap()
        .user
        .id;
    store.seed_habit(stale_habit(user_id)).unwrap();
    game.create_task(user_id, overdue_draft("submit thesis"))
        .await
        .unwrap();

    let engine = ReconciliationEngine::new(store.clone());
    let now = Utc::now();
    engine.run_daily_reset(now).await;
    let second = engine.run_daily_reset(now).await;
    let third = engine.run_daily_reset(now + Duration::minutes(10)).await;

    assert_eq!(second.habits_penalized + third.habits_penalized, 0);
    assert_eq!(second.tasks_failed + third.tasks_failed, 0);

    let state = game.state(user_id).await.unwrap();
    assert_eq!(state.character.hp, 100 - HABIT_PENALTY_HP - TASK_PENALTY_HP);

    let penalties = game
        .events(user_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| {
            e.event_type == EventType::PenaltyHabit || e.event_type == EventType::PenaltyTask
        })
        .count();
    assert_eq!(penalties, 2);
}
