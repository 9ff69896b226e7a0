//! In-memory store
//!
//! Backs dev mode and the test suites. One mutex guards the whole world, so
//! every operation is trivially atomic; the point of this adapter is to make
//! the engine and service logic testable without a database.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::model::{
    event, hp_after_penalty, Character, EventLogEntry, EventType, GameState, Habit, HabitDraft,
    Penalty, Rewards, Task, TaskDraft, TaskStatus, User, HABIT_PENALTY_HP, HABIT_REWARD,
    TASK_PENALTY_HP,
};
use crate::store::{GameStore, PenaltyOutcome};
use crate::types::{GrindstoneError, Result};

#[derive(Debug)]
struct ActivityRow {
    user_id: i64,
    activity_type: String,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct World {
    next_id: i64,
    users: HashMap<i64, User>,
    /// Keyed by user_id (one character per user)
    characters: HashMap<i64, Character>,
    tasks: HashMap<i64, Task>,
    habits: HashMap<i64, Habit>,
    events: Vec<EventLogEntry>,
    activity: Vec<ActivityRow>,
}

impl World {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn append_event(&mut self, user_id: i64, event_type: EventType, details: serde_json::Value) {
        let id = self.next_id();
        self.events.push(EventLogEntry {
            id,
            user_id,
            event_type,
            details,
            created_at: Utc::now(),
        });
    }

    fn character_mut(&mut self, user_id: i64) -> Result<&mut Character> {
        self.characters
            .get_mut(&user_id)
            .ok_or_else(|| GrindstoneError::NotFound("character".into()))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    world: Mutex<World>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, World>> {
        self.world
            .lock()
            .map_err(|_| GrindstoneError::Database("store mutex poisoned".into()))
    }

    /// Number of activity-ledger rows of the given type for a user. The
    /// ledger feeds the future inactivity check; for now this is a probe
    /// for dev tooling and tests.
    pub fn activity_count(&self, user_id: i64, activity_type: &str) -> usize {
        self.world
            .lock()
            .map(|w| {
                w.activity
                    .iter()
                    .filter(|a| a.user_id == user_id && a.activity_type == activity_type)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Insert a fully-specified habit row, assigning it an id. Seeding hook
    /// for dev mode and fixtures; the service path goes through
    /// [`GameStore::create_habit`].
    pub fn seed_habit(&self, mut habit: Habit) -> Result<Habit> {
        let mut world = self.lock()?;
        habit.id = world.next_id();
        world.habits.insert(habit.id, habit.clone());
        Ok(habit)
    }

    /// Insert a fully-specified task row, assigning it an id
    pub fn seed_task(&self, mut task: Task) -> Result<Task> {
        let mut world = self.lock()?;
        task.id = world.next_id();
        world.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    /// Overwrite a character's hp; seeding hook for fixtures
    pub fn set_character_hp(&self, user_id: i64, hp: i64) -> Result<()> {
        let mut world = self.lock()?;
        world.character_mut(user_id)?.hp = hp;
        Ok(())
    }

    /// Timestamp of the most recent activity-ledger row for a user
    pub fn last_activity(&self, user_id: i64) -> Option<DateTime<Utc>> {
        self.world
            .lock()
            .ok()
            .and_then(|w| {
                w.activity
                    .iter()
                    .filter(|a| a.user_id == user_id)
                    .map(|a| a.created_at)
                    .max()
            })
    }
}

#[async_trait]
impl GameStore for MemoryStore {
    async fn register_user(
        &self,
        email: &str,
        password_hash: &str,
        character_name: &str,
    ) -> Result<User> {
        let mut world = self.lock()?;

        if world.users.values().any(|u| u.email == email) {
            return Err(GrindstoneError::EmailTaken);
        }

        let user_id = world.next_id();
        let user = User {
            id: user_id,
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            timezone: "UTC".to_string(),
            created_at: Utc::now(),
        };
        world.users.insert(user_id, user.clone());

        let character_id = world.next_id();
        let mut character = Character::starting(user_id, character_name);
        character.id = character_id;
        world.characters.insert(user_id, character);

        world.append_event(
            user_id,
            EventType::AccountCreated,
            event::account_created_details(email),
        );

        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let world = self.lock()?;
        Ok(world.users.values().find(|u| u.email == email).cloned())
    }

    async fn record_login(&self, user_id: i64) -> Result<()> {
        let mut world = self.lock()?;
        world.activity.push(ActivityRow {
            user_id,
            activity_type: "LOGIN".to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn fetch_state(&self, user_id: i64) -> Result<GameState> {
        let world = self.lock()?;
        let character = world
            .characters
            .get(&user_id)
            .cloned()
            .ok_or_else(|| GrindstoneError::NotFound("character".into()))?;

        let mut tasks: Vec<Task> = world
            .tasks
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);

        let mut habits: Vec<Habit> = world
            .habits
            .values()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect();
        habits.sort_by_key(|h| h.id);

        Ok(GameState {
            character,
            tasks,
            habits,
        })
    }

    async fn touch_last_active(&self, user_id: i64) -> Result<()> {
        let mut world = self.lock()?;
        world.character_mut(user_id)?.last_active_date = Some(Utc::now());
        Ok(())
    }

    async fn events_for_user(&self, user_id: i64) -> Result<Vec<EventLogEntry>> {
        let world = self.lock()?;
        Ok(world
            .events
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn create_task(
        &self,
        user_id: i64,
        draft: &TaskDraft,
        rewards: Rewards,
        penalty: Penalty,
    ) -> Result<Task> {
        let mut world = self.lock()?;
        let id = world.next_id();
        let task = Task {
            id,
            user_id,
            title: draft.title.clone(),
            difficulty: draft.difficulty,
            status: TaskStatus::Active,
            rewards,
            penalty,
            aspects: draft.aspects.clone(),
            deadline: draft.deadline,
            created_at: Utc::now(),
        };
        world.tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn complete_task(&self, user_id: i64, task_id: i64) -> Result<Rewards> {
        let mut world = self.lock()?;

        let task = world
            .tasks
            .get(&task_id)
            .filter(|t| t.user_id == user_id)
            .ok_or_else(|| GrindstoneError::NotFound("task".into()))?;

        match task.status {
            TaskStatus::Completed => return Err(GrindstoneError::AlreadyCompleted),
            TaskStatus::Failed => return Err(GrindstoneError::TaskNotActive),
            TaskStatus::Active => {}
        }
        let rewards = task.rewards;

        if let Some(t) = world.tasks.get_mut(&task_id) {
            t.status = TaskStatus::Completed;
        }
        {
            let character = world.character_mut(user_id)?;
            character.award(rewards.xp, rewards.coins);
            character.version += 1;
        }
        world.append_event(
            user_id,
            EventType::TaskComplete,
            event::task_complete_details(task_id, rewards),
        );

        Ok(rewards)
    }

    async fn create_habit(&self, user_id: i64, draft: &HabitDraft) -> Result<Habit> {
        let mut world = self.lock()?;
        let id = world.next_id();
        let habit = Habit {
            id,
            user_id,
            title: draft.title.clone(),
            difficulty: draft.difficulty,
            is_active: true,
            streak: 0,
            last_completed_date: None,
            last_penalized_date: None,
            created_at: Utc::now(),
        };
        world.habits.insert(id, habit.clone());
        Ok(habit)
    }

    async fn complete_habit(&self, user_id: i64, habit_id: i64, today: NaiveDate) -> Result<u32> {
        let mut world = self.lock()?;

        let habit = world
            .habits
            .get(&habit_id)
            .filter(|h| h.user_id == user_id)
            .ok_or_else(|| GrindstoneError::NotFound("habit".into()))?;

        if habit.last_completed_date == Some(today) {
            return Err(GrindstoneError::AlreadyCompletedToday);
        }

        let new_streak = {
            let h = world
                .habits
                .get_mut(&habit_id)
                .ok_or_else(|| GrindstoneError::NotFound("habit".into()))?;
            h.streak += 1;
            h.last_completed_date = Some(today);
            h.streak
        };
        {
            let character = world.character_mut(user_id)?;
            character.award(HABIT_REWARD.xp, HABIT_REWARD.coins);
            character.version += 1;
        }

        Ok(new_streak)
    }

    async fn delinquent_habits(&self, cutoff: NaiveDate) -> Result<Vec<Habit>> {
        let world = self.lock()?;
        let mut habits: Vec<Habit> = world
            .habits
            .values()
            .filter(|h| h.is_delinquent(cutoff) && !h.penalized_for(cutoff))
            .cloned()
            .collect();
        habits.sort_by_key(|h| h.id);
        Ok(habits)
    }

    async fn overdue_tasks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        let world = self.lock()?;
        let mut tasks: Vec<Task> = world
            .tasks
            .values()
            .filter(|t| t.is_overdue(cutoff))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn apply_habit_penalty(&self, habit: &Habit, cutoff: NaiveDate) -> Result<PenaltyOutcome> {
        let mut world = self.lock()?;

        let current = world
            .habits
            .get(&habit.id)
            .ok_or_else(|| GrindstoneError::NotFound("habit".into()))?;
        // Revalidate against the live row, not the caller's snapshot: a
        // completion landing after the candidate fetch clears delinquency
        if current.penalized_for(cutoff) || !current.is_delinquent(cutoff) {
            return Ok(PenaltyOutcome::AlreadyApplied);
        }
        let user_id = current.user_id;

        if let Some(h) = world.habits.get_mut(&habit.id) {
            h.streak = 0;
            h.last_penalized_date = Some(cutoff);
        }
        {
            let character = world.character_mut(user_id)?;
            character.hp = hp_after_penalty(character.hp, HABIT_PENALTY_HP);
            character.version += 1;
        }
        world.append_event(
            user_id,
            EventType::PenaltyHabit,
            event::habit_penalty_details(habit.id, HABIT_PENALTY_HP),
        );

        Ok(PenaltyOutcome::Applied)
    }

    async fn fail_overdue_task(&self, task: &Task) -> Result<PenaltyOutcome> {
        let mut world = self.lock()?;

        let current = world
            .tasks
            .get(&task.id)
            .ok_or_else(|| GrindstoneError::NotFound("task".into()))?;
        // Same revalidation as habits: a completion that beat us to the row
        // has left ACTIVE, so the stale candidate is a no-op
        if current.status != TaskStatus::Active {
            return Ok(PenaltyOutcome::AlreadyApplied);
        }
        let user_id = current.user_id;

        if let Some(t) = world.tasks.get_mut(&task.id) {
            t.status = TaskStatus::Failed;
        }
        {
            let character = world.character_mut(user_id)?;
            character.hp = hp_after_penalty(character.hp, TASK_PENALTY_HP);
            character.version += 1;
        }
        world.append_event(
            user_id,
            EventType::PenaltyTask,
            event::task_penalty_details(task.id, TASK_PENALTY_HP),
        );

        Ok(PenaltyOutcome::Applied)
    }
}
