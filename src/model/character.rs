//! Character row: the per-user resource pool mutated by completions and
//! penalties

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hit points never drop below this; there is no "death" state
pub const MIN_HP: i64 = 1;

/// Apply a penalty to a hit-point total, respecting the floor
pub fn hp_after_penalty(hp: i64, penalty: i64) -> i64 {
    (hp - penalty).max(MIN_HP)
}

/// One-to-one with a user. The most contended row in the system: every
/// completion and every reconciliation penalty writes it, so all adapters
/// must update it inside their atomic unit (transaction or version CAS).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub level: i64,
    pub xp: i64,
    pub coins: i64,
    pub hp: i64,
    pub max_hp: i64,
    /// Aspect scores backing the balance wheel (e.g. "mind", "body")
    #[serde(default)]
    pub stats: BTreeMap<String, i64>,
    pub last_active_date: Option<DateTime<Utc>>,
    /// Monotonic row version for optimistic concurrency control
    #[serde(default)]
    pub version: i64,
}

impl Character {
    /// Default character created at registration
    pub fn starting(user_id: i64, name: &str) -> Self {
        Self {
            id: 0,
            user_id,
            name: name.to_string(),
            level: 1,
            xp: 0,
            coins: 0,
            hp: 100,
            max_hp: 100,
            stats: BTreeMap::new(),
            last_active_date: None,
            version: 1,
        }
    }

    pub fn award(&mut self, xp: i64, coins: i64) {
        self.xp += xp;
        self.coins += coins;
    }

    pub fn apply_hp_penalty(&mut self, penalty: i64) {
        self.hp = hp_after_penalty(self.hp, penalty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn penalty_respects_floor() {
        assert_eq!(hp_after_penalty(100, 5), 95);
        assert_eq!(hp_after_penalty(6, 5), 1);
        assert_eq!(hp_after_penalty(3, 5), 1);
        assert_eq!(hp_after_penalty(1, 10), 1);
    }

    #[test]
    fn repeated_penalties_never_go_below_floor() {
        let mut hp = 12;
        for _ in 0..10 {
            hp = hp_after_penalty(hp, 5);
            assert!(hp >= MIN_HP);
        }
        assert_eq!(hp, 1);
    }

    #[test]
    fn starting_character_defaults() {
        let c = Character::starting(7, "hunter");
        assert_eq!(c.level, 1);
        assert_eq!(c.hp, 100);
        assert_eq!(c.max_hp, 100);
        assert_eq!(c.xp, 0);
        assert_eq!(c.version, 1);
    }
}
