//! Fires the daily reset at a fixed local wall-clock time
//!
//! The loop recomputes the delay before every sleep rather than using a
//! fixed interval, so clock adjustments and long runs cannot drift the fire
//! time.

use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::reset::ReconciliationEngine;

#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfig {
    /// Local hour of day to fire (0-23)
    pub hour: u32,
    /// Local minute to fire (0-59)
    pub minute: u32,
    /// Hard cap on one run; an overrun is logged and the partial progress
    /// stands (every write is idempotent, the next run completes it)
    pub run_timeout: Duration,
}

/// Delay from `now` until the next local `hour:minute`. Fires tomorrow if
/// the time has already passed today.
pub fn duration_until_next_fire(now: DateTime<Local>, hour: u32, minute: u32) -> Duration {
    let now_naive = now.naive_local();
    let mut target = match now_naive.date().and_hms_opt(hour, minute, 0) {
        Some(t) => t,
        // Out-of-range schedule; config validation rejects this before we
        // get here, fall back to a daily cadence
        None => now_naive,
    };
    if target <= now_naive {
        target += chrono::Duration::days(1);
    }
    (target - now_naive).to_std().unwrap_or(Duration::from_secs(60))
}

/// Spawn the scheduler loop. Runs until the handle is aborted or the
/// runtime shuts down.
pub fn spawn_daily_reset_task(engine: ReconciliationEngine, config: ScheduleConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            hour = config.hour,
            minute = config.minute,
            "daily reset scheduler started"
        );
        loop {
            let wait = duration_until_next_fire(Local::now(), config.hour, config.minute);
            info!(seconds_until_fire = wait.as_secs(), "next daily reset scheduled");
            tokio::time::sleep(wait).await;

            match tokio::time::timeout(config.run_timeout, engine.run_daily_reset(Utc::now())).await
            {
                Ok(_summary) => {}
                Err(_) => warn!(
                    timeout_secs = config.run_timeout.as_secs(),
                    "daily reset timed out; partial progress stands, next run completes it"
                ),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn local(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 10, h, m, s).single().unwrap()
    }

    #[test]
    fn fires_later_today_when_time_is_ahead() {
        let wait = duration_until_next_fire(local(22, 0, 0), 23, 30);
        assert_eq!(wait, Duration::from_secs(90 * 60));
    }

    #[test]
    fn fires_tomorrow_when_time_has_passed() {
        let wait = duration_until_next_fire(local(10, 0, 0), 0, 5);
        assert_eq!(wait, Duration::from_secs((14 * 60 + 5) * 60));
    }

    #[test]
    fn exact_fire_time_rolls_to_tomorrow() {
        let wait = duration_until_next_fire(local(0, 5, 0), 0, 5);
        assert_eq!(wait, Duration::from_secs(24 * 60 * 60));
    }
}
