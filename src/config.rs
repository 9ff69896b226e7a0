//! Configuration for Grindstone
//!
//! CLI arguments and environment variable handling using clap.

use clap::{Parser, ValueEnum};
use uuid::Uuid;

/// Which persistence backend to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// Embedded SQLite database file
    Sqlite,
    /// PostgREST-style relational API (Supabase and friends)
    Rest,
    /// In-process store, dev mode only; all data is lost on exit
    Memory,
}

/// Grindstone - daily reconciliation daemon for the habit tracker
#[derive(Parser, Debug, Clone)]
#[command(name = "grindstone")]
#[command(about = "Daily penalty reconciliation for the habit tracker")]
pub struct Args {
    /// Unique node identifier for this instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Persistence backend
    #[arg(long, env = "STORE_BACKEND", value_enum, default_value = "sqlite")]
    pub store_backend: StoreBackend,

    /// Path to the SQLite database file (sqlite backend)
    #[arg(long, env = "SQLITE_PATH", default_value = "grindstone.db")]
    pub sqlite_path: String,

    /// REST root of the relational API, e.g. https://xyz.supabase.co/rest/v1
    /// (rest backend)
    #[arg(long, env = "REST_URL")]
    pub rest_url: Option<String>,

    /// Service key for the relational API (rest backend)
    #[arg(long, env = "REST_SERVICE_KEY")]
    pub rest_service_key: Option<String>,

    /// Local hour of day at which the daily reset fires (0-23)
    #[arg(long, env = "RESET_HOUR", default_value = "0")]
    pub reset_hour: u32,

    /// Local minute at which the daily reset fires (0-59)
    #[arg(long, env = "RESET_MINUTE", default_value = "5")]
    pub reset_minute: u32,

    /// Hard cap on one reset run, in seconds
    #[arg(long, env = "RESET_TIMEOUT_SECS", default_value = "600")]
    pub reset_timeout_secs: u64,

    /// Run one reset immediately and exit instead of scheduling
    #[arg(long, env = "RUN_ONCE", default_value = "false")]
    pub run_once: bool,

    /// Enable development mode (allows the memory backend)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.store_backend == StoreBackend::Rest {
            if self.rest_url.is_none() {
                return Err("REST_URL is required with the rest backend".to_string());
            }
            if self.rest_service_key.is_none() {
                return Err("REST_SERVICE_KEY is required with the rest backend".to_string());
            }
        }

        if self.store_backend == StoreBackend::Memory && !self.dev_mode {
            return Err("the memory backend is only allowed with DEV_MODE".to_string());
        }

        if self.reset_hour > 23 {
            return Err("RESET_HOUR must be 0-23".to_string());
        }
        if self.reset_minute > 59 {
            return Err("RESET_MINUTE must be 0-59".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["grindstone"])
    }

    #[test]
    fn defaults_validate() {
        assert!(base_args().validate().is_ok());
    }

    #[test]
    fn rest_backend_requires_url_and_key() {
        let mut args = base_args();
        args.store_backend = StoreBackend::Rest;
        assert!(args.validate().is_err());

        args.rest_url = Some("https://db.example.com/rest/v1".to_string());
        args.rest_service_key = Some("key".to_string());
        assert!(args.validate().is_ok());
    }

    #[test]
    fn memory_backend_needs_dev_mode() {
        let mut args = base_args();
        args.store_backend = StoreBackend::Memory;
        assert!(args.validate().is_err());
        args.dev_mode = true;
        assert!(args.validate().is_ok());
    }

    #[test]
    fn schedule_bounds_are_checked() {
        let mut args = base_args();
        args.reset_hour = 24;
        assert!(args.validate().is_err());

        let mut args = base_args();
        args.reset_minute = 60;
        assert!(args.validate().is_err());
    }
}
