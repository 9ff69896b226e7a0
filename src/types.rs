//! Shared error and result types

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, GrindstoneError>;

/// Errors surfaced by the store, the services, and the reconciliation engine
#[derive(Debug, Error)]
pub enum GrindstoneError {
    /// Store connection or query infrastructure failure
    #[error("database error: {0}")]
    Database(String),

    /// Candidate-set query failed; aborts one category of a reset run,
    /// never the whole run
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Single-row mutation failed; logged and skipped by the engine
    #[error("row update failed: {0}")]
    RowUpdate(String),

    /// Optimistic-concurrency retries exhausted on a contended row
    #[error("version conflict not resolved for {0}")]
    Conflict(String),

    /// Password hashing or token handling failure
    #[error("auth error: {0}")]
    Auth(String),

    /// Login with unknown email or wrong password
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Registration with an email that already has an account
    #[error("email already registered")]
    EmailTaken,

    #[error("{0} not found")]
    NotFound(String),

    /// Completing a task that is already in the COMPLETED state
    #[error("task already completed")]
    AlreadyCompleted,

    /// Completing a task that has left the ACTIVE state (e.g. FAILED);
    /// task status only moves forward
    #[error("task is not active")]
    TaskNotActive,

    /// Completing a habit twice on the same calendar day
    #[error("habit already completed today")]
    AlreadyCompletedToday,

    /// Rejected request input (empty title, unknown difficulty, ...)
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GrindstoneError {
    /// Whether the error is a client mistake rather than an infrastructure
    /// failure. Embedding layers map these to 4xx responses.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GrindstoneError::InvalidCredentials
                | GrindstoneError::EmailTaken
                | GrindstoneError::NotFound(_)
                | GrindstoneError::AlreadyCompleted
                | GrindstoneError::TaskNotActive
                | GrindstoneError::AlreadyCompletedToday
                | GrindstoneError::Validation(_)
        )
    }
}
