//! User row: identity and credentials

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    /// Argon2 PHC hash; never the plaintext
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// IANA timezone name; defaults to UTC until the client reports one
    pub timezone: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Default character name derived from the email local part
    pub fn default_character_name(email: &str) -> &str {
        email.split('@').next().unwrap_or(email)
    }
}
