//! Account registration and login

use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::{hash_password, verify_password, Claims, TokenIssuer};
use crate::model::User;
use crate::store::GameStore;
use crate::types::{GrindstoneError, Result};

const MIN_PASSWORD_LEN: usize = 8;

/// Outcome of a successful register or login
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user: User,
}

pub struct AccountService {
    store: Arc<dyn GameStore>,
    tokens: TokenIssuer,
}

impl AccountService {
    pub fn new(store: Arc<dyn GameStore>, tokens: TokenIssuer) -> Self {
        Self { store, tokens }
    }

    /// Create an account with its starting character and sign a session
    /// token. The character is named after the email's local part.
    pub async fn register(&self, email: &str, password: &str) -> Result<Session> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(GrindstoneError::Validation("email is malformed".into()));
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(GrindstoneError::Validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        let password_hash = hash_password(password)?;
        let character_name = User::default_character_name(&email).to_string();
        let user = self
            .store
            .register_user(&email, &password_hash, &character_name)
            .await?;

        info!(user_id = user.id, "account registered");
        let token = self.tokens.issue(user.id)?;
        Ok(Session { token, user })
    }

    /// Verify credentials and sign a session token. Unknown email and wrong
    /// password collapse into the same error so the response does not leak
    /// which emails have accounts.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        let email = email.trim().to_lowercase();
        let user = match self.store.find_user_by_email(&email).await? {
            Some(user) => user,
            None => {
                warn!("login attempt for unknown email");
                return Err(GrindstoneError::InvalidCredentials);
            }
        };

        if !verify_password(password, &user.password_hash)? {
            warn!(user_id = user.id, "login attempt with wrong password");
            return Err(GrindstoneError::InvalidCredentials);
        }

        self.store.record_login(user.id).await?;
        info!(user_id = user.id, "login");

        let token = self.tokens.issue(user.id)?;
        Ok(Session { token, user })
    }

    /// Validate a session token and return its claims
    pub fn authenticate(&self, token: &str) -> Result<Claims> {
        self.tokens.verify(token)
    }
}
