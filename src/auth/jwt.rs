//! JWT issuance and validation
//!
//! Tokens carry the user id and a 7-day expiry, signed with HS256. The
//! embedding HTTP layer validates the token and passes the user id into the
//! service calls; nothing in this crate reads tokens on its own behalf.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::types::GrindstoneError;

/// Default token lifetime
pub const TOKEN_EXPIRY_DAYS: i64 = 7;

/// JWT claims for an authenticated user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Owning user id
    pub user_id: i64,
    /// Expiry as unix timestamp
    pub exp: i64,
    /// Issued-at as unix timestamp
    pub iat: i64,
}

/// Issues and validates tokens for one signing secret
#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiry: Duration::days(TOKEN_EXPIRY_DAYS),
        }
    }

    /// Sign a token for a user
    pub fn issue(&self, user_id: i64) -> Result<String, GrindstoneError> {
        let now = Utc::now();
        let claims = Claims {
            user_id,
            exp: (now + self.expiry).timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| GrindstoneError::Auth(format!("Failed to sign token: {e}")))
    }

    /// Validate a token and return its claims
    pub fn verify(&self, token: &str) -> Result<Claims, GrindstoneError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| GrindstoneError::Auth(format!("Invalid token: {e}")))
    }
}
