//! Credential hashing
//!
//! Argon2id with default parameters; hashes travel as PHC strings, which
//! carry their own salt and parameters, so verification needs no extra
//! state.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

use crate::types::GrindstoneError;

/// Hash a plaintext password into a PHC string
pub fn hash_password(password: &str) -> Result<String, GrindstoneError> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| GrindstoneError::Auth(format!("password hashing failed: {e}")))
}

/// Check a plaintext password against a stored PHC hash. A well-formed hash
/// that simply does not match yields `Ok(false)`; a malformed hash is an
/// error.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, GrindstoneError> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| GrindstoneError::Auth(format!("stored hash is malformed: {e}")))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
