//! Authentication for Grindstone
//!
//! Provides:
//! - Password hashing with Argon2
//! - JWT token issuance and validation for the embedding HTTP layer

pub mod jwt;
pub mod password;

pub use jwt::{Claims, TokenIssuer};
pub use password::{hash_password, verify_password};
