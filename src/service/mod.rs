//! Service layer
//!
//! Thin orchestration over the store: input validation, reward derivation,
//! credential checks. The services own no state beyond their store handle and
//! are safe to share across tasks.

pub mod account;
pub mod game;

pub use account::{AccountService, Session};
pub use game::GameService;
