//! Grindstone - gamified habit tracker core
//!
//! The library carries the domain model, the pluggable persistence layer,
//! the account/game services, and the daily reconciliation engine that
//! settles missed habits and blown deadlines into penalties. The binary in
//! `main.rs` runs the reconciliation as a scheduled daemon; an HTTP layer
//! embedding the services lives outside this crate.

pub mod auth;
pub mod config;
pub mod model;
pub mod reset;
pub mod service;
pub mod store;
pub mod types;

pub use reset::{ReconciliationEngine, ResetCutoffs, ResetSummary};
pub use store::GameStore;
pub use types::{GrindstoneError, Result};
