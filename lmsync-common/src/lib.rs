//! # lmsync Common Library
//!
//! Shared code for the lmsync crates including:
//! - Error type used across crates
//! - Configuration loading (root folder, TOML file)
//! - SQLite database initialization
//! - Event types and the EventBus
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
