//! # bunkreq Common Library
//!
//! Shared code for the bunk request synchronization workspace:
//! - Error type and result alias
//! - Configuration loading (TOML, environment, platform defaults)
//! - SQLite bootstrap and schema migrations for the record store
//! - Content hashing for change detection

pub mod config;
pub mod db;
pub mod error;
pub mod hash;

pub use config::SyncConfig;
pub use error::{Error, Result};
