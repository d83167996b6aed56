//! Utility modules for bunkreq-sync

pub mod db_retry;

pub use db_retry::retry_on_lock;
