//! Test Helper Utilities
//!
//! Shared utilities for testing bunkreq-sync

#![allow(dead_code, unused_imports)]

pub mod fakes;
pub mod fixtures;

// Re-export commonly used items
pub use fakes::{FakeLookup, FlakyStore, ScriptedParser};
pub use fixtures::{bunk_with, memory_engine, person, row, seed_request};
