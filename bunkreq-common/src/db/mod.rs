//! Record store schema and bootstrap

pub mod init;
pub mod migrations;

pub use init::*;
pub use migrations::*;

/// Derived, actionable bunk requests
pub const BUNK_REQUESTS: &str = "bunk_requests";

/// Provenance junction between derived requests and source rows
pub const SOURCE_LINKS: &str = "bunk_request_sources";

/// Raw imported source rows with content hashes
pub const ORIGINAL_REQUESTS: &str = "original_requests";

/// Historical bunk assignments (person, bunk, session, year)
pub const BUNK_ASSIGNMENTS: &str = "bunk_assignments";

/// Enrolled persons per year, with household ids
pub const PERSONS: &str = "persons";
