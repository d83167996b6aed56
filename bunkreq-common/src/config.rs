//! Configuration loading and database path resolution
//!
//! Resolution priority (highest first):
//! 1. Command-line argument
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "BUNKREQ_CONFIG";

/// Environment variable naming the SQLite database file
pub const DATABASE_ENV_VAR: &str = "BUNKREQ_DATABASE";

/// Default rows per page for paginated store reads
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Upper bound on rows per page accepted by any store
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Runtime configuration for a sync run and for staff maintenance commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// SQLite database file (None = platform default)
    pub database_path: Option<PathBuf>,
    /// Rows per page for paginated reads and drains
    pub page_size: u32,
    /// Maximum total time to retry a write on "database is locked"
    pub max_lock_wait_ms: u64,
    /// Default tracing filter when RUST_LOG is not set
    pub log_level: String,
    /// Resolver confidence at or above which a request is marked resolved
    pub auto_resolve_threshold: f64,
    /// Priority assigned when the parser does not supply one
    pub default_priority: i64,
    /// Parse identical statements once per run
    pub dedup_enabled: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            page_size: DEFAULT_PAGE_SIZE,
            max_lock_wait_ms: 5000,
            log_level: "info".to_string(),
            auto_resolve_threshold: 0.85,
            default_priority: 3,
            dedup_enabled: true,
        }
    }
}

impl SyncConfig {
    /// Parse configuration from TOML text; missing keys take defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Read config {} failed: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(Error::Config(format!(
                "page_size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, self.page_size
            )));
        }
        if !(0.0..=1.0).contains(&self.auto_resolve_threshold) {
            return Err(Error::Config(format!(
                "auto_resolve_threshold must be within 0.0..=1.0, got {}",
                self.auto_resolve_threshold
            )));
        }
        Ok(())
    }
}

/// Load configuration following the resolution priority.
///
/// An explicitly named file (CLI or environment) must exist and parse.
/// The platform default file is optional: when absent, compiled defaults
/// are used.
pub fn load_config(cli_path: Option<&Path>) -> Result<SyncConfig> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_path {
        info!("Loading config from command line: {}", path.display());
        return SyncConfig::load_file(path);
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        info!("Loading config from {}: {}", CONFIG_ENV_VAR, path);
        return SyncConfig::load_file(Path::new(&path));
    }

    // Priority 3: TOML config file in the platform config directory
    if let Some(path) = default_config_path() {
        if path.exists() {
            info!("Loading config from {}", path.display());
            return SyncConfig::load_file(&path);
        }
        debug!("No config file at {}", path.display());
    }

    // Priority 4: Compiled defaults
    warn!("No config file found, using compiled defaults");
    Ok(SyncConfig::default())
}

/// Resolve the SQLite database path following the resolution priority
pub fn resolve_database_path(cli_arg: Option<&str>, config: &SyncConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var(DATABASE_ENV_VAR) {
        return PathBuf::from(path);
    }

    if let Some(path) = &config.database_path {
        return path.clone();
    }

    default_database_path()
}

/// Platform config file location (~/.config/bunkreq/config.toml on Linux)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("bunkreq").join("config.toml"))
}

/// OS-dependent default database location
fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("bunkreq").join("bunkreq.db"))
        .unwrap_or_else(|| PathBuf::from("./bunkreq_data/bunkreq.db"))
}
