//! Service configuration loaded from environment variables.
//!
//! Every setting has a default, so an embedding host can start with zero
//! configuration for local development.

use std::path::PathBuf;
use std::time::Duration;

use confab_shared::constants::{DEFAULT_PREVIEW_CHARS, MAX_PAGE_LIMIT};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// SQLite database file.
    /// Env: `CONFAB_DB_PATH`
    /// Default: `None` (platform data directory)
    pub database_path: Option<PathBuf>,

    /// How long a writer waits on a locked database before giving up.
    /// Env: `CONFAB_BUSY_TIMEOUT_MS`
    /// Default: `5000`
    pub busy_timeout: Duration,

    /// Largest page `list_messages` will serve. Never above 200.
    /// Env: `CONFAB_PAGE_LIMIT_CAP`
    /// Default: `200`
    pub page_limit_cap: u32,

    /// Characters kept in a last-message preview.
    /// Env: `CONFAB_PREVIEW_CHARS`
    /// Default: `100`
    pub preview_chars: usize,

    /// Read-only connections serving listings next to the single writer.
    /// `0` routes reads through the writer connection.
    /// Env: `CONFAB_READ_CONNECTIONS`
    /// Default: `4`
    pub read_connections: usize,

    /// Run the consistency check when the facade opens the store.
    /// Env: `CONFAB_CHECK_ON_START` (true/false)
    /// Default: `true`
    pub check_on_start: bool,

    /// Hard-delete soft-deleted conversations (admin binary only).
    /// Env: `CONFAB_PURGE_DELETED` (true/false)
    /// Default: `false`
    pub purge_deleted: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            busy_timeout: Duration::from_millis(5000),
            page_limit_cap: MAX_PAGE_LIMIT,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            read_connections: 4,
            check_on_start: true,
            purge_deleted: false,
        }
    }
}

impl ChatConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = get("CONFAB_DB_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Some(val) = get("CONFAB_BUSY_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.busy_timeout = Duration::from_millis(ms),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid CONFAB_BUSY_TIMEOUT_MS, using default");
                }
            }
        }

        if let Some(val) = get("CONFAB_PAGE_LIMIT_CAP") {
            match val.parse::<u32>() {
                Ok(n) if (1..=MAX_PAGE_LIMIT).contains(&n) => config.page_limit_cap = n,
                _ => {
                    tracing::warn!(
                        value = %val,
                        max = MAX_PAGE_LIMIT,
                        "Invalid CONFAB_PAGE_LIMIT_CAP, using default"
                    );
                }
            }
        }

        if let Some(val) = get("CONFAB_PREVIEW_CHARS") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.preview_chars = n,
                _ => {
                    tracing::warn!(value = %val, "Invalid CONFAB_PREVIEW_CHARS, using default");
                }
            }
        }

        if let Some(val) = get("CONFAB_READ_CONNECTIONS") {
            match val.parse::<usize>() {
                Ok(n) => config.read_connections = n,
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid CONFAB_READ_CONNECTIONS, using default");
                }
            }
        }

        if let Some(val) = get("CONFAB_CHECK_ON_START") {
            config.check_on_start = val != "false" && val != "0";
        }

        if let Some(val) = get("CONFAB_PURGE_DELETED") {
            config.purge_deleted = val == "true" || val == "1";
        }

        config
    }
}
