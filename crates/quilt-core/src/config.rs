//! Replication configuration.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Default debounce window for remote merge passes.
pub const DEFAULT_PATCH_APPLY_DELAY_MS: u64 = 10;

/// Default heartbeat cadence.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;

/// Default patch retention: 25 hours.
pub const DEFAULT_MAX_PATCH_RETENTION_MS: i64 = 25 * 60 * 60 * 1000;

/// Default per-sweep ceiling on missing-patch requests.
pub const DEFAULT_MAX_REQUESTS_FOR_MISSING_PATCHES: usize = 100;

/// Default read-your-writes deadline.
pub const DEFAULT_CONSISTENCY_DEADLINE_MS: u64 = 5_000;

/// Default base delay for the read-your-writes backoff (0, d, 2d, 4d, …).
pub const DEFAULT_CONSISTENCY_BACKOFF_MS: u64 = 10;

/// Chooses the SQL placeholder for a `(table, column)` pair, letting the
/// embedding application adapt statements to its SQLite build.
pub type PrepareStatementHook = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// Options recognised by the replication engine constructor.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// JSON-encode messages on the wire instead of structured records.
    pub socket_string_mode: bool,
    /// Heartbeat cadence in milliseconds; 0 disables the timer.
    pub heartbeat_interval_ms: u64,
    /// Debounce window for remote merge passes.
    pub patch_apply_delay_ms: u64,
    /// Shadow/pending rows older than this are swept.
    pub max_patch_retention_ms: i64,
    /// Upper bound on missing-patch requests per heartbeat sweep.
    pub max_request_for_missing_patches: usize,
    /// Total deadline for read-your-writes polling.
    pub consistency_deadline_ms: u64,
    /// Base delay of the read-your-writes exponential backoff.
    pub consistency_backoff_ms: u64,
    /// Placeholder syntax hook; `None` yields a single `?` per column.
    #[serde(skip)]
    pub prepare_statement_hook: Option<PrepareStatementHook>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            socket_string_mode: false,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            patch_apply_delay_ms: DEFAULT_PATCH_APPLY_DELAY_MS,
            max_patch_retention_ms: DEFAULT_MAX_PATCH_RETENTION_MS,
            max_request_for_missing_patches: DEFAULT_MAX_REQUESTS_FOR_MISSING_PATCHES,
            consistency_deadline_ms: DEFAULT_CONSISTENCY_DEADLINE_MS,
            consistency_backoff_ms: DEFAULT_CONSISTENCY_BACKOFF_MS,
            prepare_statement_hook: None,
        }
    }
}

impl fmt::Debug for ReplicationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationConfig")
            .field("socket_string_mode", &self.socket_string_mode)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("patch_apply_delay_ms", &self.patch_apply_delay_ms)
            .field("max_patch_retention_ms", &self.max_patch_retention_ms)
            .field(
                "max_request_for_missing_patches",
                &self.max_request_for_missing_patches,
            )
            .field("consistency_deadline_ms", &self.consistency_deadline_ms)
            .field("consistency_backoff_ms", &self.consistency_backoff_ms)
            .field(
                "prepare_statement_hook",
                &self.prepare_statement_hook.as_ref().map(|_| "<hook>"),
            )
            .finish()
    }
}

impl ReplicationConfig {
    /// Load config from a TOML string, falling back to defaults for missing
    /// fields.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Resolve the placeholder for a `(table, column)` pair.
    pub fn placeholder(&self, table: &str, column: &str) -> String {
        match &self.prepare_statement_hook {
            Some(hook) => hook(table, column),
            None => "?".to_string(),
        }
    }
}
