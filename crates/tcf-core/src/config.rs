//! Runtime configuration for protocol access.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by the dispatcher, blocking adapter and remote operations.
///
/// Every field has a default, so a partial JSON document is a valid
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Name given to the dispatch thread.
    pub dispatch_thread_name: String,

    /// How long a blocking caller waits for an asynchronous reply.
    pub call_timeout_ms: u64,

    /// How long a blocking caller waits for a channel to open.
    pub channel_timeout_ms: u64,

    /// Size of each chunk copied by a file transfer.
    pub transfer_chunk_size: usize,

    /// Number of path lookups remembered by the tree synchronizer.
    pub path_cache_capacity: usize,

    /// Number of events kept for late subscribers.
    pub event_history: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            dispatch_thread_name: "tcf-dispatch".to_string(),
            call_timeout_ms: 60_000,
            channel_timeout_ms: 60_000,
            transfer_chunk_size: 12 * 1024,
            path_cache_capacity: 25,
            event_history: 1_000,
        }
    }
}

impl CoreConfig {
    /// Parse a configuration from JSON, filling in defaults.
    ///
    /// # Errors
    /// Returns error if the document is not valid JSON or has mistyped fields.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Blocking call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Channel open timeout.
    #[must_use]
    pub const fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }
}
