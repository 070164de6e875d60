//! Remote service contracts.

pub mod blocking;
pub mod filesystem;

use serde_json::Value;

use crate::Callback;

pub use blocking::BlockingService;
pub use filesystem::FileSystem;

/// Error reported by a remote service for one command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{service}.{command} failed ({code}): {message}")]
pub struct CommandError {
    pub service: String,
    pub command: String,
    pub code: i32,
    pub message: String,
}

impl CommandError {
    #[must_use]
    pub fn new(
        service: impl Into<String>,
        command: impl Into<String>,
        code: i32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            command: command.into(),
            code,
            message: message.into(),
        }
    }
}

/// A named remote service accepting generic commands.
///
/// Arguments and results are JSON values, as carried by the wire protocol.
pub trait RemoteService: Send + Sync {
    /// Service name, e.g. `FileSystem` or `RunControl`.
    fn name(&self) -> &str;

    /// Issue `command` with `args`. Must be called on the dispatch thread;
    /// `done` is invoked there exactly once.
    fn command(&self, command: &str, args: Vec<Value>, done: Callback<Vec<Value>, CommandError>);
}
