//! Progress reporting and cancellation.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Units of work a transfer reports in total.
pub const TOTAL_WORK: u64 = 1000;

/// Receives progress of a long-running operation.
pub trait ProgressMonitor: Send + Sync {
    fn begin(&self, _task: &str, _total_work: u64) {}

    fn sub_task(&self, _text: &str) {}

    fn worked(&self, _work: u64) {}

    fn is_cancelled(&self) -> bool {
        false
    }

    fn done(&self) {}
}

/// Ignores progress and is never cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMonitor;

impl ProgressMonitor for NullMonitor {}

/// Monitor that can be cancelled from any thread and remembers what it was
/// told.
#[derive(Debug, Default)]
pub struct CancellableMonitor {
    token: CancellationToken,
    task: Mutex<String>,
    sub_task: Mutex<String>,
    worked: AtomicU64,
}

impl CancellableMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing token, e.g. a child of a session-wide token.
    #[must_use]
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    #[must_use]
    pub fn task(&self) -> String {
        self.task.lock().clone()
    }

    /// Last sub-task text.
    #[must_use]
    pub fn sub_task_text(&self) -> String {
        self.sub_task.lock().clone()
    }

    /// Work reported so far.
    #[must_use]
    pub fn total_worked(&self) -> u64 {
        self.worked.load(Ordering::SeqCst)
    }
}

impl ProgressMonitor for CancellableMonitor {
    fn begin(&self, task: &str, _total_work: u64) {
        *self.task.lock() = task.to_string();
    }

    fn sub_task(&self, text: &str) {
        *self.sub_task.lock() = text.to_string();
    }

    fn worked(&self, work: u64) {
        self.worked.fetch_add(work, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Scale a byte count to B, KB, MB or GB.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes;
    let mut unit = 0;
    while value > 1024 && unit < UNITS.len() - 1 {
        value /= 1024;
        unit += 1;
    }
    format!("{value}{}", UNITS[unit])
}

/// Sub-task text of a running copy, e.g. `12KB of 3MB at 640KB/s`.
#[must_use]
pub fn progress_message(done: u64, total: u64, bytes_per_sec: u64) -> String {
    format!(
        "{} of {} at {}/s",
        format_bytes(done),
        format_bytes(total),
        format_bytes(bytes_per_sec)
    )
}
