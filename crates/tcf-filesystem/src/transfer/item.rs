//! Transfer items.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    HostToTarget,
    TargetToHost,
}

fn enabled() -> bool {
    true
}

/// One file to copy between host and target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItem {
    pub direction: Direction,
    /// Path on the host.
    pub host_path: PathBuf,
    /// Path on the target.
    pub target_path: String,
    /// Disabled items complete immediately without touching anything.
    #[serde(default = "enabled")]
    pub enabled: bool,
}

impl TransferItem {
    /// Copy `host_path` to `target_path`.
    #[must_use]
    pub fn to_target(host_path: impl Into<PathBuf>, target_path: impl Into<String>) -> Self {
        Self {
            direction: Direction::HostToTarget,
            host_path: host_path.into(),
            target_path: target_path.into(),
            enabled: true,
        }
    }

    /// Copy `target_path` to `host_path`.
    #[must_use]
    pub fn to_host(target_path: impl Into<String>, host_path: impl Into<PathBuf>) -> Self {
        Self {
            direction: Direction::TargetToHost,
            host_path: host_path.into(),
            target_path: target_path.into(),
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Human-readable source path.
    #[must_use]
    pub fn source(&self) -> String {
        match self.direction {
            Direction::HostToTarget => self.host_path.display().to_string(),
            Direction::TargetToHost => self.target_path.clone(),
        }
    }

    /// Human-readable destination path.
    #[must_use]
    pub fn destination(&self) -> String {
        match self.direction {
            Direction::HostToTarget => self.target_path.clone(),
            Direction::TargetToHost => self.host_path.display().to_string(),
        }
    }
}
