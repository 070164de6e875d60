//! tcf-test-utils: Simulated remote agent for tests.
//!
//! Provides:
//! - SimChannelManager: Connection provider handing out in-memory channels
//! - MemFileSystem: In-memory file system service with paging and failure injection
//! - RecordingService: Generic command service that records what it was asked
//!
//! Every simulated reply is delivered on a later dispatch cycle, as a real
//! agent's would be.

mod mem_fs;
mod recording_service;
mod sim_channel;

use tcf_core::{CoreConfig, Dispatcher};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use mem_fs::MemFileSystem;
pub use recording_service::RecordingService;
pub use sim_channel::{SimChannel, SimChannelManager};

/// Install a test log subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

/// Start a dispatcher with the default configuration.
///
/// # Panics
/// Panics if the dispatch thread cannot be started.
#[must_use]
pub fn dispatcher() -> Dispatcher {
    init_tracing();
    Dispatcher::start(&CoreConfig::default()).expect("start dispatcher")
}
