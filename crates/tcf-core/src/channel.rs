//! Channels to remote peers and the connection provider contract.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    Callback, DispatchError, Dispatcher, Rendezvous, RemoteService, services::FileSystem,
};

/// A remote agent endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub name: String,
}

impl Peer {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Opening,
    Open,
    Closed,
    Failed,
}

/// Channel error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Peer {0} is not responding")]
    NotResponding(String),
    #[error("Failed to open channel: {0}")]
    OpenFailed(String),
    #[error("Timed out after {0:?} waiting for channel")]
    Timeout(Duration),
    #[error("Channel closed: {0}")]
    Closed(String),
    #[error("Channel is not open (state: {0:?})")]
    NotOpen(ChannelState),
    #[error("Service not available: {0}")]
    ServiceUnavailable(String),
    #[error("Cannot wait for a channel on the dispatch thread")]
    OnDispatchThread,
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Notified once when a channel closes. `None` means an orderly close.
pub type CloseListener = Box<dyn FnOnce(Option<ChannelError>) + Send + 'static>;

/// An open, stateful connection to a remote agent.
///
/// All methods must be called on the dispatch thread.
pub trait Channel: Send + Sync {
    fn id(&self) -> Uuid;

    fn remote_peer(&self) -> &Peer;

    fn state(&self) -> ChannelState;

    /// Look up a generic command service by name.
    fn remote_service(&self, name: &str) -> Option<Arc<dyn RemoteService>>;

    /// The file system service, if the agent offers one.
    fn file_system(&self) -> Option<Arc<dyn FileSystem>>;

    /// Register a listener for the channel closing.
    ///
    /// If the channel is already closed the listener fires immediately.
    fn add_close_listener(&self, listener: CloseListener);
}

/// Connection provider: opens and closes channels.
pub trait ChannelManager: Send + Sync {
    /// Open a channel to `peer`. Called on the dispatch thread; `done`
    /// fires there once the channel is open or has failed.
    fn open_channel(&self, peer: &Peer, done: Callback<Arc<dyn Channel>, ChannelError>);

    /// Close a channel opened through this manager.
    fn close_channel(&self, channel: &Arc<dyn Channel>);
}

enum Pending {
    Waiting,
    Abandoned,
    Done(Result<Arc<dyn Channel>, ChannelError>),
}

/// Open a channel from a non-dispatch thread and block until it is open.
///
/// A channel that opens after the caller gave up is closed right away.
///
/// # Errors
/// Returns error if the open fails, times out, or is attempted on the
/// dispatch thread.
pub fn open_channel_blocking(
    dispatcher: &Dispatcher,
    manager: &Arc<dyn ChannelManager>,
    peer: &Peer,
    timeout: Duration,
) -> Result<Arc<dyn Channel>, ChannelError> {
    if dispatcher.is_dispatch_thread() {
        return Err(ChannelError::OnDispatchThread);
    }

    let rendezvous = Rendezvous::new();
    let pending = Arc::new(Mutex::new(Pending::Waiting));

    let open_manager = Arc::clone(manager);
    let slot = Arc::clone(&pending);
    let arrived = rendezvous.clone();
    let open_peer = peer.clone();
    dispatcher.invoke_later(move || {
        let close_manager = Arc::clone(&open_manager);
        open_manager.open_channel(
            &open_peer,
            Box::new(move |result| {
                let mut pending = slot.lock();
                if matches!(*pending, Pending::Abandoned) {
                    if let Ok(channel) = result {
                        debug!(channel = %channel.id(), "Closing channel opened after timeout");
                        close_manager.close_channel(&channel);
                    }
                } else {
                    *pending = Pending::Done(result);
                }
                drop(pending);
                arrived.arrive();
            }),
        );
    });

    let timed_out = rendezvous.wait(timeout).is_err();
    let mut pending = pending.lock();
    match std::mem::replace(&mut *pending, Pending::Abandoned) {
        Pending::Done(result) => result,
        Pending::Waiting | Pending::Abandoned => {
            if timed_out {
                warn!(peer = %peer.id, "Timed out opening channel");
                Err(ChannelError::Timeout(timeout))
            } else {
                Err(ChannelError::OpenFailed(format!(
                    "no reply from connection provider for {}",
                    peer.id
                )))
            }
        }
    }
}
