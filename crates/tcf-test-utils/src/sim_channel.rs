//! In-memory channels and connection provider.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use tcf_core::{
    Callback, Channel, ChannelError, ChannelManager, ChannelState, CloseListener, Dispatcher, Peer,
    RemoteService, services::FileSystem,
};
use uuid::Uuid;

use crate::MemFileSystem;

/// A simulated channel.
pub struct SimChannel {
    id: Uuid,
    peer: Peer,
    state: Mutex<ChannelState>,
    file_system: Option<Arc<MemFileSystem>>,
    services: HashMap<String, Arc<dyn RemoteService>>,
    listeners: Mutex<Vec<CloseListener>>,
}

impl SimChannel {
    /// Close the channel, notifying listeners with `error`.
    pub fn close(&self, error: Option<ChannelError>) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ChannelState::Closed | ChannelState::Failed) {
                return;
            }
            *state = if error.is_some() {
                ChannelState::Failed
            } else {
                ChannelState::Closed
            };
        }
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener(error.clone());
        }
    }
}

impl Channel for SimChannel {
    fn id(&self) -> Uuid {
        self.id
    }

    fn remote_peer(&self) -> &Peer {
        &self.peer
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn remote_service(&self, name: &str) -> Option<Arc<dyn RemoteService>> {
        self.services.get(name).cloned()
    }

    fn file_system(&self) -> Option<Arc<dyn FileSystem>> {
        self.file_system
            .as_ref()
            .map(|fs| Arc::clone(fs) as Arc<dyn FileSystem>)
    }

    fn add_close_listener(&self, listener: CloseListener) {
        if self.state() == ChannelState::Open {
            self.listeners.lock().push(listener);
        } else {
            listener(None);
        }
    }
}

/// Connection provider handing out [`SimChannel`]s.
///
/// Counts opens and closes, can fail opens, and can hold opens back until
/// released so tests can observe in-flight operations.
pub struct SimChannelManager {
    dispatcher: Dispatcher,
    file_system: Option<Arc<MemFileSystem>>,
    services: Mutex<HashMap<String, Arc<dyn RemoteService>>>,
    channels: Mutex<Vec<Arc<SimChannel>>>,
    open_failure: Mutex<Option<ChannelError>>,
    held: Mutex<Option<Vec<Box<dyn FnOnce() + Send>>>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl SimChannelManager {
    #[must_use]
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            file_system: None,
            services: Mutex::new(HashMap::new()),
            channels: Mutex::new(Vec::new()),
            open_failure: Mutex::new(None),
            held: Mutex::new(None),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    /// Offer `file_system` on every channel.
    #[must_use]
    pub fn with_file_system(mut self, file_system: Arc<MemFileSystem>) -> Self {
        self.file_system = Some(file_system);
        self
    }

    /// Offer `service` under its name on channels opened from now on.
    pub fn add_service(&self, service: Arc<dyn RemoteService>) {
        self.services
            .lock()
            .insert(service.name().to_string(), service);
    }

    /// Make subsequent opens fail with `error` (or succeed again with `None`).
    pub fn fail_opens(&self, error: Option<ChannelError>) {
        *self.open_failure.lock() = error;
    }

    /// Hold open replies back until [`Self::release_opens`].
    pub fn hold_opens(&self) {
        let mut held = self.held.lock();
        if held.is_none() {
            *held = Some(Vec::new());
        }
    }

    /// Deliver held open replies and stop holding.
    pub fn release_opens(&self) {
        let held = self.held.lock().take().unwrap_or_default();
        for reply in held {
            self.dispatcher.invoke_later(reply);
        }
    }

    /// Close every open channel from the remote side with `error`.
    pub fn close_remotely(&self, error: ChannelError) {
        let channels = self.channels.lock().clone();
        self.dispatcher.invoke_later(move || {
            for channel in channels {
                channel.close(Some(error.clone()));
            }
        });
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Channels handed out that are still open.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.channels
            .lock()
            .iter()
            .filter(|c| c.state() == ChannelState::Open)
            .count()
    }
}

impl ChannelManager for SimChannelManager {
    fn open_channel(&self, peer: &Peer, done: Callback<Arc<dyn Channel>, ChannelError>) {
        self.opened.fetch_add(1, Ordering::SeqCst);

        let reply: Box<dyn FnOnce() + Send> = match self.open_failure.lock().clone() {
            Some(error) => Box::new(move || done(Err(error))),
            None => {
                let channel = Arc::new(SimChannel {
                    id: Uuid::new_v4(),
                    peer: peer.clone(),
                    state: Mutex::new(ChannelState::Open),
                    file_system: self.file_system.clone(),
                    services: self.services.lock().clone(),
                    listeners: Mutex::new(Vec::new()),
                });
                self.channels.lock().push(Arc::clone(&channel));
                Box::new(move || done(Ok(channel as Arc<dyn Channel>)))
            }
        };

        let reply = match self.held.lock().as_mut() {
            Some(queue) => {
                queue.push(reply);
                None
            }
            None => Some(reply),
        };
        if let Some(reply) = reply {
            self.dispatcher.invoke_later(reply);
        }
    }

    fn close_channel(&self, channel: &Arc<dyn Channel>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        let id = channel.id();
        let sim = self.channels.lock().iter().find(|c| c.id == id).cloned();
        if let Some(sim) = sim {
            sim.close(None);
        }
    }
}
