//! Broadcast + history event store.

use std::collections::VecDeque;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Event store with broadcast and bounded history.
///
/// Late subscribers receive the history first, then live events.
pub struct EventStore<E> {
    history: RwLock<VecDeque<E>>,
    capacity: usize,
    sender: broadcast::Sender<E>,
}

impl<E> EventStore<E>
where
    E: Clone + Send + 'static,
{
    /// Create a store keeping the last `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(32))),
            capacity,
            sender,
        }
    }

    /// Push an event to both live listeners and history.
    pub fn push(&self, event: E) {
        let mut history = self.history.write();
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
        let _ = self.sender.send(event); // live listeners
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn get_history(&self) -> Vec<E> {
        self.history.read().iter().cloned().collect()
    }

    /// Stream that yields history first, then live updates.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, E> {
        let (history, rx) = {
            let history = self.history.read();
            (history.iter().cloned().collect::<Vec<_>>(), self.sender.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}
