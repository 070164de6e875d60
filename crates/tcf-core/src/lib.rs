//! Core abstractions for remote agent protocol access.
//!
//! This crate provides the fundamental building blocks:
//! - `Dispatcher` - The single thread that owns all protocol state
//! - `Rendezvous` - One-shot wait/signal point for blocking callers
//! - `BlockingCall` - Adapter letting other threads block on asynchronous calls
//! - `Channel` and `ChannelManager` - Connection provider contracts
//! - Remote service contracts (generic command services, file system) and
//!   `BlockingService`, the blocking decorator for command services
//! - `BoundedCache`, `EventStore` and `CoreConfig` utilities

pub mod blocking;
pub mod cache;
pub mod callback;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod rendezvous;
pub mod services;

pub use blocking::{
    AllDispatched, BlockingCall, BlockingCallError, CallMode, DEFAULT_CALL_TIMEOUT, MethodTable,
    ProxyDescriptor,
};
pub use cache::BoundedCache;
pub use callback::{Callback, Outcome};
pub use channel::{
    Channel, ChannelError, ChannelManager, ChannelState, CloseListener, Peer, open_channel_blocking,
};
pub use config::CoreConfig;
pub use dispatch::{DispatchError, Dispatcher};
pub use events::EventStore;
pub use rendezvous::{Rendezvous, RendezvousTimeout};
pub use services::{BlockingService, CommandError, RemoteService};
