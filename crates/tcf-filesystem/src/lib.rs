//! Remote file system access.
//!
//! - `BlockingFileSystem` - File system service usable from non-dispatch threads
//! - `RemoteTree` - Arena of cached remote file system nodes
//! - `TreeSynchronizer` - Incrementally populates the tree from the remote agent
//! - `TransferEngine` - Copies files between host and target

pub mod blocking;
pub mod sync;
pub mod transfer;
pub mod tree;

pub use blocking::BlockingFileSystem;
pub use sync::{TreeError, TreeSynchronizer};
pub use transfer::{
    CancellableMonitor, Direction, NullMonitor, ProgressMonitor, TransferEngine, TransferError,
    TransferItem, TransferOutcome,
};
pub use tree::{NodeId, NodeKind, NodeSnapshot, QueryState, RemoteNode, RemoteTree};
