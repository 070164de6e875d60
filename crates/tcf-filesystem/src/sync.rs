//! Remote tree synchronizer.
//!
//! Populates a [`RemoteTree`] with chained asynchronous queries issued on the
//! dispatch thread. Each query opens its own short-lived channel.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use tcf_core::{
    BoundedCache, Callback, Channel, ChannelError, ChannelManager, ChannelState, CoreConfig,
    DispatchError, Dispatcher, Peer,
    services::filesystem::{FileAttrs, FileHandle, FileSystem, FileSystemError},
};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::tree::{NodeId, NodeKind, NodeSnapshot, QueryState, RemoteTree};

/// Tree synchronization error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("Node not found: {0:?}")]
    NodeNotFound(NodeId),
    #[error("Not a directory: {0}")]
    NotADirectory(String),
    #[error("Path not found: {0}")]
    PathNotFound(String),
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("File system service not available")]
    NoFileSystem,
    #[error("File system error on '{path}': {source}")]
    FileSystem {
        path: String,
        source: FileSystemError,
    },
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Completion callback of a tree operation.
pub type TreeCallback<T> = Callback<T, TreeError>;

/// Keeps a [`RemoteTree`] in sync with one peer's file system.
///
/// Cloning is cheap; clones share the tree.
#[derive(Clone)]
pub struct TreeSynchronizer {
    inner: Arc<Inner>,
}

struct Inner {
    dispatcher: Dispatcher,
    manager: Arc<dyn ChannelManager>,
    peer: Peer,
    tree: Arc<RwLock<RemoteTree>>,
    /// Callbacks of every request for a node whose query is running.
    waiters: Mutex<HashMap<NodeId, Vec<TreeCallback<()>>>>,
    path_cache: Mutex<BoundedCache<String, NodeId>>,
}

/// The channel of one query. The query settles once, either at the end of
/// its request sequence or when the channel closes underneath it.
#[derive(Clone)]
struct QueryChannel {
    channel: Arc<dyn Channel>,
    settled: Arc<AtomicBool>,
}

impl QueryChannel {
    fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Returns `false` if the query had already settled.
    fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }
}

/// State carried from one directory read to the next.
struct DirQuery {
    node: NodeId,
    path: String,
    channel: QueryChannel,
    fs: Arc<dyn FileSystem>,
    handle: FileHandle,
    seen: HashSet<NodeId>,
}

impl TreeSynchronizer {
    #[must_use]
    pub fn new(
        dispatcher: Dispatcher,
        manager: Arc<dyn ChannelManager>,
        peer: Peer,
        config: &CoreConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                manager,
                peer,
                tree: Arc::new(RwLock::new(RemoteTree::new())),
                waiters: Mutex::new(HashMap::new()),
                path_cache: Mutex::new(BoundedCache::new(config.path_cache_capacity)),
            }),
        }
    }

    /// The shared tree. Written only on the dispatch thread; other threads
    /// see eventually consistent snapshots.
    #[must_use]
    pub fn tree(&self) -> &Arc<RwLock<RemoteTree>> {
        &self.inner.tree
    }

    /// The system root, whose children are the file system roots.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.inner.tree.read().root()
    }

    #[must_use]
    pub fn peer(&self) -> &Peer {
        &self.inner.peer
    }

    /// Query the children of `node`.
    ///
    /// A request for a node whose query is already running does not start
    /// another one; `done` fires with that query's result.
    pub fn query_children(&self, node: NodeId, done: TreeCallback<()>) {
        let inner = Arc::clone(&self.inner);
        self.inner.on_dispatch(move || inner.start_query(node, done));
    }

    /// Async form of [`Self::query_children`].
    ///
    /// # Errors
    /// Returns error if the channel cannot be opened or the listing fails.
    pub async fn query(&self, node: NodeId) -> Result<(), TreeError> {
        await_callback(|done| self.query_children(node, done)).await
    }

    /// Re-read the attributes of `node` and confirm it if it is a ghost.
    pub fn refresh_attributes(&self, node: NodeId, done: TreeCallback<FileAttrs>) {
        let inner = Arc::clone(&self.inner);
        self.inner.on_dispatch(move || inner.start_refresh(node, done));
    }

    /// Async form of [`Self::refresh_attributes`].
    ///
    /// # Errors
    /// Returns error if the channel cannot be opened or `stat` fails.
    pub async fn refresh(&self, node: NodeId) -> Result<FileAttrs, TreeError> {
        await_callback(|done| self.refresh_attributes(node, done)).await
    }

    /// Resolve a remote path to a node, querying directories on the way.
    ///
    /// # Errors
    /// Returns [`TreeError::PathNotFound`] if a segment does not exist, or
    /// the error of a query made along the way.
    pub async fn find_node(&self, path: &str) -> Result<NodeId, TreeError> {
        if let Some(id) = self.cached(path) {
            return Ok(id);
        }

        let root = self.root();
        if !self.is_queried(root) {
            self.query(root).await?;
        }
        let (mut current, rest) = self
            .match_root(path)
            .ok_or_else(|| TreeError::PathNotFound(path.to_string()))?;

        for segment in rest.split(['/', '\\']).filter(|s| !s.is_empty()) {
            if !self.is_queried(current) {
                self.query(current).await?;
            }
            current = self
                .inner
                .tree
                .read()
                .child_by_name(current, segment)
                .ok_or_else(|| TreeError::PathNotFound(path.to_string()))?;
        }

        self.inner
            .path_cache
            .lock()
            .insert(path.to_string(), current);
        Ok(current)
    }

    /// Capture the subtree at `node` for later restoration.
    #[must_use]
    pub fn snapshot(&self, node: NodeId) -> Option<NodeSnapshot> {
        self.inner.tree.read().snapshot(node)
    }

    /// Materialize a snapshot below `parent` as ghost nodes.
    ///
    /// # Errors
    /// Returns error if `parent` does not exist.
    pub async fn restore(
        &self,
        parent: NodeId,
        snapshot: NodeSnapshot,
    ) -> Result<NodeId, TreeError> {
        let tree = Arc::clone(&self.inner.tree);
        self.inner
            .dispatcher
            .run(move || tree.write().restore(parent, &snapshot))
            .await?
            .ok_or(TreeError::NodeNotFound(parent))
    }

    fn is_queried(&self, node: NodeId) -> bool {
        self.inner
            .tree
            .read()
            .get(node)
            .is_some_and(|n| n.children_queried())
    }

    fn cached(&self, path: &str) -> Option<NodeId> {
        let mut cache = self.inner.path_cache.lock();
        let key = path.to_string();
        let id = *cache.get(&key)?;
        let valid = self
            .inner
            .tree
            .read()
            .get(id)
            .is_some_and(|n| !n.is_ghost());
        if valid {
            Some(id)
        } else {
            cache.remove(&key);
            None
        }
    }

    /// The root whose name is the longest prefix of `path`, and the rest.
    fn match_root<'p>(&self, path: &'p str) -> Option<(NodeId, &'p str)> {
        let tree = self.inner.tree.read();
        tree.children(tree.root())
            .filter(|root| {
                let name = root.name();
                path.get(..name.len()).is_some_and(|prefix| {
                    if name.ends_with('\\') {
                        prefix.eq_ignore_ascii_case(name)
                    } else {
                        prefix == name
                    }
                })
            })
            .max_by_key(|root| root.name().len())
            .map(|root| (root.id(), &path[root.name().len()..]))
    }
}

impl Inner {
    fn on_dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.dispatcher.is_dispatch_thread() {
            f();
        } else {
            self.dispatcher.invoke_later(f);
        }
    }

    fn start_query(self: &Arc<Self>, node: NodeId, done: TreeCallback<()>) {
        let state = self
            .tree
            .read()
            .get(node)
            .map(|n| (n.kind(), n.query_state()));

        match state {
            None => done(Err(TreeError::NodeNotFound(node))),
            Some((NodeKind::File, _)) => {
                let path = self.tree.read().path(node).unwrap_or_default();
                done(Err(TreeError::NotADirectory(path)));
            }
            Some((_, QueryState::Querying)) => {
                debug!(?node, "Query already running, waiting for it");
                self.waiters.lock().entry(node).or_default().push(done);
            }
            Some(_) => {
                self.tree.write().set_query_state(node, QueryState::Querying);
                self.waiters.lock().insert(node, vec![done]);

                let inner = Arc::clone(self);
                self.manager.open_channel(
                    &self.peer,
                    Box::new(move |result| match result {
                        Ok(channel) => inner.on_channel(node, channel),
                        Err(e) => {
                            inner.finish(node, None, QueryState::Unqueried, Err(e.into()));
                        }
                    }),
                );
            }
        }
    }

    fn on_channel(self: &Arc<Self>, node: NodeId, channel: Arc<dyn Channel>) {
        let channel = QueryChannel::new(channel);
        let state = channel.channel.state();
        if state != ChannelState::Open {
            return self.finish(
                node,
                Some(channel),
                QueryState::Unqueried,
                Err(ChannelError::NotOpen(state).into()),
            );
        }
        let inner = Arc::clone(self);
        let on_close = channel.clone();
        channel
            .channel
            .add_close_listener(Box::new(move |error: Option<ChannelError>| {
                let error = error.unwrap_or_else(|| {
                    ChannelError::Closed("closed by the remote peer".to_string())
                });
                // children merged so far stay, nothing is reconciled
                inner.finish(node, Some(on_close), QueryState::Queried, Err(error.into()));
            }));

        let Some(fs) = channel.channel.file_system() else {
            return self.finish(
                node,
                Some(channel),
                QueryState::Queried,
                Err(TreeError::NoFileSystem),
            );
        };

        let is_system_root = self.tree.read().root() == node;
        if is_system_root {
            let inner = Arc::clone(self);
            fs.roots(Box::new(move |result| match result {
                _ if channel.is_settled() => {}
                Ok(entries) => {
                    {
                        let mut tree = inner.tree.write();
                        let seen: HashSet<NodeId> =
                            tree.merge_entries(node, entries).into_iter().collect();
                        tree.retain_children(node, &seen);
                    }
                    inner.finish(node, Some(channel), QueryState::Queried, Ok(()));
                }
                Err(source) => {
                    let error = TreeError::FileSystem {
                        path: String::new(),
                        source,
                    };
                    inner.finish(node, Some(channel), QueryState::Queried, Err(error));
                }
            }));
            return;
        }

        let path = self.tree.read().path(node);
        let Some(path) = path else {
            return self.finish(
                node,
                Some(channel),
                QueryState::Unqueried,
                Err(TreeError::NodeNotFound(node)),
            );
        };

        let inner = Arc::clone(self);
        let dir_fs = Arc::clone(&fs);
        let dir_path = path.clone();
        fs.opendir(
            &dir_path,
            Box::new(move |result| match result {
                _ if channel.is_settled() => {
                    debug!(path = %path, "Directory opened after the query ended");
                }
                Ok(handle) => inner.read_next(DirQuery {
                    node,
                    path,
                    channel,
                    fs: dir_fs,
                    handle,
                    seen: HashSet::new(),
                }),
                Err(source) => {
                    let error = TreeError::FileSystem { path, source };
                    inner.finish(node, Some(channel), QueryState::Queried, Err(error));
                }
            }),
        );
    }

    fn read_next(self: &Arc<Self>, mut query: DirQuery) {
        let fs = Arc::clone(&query.fs);
        let handle = query.handle.clone();
        let inner = Arc::clone(self);
        fs.readdir(
            &handle,
            Box::new(move |result| match result {
                _ if query.channel.is_settled() => {
                    debug!(path = %query.path, "Directory page after the query ended");
                }
                Ok(page) => {
                    let ids = inner.tree.write().merge_entries(query.node, page.entries);
                    query.seen.extend(ids);
                    if page.eof {
                        // only a complete listing proves an entry is gone
                        inner
                            .tree
                            .write()
                            .retain_children(query.node, &query.seen);
                        inner.close_dir(query, Ok(()));
                    } else {
                        inner.read_next(query);
                    }
                }
                Err(source) => {
                    let error = TreeError::FileSystem {
                        path: query.path.clone(),
                        source,
                    };
                    inner.close_dir(query, Err(error));
                }
            }),
        );
    }

    fn close_dir(self: &Arc<Self>, query: DirQuery, result: Result<(), TreeError>) {
        let DirQuery {
            node,
            path,
            channel,
            fs,
            handle,
            ..
        } = query;
        let inner = Arc::clone(self);
        fs.close(
            &handle,
            Box::new(move |closed| {
                if let Err(e) = closed {
                    warn!(path = %path, "Failed to close directory: {e}");
                }
                inner.finish(node, Some(channel), QueryState::Queried, result);
            }),
        );
    }

    /// Close the channel, then settle the node and notify every waiter.
    fn finish(
        &self,
        node: NodeId,
        channel: Option<QueryChannel>,
        state: QueryState,
        result: Result<(), TreeError>,
    ) {
        if let Some(channel) = channel {
            if !channel.settle() {
                return;
            }
            self.manager.close_channel(&channel.channel);
        }
        self.tree.write().set_query_state(node, state);

        match &result {
            Ok(()) => debug!(?node, "Children query finished"),
            Err(e) => warn!(?node, "Children query failed: {e}"),
        }

        let waiters = self.waiters.lock().remove(&node).unwrap_or_default();
        for done in waiters {
            done(result.clone());
        }
    }

    fn start_refresh(self: &Arc<Self>, node: NodeId, done: TreeCallback<FileAttrs>) {
        let path = self.tree.read().path(node);
        let Some(path) = path else {
            return done(Err(TreeError::NodeNotFound(node)));
        };

        let inner = Arc::clone(self);
        self.manager.open_channel(
            &self.peer,
            Box::new(move |result| {
                let channel = match result {
                    Ok(channel) => QueryChannel::new(channel),
                    Err(e) => return done(Err(e.into())),
                };
                let done = Arc::new(Mutex::new(Some(done)));
                let state = channel.channel.state();
                if state != ChannelState::Open {
                    let error = ChannelError::NotOpen(state).into();
                    return inner.finish_refresh(&channel, &done, Err(error));
                }
                {
                    let inner = Arc::clone(&inner);
                    let on_close = channel.clone();
                    let done = Arc::clone(&done);
                    channel
                        .channel
                        .add_close_listener(Box::new(move |error: Option<ChannelError>| {
                            let error = error.unwrap_or_else(|| {
                                ChannelError::Closed("closed by the remote peer".to_string())
                            });
                            inner.finish_refresh(&on_close, &done, Err(error.into()));
                        }));
                }
                let Some(fs) = channel.channel.file_system() else {
                    return inner.finish_refresh(&channel, &done, Err(TreeError::NoFileSystem));
                };

                let stat_path = path.clone();
                fs.stat(
                    &stat_path,
                    Box::new(move |result| {
                        if channel.is_settled() {
                            return;
                        }
                        let result = match result {
                            Ok(attrs) => {
                                inner.tree.write().set_attrs(node, attrs.clone());
                                Ok(attrs)
                            }
                            Err(source) => Err(TreeError::FileSystem { path, source }),
                        };
                        inner.finish_refresh(&channel, &done, result);
                    }),
                );
            }),
        );
    }

    fn finish_refresh(
        &self,
        channel: &QueryChannel,
        done: &Mutex<Option<TreeCallback<FileAttrs>>>,
        result: Result<FileAttrs, TreeError>,
    ) {
        if !channel.settle() {
            return;
        }
        self.manager.close_channel(&channel.channel);
        let done = done.lock().take();
        if let Some(done) = done {
            done(result);
        }
    }
}

async fn await_callback<T, F>(register: F) -> Result<T, TreeError>
where
    T: Send + 'static,
    F: FnOnce(TreeCallback<T>),
{
    let (tx, rx) = oneshot::channel();
    register(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.await
        .map_err(|_| TreeError::Dispatch(DispatchError::Shutdown))?
}
