//! Arena of cached remote file system nodes.
//!
//! Nodes refer to their parent by id only; children are owned by the arena
//! and listed in order on the parent.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tcf_core::services::filesystem::{DirEntry, FileAttrs};

/// Identifier of a node within one [`RemoteTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

/// Node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Synthetic root whose children are the file system roots.
    SystemRoot,
    Root,
    Directory,
    File,
}

/// Children query state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryState {
    #[default]
    Unqueried,
    Querying,
    Queried,
}

/// A cached remote file system entry.
#[derive(Debug, Clone)]
pub struct RemoteNode {
    id: NodeId,
    name: String,
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    query_state: QueryState,
    attrs: Option<FileAttrs>,
    ghost: bool,
}

impl RemoteNode {
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn kind(&self) -> NodeKind {
        self.kind
    }

    #[must_use]
    pub const fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in listing order. Authoritative only once
    /// [`Self::children_queried`] is true.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    #[must_use]
    pub const fn query_state(&self) -> QueryState {
        self.query_state
    }

    #[must_use]
    pub const fn children_queried(&self) -> bool {
        matches!(self.query_state, QueryState::Queried)
    }

    #[must_use]
    pub const fn query_running(&self) -> bool {
        matches!(self.query_state, QueryState::Querying)
    }

    #[must_use]
    pub const fn attrs(&self) -> Option<&FileAttrs> {
        self.attrs.as_ref()
    }

    /// Materialized from stale data and not yet confirmed remotely.
    #[must_use]
    pub const fn is_ghost(&self) -> bool {
        self.ghost
    }

    /// Whether the node can have children.
    #[must_use]
    pub const fn is_container(&self) -> bool {
        !matches!(self.kind, NodeKind::File)
    }
}

/// Persistable copy of a subtree, used to restore ghost nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub attrs: Option<FileAttrs>,
    #[serde(default)]
    pub children: Vec<NodeSnapshot>,
}

/// Arena of [`RemoteNode`]s rooted at a synthetic system root.
#[derive(Debug, Clone)]
pub struct RemoteTree {
    nodes: HashMap<NodeId, RemoteNode>,
    root: NodeId,
    next_id: u64,
}

impl Default for RemoteTree {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteTree {
    /// Create a tree holding only the system root.
    #[must_use]
    pub fn new() -> Self {
        let root = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            RemoteNode {
                id: root,
                name: String::new(),
                kind: NodeKind::SystemRoot,
                parent: None,
                children: Vec::new(),
                query_state: QueryState::Unqueried,
                attrs: None,
                ghost: false,
            },
        );
        Self {
            nodes,
            root,
            next_id: 1,
        }
    }

    /// The system root.
    #[must_use]
    pub const fn root(&self) -> NodeId {
        self.root
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&RemoteNode> {
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Child nodes of `id` in listing order.
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = &RemoteNode> {
        self.nodes
            .get(&id)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|c| self.nodes.get(c))
    }

    /// Find a child by name. Windows-style trees compare case-insensitively.
    #[must_use]
    pub fn child_by_name(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let windows = self.is_windows(parent);
        self.children(parent)
            .find(|c| {
                if windows {
                    c.name.eq_ignore_ascii_case(name)
                } else {
                    c.name == name
                }
            })
            .map(|c| c.id)
    }

    /// The root an entry belongs to (`None` for the system root).
    #[must_use]
    pub fn root_of(&self, id: NodeId) -> Option<NodeId> {
        let mut current = self.nodes.get(&id)?;
        loop {
            match current.kind {
                NodeKind::SystemRoot => return None,
                NodeKind::Root => return Some(current.id),
                NodeKind::Directory | NodeKind::File => {
                    current = self.nodes.get(&current.parent?)?;
                }
            }
        }
    }

    /// Whether the node lives under a root using `\` separators.
    #[must_use]
    pub fn is_windows(&self, id: NodeId) -> bool {
        self.root_of(id)
            .and_then(|r| self.nodes.get(&r))
            .is_some_and(|r| r.name.ends_with('\\'))
    }

    /// Remote path of a node. The system root has no path.
    #[must_use]
    pub fn path(&self, id: NodeId) -> Option<String> {
        let node = self.nodes.get(&id)?;
        match node.kind {
            NodeKind::SystemRoot => None,
            NodeKind::Root => Some(node.name.clone()),
            NodeKind::Directory | NodeKind::File => {
                let parent = self.nodes.get(&node.parent?)?;
                let mut path = self.path(parent.id)?;
                if parent.kind != NodeKind::Root {
                    path.push(if self.is_windows(id) { '\\' } else { '/' });
                }
                path.push_str(&node.name);
                Some(path)
            }
        }
    }

    /// Capture the subtree at `id`. Children are included only when they
    /// have been queried.
    #[must_use]
    pub fn snapshot(&self, id: NodeId) -> Option<NodeSnapshot> {
        let node = self.nodes.get(&id)?;
        let children = if node.children_queried() || node.ghost {
            node.children
                .iter()
                .filter_map(|c| self.snapshot(*c))
                .collect()
        } else {
            Vec::new()
        };
        Some(NodeSnapshot {
            name: node.name.clone(),
            kind: node.kind,
            attrs: node.attrs.clone(),
            children,
        })
    }

    /// Materialize `snapshot` below `parent` as ghost nodes.
    ///
    /// Entries that already exist are kept and only their missing children
    /// are added. Returns the id of the node matching the snapshot.
    pub fn restore(&mut self, parent: NodeId, snapshot: &NodeSnapshot) -> Option<NodeId> {
        self.nodes.get(&parent)?;
        let id = match self.child_by_name(parent, &snapshot.name) {
            Some(existing) => existing,
            None => {
                let id =
                    self.add_child(parent, &snapshot.name, snapshot.kind, snapshot.attrs.clone());
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.ghost = true;
                }
                id
            }
        };
        for child in &snapshot.children {
            self.restore(id, child);
        }
        Some(id)
    }

    pub(crate) fn set_query_state(&mut self, id: NodeId, state: QueryState) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.query_state = state;
        }
    }

    pub(crate) fn set_attrs(&mut self, id: NodeId, attrs: FileAttrs) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.attrs = Some(attrs);
            node.ghost = false;
        }
    }

    fn add_child(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        attrs: Option<FileAttrs>,
    ) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            RemoteNode {
                id,
                name: name.to_string(),
                kind,
                parent: Some(parent),
                children: Vec::new(),
                query_state: QueryState::Unqueried,
                attrs,
                ghost: false,
            },
        );
        if let Some(parent) = self.nodes.get_mut(&parent) {
            parent.children.push(id);
        }
        id
    }

    /// Merge one page of listing into `parent`'s children.
    ///
    /// Known entries keep their id and get fresh attributes; new entries are
    /// appended. Returns the ids of every entry in the page.
    pub(crate) fn merge_entries(&mut self, parent: NodeId, entries: Vec<DirEntry>) -> Vec<NodeId> {
        let Some(parent_kind) = self.nodes.get(&parent).map(|n| n.kind) else {
            return Vec::new();
        };
        let mut seen = Vec::with_capacity(entries.len());
        for entry in entries {
            let kind = if parent_kind == NodeKind::SystemRoot {
                NodeKind::Root
            } else if entry.attrs.is_directory() {
                NodeKind::Directory
            } else {
                NodeKind::File
            };
            let id = match self.child_by_name(parent, &entry.filename) {
                Some(existing) => {
                    if let Some(node) = self.nodes.get_mut(&existing) {
                        if node.kind != kind {
                            node.kind = kind;
                            self.clear_children(existing);
                        }
                    }
                    self.set_attrs(existing, entry.attrs);
                    existing
                }
                None => self.add_child(parent, &entry.filename, kind, Some(entry.attrs)),
            };
            seen.push(id);
        }
        seen
    }

    /// Drop every child of `parent` not in `seen`.
    pub(crate) fn retain_children(&mut self, parent: NodeId, seen: &HashSet<NodeId>) {
        let Some(node) = self.nodes.get(&parent) else {
            return;
        };
        let stale: Vec<NodeId> = node
            .children
            .iter()
            .copied()
            .filter(|c| !seen.contains(c))
            .collect();
        for id in stale {
            self.remove(id);
        }
    }

    /// Remove a node and its subtree. The system root cannot be removed.
    pub(crate) fn remove(&mut self, id: NodeId) {
        if id == self.root {
            return;
        }
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        if let Some(parent) = node.parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }
        for child in node.children {
            self.remove_subtree(child);
        }
    }

    fn clear_children(&mut self, id: NodeId) {
        let children = self
            .nodes
            .get_mut(&id)
            .map(|n| {
                n.query_state = QueryState::Unqueried;
                std::mem::take(&mut n.children)
            })
            .unwrap_or_default();
        for child in children {
            self.remove_subtree(child);
        }
    }

    fn remove_subtree(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            for child in node.children {
                self.remove_subtree(child);
            }
        }
    }
}
