//! Ancestor chain and resolution cache for one top-level resolution.
//!
//! Nodes live in an append-only arena owned by the tree; each node records the
//! index of the node whose link caused it, so an ancestor check is a walk up
//! parent indices. A [`ResolutionContext`] is a cheap handle naming one node;
//! deriving a child never mutates the parent handle, so sibling links can be
//! resolved concurrently from the same context.
//!
//! The cache maps a key (file path, plus `#subpath` for sections) to a shared
//! in-flight or finished resolution. Lookups that join an existing entry are
//! recorded in a waits-for graph; joining an entry that is itself (transitively)
//! waiting on the caller would never finish, and is reported as a cycle instead.
//!
//! A cached result is only handed to another branch when that branch would
//! have computed the same text: nothing in it was cut short by an ancestor
//! cycle or the depth limit, none of the files it followed is an ancestor of
//! the new branch, and its links still fit under the depth limit there.

use chrono::Utc;
use flume::Sender;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{ResolutionEvent, ResolutionEventKind};

/// A finished resolution and what it depended on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    pub text: String,
    /// Files followed while producing `text`, the producing file included.
    pub visited: BTreeSet<String>,
    /// Deepest level below the producing node at which links were followed.
    pub link_depth: Option<usize>,
    /// Shaped by an ancestor cycle or the depth limit.
    pub branch_dependent: bool,
}

/// Outcome of a cached resolution. The error is shared so every waiter sees it.
pub type ResolutionResult = Result<Resolved, Arc<anyhow::Error>>;

pub type SharedResolution = Shared<BoxFuture<'static, ResolutionResult>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One visit of a file along one resolution branch. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionNode {
    pub id: NodeId,
    pub path: String,
    /// Cache key of the computation this node belongs to.
    pub key: String,
    pub parent: Option<NodeId>,
    pub depth: usize,
}

struct CacheEntry {
    generation: u64,
    future: SharedResolution,
}

/// What the output of one node turned out to depend on.
#[derive(Default)]
struct NodeTrace {
    visited: BTreeSet<String>,
    link_depth: Option<usize>,
    branch_dependent: bool,
}

#[derive(Default)]
struct TreeState {
    nodes: Vec<ResolutionNode>,
    traces: Vec<NodeTrace>,
    cache: HashMap<String, CacheEntry>,
    next_generation: u64,
    /// waiter key -> awaited key -> number of outstanding waits
    waits: HashMap<String, HashMap<String, usize>>,
}

impl TreeState {
    fn is_ancestor(&self, node: NodeId, path: &str) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            let node = &self.nodes[id.0];
            if node.path == path {
                return true;
            }
            current = node.parent;
        }
        false
    }

    /// Whether the computation for `from` (transitively) waits on `to`.
    fn waits_on(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(key) = stack.pop() {
            if key == to {
                return true;
            }
            if !seen.insert(key) {
                continue;
            }
            if let Some(next) = self.waits.get(key) {
                stack.extend(next.keys().map(String::as_str));
            }
        }
        false
    }

    fn add_wait(&mut self, waiter: &str, key: &str) {
        *self
            .waits
            .entry(waiter.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert(0) += 1;
    }
}

struct ResolutionTree {
    run_id: Uuid,
    root_path: String,
    state: Mutex<TreeState>,
    events: Option<Sender<ResolutionEvent>>,
}

impl ResolutionTree {
    fn state(&self) -> MutexGuard<'_, TreeState> {
        // State is only touched between suspension points; a panic elsewhere
        // cannot leave it half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, kind: ResolutionEventKind) {
        if let Some(events) = &self.events {
            let _ = events.send(ResolutionEvent {
                run_id: self.run_id,
                at: Utc::now(),
                kind,
            });
        }
    }
}

/// Result of asking the cache for a key.
pub enum CacheClaim {
    /// No entry existed; the supplied computation was stored and must be awaited.
    Fresh(SharedResolution),
    /// Another branch already started this computation.
    Joined(SharedResolution),
    /// The existing computation is waiting on the caller; awaiting it would hang.
    Cycle,
}

/// The active node of one resolution branch plus the tree it belongs to.
#[derive(Clone)]
pub struct ResolutionContext {
    tree: Arc<ResolutionTree>,
    node: NodeId,
}

impl ResolutionContext {
    /// Start a new top-level resolution rooted at `root_path`.
    pub fn root(root_path: impl Into<String>) -> Self {
        Self::build(root_path.into(), None)
    }

    /// Like [`root`](Self::root), reporting tree growth on `events`.
    pub fn root_with_events(root_path: impl Into<String>, events: Sender<ResolutionEvent>) -> Self {
        Self::build(root_path.into(), Some(events))
    }

    fn build(root_path: String, events: Option<Sender<ResolutionEvent>>) -> Self {
        let root = ResolutionNode {
            id: NodeId(0),
            path: root_path.clone(),
            key: root_path.clone(),
            parent: None,
            depth: 0,
        };
        let tree = Arc::new(ResolutionTree {
            run_id: Uuid::new_v4(),
            root_path: root_path.clone(),
            state: Mutex::new(TreeState {
                nodes: vec![root],
                traces: vec![NodeTrace::default()],
                ..TreeState::default()
            }),
            events,
        });
        tree.emit(ResolutionEventKind::NodeEntered {
            node: NodeId(0),
            parent: None,
            path: root_path,
            depth: 0,
        });
        Self {
            tree,
            node: NodeId(0),
        }
    }

    /// A context whose active node is a new child of this one.
    pub fn child(&self, path: impl Into<String>, key: impl Into<String>) -> Self {
        let path = path.into();
        let (id, depth) = {
            let mut state = self.tree.state();
            let depth = state.nodes[self.node.0].depth + 1;
            let id = NodeId(state.nodes.len());
            state.nodes.push(ResolutionNode {
                id,
                path: path.clone(),
                key: key.into(),
                parent: Some(self.node),
                depth,
            });
            state.traces.push(NodeTrace::default());
            (id, depth)
        };
        self.tree.emit(ResolutionEventKind::NodeEntered {
            node: id,
            parent: Some(self.node),
            path,
            depth,
        });
        Self {
            tree: self.tree.clone(),
            node: id,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.tree.run_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn node(&self) -> ResolutionNode {
        self.tree.state().nodes[self.node.0].clone()
    }

    pub fn depth(&self) -> usize {
        self.tree.state().nodes[self.node.0].depth
    }

    pub fn path(&self) -> String {
        self.tree.state().nodes[self.node.0].path.clone()
    }

    pub fn root_path(&self) -> &str {
        &self.tree.root_path
    }

    /// Paths from the active node up to the root, nearest first.
    pub fn ancestors(&self) -> Vec<String> {
        let state = self.tree.state();
        let mut paths = Vec::new();
        let mut current = Some(self.node);
        while let Some(id) = current {
            let node = &state.nodes[id.0];
            paths.push(node.path.clone());
            current = node.parent;
        }
        paths
    }

    /// Whether `path` is being resolved by this node or one of its ancestors.
    pub fn is_ancestor(&self, path: &str) -> bool {
        self.tree.state().is_ancestor(self.node, path)
    }

    /// Record that this node followed links at its own level.
    pub fn note_links(&self) {
        let mut state = self.tree.state();
        let trace = &mut state.traces[self.node.0];
        trace.link_depth = trace.link_depth.max(Some(0));
    }

    /// Record a child's result as part of this node's output.
    pub fn absorb(&self, child: &Resolved) {
        let mut state = self.tree.state();
        let trace = &mut state.traces[self.node.0];
        trace.visited.extend(child.visited.iter().cloned());
        trace.link_depth = trace.link_depth.max(child.link_depth.map(|depth| depth + 1));
    }

    /// Mark this node and its ancestors as shaped by their position in the
    /// tree. With `until`, stop below the nearest ancestor with that path:
    /// a cycle back to a file looks the same from wherever that file starts.
    pub fn mark_branch_dependent(&self, until: Option<&str>) {
        let mut state = self.tree.state();
        let mut current = Some(self.node);
        while let Some(id) = current {
            if until.is_some_and(|path| state.nodes[id.0].path == path) {
                break;
            }
            state.traces[id.0].branch_dependent = true;
            current = state.nodes[id.0].parent;
        }
    }

    /// Package `text` produced by this node together with its trace.
    pub fn finish(&self, text: String) -> Resolved {
        let state = self.tree.state();
        let trace = &state.traces[self.node.0];
        let mut visited = trace.visited.clone();
        visited.insert(state.nodes[self.node.0].path.clone());
        Resolved {
            text,
            visited,
            link_depth: trace.link_depth,
            branch_dependent: trace.branch_dependent,
        }
    }

    /// Whether `resolved`, produced on another branch, is what a child of
    /// this node would produce itself.
    pub fn can_reuse(&self, resolved: &Resolved, max_depth: usize) -> bool {
        if resolved.branch_dependent {
            return false;
        }
        let state = self.tree.state();
        let child_depth = state.nodes[self.node.0].depth + 1;
        if resolved
            .link_depth
            .is_some_and(|depth| child_depth + depth >= max_depth)
        {
            return false;
        }
        !resolved
            .visited
            .iter()
            .any(|path| state.is_ancestor(self.node, path))
    }

    /// Every node created so far, in creation order.
    pub fn nodes(&self) -> Vec<ResolutionNode> {
        self.tree.state().nodes.clone()
    }

    pub fn cache_lookup(&self, key: &str) -> Option<SharedResolution> {
        self.tree
            .state()
            .cache
            .get(key)
            .map(|entry| entry.future.clone())
    }

    pub fn cache_store(&self, key: impl Into<String>, future: SharedResolution) {
        let mut state = self.tree.state();
        state.next_generation += 1;
        let generation = state.next_generation;
        state
            .cache
            .insert(key.into(), CacheEntry { generation, future });
    }

    pub fn cache_evict(&self, key: &str) {
        self.tree.state().cache.remove(key);
    }

    pub fn cache_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.tree.state().cache.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Look up `key`, storing `make`'s computation if absent, as one step.
    ///
    /// `make` runs under the tree lock and must only build the future. It
    /// receives a handle that evicts exactly the entry being created, so a
    /// failed computation can drop itself without touching a later retry.
    /// Every `Fresh`/`Joined` claim must be paired with [`release`](Self::release).
    pub fn claim<F>(&self, key: &str, make: F) -> CacheClaim
    where
        F: FnOnce(CacheEviction) -> BoxFuture<'static, ResolutionResult>,
    {
        let waiter = self.node().key;
        let mut state = self.tree.state();

        if let Some(entry) = state.cache.get(key) {
            let future = entry.future.clone();
            if state.waits_on(key, &waiter) {
                return CacheClaim::Cycle;
            }
            state.add_wait(&waiter, key);
            return CacheClaim::Joined(future);
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let eviction = CacheEviction {
            tree: self.tree.clone(),
            key: key.to_string(),
            generation,
        };
        let future = make(eviction).shared();
        state.cache.insert(
            key.to_string(),
            CacheEntry {
                generation,
                future: future.clone(),
            },
        );
        state.add_wait(&waiter, key);
        CacheClaim::Fresh(future)
    }

    /// Drop the waits-for edge recorded by [`claim`](Self::claim).
    pub fn release(&self, key: &str) {
        let waiter = self.node().key;
        let mut state = self.tree.state();
        if let Some(targets) = state.waits.get_mut(&waiter) {
            if let Some(count) = targets.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    targets.remove(key);
                }
            }
            if targets.is_empty() {
                state.waits.remove(&waiter);
            }
        }
    }

    pub fn emit(&self, kind: ResolutionEventKind) {
        self.tree.emit(kind);
    }
}

/// Removes one specific cache entry, if it is still the current one for its key.
pub struct CacheEviction {
    tree: Arc<ResolutionTree>,
    key: String,
    generation: u64,
}

impl CacheEviction {
    pub fn evict(&self) {
        let mut state = self.tree.state();
        if state
            .cache
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            state.cache.remove(&self.key);
        }
    }
}
