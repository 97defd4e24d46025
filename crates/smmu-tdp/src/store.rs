use std::{collections::HashMap, sync::Arc};

use smallvec::SmallVec;
use smmu_core::Gfn;

use crate::{NodeHandle, NodeRole, ShadowNode};

/// Owner of all shadow page table nodes.
///
/// Nodes live in an arena addressed by stable handles. Beside the primary
/// (role, GFN) key map, an auxiliary per-GFN index enumerates every role
/// variant shadowing the same guest frame, which write-protection and
/// invalidation walk.
#[derive(Default)]
pub struct NodeStore {
    arena: Vec<Option<Arc<ShadowNode>>>,
    free: Vec<u32>,
    by_key: HashMap<(NodeRole, Gfn), NodeHandle>,
    by_gfn: HashMap<Gfn, SmallVec<[NodeHandle; 2]>>,
}

impl NodeStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live nodes.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Checks whether the store holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Looks up the node registered under (role, gfn).
    pub fn find(&self, role: &NodeRole, gfn: Gfn) -> Option<NodeHandle> {
        self.by_key.get(&(*role, gfn)).copied()
    }

    /// Registers a freshly created node, returning its handle.
    ///
    /// The node is reachable through the hash and the per-GFN index but
    /// carries reference count zero; the caller links it before it can be
    /// observed by a walk.
    pub fn insert(&mut self, node: ShadowNode) -> NodeHandle {
        debug_assert!(self.find(node.role(), node.gfn()).is_none());

        let key = (*node.role(), node.gfn());
        let gfn = node.gfn();
        let node = Arc::new(node);

        let handle = match self.free.pop() {
            Some(index) => {
                self.arena[index as usize] = Some(node);
                NodeHandle(index)
            }
            None => {
                self.arena.push(Some(node));
                NodeHandle((self.arena.len() - 1) as u32)
            }
        };

        self.by_key.insert(key, handle);
        self.by_gfn.entry(gfn).or_default().push(handle);

        handle
    }

    /// Resolves a handle to its node.
    pub fn get(&self, handle: NodeHandle) -> Option<&Arc<ShadowNode>> {
        self.arena.get(handle.0 as usize)?.as_ref()
    }

    /// Unlinks a node from the arena and both indexes.
    ///
    /// The returned `Arc` is the caller's to retire; lock-free walkers that
    /// already cloned it keep reading valid memory until the reclamation
    /// epoch closes.
    pub fn remove(&mut self, handle: NodeHandle) -> Option<Arc<ShadowNode>> {
        let node = self.arena.get_mut(handle.0 as usize)?.take()?;
        self.free.push(handle.0);

        self.by_key.remove(&(*node.role(), node.gfn()));

        if let Some(handles) = self.by_gfn.get_mut(&node.gfn()) {
            handles.retain(|&mut h| h != handle);
            if handles.is_empty() {
                self.by_gfn.remove(&node.gfn());
            }
        }

        Some(node)
    }

    /// Returns every node registered at `gfn`, across all roles.
    pub fn nodes_at(&self, gfn: Gfn) -> SmallVec<[NodeHandle; 2]> {
        self.by_gfn.get(&gfn).cloned().unwrap_or_default()
    }

    /// Returns the handles of all live nodes.
    pub fn handles(&self) -> Vec<NodeHandle> {
        self.by_key.values().copied().collect()
    }
}

impl std::fmt::Debug for NodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NodeStore")
            .field("nodes", &self.len())
            .field("gfns", &self.by_gfn.len())
            .finish()
    }
}
