use std::collections::HashMap;

use smallvec::SmallVec;
use smmu_core::Hfn;

use crate::NodeHandle;

/// One shadow table entry currently translating to a host frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RmapSlot {
    /// The node holding the entry.
    pub node: NodeHandle,

    /// The entry's index within the node.
    pub index: u16,
}

/// Reverse mapping from a host frame to every leaf entry pointing at it.
///
/// Supports revoking write access to a frame in one pass and counting how
/// many translations alias it. Every slot refers to a live node whose entry
/// at that index currently translates to the frame; removing the last slot
/// for a frame empties the bucket.
#[derive(Debug, Default)]
pub struct ReverseMap {
    map: HashMap<Hfn, SmallVec<[RmapSlot; 4]>>,
}

impl ReverseMap {
    /// Creates an empty reverse map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `node`'s entry at `index` translates to `hfn`.
    pub fn add(&mut self, hfn: Hfn, node: NodeHandle, index: u16) {
        let bucket = self.map.entry(hfn).or_default();
        debug_assert!(!bucket.contains(&RmapSlot { node, index }));
        bucket.push(RmapSlot { node, index });
    }

    /// Removes the record for `node`'s entry at `index`.
    pub fn remove(&mut self, hfn: Hfn, node: NodeHandle, index: u16) -> bool {
        let Some(bucket) = self.map.get_mut(&hfn) else {
            return false;
        };

        let before = bucket.len();
        bucket.retain(|slot| !(slot.node == node && slot.index == index));
        let removed = bucket.len() != before;

        if bucket.is_empty() {
            self.map.remove(&hfn);
        }

        removed
    }

    /// Returns the entries currently mapping `hfn`.
    pub fn slots(&self, hfn: Hfn) -> SmallVec<[RmapSlot; 4]> {
        self.map.get(&hfn).cloned().unwrap_or_default()
    }

    /// Returns how many translations alias `hfn`.
    pub fn alias_count(&self, hfn: Hfn) -> usize {
        self.map.get(&hfn).map_or(0, SmallVec::len)
    }

    /// Returns the number of mapped frames.
    pub fn frames(&self) -> usize {
        self.map.len()
    }
}
