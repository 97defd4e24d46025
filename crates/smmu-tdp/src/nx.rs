use indexmap::IndexSet;

use crate::NodeHandle;

/// Tracking list for the NX huge page mitigation.
///
/// Records nodes that exist only because an executable huge mapping was
/// vetoed, so a later sweep can zap them and let a future fault re-attempt
/// the huge mapping. This list only guarantees consistent membership; sweep
/// scheduling lives outside the core.
#[derive(Debug)]
pub struct NxHugePages {
    enabled: bool,
    tracked: IndexSet<NodeHandle>,
}

impl NxHugePages {
    /// Creates the list; `enabled` reflects the mitigation module parameter.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            tracked: IndexSet::new(),
        }
    }

    /// Checks whether the mitigation is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Tracks a node whose huge mapping was vetoed. Returns `true` if the
    /// node was newly tracked.
    pub fn track(&mut self, handle: NodeHandle) -> bool {
        self.tracked.insert(handle)
    }

    /// Removes a node from the list. Returns `true` if it was tracked.
    pub fn untrack(&mut self, handle: NodeHandle) -> bool {
        self.tracked.shift_remove(&handle)
    }

    /// Checks whether a node is on the list.
    pub fn is_tracked(&self, handle: NodeHandle) -> bool {
        self.tracked.contains(&handle)
    }

    /// Returns the number of tracked nodes.
    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    /// Checks whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Returns the tracked nodes in insertion order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        self.tracked.iter().copied()
    }
}
