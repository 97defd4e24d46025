use std::{
    collections::BTreeMap,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    sync::Arc,
};

use crate::ShadowNode;

/// Number of retirements after which reclamation runs opportunistically.
pub const RECLAIM_BATCH: usize = 64;

struct Retired {
    epoch: u64,
    node: Arc<ShadowNode>,
}

/// Deferred reclamation of unlinked shadow nodes.
///
/// A lock-free walker may still hold a view of a node after the mutator
/// unlinked it. Walkers open an epoch with [`begin`] before observing any
/// node and close it by dropping the guard; [`retire`] queues an unlinked,
/// zero-refcount node under the current epoch, and [`reclaim`] frees only
/// the nodes whose epoch precedes every still-open walker.
///
/// [`begin`]: ReclaimQueue::begin
/// [`retire`]: ReclaimQueue::retire
/// [`reclaim`]: ReclaimQueue::reclaim
#[derive(Default)]
pub struct ReclaimQueue {
    epoch: AtomicU64,
    active: Mutex<BTreeMap<u64, usize>>,
    retired: Mutex<Vec<Retired>>,
}

/// An open walker epoch. Nodes retired after this guard was taken are not
/// freed until the guard drops.
pub struct EpochGuard<'a> {
    queue: &'a ReclaimQueue,
    epoch: u64,
}

impl ReclaimQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_active(&self) -> MutexGuard<'_, BTreeMap<u64, usize>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_retired(&self) -> MutexGuard<'_, Vec<Retired>> {
        self.retired.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens a walker epoch.
    pub fn begin(&self) -> EpochGuard<'_> {
        let epoch = self.epoch.load(Ordering::Acquire);
        *self.lock_active().entry(epoch).or_insert(0) += 1;
        EpochGuard { queue: self, epoch }
    }

    /// Hands off an unlinked, zero-refcount node for deferred release.
    ///
    /// A node with attached children must never be retired; children are
    /// detached first.
    pub fn retire(&self, node: Arc<ShadowNode>) {
        debug_assert_eq!(node.refs().get(), 0, "retiring a referenced node");

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(gfn = %node.gfn(), epoch, "retiring node");

        let mut retired = self.lock_retired();
        retired.push(Retired { epoch, node });

        if retired.len() >= RECLAIM_BATCH {
            drop(retired);
            self.reclaim();
        }
    }

    /// Frees every retired node whose epoch has closed. Returns the number
    /// of nodes freed.
    pub fn reclaim(&self) -> usize {
        let min_active = self.lock_active().keys().next().copied().unwrap_or(u64::MAX);

        let mut retired = self.lock_retired();
        let before = retired.len();
        retired.retain(|entry| entry.epoch > min_active);
        let freed = before - retired.len();

        if freed > 0 {
            tracing::debug!(freed, pending = retired.len(), "reclaimed nodes");
        }

        freed
    }

    /// Returns the number of nodes awaiting reclamation.
    pub fn pending(&self) -> usize {
        self.lock_retired().len()
    }

    /// Drains the queue synchronously. Called before the owning structure
    /// is dropped; every walker must have finished.
    pub fn shutdown(&self) {
        debug_assert!(
            self.lock_active().is_empty(),
            "shutdown with open walker epochs"
        );
        self.lock_retired().clear();
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.queue.lock_active();
        match active.get_mut(&self.epoch) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                active.remove(&self.epoch);
            }
            None => debug_assert!(false, "unbalanced epoch guard"),
        }
    }
}

impl std::fmt::Debug for ReclaimQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ReclaimQueue")
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .field("pending", &self.pending())
            .finish()
    }
}
