//! Unsync propagation tracking.
//!
//! A guest page that is itself used as one of the guest's own translation
//! tables may be shadowed by several nodes (one per role variant).
//! Re-validating every derived node on every guest write would be
//! prohibitively slow, so one node is allowed to silently diverge
//! ("unsync") while the siblings stay write-protected and catch divergence
//! by trapping. Resynchronization replays only the children recorded in the
//! divergence bitmap.

use smmu_core::{Gfn, MemoryAccess, MemorySlots, NodeAllocator, TableEntry, TlbFlush};

use crate::{
    NodeHandle, ShadowMmu,
    mmu::MmuInner,
};

/// Outcome of an unsync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryUnsync {
    /// A node absorbs the divergence; the write may proceed untrapped.
    Unsynced,

    /// Unsyncing was refused; the page must stay write-protected and the
    /// write caught by trapping.
    MustWriteProtect,
}

impl<S, T, A> ShadowMmu<S, T, A>
where
    S: MemorySlots,
    T: TlbFlush,
    A: NodeAllocator,
{
    /// Decides whether a guest write to a tracked table page at `gfn` may
    /// proceed without re-validating every derived shadow node.
    ///
    /// `entry_index` is the table slot the write targets, when the caller
    /// can attribute the write to a single slot. `synchronizing` marks a
    /// caller that is itself mid-resync.
    pub fn try_unsync(
        &self,
        gfn: Gfn,
        entry_index: Option<usize>,
        synchronizing: bool,
        prefetch: bool,
    ) -> TryUnsync {
        let mut inner = self.lock_inner();

        // Write-flood accounting: real writes only.
        if !prefetch {
            for &handle in &inner.store.nodes_at(gfn) {
                if let Some(node) = inner.store.get(handle) {
                    if node.role().guest_mode {
                        node.flood_inc();
                    }
                }
            }
        }

        self.try_unsync_locked(&mut inner, gfn, entry_index, synchronizing, prefetch)
    }

    pub(crate) fn try_unsync_locked(
        &self,
        inner: &mut MmuInner,
        gfn: Gfn,
        entry_index: Option<usize>,
        synchronizing: bool,
        prefetch: bool,
    ) -> TryUnsync {
        let shadows: Vec<NodeHandle> = inner
            .store
            .nodes_at(gfn)
            .into_iter()
            .filter(|&handle| {
                inner
                    .store
                    .get(handle)
                    .is_some_and(|node| node.role().guest_mode)
            })
            .collect();

        // Nothing derived from this page; no bookkeeping to do.
        if shadows.is_empty() {
            return TryUnsync::Unsynced;
        }

        // An already-unsynced node absorbs further divergence, provided its
        // bitmap can track the new child.
        if let Some(&unsynced) = shadows.iter().find(|&&handle| {
            inner.store.get(handle).is_some_and(|node| node.unsynced())
        }) {
            let Some(index) = entry_index else {
                return TryUnsync::MustWriteProtect;
            };

            let node = inner.store.get(unsynced).expect("shadow handle is live");
            node.unsync_children().set(index);
            return TryUnsync::Unsynced;
        }

        // Refusals: mid-resync callers and resyncing siblings always win
        // the tie toward write protection; speculative prefetch never
        // creates new unsync state; an unattributable write cannot be
        // tracked by the bitmap.
        if synchronizing || inner.resyncing.contains(&gfn) || prefetch {
            return TryUnsync::MustWriteProtect;
        }

        let Some(index) = entry_index else {
            return TryUnsync::MustWriteProtect;
        };

        // Bias toward the node taking the most write faults.
        let victim = shadows
            .iter()
            .copied()
            .max_by_key(|&handle| inner.store.get(handle).map_or(0, |node| node.flood()))
            .expect("non-empty shadow set");

        let node = inner.store.get(victim).expect("shadow handle is live").clone();
        node.set_unsynced(true);
        node.unsync_children().set(index);

        // Divergence of the remaining siblings is caught by trapping.
        self.write_protect_frame_locked(inner, gfn);
        self.bump_generation();

        tracing::debug!(%victim, %gfn, index, "unsynced shadow node");

        TryUnsync::Unsynced
    }

    /// Resynchronizes the diverged children of an unsynced node.
    ///
    /// Walks only the children recorded in the divergence bitmap,
    /// re-deriving each entry from the guest translation it shadows and
    /// clearing the bit per child as it catches up.
    pub fn sync_children(&self, handle: NodeHandle) -> usize {
        let mut inner = self.lock_inner();

        let Some(node) = inner.store.get(handle).cloned() else {
            return 0;
        };

        if !node.unsynced() {
            return 0;
        }

        let level = node.role().level;
        inner.resyncing.insert(node.gfn());

        let mut synced = 0;
        for index in node.unsync_children().indices() {
            let old = node.entries().get(index);
            if old.is_leaf(level) {
                inner.rmap.remove(old.frame(), handle, index as u16);
            }

            let shadowed = node.shadowed_get(index).and_then(|(sgfn, access)| {
                let slot = self.slots.slot_for(sgfn)?;
                let host = self.slots.host_frame(&slot, sgfn)?;
                Some((sgfn, access, host))
            });

            let replacement = shadowed.map(|(sgfn, mut access, host)| {
                if !host.writable {
                    access.remove(MemoryAccess::W);
                }

                // Re-granting write access mid-sync still needs the unsync
                // tracker's consent.
                if access.contains(MemoryAccess::W)
                    && self.try_unsync_locked(&mut inner, sgfn, None, true, false)
                        == TryUnsync::MustWriteProtect
                {
                    access.remove(MemoryAccess::W);
                }

                TableEntry::leaf(host.hfn, access, level)
            });

            match replacement {
                Some(entry) => {
                    node.entries().set(index, entry);
                    inner.rmap.add(entry.frame(), handle, index as u16);
                }
                None => {
                    node.entries().set(index, TableEntry::INVALID);
                    node.shadowed_clear(index);
                }
            }

            self.tlb.flush_range(Self::entry_gfn(&node, index), level);
            node.unsync_children().clear(index);
            synced += 1;
        }

        node.set_unsynced(false);
        inner.resyncing.remove(&node.gfn());
        self.bump_generation();

        tracing::debug!(%handle, gfn = %node.gfn(), synced, "resynchronized node");

        synced
    }
}
