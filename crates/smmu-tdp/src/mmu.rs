//! The shadow MMU proper: root management, fault resolution and the
//! structural mutations that keep the tree, the reverse map and the
//! trackers consistent.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use smallvec::SmallVec;
use smmu_core::{
    Gfn, Hfn, HostFrame, MemoryAccess, MemorySlot, MemorySlots, MmuError, NodeAllocator,
    PageLevel, TableEntry, TlbFlush, gfn_round_for_level,
};

use crate::{
    Fault, FaultDisposition, NodeHandle, NodeRole, NodeStore, NxHugePages, ReclaimQueue,
    ReverseMap, ShadowNode, TryUnsync,
};

/// Tunables fixed at MMU construction.
#[derive(Debug, Clone)]
pub struct MmuConfig {
    /// Largest leaf granularity the MMU will ever install.
    pub max_huge_level: PageLevel,

    /// Whether executable huge mappings are vetoed and split.
    pub nx_huge_pages: bool,

    /// GFN bits that select an address alias on direct roots; stripped
    /// before slot resolution so aliases share translations.
    pub direct_gfn_mask: u64,
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            max_huge_level: PageLevel::Pdpt,
            nx_huge_pages: true,
            direct_gfn_mask: 0,
        }
    }
}

/// The location of one parent entry pointing at a child node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParentLink {
    pub node: NodeHandle,
    pub index: u16,
}

/// Structural state guarded by the MMU lock.
pub(crate) struct MmuInner {
    pub store: NodeStore,
    pub rmap: ReverseMap,

    /// For each node, the parent entries pointing at it. Mirrors the
    /// forward links so teardown never scans the arena.
    pub parents: HashMap<NodeHandle, SmallVec<[ParentLink; 1]>>,

    pub nx: NxHugePages,

    /// Active roots by role.
    pub roots: HashMap<NodeRole, NodeHandle>,

    /// Frames pinned read-only by external trackers.
    pub write_protected: HashSet<Gfn>,

    /// Guest table GFNs currently being resynchronized.
    pub resyncing: HashSet<Gfn>,
}

/// A shadow / two-dimensional paging MMU over an external slot registry.
///
/// `S` resolves guest frames to host backing, `T` performs TLB shootdowns
/// and `A` allocates zeroed tables. Structural mutations serialize on one
/// internal lock; the in-place fast path never takes it.
pub struct ShadowMmu<S, T, A> {
    pub(crate) slots: S,
    pub(crate) tlb: T,
    pub(crate) alloc: A,
    pub(crate) config: MmuConfig,
    pub(crate) inner: Mutex<MmuInner>,

    /// Bumped on every invalidating mutation. Lock-free observers snapshot
    /// it and discard anything seen across a bump.
    pub(crate) generation: AtomicU64,

    pub(crate) reclaim: ReclaimQueue,
}

impl<S, T, A> ShadowMmu<S, T, A>
where
    S: MemorySlots,
    T: TlbFlush,
    A: NodeAllocator,
{
    /// Creates an MMU with no roots and an empty tree.
    pub fn new(slots: S, tlb: T, alloc: A, config: MmuConfig) -> Self {
        let nx_huge_pages = config.nx_huge_pages;

        Self {
            slots,
            tlb,
            alloc,
            config,
            inner: Mutex::new(MmuInner {
                store: NodeStore::new(),
                rmap: ReverseMap::new(),
                parents: HashMap::new(),
                nx: NxHugePages::new(nx_huge_pages),
                roots: HashMap::new(),
                write_protected: HashSet::new(),
                resyncing: HashSet::new(),
            }),
            generation: AtomicU64::new(0),
            reclaim: ReclaimQueue::new(),
        }
    }

    /// Returns the slot registry the MMU was built over.
    pub fn slots(&self) -> &S {
        &self.slots
    }

    /// Returns the deferred reclamation queue.
    pub fn reclaim_queue(&self) -> &ReclaimQueue {
        &self.reclaim
    }

    /// Returns the current invalidation generation.
    pub fn snapshot(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, MmuInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the node behind `handle`, if it is still live.
    pub fn node(&self, handle: NodeHandle) -> Option<Arc<ShadowNode>> {
        self.lock_inner().store.get(handle).cloned()
    }

    /// Returns the handles of every live node.
    pub fn node_handles(&self) -> Vec<NodeHandle> {
        self.lock_inner().store.handles()
    }

    /// Returns the number of live nodes.
    pub fn node_count(&self) -> usize {
        self.lock_inner().store.len()
    }

    /// Returns every node shadowing `gfn`, across role variants.
    pub fn nodes_at(&self, gfn: Gfn) -> Vec<NodeHandle> {
        self.lock_inner().store.nodes_at(gfn).to_vec()
    }

    /// Returns the reverse-map slots for a host frame.
    pub fn rmap_slots(&self, hfn: Hfn) -> Vec<crate::RmapSlot> {
        self.lock_inner().rmap.slots(hfn).to_vec()
    }

    /// Returns how many shadow entries alias a host frame.
    pub fn alias_count(&self, hfn: Hfn) -> usize {
        self.lock_inner().rmap.alias_count(hfn)
    }

    /// Checks whether `handle` is on the NX huge page recovery list.
    pub fn nx_tracked(&self, handle: NodeHandle) -> bool {
        self.lock_inner().nx.is_tracked(handle)
    }

    /// Returns the length of the NX huge page recovery list.
    pub fn nx_count(&self) -> usize {
        self.lock_inner().nx.len()
    }

    /// Returns the active root for `role`, if one exists.
    pub fn root(&self, role: &NodeRole) -> Option<NodeHandle> {
        self.lock_inner().roots.get(role).copied()
    }

    /// Allocates (or revives) a root node for `role` and takes a root
    /// reference on it.
    pub fn alloc_root(&self, role: NodeRole, gfn: Gfn) -> Result<NodeHandle, MmuError> {
        let mut inner = self.lock_inner();

        let handle = match inner.store.find(&role, gfn) {
            Some(handle) => handle,
            None => self.create_node(&mut inner, role, gfn)?,
        };

        // One root reference per roots-map entry: re-allocating the same
        // root is a no-op, and a superseded root drops its reference.
        if inner.roots.get(&role) == Some(&handle) {
            return Ok(handle);
        }

        inner.store.get(handle).expect("root registered above").refs().inc();
        if let Some(previous) = inner.roots.insert(role, handle) {
            if let Some(node) = inner.store.get(previous).cloned() {
                if node.refs().dec() == 0 {
                    self.free_node_locked(&mut inner, previous);
                }
            }
        }

        tracing::debug!(%handle, %gfn, level = ?role.level, direct = role.direct, "allocated root");

        Ok(handle)
    }

    /// Drops the root reference on `handle`, tearing down the subtree if it
    /// was the last reference.
    pub fn free_root(&self, handle: NodeHandle) {
        let mut inner = self.lock_inner();

        inner.roots.retain(|_, &mut root| root != handle);

        if let Some(node) = inner.store.get(handle).cloned() {
            if node.refs().dec() == 0 {
                self.free_node_locked(&mut inner, handle);
            }
        }

        self.bump_generation();
    }

    /// Drops one reference on `handle`, tearing the node down at zero.
    pub fn release(&self, handle: NodeHandle) {
        let mut inner = self.lock_inner();

        if let Some(node) = inner.store.get(handle).cloned() {
            if node.refs().dec() == 0 {
                self.free_node_locked(&mut inner, handle);
                self.bump_generation();
            }
        }
    }

    /// Resolves a guest fault against the tree rooted at `root`.
    ///
    /// The fault descriptor is filled in as resolution progresses (slot,
    /// host backing, level decisions) so the caller can inspect what was
    /// decided regardless of the disposition.
    pub fn resolve_fault(
        &self,
        root: NodeHandle,
        fault: &mut Fault,
    ) -> Result<FaultDisposition, MmuError> {
        let _walk = self.reclaim.begin();

        // Classify against the root's role.
        {
            let inner = self.lock_inner();
            let root_node = inner.store.get(root).ok_or(MmuError::RootNotPresent)?;

            fault.is_direct = root_node.role().direct;
            fault.nx_huge_page_workaround_enabled = inner.nx.enabled();

            // The slot registry has no notion of address aliases.
            if fault.is_direct && !root_node.role().mirror {
                fault.gfn = Gfn(fault.gfn.0 & !self.config.direct_gfn_mask);
            }
        }

        fault.max_level = self.config.max_huge_level;
        fault.snapshot = self.snapshot();

        fault.slot = self.slots.slot_for(fault.gfn);
        let Some(slot) = fault.slot.clone() else {
            // Unbacked space is the emulated-MMIO path.
            return self.emulate(fault);
        };

        if (fault.write && !slot.access.contains(MemoryAccess::W))
            || (fault.exec && !slot.access.contains(MemoryAccess::X))
        {
            return self.emulate(fault);
        }

        // Cheap spurious detection before faulting in the host page.
        match self.fast_probe(root, fault) {
            FaultDisposition::Continue | FaultDisposition::Invalid => {}
            disposition => return Ok(disposition),
        }

        // Fault in the backing page without holding the structural lock.
        fault.host = self.slots.host_frame(&slot, fault.gfn);
        let Some(host) = fault.host else {
            return Ok(FaultDisposition::Retry);
        };

        if fault.write && !host.writable {
            return self.emulate(fault);
        }

        self.hugepage_adjust(fault, &slot, &host);

        let mut inner = self.lock_inner();

        // The tree may have been invalidated while the lock was dropped.
        if self.snapshot() != fault.snapshot {
            tracing::debug!(gfn = %fault.gfn, "translation snapshot went stale");
            return Ok(FaultDisposition::Retry);
        }

        if fault.write && inner.write_protected.contains(&fault.gfn) {
            return Ok(FaultDisposition::WriteProtected);
        }

        let disposition = self.walk_and_install(&mut inner, root, fault, host)?;
        drop(inner);

        if disposition == FaultDisposition::Emulate && fault.is_private {
            tracing::warn!(gfn = %fault.gfn, "emulation requested on private memory");
            return Err(MmuError::PrivateMemoryEmulation(fault.gfn));
        }

        Ok(disposition)
    }

    fn emulate(&self, fault: &Fault) -> Result<FaultDisposition, MmuError> {
        if fault.is_private {
            tracing::warn!(gfn = %fault.gfn, "emulation requested on private memory");
            return Err(MmuError::PrivateMemoryEmulation(fault.gfn));
        }

        Ok(FaultDisposition::Emulate)
    }

    /// In-place fast path: walks the tree without the structural lock and
    /// reports whether the fault is already satisfied.
    ///
    /// `fault.snapshot` must hold a generation observed by the caller; any
    /// bump invalidates the probe. The structural lock is only probed, never
    /// waited on, so this path cannot block.
    pub fn fast_probe(&self, root: NodeHandle, fault: &Fault) -> FaultDisposition {
        let _walk = self.reclaim.begin();

        if self.snapshot() != fault.snapshot {
            return FaultDisposition::Retry;
        }

        // A held lock means a mutation is in flight; anything observed now
        // could be torn relative to the rmap and trackers.
        let Ok(inner) = self.inner.try_lock() else {
            return FaultDisposition::Retry;
        };

        let Some(mut node) = inner.store.get(root).cloned() else {
            return FaultDisposition::Invalid;
        };
        let mut level = node.role().level;

        loop {
            let index = level.table_index(fault.gfn);
            let entry = node.entries().get(index);

            if !entry.present() {
                return FaultDisposition::Continue;
            }

            if entry.is_leaf(level) {
                // Re-validate the snapshot before trusting the observation.
                if self.snapshot() != fault.snapshot {
                    return FaultDisposition::Retry;
                }

                let satisfied = (!fault.write || entry.writable())
                    && (!fault.exec || entry.executable());

                return if satisfied {
                    FaultDisposition::Spurious
                } else {
                    FaultDisposition::Continue
                };
            }

            let child = NodeHandle(entry.child_index() as u32);
            match inner.store.get(child) {
                Some(next) if Some(next.role().level) == level.next() => {
                    node = next.clone();
                }
                _ => return FaultDisposition::Invalid,
            }

            level = level.next().expect("non-leaf entry at leaf level");
        }
    }

    /// Computes the largest leaf level permitted at `gfn`: bounded by the
    /// configured ceiling, the host backing granularity and the slot bounds.
    pub fn max_mapping_level(&self, slot: &MemorySlot, gfn: Gfn) -> PageLevel {
        let mut level = self
            .config
            .max_huge_level
            .min(self.slots.max_mapping_level(slot, gfn));

        // A leaf must fit inside the slot.
        while level > PageLevel::Pt {
            let base = gfn_round_for_level(gfn, level);
            if slot.contains(base) && slot.contains(Gfn(base.0 + level.pages() - 1)) {
                break;
            }

            level = level.next().expect("level above Pt");
        }

        level
    }

    /// Decides the fault's requested and goal leaf levels.
    ///
    /// The host mapping size caps the request; the NX huge page veto then
    /// demotes the goal one level for executable faults.
    pub fn hugepage_adjust(&self, fault: &mut Fault, slot: &MemorySlot, host: &HostFrame) {
        fault.max_level = self.config.max_huge_level;
        fault.req_level = self
            .max_mapping_level(slot, fault.gfn)
            .min(host.level)
            .min(fault.max_level);
        fault.goal_level = fault.req_level;

        if fault.exec && fault.nx_huge_page_workaround_enabled && fault.req_level > PageLevel::Pt
        {
            fault.huge_page_disallowed = true;
            fault.goal_level = fault.req_level.next().expect("req above Pt");
            tracing::debug!(
                gfn = %fault.gfn,
                req = ?fault.req_level,
                goal = ?fault.goal_level,
                "nx huge page veto",
            );
        }
    }

    /// Demotes the fault's goal when the entry at `level` already points at
    /// a table that exists because of an earlier NX veto. Re-installing a
    /// huge leaf there would re-trigger the veto on the next fetch.
    pub fn adjust_disallowed_hugepage(&self, fault: &mut Fault, entry: TableEntry, level: PageLevel) {
        let inner = self.lock_inner();
        Self::adjust_disallowed_hugepage_locked(&inner, fault, entry, level);
    }

    fn adjust_disallowed_hugepage_locked(
        inner: &MmuInner,
        fault: &mut Fault,
        entry: TableEntry,
        level: PageLevel,
    ) {
        if level == PageLevel::Pt || level != fault.goal_level {
            return;
        }

        if !entry.present() || entry.is_leaf(level) {
            return;
        }

        let child = NodeHandle(entry.child_index() as u32);
        if inner
            .store
            .get(child)
            .is_some_and(|node| node.nx_huge_page_disallowed())
        {
            fault.goal_level = level.next().expect("level above Pt");
        }
    }

    fn walk_and_install(
        &self,
        inner: &mut MmuInner,
        root: NodeHandle,
        fault: &mut Fault,
        host: HostFrame,
    ) -> Result<FaultDisposition, MmuError> {
        let root_node = inner.store.get(root).ok_or(MmuError::RootNotPresent)?.clone();
        let mut level = root_node.role().level;
        let mut handle = root;

        fault.goal_level = fault.goal_level.min(level);

        // A write-protect pin anywhere in the covered range forces base
        // pages; a writable huge leaf would reopen the pinned frame.
        while fault.goal_level > PageLevel::Pt {
            let base = gfn_round_for_level(fault.gfn, fault.goal_level);
            let pages = fault.goal_level.pages();
            let pinned = inner
                .write_protected
                .iter()
                .any(|pin| pin.0 >= base.0 && pin.0 < base.0 + pages);

            if !pinned {
                break;
            }
            fault.goal_level = fault.goal_level.next().expect("goal above Pt");
        }

        // Guest tables already shadowed at the written GFN before this walk
        // started; any of them appearing on the path means the guest write
        // rewrites its own in-use translation.
        let written_tables: SmallVec<[NodeHandle; 2]> = if fault.write && !fault.is_direct {
            inner
                .store
                .nodes_at(fault.gfn)
                .into_iter()
                .filter(|&h| {
                    inner
                        .store
                        .get(h)
                        .is_some_and(|node| node.role().guest_mode)
                })
                .collect()
        } else {
            SmallVec::new()
        };

        loop {
            let node = inner.store.get(handle).cloned().expect("walk handle is live");
            let index = level.table_index(fault.gfn);

            if written_tables.contains(&handle) {
                fault.write_fault_to_shadow_pgtable = true;
                tracing::debug!(gfn = %fault.gfn, %handle, "write fault rewrites its own translation path");
                return Ok(FaultDisposition::Emulate);
            }

            if fault.nx_huge_page_workaround_enabled {
                Self::adjust_disallowed_hugepage_locked(
                    inner,
                    fault,
                    node.entries().get(index),
                    level,
                );
            }

            if level == fault.goal_level {
                return self.install_leaf(inner, handle, &node, index, level, fault, host);
            }

            let entry = node.entries().get(index);
            let child = if entry.is_leaf(level) {
                // A huge leaf blocks the deeper goal; split it.
                self.zap_leaf_locked(inner, handle, &node, index, level);
                None
            } else if entry.present() {
                let child = NodeHandle(entry.child_index() as u32);
                match inner.store.get(child) {
                    Some(node) if Some(node.role().level) == level.next() => Some(child),
                    _ => return Ok(FaultDisposition::Invalid),
                }
            } else {
                None
            };

            let child = match child {
                Some(child) => child,
                None => self.link_child(inner, handle, &node, index, level, fault.gfn)?,
            };

            handle = child;
            level = level.next().expect("goal level below current");
        }
    }

    fn create_node(
        &self,
        inner: &mut MmuInner,
        role: NodeRole,
        gfn: Gfn,
    ) -> Result<NodeHandle, MmuError> {
        let entries = self.alloc.alloc_table().ok_or(MmuError::OutOfNodes)?;
        let shadowed = if role.direct {
            None
        } else {
            Some(self.alloc.alloc_table().ok_or(MmuError::OutOfNodes)?)
        };

        let handle = inner.store.insert(ShadowNode::new(role, gfn, entries, shadowed));
        tracing::debug!(%handle, %gfn, level = ?role.level, "created shadow node");

        Ok(handle)
    }

    /// Finds or creates the child behind `parent`'s entry at `index`, links
    /// it and takes a reference for the new parent entry.
    fn link_child(
        &self,
        inner: &mut MmuInner,
        parent: NodeHandle,
        parent_node: &Arc<ShadowNode>,
        index: usize,
        level: PageLevel,
        gfn: Gfn,
    ) -> Result<NodeHandle, MmuError> {
        let role = parent_node.role().child().expect("link below leaf level");
        let child_gfn = gfn_round_for_level(gfn, level);

        let child = match inner.store.find(&role, child_gfn) {
            Some(existing) => existing,
            None => self.create_node(inner, role, child_gfn)?,
        };

        // The forward link is a single atomic store.
        parent_node.entries().set(index, TableEntry::table(u64::from(child.0)));
        inner
            .parents
            .entry(child)
            .or_default()
            .push(ParentLink { node: parent, index: index as u16 });
        inner.store.get(child).expect("child registered above").refs().inc();

        Ok(child)
    }

    #[allow(clippy::too_many_arguments)]
    fn install_leaf(
        &self,
        inner: &mut MmuInner,
        handle: NodeHandle,
        node: &Arc<ShadowNode>,
        index: usize,
        level: PageLevel,
        fault: &mut Fault,
        host: HostFrame,
    ) -> Result<FaultDisposition, MmuError> {
        let slot = fault.slot.as_ref().expect("installing without a slot");

        let mut access = slot.access;
        if !host.writable {
            access.remove(MemoryAccess::W);
        }

        // What the guest is granted at this translation, independent of any
        // write-protection imposed below.
        let granted = access;

        // A dirty-log pin on this frame survives unrelated faults.
        if inner.write_protected.contains(&fault.gfn) {
            access.remove(MemoryAccess::W);
        }

        // Mapping a tracked guest table writable requires the unsync
        // tracker's consent; refusal keeps the frame trapped.
        let mut write_refused = false;
        if access.contains(MemoryAccess::W)
            && self.try_unsync_locked(
                inner,
                fault.gfn,
                // A write's target slot within the guest table follows from
                // the page offset.
                fault
                    .write
                    .then(|| ((fault.addr.0 & (smmu_core::PAGE_SIZE - 1)) / 8) as usize),
                false,
                fault.prefetch,
            ) == TryUnsync::MustWriteProtect
        {
            access.remove(MemoryAccess::W);
            write_refused = true;
        }

        let hfn = Hfn(host.hfn.0 & !(level.pages() - 1));
        let new = TableEntry::leaf(hfn, access, level);
        let old = node.entries().get(index);

        if old == new {
            node.flood_reset();
            return Ok(if write_refused && fault.write {
                FaultDisposition::WriteProtected
            } else {
                FaultDisposition::Spurious
            });
        }

        if old.present() {
            if !old.is_leaf(level) {
                // Host backing grew past the existing small-page subtree;
                // collapse it and let the huge leaf take its place. The NX
                // demotion pass already kept vetoed subtrees off this path.
                let child = NodeHandle(old.child_index() as u32);
                tracing::debug!(%child, gfn = %fault.gfn, level = ?level, "collapsing subtree");

                node.entries().set(index, TableEntry::INVALID);
                if let Some(links) = inner.parents.get_mut(&child) {
                    links.retain(|link| !(link.node == handle && link.index == index as u16));
                    if links.is_empty() {
                        inner.parents.remove(&child);
                    }
                }
                if let Some(child_node) = inner.store.get(child).cloned() {
                    if child_node.refs().dec() == 0 {
                        self.free_node_locked(inner, child);
                    }
                }

                self.tlb.flush_range(Self::entry_gfn(node, index), level);
                self.bump_generation();
            } else {
                inner.rmap.remove(old.frame(), handle, index as u16);
                self.tlb.flush_range(Self::entry_gfn(node, index), level);
                self.bump_generation();
            }
        }

        node.entries().set(index, new);
        inner.rmap.add(hfn, handle, index as u16);

        if node.role().guest_mode {
            node.shadowed_set(index, fault.gfn, granted);
        }

        node.flood_reset();

        if fault.huge_page_disallowed {
            node.set_nx_huge_page_disallowed(true);
            if inner.nx.track(handle) {
                tracing::debug!(%handle, gfn = %fault.gfn, "tracking nx-vetoed node");
            }
        }

        tracing::debug!(
            gfn = %fault.gfn,
            %hfn,
            level = ?level,
            access = %access,
            "installed leaf",
        );

        Ok(if write_refused && fault.write {
            FaultDisposition::WriteProtected
        } else {
            FaultDisposition::Fixed
        })
    }

    /// Base GFN covered by `node`'s entry at `index`.
    pub(crate) fn entry_gfn(node: &ShadowNode, index: usize) -> Gfn {
        Gfn(node.gfn().0 + index as u64 * node.role().level.pages())
    }

    fn zap_leaf_locked(
        &self,
        inner: &mut MmuInner,
        handle: NodeHandle,
        node: &Arc<ShadowNode>,
        index: usize,
        level: PageLevel,
    ) {
        let entry = node.entries().get(index);
        debug_assert!(entry.is_leaf(level));

        inner.rmap.remove(entry.frame(), handle, index as u16);
        node.entries().set(index, TableEntry::INVALID);
        node.shadowed_clear(index);

        self.tlb.flush_range(Self::entry_gfn(node, index), level);
        self.bump_generation();
    }

    /// Pins `gfn` read-only: clears the writable bit on every shadow entry
    /// mapping its host frame and records the pin so faults report
    /// [`FaultDisposition::WriteProtected`] instead of restoring access.
    ///
    /// Returns the number of entries downgraded.
    pub fn write_protect(&self, gfn: Gfn) -> usize {
        let mut inner = self.lock_inner();

        inner.write_protected.insert(gfn);
        let downgraded = self.write_protect_frame_locked(&mut inner, gfn);
        self.bump_generation();

        tracing::debug!(%gfn, downgraded, "write-protected frame");

        downgraded
    }

    /// Releases a [`write_protect`](Self::write_protect) pin. Write access
    /// is restored lazily by the next fault.
    pub fn unprotect(&self, gfn: Gfn) -> bool {
        let mut inner = self.lock_inner();
        let removed = inner.write_protected.remove(&gfn);
        self.bump_generation();
        removed
    }

    pub(crate) fn write_protect_frame_locked(&self, inner: &mut MmuInner, gfn: Gfn) -> usize {
        let Some(slot) = self.slots.slot_for(gfn) else {
            return 0;
        };
        let Some(host) = self.slots.host_frame(&slot, gfn) else {
            return 0;
        };

        // A huge leaf is keyed by its base frame, so the frame covering
        // `gfn` must be looked up once per mapping level.
        let mut downgraded = 0;
        let mut level = Some(PageLevel::Pt);
        while let Some(bucket_level) = level {
            let base = Hfn(host.hfn.0 & !(bucket_level.pages() - 1));

            for rmap_slot in inner.rmap.slots(base) {
                let Some(node) = inner.store.get(rmap_slot.node) else {
                    continue;
                };
                if node.role().level != bucket_level {
                    continue;
                }

                let entry = node.entries().get(rmap_slot.index as usize);
                if entry.writable() {
                    node.entries().set(rmap_slot.index as usize, entry.write_protected());
                    self.tlb.flush_range(
                        Self::entry_gfn(node, rmap_slot.index as usize),
                        bucket_level,
                    );
                    downgraded += 1;
                }
            }

            level = bucket_level.previous();
        }

        downgraded
    }

    /// Tears down every node shadowing `gfn`, across all role variants.
    ///
    /// Returns the number of nodes torn down.
    pub fn zap_nodes_at(&self, gfn: Gfn) -> usize {
        let mut inner = self.lock_inner();

        let handles = inner.store.nodes_at(gfn);
        let zapped = handles.len();

        for handle in handles {
            self.detach_node_locked(&mut inner, handle);
        }

        self.bump_generation();

        if zapped > 0 {
            tracing::debug!(%gfn, zapped, "zapped shadow nodes");
        }

        zapped
    }

    /// Unlinks `handle` from every parent, then frees it if nothing else
    /// references it.
    fn detach_node_locked(&self, inner: &mut MmuInner, handle: NodeHandle) {
        if let Some(links) = inner.parents.remove(&handle) {
            for link in links {
                if let Some(parent) = inner.store.get(link.node) {
                    parent.entries().set(link.index as usize, TableEntry::INVALID);
                }

                if let Some(node) = inner.store.get(handle) {
                    node.refs().dec();
                }
            }
        }

        let root_refs = inner.roots.values().filter(|&&root| root == handle).count();
        inner.roots.retain(|_, &mut root| root != handle);
        if let Some(node) = inner.store.get(handle) {
            for _ in 0..root_refs {
                node.refs().dec();
            }
        }

        if inner
            .store
            .get(handle)
            .is_some_and(|node| node.refs().get() == 0)
        {
            self.free_node_locked(inner, handle);
        }
    }

    /// Frees a node whose reference count reached zero: unmaps its leaves,
    /// drops its references on children (cascading), unregisters it from
    /// every tracker and retires it to the reclamation queue.
    fn free_node_locked(&self, inner: &mut MmuInner, handle: NodeHandle) {
        let Some(node) = inner.store.get(handle).cloned() else {
            return;
        };
        debug_assert_eq!(node.refs().get(), 0, "freeing a referenced node");

        let level = node.role().level;
        for index in node.entries().present_indices() {
            let entry = node.entries().get(index);

            if entry.is_leaf(level) {
                inner.rmap.remove(entry.frame(), handle, index as u16);
                self.tlb.flush_range(Self::entry_gfn(&node, index), level);
            } else {
                let child = NodeHandle(entry.child_index() as u32);

                if let Some(links) = inner.parents.get_mut(&child) {
                    links.retain(|link| !(link.node == handle && link.index == index as u16));
                    if links.is_empty() {
                        inner.parents.remove(&child);
                    }
                }

                if let Some(child_node) = inner.store.get(child).cloned() {
                    if child_node.refs().dec() == 0 {
                        self.free_node_locked(inner, child);
                    }
                }
            }

            node.entries().set(index, TableEntry::INVALID);
        }

        inner.nx.untrack(handle);
        inner.parents.remove(&handle);

        let node = inner.store.remove(handle).expect("freed node is live");
        tracing::debug!(%handle, gfn = %node.gfn(), "retiring shadow node");
        self.reclaim.retire(node);
    }

    /// Tears down every root and verifies nothing leaked, then drains the
    /// reclamation queue.
    pub fn shutdown(&mut self) {
        let mut inner = self.lock_inner();

        let roots: Vec<NodeHandle> = inner.roots.values().copied().collect();
        inner.roots.clear();

        for handle in roots {
            if let Some(node) = inner.store.get(handle).cloned() {
                if node.refs().dec() == 0 {
                    self.free_node_locked(&mut inner, handle);
                }
            }
        }

        self.bump_generation();

        debug_assert!(inner.store.is_empty(), "nodes leaked at shutdown");
        debug_assert_eq!(inner.rmap.frames(), 0, "rmap entries leaked at shutdown");
        debug_assert!(inner.nx.is_empty(), "nx list entries leaked at shutdown");
        drop(inner);

        self.reclaim.reclaim();
        self.reclaim.shutdown();
    }
}

impl<S, T, A> std::fmt::Debug for ShadowMmu<S, T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ShadowMmu")
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
