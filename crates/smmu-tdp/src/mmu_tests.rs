use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use smmu_core::{
    EntryTable, Gfn, Gpa, Hfn, HostFrame, MemoryAccess, MemorySlot, MemorySlots, MmuError,
    NodeAllocator, PageLevel, TlbFlush,
};

use super::*;

/// Offset between mock guest and host frame numbers. Aligned beyond the
/// largest leaf so hugepage alignment carries over.
const FRAME_BASE: u64 = 0x8_0000;

fn host_hfn(gfn: u64) -> Hfn {
    Hfn(gfn + FRAME_BASE)
}

#[derive(Debug)]
struct SlotControl {
    host_level: PageLevel,
    missing: HashSet<Gfn>,
    readonly: HashSet<Gfn>,
}

#[derive(Debug, Clone)]
struct MockSlots {
    slots: Vec<MemorySlot>,
    control: Arc<Mutex<SlotControl>>,
}

impl MockSlots {
    fn new(slots: Vec<MemorySlot>) -> Self {
        Self {
            slots,
            control: Arc::new(Mutex::new(SlotControl {
                host_level: PageLevel::Pt,
                missing: HashSet::new(),
                readonly: HashSet::new(),
            })),
        }
    }

    fn set_host_level(&self, level: PageLevel) {
        self.control.lock().unwrap().host_level = level;
    }

    fn set_missing(&self, gfn: Gfn, missing: bool) {
        let mut control = self.control.lock().unwrap();
        if missing {
            control.missing.insert(gfn);
        } else {
            control.missing.remove(&gfn);
        }
    }

    fn set_readonly(&self, gfn: Gfn) {
        self.control.lock().unwrap().readonly.insert(gfn);
    }
}

impl MemorySlots for MockSlots {
    fn slot_for(&self, gfn: Gfn) -> Option<MemorySlot> {
        self.slots.iter().find(|slot| slot.contains(gfn)).cloned()
    }

    fn max_mapping_level(&self, _slot: &MemorySlot, _gfn: Gfn) -> PageLevel {
        self.control.lock().unwrap().host_level
    }

    fn host_frame(&self, _slot: &MemorySlot, gfn: Gfn) -> Option<HostFrame> {
        let control = self.control.lock().unwrap();

        if control.missing.contains(&gfn) {
            return None;
        }

        Some(HostFrame {
            hfn: host_hfn(gfn.0),
            writable: !control.readonly.contains(&gfn),
            refcounted: false,
            level: control.host_level,
        })
    }
}

#[derive(Debug, Clone, Default)]
struct MockTlb {
    flushes: Arc<Mutex<Vec<(Gfn, PageLevel)>>>,
}

impl MockTlb {
    fn flushes(&self) -> Vec<(Gfn, PageLevel)> {
        self.flushes.lock().unwrap().clone()
    }
}

impl TlbFlush for MockTlb {
    fn flush_range(&self, gfn: Gfn, level: PageLevel) {
        self.flushes.lock().unwrap().push((gfn, level));
    }
}

#[derive(Debug, Clone)]
struct BudgetAllocator {
    remaining: Arc<Mutex<usize>>,
}

impl BudgetAllocator {
    fn new(budget: usize) -> Self {
        Self {
            remaining: Arc::new(Mutex::new(budget)),
        }
    }

    fn refill(&self, budget: usize) {
        *self.remaining.lock().unwrap() = budget;
    }
}

impl NodeAllocator for BudgetAllocator {
    fn alloc_table(&self) -> Option<Box<EntryTable>> {
        let mut remaining = self.remaining.lock().unwrap();
        if *remaining == 0 {
            return None;
        }

        *remaining -= 1;
        Some(Box::new(EntryTable::zeroed()))
    }
}

type TestMmu = ShadowMmu<MockSlots, MockTlb, BudgetAllocator>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn wide_slot() -> MemorySlot {
    MemorySlot {
        base_gfn: Gfn(0),
        pages: 0x8_0000,
        access: MemoryAccess::RWX,
        private: false,
    }
}

fn mmu_with(slots: Vec<MemorySlot>, budget: usize, config: MmuConfig) -> (TestMmu, MockSlots, MockTlb) {
    let slots = MockSlots::new(slots);
    let tlb = MockTlb::default();
    let mmu = ShadowMmu::new(slots.clone(), tlb.clone(), BudgetAllocator::new(budget), config);
    (mmu, slots, tlb)
}

fn mmu() -> (TestMmu, MockSlots, MockTlb) {
    mmu_with(vec![wide_slot()], 64, MmuConfig::default())
}

fn direct_root(mmu: &TestMmu) -> NodeHandle {
    mmu.alloc_root(NodeRole::direct(PageLevel::Pml4, AddressSpaceId(0)), Gfn(0))
        .unwrap()
}

fn shadowed_root(mmu: &TestMmu, address_space: u8, gfn: Gfn) -> NodeHandle {
    mmu.alloc_root(
        NodeRole::shadowed(PageLevel::Pml4, AddressSpaceId(address_space)),
        gfn,
    )
    .unwrap()
}

fn write_fault(gfn: u64) -> Fault {
    Fault::new(Gpa(gfn << 12), ErrorCode::WRITE, false)
}

fn read_fault(gfn: u64) -> Fault {
    Fault::new(Gpa(gfn << 12), ErrorCode::empty(), false)
}

fn exec_fault(gfn: u64) -> Fault {
    Fault::new(Gpa(gfn << 12), ErrorCode::FETCH, false)
}

fn leaf_for(mmu: &TestMmu, gfn: Gfn) -> Option<(NodeHandle, usize, smmu_core::TableEntry)> {
    let slot = mmu.rmap_slots(host_hfn(gfn.0)).first().copied()?;
    let node = mmu.node(slot.node)?;
    Some((slot.node, slot.index as usize, node.entries().get(slot.index as usize)))
}

/// Every present leaf entry in the tree must have exactly one reverse-map
/// slot, and every reverse-map slot must point back at a present leaf.
fn assert_rmap_consistent(mmu: &TestMmu) {
    let mut leaves = HashSet::new();
    let mut frames = HashSet::new();

    for handle in mmu.node_handles() {
        let node = mmu.node(handle).unwrap();
        let level = node.role().level;

        for index in node.entries().present_indices() {
            let entry = node.entries().get(index);
            if !entry.is_leaf(level) {
                continue;
            }

            leaves.insert(RmapSlot {
                node: handle,
                index: index as u16,
            });
            frames.insert(entry.frame());

            assert!(
                mmu.rmap_slots(entry.frame()).contains(&RmapSlot {
                    node: handle,
                    index: index as u16
                }),
                "leaf {handle}[{index}] missing from reverse map",
            );
        }
    }

    let aliases: usize = frames.iter().map(|&frame| mmu.alias_count(frame)).sum();
    assert_eq!(leaves.len(), aliases, "reverse map holds stale slots");
}

#[test]
fn miss_populates_full_depth() {
    init_tracing();
    let (mmu, _slots, tlb) = mmu();
    let root = direct_root(&mmu);

    let mut fault = write_fault(0x10);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    // Root plus one intermediate per level down to the 4 KiB table.
    assert_eq!(mmu.node_count(), 4);
    assert_eq!(mmu.alias_count(host_hfn(0x10)), 1);

    let (_, _, entry) = leaf_for(&mmu, Gfn(0x10)).unwrap();
    assert!(entry.present() && entry.writable() && !entry.large());

    // Nothing was replaced, so nothing needed flushing.
    assert!(tlb.flushes().is_empty());
    assert_rmap_consistent(&mmu);
}

#[test]
fn repeat_fault_is_spurious() {
    let (mmu, _slots, _tlb) = mmu();
    let root = direct_root(&mmu);

    let mut fault = write_fault(0x10);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    let mut fault = write_fault(0x10);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Spurious));
    assert_eq!(mmu.node_count(), 4);
}

#[test]
fn write_protect_cycle() {
    let (mmu, _slots, _tlb) = mmu();
    let root = direct_root(&mmu);

    let mut fault = write_fault(0x10);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    assert_eq!(mmu.write_protect(Gfn(0x10)), 1);
    let (_, _, entry) = leaf_for(&mmu, Gfn(0x10)).unwrap();
    assert!(!entry.writable());

    let mut fault = write_fault(0x10);
    assert_eq!(
        mmu.resolve_fault(root, &mut fault),
        Ok(FaultDisposition::WriteProtected)
    );

    assert!(mmu.unprotect(Gfn(0x10)));

    // Write access comes back lazily through the next fault.
    let mut fault = write_fault(0x10);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    let (_, _, entry) = leaf_for(&mmu, Gfn(0x10)).unwrap();
    assert!(entry.writable());
    assert_rmap_consistent(&mmu);
}

#[test]
fn absent_slot_emulates() {
    let (mmu, _slots, _tlb) = mmu();
    let root = direct_root(&mmu);

    let mut fault = write_fault(0x9_0000);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Emulate));
    assert_eq!(mmu.node_count(), 1);
}

#[test]
fn private_memory_never_emulates() {
    let (mmu, _slots, _tlb) = mmu();
    let root = direct_root(&mmu);

    let mut fault = Fault::new(Gpa(0x9_0000 << 12), ErrorCode::WRITE | ErrorCode::PRIVATE, false);
    assert_eq!(
        mmu.resolve_fault(root, &mut fault),
        Err(MmuError::PrivateMemoryEmulation(Gfn(0x9_0000)))
    );
}

#[test]
fn readonly_host_write_emulates() {
    let (mmu, slots, _tlb) = mmu();
    let root = direct_root(&mmu);

    slots.set_readonly(Gfn(0x20));

    let mut fault = write_fault(0x20);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Emulate));

    // Reads still map, without write access.
    let mut fault = read_fault(0x20);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    let (_, _, entry) = leaf_for(&mmu, Gfn(0x20)).unwrap();
    assert!(!entry.writable());
}

#[test]
fn missing_host_frame_retries() {
    let (mmu, slots, _tlb) = mmu();
    let root = direct_root(&mmu);

    slots.set_missing(Gfn(0x30), true);
    let mut fault = write_fault(0x30);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Retry));

    slots.set_missing(Gfn(0x30), false);
    let mut fault = write_fault(0x30);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));
}

#[test]
fn fast_probe_observes_installed_leaf() {
    let (mmu, _slots, _tlb) = mmu();
    let root = direct_root(&mmu);

    let mut fault = write_fault(0x10);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    let mut probe = read_fault(0x10);
    probe.snapshot = mmu.snapshot();
    assert_eq!(mmu.fast_probe(root, &probe), FaultDisposition::Spurious);

    // An unmapped neighbour falls through to the slow path.
    let mut probe = read_fault(0x11);
    probe.snapshot = mmu.snapshot();
    assert_eq!(mmu.fast_probe(root, &probe), FaultDisposition::Continue);
}

#[test]
fn stale_probe_snapshot_retries() {
    let (mmu, _slots, _tlb) = mmu();
    let root = direct_root(&mmu);

    let mut fault = write_fault(0x10);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    let mut probe = read_fault(0x10);
    probe.snapshot = mmu.snapshot();

    // Any invalidating mutation makes the snapshot stale.
    mmu.write_protect(Gfn(0x40));
    assert_eq!(mmu.fast_probe(root, &probe), FaultDisposition::Retry);
}

#[test]
fn huge_leaf_install_and_split() {
    init_tracing();
    let (mmu, slots, tlb) = mmu();
    let root = direct_root(&mmu);

    slots.set_host_level(PageLevel::Pd);
    let mut fault = write_fault(0x200);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));
    assert_eq!(fault.req_level, PageLevel::Pd);
    assert_eq!(fault.goal_level, PageLevel::Pd);

    // Root, PDPT node, PD node holding the huge leaf.
    assert_eq!(mmu.node_count(), 3);
    let (_, _, entry) = leaf_for(&mmu, Gfn(0x200)).unwrap();
    assert!(entry.large());

    // Dirty-logging style downgrade, then host-side fragmentation: the
    // next write can no longer be satisfied in place and must split the
    // huge leaf down to 4 KiB.
    mmu.write_protect(Gfn(0x200));
    mmu.unprotect(Gfn(0x200));
    slots.set_host_level(PageLevel::Pt);

    let mut fault = write_fault(0x201);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));
    assert_eq!(fault.goal_level, PageLevel::Pt);

    assert_eq!(mmu.alias_count(host_hfn(0x200)), 0);
    assert_eq!(mmu.alias_count(host_hfn(0x201)), 1);
    assert!(tlb.flushes().contains(&(Gfn(0x200), PageLevel::Pd)));
    assert_rmap_consistent(&mmu);
}

#[test]
fn huge_leaf_collapse_replaces_small_mappings() {
    init_tracing();
    let (mmu, slots, tlb) = mmu();
    let root = direct_root(&mmu);

    let mut fault = write_fault(0x201);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));
    assert_eq!(mmu.node_count(), 4);

    // The host upgraded the backing to 2 MiB; the next fault in the range
    // must collapse the 4 KiB subtree into one huge leaf, not spin.
    slots.set_host_level(PageLevel::Pd);
    let mut fault = write_fault(0x200);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));
    assert_eq!(fault.goal_level, PageLevel::Pd);

    // The page table node and its 4 KiB translation are gone.
    assert_eq!(mmu.node_count(), 3);
    assert_eq!(mmu.alias_count(host_hfn(0x201)), 0);

    let (_, _, entry) = leaf_for(&mmu, Gfn(0x200)).unwrap();
    assert!(entry.large() && entry.writable());
    assert!(tlb.flushes().contains(&(Gfn(0x200), PageLevel::Pd)));

    // Faults inside the collapsed range are satisfied in place.
    let mut fault = write_fault(0x201);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Spurious));
    assert_rmap_consistent(&mmu);
}

#[test]
fn write_protect_inside_huge_leaf_downgrades_it() {
    init_tracing();
    let (mmu, slots, tlb) = mmu();
    let root = direct_root(&mmu);

    slots.set_host_level(PageLevel::Pd);
    let mut fault = write_fault(0x200);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    // Protecting a GFN that is not the leaf's base must still find the
    // covering huge translation.
    assert_eq!(mmu.write_protect(Gfn(0x201)), 1);

    let (_, _, entry) = leaf_for(&mmu, Gfn(0x200)).unwrap();
    assert!(!entry.writable());
    assert!(tlb.flushes().contains(&(Gfn(0x200), PageLevel::Pd)));

    // A neighbouring write splits the leaf instead of restoring write
    // access over the pinned page.
    let mut fault = write_fault(0x202);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));
    assert_eq!(fault.goal_level, PageLevel::Pt);

    let mut fault = write_fault(0x201);
    assert_eq!(
        mmu.resolve_fault(root, &mut fault),
        Ok(FaultDisposition::WriteProtected)
    );
    assert_rmap_consistent(&mmu);
}

#[test]
fn pinned_gfn_maps_read_only() {
    let (mmu, _slots, _tlb) = mmu();
    let root = direct_root(&mmu);

    // Pinning ahead of any mapping downgrades nothing yet.
    assert_eq!(mmu.write_protect(Gfn(0x30)), 0);

    // The read fault that maps the frame must not hand back write access.
    let mut fault = read_fault(0x30);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    let (_, _, entry) = leaf_for(&mmu, Gfn(0x30)).unwrap();
    assert!(entry.present() && !entry.writable());
}

#[test]
fn hugepage_adjust_keeps_levels_ordered() {
    let (mmu, slots, _tlb) = mmu();

    slots.set_host_level(PageLevel::Pdpt);
    let slot = wide_slot();
    let host = HostFrame {
        hfn: host_hfn(0),
        writable: true,
        refcounted: false,
        level: PageLevel::Pdpt,
    };

    let mut fault = exec_fault(0);
    fault.nx_huge_page_workaround_enabled = true;
    mmu.hugepage_adjust(&mut fault, &slot, &host);

    assert!(fault.huge_page_disallowed);
    assert!(fault.goal_level <= fault.req_level);
    assert!(fault.req_level <= fault.max_level);
    assert_eq!(fault.req_level, PageLevel::Pdpt);
    assert_eq!(fault.goal_level, PageLevel::Pd);
}

#[test]
fn nx_veto_tracks_and_zap_untracks() {
    init_tracing();
    let (mmu, slots, _tlb) = mmu();
    let root = direct_root(&mmu);

    slots.set_host_level(PageLevel::Pd);
    let mut fault = exec_fault(0x400);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    assert!(fault.huge_page_disallowed);
    assert_eq!(fault.req_level, PageLevel::Pd);
    assert_eq!(fault.goal_level, PageLevel::Pt);

    // The page table standing in for the vetoed huge leaf is tracked for
    // recovery.
    assert_eq!(mmu.nx_count(), 1);
    let tracked = mmu
        .node_handles()
        .into_iter()
        .find(|&handle| mmu.nx_tracked(handle))
        .unwrap();
    assert!(mmu.node(tracked).unwrap().nx_huge_page_disallowed());
    assert_eq!(mmu.node(tracked).unwrap().gfn(), Gfn(0x400));

    mmu.zap_nodes_at(Gfn(0x400));
    assert_eq!(mmu.nx_count(), 0);
    assert!(mmu.node(tracked).is_none());
    assert_rmap_consistent(&mmu);
}

#[test]
fn nx_demotion_sticks_for_later_faults() {
    let (mmu, slots, _tlb) = mmu();
    let root = direct_root(&mmu);

    slots.set_host_level(PageLevel::Pd);
    let mut fault = exec_fault(0x400);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    // A plain write in the same range wants a huge leaf, but installing it
    // would tear down the vetoed table just to re-split on the next fetch.
    let mut fault = write_fault(0x401);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));
    assert_eq!(fault.req_level, PageLevel::Pd);
    assert_eq!(fault.goal_level, PageLevel::Pt);

    let (_, _, entry) = leaf_for(&mmu, Gfn(0x401)).unwrap();
    assert!(!entry.large());
    assert_eq!(mmu.nx_count(), 1);
}

#[test]
fn allocation_failure_aborts_fault_only() {
    let (mmu, _slots, _tlb) = mmu_with(vec![wide_slot()], 2, MmuConfig::default());
    let root = direct_root(&mmu);

    let mut fault = write_fault(0x10);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Err(MmuError::OutOfNodes));

    // The partially built path stays valid for the next attempt.
    assert_eq!(mmu.node_count(), 2);
    assert_rmap_consistent(&mmu);
}

#[test]
fn fault_succeeds_after_allocator_refill() {
    let slots = MockSlots::new(vec![wide_slot()]);
    let alloc = BudgetAllocator::new(2);
    let mmu: TestMmu = ShadowMmu::new(slots, MockTlb::default(), alloc.clone(), MmuConfig::default());
    let root = direct_root(&mmu);

    let mut fault = write_fault(0x10);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Err(MmuError::OutOfNodes));

    alloc.refill(16);
    let mut fault = write_fault(0x10);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));
    assert_eq!(mmu.node_count(), 4);
}

#[test]
fn direct_alias_bits_are_stripped() {
    let config = MmuConfig {
        direct_gfn_mask: 1 << 40,
        ..MmuConfig::default()
    };
    let (mmu, _slots, _tlb) = mmu_with(vec![wide_slot()], 64, config);
    let root = direct_root(&mmu);

    let mut fault = Fault::new(Gpa(((1u64 << 40) | 0x10) << 12), ErrorCode::WRITE, false);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    // Both aliases resolve to the same translation.
    assert_eq!(fault.gfn, Gfn(0x10));
    assert_eq!(mmu.alias_count(host_hfn(0x10)), 1);
}

#[test]
fn guest_table_frames_map_read_only() {
    init_tracing();
    let (mmu, _slots, _tlb) = mmu();
    let root = shadowed_root(&mmu, 0, Gfn(0x900));

    // Build the path for 0x600; its page table node is keyed at 0x600 too.
    let mut fault = read_fault(0x600);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    // The mapping of the table's own frame was granted without write
    // access: unsyncing is refused for an unattributable mapping.
    let (_, _, entry) = leaf_for(&mmu, Gfn(0x600)).unwrap();
    assert!(entry.present() && !entry.writable());
}

#[test]
fn self_referential_write_emulates() {
    let (mmu, _slots, _tlb) = mmu();
    let root = shadowed_root(&mmu, 0, Gfn(0x900));

    let mut fault = read_fault(0x600);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    // 0x600 now hosts a table on its own translation path; a guest write
    // there rewrites an in-use table and must be emulated.
    let mut fault = write_fault(0x600);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Emulate));
    assert!(fault.write_fault_to_shadow_pgtable);
}

#[test]
fn unsync_absorbs_attributable_writes() {
    init_tracing();
    let (mmu, _slots, _tlb) = mmu();
    let root_a = shadowed_root(&mmu, 0, Gfn(0x900));
    let root_b = shadowed_root(&mmu, 1, Gfn(0x901));

    // Two role variants shadowing the guest table page at 0x600.
    let mut fault = read_fault(0x600);
    assert_eq!(mmu.resolve_fault(root_a, &mut fault), Ok(FaultDisposition::Fixed));
    let mut fault = read_fault(0x600);
    assert_eq!(mmu.resolve_fault(root_b, &mut fault), Ok(FaultDisposition::Fixed));

    let shadows: Vec<NodeHandle> = mmu
        .nodes_at(Gfn(0x600))
        .into_iter()
        .filter(|&handle| mmu.node(handle).unwrap().role().guest_mode)
        .collect();
    assert_eq!(shadows.len(), 2);

    assert_eq!(mmu.try_unsync(Gfn(0x600), Some(5), false, false), TryUnsync::Unsynced);

    let unsynced: Vec<NodeHandle> = shadows
        .iter()
        .copied()
        .filter(|&handle| mmu.node(handle).unwrap().unsynced())
        .collect();
    assert_eq!(unsynced.len(), 1, "exactly one variant absorbs divergence");
    assert!(mmu.node(unsynced[0]).unwrap().unsync_children().contains(5));

    // Further attributable writes pile onto the same node's bitmap.
    assert_eq!(mmu.try_unsync(Gfn(0x600), Some(7), false, false), TryUnsync::Unsynced);
    assert!(mmu.node(unsynced[0]).unwrap().unsync_children().contains(7));
}

#[test]
fn unsync_refusals() {
    let (mmu, _slots, _tlb) = mmu();
    let root = shadowed_root(&mmu, 0, Gfn(0x900));

    let mut fault = read_fault(0x600);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    // A synchronizing caller, a speculative prefetch and an unattributable
    // write all stay write-protected.
    assert_eq!(mmu.try_unsync(Gfn(0x600), Some(1), true, false), TryUnsync::MustWriteProtect);
    assert_eq!(mmu.try_unsync(Gfn(0x600), Some(1), false, true), TryUnsync::MustWriteProtect);
    assert_eq!(mmu.try_unsync(Gfn(0x600), None, false, false), TryUnsync::MustWriteProtect);

    // A frame shadowing nothing needs no bookkeeping at all.
    assert_eq!(mmu.try_unsync(Gfn(0x7777), Some(0), false, false), TryUnsync::Unsynced);
}

#[test]
fn unsync_prefers_the_flooded_node() {
    let (mmu, _slots, _tlb) = mmu();
    let root_a = shadowed_root(&mmu, 0, Gfn(0x900));
    let root_b = shadowed_root(&mmu, 1, Gfn(0x901));

    let mut fault = read_fault(0x600);
    assert_eq!(mmu.resolve_fault(root_a, &mut fault), Ok(FaultDisposition::Fixed));
    let mut fault = read_fault(0x600);
    assert_eq!(mmu.resolve_fault(root_b, &mut fault), Ok(FaultDisposition::Fixed));

    let shadows: Vec<NodeHandle> = mmu
        .nodes_at(Gfn(0x600))
        .into_iter()
        .filter(|&handle| mmu.node(handle).unwrap().role().guest_mode)
        .collect();

    let hot = shadows[0];
    for _ in 0..3 {
        mmu.node(hot).unwrap().flood_inc();
    }

    assert_eq!(mmu.try_unsync(Gfn(0x600), Some(0), false, false), TryUnsync::Unsynced);
    assert!(mmu.node(hot).unwrap().unsynced());
}

#[test]
fn sync_children_replays_only_the_bitmap() {
    init_tracing();
    let (mmu, _slots, tlb) = mmu();
    let root = shadowed_root(&mmu, 0, Gfn(0x900));

    let mut fault = read_fault(0x600);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    let node = mmu
        .nodes_at(Gfn(0x600))
        .into_iter()
        .find(|&handle| mmu.node(handle).unwrap().role().guest_mode)
        .unwrap();

    // 0x600 maps through entry 0 of its own table node.
    assert_eq!(mmu.try_unsync(Gfn(0x600), Some(0), false, false), TryUnsync::Unsynced);
    assert!(mmu.node(node).unwrap().unsynced());

    let flushes_before = tlb.flushes().len();
    assert_eq!(mmu.sync_children(node), 1);

    let synced = mmu.node(node).unwrap();
    assert!(!synced.unsynced());
    assert!(!synced.unsync_children().any());

    // The entry was re-derived from the recorded guest translation.
    let entry = synced.entries().get(0);
    assert!(entry.present());
    assert_eq!(entry.frame(), host_hfn(0x600));

    // Exactly the one diverged child was visited.
    assert_eq!(tlb.flushes().len(), flushes_before + 1);
    assert_rmap_consistent(&mmu);

    // Resyncing an already-synced node is a no-op.
    assert_eq!(mmu.sync_children(node), 0);
}

#[test]
fn zap_waits_for_open_walks() {
    let (mmu, _slots, _tlb) = mmu();
    let root = direct_root(&mmu);

    let mut fault = write_fault(0x4210);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));

    let walk = mmu.reclaim_queue().begin();

    // 0x4200 is the key of the leaf-level table holding the mapping.
    let zapped = mmu.zap_nodes_at(Gfn(0x4200));
    assert_eq!(zapped, 1);

    // The node is unlinked but not freed while the walk stays open.
    assert!(mmu.reclaim_queue().pending() >= 1);
    assert_eq!(mmu.reclaim_queue().reclaim(), 0);

    drop(walk);
    assert!(mmu.reclaim_queue().reclaim() >= 1);
    assert_eq!(mmu.reclaim_queue().pending(), 0);
    assert_rmap_consistent(&mmu);
}

#[test]
fn zap_clears_parent_linkage() {
    let (mmu, _slots, _tlb) = mmu();
    let root = direct_root(&mmu);

    let mut fault = write_fault(0x4210);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));
    assert_eq!(mmu.node_count(), 4);

    // Zap the leaf-level table; its parent entry must go away with it.
    let (leaf_node, _, _) = leaf_for(&mmu, Gfn(0x4210)).unwrap();
    let leaf_gfn = mmu.node(leaf_node).unwrap().gfn();
    assert_eq!(leaf_gfn, Gfn(0x4200));
    assert_eq!(mmu.zap_nodes_at(leaf_gfn), 1);

    assert!(mmu.node(leaf_node).is_none());
    assert_eq!(mmu.alias_count(host_hfn(0x4210)), 0);
    assert_eq!(mmu.node_count(), 3);

    // The next fault rebuilds the missing level.
    let mut fault = write_fault(0x4210);
    assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));
    assert_eq!(mmu.node_count(), 4);
    assert_rmap_consistent(&mmu);
}

#[test]
fn roots_share_deduplicated_subtrees() {
    let (mmu, _slots, _tlb) = mmu();
    let role = NodeRole::direct(PageLevel::Pml4, AddressSpaceId(0));

    let a = mmu.alloc_root(role, Gfn(0)).unwrap();
    let b = mmu.alloc_root(role, Gfn(0)).unwrap();

    // Identical role and GFN resolve to the same node, and re-allocating
    // the active root takes no extra reference.
    assert_eq!(a, b);
    assert_eq!(mmu.node(a).unwrap().refs().get(), 1);

    mmu.free_root(a);
    assert!(mmu.node(b).is_none());
}

#[test]
fn zapping_a_reallocated_root_frees_it() {
    let (mmu, _slots, _tlb) = mmu();
    let role = NodeRole::direct(PageLevel::Pml4, AddressSpaceId(0));

    let root = mmu.alloc_root(role, Gfn(0)).unwrap();
    assert_eq!(mmu.alloc_root(role, Gfn(0)).unwrap(), root);

    assert_eq!(mmu.zap_nodes_at(Gfn(0)), 1);
    assert_eq!(mmu.node_count(), 0);
    assert_eq!(mmu.root(&role), None);
}

#[test]
fn superseded_root_drops_its_reference() {
    let (mmu, _slots, _tlb) = mmu();
    let role = NodeRole::direct(PageLevel::Pml4, AddressSpaceId(0));

    let old = mmu.alloc_root(role, Gfn(0)).unwrap();
    let new = mmu.alloc_root(role, Gfn(0x1000)).unwrap();

    assert_ne!(old, new);
    assert_eq!(mmu.root(&role), Some(new));
    assert!(mmu.node(old).is_none());
    assert_eq!(mmu.node(new).unwrap().refs().get(), 1);
}

#[test]
fn shutdown_tears_everything_down() {
    init_tracing();
    let (mut mmu, _slots, _tlb) = mmu();
    let root = direct_root(&mmu);

    for gfn in [0x10u64, 0x200, 0x5000] {
        let mut fault = write_fault(gfn);
        assert_eq!(mmu.resolve_fault(root, &mut fault), Ok(FaultDisposition::Fixed));
    }
    assert!(mmu.node_count() > 1);

    mmu.shutdown();
    assert_eq!(mmu.node_count(), 0);
    assert_eq!(mmu.reclaim_queue().pending(), 0);
}
