//! End-to-end translation scenarios across the three modes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use proptest::prelude::*;

use rust_mmu::{
    AddressTranslator, BackingStore, Disk, LogicalAddress, MmuConfig, MmuError, Mode,
    PhysicalAddress,
};

const MIB: u32 = 1024 * 1024;

/// Disk wrapper that counts reads and bytes read.
#[derive(Clone)]
struct CountingStore {
    inner: Arc<Disk>,
    reads: Arc<AtomicUsize>,
    bytes: Arc<AtomicUsize>,
}

impl CountingStore {
    fn new(disk: Disk) -> Self {
        CountingStore {
            inner: Arc::new(disk),
            reads: Arc::default(),
            bytes: Arc::default(),
        }
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn bytes(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }
}

impl BackingStore for CountingStore {
    fn capacity(&self) -> u64 {
        self.inner.capacity()
    }

    fn read(&self, offset: u64, len: usize) -> rust_mmu::Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(len, Ordering::SeqCst);
        self.inner.read(offset, len)
    }
}

fn la(selector: u16, offset: u32) -> LogicalAddress {
    LogicalAddress::new(selector, offset).unwrap()
}

// ==========================================================================
// Segmentation
// ==========================================================================

#[test]
fn test_resident_segment_needs_no_disk() {
    let store = CountingStore::new(Disk::new(MmuConfig::default().disk_size));
    let mut mmu =
        AddressTranslator::new(MmuConfig::with_mode(Mode::Segmented), store.clone()).unwrap();
    mmu.register_segment(0, 0, 0, 2048, true).unwrap();
    mmu.write(PhysicalAddress(0), &[0x0F; 2048]).unwrap();

    assert_eq!(mmu.read(la(0, 0), 2048).unwrap(), vec![0x0F; 2048]);
    assert_eq!(store.reads(), 0);
    assert_eq!(mmu.stats().segment_faults, 0);
}

#[test]
fn test_segment_fault_loads_once() {
    let mut disk = Disk::new(MmuConfig::default().disk_size);
    disk.fill(0, 2048, 0x0F).unwrap();
    let store = CountingStore::new(disk);
    let mut mmu =
        AddressTranslator::new(MmuConfig::with_mode(Mode::Segmented), store.clone()).unwrap();
    mmu.register_segment(0, 0, 0, 2048, false).unwrap();

    assert_eq!(mmu.read(la(0, 0), 2048).unwrap(), vec![0x0F; 2048]);
    assert_eq!(store.reads(), 1);
    assert_eq!(store.bytes(), 2048);

    // now resident: no further loads
    assert_eq!(mmu.read(la(0, 100), 10).unwrap(), vec![0x0F; 10]);
    assert_eq!(store.reads(), 1);
    assert!(mmu.segment(0).unwrap().valid);
    mmu.check_invariants().unwrap();
}

#[test]
fn test_eviction_under_pressure() {
    let third_len = 1_050_624;
    let mut disk = Disk::new(MmuConfig::default().disk_size);
    disk.fill(0, 77, 0x0F).unwrap();
    disk.fill(64 * MIB as u64, third_len, 0x33).unwrap();
    let mut mmu = AddressTranslator::new(MmuConfig::with_mode(Mode::Segmented), disk).unwrap();

    mmu.register_segment(0, 0, 0, 10 * MIB, true).unwrap();
    mmu.write(PhysicalAddress(0), &[0x0F; 77]).unwrap();
    mmu.register_segment(1, 10 * MIB, 32 * MIB, 16 * MIB, true)
        .unwrap();
    mmu.register_segment(2, 0, 64 * MIB, 8 * MIB, false).unwrap();

    // 6 MiB free, 8 MiB wanted: segment 0 is the least recently used
    let data = mmu.read(la(2, 0), third_len).unwrap();
    assert!(data.iter().all(|&b| b == 0x33));
    assert!(!mmu.segment(0).unwrap().valid);
    assert!(mmu.segment(1).unwrap().valid);
    assert_eq!(mmu.stats().segment_evictions, 1);
    assert_eq!(mmu.stats().compactions, 1);
    // segment 1 slid down to address 0
    assert_eq!(mmu.segment(1).unwrap().base, 0);
    mmu.check_invariants().unwrap();

    mmu.invalidate(Some(2), None).unwrap();
    assert_eq!(mmu.read(la(0, 0), 77).unwrap(), vec![0x0F; 77]);
    assert!(mmu.segment(0).unwrap().valid);
    mmu.check_invariants().unwrap();
}

#[test]
fn test_paged_eviction_under_pressure() {
    let third_len = 1_050_624;
    let mut disk = Disk::new(MmuConfig::default().disk_size);
    disk.fill(0, 77, 0x0F).unwrap();
    disk.fill(64 * MIB as u64, third_len, 0x33).unwrap();
    let mut mmu =
        AddressTranslator::new(MmuConfig::with_mode(Mode::SegmentedPaged), disk).unwrap();

    // each registration reserves half its length: 10, 16 and 8 MiB
    mmu.register_segment(0, 0, 0, 20 * MIB, false).unwrap();
    mmu.register_segment(1, 0, 32 * MIB, 32 * MIB, false).unwrap();
    mmu.register_segment(2, 0, 64 * MIB, 16 * MIB, false).unwrap();
    assert_eq!(mmu.read(la(0, 0), 77).unwrap(), vec![0x0F; 77]);
    mmu.read(la(1, 0), 1).unwrap();
    assert_eq!(mmu.segment(1).unwrap().base, 10 * MIB);

    let data = mmu.read(la(2, 0), third_len).unwrap();
    assert!(data.iter().all(|&b| b == 0x33));
    assert_eq!(mmu.stats().segment_evictions, 1);
    assert_eq!(mmu.stats().compactions, 1);
    assert!(!mmu.segment(0).unwrap().valid);

    // segment 0's frames are gone, segment 1's frames followed it to 0
    let first_vpn = |base: u32| base / 1024;
    assert!(!mmu.page_entry(0).unwrap().resident);
    assert!(!mmu.page_entry(first_vpn(10 * MIB) - 1).unwrap().resident);
    assert_eq!(mmu.segment(1).unwrap().base, 0);
    assert_eq!(mmu.frame_entry(0).unwrap().owner, Some(first_vpn(32 * MIB)));
    assert_eq!(mmu.segment(2).unwrap().base, 16 * MIB);
    assert_eq!(
        mmu.frame_entry(first_vpn(16 * MIB)).unwrap().owner,
        Some(first_vpn(64 * MIB))
    );
    mmu.check_invariants().unwrap();

    assert_eq!(mmu.read(la(0, 0), 77).unwrap(), vec![0x0F; 77]);
    assert!(mmu.segment(0).unwrap().valid);
    mmu.check_invariants().unwrap();
}

#[test]
fn test_cross_segment_read_rejected_without_loading() {
    for mode in [Mode::Segmented, Mode::SegmentedPaged] {
        let store = CountingStore::new(Disk::new(MmuConfig::default().disk_size));
        let mut mmu = AddressTranslator::new(MmuConfig::with_mode(mode), store.clone()).unwrap();
        mmu.register_segment(4, 0, 4096, 1000, false).unwrap();

        let err = mmu.read(la(4, 999), 2).unwrap_err();
        assert_eq!(
            err,
            MmuError::CrossSegmentRead {
                selector: 4,
                offset: 999,
                len: 2,
                limit: 1000
            }
        );
        assert!(matches!(
            mmu.read(la(4, 1000), 1),
            Err(MmuError::InvalidAddress(_))
        ));
        assert!(!mmu.segment(4).unwrap().valid, "{:?}", mode);
        assert_eq!(store.reads(), 0, "{:?}", mode);
    }
}

#[test]
fn test_out_of_memory_leaves_table_alone() {
    let mut mmu = AddressTranslator::new(
        MmuConfig::with_mode(Mode::Segmented),
        Disk::new(MmuConfig::default().disk_size),
    )
    .unwrap();
    mmu.register_segment(0, 0, 0, 4 * MIB, true).unwrap();
    mmu.register_segment(1, 4 * MIB, 0, 4 * MIB, true).unwrap();
    mmu.register_segment(2, 0, 0, 40 * MIB, false).unwrap();
    let before: Vec<_> = mmu.segments().iter().map(|(i, d)| (i, *d)).collect();

    let err = mmu.read(la(2, 0), 1).unwrap_err();
    assert!(matches!(err, MmuError::OutOfMemory { .. }));

    let after: Vec<_> = mmu.segments().iter().map(|(i, d)| (i, *d)).collect();
    assert_eq!(before, after);
    assert_eq!(mmu.stats().segment_evictions, 0);
}

// ==========================================================================
// Paging
// ==========================================================================

#[test]
fn test_sub_page_fraction_is_stable() {
    let split = 20 * MIB as u64;
    let mut disk = Disk::new(MmuConfig::default().disk_size);
    disk.fill(split - 1000, 1000, 0x0F).unwrap();
    disk.fill(split, 1000, 0x03).unwrap();
    let mut mmu =
        AddressTranslator::new(MmuConfig::with_mode(Mode::SegmentedPaged), disk).unwrap();
    mmu.register_segment(0, 0, (split - 1000) as u32, 2000, false)
        .unwrap();

    let first = mmu.read(la(0, 0), 1000).unwrap();
    let second = mmu.read(la(0, 1000), 1000).unwrap();
    assert_eq!(first, vec![0x0F; 1000]);
    assert_eq!(second, vec![0x03; 1000]);

    assert_eq!(mmu.read(la(0, 0), 1000).unwrap(), first);
    assert_eq!(mmu.read(la(0, 1000), 1000).unwrap(), second);

    let whole = mmu.read(la(0, 0), 2000).unwrap();
    assert_eq!(&whole[..1000], &first[..]);
    assert_eq!(&whole[1000..], &second[..]);
    mmu.check_invariants().unwrap();
}

#[test]
fn test_page_lru_with_full_memory() {
    let config = MmuConfig {
        memory_size: 4 * 1024,
        page_size: 1024,
        disk_size: 64 * 1024,
        ..MmuConfig::with_mode(Mode::SegmentedPaged)
    };
    let mut disk = Disk::new(config.disk_size);
    for vpn in 0..64u64 {
        disk.fill(vpn * 1024, 1024, vpn as u8).unwrap();
    }
    let mut mmu = AddressTranslator::new(config, disk).unwrap();
    // forced valid: no frames reserved, every page is demand loaded
    mmu.register_segment(0, 0, 0, 32 * 1024, true).unwrap();
    let page = |p: u32| la(0, p * 1024);

    for p in 0..4 {
        assert_eq!(mmu.read(page(p), 1).unwrap(), vec![p as u8]);
    }
    // every frame occupied; refresh pages 0 and 1
    mmu.read(page(1), 1).unwrap();
    mmu.read(page(0), 1).unwrap();

    // page 2 (frame 2) is now the oldest, then page 3
    assert_eq!(mmu.read(page(10), 1).unwrap(), vec![10]);
    assert_eq!(mmu.page_entry(10).unwrap().frame, 2);
    assert!(!mmu.page_entry(2).unwrap().resident);
    assert_eq!(mmu.read(page(11), 1).unwrap(), vec![11]);
    assert_eq!(mmu.page_entry(11).unwrap().frame, 3);

    for frame in 0..4 {
        let entry = mmu.frame_entry(frame).unwrap();
        let owner = entry.owner.unwrap();
        let pte = mmu.page_entry(owner).unwrap();
        assert!(pte.resident && pte.frame == frame);
    }
    assert_eq!(mmu.stats().page_faults, 6);
    assert_eq!(mmu.stats().page_evictions, 2);
    mmu.check_invariants().unwrap();
}

#[test]
fn test_paged_translate_gives_frame_address() {
    let mut mmu = AddressTranslator::new(
        MmuConfig::with_mode(Mode::SegmentedPaged),
        Disk::new(MmuConfig::default().disk_size),
    )
    .unwrap();
    mmu.register_segment(3, 0, 5 * 1024, 4 * 1024, false).unwrap();

    // registration reserves frames 0..2 for pages 5 and 6
    let physical = mmu.translate(la(3, 1024 + 17), 1).unwrap();
    assert_eq!(physical, PhysicalAddress(1024 + 17));
    assert_eq!(mmu.page_entry(6).unwrap().frame, 1);
}

// ==========================================================================
// Real mode
// ==========================================================================

fn patterned_disk() -> Arc<Disk> {
    let mut disk = Disk::new(1 << 20);
    let pattern: Vec<u8> = (0..=255u8).collect();
    for block in 0..(1 << 20) / 256 {
        disk.write(block * 256 + block % 7, &pattern[..249]).unwrap();
    }
    Arc::new(disk)
}

proptest! {
    #[test]
    fn prop_real_mode_passthrough(
        selector in 0u16..8192,
        offset in 0u32..(1 << 20) - 512,
        len in 0usize..512,
    ) {
        let disk = patterned_disk();
        let config = MmuConfig {
            disk_size: 1 << 20,
            ..MmuConfig::with_mode(Mode::Real)
        };
        let mut mmu = AddressTranslator::new(config, disk.clone()).unwrap();
        // table contents play no part in real mode
        mmu.register_segment(selector, 0, 0, 16, true).unwrap();

        let expected = disk.read(offset as u64, len).unwrap();
        prop_assert_eq!(mmu.read(la(selector, offset), len).unwrap(), expected);
        prop_assert_eq!(mmu.translate(la(selector, offset), len).unwrap(), PhysicalAddress(offset));
    }
}
