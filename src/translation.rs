use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use log::{debug, trace};

use crate::bits::{format_bits, parse_bits};
use crate::config::{ConfigError, MmuConfig, Mode};
use crate::constants::*;
use crate::error::{MmuError, Result};
use crate::memory::{BackingStore, InvalidationSink, NullSink, ResidentMemory};
use crate::paging::{PageTableEntry, Pager, ReversePageTableEntry};
use crate::segment::{Placement, SegmentDescriptor, SegmentTable};

/// A decoded 48-bit logical address: selector | reserved | offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogicalAddress {
    raw: u64,
}

impl LogicalAddress {
    pub fn new(selector: u16, offset: u32) -> Result<Self> {
        if selector as u64 > SELECTOR_MASK {
            return Err(MmuError::invalid_address(format!(
                "selector {} does not fit {} bits",
                selector, SELECTOR_BITS
            )));
        }
        Ok(LogicalAddress {
            raw: ((selector as u64) << SELECTOR_SHIFT) | offset as u64,
        })
    }

    pub fn from_raw(raw: u64) -> Result<Self> {
        if raw >> LOGICAL_ADDR_BITS != 0 {
            return Err(MmuError::invalid_address(format!(
                "{:#x} is wider than {} bits",
                raw, LOGICAL_ADDR_BITS
            )));
        }
        Ok(LogicalAddress { raw })
    }

    /// Decode the 48-character wire form.
    pub fn parse(bits: &str) -> Result<Self> {
        Self::from_raw(parse_bits(bits, LOGICAL_ADDR_BITS)?)
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.raw
    }

    #[inline]
    pub fn selector(&self) -> u16 {
        ((self.raw >> SELECTOR_SHIFT) & SELECTOR_MASK) as u16
    }

    /// The three unused bits between selector and offset.
    #[inline]
    pub fn reserved(&self) -> u8 {
        ((self.raw >> RESERVED_SHIFT) & RESERVED_MASK) as u8
    }

    #[inline]
    pub fn offset(&self) -> u32 {
        (self.raw & OFFSET_MASK) as u32
    }

    pub fn to_bits(&self) -> String {
        format_bits(self.raw, LOGICAL_ADDR_BITS)
    }
}

impl FromStr for LogicalAddress {
    type Err = MmuError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LA({:#x}) = (sel={}, rsv={}, off={:#x})",
            self.raw,
            self.selector(),
            self.reserved(),
            self.offset()
        )
    }
}

/// 32-bit address after segmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinearAddress(pub u32);

impl LinearAddress {
    #[inline]
    pub fn page_number(&self, page_bits: u32) -> u32 {
        self.0 >> page_bits
    }

    #[inline]
    pub fn page_offset(&self, page_bits: u32) -> u32 {
        self.0 & ((1 << page_bits) - 1)
    }

    pub fn to_bits(&self) -> String {
        format_bits(self.0 as u64, LINEAR_ADDR_BITS)
    }
}

/// 32-bit address into resident memory (or, in real mode, the disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u32);

impl PhysicalAddress {
    #[inline]
    pub fn from_frame(frame: u32, page_bits: u32, offset: u32) -> Self {
        PhysicalAddress((frame << page_bits) | offset)
    }

    pub fn parse(bits: &str) -> Result<Self> {
        parse_bits(bits, PHYSICAL_ADDR_BITS).map(|raw| PhysicalAddress(raw as u32))
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub fn to_bits(&self) -> String {
        format_bits(self.0 as u64, PHYSICAL_ADDR_BITS)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA({:#x})", self.0)
    }
}

/// Running counters of residency work done by a translator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub segment_faults: u64,
    pub page_faults: u64,
    pub segment_evictions: u64,
    pub page_evictions: u64,
    pub compactions: u64,
    pub bytes_loaded: u64,
}

/// Owned translation context: segment table, page tables, resident memory
/// and the backing store they load from.
pub struct AddressTranslator {
    config: MmuConfig,
    segments: SegmentTable,
    pager: Pager,
    memory: ResidentMemory,
    disk: Box<dyn BackingStore + Send>,
    clock: u64,
    stats: FaultStats,
}

impl AddressTranslator {
    pub fn new(
        config: MmuConfig,
        disk: impl BackingStore + Send + 'static,
    ) -> std::result::Result<Self, ConfigError> {
        Self::with_sink(config, disk, NullSink)
    }

    /// Like [`AddressTranslator::new`], reporting resident writes to `sink`.
    pub fn with_sink(
        config: MmuConfig,
        disk: impl BackingStore + Send + 'static,
        sink: impl InvalidationSink + Send + 'static,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        if disk.capacity() < config.disk_size {
            return Err(ConfigError::Invalid(format!(
                "backing store holds {} bytes, configuration expects {}",
                disk.capacity(),
                config.disk_size
            )));
        }
        // page tables only exist when paging is on
        let pages = if config.paging { config.num_pages() } else { 0 };
        let frames = if config.paging { config.num_frames() } else { 0 };
        Ok(AddressTranslator {
            segments: SegmentTable::new(config.memory_size),
            pager: Pager::new(pages, frames, config.page_size),
            memory: ResidentMemory::with_sink(config.memory_size, Box::new(sink)),
            disk: Box::new(disk),
            clock: 0,
            stats: FaultStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &MmuConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.config.mode()
    }

    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    pub fn memory(&self) -> &ResidentMemory {
        &self.memory
    }

    pub fn segment(&self, selector: u16) -> Option<&SegmentDescriptor> {
        self.segments.get(selector).ok()
    }

    pub fn segments(&self) -> &SegmentTable {
        &self.segments
    }

    pub fn page_entry(&self, vpn: u32) -> Option<PageTableEntry> {
        self.pager.page_table().get(vpn).copied()
    }

    pub fn frame_entry(&self, frame: u32) -> Option<ReversePageTableEntry> {
        self.pager.reverse_table().get(frame).copied()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    // ------------------------------------------------------------------
    // Translation
    // ------------------------------------------------------------------

    /// Read `len` bytes at `logical`, faulting segments and pages in as needed.
    pub fn read(&mut self, logical: LogicalAddress, len: usize) -> Result<Vec<u8>> {
        self.read_with_address(logical, len).map(|(_, data)| data)
    }

    /// Like [`AddressTranslator::read`], also returning the physical address
    /// of the first byte. One clock tick and one table walk per call.
    pub fn read_with_address(
        &mut self,
        logical: LogicalAddress,
        len: usize,
    ) -> Result<(PhysicalAddress, Vec<u8>)> {
        let now = self.tick();
        trace!("read {} len={} mode={:?}", logical, len, self.mode());
        match self.mode() {
            // real mode never caches
            Mode::Real => {
                let data = self.disk.read(logical.offset() as u64, len)?;
                Ok((PhysicalAddress(logical.offset()), data))
            }
            Mode::Segmented => {
                let physical = self.resolve_segmented(logical, len, now)?;
                let data = self.memory.read(physical.as_usize(), len)?;
                Ok((physical, data))
            }
            Mode::SegmentedPaged => self.read_paged(logical, len, now),
        }
    }

    /// [`AddressTranslator::read`] taking the 48-bit wire form.
    pub fn read_bits(&mut self, logical: &str, len: usize) -> Result<Vec<u8>> {
        let logical = LogicalAddress::parse(logical)?;
        self.read(logical, len)
    }

    /// Physical address of the first byte of a `len`-byte access.
    ///
    /// Runs the same checks and faults as `read`; in paging mode only the
    /// first page of the range is made resident.
    pub fn translate(&mut self, logical: LogicalAddress, len: usize) -> Result<PhysicalAddress> {
        let now = self.tick();
        trace!("translate {} len={} mode={:?}", logical, len, self.mode());
        match self.mode() {
            Mode::Real => {
                let offset = logical.offset() as u64;
                let in_range = offset
                    .checked_add(len as u64)
                    .is_some_and(|end| end <= self.disk.capacity());
                if !in_range {
                    return Err(MmuError::invalid_address(format!(
                        "real-mode range [{:#x}, +{}) exceeds disk capacity",
                        offset, len
                    )));
                }
                Ok(PhysicalAddress(logical.offset()))
            }
            Mode::Segmented => self.resolve_segmented(logical, len, now),
            Mode::SegmentedPaged => {
                let linear = self.resolve_linear(logical, len, now)?;
                self.resolve_page(linear, now)
            }
        }
    }

    /// [`AddressTranslator::translate`] on wire forms: 48 bits in, 32 bits out.
    pub fn translate_bits(&mut self, logical: &str, len: usize) -> Result<String> {
        let logical = LogicalAddress::parse(logical)?;
        self.translate(logical, len).map(|pa| pa.to_bits())
    }

    fn resolve_segmented(
        &mut self,
        logical: LogicalAddress,
        len: usize,
        now: u64,
    ) -> Result<PhysicalAddress> {
        let selector = logical.selector();
        let offset = logical.offset();
        let desc = *self.segments.get(selector)?;
        desc.check_bounds(selector, offset, len)?;

        if !desc.valid {
            self.load_segment(selector, now)?;
        }
        self.segments.touch(selector, now)?;

        // resident base, read back after the fault
        let base = self.segments.get(selector)?.base;
        Ok(PhysicalAddress(base + offset))
    }

    /// Segment fault in segmentation-only mode.
    fn load_segment(&mut self, selector: u16, now: u64) -> Result<()> {
        let desc = *self.segments.get(selector)?;
        let size = desc.limit as usize;
        if size > self.memory.capacity() {
            return Err(MmuError::OutOfMemory {
                requested: size as u64,
                capacity: self.memory.capacity(),
            });
        }
        debug!(
            "segment {} fault: loading {:#x} bytes from disk {:#x}",
            selector, size, desc.disk_base
        );

        let bytes = self.disk.read(desc.disk_base as u64, size)?;
        let placement = self.segments.allocate(size, 1)?;
        self.apply_placement(&placement)?;
        self.memory.write(placement.base as usize, &bytes)?;
        self.segments.commit(selector, placement.base, size as u32, now)?;

        self.stats.segment_faults += 1;
        self.stats.bytes_loaded += size as u64;
        Ok(())
    }

    /// Pages spanned by a segment's linear range.
    fn segment_pages(&self, desc: &SegmentDescriptor) -> Result<Range<u32>> {
        let start = desc.disk_base as u64;
        let end = start + desc.limit as u64;
        if end > self.config.disk_size {
            return Err(MmuError::invalid_address(format!(
                "segment range [{:#x}, {:#x}) exceeds disk capacity {:#x}",
                start, end, self.config.disk_size
            )));
        }
        let ps = self.config.page_size as u64;
        if desc.limit == 0 {
            return Ok(0..0);
        }
        Ok((start / ps) as u32..end.div_ceil(ps) as u32)
    }

    fn resolve_linear(
        &mut self,
        logical: LogicalAddress,
        len: usize,
        now: u64,
    ) -> Result<LinearAddress> {
        let selector = logical.selector();
        let offset = logical.offset();
        let desc = *self.segments.get(selector)?;
        desc.check_bounds(selector, offset, len)?;

        let start = desc.disk_base as u64 + offset as u64;
        let end = start + len as u64;
        if start > u32::MAX as u64 || end > self.config.disk_size {
            return Err(MmuError::invalid_address(format!(
                "linear range [{:#x}, {:#x}) exceeds disk capacity {:#x}",
                start, end, self.config.disk_size
            )));
        }

        if !desc.valid {
            self.register_paged_segment(selector, now)?;
        }
        self.segments.touch(selector, now)?;
        let linear = LinearAddress(start as u32);
        trace!("segment {} -> linear {}", selector, linear.to_bits());
        Ok(linear)
    }

    /// Segment fault in paging mode: populate the segment's page entries,
    /// reserve frames for half of its pages and load those pages.
    fn register_paged_segment(&mut self, selector: u16, now: u64) -> Result<()> {
        let desc = *self.segments.get(selector)?;
        let pages = self.segment_pages(&desc)?;
        let ps = self.config.page_size;
        let reserve = pages.len().div_ceil(2);
        let size = reserve * ps;
        debug!(
            "segment {} registration: pages {:?}, reserving {} frame(s)",
            selector, pages, reserve
        );

        let placement = if reserve > 0 {
            self.segments.allocate(size, ps)?
        } else {
            Placement::default()
        };
        self.apply_placement(&placement)?;
        self.pager.populate(pages.clone());

        let first_frame = placement.base as usize / ps;
        for (i, vpn) in pages.take(reserve).enumerate() {
            if self.pager.lookup(vpn, now)?.is_some() {
                continue;
            }
            let frame = (first_frame + i) as u32;
            if let Some(old) =
                self.pager
                    .load_into(vpn, frame, &*self.disk, &mut self.memory, now)?
            {
                debug!("registration of segment {} displaced page {}", selector, old);
                self.stats.page_evictions += 1;
            }
            self.stats.bytes_loaded += ps as u64;
        }

        self.segments
            .commit(selector, placement.base, size as u32, now)?;
        self.stats.segment_faults += 1;
        Ok(())
    }

    fn read_paged(
        &mut self,
        logical: LogicalAddress,
        len: usize,
        now: u64,
    ) -> Result<(PhysicalAddress, Vec<u8>)> {
        let linear = self.resolve_linear(logical, len, now)?;
        let ps = self.config.page_size as u64;
        let end = linear.0 as u64 + len as u64;

        let mut first = None;
        let mut out = Vec::with_capacity(len);
        let mut cursor = linear.0 as u64;
        while cursor < end {
            let physical = self.resolve_page(LinearAddress(cursor as u32), now)?;
            first.get_or_insert(physical);
            let chunk = (ps - cursor % ps).min(end - cursor);
            out.extend_from_slice(self.memory.slice(physical.as_usize(), chunk as usize)?);
            cursor += chunk;
        }
        let first = match first {
            Some(physical) => physical,
            // empty read: still report where it would start
            None => self.resolve_page(linear, now)?,
        };
        Ok((first, out))
    }

    /// Frame address for `linear`, faulting the page in if it is not resident.
    fn resolve_page(&mut self, linear: LinearAddress, now: u64) -> Result<PhysicalAddress> {
        let bits = self.config.page_bits();
        let vpn = linear.page_number(bits);
        let frame = match self.pager.lookup(vpn, now)? {
            Some(frame) => frame,
            None => {
                let (frame, evicted) =
                    self.pager
                        .fault(vpn, &*self.disk, &mut self.memory, now)?;
                self.stats.page_faults += 1;
                self.stats.bytes_loaded += self.config.page_size as u64;
                if evicted.is_some() {
                    self.stats.page_evictions += 1;
                }
                frame
            }
        };
        Ok(PhysicalAddress::from_frame(
            frame,
            bits,
            linear.page_offset(bits),
        ))
    }

    /// Carry out what the segment allocator decided: drop evicted regions,
    /// move compacted ones, and clear the new region of stray frames.
    fn apply_placement(&mut self, placement: &Placement) -> Result<()> {
        let paging = self.config.paging;
        for eviction in &placement.evicted {
            self.stats.segment_evictions += 1;
            if paging {
                let dropped = self.pager.evict_range(eviction.base as usize, eviction.len);
                self.stats.page_evictions += dropped as u64;
            }
        }
        if !placement.relocated.is_empty() {
            self.stats.compactions += 1;
        }
        for mv in &placement.relocated {
            self.memory
                .relocate(mv.from as usize, mv.to as usize, mv.len)?;
            if paging {
                let dropped = self
                    .pager
                    .relocate(mv.from as usize, mv.to as usize, mv.len)?;
                self.stats.page_evictions += dropped as u64;
            }
        }
        if paging && placement.len > 0 {
            let dropped = self
                .pager
                .evict_range(placement.base as usize, placement.len);
            self.stats.page_evictions += dropped as u64;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Administrative interface (bypasses the fault path)
    // ------------------------------------------------------------------

    /// Write resident bytes directly; the invalidation sink is notified.
    pub fn write(&mut self, physical: PhysicalAddress, bytes: &[u8]) -> Result<()> {
        self.memory.write(physical.as_usize(), bytes)
    }

    /// Force a descriptor into the segment table.
    ///
    /// In paging mode the segment's pages are populated and a valid
    /// descriptor reserves no resident region.
    pub fn register_segment(
        &mut self,
        selector: u16,
        base: u32,
        disk_base: u32,
        limit: u32,
        valid: bool,
    ) -> Result<()> {
        let mut desc = SegmentDescriptor::new(base, disk_base, limit, valid);
        if self.config.paging {
            // pages of a forced descriptor are demand loaded; it holds no frames
            desc.reserved = 0;
        }
        let pages = if self.config.segmentation {
            self.segment_pages(&desc)?
        } else {
            0..0
        };
        desc.last_access = self.tick();
        self.segments.insert(selector, desc)?;
        if self.config.paging {
            self.pager.populate(pages);
        }
        debug!(
            "registered segment {}: base={:#x} disk={:#x} limit={:#x} valid={}",
            selector, base, disk_base, limit, valid
        );
        Ok(())
    }

    /// Force a segment and/or a page out of residency.
    pub fn invalidate(&mut self, segment: Option<u16>, page: Option<u32>) -> Result<()> {
        let page = page.filter(|_| self.config.paging);
        if let Some(vpn) = page.filter(|&vpn| vpn as usize >= self.pager.page_table().len()) {
            return Err(MmuError::invalid_address(format!(
                "page {} is outside the page table",
                vpn
            )));
        }
        if let Some(selector) = segment {
            self.segments.invalidate(selector)?;
        }
        if let Some(vpn) = page {
            self.pager.invalidate_page(vpn);
        }
        Ok(())
    }

    /// Empty the segment table and make every page non-resident.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.pager.reset();
        debug!("tables cleared");
    }

    /// Verify segment regions are disjoint and in bounds and that the page
    /// and reverse page tables agree.
    pub fn check_invariants(&self) -> Result<()> {
        self.segments.check_invariants()?;
        self.pager.check_invariants()
    }
}
