//! Segment table and the resident-space allocation policy.
//!
//! Placement escalates first-fit -> compaction -> LRU eviction. The table only
//! decides; the returned [`Placement`] tells the caller which bytes to move and
//! which regions stopped being resident.

use std::ops::Range;

use log::{debug, info};

use crate::constants::*;
use crate::error::{MmuError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Start of the segment's region in resident memory.
    pub base: u32,
    /// Where the segment lives on the backing store (paging: its linear base).
    pub disk_base: u32,
    /// Segment length in bytes (31 bits).
    pub limit: u32,
    /// Resident bytes held while valid. Equals `limit` in segmentation mode,
    /// the frame reservation in paging mode.
    pub reserved: u32,
    pub valid: bool,
    pub last_access: u64,
}

impl SegmentDescriptor {
    pub fn new(base: u32, disk_base: u32, limit: u32, valid: bool) -> Self {
        SegmentDescriptor {
            base,
            disk_base,
            limit,
            reserved: limit,
            valid,
            last_access: 0,
        }
    }

    /// Resident region `[base, base + reserved)`.
    #[inline]
    pub fn region(&self) -> Range<usize> {
        let start = self.base as usize;
        start..start + self.reserved as usize
    }

    /// Reject reads that start or end outside `[0, limit)`.
    pub fn check_bounds(&self, selector: u16, offset: u32, len: usize) -> Result<()> {
        if offset >= self.limit {
            return Err(MmuError::invalid_address(format!(
                "offset {:#x} is outside segment {} (limit {:#x})",
                offset, selector, self.limit
            )));
        }
        let end = (offset as u64).checked_add(len as u64);
        if end.is_none_or(|end| end > self.limit as u64) {
            return Err(MmuError::CrossSegmentRead {
                selector,
                offset,
                len,
                limit: self.limit,
            });
        }
        Ok(())
    }
}

/// A segment pushed out of resident memory to make room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
    pub selector: u16,
    pub base: u32,
    pub len: usize,
}

/// A segment region slid toward address 0 during compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub selector: u16,
    pub from: u32,
    pub to: u32,
    pub len: usize,
}

/// Outcome of [`SegmentTable::allocate`]. Evictions and relocations are
/// listed in the order they were decided and must be applied in that order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    pub base: u32,
    pub len: usize,
    pub evicted: Vec<Eviction>,
    pub relocated: Vec<Relocation>,
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

#[inline]
fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

/// Selector-indexed descriptors, one slot per 13-bit selector.
#[derive(Debug, Clone)]
pub struct SegmentTable {
    slots: Vec<Option<SegmentDescriptor>>,
    capacity: usize,
}

impl SegmentTable {
    /// Empty table managing `capacity` bytes of resident memory.
    pub fn new(capacity: usize) -> Self {
        SegmentTable {
            slots: vec![None; MAX_SEGMENTS],
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, selector: u16) -> Result<&SegmentDescriptor> {
        self.slots
            .get(selector as usize)
            .and_then(Option::as_ref)
            .ok_or(MmuError::SegmentFault { index: selector })
    }

    fn get_mut(&mut self, selector: u16) -> Result<&mut SegmentDescriptor> {
        self.slots
            .get_mut(selector as usize)
            .and_then(Option::as_mut)
            .ok_or(MmuError::SegmentFault { index: selector })
    }

    /// Register `desc` at `selector`, replacing whatever was there.
    ///
    /// A valid descriptor must fit resident memory and must not overlap any
    /// other valid region.
    pub fn insert(
        &mut self,
        selector: u16,
        desc: SegmentDescriptor,
    ) -> Result<Option<SegmentDescriptor>> {
        if selector as usize >= self.slots.len() {
            return Err(MmuError::SegmentFault { index: selector });
        }
        if desc.limit > MAX_LIMIT {
            return Err(MmuError::invalid_address(format!(
                "limit {:#x} does not fit {} bits",
                desc.limit, LIMIT_BITS
            )));
        }
        if desc.valid {
            let region = desc.region();
            if region.end > self.capacity {
                return Err(MmuError::invalid_address(format!(
                    "segment {} region [{:#x}, {:#x}) exceeds resident capacity {:#x}",
                    selector, region.start, region.end, self.capacity
                )));
            }
            if let Some((other, _)) = self
                .resident_regions()
                .into_iter()
                .find(|(other, r)| *other != selector && overlaps(r, &region))
            {
                return Err(MmuError::invalid_address(format!(
                    "segment {} region [{:#x}, {:#x}) overlaps segment {}",
                    selector, region.start, region.end, other
                )));
            }
        }
        Ok(self.slots[selector as usize].replace(desc))
    }

    /// Mark a segment non-resident. Returns whether it was resident.
    pub fn invalidate(&mut self, selector: u16) -> Result<bool> {
        let desc = self.get_mut(selector)?;
        let was_valid = desc.valid;
        desc.valid = false;
        Ok(was_valid)
    }

    pub fn touch(&mut self, selector: u16, now: u64) -> Result<()> {
        self.get_mut(selector)?.last_access = now;
        Ok(())
    }

    /// Finish a fault: the segment now holds `[base, base + reserved)`.
    pub fn commit(&mut self, selector: u16, base: u32, reserved: u32, now: u64) -> Result<()> {
        let desc = self.get_mut(selector)?;
        desc.base = base;
        desc.reserved = reserved;
        desc.valid = true;
        desc.last_access = now;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    /// Registered descriptors in selector order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &SegmentDescriptor)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|d| (i as u16, d)))
    }

    /// Non-empty regions of valid segments, ascending by address.
    pub fn resident_regions(&self) -> Vec<(u16, Range<usize>)> {
        let mut regions: Vec<_> = self
            .iter()
            .filter(|(_, d)| d.valid && d.reserved > 0)
            .map(|(i, d)| (i, d.region()))
            .collect();
        regions.sort_by_key(|(i, r)| (r.start, *i));
        regions
    }

    /// Resident bytes not held by any valid segment.
    pub fn free_bytes(&self) -> usize {
        let used: usize = self.resident_regions().iter().map(|(_, r)| r.len()).sum();
        self.capacity.saturating_sub(used)
    }

    /// Lowest aligned address whose gap holds `size` bytes.
    pub fn first_fit(&self, size: usize, align: usize) -> Option<usize> {
        let mut cursor = 0usize;
        for (_, region) in self.resident_regions() {
            let start = align_up(cursor, align);
            if start + size <= region.start {
                return Some(start);
            }
            cursor = cursor.max(region.end);
        }
        let start = align_up(cursor, align);
        (start + size <= self.capacity).then_some(start)
    }

    /// Where each valid region lands when compacted, plus the end of the
    /// packed block. Regions never move upward; an unaligned region that
    /// cannot be aligned downward stays where it is.
    fn packed_layout(&self, align: usize) -> (Vec<(u16, Range<usize>, usize)>, usize) {
        let mut cursor = 0usize;
        let mut layout = Vec::new();
        for (selector, region) in self.resident_regions() {
            let aligned = align_up(cursor, align);
            let dest = if aligned <= region.start {
                aligned
            } else {
                region.start
            };
            cursor = dest + region.len();
            layout.push((selector, region, dest));
        }
        (layout, cursor)
    }

    fn fits_after_compaction(&self, size: usize, align: usize) -> bool {
        let (_, end) = self.packed_layout(align);
        align_up(end, align) + size <= self.capacity
    }

    fn compact(&mut self, align: usize) -> Vec<Relocation> {
        let (layout, _) = self.packed_layout(align);
        let mut moves = Vec::new();
        for (selector, region, dest) in layout {
            if dest == region.start {
                continue;
            }
            if let Some(desc) = self.slots[selector as usize].as_mut() {
                desc.base = dest as u32;
            }
            moves.push(Relocation {
                selector,
                from: region.start as u32,
                to: dest as u32,
                len: region.len(),
            });
        }
        if !moves.is_empty() {
            info!("compaction moved {} segment(s)", moves.len());
        }
        moves
    }

    /// Evict the valid segment with the oldest access (ties: lowest selector).
    fn evict_lru(&mut self) -> Option<Eviction> {
        let (stamp, selector) = self
            .iter()
            .filter(|(_, d)| d.valid && d.reserved > 0)
            .map(|(i, d)| (d.last_access, i))
            .min()?;
        let desc = self.slots[selector as usize].as_mut()?;
        desc.valid = false;
        info!(
            "evicted segment {} ([{:#x}, +{:#x}), last access {})",
            selector, desc.base, desc.reserved, stamp
        );
        Some(Eviction {
            selector,
            base: desc.base,
            len: desc.reserved as usize,
        })
    }

    /// Choose a home for `size` resident bytes aligned to `align`.
    ///
    /// Fails with `OutOfMemory`, changing nothing, only when `size` exceeds
    /// the whole capacity; otherwise eviction always makes room.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<Placement> {
        let align = align.max(1);
        if size > self.capacity {
            return Err(MmuError::OutOfMemory {
                requested: size as u64,
                capacity: self.capacity,
            });
        }

        if let Some(base) = self.first_fit(size, align) {
            debug!("first-fit placed {:#x} bytes at {:#x}", size, base);
            return Ok(Placement {
                base: base as u32,
                len: size,
                ..Default::default()
            });
        }

        let mut evicted = Vec::new();
        while !self.fits_after_compaction(size, align) {
            let eviction = self.evict_lru().ok_or_else(|| {
                MmuError::inconsistent("no segment left to evict but space still short")
            })?;
            evicted.push(eviction);
        }

        let relocated = self.compact(align);
        let base = self.first_fit(size, align).ok_or_else(|| {
            MmuError::inconsistent(format!("no fit for {:#x} bytes after compaction", size))
        })?;
        debug!(
            "placed {:#x} bytes at {:#x} after {} eviction(s), {} move(s)",
            size,
            base,
            evicted.len(),
            relocated.len()
        );
        Ok(Placement {
            base: base as u32,
            len: size,
            evicted,
            relocated,
        })
    }

    /// Valid regions fit resident memory and are pairwise disjoint.
    pub fn check_invariants(&self) -> Result<()> {
        let regions = self.resident_regions();
        for (selector, region) in &regions {
            if region.end > self.capacity {
                return Err(MmuError::inconsistent(format!(
                    "segment {} ends at {:#x}, past capacity {:#x}",
                    selector, region.end, self.capacity
                )));
            }
        }
        for pair in regions.windows(2) {
            let (a, ra) = &pair[0];
            let (b, rb) = &pair[1];
            if overlaps(ra, rb) {
                return Err(MmuError::inconsistent(format!(
                    "segments {} and {} overlap",
                    a, b
                )));
            }
        }
        Ok(())
    }
}
