//! Page table, reverse page table and fully-associative LRU replacement.

use std::ops::Range;

use log::debug;

use crate::error::{MmuError, Result};
use crate::memory::{BackingStore, ResidentMemory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    pub frame: u32,
    pub resident: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReversePageTableEntry {
    pub resident: bool,
    /// Virtual page currently held by the frame.
    pub owner: Option<u32>,
    pub last_access: u64,
}

/// Virtual page -> frame. `None` marks a page nobody has populated yet.
#[derive(Debug, Clone)]
pub struct PageTable {
    entries: Vec<Option<PageTableEntry>>,
}

impl PageTable {
    pub fn new(pages: usize) -> Self {
        PageTable {
            entries: vec![None; pages],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, vpn: u32) -> Option<&PageTableEntry> {
        self.entries.get(vpn as usize).and_then(Option::as_ref)
    }

    /// Give every page in `vpns` a (non-resident) entry. Returns how many were new.
    pub fn populate(&mut self, vpns: Range<u32>) -> usize {
        let end = (vpns.end as usize).min(self.entries.len());
        let start = (vpns.start as usize).min(end);
        let mut added = 0;
        for slot in &mut self.entries[start..end] {
            if slot.is_none() {
                *slot = Some(PageTableEntry {
                    frame: 0,
                    resident: false,
                });
                added += 1;
            }
        }
        added
    }

    fn map(&mut self, vpn: u32, frame: u32) {
        if let Some(slot) = self.entries.get_mut(vpn as usize) {
            *slot = Some(PageTableEntry {
                frame,
                resident: true,
            });
        }
    }

    fn unmap(&mut self, vpn: u32) {
        if let Some(Some(entry)) = self.entries.get_mut(vpn as usize) {
            entry.resident = false;
        }
    }

    /// Mark every page non-resident; populated entries stay populated.
    pub fn reset(&mut self) {
        for entry in self.entries.iter_mut().flatten() {
            entry.resident = false;
        }
    }

    pub fn resident_count(&self) -> usize {
        self.entries.iter().flatten().filter(|e| e.resident).count()
    }
}

/// Frame -> owning page, with the access stamps used to pick victims.
#[derive(Debug, Clone)]
pub struct ReversePageTable {
    frames: Vec<ReversePageTableEntry>,
}

impl ReversePageTable {
    pub fn new(frames: usize) -> Self {
        ReversePageTable {
            frames: vec![ReversePageTableEntry::default(); frames],
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, frame: u32) -> Option<&ReversePageTableEntry> {
        self.frames.get(frame as usize)
    }

    /// Lowest-index frame holding nothing.
    pub fn free_frame(&self) -> Option<u32> {
        self.frames
            .iter()
            .position(|e| !e.resident)
            .map(|i| i as u32)
    }

    /// Resident frame with the oldest access (ties: lowest index).
    pub fn lru_victim(&self) -> Option<u32> {
        self.frames
            .iter()
            .enumerate()
            .filter(|(_, e)| e.resident)
            .min_by_key(|(i, e)| (e.last_access, *i))
            .map(|(i, _)| i as u32)
    }

    fn take(&mut self, frame: u32) -> ReversePageTableEntry {
        self.frames
            .get_mut(frame as usize)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    fn put(&mut self, frame: u32, entry: ReversePageTableEntry) {
        if let Some(slot) = self.frames.get_mut(frame as usize) {
            *slot = entry;
        }
    }

    fn touch(&mut self, frame: u32, now: u64) {
        if let Some(slot) = self.frames.get_mut(frame as usize) {
            slot.last_access = now;
        }
    }

    pub fn reset(&mut self) {
        self.frames
            .iter_mut()
            .for_each(|e| *e = ReversePageTableEntry::default());
    }

    pub fn resident_count(&self) -> usize {
        self.frames.iter().filter(|e| e.resident).count()
    }
}

/// Page table and reverse page table kept in lockstep.
#[derive(Debug, Clone)]
pub struct Pager {
    table: PageTable,
    reverse: ReversePageTable,
    page_size: usize,
}

impl Pager {
    pub fn new(pages: usize, frames: usize, page_size: usize) -> Self {
        Pager {
            table: PageTable::new(pages),
            reverse: ReversePageTable::new(frames),
            page_size,
        }
    }

    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    pub fn reverse_table(&self) -> &ReversePageTable {
        &self.reverse
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn populate(&mut self, vpns: Range<u32>) -> usize {
        self.table.populate(vpns)
    }

    /// Frame holding `vpn`, or `None` if the page is not resident.
    ///
    /// Reaching an unpopulated entry, or a frame that names a different
    /// owner, is an internal consistency failure.
    pub fn lookup(&mut self, vpn: u32, now: u64) -> Result<Option<u32>> {
        let entry = *self.table.get(vpn).ok_or_else(|| {
            MmuError::inconsistent(format!("page {} looked up before being populated", vpn))
        })?;
        if !entry.resident {
            return Ok(None);
        }
        let owner_ok = self
            .reverse
            .get(entry.frame)
            .is_some_and(|r| r.resident && r.owner == Some(vpn));
        if !owner_ok {
            return Err(MmuError::inconsistent(format!(
                "page {} maps frame {} but the reverse entry disagrees",
                vpn, entry.frame
            )));
        }
        self.reverse.touch(entry.frame, now);
        Ok(Some(entry.frame))
    }

    /// Page fault: bring `vpn` into a free frame, or replace the LRU frame.
    /// Returns the frame and the page evicted from it, if any.
    pub fn fault(
        &mut self,
        vpn: u32,
        disk: &dyn BackingStore,
        memory: &mut ResidentMemory,
        now: u64,
    ) -> Result<(u32, Option<u32>)> {
        let frame = match self.reverse.free_frame() {
            Some(frame) => frame,
            None => self
                .reverse
                .lru_victim()
                .ok_or_else(|| MmuError::inconsistent("no frames to replace"))?,
        };
        let evicted = self.load_into(vpn, frame, disk, memory, now)?;
        Ok((frame, evicted))
    }

    /// Load `vpn` from the backing store into `frame`, evicting its occupant.
    pub fn load_into(
        &mut self,
        vpn: u32,
        frame: u32,
        disk: &dyn BackingStore,
        memory: &mut ResidentMemory,
        now: u64,
    ) -> Result<Option<u32>> {
        match self.table.get(vpn) {
            None => {
                return Err(MmuError::inconsistent(format!(
                    "page {} loaded before being populated",
                    vpn
                )));
            }
            Some(entry) if entry.resident => {
                return Err(MmuError::inconsistent(format!(
                    "page {} is already resident in frame {}",
                    vpn, entry.frame
                )));
            }
            Some(_) => {}
        }
        if frame as usize >= self.reverse.len() {
            return Err(MmuError::inconsistent(format!(
                "frame {} out of range",
                frame
            )));
        }

        let bytes = disk.read(vpn as u64 * self.page_size as u64, self.page_size)?;
        let evicted = self.evict_frame(frame);
        memory.write(frame as usize * self.page_size, &bytes)?;
        self.table.map(vpn, frame);
        self.reverse.put(
            frame,
            ReversePageTableEntry {
                resident: true,
                owner: Some(vpn),
                last_access: now,
            },
        );
        match evicted {
            Some(old) => debug!("page {} -> frame {} (replaced page {})", vpn, frame, old),
            None => debug!("page {} -> frame {}", vpn, frame),
        }
        Ok(evicted)
    }

    /// Drop whatever page `frame` holds. Returns that page.
    pub fn evict_frame(&mut self, frame: u32) -> Option<u32> {
        let entry = self.reverse.take(frame);
        if !entry.resident {
            return None;
        }
        let owner = entry.owner?;
        self.table.unmap(owner);
        Some(owner)
    }

    /// Make `vpn` non-resident. Returns whether it was resident.
    pub fn invalidate_page(&mut self, vpn: u32) -> bool {
        match self.table.get(vpn) {
            Some(entry) if entry.resident => {
                let frame = entry.frame;
                self.table.unmap(vpn);
                self.reverse.take(frame);
                true
            }
            _ => false,
        }
    }

    fn frames_overlapping(&self, addr: usize, len: usize) -> Range<u32> {
        if len == 0 {
            return 0..0;
        }
        let first = addr / self.page_size;
        let end = (addr + len).div_ceil(self.page_size).min(self.reverse.len());
        (first.min(end) as u32)..(end as u32)
    }

    /// Evict every resident frame overlapping `[addr, addr + len)`.
    pub fn evict_range(&mut self, addr: usize, len: usize) -> usize {
        self.frames_overlapping(addr, len)
            .filter(|&frame| self.evict_frame(frame).is_some())
            .count()
    }

    /// Follow a byte move of `[from, from + len)` to `to` in resident memory.
    ///
    /// Frames wholly inside the moved region keep their pages under new frame
    /// numbers; any other resident frame touching either span is evicted.
    /// Returns the number of evicted frames.
    pub fn relocate(&mut self, from: usize, to: usize, len: usize) -> Result<usize> {
        if len == 0 || from == to {
            return Ok(0);
        }
        let ps = self.page_size;
        let carried = if from % ps == 0 && to % ps == 0 {
            (from / ps) as u32..((from + len) / ps) as u32
        } else {
            0..0
        };

        let mut evicted = 0;
        let touched = self
            .frames_overlapping(from, len)
            .chain(self.frames_overlapping(to, len));
        for frame in touched.collect::<Vec<_>>() {
            if !carried.contains(&frame) && self.evict_frame(frame).is_some() {
                evicted += 1;
            }
        }

        let mut moving: Vec<u32> = carried
            .filter(|&f| self.reverse.get(f).is_some_and(|e| e.resident))
            .collect();
        if to > from {
            moving.reverse();
        }
        for frame in moving {
            let target = if to < from {
                frame - ((from - to) / ps) as u32
            } else {
                frame + ((to - from) / ps) as u32
            };
            if self.reverse.get(target).is_none_or(|e| e.resident) {
                return Err(MmuError::inconsistent(format!(
                    "frame {} cannot move onto frame {}",
                    frame, target
                )));
            }
            let entry = self.reverse.take(frame);
            if let Some(owner) = entry.owner {
                self.table.map(owner, target);
            }
            self.reverse.put(target, entry);
        }
        Ok(evicted)
    }

    /// Every page and frame non-resident.
    pub fn reset(&mut self) {
        self.table.reset();
        self.reverse.reset();
    }

    /// Resident pages and frames name each other one-to-one.
    pub fn check_invariants(&self) -> Result<()> {
        for (vpn, entry) in self.table.entries.iter().enumerate() {
            let Some(entry) = entry.filter(|e| e.resident) else {
                continue;
            };
            let agrees = self
                .reverse
                .get(entry.frame)
                .is_some_and(|r| r.resident && r.owner == Some(vpn as u32));
            if !agrees {
                return Err(MmuError::inconsistent(format!(
                    "page {} maps frame {} but the reverse entry disagrees",
                    vpn, entry.frame
                )));
            }
        }
        for (frame, entry) in self.reverse.frames.iter().enumerate() {
            if !entry.resident {
                continue;
            }
            let agrees = entry.owner.is_some_and(|vpn| {
                self.table
                    .get(vpn)
                    .is_some_and(|e| e.resident && e.frame == frame as u32)
            });
            if !agrees {
                return Err(MmuError::inconsistent(format!(
                    "frame {} claims page {:?} which does not map back to it",
                    frame, entry.owner
                )));
            }
        }
        Ok(())
    }
}
