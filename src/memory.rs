use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{MmuError, Result};

/// Granularity of the sparse disk's storage blocks.
pub const DISK_BLOCK_SIZE: usize = 4096;

/// Large byte-addressable store that resident memory is loaded from.
pub trait BackingStore {
    /// Total addressable bytes.
    fn capacity(&self) -> u64;

    /// Read `len` bytes starting at `offset`.
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
}

/// Receives "range `[addr, addr + len)` changed" notices from resident memory.
pub trait InvalidationSink {
    fn invalidate(&mut self, addr: u32, len: usize);
}

/// Sink that drops every notice.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl InvalidationSink for NullSink {
    fn invalidate(&mut self, _addr: u32, _len: usize) {}
}

/// Sink that keeps every notice; clones share the same log.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    log: Arc<Mutex<Vec<(u32, usize)>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notices received so far, oldest first.
    pub fn notices(&self) -> Vec<(u32, usize)> {
        self.log.lock().clone()
    }
}

impl InvalidationSink for RecordingSink {
    fn invalidate(&mut self, addr: u32, len: usize) {
        self.log.lock().push((addr, len));
    }
}

/// Fixed-capacity byte array holding whatever is currently resident.
pub struct ResidentMemory {
    data: Box<[u8]>,
    sink: Box<dyn InvalidationSink + Send>,
}

impl ResidentMemory {
    /// Create a zeroed memory of `capacity` bytes that notifies nobody.
    pub fn new(capacity: usize) -> Self {
        Self::with_sink(capacity, Box::new(NullSink))
    }

    pub fn with_sink(capacity: usize, sink: Box<dyn InvalidationSink + Send>) -> Self {
        ResidentMemory {
            data: vec![0u8; capacity].into_boxed_slice(),
            sink,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    fn check_range(&self, addr: usize, len: usize) -> Result<()> {
        match addr.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(MmuError::invalid_address(format!(
                "physical range [{:#x}, +{}) exceeds resident capacity {:#x}",
                addr,
                len,
                self.data.len()
            ))),
        }
    }

    /// Borrow `len` resident bytes starting at `addr`.
    pub fn slice(&self, addr: usize, len: usize) -> Result<&[u8]> {
        self.check_range(addr, len)?;
        Ok(&self.data[addr..addr + len])
    }

    /// Copy `len` resident bytes starting at `addr`.
    pub fn read(&self, addr: usize, len: usize) -> Result<Vec<u8>> {
        self.slice(addr, len).map(<[u8]>::to_vec)
    }

    /// Overwrite resident bytes and notify the invalidation sink.
    pub fn write(&mut self, addr: usize, bytes: &[u8]) -> Result<()> {
        self.check_range(addr, bytes.len())?;
        self.data[addr..addr + bytes.len()].copy_from_slice(bytes);
        self.sink.invalidate(addr as u32, bytes.len());
        Ok(())
    }

    /// Move `len` bytes from `from` to `to` (ranges may overlap); both ranges
    /// are reported to the sink.
    pub fn relocate(&mut self, from: usize, to: usize, len: usize) -> Result<()> {
        self.check_range(from, len)?;
        self.check_range(to, len)?;
        if from == to || len == 0 {
            return Ok(());
        }
        self.data.copy_within(from..from + len, to);
        self.sink.invalidate(from as u32, len);
        self.sink.invalidate(to as u32, len);
        Ok(())
    }
}

impl fmt::Debug for ResidentMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResidentMemory")
            .field("capacity", &self.data.len())
            .finish_non_exhaustive()
    }
}

/// Sparse in-memory disk. Blocks that were never written read back as zeros.
#[derive(Debug, Clone)]
pub struct Disk {
    capacity: u64,
    blocks: BTreeMap<u64, Box<[u8]>>,
}

impl Disk {
    pub fn new(capacity: u64) -> Self {
        Disk {
            capacity,
            blocks: BTreeMap::new(),
        }
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(MmuError::invalid_address(format!(
                "disk range [{:#x}, +{}) exceeds disk capacity {:#x}",
                offset, len, self.capacity
            ))),
        }
    }

    /// Apply `f` to each block-local piece of `[offset, offset + len)`:
    /// `(block index, offset in block, offset in caller buffer, piece length)`.
    fn for_each_piece(offset: u64, len: usize, mut f: impl FnMut(u64, usize, usize, usize)) {
        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let block = pos / DISK_BLOCK_SIZE as u64;
            let in_block = (pos % DISK_BLOCK_SIZE as u64) as usize;
            let piece = (DISK_BLOCK_SIZE - in_block).min(len - done);
            f(block, in_block, done, piece);
            done += piece;
        }
    }

    /// Store `bytes` at `offset`.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        let blocks = &mut self.blocks;
        Self::for_each_piece(offset, bytes.len(), |block, in_block, at, piece| {
            let data = blocks
                .entry(block)
                .or_insert_with(|| vec![0u8; DISK_BLOCK_SIZE].into_boxed_slice());
            data[in_block..in_block + piece].copy_from_slice(&bytes[at..at + piece]);
        });
        Ok(())
    }

    /// Fill `[offset, offset + len)` with `byte`.
    pub fn fill(&mut self, offset: u64, len: usize, byte: u8) -> Result<()> {
        self.check_range(offset, len)?;
        let blocks = &mut self.blocks;
        Self::for_each_piece(offset, len, |block, in_block, _, piece| {
            let data = blocks
                .entry(block)
                .or_insert_with(|| vec![0u8; DISK_BLOCK_SIZE].into_boxed_slice());
            data[in_block..in_block + piece].fill(byte);
        });
        Ok(())
    }

    /// Number of blocks holding data.
    pub fn populated_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl BackingStore for Disk {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut out = vec![0u8; len];
        Self::for_each_piece(offset, len, |block, in_block, at, piece| {
            if let Some(data) = self.blocks.get(&block) {
                out[at..at + piece].copy_from_slice(&data[in_block..in_block + piece]);
            }
        });
        Ok(out)
    }
}

impl<T: BackingStore + ?Sized> BackingStore for Box<T> {
    fn capacity(&self) -> u64 {
        (**self).capacity()
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        (**self).read(offset, len)
    }
}

impl<T: BackingStore + ?Sized> BackingStore for Arc<T> {
    fn capacity(&self) -> u64 {
        (**self).capacity()
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        (**self).read(offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_initialization() {
        let mem = ResidentMemory::new(4096);
        assert_eq!(mem.capacity(), 4096);
        assert_eq!(mem.read(0, 4).unwrap(), vec![0; 4]);
        assert_eq!(mem.read(4092, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_memory_read_write() {
        let mut mem = ResidentMemory::new(4096);
        mem.write(100, &[1, 2, 3]).unwrap();
        assert_eq!(mem.read(99, 5).unwrap(), vec![0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_memory_out_of_range() {
        let mut mem = ResidentMemory::new(1024);
        assert!(mem.read(1020, 8).is_err());
        assert!(mem.write(1024, &[1]).is_err());
        assert!(mem.read(usize::MAX, 2).is_err());
        // an empty read at the very end is fine
        assert!(mem.read(1024, 0).unwrap().is_empty());
    }

    #[test]
    fn test_write_notifies_sink() {
        let sink = RecordingSink::new();
        let mut mem = ResidentMemory::with_sink(1024, Box::new(sink.clone()));
        mem.write(16, &[0xAA; 8]).unwrap();
        mem.write(512, &[0xBB; 4]).unwrap();
        assert_eq!(sink.notices(), vec![(16, 8), (512, 4)]);
    }

    #[test]
    fn test_relocate_overlapping() {
        let sink = RecordingSink::new();
        let mut mem = ResidentMemory::with_sink(64, Box::new(sink.clone()));
        mem.write(8, &[1, 2, 3, 4, 5, 6]).unwrap();
        mem.relocate(8, 4, 6).unwrap();
        assert_eq!(mem.read(4, 6).unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(sink.notices(), vec![(8, 6), (8, 6), (4, 6)]);
    }

    #[test]
    fn test_disk_unwritten_reads_zero() {
        let disk = Disk::new(1 << 20);
        assert_eq!(disk.read(12345, 10).unwrap(), vec![0; 10]);
        assert_eq!(disk.populated_blocks(), 0);
    }

    #[test]
    fn test_disk_write_across_blocks() {
        let mut disk = Disk::new(1 << 20);
        let offset = DISK_BLOCK_SIZE as u64 - 2;
        disk.write(offset, &[7, 8, 9, 10]).unwrap();
        assert_eq!(disk.read(offset - 1, 6).unwrap(), vec![0, 7, 8, 9, 10, 0]);
        assert_eq!(disk.populated_blocks(), 2);
    }

    #[test]
    fn test_disk_fill() {
        let mut disk = Disk::new(1 << 20);
        disk.fill(1000, 3 * DISK_BLOCK_SIZE, 0x33).unwrap();
        let data = disk.read(1000, 3 * DISK_BLOCK_SIZE).unwrap();
        assert!(data.iter().all(|&b| b == 0x33));
        assert_eq!(disk.read(999, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_disk_bounds() {
        let mut disk = Disk::new(4096);
        assert!(disk.read(4090, 7).is_err());
        assert!(disk.write(4096, &[1]).is_err());
        assert!(disk.fill(u64::MAX, 2, 1).is_err());
    }
}
