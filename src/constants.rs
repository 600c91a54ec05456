// default capacities (bytes)
pub const MEM_SIZE_B: usize = 32 * 1024 * 1024;
pub const PAGE_SIZE_B: usize = 1024;
pub const DISK_SIZE_B: u64 = 128 * 1024 * 1024;

// logical address layout: selector | reserved | offset, big-endian
pub const SELECTOR_BITS: u32 = 13;
pub const RESERVED_BITS: u32 = 3;
pub const OFFSET_BITS: u32 = 32;
pub const LOGICAL_ADDR_BITS: usize = (SELECTOR_BITS + RESERVED_BITS + OFFSET_BITS) as usize;

pub const LINEAR_ADDR_BITS: usize = 32;
pub const PHYSICAL_ADDR_BITS: usize = 32;

pub const RESERVED_SHIFT: u32 = OFFSET_BITS;
pub const SELECTOR_SHIFT: u32 = RESERVED_BITS + OFFSET_BITS;

pub const SELECTOR_MASK: u64 = (1 << SELECTOR_BITS) - 1;
pub const RESERVED_MASK: u64 = (1 << RESERVED_BITS) - 1;
pub const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

pub const MAX_SEGMENTS: usize = 1 << SELECTOR_BITS;

// descriptor limit field is 31 bits wide
pub const LIMIT_BITS: u32 = 31;
pub const MAX_LIMIT: u32 = (1 << LIMIT_BITS) - 1;
