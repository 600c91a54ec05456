use thiserror::Error;

/// Result alias used throughout the translation engine.
pub type Result<T> = core::result::Result<T, MmuError>;

/// Errors surfaced by address translation and the residency tables.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MmuError {
    /// Malformed address, or an address that falls outside its target range.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Selector names a slot with no segment descriptor.
    #[error("segment fault: selector {index} has no descriptor")]
    SegmentFault { index: u16 },
    /// Read would run past the owning segment's limit.
    #[error(
        "read of {len} bytes at offset {offset:#x} runs past limit {limit:#x} of segment {selector}"
    )]
    CrossSegmentRead {
        selector: u16,
        offset: u32,
        len: usize,
        limit: u32,
    },
    /// Requested resident space exceeds what memory can ever provide.
    #[error("out of memory: {requested} bytes requested, resident capacity is {capacity} bytes")]
    OutOfMemory { requested: u64, capacity: usize },
    /// Table bookkeeping disagrees with itself. Always a defect.
    #[error("internal consistency violation: {0}")]
    InternalConsistency(String),
}

impl MmuError {
    pub(crate) fn invalid_address(msg: impl Into<String>) -> Self {
        MmuError::InvalidAddress(msg.into())
    }

    pub(crate) fn inconsistent(msg: impl Into<String>) -> Self {
        MmuError::InternalConsistency(msg.into())
    }

    /// Short, stable name of the error kind (used in CLI output).
    pub fn kind(&self) -> &'static str {
        match self {
            MmuError::InvalidAddress(_) => "InvalidAddress",
            MmuError::SegmentFault { .. } => "SegmentFault",
            MmuError::CrossSegmentRead { .. } => "CrossSegmentRead",
            MmuError::OutOfMemory { .. } => "OutOfMemory",
            MmuError::InternalConsistency(_) => "InternalConsistency",
        }
    }
}
