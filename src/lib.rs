pub mod bits;
pub mod config;
pub mod constants;
pub mod error;
pub mod io;
pub mod memory;
pub mod paging;
pub mod segment;
pub mod translation;
pub mod vm_manager;

// Re-export commonly used items for convenience
pub use config::{ConfigError, MmuConfig, Mode};
pub use constants::*;
pub use error::{MmuError, Result};
pub use memory::{BackingStore, Disk, InvalidationSink, ResidentMemory};
pub use translation::{
    AddressTranslator, FaultStats, LinearAddress, LogicalAddress, PhysicalAddress,
};
pub use vm_manager::VmManager;
