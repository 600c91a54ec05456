use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{ConfigError, MmuConfig, Mode};
use crate::error::Result;
use crate::memory::BackingStore;
use crate::translation::{AddressTranslator, FaultStats, LogicalAddress, PhysicalAddress};

/// Shared handle to one translator. Clones refer to the same tables, and
/// every operation holds the lock for its whole duration.
#[derive(Clone)]
pub struct VmManager {
    inner: Arc<Mutex<AddressTranslator>>,
}

impl VmManager {
    pub fn new(
        config: MmuConfig,
        disk: impl BackingStore + Send + 'static,
    ) -> std::result::Result<Self, ConfigError> {
        AddressTranslator::new(config, disk).map(Self::from_translator)
    }

    pub fn from_translator(translator: AddressTranslator) -> Self {
        VmManager {
            inner: Arc::new(Mutex::new(translator)),
        }
    }

    pub fn mode(&self) -> Mode {
        self.inner.lock().mode()
    }

    pub fn read(&self, logical: LogicalAddress, len: usize) -> Result<Vec<u8>> {
        self.inner.lock().read(logical, len)
    }

    pub fn translate(&self, logical: LogicalAddress, len: usize) -> Result<PhysicalAddress> {
        self.inner.lock().translate(logical, len)
    }

    pub fn register_segment(
        &self,
        selector: u16,
        base: u32,
        disk_base: u32,
        limit: u32,
        valid: bool,
    ) -> Result<()> {
        self.inner
            .lock()
            .register_segment(selector, base, disk_base, limit, valid)
    }

    pub fn write(&self, physical: PhysicalAddress, bytes: &[u8]) -> Result<()> {
        self.inner.lock().write(physical, bytes)
    }

    pub fn clear(&self) {
        self.inner.lock().clear()
    }

    pub fn invalidate(&self, segment: Option<u16>, page: Option<u32>) -> Result<()> {
        self.inner.lock().invalidate(segment, page)
    }

    pub fn stats(&self) -> FaultStats {
        *self.inner.lock().stats()
    }

    /// Run `f` with exclusive access to the translator.
    pub fn with<R>(&self, f: impl FnOnce(&mut AddressTranslator) -> R) -> R {
        f(&mut self.inner.lock())
    }
}
