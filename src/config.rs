//! Translator configuration: mode flags and capacities.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::constants::*;

/// Errors raised while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Operating mode, derived from the two flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No segmentation, no paging.
    Real,
    /// Segmentation only.
    Segmented,
    /// Segmentation with paging.
    SegmentedPaged,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MmuConfig {
    pub segmentation: bool,
    pub paging: bool,
    /// Resident memory capacity in bytes.
    pub memory_size: usize,
    pub page_size: usize,
    /// Backing store capacity in bytes.
    pub disk_size: u64,
}

impl Default for MmuConfig {
    fn default() -> Self {
        MmuConfig {
            segmentation: false,
            paging: false,
            memory_size: MEM_SIZE_B,
            page_size: PAGE_SIZE_B,
            disk_size: DISK_SIZE_B,
        }
    }
}

impl MmuConfig {
    /// Default capacities in the given mode.
    pub fn with_mode(mode: Mode) -> Self {
        let (segmentation, paging) = match mode {
            Mode::Real => (false, false),
            Mode::Segmented => (true, false),
            Mode::SegmentedPaged => (true, true),
        };
        MmuConfig {
            segmentation,
            paging,
            ..Default::default()
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: MmuConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.paging && !self.segmentation {
            return Err(ConfigError::Invalid(
                "paging requires segmentation to be enabled".to_string(),
            ));
        }
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "page size {} is not a power of two",
                self.page_size
            )));
        }
        if !self.memory_size.is_power_of_two() || self.memory_size < self.page_size {
            return Err(ConfigError::Invalid(format!(
                "memory size {} must be a power of two no smaller than the page size",
                self.memory_size
            )));
        }
        if !self.disk_size.is_power_of_two() || self.disk_size < self.page_size as u64 {
            return Err(ConfigError::Invalid(format!(
                "disk size {} must be a power of two no smaller than the page size",
                self.disk_size
            )));
        }
        if self.memory_size as u64 > 1 << PHYSICAL_ADDR_BITS {
            return Err(ConfigError::Invalid(format!(
                "memory size {} does not fit {}-bit physical addresses",
                self.memory_size, PHYSICAL_ADDR_BITS
            )));
        }
        if self.disk_size > 1 << LINEAR_ADDR_BITS {
            return Err(ConfigError::Invalid(format!(
                "disk size {} does not fit {}-bit linear addresses",
                self.disk_size, LINEAR_ADDR_BITS
            )));
        }
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        match (self.segmentation, self.paging) {
            (false, _) => Mode::Real,
            (true, false) => Mode::Segmented,
            (true, true) => Mode::SegmentedPaged,
        }
    }

    /// Width of the page offset field.
    pub fn page_bits(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    /// Width of the virtual page number field.
    pub fn vpn_bits(&self) -> u32 {
        (self.disk_size / self.page_size as u64).trailing_zeros()
    }

    /// Width of the frame number field.
    pub fn frame_bits(&self) -> u32 {
        (self.memory_size / self.page_size).trailing_zeros()
    }

    pub fn num_pages(&self) -> usize {
        (self.disk_size / self.page_size as u64) as usize
    }

    pub fn num_frames(&self) -> usize {
        self.memory_size / self.page_size
    }
}
