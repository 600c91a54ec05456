use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::error::MmuError;
use crate::memory::Disk;
use crate::translation::{AddressTranslator, LogicalAddress, PhysicalAddress};

#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {msg}")]
    Syntax { line: usize, msg: String },
    #[error("line {line}: {source}")]
    Apply {
        line: usize,
        #[source]
        source: MmuError,
    },
}

/// One `segment` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpec {
    pub line: usize,
    pub selector: u16,
    pub base: u32,
    pub disk_base: u32,
    pub limit: u32,
    pub valid: bool,
}

/// One `disk` or `memory` fill line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillSpec {
    pub line: usize,
    pub addr: u64,
    pub len: usize,
    pub byte: u8,
}

#[derive(Debug, Default)]
pub struct InitData {
    pub segments: Vec<SegmentSpec>,
    pub disk_fills: Vec<FillSpec>,
    pub memory_fills: Vec<FillSpec>,
}

fn read_file(path: &Path) -> Result<String, InitError> {
    fs::read_to_string(path).map_err(|source| InitError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Decimal or `0x`-prefixed hex.
fn parse_number(token: &str, line: usize, what: &str) -> Result<u64, InitError> {
    let parsed = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => token.parse(),
    };
    parsed.map_err(|_| InitError::Syntax {
        line,
        msg: format!("invalid {}: {}", what, token),
    })
}

fn parse_bounded<T: TryFrom<u64>>(token: &str, line: usize, what: &str) -> Result<T, InitError> {
    let value = parse_number(token, line, what)?;
    T::try_from(value).map_err(|_| InitError::Syntax {
        line,
        msg: format!("{} {} is out of range", what, token),
    })
}

/// Strip a trailing `#` comment and split into tokens.
fn tokens(line: &str) -> Vec<&str> {
    let code = line.split('#').next().unwrap_or("");
    code.split_whitespace().collect()
}

impl InitData {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, InitError> {
        Self::parse(&read_file(path.as_ref())?)
    }

    pub fn parse(content: &str) -> Result<Self, InitError> {
        let mut data = InitData::default();
        for (idx, raw) in content.lines().enumerate() {
            let line = idx + 1;
            let tokens = tokens(raw);
            let Some((&keyword, args)) = tokens.split_first() else {
                continue;
            };
            match keyword {
                "segment" => data.segments.push(Self::parse_segment(args, line)?),
                "disk" => data.disk_fills.push(Self::parse_fill(args, line)?),
                "memory" => data.memory_fills.push(Self::parse_fill(args, line)?),
                other => {
                    return Err(InitError::Syntax {
                        line,
                        msg: format!("unknown directive: {}", other),
                    });
                }
            }
        }
        Ok(data)
    }

    fn parse_segment(args: &[&str], line: usize) -> Result<SegmentSpec, InitError> {
        let [selector, base, disk_base, limit, valid] = args else {
            return Err(InitError::Syntax {
                line,
                msg: format!("segment takes 5 fields, got {}", args.len()),
            });
        };
        let valid = match *valid {
            "0" => false,
            "1" => true,
            other => {
                return Err(InitError::Syntax {
                    line,
                    msg: format!("valid flag must be 0 or 1, got {}", other),
                });
            }
        };
        Ok(SegmentSpec {
            line,
            selector: parse_bounded(selector, line, "selector")?,
            base: parse_bounded(base, line, "base")?,
            disk_base: parse_bounded(disk_base, line, "disk base")?,
            limit: parse_bounded(limit, line, "limit")?,
            valid,
        })
    }

    fn parse_fill(args: &[&str], line: usize) -> Result<FillSpec, InitError> {
        let [addr, len, byte] = args else {
            return Err(InitError::Syntax {
                line,
                msg: format!("fill takes 3 fields, got {}", args.len()),
            });
        };
        Ok(FillSpec {
            line,
            addr: parse_number(addr, line, "address")?,
            len: parse_bounded(len, line, "length")?,
            byte: parse_bounded(byte, line, "byte")?,
        })
    }

    /// Fill the disk before the translator takes ownership of it.
    pub fn apply_disk(&self, disk: &mut Disk) -> Result<(), InitError> {
        for fill in &self.disk_fills {
            disk.fill(fill.addr, fill.len, fill.byte)
                .map_err(|source| InitError::Apply {
                    line: fill.line,
                    source,
                })?;
        }
        Ok(())
    }

    /// Register segments, then fill resident memory.
    pub fn apply(&self, mmu: &mut AddressTranslator) -> Result<(), InitError> {
        for seg in &self.segments {
            mmu.register_segment(seg.selector, seg.base, seg.disk_base, seg.limit, seg.valid)
                .map_err(|source| InitError::Apply {
                    line: seg.line,
                    source,
                })?;
        }
        for fill in &self.memory_fills {
            let addr = u32::try_from(fill.addr).map_err(|_| InitError::Syntax {
                line: fill.line,
                msg: format!("memory address {:#x} does not fit 32 bits", fill.addr),
            })?;
            mmu.write(PhysicalAddress(addr), &vec![fill.byte; fill.len])
                .map_err(|source| InitError::Apply {
                    line: fill.line,
                    source,
                })?;
        }
        Ok(())
    }
}

/// One line of the input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub line: usize,
    pub address: String,
    pub len: usize,
}

pub fn parse_requests(content: &str) -> Result<Vec<Request>, InitError> {
    let mut requests = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = idx + 1;
        match tokens(raw).as_slice() {
            [] => continue,
            [address, len] => requests.push(Request {
                line,
                address: address.to_string(),
                len: parse_bounded(len, line, "length")?,
            }),
            other => {
                return Err(InitError::Syntax {
                    line,
                    msg: format!("expected `<address> <length>`, got {} field(s)", other.len()),
                });
            }
        }
    }
    Ok(requests)
}

pub fn read_requests<P: AsRef<Path>>(path: P) -> Result<Vec<Request>, InitError> {
    parse_requests(&read_file(path.as_ref())?)
}

/// Translate and read one request. The address is validated here, so a
/// malformed address becomes a per-line error rather than aborting the run.
pub fn serve(
    mmu: &mut AddressTranslator,
    request: &Request,
) -> Result<(PhysicalAddress, Vec<u8>), MmuError> {
    let logical = LogicalAddress::parse(&request.address)?;
    mmu.read_with_address(logical, request.len)
}

/// Output line for one served request.
pub fn format_result(result: &Result<(PhysicalAddress, Vec<u8>), MmuError>) -> String {
    match result {
        Ok((physical, data)) => {
            let hex: String = data.iter().map(|b| format!("{:02x}", b)).collect();
            format!("{} {}", physical.to_bits(), hex)
        }
        Err(err) => format!("-1 {}", err.kind()),
    }
}

pub fn write_results<P: AsRef<Path>>(path: P, lines: &[String]) -> std::io::Result<()> {
    let mut content = lines.join("\n");
    content.push('\n');
    fs::write(path.as_ref(), content)
}
