//! Fixed-width bit-string codec.
//!
//! Addresses travel across the public boundary as big-endian strings of `'0'`
//! and `'1'`. Everything behind the boundary works on plain integers.

use crate::error::{MmuError, Result};

/// Parse a big-endian bit string of exactly `width` characters (`width <= 64`).
pub fn parse_bits(bits: &str, width: usize) -> Result<u64> {
    if width > 64 {
        return Err(MmuError::invalid_address(format!(
            "bit width {} exceeds 64",
            width
        )));
    }
    if bits.len() != width {
        return Err(MmuError::invalid_address(format!(
            "expected {} bits, got {}",
            width,
            bits.len()
        )));
    }

    let mut value = 0u64;
    for (i, c) in bits.chars().enumerate() {
        let bit = match c {
            '0' => 0,
            '1' => 1,
            other => {
                return Err(MmuError::invalid_address(format!(
                    "invalid character {:?} at bit {}",
                    other, i
                )));
            }
        };
        value = (value << 1) | bit;
    }
    Ok(value)
}

/// Render the low `width` bits of `value` as a big-endian bit string.
pub fn format_bits(value: u64, width: usize) -> String {
    (0..width)
        .rev()
        .map(|i| {
            if i < 64 && (value >> i) & 1 == 1 {
                '1'
            } else {
                '0'
            }
        })
        .collect()
}
