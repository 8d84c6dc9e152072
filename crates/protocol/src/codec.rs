//! Fixed-width field helpers
//!
//! Control records carry strings in NUL-padded byte arrays of a fixed width.
//! A value must leave room for its terminator; anything longer is rejected
//! rather than truncated.

use crate::error::{ProtocolError, Result};
use std::io::{Read, Write};

/// Write `value` into a `width`-byte field, NUL-padded
pub fn write_fixed_str<W: Write>(
    writer: &mut W,
    field: &'static str,
    value: &str,
    width: usize,
) -> Result<()> {
    check_fixed_str(field, value, width)?;

    writer.write_all(value.as_bytes())?;
    // Terminator plus padding
    let padding = vec![0u8; width - value.len()];
    writer.write_all(&padding)?;

    Ok(())
}

/// Read a `width`-byte NUL-terminated field
pub fn read_fixed_str<R: Read>(reader: &mut R, field: &'static str, width: usize) -> Result<String> {
    let mut raw = vec![0u8; width];
    reader.read_exact(&mut raw)?;

    let end = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::Unterminated { field })?;
    raw.truncate(end);

    String::from_utf8(raw).map_err(|_| ProtocolError::InvalidString { field })
}

/// Check that `value` fits a `width`-byte field with its terminator
pub fn check_fixed_str(field: &'static str, value: &str, width: usize) -> Result<()> {
    if value.len() >= width {
        return Err(ProtocolError::FieldTooLong {
            field,
            len: value.len(),
            max: width - 1,
        });
    }
    if value.as_bytes().contains(&0) {
        return Err(ProtocolError::InvalidString { field });
    }
    Ok(())
}

/// Ensure an input buffer holds at least `needed` bytes
pub fn ensure_len(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(ProtocolError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}
