//! Git delta instructions.
//!
//! A delta starts with two varints, the base size and the result size,
//! followed by copy instructions (high bit set, offset and size bytes
//! selected by the low seven bits) and insert instructions (1-127 literal
//! bytes). Command byte 0 is reserved.

use thiserror::Error;

/// Longest varint in a delta header.
const MAX_VARINT_BYTES: usize = 10;

/// A copy instruction with a zero size field copies this many bytes.
const COPY_SIZE_ZERO: usize = 0x10000;

/// Why a delta could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeltaError {
    /// The instruction stream ended early.
    #[error("delta truncated")]
    Truncated,
    /// A header varint does not fit in 64 bits.
    #[error("delta varint overflow")]
    VarintOverflow,
    /// The base is not the size the delta was made against.
    #[error("delta base size mismatch")]
    BaseSizeMismatch,
    /// The instructions produced a different size than the header declared.
    #[error("delta result size mismatch")]
    ResultSizeMismatch,
    /// Command byte 0.
    #[error("delta command zero")]
    BadCommandZero,
    /// A copy reaches outside the base.
    #[error("delta copy out of range")]
    CopyOutOfRange,
    /// The declared result is larger than the caller allows, or the
    /// instructions write past it.
    #[error("delta output overrun")]
    OutputOverrun,
}

fn read_varint(delta: &[u8], pos: &mut usize) -> Result<u64, DeltaError> {
    let mut result = 0u64;
    let mut shift = 0u32;
    for _ in 0..MAX_VARINT_BYTES {
        let byte = *delta.get(*pos).ok_or(DeltaError::Truncated)?;
        *pos += 1;
        let bits = (byte & 0x7f) as u64;
        if shift > 63 || (shift > 57 && bits >> (64 - shift) != 0) {
            return Err(DeltaError::VarintOverflow);
        }
        result |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
    Err(DeltaError::VarintOverflow)
}

/// Base and result sizes from the delta header.
pub fn delta_sizes(delta: &[u8]) -> Result<(u64, u64), DeltaError> {
    let mut pos = 0;
    let base = read_varint(delta, &mut pos)?;
    let result = read_varint(delta, &mut pos)?;
    Ok((base, result))
}

/// Applies `delta` to `base`. The result may not exceed `max_out` bytes.
pub fn apply_delta(base: &[u8], delta: &[u8], max_out: u64) -> Result<Vec<u8>, DeltaError> {
    let mut pos = 0;
    let base_size = read_varint(delta, &mut pos)?;
    let result_size = read_varint(delta, &mut pos)?;
    if base_size != base.len() as u64 {
        return Err(DeltaError::BaseSizeMismatch);
    }
    if result_size > max_out {
        return Err(DeltaError::OutputOverrun);
    }
    let result_size = usize::try_from(result_size).map_err(|_| DeltaError::OutputOverrun)?;

    let mut out = Vec::with_capacity(result_size);
    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;

        let chunk = if cmd & 0x80 != 0 {
            let (offset, size) = decode_copy(delta, &mut pos, cmd)?;
            let end = offset.checked_add(size).ok_or(DeltaError::CopyOutOfRange)?;
            base.get(offset..end).ok_or(DeltaError::CopyOutOfRange)?
        } else if cmd != 0 {
            let end = pos + cmd as usize;
            let literal = delta.get(pos..end).ok_or(DeltaError::Truncated)?;
            pos = end;
            literal
        } else {
            return Err(DeltaError::BadCommandZero);
        };

        if out.len() + chunk.len() > result_size {
            return Err(DeltaError::OutputOverrun);
        }
        out.extend_from_slice(chunk);
    }

    if out.len() != result_size {
        return Err(DeltaError::ResultSizeMismatch);
    }
    Ok(out)
}

/// Offset bytes are selected by bits 0-3, size bytes by bits 4-6, both
/// little-endian.
fn decode_copy(delta: &[u8], pos: &mut usize, cmd: u8) -> Result<(usize, usize), DeltaError> {
    let mut offset = 0usize;
    for i in 0..4 {
        if cmd & (1 << i) != 0 {
            let byte = *delta.get(*pos).ok_or(DeltaError::Truncated)?;
            *pos += 1;
            offset |= (byte as usize) << (8 * i);
        }
    }

    let mut size = 0usize;
    for i in 0..3 {
        if cmd & (0x10 << i) != 0 {
            let byte = *delta.get(*pos).ok_or(DeltaError::Truncated)?;
            *pos += 1;
            size |= (byte as usize) << (8 * i);
        }
    }
    if size == 0 {
        size = COPY_SIZE_ZERO;
    }
    Ok((offset, size))
}
