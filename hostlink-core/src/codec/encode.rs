//! Host strings into guest memory.

use super::StringTransfer;
use crate::error::{BridgeError, Result};
use crate::sandbox::Sandbox;
use tracing::trace;

/// Copy `s` into a fresh guest allocation.
///
/// The first allocation is sized in UTF-16 code units, which is exact for ASCII. At the first
/// non-ASCII character the block is grown to the worst case for the remainder (3 bytes per
/// unit), the tail is encoded, and the block is shrunk to what was written. Guests without a
/// reallocator get one exact allocation of the encoded bytes instead.
pub fn encode<S: Sandbox + ?Sized>(sb: &mut S, s: &str) -> Result<StringTransfer> {
    let bytes = s.as_bytes();

    if !sb.has_realloc() {
        let len = bytes.len() as u32;
        let ptr = sb.malloc(len, 1)?;
        copy_into(sb, ptr, bytes)?;
        trace!(ptr, len, "string encoded without realloc");
        return Ok(StringTransfer { ptr, len });
    }

    let units = s.encode_utf16().count() as u32;
    let mut ptr = sb.malloc(units, 1)?;

    let ascii = bytes.iter().position(|b| !b.is_ascii()).unwrap_or(bytes.len());
    copy_into(sb, ptr, &bytes[..ascii])?;
    if ascii == bytes.len() {
        return Ok(StringTransfer { ptr, len: units });
    }

    let offset = ascii as u32;
    let rest = &s[ascii..];
    let rest_units = units - offset;
    let grown = rest_units
        .checked_mul(3)
        .and_then(|tail| tail.checked_add(offset))
        .ok_or(BridgeError::Allocation {
            size: u32::MAX,
            align: 1,
        })?;
    ptr = sb.realloc(ptr, units, grown, 1)?;
    let Some(tail) = ptr.checked_add(offset) else {
        let (mem, _) = sb.memory_and_state()?;
        return Err(BridgeError::OutOfBounds {
            ptr,
            len: grown,
            memory_len: mem.len(),
        });
    };
    copy_into(sb, tail, rest.as_bytes())?;

    let written = offset + rest.len() as u32;
    ptr = sb.realloc(ptr, grown, written, 1)?;
    trace!(ptr, units, written, "non-ascii string encoded");
    Ok(StringTransfer { ptr, len: written })
}

fn copy_into<S: Sandbox + ?Sized>(sb: &mut S, ptr: u32, bytes: &[u8]) -> Result<()> {
    let (mem, state) = sb.memory_and_state()?;
    let memory_len = mem.len();
    let view = state.views.u8(mem);
    let len = bytes.len() as u32;
    let dst = view
        .subarray_mut(mem, ptr, len)
        .ok_or(BridgeError::OutOfBounds {
            ptr,
            len,
            memory_len,
        })?;
    dst.copy_from_slice(bytes);
    Ok(())
}
