//! String transfer across the memory boundary.

mod decode;
mod encode;

pub use decode::{Utf8Decoder, decode_from};
pub use encode::encode;

use crate::error::{BridgeError, Result};
use crate::sandbox::Sandbox;

/// A string placed in guest memory. Valid until the next call that may move memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StringTransfer {
    pub ptr: u32,
    /// Byte length of the encoded string.
    pub len: u32,
}

/// Write `transfer` into a two-word out area: ptr at `out`, len at `out + 4`.
pub fn write_transfer<S: Sandbox + ?Sized>(sb: &mut S, out: u32, transfer: StringTransfer) -> Result<()> {
    let (mem, state) = sb.memory_and_state()?;
    let memory_len = mem.len();
    let dv = state.views.data_view(mem);
    let ok = dv.set_i32(mem, out.wrapping_add(4), transfer.len as i32)
        && dv.set_i32(mem, out, transfer.ptr as i32);
    if ok {
        Ok(())
    } else {
        Err(BridgeError::OutOfBounds {
            ptr: out,
            len: 8,
            memory_len,
        })
    }
}
