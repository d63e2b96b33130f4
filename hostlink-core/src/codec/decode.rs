//! Guest memory to host strings.

use crate::config::DEFAULT_DECODER_ROTATION_BYTES;
use crate::error::{BridgeError, Result};
use crate::sandbox::Sandbox;
use tracing::debug;

/// Fatal UTF-8 decoder that retires itself after a fixed number of decoded bytes.
///
/// Long-lived decoders on some hosts start failing after roughly 2 GiB of cumulative input.
/// The running count includes the current input; once it reaches the threshold the decoder is
/// replaced before decoding and the count restarts at the current length.
#[derive(Debug)]
pub struct Utf8Decoder {
    rotation_bytes: u64,
    decoded: u64,
    instance: u64,
}

impl Default for Utf8Decoder {
    fn default() -> Self {
        Self::with_rotation(DEFAULT_DECODER_ROTATION_BYTES)
    }
}

impl Utf8Decoder {
    pub fn with_rotation(rotation_bytes: u64) -> Self {
        Self {
            rotation_bytes,
            decoded: 0,
            instance: 0,
        }
    }

    pub fn rotation_bytes(&self) -> u64 {
        self.rotation_bytes
    }

    /// Bytes counted against the current decoder instance.
    pub fn decoded_bytes(&self) -> u64 {
        self.decoded
    }

    /// How many times the decoder has been replaced.
    pub fn rotations(&self) -> u64 {
        self.instance
    }

    pub fn decode(&mut self, bytes: &[u8]) -> Result<String> {
        self.decode_at(0, bytes)
    }

    /// Decode `bytes` that were read from guest address `offset`.
    pub(crate) fn decode_at(&mut self, offset: u32, bytes: &[u8]) -> Result<String> {
        let len = bytes.len() as u64;
        self.decoded += len;
        if self.decoded >= self.rotation_bytes {
            self.rotate();
            self.decoded = len;
        }
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| BridgeError::Decode {
                offset,
                len: bytes.len() as u32,
                valid_up_to: e.valid_up_to(),
            })
    }

    fn rotate(&mut self) {
        self.instance += 1;
        debug!(instance = self.instance, "string decoder replaced");
    }
}

/// Decode `len` bytes at `ptr` in guest memory.
pub fn decode_from<S: Sandbox + ?Sized>(sb: &mut S, ptr: u32, len: u32) -> Result<String> {
    let (mem, state) = sb.memory_and_state()?;
    let memory_len = mem.len();
    let view = state.views.u8(mem);
    let bytes = view
        .subarray(mem, ptr, len)
        .ok_or(BridgeError::OutOfBounds {
            ptr,
            len,
            memory_len,
        })?;
    state.decoder.decode_at(ptr, bytes)
}
