use bytes::BufMut;

use crate::error::{FrameError, MalformedKind, Result};

/// Longest valid VarInt encoding: five bytes carry 35 bits, of which 32 are used.
pub const MAX_VARINT_LEN: usize = 5;

const STATE_NAME: &str = "VarInt";

/// Incremental decoder for the 7-bit-continuation VarInt.
///
/// Bytes are little-endian groups of seven value bits; a set high bit means
/// another byte follows. The decoder may be fed one byte at a time and ends
/// in exactly the same state as when fed the whole encoding at once.
#[derive(Debug, Clone, Default)]
pub struct VarIntDecoder {
    value: u32,
    index: usize,
    done: bool,
}

impl VarIntDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume bytes from `buf` until the value completes or `buf` runs out.
    ///
    /// Returns the number of bytes consumed. Errors with
    /// [`FrameError::ValueNotAvailable`] if the value is already complete.
    pub fn decode(&mut self, buf: &[u8]) -> Result<usize> {
        if self.done {
            return Err(FrameError::ValueNotAvailable);
        }

        let mut consumed = 0;
        for &byte in buf {
            // The fifth byte may only contribute the top four bits of a u32.
            if self.index == MAX_VARINT_LEN - 1 && byte & 0xF0 != 0 {
                return Err(FrameError::malformed(
                    MalformedKind::FrameTooLarge,
                    STATE_NAME,
                    consumed as u64,
                ));
            }
            self.value |= u32::from(byte & 0x7F) << (self.index * 7);
            self.index += 1;
            consumed += 1;
            if byte & 0x80 == 0 {
                self.done = true;
                break;
            }
        }
        Ok(consumed)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The decoded value, available once [`is_done`](Self::is_done) is true.
    pub fn value(&self) -> Result<u32> {
        if self.done {
            Ok(self.value)
        } else {
            Err(FrameError::ValueNotAvailable)
        }
    }

    /// Clear all progress so the decoder can read a new value.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Append the VarInt encoding of `value` to `dst`.
pub fn encode_varint(mut value: u32, dst: &mut impl BufMut) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Number of bytes `encode_varint` writes for `value`.
pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}
