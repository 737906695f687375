use std::sync::Arc;

use crate::error::{FrameError, MalformedKind, Result};
use crate::record::QuotaField;
use crate::varint::VarIntDecoder;

/// Progress of a [`QuotaStringDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringState {
    ReadingSize,
    ReadingBytes,
    Done,
}

impl StringState {
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadingSize => "ReadingSize",
            Self::ReadingBytes => "ReadingBytes",
            Self::Done => "Done",
        }
    }
}

/// Decoder for a `[VarInt length][UTF-8 bytes]` string with a size quota.
///
/// The length is checked against the quota as soon as it is known; an
/// oversized string fails before any of its payload is consumed. The
/// [`QuotaField`] names the field in that error.
///
/// The last decoded string is cached. When the next string carries the same
/// bytes the cached value is returned without re-validating UTF-8, which
/// keeps repeated `Via`/content-type values cheap. Disabling the cache never
/// changes decode results.
#[derive(Debug, Clone)]
pub struct QuotaStringDecoder {
    field: QuotaField,
    quota: u32,
    state: StringState,
    size: VarIntDecoder,
    encoded_len: usize,
    bytes: Vec<u8>,
    value: Option<Arc<str>>,
    cache: Option<(Vec<u8>, Arc<str>)>,
    cache_enabled: bool,
}

impl QuotaStringDecoder {
    pub fn new(field: QuotaField, quota: u32) -> Self {
        Self {
            field,
            quota,
            state: StringState::ReadingSize,
            size: VarIntDecoder::new(),
            encoded_len: 0,
            bytes: Vec::new(),
            value: None,
            cache: None,
            cache_enabled: true,
        }
    }

    /// Turn the last-value cache on or off.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        if !enabled {
            self.cache = None;
        }
        self
    }

    pub fn field(&self) -> QuotaField {
        self.field
    }

    pub fn quota(&self) -> u32 {
        self.quota
    }

    /// Change the quota. Resets progress and drops the cached value.
    pub fn set_quota(&mut self, quota: u32) {
        self.quota = quota;
        self.cache = None;
        self.reset();
    }

    pub fn state(&self) -> StringState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == StringState::Done
    }

    /// Advance by one step. Returns bytes consumed.
    pub fn decode(&mut self, buf: &[u8]) -> Result<usize> {
        match self.state {
            StringState::ReadingSize => {
                let consumed = self.size.decode(buf)?;
                if self.size.is_done() {
                    let len = self.size.value()?;
                    if len > self.quota {
                        return Err(FrameError::QuotaExceeded {
                            field: self.field,
                            size: u64::from(len),
                            max: u64::from(self.quota),
                        });
                    }
                    self.encoded_len = len as usize;
                    self.bytes.clear();
                    self.bytes.reserve(self.encoded_len);
                    self.state = StringState::ReadingBytes;
                    if self.encoded_len == 0 {
                        self.complete(0)?;
                    }
                }
                Ok(consumed)
            }
            StringState::ReadingBytes => {
                let needed = self.encoded_len - self.bytes.len();
                let take = needed.min(buf.len());
                self.bytes.extend_from_slice(&buf[..take]);
                if self.bytes.len() == self.encoded_len {
                    self.complete(take)?;
                }
                Ok(take)
            }
            StringState::Done => Err(FrameError::ValueNotAvailable),
        }
    }

    fn complete(&mut self, consumed_in_step: usize) -> Result<()> {
        if self.cache_enabled {
            if let Some((cached_bytes, cached_value)) = &self.cache {
                if *cached_bytes == self.bytes {
                    self.value = Some(Arc::clone(cached_value));
                    self.state = StringState::Done;
                    return Ok(());
                }
            }
        }

        let value: Arc<str> = match std::str::from_utf8(&self.bytes) {
            Ok(s) => Arc::from(s),
            Err(_) => {
                return Err(FrameError::malformed(
                    MalformedKind::InvalidUtf8,
                    self.state.name(),
                    consumed_in_step as u64,
                ))
            }
        };
        if self.cache_enabled {
            self.cache = Some((std::mem::take(&mut self.bytes), Arc::clone(&value)));
        }
        self.value = Some(value);
        self.state = StringState::Done;
        Ok(())
    }

    /// The decoded string, available once decoding is done.
    pub fn value(&self) -> Result<&str> {
        match (&self.value, self.state) {
            (Some(value), StringState::Done) => Ok(&**value),
            _ => Err(FrameError::ValueNotAvailable),
        }
    }

    /// The decoded string as a shared handle.
    pub fn shared_value(&self) -> Result<Arc<str>> {
        match (&self.value, self.state) {
            (Some(value), StringState::Done) => Ok(Arc::clone(value)),
            _ => Err(FrameError::ValueNotAvailable),
        }
    }

    /// Clear progress for the next string. The cache survives.
    pub fn reset(&mut self) {
        self.state = StringState::ReadingSize;
        self.size.reset();
        self.encoded_len = 0;
        self.bytes.clear();
        self.value = None;
    }
}
