use std::time::Duration;

use nmfprims_frame::{MessageEncoding, Quotas, DEFAULT_CHUNK_SIZE};

/// Default size of pooled receive and send buffers: 8 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Default largest message accepted or sent: 64 KiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Settings shared by every channel a factory creates.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionConfig {
    /// Deadline for connecting and exchanging the preamble. Default: 60s.
    pub open_timeout: Duration,
    /// Size of each pooled buffer, and of each transport read. Default: 8 KiB.
    pub buffer_size: usize,
    /// Idle buffers kept by the factory's buffer pool. Default: 32.
    pub max_idle_buffers: usize,
    /// Largest message `send` accepts. Default: 64 KiB.
    pub max_message_size: usize,
    /// Largest envelope accepted from the peer. Default: 64 KiB.
    pub max_received_message_size: u32,
    /// Chunk size for request bodies sent as unsized envelopes. Default: 64 KiB.
    pub chunk_size: usize,
    /// Message encoding announced in the preamble.
    pub encoding: MessageEncoding,
    /// String and envelope quotas used when decoding.
    pub quotas: Quotas,
    /// Encoded preambles kept by the factory. Default: 16.
    pub preamble_cache_capacity: usize,
}

impl SessionConfig {
    /// Quotas for a channel's decoders. The envelope quota is the smaller
    /// of `quotas.max_envelope` and `max_received_message_size`.
    pub fn decoder_quotas(&self) -> Quotas {
        Quotas {
            max_envelope: self.quotas.max_envelope.min(self.max_received_message_size),
            ..self.quotas
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(60),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_idle_buffers: 32,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_received_message_size: DEFAULT_MAX_MESSAGE_SIZE as u32,
            chunk_size: DEFAULT_CHUNK_SIZE,
            encoding: MessageEncoding::default(),
            quotas: Quotas::default(),
            preamble_cache_capacity: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_quotas_take_smaller_envelope_limit() {
        let config = SessionConfig {
            max_received_message_size: 1024,
            ..SessionConfig::default()
        };
        let quotas = config.decoder_quotas();
        assert_eq!(quotas.max_envelope, 1024);
        assert_eq!(quotas.max_via, config.quotas.max_via);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_deserializes_partial_json() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"buffer_size": 4096, "quotas": {"max_fault": 64}}"#)
                .unwrap();
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.quotas.max_fault, 64);
        assert_eq!(config.quotas.max_via, 2048);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }
}
