//! Error types for the gateway.

use thiserror::Error;

/// Gateway-wide error type.
///
/// Variants map to the failure classes the subsystems must distinguish:
/// frame/JSON rejections are dropped, FCS mismatches are logged but
/// processed, transport gaps surface to the originating client, and
/// migration failures are fatal.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Frame, JSON, or UTF-8 rejection. Carries a short hex prefix of the
    /// offending bytes for the warn-level log line.
    #[error("decode error: {detail} (prefix: {prefix})")]
    Decode {
        /// What failed to decode
        detail: String,
        /// Hex prefix of the offending bytes (max 120 bytes)
        prefix: String,
    },

    /// Computed frame checksum differs from the wire value. The frame is
    /// still processed (permissive mode).
    #[error("FCS mismatch: computed=0x{computed:04X}, received=0x{received:04X}")]
    FcsMismatch {
        /// Checksum computed from the payload region
        computed: u16,
        /// Checksum carried in the frame footer
        received: u16,
    },

    /// No UDP or BLE adapter registered when the router needed to send.
    #[error("transport unavailable: {transport}")]
    TransportUnavailable {
        /// Which transport was missing
        transport: String,
    },

    /// Request to a UI state endpoint with missing fields. Maps to HTTP 400.
    #[error("validation error: {0}")]
    Validation(String),

    /// Command parser rejected the arguments. The requester gets a short
    /// reply and the attempt counts toward the abuse tally.
    #[error("command format error: {0}")]
    CommandFormat(String),

    /// Same content seen within the throttle window.
    #[error("throttled: retry in {window_secs}s")]
    Throttled {
        /// Remaining throttle window in seconds
        window_secs: u64,
    },

    /// The local BLE service answered HTTP 409.
    #[error("BLE service busy")]
    BleBusy,

    /// Schema migration aborted. Fatal; the process exits non-zero.
    #[error("migration failure: {0}")]
    Migration(String),

    /// Database file exceeded the size cap; the pruner runs synchronously.
    #[error("storage full: {size_bytes} bytes exceeds cap")]
    StorageFull {
        /// Current database file size
        size_bytes: u64,
    },

    /// Database error from sqlx
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Gateway result type
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Build a [`GatewayError::Decode`] from raw bytes, keeping a bounded
    /// hex prefix for the log line.
    pub fn decode(detail: impl Into<String>, raw: &[u8]) -> Self {
        let take = raw.len().min(120);
        Self::Decode {
            detail: detail.into(),
            prefix: hex::encode(&raw[..take]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_bound_prefix_when_building_decode_error() {
        let raw = vec![0xABu8; 500];
        let err = GatewayError::decode("bad frame", &raw);
        match err {
            GatewayError::Decode { prefix, .. } => {
                assert_eq!(prefix.len(), 240, "120 bytes hex-encoded");
            }
            _ => panic!("expected Decode variant"),
        }
    }

    #[test]
    fn test_should_format_fcs_mismatch_as_hex() {
        let err = GatewayError::FcsMismatch {
            computed: 0x12AB,
            received: 0xAB12,
        };
        let text = format!("{err}");
        assert!(text.contains("0x12AB"));
        assert!(text.contains("0xAB12"));
    }
}
