use bbfs_types::HostId;
use thiserror::Error;

use crate::bulk::{BulkDirection, BulkMode};

/// Errors surfaced by the transport layer.
#[derive(Debug, Error)]
pub enum NetError {
    /// An RPC attempt did not complete within its per-attempt timeout.
    #[error("rpc timed out")]
    Timeout,

    /// The server declined the request at the transport level (read RPC
    /// where no chunk matched the receiving daemon).
    #[error("rpc canceled by server")]
    Canceled,

    /// The bulk descriptor does not resolve to a registered buffer.
    #[error("unknown bulk handle {0}")]
    InvalidBulkHandle(u64),

    /// The registered buffer's access mode forbids the requested transfer.
    #[error("bulk mode {mode:?} forbids {direction:?} transfer")]
    BulkModeViolation {
        mode: BulkMode,
        direction: BulkDirection,
    },

    /// A transfer or access would run past the end of a registered buffer.
    #[error("bulk range [{offset}, {offset}+{size}) exceeds buffer of {len} bytes")]
    BulkOutOfBounds { offset: u64, size: u64, len: u64 },

    /// No endpoint is known for the daemon id.
    #[error("unknown host {0}")]
    UnknownHost(HostId),

    /// Request or response could not be moved across the transport.
    #[error("send failed: {0}")]
    SendFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_out_of_bounds() {
        let err = NetError::BulkOutOfBounds {
            offset: 8,
            size: 16,
            len: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("[8, 8+16)"));
        assert!(msg.contains("10 bytes"));
    }

    #[test]
    fn test_display_mode_violation() {
        let err = NetError::BulkModeViolation {
            mode: BulkMode::ReadOnly,
            direction: BulkDirection::Push,
        };
        assert!(err.to_string().contains("ReadOnly"));
        assert!(err.to_string().contains("Push"));
    }

    #[test]
    fn test_display_unknown_host() {
        let err = NetError::UnknownHost(HostId(9));
        assert_eq!(err.to_string(), "unknown host 9");
    }
}
