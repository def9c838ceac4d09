use thiserror::Error;

use transport::TransportError;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by the framed protocol runtime.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The underlying transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The peer's 32-byte identity string did not match ours.
    #[error("protocol handshake failed")]
    HandshakeFailed,
    /// The peer closed (or went quiet) in the middle of a frame.
    #[error("connection closed mid-frame")]
    ConnectionClosed,
    /// An inbound object frame exceeded the configured maximum size.
    #[error("object of {size} bytes exceeds the {max} byte limit")]
    ObjectTooBig {
        /// Announced payload size.
        size: u64,
        /// Configured maximum.
        max: usize,
    },
    /// A frame header was structurally invalid.
    #[error("malformed frame header")]
    BadCommand,
    /// A stream frame arrived where an object frame was expected.
    #[error("stream received when object expected")]
    StreamWhenObjectExpected,
    /// An object frame arrived where a stream frame was expected.
    #[error("object received when stream expected")]
    ObjectWhenStreamExpected,
    /// The frame's type tag names no known message.
    #[error("unknown message type {0}")]
    UnknownCommand(u32),
    /// A reply arrived that the current exchange cannot accept.
    #[error("unexpected reply type {0}")]
    UnexpectedReply(u32),
    /// An uncertain-size stream used a reserved chunk header.
    #[error("bad stream chunk header {0}")]
    BadStreamHeader(u8),
    /// The deadline expired while sending a stream.
    #[error("timed out sending stream")]
    TimeoutSendingStream,
    /// A message payload was shorter than its declared fields.
    #[error("message payload truncated")]
    PayloadTruncated,
    /// A message payload had bytes left over after all fields were read.
    #[error("message payload has {0} trailing bytes")]
    PayloadTrailing(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_too_big_reports_both_sizes() {
        let err = ProtocolError::ObjectTooBig {
            size: 20 * 1024 * 1024,
            max: 16 * 1024,
        };
        let text = err.to_string();
        assert!(text.contains("20971520"));
        assert!(text.contains("16384"));
    }

    #[test]
    fn transport_errors_pass_through() {
        let err: ProtocolError = TransportError::Timeout.into();
        assert_eq!(err.to_string(), "operation timed out");
    }
}
