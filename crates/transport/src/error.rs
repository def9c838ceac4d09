use std::io;

use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised by the byte-stream transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Establishing the underlying connection failed.
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    /// A read on the stream failed.
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    /// A write on the stream failed.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    /// The operation's deadline expired before it completed.
    #[error("operation timed out")]
    Timeout,
    /// The peer's certificate chain was missing or not acceptable.
    #[error("peer certificate invalid: {0}")]
    CertificateInvalid(String),
    /// The TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    /// Certificate / key material could not be loaded.
    #[error("cannot load TLS material from {path}: {reason}")]
    BadTlsMaterial {
        /// The file that failed to load.
        path: String,
        /// Why it failed.
        reason: String,
    },
    /// The requested facility does not exist on this platform.
    #[error("not supported on this platform: {0}")]
    Unsupported(&'static str),
}
