#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `transport` is the byte-stream layer under the framed protocol: a
//! mutually authenticated, length-agnostic, timeout-aware duplex stream.
//! Servers compose a [`Listener`] (`accept(timeout)`) with the
//! per-connection [`Connection`] capability (`read`, `write_all`,
//! `peer_common_name`, `shutdown`); the protocol runtime above never sees
//! sockets or TLS types.
//!
//! # Design
//!
//! - [`TlsContext`] loads the certificate / private key / trusted-CA trio
//!   once and hands out rustls configs for both directions. The server
//!   requires a client certificate; the client verifies the server against
//!   the same CA store. The peer's X.509 Common Name is exposed after the
//!   handshake for account authorisation.
//! - Every read and write derives a deadline from the caller's timeout. A
//!   read that times out returns `Ok(0)`, exactly like a clean half-close;
//!   callers that must distinguish the two track protocol state. Partial
//!   writes are retried until the cumulative deadline expires, then fail
//!   with [`TransportError::Timeout`].
//! - [`local::pair`] builds an in-process duplex stream with the same
//!   semantics, used by the CLI tooling talking to a local daemon and by
//!   tests that want a real session without sockets.
//!
//! # Errors
//!
//! [`TransportError`]: `Connect`, `Read`, `Write`, `Timeout`,
//! `CertificateInvalid`, `Handshake`, plus `Unsupported` for platform
//! facilities (peer credentials) that do not exist everywhere.

mod connection;
mod error;
pub mod local;
mod tls;

#[cfg(unix)]
mod creds;

pub use connection::{Connection, Listener, ShutdownHow};
pub use error::{TransportError, TransportResult};
pub use tls::{TlsConnection, TlsContext, TlsListener};

#[cfg(unix)]
pub use creds::{peer_credentials, PeerCredentials};
