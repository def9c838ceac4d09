#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `protocol` is the framed request/response runtime between backup client
//! and store server. It turns the raw byte stream of the transport layer
//! into typed messages plus in-band bulk streams:
//!
//! - every frame is `u32 size, u32 type` (network byte order) followed by
//!   `size - 8` payload bytes;
//! - the reserved type `0xFFFF_FFFF` announces a byte stream, either of
//!   exact known size or of *uncertain* size, in which case the body is a
//!   sequence of self-delimited chunks (see [`wire::STREAM_SIZE_TABLE`]);
//! - both peers exchange a fixed 32-byte identity string before the first
//!   frame; a mismatch aborts the connection.
//!
//! # Design
//!
//! Messages serialise themselves into an in-memory frame through the
//! [`codec::MessageWriter`]/[`codec::MessageReader`] primitives (fixed-width
//! network-order integers, length-prefixed byte strings, counted vectors).
//! The [`Command`] and [`Reply`] enums cover the full message catalogue and
//! dispatch on the frame's type tag. [`Protocol`] drives a transport
//! [`Connection`](transport::Connection): sends and receives are strictly
//! serial, and an announced stream must be fully consumed before the next
//! object frame is read.
//!
//! # Invariants
//!
//! - Object frames larger than the configured maximum (default 16 KiB) are
//!   rejected before the payload is read.
//! - Stream chunk headers 254 and 255 are reserved; receiving one is an
//!   error.
//! - The handshake runs lazily, exactly once, before the first send or
//!   receive in either direction.
//!
//! # Errors
//!
//! All failures surface as [`ProtocolError`]. Framing errors are fatal to
//! the session; the store layer maps them onto the wire error envelope
//! where a reply is still possible.

pub mod codec;
mod error;
mod message;
mod runtime;
pub mod wire;

pub use error::{ProtocolError, ProtocolResult};
pub use message::{error_codes, list_flags, login_flags, move_flags, AccountUsage, Command, Reply};
pub use runtime::{Protocol, StreamReader, StreamSize};
