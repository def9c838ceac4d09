#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `checksums` provides the two checksum primitives the store-file codec
//! uses to recognise unchanged blocks when a client re-uploads a file:
//!
//! - [`RollingChecksum`], a cheap 16-bit-pair weak checksum that can slide
//!   a window across a file one byte at a time in O(1);
//! - [`strong::Md5`], the 16-byte strong checksum that confirms a weak
//!   match before a block is referenced instead of re-transmitted.
//!
//! # Design
//!
//! The weak checksum accumulates a byte sum (`s1`) and a prefix sum (`s2`),
//! both truncated to 16 bits, and packs them into one `u32` for the block
//! index. A weak match is only a candidate; callers must confirm it with
//! the strong digest before trusting it.
//!
//! # Invariants
//!
//! - Both state components are masked to 16 bits after every update.
//! - Rolling with an empty window is rejected rather than silently
//!   corrupting state.
//!
//! # Errors
//!
//! [`RollingError`] reports invalid rolling operations and implements
//! [`std::error::Error`].

mod rolling;
pub mod strong;

pub use rolling::{RollingChecksum, RollingError};
