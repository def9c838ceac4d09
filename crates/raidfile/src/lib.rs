#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `raidfile` is the storage substrate under the object store: logical
//! files addressed by name within a *disc set*, which is either one
//! directory (plain) or three directories striped with parity so that the
//! loss of any single disc loses no data.
//!
//! # Design
//!
//! - [`RaidController`] owns the disc-set table loaded from the RAID
//!   configuration file. It is an explicit value threaded through
//!   constructors, never process-wide state.
//! - [`RaidFileWrite`] writes through `.rfw` staging files, one per target
//!   disc, and makes the logical file visible atomically by renaming all of
//!   them to their `.rf` final names on commit. A crashed writer leaves
//!   only staging files, which [`scan_staging`] finds for garbage
//!   collection.
//! - [`RaidFileRead`] inspects which discs present a readable file. With
//!   at most one missing it serves the exact original bytes, transparently
//!   XOR-reconstructing from the survivors (and logging the repair). With
//!   two or more missing the open fails with
//!   [`RaidError::Unrecoverable`].
//! - The stripe layout fixes: full blocks alternate between the two data
//!   discs, a final partial block lands on the first data disc, the parity
//!   disc stores the XOR of the data discs' files position by position and
//!   carries the logical length as a trailing big-endian `u64`.
//! - Which physical directory plays which role rotates per logical name
//!   (a byte-sum hash), spreading write pressure without a global
//!   allocator.
//!
//! # Errors
//!
//! [`RaidError`]: `NoSuchDiscSet`, `BadConfig`, `Unrecoverable`, `Io`.

mod controller;
mod error;
mod layout;
mod read;
mod staging;
mod write;

pub use controller::{DiscSet, RaidController};
pub use error::{RaidError, RaidResult};
pub use read::RaidFileRead;
pub use staging::{discard_stale_staging, scan_staging};
pub use write::{AllocationMode, RaidFileWrite};

/// Suffix of a staging file awaiting commit.
pub const STAGING_SUFFIX: &str = ".rfw";

/// Suffix of a committed, readable file.
pub const FINAL_SUFFIX: &str = ".rf";
