#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `store` is the account-shaped half of the backup system: everything
//! between the framed protocol and the RAID file layer.
//!
//! - [`directory::Directory`]: the binary directory object and its
//!   entries;
//! - [`info::StoreInfo`]: the per-account usage/limits/counters blob;
//! - [`refcount::RefCountDatabase`]: the per-object meta-base (flags,
//!   refcount, size, delta links);
//! - [`accounts::AccountDatabase`]: the account descriptor table;
//! - [`context::StoreContext`]: the per-session state machine performing
//!   every store mutation with its accounting;
//! - [`session`]: the Version, Login, Commands wire loop over a transport
//!   connection;
//! - [`client::StoreClient`]: the typed client side of the same wire
//!   protocol, plus the client configuration file;
//! - [`housekeeping`]: staging garbage collection, refcount rebuild and
//!   audit, usage recomputation.
//!
//! # Concurrency model
//!
//! One session is one thread; nothing here is shared between threads. At
//! most one *mutating* session per account exists at any instant, enforced
//! by an advisory lock on `write.lock` under the account root. Read-only
//! sessions overlap freely and see committed objects only; the RAID
//! layer's staging rename is the publication point.
//!
//! # Errors
//!
//! [`StoreError`] covers session, store, quota and infrastructure
//! failures; [`session`] maps them onto the wire error envelope. Only
//! corruption and framing failures terminate a session.

pub mod accounts;
pub mod client;
pub mod context;
pub mod directory;
mod error;
pub mod filename;
pub mod housekeeping;
pub mod info;
pub mod refcount;
pub mod session;

pub use error::{StoreError, StoreResult};

/// The always-present root directory of every account.
pub const ROOT_DIRECTORY_ID: i64 = 1;

/// Protocol version this store speaks.
pub const PROTOCOL_VERSION: i32 = 1;
