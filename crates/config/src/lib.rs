#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `config` reads the hierarchical key/value configuration files used by the
//! store daemon, the RAID layer, and the client tooling. A file is a tree of
//! named blocks; each block holds `Key = value` pairs and nested sub-blocks:
//!
//! ```text
//! Server
//! {
//!     ListenAddresses = inet:0.0.0.0:2201
//!     CertificateFile = /etc/vault/server.pem
//! }
//! ```
//!
//! # Design
//!
//! Parsing and validation are separate steps. [`Configuration::load`] builds
//! the raw tree; [`Configuration::load_and_verify`] additionally checks it
//! against a [`verify::Schema`] describing which keys must exist, their
//! types, defaults, and which sub-blocks are permitted. Keys not named by the
//! schema are rejected, so a typo in a config file is an error rather than a
//! silently ignored line.
//!
//! # Errors
//!
//! All failures surface as [`ConfigError`]; verification collects every
//! problem in the file into one message instead of stopping at the first.

mod configuration;
mod error;
pub mod verify;

pub use configuration::Configuration;
pub use error::{ConfigError, ConfigResult};
