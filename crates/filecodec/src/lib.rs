#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `filecodec` is the store-file container format: a self-describing,
//! encrypted, authenticated object holding one version of one file, block
//! by block. A version is either a *full* encoding (every block inline) or
//! a *delta* whose unchanged blocks are references into an older version.
//!
//! # Design
//!
//! An encoded object is laid out as:
//!
//! ```text
//! magic u32 | content_size u64 | iv [16]      header
//! entry_count u32 | descriptors...            block index
//! hmac [32]                                   HMAC-SHA256(header + index)
//! block data...                               inline blocks, in index order
//! ```
//!
//! Each descriptor records the stored size, the clear size, a weak rolling
//! checksum and a 16-byte strong checksum of the clear block, and flags.
//! Inline blocks are deflate-compressed when that helps and always
//! AES-128-CTR encrypted with a per-block nonce derived from the object IV.
//! A `FROM_PREVIOUS` descriptor carries the base version's block number in
//! the stored-size slot and no data bytes at all.
//!
//! Readers verify the HMAC before trusting a single index field, and every
//! decoded block is checked against its strong checksum.
//!
//! # Delta encoding
//!
//! A client re-uploading a file fetches only the prior version's block
//! index, slides the weak checksum across the local file at the prior
//! block sizes, confirms weak hits with the strong checksum, and inlines
//! only the regions that match nothing ([`encode`] with a prior index).
//! [`merge_delta`] re-materialises a delta as a full object when its base
//! must change representation.
//!
//! # Errors
//!
//! [`CodecError`]: `BadMagic`, `HmacMismatch`, `MissingBase`,
//! `ChecksumMismatch`, `BadIndex`, `Io`.

mod container;
mod decode;
mod encode;
mod error;
mod index;
mod keys;

pub use container::OBJECT_MAGIC;
pub use decode::{decode, merge_delta};
pub use encode::{choose_block_size, encode, EncodedFile};
pub use error::{CodecError, CodecResult};
pub use index::{
    extract_block_index, extract_content_size, BlockIndex, BlockIndexEntry, FLAG_COMPRESSED,
    FLAG_FROM_PREVIOUS,
};
pub use keys::AccountKeys;

/// Codec blocks a stored object occupies at a given RAID block size; the
/// unit all quota accounting is done in. Objects always charge at least
/// one block.
#[must_use]
pub fn size_in_blocks(encoded_len: u64, raid_block_size: usize) -> u64 {
    let block = raid_block_size as u64;
    encoded_len.div_ceil(block).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_in_blocks_rounds_up_and_floors_at_one() {
        assert_eq!(size_in_blocks(0, 4096), 1);
        assert_eq!(size_in_blocks(1, 4096), 1);
        assert_eq!(size_in_blocks(4096, 4096), 1);
        assert_eq!(size_in_blocks(4097, 4096), 2);
    }
}
