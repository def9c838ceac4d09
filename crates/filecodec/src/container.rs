//! Container parsing and the per-block crypto helpers.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::io::{Read, Write};

use crate::error::{CodecError, CodecResult};
use crate::index::{BlockIndex, BlockIndexEntry, ENTRY_WIRE_LEN};
use crate::keys::AccountKeys;

type Aes128Ctr = ctr::Ctr64BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Magic prefix of an encoded store-file object.
pub const OBJECT_MAGIC: u32 = 0x56_4F_42_4A; // "VOBJ"

/// Fixed header: magic, content size, IV.
pub(crate) const HEADER_LEN: usize = 4 + 8 + 16;

/// Width of the authentication tag between index and data.
pub(crate) const HMAC_LEN: usize = 32;

/// A parsed, authenticated object.
pub(crate) struct Container<'a> {
    pub content_size: u64,
    pub iv: [u8; 16],
    pub index: BlockIndex,
    pub data: &'a [u8],
}

/// Parses and authenticates an encoded object. The HMAC is checked before
/// any index field is interpreted beyond the entry count needed to locate
/// it.
pub(crate) fn parse<'a>(keys: &AccountKeys, object: &'a [u8]) -> CodecResult<Container<'a>> {
    let index_end = locate_index_end(object)?;
    let mut mac = HmacSha256::new_from_slice(keys.authentication())
        .expect("HMAC accepts any key length");
    mac.update(&object[..index_end]);
    mac.verify_slice(&object[index_end..index_end + HMAC_LEN])
        .map_err(|_| CodecError::HmacMismatch)?;
    parse_layout(object, index_end)
}

/// Parses an object structurally without authenticating it. The store
/// server holds no account keys (clients encrypt end to end), yet must
/// slice out block indexes and sizes; key holders use [`parse`] and the
/// decoder's per-block checksums for anything they act on.
pub(crate) fn parse_untrusted(object: &[u8]) -> CodecResult<Container<'_>> {
    let index_end = locate_index_end(object)?;
    parse_layout(object, index_end)
}

fn locate_index_end(object: &[u8]) -> CodecResult<usize> {
    if object.len() < HEADER_LEN + 4 + HMAC_LEN {
        return Err(CodecError::BadIndex("object shorter than header".into()));
    }
    let magic = u32::from_be_bytes(object[0..4].try_into().expect("length checked"));
    if magic != OBJECT_MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let entry_count =
        u32::from_be_bytes(object[HEADER_LEN..HEADER_LEN + 4].try_into().expect("length checked"))
            as usize;
    let index_end = HEADER_LEN + 4 + entry_count * ENTRY_WIRE_LEN;
    if object.len() < index_end + HMAC_LEN {
        return Err(CodecError::BadIndex("object shorter than its index".into()));
    }
    Ok(index_end)
}

fn parse_layout(object: &[u8], index_end: usize) -> CodecResult<Container<'_>> {
    let content_size = u64::from_be_bytes(object[4..12].try_into().expect("length checked"));
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&object[12..28]);

    let entry_count = (index_end - HEADER_LEN - 4) / ENTRY_WIRE_LEN;
    let mut entries = Vec::with_capacity(entry_count);
    let mut offset = HEADER_LEN + 4;
    for _ in 0..entry_count {
        entries.push(BlockIndexEntry::read_from(&object[offset..])?);
        offset += ENTRY_WIRE_LEN;
    }
    let index = BlockIndex::new(entries);

    let data = &object[index_end + HMAC_LEN..];
    if data.len() as u64 != index.total_wire_size() {
        return Err(CodecError::BadIndex(format!(
            "data region is {} bytes, index announces {}",
            data.len(),
            index.total_wire_size()
        )));
    }
    Ok(Container {
        content_size,
        iv,
        index,
        data,
    })
}

/// Serialises header + index and appends the HMAC; block data follows.
pub(crate) fn serialize_front(
    keys: &AccountKeys,
    content_size: u64,
    iv: &[u8; 16],
    index: &BlockIndex,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + 4 + index.len() * ENTRY_WIRE_LEN + HMAC_LEN);
    out.extend_from_slice(&OBJECT_MAGIC.to_be_bytes());
    out.extend_from_slice(&content_size.to_be_bytes());
    out.extend_from_slice(iv);
    out.extend_from_slice(&(index.len() as u32).to_be_bytes());
    for entry in index.entries() {
        entry.write_to(&mut out);
    }
    let mut mac = HmacSha256::new_from_slice(keys.authentication())
        .expect("HMAC accepts any key length");
    mac.update(&out);
    let tag: [u8; HMAC_LEN] = mac.finalize().into_bytes().into();
    out.extend_from_slice(&tag);
    out
}

/// Per-block nonce: the object IV's first 12 bytes plus the block number.
fn block_nonce(iv: &[u8; 16], block_number: u32) -> [u8; 16] {
    let mut nonce = *iv;
    nonce[12..16].copy_from_slice(&block_number.to_be_bytes());
    nonce
}

/// Encrypts (or decrypts; CTR is symmetric) a block in place.
pub(crate) fn apply_block_cipher(
    keys: &AccountKeys,
    iv: &[u8; 16],
    block_number: u32,
    data: &mut [u8],
) {
    let nonce = block_nonce(iv, block_number);
    let mut cipher = Aes128Ctr::new(keys.encryption().into(), (&nonce).into());
    cipher.apply_keystream(data);
}

/// Deflate-compresses `data`, returning `None` when compression does not
/// shrink it.
pub(crate) fn compress_block(data: &[u8]) -> CodecResult<Option<Vec<u8>>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;
    if compressed.len() < data.len() {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}

/// Inflates a compressed block to its recorded clear size.
pub(crate) fn decompress_block(data: &[u8], raw_size: usize) -> CodecResult<Vec<u8>> {
    let mut out = Vec::with_capacity(raw_size);
    DeflateDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}
