use checksums::strong::Md5;

use crate::container::{self, Container};
use crate::encode::encode;
use crate::error::{CodecError, CodecResult};
use crate::index::FLAG_COMPRESSED;
use crate::keys::AccountKeys;

/// Decodes an object back to its clear content.
///
/// A delta object needs its base version's encoded bytes in `base`;
/// passing `None` for a delta fails with [`CodecError::MissingBase`].
pub fn decode(keys: &AccountKeys, object: &[u8], base: Option<&[u8]>) -> CodecResult<Vec<u8>> {
    let parsed = container::parse(keys, object)?;
    let base_parsed = match base {
        Some(bytes) => Some(container::parse(keys, bytes)?),
        None => None,
    };

    let mut out = Vec::with_capacity(usize::try_from(parsed.content_size).unwrap_or(0));
    let mut data_offset = 0usize;
    for (block_number, entry) in parsed.index.entries().iter().enumerate() {
        let clear = if entry.is_reference() {
            let base_parsed = base_parsed.as_ref().ok_or(CodecError::MissingBase)?;
            let clear = decode_inline_block(keys, base_parsed, entry.size_on_wire as usize)?;
            // The reference carries the checksums of what it expects to
            // find; a drifted base is detected here, not trusted.
            if clear.len() != entry.raw_size as usize || Md5::digest(&clear) != entry.strong {
                return Err(CodecError::ChecksumMismatch {
                    block: block_number,
                });
            }
            clear
        } else {
            let stored_len = entry.size_on_wire as usize;
            let stored = parsed
                .data
                .get(data_offset..data_offset + stored_len)
                .ok_or_else(|| CodecError::BadIndex("data region overrun".into()))?;
            data_offset += stored_len;
            let clear = decrypt_block(keys, &parsed, block_number as u32, entry.flags, stored, entry.raw_size as usize)?;
            if clear.len() != entry.raw_size as usize || Md5::digest(&clear) != entry.strong {
                return Err(CodecError::ChecksumMismatch {
                    block: block_number,
                });
            }
            clear
        };
        out.extend_from_slice(&clear);
    }

    if out.len() as u64 != parsed.content_size {
        return Err(CodecError::BadIndex(format!(
            "decoded {} bytes, header announces {}",
            out.len(),
            parsed.content_size
        )));
    }
    Ok(out)
}

/// Re-materialises a delta as a full object (dependency reversal): decode
/// against the base, then re-encode with every block inline.
pub fn merge_delta(
    keys: &AccountKeys,
    base_object: &[u8],
    delta_object: &[u8],
) -> CodecResult<Vec<u8>> {
    let content = decode(keys, delta_object, Some(base_object))?;
    Ok(encode(keys, &content, None)?.bytes)
}

/// Decodes one inline block of a parsed container. References are not
/// followed: delta chains are one level deep, so a base block that is
/// itself a reference means the chain is broken.
fn decode_inline_block(
    keys: &AccountKeys,
    parsed: &Container<'_>,
    block_number: usize,
) -> CodecResult<Vec<u8>> {
    let entries = parsed.index.entries();
    let entry = entries
        .get(block_number)
        .ok_or_else(|| CodecError::BadIndex(format!("no block {block_number} in base")))?;
    if entry.is_reference() {
        return Err(CodecError::MissingBase);
    }
    let data_offset: usize = entries[..block_number]
        .iter()
        .filter(|e| !e.is_reference())
        .map(|e| e.size_on_wire as usize)
        .sum();
    let stored = parsed
        .data
        .get(data_offset..data_offset + entry.size_on_wire as usize)
        .ok_or_else(|| CodecError::BadIndex("base data region overrun".into()))?;
    decrypt_block(
        keys,
        parsed,
        block_number as u32,
        entry.flags,
        stored,
        entry.raw_size as usize,
    )
}

fn decrypt_block(
    keys: &AccountKeys,
    parsed: &Container<'_>,
    block_number: u32,
    flags: u8,
    stored: &[u8],
    raw_size: usize,
) -> CodecResult<Vec<u8>> {
    let mut clear = stored.to_vec();
    container::apply_block_cipher(keys, &parsed.iv, block_number, &mut clear);
    if flags & FLAG_COMPRESSED != 0 {
        clear = container::decompress_block(&clear, raw_size)?;
    }
    Ok(clear)
}
