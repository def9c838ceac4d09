use std::collections::HashMap;

use checksums::strong::Md5;
use checksums::RollingChecksum;
use rand::RngCore;

use crate::container;
use crate::error::CodecResult;
use crate::index::{BlockIndex, BlockIndexEntry, FLAG_COMPRESSED, FLAG_FROM_PREVIOUS};
use crate::keys::AccountKeys;

/// Smallest content block a full encode will cut.
const MIN_BLOCK_SIZE: usize = 4 * 1024;

/// Largest content block a full encode will cut.
const MAX_BLOCK_SIZE: usize = 64 * 1024;

/// An encoded object plus its index (the index is also recoverable from
/// the bytes; callers usually want both without re-parsing).
#[derive(Clone, Debug)]
pub struct EncodedFile {
    /// The complete container, ready to store or stream.
    pub bytes: Vec<u8>,
    /// The object's block index.
    pub index: BlockIndex,
}

/// Content block size for a full encode of `content_len` bytes: the power
/// of two nearest the square root, clamped to a sane range. Small files
/// get one block; huge files keep the index small.
#[must_use]
pub fn choose_block_size(content_len: u64) -> usize {
    #[allow(clippy::cast_precision_loss)]
    let root = (content_len as f64).sqrt() as u64;
    let rounded = root.max(1).next_power_of_two() as usize;
    rounded.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
}

/// Encodes `data` as a store-file object.
///
/// With `prior` (an older version's block index) regions matching prior
/// blocks become references instead of inline data; without it every block
/// is inline and the result is a full encoding.
pub fn encode(
    keys: &AccountKeys,
    data: &[u8],
    prior: Option<&BlockIndex>,
) -> CodecResult<EncodedFile> {
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut entries = Vec::new();
    let mut block_data = Vec::new();

    match prior {
        None => {
            inline_region(keys, &iv, data, &mut entries, &mut block_data)?;
        }
        Some(prior) => {
            let matches = find_matches(data, prior);
            let mut position = 0usize;
            for matched in &matches {
                if matched.offset > position {
                    inline_region(
                        keys,
                        &iv,
                        &data[position..matched.offset],
                        &mut entries,
                        &mut block_data,
                    )?;
                }
                let base = prior.entries()[matched.base_block];
                entries.push(BlockIndexEntry {
                    flags: FLAG_FROM_PREVIOUS,
                    size_on_wire: matched.base_block as u32,
                    raw_size: base.raw_size,
                    weak: base.weak,
                    strong: base.strong,
                });
                position = matched.offset + matched.len;
            }
            if position < data.len() {
                inline_region(keys, &iv, &data[position..], &mut entries, &mut block_data)?;
            }
        }
    }

    let index = BlockIndex::new(entries);
    let mut bytes = container::serialize_front(keys, data.len() as u64, &iv, &index);
    bytes.extend_from_slice(&block_data);
    Ok(EncodedFile { bytes, index })
}

/// Splits a region into content blocks and appends them inline.
fn inline_region(
    keys: &AccountKeys,
    iv: &[u8; 16],
    region: &[u8],
    entries: &mut Vec<BlockIndexEntry>,
    block_data: &mut Vec<u8>,
) -> CodecResult<()> {
    let block_size = choose_block_size(region.len() as u64);
    for chunk in region.chunks(block_size) {
        let block_number = entries.len() as u32;
        let weak = RollingChecksum::of_block(chunk);
        let strong = Md5::digest(chunk);

        let (mut stored, flags) = match container::compress_block(chunk)? {
            Some(compressed) => (compressed, FLAG_COMPRESSED),
            None => (chunk.to_vec(), 0),
        };
        container::apply_block_cipher(keys, iv, block_number, &mut stored);

        entries.push(BlockIndexEntry {
            flags,
            size_on_wire: stored.len() as u32,
            raw_size: chunk.len() as u32,
            weak,
            strong,
        });
        block_data.extend_from_slice(&stored);
    }
    Ok(())
}

#[derive(Clone, Copy, Debug)]
struct Match {
    offset: usize,
    len: usize,
    base_block: usize,
}

/// Finds non-overlapping regions of `data` matching prior blocks, by
/// rolling the weak checksum at every distinct prior block size and
/// confirming candidates with the strong checksum. Larger sizes are
/// matched first so a big unchanged run is not shredded by small-block
/// coincidences.
fn find_matches(data: &[u8], prior: &BlockIndex) -> Vec<Match> {
    // size -> weak -> candidate base blocks
    let mut by_size: HashMap<usize, HashMap<u32, Vec<(usize, [u8; 16])>>> = HashMap::new();
    for (block_no, entry) in prior.entries().iter().enumerate() {
        if entry.raw_size == 0 {
            continue;
        }
        by_size
            .entry(entry.raw_size as usize)
            .or_default()
            .entry(entry.weak)
            .or_default()
            .push((block_no, entry.strong));
    }
    let mut sizes: Vec<usize> = by_size.keys().copied().collect();
    sizes.sort_unstable_by(|a, b| b.cmp(a));

    let mut matches: Vec<Match> = Vec::new();
    for size in sizes {
        if size > data.len() {
            continue;
        }
        let weak_map = &by_size[&size];
        let mut rolling = RollingChecksum::new();
        rolling.update(&data[..size]);
        let mut offset = 0usize;
        loop {
            let overlaps = matches
                .iter()
                .any(|m| offset < m.offset + m.len && m.offset < offset + size);
            if !overlaps {
                if let Some(candidates) = weak_map.get(&rolling.value()) {
                    let window = &data[offset..offset + size];
                    let strong = Md5::digest(window);
                    if let Some((base_block, _)) =
                        candidates.iter().find(|(_, s)| *s == strong)
                    {
                        matches.push(Match {
                            offset,
                            len: size,
                            base_block: *base_block,
                        });
                        // Jump past the claim and restart the window.
                        let next = offset + size;
                        if next + size > data.len() {
                            break;
                        }
                        rolling.update_from_block(&data[next..next + size]);
                        offset = next;
                        continue;
                    }
                }
            }
            if offset + size >= data.len() {
                break;
            }
            rolling
                .roll(data[offset], data[offset + size])
                .expect("window is non-empty");
            offset += 1;
        }
    }
    matches.sort_unstable_by_key(|m| m.offset);
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;

    fn keys() -> AccountKeys {
        AccountKeys::derive(b"test-account-secret")
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 31 + i / 100) % 256) as u8).collect()
    }

    #[test]
    fn block_size_tracks_the_square_root() {
        assert_eq!(choose_block_size(0), MIN_BLOCK_SIZE);
        assert_eq!(choose_block_size(100), MIN_BLOCK_SIZE);
        assert_eq!(choose_block_size(1 << 26), 8192);
        assert_eq!(choose_block_size(u64::MAX), MAX_BLOCK_SIZE);
    }

    #[test]
    fn full_encode_inlines_every_block() {
        let data = patterned(100_000);
        let encoded = encode(&keys(), &data, None).unwrap();
        assert!(encoded.index.entries().iter().all(|e| !e.is_reference()));
        assert_eq!(encoded.index.total_raw_size(), 100_000);
    }

    #[test]
    fn identical_reupload_references_every_block() {
        let keys = keys();
        let data = patterned(50_000);
        let first = encode(&keys, &data, None).unwrap();
        let second = encode(&keys, &data, Some(&first.index)).unwrap();
        assert!(second.index.entries().iter().all(BlockIndexEntry::is_reference));
        assert_eq!(decode(&keys, &second.bytes, Some(&first.bytes)).unwrap(), data);
    }

    #[test]
    fn appended_data_inlines_only_the_tail() {
        let keys = keys();
        let base = patterned(40_000);
        let first = encode(&keys, &base, None).unwrap();

        let mut grown = base.clone();
        grown.extend_from_slice(b" and a little more on the end");
        let second = encode(&keys, &grown, Some(&first.index)).unwrap();

        let references = second
            .index
            .entries()
            .iter()
            .filter(|e| e.is_reference())
            .count();
        assert!(references > 0, "unchanged prefix should be referenced");
        assert!(second.index.total_wire_size() < first.index.total_wire_size());
        assert_eq!(decode(&keys, &second.bytes, Some(&first.bytes)).unwrap(), grown);
    }

    #[test]
    fn shifted_content_still_matches_blocks() {
        let keys = keys();
        let base = patterned(40_000);
        let first = encode(&keys, &base, None).unwrap();

        // Insert bytes at the front; rolling matching must still find the
        // old blocks at their shifted offsets.
        let mut shifted = b"prefix!".to_vec();
        shifted.extend_from_slice(&base);
        let second = encode(&keys, &shifted, Some(&first.index)).unwrap();
        assert!(second.index.entries().iter().any(BlockIndexEntry::is_reference));
        assert_eq!(
            decode(&keys, &second.bytes, Some(&first.bytes)).unwrap(),
            shifted
        );
    }

    #[test]
    fn empty_file_encodes_to_an_empty_index() {
        let keys = keys();
        let encoded = encode(&keys, &[], None).unwrap();
        assert!(encoded.index.is_empty());
        assert_eq!(decode(&keys, &encoded.bytes, None).unwrap(), Vec::<u8>::new());
    }
}
