use crate::container;
use crate::error::{CodecError, CodecResult};

/// Descriptor flag: the block's content lives in an older version; the
/// `size_on_wire` slot holds the base version's block number and no data
/// bytes follow in this object.
pub const FLAG_FROM_PREVIOUS: u8 = 0x01;

/// Descriptor flag: the stored bytes are deflate-compressed.
pub const FLAG_COMPRESSED: u8 = 0x02;

/// Magic prefix of a serialised block-index stream.
const INDEX_STREAM_MAGIC: u32 = 0x56_49_44_58; // "VIDX"

/// Serialised width of one descriptor.
pub(crate) const ENTRY_WIRE_LEN: usize = 1 + 4 + 4 + 4 + 16;

/// One block descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockIndexEntry {
    /// `FLAG_*` bitset.
    pub flags: u8,
    /// Stored byte count for inline blocks; base block number for
    /// `FROM_PREVIOUS` references.
    pub size_on_wire: u32,
    /// Clear (decoded) byte count of the block.
    pub raw_size: u32,
    /// Weak rolling checksum of the clear block.
    pub weak: u32,
    /// Strong checksum of the clear block.
    pub strong: [u8; 16],
}

impl BlockIndexEntry {
    /// Whether the block references the base version instead of carrying
    /// data.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        self.flags & FLAG_FROM_PREVIOUS != 0
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.flags);
        out.extend_from_slice(&self.size_on_wire.to_be_bytes());
        out.extend_from_slice(&self.raw_size.to_be_bytes());
        out.extend_from_slice(&self.weak.to_be_bytes());
        out.extend_from_slice(&self.strong);
    }

    pub(crate) fn read_from(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < ENTRY_WIRE_LEN {
            return Err(CodecError::BadIndex("truncated descriptor".into()));
        }
        let mut strong = [0u8; 16];
        strong.copy_from_slice(&bytes[13..29]);
        Ok(Self {
            flags: bytes[0],
            size_on_wire: u32::from_be_bytes(bytes[1..5].try_into().expect("length checked")),
            raw_size: u32::from_be_bytes(bytes[5..9].try_into().expect("length checked")),
            weak: u32::from_be_bytes(bytes[9..13].try_into().expect("length checked")),
            strong,
        })
    }
}

/// The block index of one encoded object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
}

impl BlockIndex {
    /// Creates an index from descriptors.
    #[must_use]
    pub fn new(entries: Vec<BlockIndexEntry>) -> Self {
        Self { entries }
    }

    /// The descriptors in block order.
    #[must_use]
    pub fn entries(&self) -> &[BlockIndexEntry] {
        &self.entries
    }

    /// Number of blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index has no blocks (a zero-length file).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the clear block sizes.
    #[must_use]
    pub fn total_raw_size(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.raw_size)).sum()
    }

    /// Sum of the stored (inline) block sizes.
    #[must_use]
    pub fn total_wire_size(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| !e.is_reference())
            .map(|e| u64::from(e.size_on_wire))
            .sum()
    }

    /// Serialises the index as a standalone stream, the form sent to
    /// clients asking for a version's block index before a delta upload.
    #[must_use]
    pub fn to_stream_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.entries.len() * ENTRY_WIRE_LEN);
        out.extend_from_slice(&INDEX_STREAM_MAGIC.to_be_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for entry in &self.entries {
            entry.write_to(&mut out);
        }
        out
    }

    /// Parses a standalone block-index stream.
    pub fn from_stream_bytes(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < 8 {
            return Err(CodecError::BadIndex("truncated index stream".into()));
        }
        let magic = u32::from_be_bytes(bytes[0..4].try_into().expect("length checked"));
        if magic != INDEX_STREAM_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let count = u32::from_be_bytes(bytes[4..8].try_into().expect("length checked")) as usize;
        let body = &bytes[8..];
        if body.len() != count * ENTRY_WIRE_LEN {
            return Err(CodecError::BadIndex(format!(
                "index stream claims {count} entries but carries {} bytes",
                body.len()
            )));
        }
        let mut entries = Vec::with_capacity(count);
        for chunk in body.chunks_exact(ENTRY_WIRE_LEN) {
            entries.push(BlockIndexEntry::read_from(chunk)?);
        }
        Ok(Self { entries })
    }
}

/// Pulls the block index out of an encoded object without decrypting any
/// block data.
///
/// Structural only: the store server has no account keys, so no HMAC is
/// checked here. Key holders that act on block *content* go through the
/// decoder, which authenticates first.
pub fn extract_block_index(object: &[u8]) -> CodecResult<BlockIndex> {
    let parsed = container::parse_untrusted(object)?;
    Ok(parsed.index)
}

/// Content size recorded in an encoded object's header, without
/// authentication (see [`extract_block_index`]).
pub fn extract_content_size(object: &[u8]) -> CodecResult<u64> {
    Ok(container::parse_untrusted(object)?.content_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(n: u8) -> BlockIndexEntry {
        BlockIndexEntry {
            flags: FLAG_COMPRESSED,
            size_on_wire: 100 + u32::from(n),
            raw_size: 4096,
            weak: 0xAABB_0000 | u32::from(n),
            strong: [n; 16],
        }
    }

    #[test]
    fn stream_form_round_trips() {
        let index = BlockIndex::new(vec![sample_entry(1), sample_entry(2)]);
        let bytes = index.to_stream_bytes();
        assert_eq!(BlockIndex::from_stream_bytes(&bytes).unwrap(), index);
    }

    #[test]
    fn empty_index_round_trips() {
        let index = BlockIndex::default();
        let bytes = index.to_stream_bytes();
        let parsed = BlockIndex::from_stream_bytes(&bytes).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = BlockIndex::default().to_stream_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            BlockIndex::from_stream_bytes(&bytes),
            Err(CodecError::BadMagic(_))
        ));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut bytes = BlockIndex::new(vec![sample_entry(1)]).to_stream_bytes();
        bytes.pop();
        assert!(matches!(
            BlockIndex::from_stream_bytes(&bytes),
            Err(CodecError::BadIndex(_))
        ));
    }

    #[test]
    fn totals_skip_references() {
        let mut reference = sample_entry(3);
        reference.flags = FLAG_FROM_PREVIOUS;
        reference.size_on_wire = 7; // base block number, not bytes
        let index = BlockIndex::new(vec![sample_entry(1), reference]);
        assert_eq!(index.total_wire_size(), 101);
        assert_eq!(index.total_raw_size(), 2 * 4096);
    }
}
