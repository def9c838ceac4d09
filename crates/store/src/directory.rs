//! The binary directory object.
//!
//! A directory is a stored object whose payload lists the objects it
//! contains: header, a typed attributes blob for the directory itself,
//! then one record per entry. Mutation happens on the in-memory copy only;
//! the context persists the whole object atomically through the RAID
//! layer.

use std::io::{self, Read, Write};

use crate::error::{StoreError, StoreResult};
use crate::filename::StoreFilename;

/// Magic prefix of a serialised directory.
pub const DIRECTORY_MAGIC: u32 = 0x56_44_49_52; // "VDIR"

/// Entry flag bits. The low byte matches the wire `ListDirectory` masks.
pub mod entry_flags {
    /// Entry is a file version.
    pub const FILE: u16 = 1;
    /// Entry is a directory.
    pub const DIR: u16 = 2;
    /// Entry has been deleted (kept until housekeeping purges it).
    pub const DELETED: u16 = 4;
    /// Entry is an old, superseded version of its name.
    pub const OLD_VERSION: u16 = 8;
    /// Entry's attributes were modified after upload.
    pub const ATTRIBUTES_MODIFIED: u16 = 16;

    /// Wire-only bit: a per-entry attributes blob follows the name.
    pub(super) const HAS_ATTRIBUTES: u16 = 0x0100;
}

/// One directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Object the entry refers to.
    pub object_id: i64,
    /// Codec blocks the object occupies (quota unit).
    pub size_in_blocks: i64,
    /// Client-side modification time.
    pub modification_time: i64,
    /// 64-bit content+metadata fingerprint.
    pub attributes_hash: i64,
    /// [`entry_flags`] bitset.
    pub flags: u16,
    /// Opaque encrypted filename.
    pub name: StoreFilename,
    /// Optional per-entry attribute blob.
    pub attributes: Vec<u8>,
}

impl DirectoryEntry {
    /// Whether the entry is the current (not old, not deleted) version of
    /// its name.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.flags & (entry_flags::OLD_VERSION | entry_flags::DELETED) == 0
    }

    /// Whether the entry matches a ListDirectory-style flag mask.
    #[must_use]
    pub fn matches(&self, flags_must_be_set: u16, flags_not_to_be_set: u16) -> bool {
        self.flags & flags_must_be_set == flags_must_be_set
            && self.flags & flags_not_to_be_set == 0
    }

    fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mut flags = self.flags & !entry_flags::HAS_ATTRIBUTES;
        if !self.attributes.is_empty() {
            flags |= entry_flags::HAS_ATTRIBUTES;
        }
        out.write_all(&self.object_id.to_be_bytes())?;
        out.write_all(&self.size_in_blocks.to_be_bytes())?;
        out.write_all(&self.modification_time.to_be_bytes())?;
        out.write_all(&self.attributes_hash.to_be_bytes())?;
        out.write_all(&flags.to_be_bytes())?;
        write_blob(out, self.name.as_bytes())?;
        if flags & entry_flags::HAS_ATTRIBUTES != 0 {
            write_blob(out, &self.attributes)?;
        }
        Ok(())
    }

    fn read_from<R: Read>(input: &mut R) -> StoreResult<Self> {
        let object_id = read_i64(input)?;
        let size_in_blocks = read_i64(input)?;
        let modification_time = read_i64(input)?;
        let attributes_hash = read_i64(input)?;
        let flags = read_u16(input)?;
        let name = StoreFilename::new(read_blob(input)?);
        let attributes = if flags & entry_flags::HAS_ATTRIBUTES != 0 {
            read_blob(input)?
        } else {
            Vec::new()
        };
        Ok(Self {
            object_id,
            size_in_blocks,
            modification_time,
            attributes_hash,
            flags: flags & !entry_flags::HAS_ATTRIBUTES,
            name,
            attributes,
        })
    }
}

/// A directory object: its own id, the id of the directory containing it,
/// the directory's own attributes, and its entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Directory {
    object_id: i64,
    container_id: i64,
    attributes_hash: i64,
    attributes: Vec<u8>,
    entries: Vec<DirectoryEntry>,
}

impl Directory {
    /// Creates an empty directory object for `object_id`, contained in
    /// `container_id` (0 for the root).
    #[must_use]
    pub fn new(object_id: i64, container_id: i64) -> Self {
        Self {
            object_id,
            container_id,
            ..Self::default()
        }
    }

    /// The directory's own object id.
    #[must_use]
    pub fn object_id(&self) -> i64 {
        self.object_id
    }

    /// The id of the directory this one lives in (0 for the root).
    #[must_use]
    pub fn container_id(&self) -> i64 {
        self.container_id
    }

    /// Re-parents the directory (used by move).
    pub fn set_container_id(&mut self, container_id: i64) {
        self.container_id = container_id;
    }

    /// The directory's own attribute blob.
    #[must_use]
    pub fn attributes(&self) -> &[u8] {
        &self.attributes
    }

    /// The directory's attributes hash (its modification time in this
    /// implementation's usage).
    #[must_use]
    pub fn attributes_hash(&self) -> i64 {
        self.attributes_hash
    }

    /// Replaces the directory's own attributes.
    pub fn set_attributes(&mut self, attributes: Vec<u8>, attributes_hash: i64) {
        self.attributes = attributes;
        self.attributes_hash = attributes_hash;
    }

    /// Number of entries, including old and deleted ones.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Snapshot iteration over entries matching a flag mask.
    pub fn entries_matching(
        &self,
        flags_must_be_set: u16,
        flags_not_to_be_set: u16,
    ) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries
            .iter()
            .filter(move |e| e.matches(flags_must_be_set, flags_not_to_be_set))
    }

    /// All entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    /// The current (not old, not deleted) entry with `name`, if any.
    /// Uniqueness of `(name, current)` is this type's core invariant.
    #[must_use]
    pub fn find_current_by_name(&self, name: &StoreFilename) -> Option<&DirectoryEntry> {
        self.entries
            .iter()
            .find(|e| e.is_current() && e.name == *name)
    }

    /// The entry for `object_id`, if present.
    #[must_use]
    pub fn find_by_id(&self, object_id: i64) -> Option<&DirectoryEntry> {
        self.entries.iter().find(|e| e.object_id == object_id)
    }

    /// Mutable access to the entry for `object_id`.
    pub fn find_by_id_mut(&mut self, object_id: i64) -> Option<&mut DirectoryEntry> {
        self.entries.iter_mut().find(|e| e.object_id == object_id)
    }

    /// Mutable access to every entry.
    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut DirectoryEntry> {
        self.entries.iter_mut()
    }

    /// Mutable access to every entry sharing `name`.
    pub fn entries_with_name_mut(
        &mut self,
        name: &StoreFilename,
    ) -> impl Iterator<Item = &mut DirectoryEntry> {
        let name = name.clone();
        self.entries.iter_mut().filter(move |e| e.name == name)
    }

    /// Adds an entry. The caller has already resolved name conflicts.
    pub fn add_entry(&mut self, entry: DirectoryEntry) {
        self.entries.push(entry);
    }

    /// Removes the entry for `object_id`, returning it.
    pub fn remove_entry(&mut self, object_id: i64) -> Option<DirectoryEntry> {
        let position = self.entries.iter().position(|e| e.object_id == object_id)?;
        Some(self.entries.remove(position))
    }

    /// Marks every current entry with `name` as an old version, returning
    /// how many were marked.
    pub fn mark_name_as_old_versions(&mut self, name: &StoreFilename) -> usize {
        let mut marked = 0;
        for entry in self.entries.iter_mut() {
            if entry.is_current() && entry.name == *name {
                entry.flags |= entry_flags::OLD_VERSION;
                marked += 1;
            }
        }
        marked
    }

    /// Serialises the directory.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&DIRECTORY_MAGIC.to_be_bytes())?;
        out.write_all(&self.object_id.to_be_bytes())?;
        out.write_all(&self.container_id.to_be_bytes())?;
        out.write_all(&(self.entries.len() as u32).to_be_bytes())?;
        out.write_all(&self.attributes_hash.to_be_bytes())?;
        write_blob(out, &self.attributes)?;
        for entry in &self.entries {
            entry.write_to(out)?;
        }
        Ok(())
    }

    /// Serialises the directory into a byte vector.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out).expect("Vec writes cannot fail");
        out
    }

    /// Parses a serialised directory.
    pub fn read_from<R: Read>(input: &mut R) -> StoreResult<Self> {
        let magic = read_u32(input)?;
        if magic != DIRECTORY_MAGIC {
            return Err(StoreError::CorruptInfo(format!(
                "bad directory magic {magic:#010x}"
            )));
        }
        let object_id = read_i64(input)?;
        let container_id = read_i64(input)?;
        let entry_count = read_u32(input)? as usize;
        let attributes_hash = read_i64(input)?;
        let attributes = read_blob(input)?;
        let mut entries = Vec::with_capacity(entry_count.min(1 << 16));
        for _ in 0..entry_count {
            entries.push(DirectoryEntry::read_from(input)?);
        }
        Ok(Self {
            object_id,
            container_id,
            attributes_hash,
            attributes,
            entries,
        })
    }

    /// Parses a directory from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        let mut cursor = bytes;
        let directory = Self::read_from(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(StoreError::CorruptInfo(format!(
                "directory has {} trailing bytes",
                cursor.len()
            )));
        }
        Ok(directory)
    }
}

fn write_blob<W: Write>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    out.write_all(&(bytes.len() as u32).to_be_bytes())?;
    out.write_all(bytes)
}

fn read_blob<R: Read>(input: &mut R) -> StoreResult<Vec<u8>> {
    let len = read_u32(input)? as usize;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_u16<R: Read>(input: &mut R) -> StoreResult<u16> {
    let mut buf = [0u8; 2];
    input.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32<R: Read>(input: &mut R) -> StoreResult<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_i64<R: Read>(input: &mut R) -> StoreResult<i64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_entry(object_id: i64, name: &[u8], flags: u16) -> DirectoryEntry {
        DirectoryEntry {
            object_id,
            size_in_blocks: 3,
            modification_time: 1000 + object_id,
            attributes_hash: 7,
            flags: entry_flags::FILE | flags,
            name: StoreFilename::from(name),
            attributes: Vec::new(),
        }
    }

    #[test]
    fn empty_directory_round_trips() {
        let dir = Directory::new(1, 0);
        assert_eq!(Directory::from_bytes(&dir.to_bytes()).unwrap(), dir);
    }

    #[test]
    fn populated_directory_round_trips() {
        let mut dir = Directory::new(1, 0);
        dir.set_attributes(vec![0xAA, 0xBB], 99);
        dir.add_entry(file_entry(2, b"a", 0));
        let mut with_attrs = file_entry(3, b"b", entry_flags::OLD_VERSION);
        with_attrs.attributes = vec![1, 2, 3, 4];
        dir.add_entry(with_attrs);
        dir.add_entry(DirectoryEntry {
            flags: entry_flags::DIR,
            ..file_entry(4, b"sub", 0)
        });

        let parsed = Directory::from_bytes(&dir.to_bytes()).unwrap();
        assert_eq!(parsed, dir);
        assert_eq!(parsed.entry_count(), 3);
    }

    #[test]
    fn large_directory_round_trips() {
        let mut dir = Directory::new(1, 0);
        for n in 0..10_000i64 {
            dir.add_entry(file_entry(n + 2, format!("file{n}").as_bytes(), 0));
        }
        let parsed = Directory::from_bytes(&dir.to_bytes()).unwrap();
        assert_eq!(parsed.entry_count(), 10_000);
        assert_eq!(parsed, dir);
    }

    #[test]
    fn flag_masks_filter_entries() {
        let mut dir = Directory::new(1, 0);
        dir.add_entry(file_entry(2, b"a", 0));
        dir.add_entry(file_entry(3, b"a", entry_flags::OLD_VERSION));
        dir.add_entry(file_entry(4, b"b", entry_flags::DELETED));

        let current: Vec<i64> = dir
            .entries_matching(
                entry_flags::FILE,
                entry_flags::OLD_VERSION | entry_flags::DELETED,
            )
            .map(|e| e.object_id)
            .collect();
        assert_eq!(current, vec![2]);

        let everything = dir.entries_matching(0, 0).count();
        assert_eq!(everything, 3);
    }

    #[test]
    fn one_current_entry_per_name() {
        let mut dir = Directory::new(1, 0);
        dir.add_entry(file_entry(2, b"a", 0));
        assert_eq!(dir.mark_name_as_old_versions(&StoreFilename::from(&b"a"[..])), 1);
        dir.add_entry(file_entry(3, b"a", 0));

        let current = dir
            .find_current_by_name(&StoreFilename::from(&b"a"[..]))
            .unwrap();
        assert_eq!(current.object_id, 3);
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut bytes = Directory::new(1, 0).to_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            Directory::from_bytes(&bytes),
            Err(StoreError::CorruptInfo(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_corrupt() {
        let mut bytes = Directory::new(1, 0).to_bytes();
        bytes.push(0);
        assert!(matches!(
            Directory::from_bytes(&bytes),
            Err(StoreError::CorruptInfo(_))
        ));
    }
}
