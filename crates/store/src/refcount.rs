//! The per-account reference-count database (object meta-base).
//!
//! A dense random-access file keyed by object id: one fixed-size entry
//! holding flags, refcount, size and the delta dependency links. The
//! database is derived state, rebuildable from the directory tree, so it
//! lives as a plain file on the first disc of the account's set rather
//! than striped.
//!
//! Rebuilds write a temporary `.X` file that replaces the permanent one
//! atomically on [`commit`](RefCountDatabase::commit); a temporary that is
//! neither committed nor discarded is a programming error.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::error;

use crate::error::{StoreError, StoreResult};

/// Magic prefix of the database file.
pub const REFCOUNT_MAGIC: u32 = 0x52656643; // "RefC"

/// File name under the account's `info/` directory.
pub const REFCOUNT_FILENAME: &str = "info/refcount.rdb";

/// Suffix of the rebuild staging file.
pub const TEMPORARY_SUFFIX: &str = ".X";

const HEADER_LEN: u64 = 8;
const ENTRY_LEN: u64 = 30;

/// One object's meta-base entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefCountEntry {
    /// Object kind flags, same bit layout as directory entries.
    pub flags: u16,
    /// Number of live directory references.
    pub refcount: u32,
    /// Codec blocks the object occupies.
    pub size_in_blocks: i64,
    /// Newer version depending on this object (0 = none). An object with
    /// a dependent is never physically removed.
    pub depends_newer: i64,
    /// Older version this object's delta depends on (0 = none).
    pub depends_older: i64,
}

impl RefCountEntry {
    fn to_bytes(self) -> [u8; ENTRY_LEN as usize] {
        let mut out = [0u8; ENTRY_LEN as usize];
        out[0..2].copy_from_slice(&self.flags.to_be_bytes());
        out[2..6].copy_from_slice(&self.refcount.to_be_bytes());
        out[6..14].copy_from_slice(&(self.size_in_blocks as u64).to_be_bytes());
        out[14..22].copy_from_slice(&(self.depends_newer as u64).to_be_bytes());
        out[22..30].copy_from_slice(&(self.depends_older as u64).to_be_bytes());
        out
    }

    fn from_bytes(bytes: &[u8; ENTRY_LEN as usize]) -> Self {
        Self {
            flags: u16::from_be_bytes(bytes[0..2].try_into().expect("length checked")),
            refcount: u32::from_be_bytes(bytes[2..6].try_into().expect("length checked")),
            size_in_blocks: u64::from_be_bytes(bytes[6..14].try_into().expect("length checked"))
                as i64,
            depends_newer: u64::from_be_bytes(bytes[14..22].try_into().expect("length checked"))
                as i64,
            depends_older: u64::from_be_bytes(bytes[22..30].try_into().expect("length checked"))
                as i64,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Kind {
    Permanent { read_only: bool },
    Temporary,
}

/// The reference-count database of one account.
#[derive(Debug)]
pub struct RefCountDatabase {
    file: File,
    path: PathBuf,
    account_id: i32,
    kind: Kind,
    disposed: bool,
}

impl RefCountDatabase {
    /// Path of the (permanent) database under an account directory.
    #[must_use]
    pub fn path_for(account_dir: &Path) -> PathBuf {
        account_dir.join(REFCOUNT_FILENAME)
    }

    /// Creates a temporary database for a rebuild. Commit renames it over
    /// the permanent file; discard deletes it.
    pub fn create_temporary(account_dir: &Path, account_id: i32) -> StoreResult<Self> {
        let path = PathBuf::from(format!(
            "{}{TEMPORARY_SUFFIX}",
            Self::path_for(account_dir).display()
        ));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&REFCOUNT_MAGIC.to_be_bytes())?;
        file.write_all(&account_id.to_be_bytes())?;
        Ok(Self {
            file,
            path,
            account_id,
            kind: Kind::Temporary,
            disposed: false,
        })
    }

    /// Opens the permanent database. Read-write opens require the caller
    /// to hold the account write lock.
    pub fn open_permanent(account_dir: &Path, account_id: i32, read_only: bool) -> StoreResult<Self> {
        let path = Self::path_for(account_dir);
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(|err| {
                StoreError::CorruptRefCountDb(format!(
                    "cannot open {}: {err}",
                    path.display()
                ))
            })?;
        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|_| StoreError::CorruptRefCountDb("short header".into()))?;
        let magic = u32::from_be_bytes(header[0..4].try_into().expect("length checked"));
        if magic != REFCOUNT_MAGIC {
            return Err(StoreError::CorruptRefCountDb(format!(
                "bad magic {magic:#010x}"
            )));
        }
        let stored_account = i32::from_be_bytes(header[4..8].try_into().expect("length checked"));
        if stored_account != account_id {
            return Err(StoreError::CorruptRefCountDb(format!(
                "database belongs to account {stored_account:#010x}"
            )));
        }
        Ok(Self {
            file,
            path,
            account_id,
            kind: Kind::Permanent { read_only },
            disposed: false,
        })
    }

    /// The account this database belongs to.
    #[must_use]
    pub fn account_id(&self) -> i32 {
        self.account_id
    }

    /// Highest object id with a slot in the file (its refcount may be 0).
    pub fn last_object_id(&mut self) -> StoreResult<i64> {
        let len = self.file.metadata()?.len();
        if len <= HEADER_LEN + ENTRY_LEN {
            return Ok(0);
        }
        Ok(((len - HEADER_LEN) / ENTRY_LEN - 1) as i64)
    }

    /// Reads the entry for `object_id`; `None` when the id has no slot.
    pub fn entry(&mut self, object_id: i64) -> StoreResult<Option<RefCountEntry>> {
        if object_id < 1 {
            return Ok(None);
        }
        let offset = HEADER_LEN + object_id as u64 * ENTRY_LEN;
        let len = self.file.metadata()?.len();
        if offset + ENTRY_LEN > len {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut bytes = [0u8; ENTRY_LEN as usize];
        self.file.read_exact(&mut bytes)?;
        Ok(Some(RefCountEntry::from_bytes(&bytes)))
    }

    /// Writes the entry for `object_id`, growing the file (zero-filled
    /// slots) as needed.
    pub fn set_entry(&mut self, object_id: i64, entry: &RefCountEntry) -> StoreResult<()> {
        self.check_writable()?;
        if object_id < 1 {
            return Err(StoreError::CorruptRefCountDb(format!(
                "object id {object_id} out of range"
            )));
        }
        let offset = HEADER_LEN + object_id as u64 * ENTRY_LEN;
        let len = self.file.metadata()?.len();
        if offset > len {
            self.file.set_len(offset)?;
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&entry.to_bytes())?;
        Ok(())
    }

    /// Adds a reference to `object_id`, creating the entry if it is new,
    /// and returns the new count.
    pub fn add_reference(&mut self, object_id: i64) -> StoreResult<u32> {
        let mut entry = self.entry(object_id)?.unwrap_or_default();
        entry.refcount += 1;
        self.set_entry(object_id, &entry)?;
        Ok(entry.refcount)
    }

    /// Removes a reference from `object_id` and returns the new count.
    /// The entry must exist with a positive count; underflow means the
    /// database no longer matches the directories.
    pub fn remove_reference(&mut self, object_id: i64) -> StoreResult<u32> {
        let mut entry = self
            .entry(object_id)?
            .filter(|e| e.refcount > 0)
            .ok_or_else(|| {
                StoreError::CorruptRefCountDb(format!(
                    "refcount underflow on object {object_id:#x}"
                ))
            })?;
        entry.refcount -= 1;
        self.set_entry(object_id, &entry)?;
        Ok(entry.refcount)
    }

    /// Audit: compares refcounts for every id in either database and
    /// returns the number of mismatches, logging each one.
    pub fn report_changes_to(&mut self, other: &mut Self) -> StoreResult<usize> {
        let last = self.last_object_id()?.max(other.last_object_id()?);
        let mut mismatches = 0;
        for object_id in 1..=last {
            let ours = self.entry(object_id)?.unwrap_or_default().refcount;
            let theirs = other.entry(object_id)?.unwrap_or_default().refcount;
            if ours != theirs {
                error!(
                    object_id,
                    expected = ours,
                    found = theirs,
                    "refcount mismatch"
                );
                mismatches += 1;
            }
        }
        Ok(mismatches)
    }

    /// Commits a temporary database, atomically replacing the permanent
    /// file.
    pub fn commit(mut self) -> StoreResult<()> {
        if self.kind != Kind::Temporary {
            return Err(StoreError::CorruptRefCountDb(
                "cannot commit a permanent refcount database".into(),
            ));
        }
        self.disposed = true;
        self.file.sync_all()?;
        let final_path = self
            .path
            .to_string_lossy()
            .strip_suffix(TEMPORARY_SUFFIX)
            .map(PathBuf::from)
            .ok_or_else(|| StoreError::CorruptRefCountDb("bad temporary path".into()))?;
        std::fs::rename(&self.path, final_path)?;
        Ok(())
    }

    /// Discards a temporary database, deleting the staging file.
    pub fn discard(mut self) -> StoreResult<()> {
        if self.kind != Kind::Temporary {
            return Err(StoreError::CorruptRefCountDb(
                "cannot discard a permanent refcount database".into(),
            ));
        }
        self.disposed = true;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    fn check_writable(&self) -> StoreResult<()> {
        match self.kind {
            Kind::Permanent { read_only: true } => Err(StoreError::ReadOnly),
            _ => Ok(()),
        }
    }
}

impl Drop for RefCountDatabase {
    fn drop(&mut self) {
        if self.kind == Kind::Temporary && !self.disposed {
            error!(
                path = %self.path.display(),
                "temporary refcount database dropped without commit or discard"
            );
            debug_assert!(
                std::thread::panicking(),
                "temporary refcount database must be committed or discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_permanent(dir: &Path, account_id: i32) -> RefCountDatabase {
        RefCountDatabase::create_temporary(dir, account_id)
            .unwrap()
            .commit()
            .unwrap();
        RefCountDatabase::open_permanent(dir, account_id, false).unwrap()
    }

    #[test]
    fn add_then_remove_restores_the_entry_byte_equal() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = new_permanent(dir.path(), 0x42);

        db.set_entry(
            3,
            &RefCountEntry {
                flags: 1,
                refcount: 1,
                size_in_blocks: 9,
                depends_newer: 0,
                depends_older: 2,
            },
        )
        .unwrap();
        let before = db.entry(3).unwrap().unwrap();

        assert_eq!(db.add_reference(3).unwrap(), 2);
        assert_eq!(db.remove_reference(3).unwrap(), 1);
        assert_eq!(db.entry(3).unwrap().unwrap(), before);
    }

    #[test]
    fn new_ids_get_created_by_add_reference() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = new_permanent(dir.path(), 0x42);
        assert_eq!(db.add_reference(7).unwrap(), 1);
        assert_eq!(db.last_object_id().unwrap(), 7);
        // Intervening slots exist but are empty.
        assert_eq!(db.entry(5).unwrap().unwrap().refcount, 0);
    }

    #[test]
    fn underflow_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = new_permanent(dir.path(), 0x42);
        assert!(matches!(
            db.remove_reference(9),
            Err(StoreError::CorruptRefCountDb(_))
        ));
    }

    #[test]
    fn read_only_open_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut db = new_permanent(dir.path(), 0x42);
            db.add_reference(1).unwrap();
        }
        let mut db = RefCountDatabase::open_permanent(dir.path(), 0x42, true).unwrap();
        assert_eq!(db.entry(1).unwrap().unwrap().refcount, 1);
        assert!(matches!(db.add_reference(1), Err(StoreError::ReadOnly)));
    }

    #[test]
    fn wrong_account_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        {
            new_permanent(dir.path(), 0x42);
        }
        assert!(matches!(
            RefCountDatabase::open_permanent(dir.path(), 0x43, false),
            Err(StoreError::CorruptRefCountDb(_))
        ));
    }

    #[test]
    fn discard_leaves_the_permanent_database_untouched() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut db = new_permanent(dir.path(), 0x42);
            db.add_reference(1).unwrap();
        }
        let temp = RefCountDatabase::create_temporary(dir.path(), 0x42).unwrap();
        temp.discard().unwrap();

        let mut db = RefCountDatabase::open_permanent(dir.path(), 0x42, true).unwrap();
        assert_eq!(db.entry(1).unwrap().unwrap().refcount, 1);
    }

    #[test]
    fn report_changes_counts_mismatches_both_ways() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut a = new_permanent(dir_a.path(), 0x42);
        let mut b = new_permanent(dir_b.path(), 0x42);

        a.add_reference(1).unwrap();
        a.add_reference(2).unwrap();
        b.add_reference(1).unwrap();
        b.add_reference(3).unwrap();

        // id 2 only in a, id 3 only in b -> two mismatches.
        assert_eq!(a.report_changes_to(&mut b).unwrap(), 2);
    }

    #[test]
    fn commit_replaces_the_permanent_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut db = new_permanent(dir.path(), 0x42);
            db.add_reference(1).unwrap();
            db.add_reference(1).unwrap();
        }
        let mut rebuild = RefCountDatabase::create_temporary(dir.path(), 0x42).unwrap();
        rebuild.add_reference(1).unwrap();
        rebuild.commit().unwrap();

        let mut db = RefCountDatabase::open_permanent(dir.path(), 0x42, true).unwrap();
        assert_eq!(db.entry(1).unwrap().unwrap().refcount, 1);
        assert!(!RefCountDatabase::path_for(dir.path())
            .with_extension("rdb.X")
            .exists());
    }
}
