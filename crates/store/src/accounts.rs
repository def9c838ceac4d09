//! The account database: the flat persisted set of account descriptors.
//!
//! Small (tens to thousands of records), wholly read at startup, and
//! written with the same staging-plus-rename discipline the RAID layer
//! uses, so a crashed writer never leaves a half-written table.
//!
//! One text line per account: `id_hex:disc_set:root_path`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{StoreError, StoreResult};

/// Staging suffix for atomic rewrites.
const STAGING_SUFFIX: &str = ".X";

/// One account descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountRecord {
    /// 32-bit account id.
    pub id: i32,
    /// Which disc set holds the account's store.
    pub disc_set: u32,
    /// Store root path, relative to the disc set's directories.
    pub root_path: String,
}

impl AccountRecord {
    /// The conventional root path for a new account.
    #[must_use]
    pub fn default_root(id: i32) -> String {
        format!("backup/{:08x}", id as u32)
    }
}

/// The in-memory account table plus the file it persists to.
#[derive(Debug)]
pub struct AccountDatabase {
    path: PathBuf,
    records: Vec<AccountRecord>,
}

impl AccountDatabase {
    /// Loads the database; a missing file is an empty table (first run).
    pub fn load(path: &Path) -> StoreResult<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        for (line_number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            records.push(parse_line(line).ok_or_else(|| {
                StoreError::CorruptAccountDb(format!(
                    "bad record on line {}: {line:?}",
                    line_number + 1
                ))
            })?);
        }
        Ok(Self {
            path: path.to_owned(),
            records,
        })
    }

    /// Finds an account by id.
    #[must_use]
    pub fn lookup(&self, id: i32) -> Option<&AccountRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// All accounts, in file order.
    #[must_use]
    pub fn enumerate(&self) -> &[AccountRecord] {
        &self.records
    }

    /// Adds an account and persists the table.
    pub fn insert(&mut self, record: AccountRecord) -> StoreResult<()> {
        if self.lookup(record.id).is_some() {
            return Err(StoreError::CorruptAccountDb(format!(
                "account {:#010x} already exists",
                record.id
            )));
        }
        self.records.push(record);
        self.save()
    }

    /// Removes an account and persists the table.
    pub fn remove(&mut self, id: i32) -> StoreResult<()> {
        let before = self.records.len();
        self.records.retain(|r| r.id != id);
        if self.records.len() == before {
            return Err(StoreError::AccountDoesNotExist(id));
        }
        self.save()
    }

    /// Rewrites the file through a staging rename.
    pub fn save(&self) -> StoreResult<()> {
        let mut text = String::new();
        for record in &self.records {
            text.push_str(&format!(
                "{:08x}:{}:{}\n",
                record.id as u32, record.disc_set, record.root_path
            ));
        }
        let staging = PathBuf::from(format!("{}{STAGING_SUFFIX}", self.path.display()));
        if let Some(parent) = staging.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&staging, text)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<AccountRecord> {
    let mut parts = line.splitn(3, ':');
    let id = u32::from_str_radix(parts.next()?, 16).ok()? as i32;
    let disc_set = parts.next()?.parse().ok()?;
    let root_path = parts.next()?.to_owned();
    if root_path.is_empty() {
        return None;
    }
    Some(AccountRecord {
        id,
        disc_set,
        root_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("accounts.txt")
    }

    #[test]
    fn missing_file_is_an_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let db = AccountDatabase::load(&db_path(&dir)).unwrap();
        assert!(db.enumerate().is_empty());
    }

    #[test]
    fn insert_lookup_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_path(&dir);
        let mut db = AccountDatabase::load(&path).unwrap();
        db.insert(AccountRecord {
            id: 0x0123_4567,
            disc_set: 0,
            root_path: AccountRecord::default_root(0x0123_4567),
        })
        .unwrap();

        // A fresh load sees the persisted record.
        let reloaded = AccountDatabase::load(&path).unwrap();
        let record = reloaded.lookup(0x0123_4567).unwrap();
        assert_eq!(record.root_path, "backup/01234567");

        let mut db = reloaded;
        db.remove(0x0123_4567).unwrap();
        assert!(db.lookup(0x0123_4567).is_none());
        assert!(matches!(
            db.remove(0x0123_4567),
            Err(StoreError::AccountDoesNotExist(_))
        ));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = AccountDatabase::load(&db_path(&dir)).unwrap();
        let record = AccountRecord {
            id: 7,
            disc_set: 0,
            root_path: "backup/7".into(),
        };
        db.insert(record.clone()).unwrap();
        assert!(db.insert(record).is_err());
    }

    #[test]
    fn negative_ids_survive_the_hex_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_path(&dir);
        let mut db = AccountDatabase::load(&path).unwrap();
        let id = 0x8000_0001u32 as i32;
        db.insert(AccountRecord {
            id,
            disc_set: 1,
            root_path: AccountRecord::default_root(id),
        })
        .unwrap();
        let reloaded = AccountDatabase::load(&path).unwrap();
        assert!(reloaded.lookup(id).is_some());
    }

    #[test]
    fn malformed_lines_are_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_path(&dir);
        fs::write(&path, "zz-not-hex:0:root\n").unwrap();
        assert!(matches!(
            AccountDatabase::load(&path),
            Err(StoreError::CorruptAccountDb(_))
        ));
    }

    #[test]
    fn comments_and_blanks_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = db_path(&dir);
        fs::write(&path, "# accounts\n\n00000007:0:backup/7\n").unwrap();
        let db = AccountDatabase::load(&path).unwrap();
        assert_eq!(db.enumerate().len(), 1);
    }
}
