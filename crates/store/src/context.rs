//! The per-session store engine.
//!
//! A [`StoreContext`] binds one session to one account: it owns the write
//! lock, the info blob, the refcount database and a bounded directory
//! cache, and performs every store mutation together with its accounting.
//! One context is used by exactly one thread; cross-session exclusion is
//! the advisory lock on `write.lock`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::PathBuf;

use fs2::FileExt;
use tracing::{debug, info, warn};

use filecodec::AccountKeys;
use raidfile::{
    AllocationMode, DiscSet, RaidController, RaidFileRead, RaidFileWrite,
};

use crate::accounts::AccountDatabase;
use crate::directory::{entry_flags, Directory, DirectoryEntry};
use crate::error::{StoreError, StoreResult};
use crate::filename::StoreFilename;
use crate::info::StoreInfo;
use crate::refcount::{RefCountDatabase, RefCountEntry};
use crate::ROOT_DIRECTORY_ID;

/// Name of the per-account write lock file.
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// Name of the per-account secret under the account directory.
pub const ACCOUNT_SECRET_NAME: &str = "info/secret";

/// How many delayed saves may pass before the info blob hits the disc.
const STORE_INFO_SAVE_DELAY: u32 = 32;

/// Bound on the directory cache, by directory count.
const DIRECTORY_CACHE_LIMIT: usize = 64;

/// Channel to the out-of-band housekeeping process.
pub trait Housekeeping {
    /// Queues a message; never blocks the session.
    fn send_message(&mut self, message: &[u8]);
}

/// Test hook replacing command dispatch, transparent on the wire.
pub trait CommandHook {
    /// Returns `Some(reply)` to short-circuit the command.
    fn start_command(&mut self, command: &protocol::Command) -> Option<protocol::Reply>;
}

struct DirectoryCache {
    map: HashMap<i64, Directory>,
    order: Vec<i64>,
}

impl DirectoryCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn get(&self, object_id: i64) -> Option<&Directory> {
        self.map.get(&object_id)
    }

    fn put(&mut self, directory: Directory) {
        let object_id = directory.object_id();
        if self.map.insert(object_id, directory).is_none() {
            self.order.push(object_id);
            if self.order.len() > DIRECTORY_CACHE_LIMIT {
                let evicted = self.order.remove(0);
                self.map.remove(&evicted);
            }
        }
    }

    fn invalidate(&mut self, object_id: i64) {
        if self.map.remove(&object_id).is_some() {
            self.order.retain(|id| *id != object_id);
        }
    }
}

/// Per-session state machine over one account's store.
pub struct StoreContext {
    account_id: i32,
    disc_set: DiscSet,
    account_root: String,
    account_dir: PathBuf,
    read_only: bool,
    _write_lock: Option<File>,
    info: StoreInfo,
    save_info_delay: u32,
    refcount: RefCountDatabase,
    cache: DirectoryCache,
    keys: Option<AccountKeys>,
    housekeeping: Option<Box<dyn Housekeeping>>,
    command_hook: Option<Box<dyn CommandHook>>,
}

impl StoreContext {
    /// Opens a session context for `account_id`. Read-write opens take the
    /// account write lock; contention is [`StoreError::AlreadyLocked`].
    pub fn open(
        controller: &RaidController,
        accounts: &AccountDatabase,
        account_id: i32,
        read_only: bool,
    ) -> StoreResult<Self> {
        let record = accounts
            .lookup(account_id)
            .ok_or(StoreError::AccountDoesNotExist(account_id))?;
        let disc_set = controller.disc_set(record.disc_set)?.clone();
        let account_dir = disc_set.dirs()[0].join(&record.root_path);

        let write_lock = if read_only {
            None
        } else {
            Some(Self::acquire_write_lock(&account_dir)?)
        };

        let info = StoreInfo::load(&disc_set, &record.root_path, account_id)?;
        if !info.is_enabled {
            return Err(StoreError::LoginFailed(account_id));
        }
        let refcount = RefCountDatabase::open_permanent(&account_dir, account_id, read_only)?;

        let keys = Self::load_keys(&account_dir);
        Ok(Self {
            account_id,
            disc_set,
            account_root: record.root_path.clone(),
            account_dir,
            read_only,
            _write_lock: write_lock,
            info,
            save_info_delay: STORE_INFO_SAVE_DELAY,
            refcount,
            cache: DirectoryCache::new(),
            keys,
            housekeeping: None,
            command_hook: None,
        })
    }

    fn acquire_write_lock(account_dir: &std::path::Path) -> StoreResult<File> {
        std::fs::create_dir_all(account_dir)?;
        let lock = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(account_dir.join(WRITE_LOCK_NAME))?;
        lock.try_lock_exclusive()
            .map_err(|_| StoreError::AlreadyLocked)?;
        Ok(lock)
    }

    fn load_keys(account_dir: &std::path::Path) -> Option<AccountKeys> {
        let path = account_dir.join(ACCOUNT_SECRET_NAME);
        match std::fs::read(&path) {
            Ok(secret) if !secret.is_empty() => Some(AccountKeys::derive(&secret)),
            _ => None,
        }
    }

    /// Attaches the housekeeping channel.
    pub fn set_housekeeping(&mut self, housekeeping: Box<dyn Housekeeping>) {
        self.housekeeping = Some(housekeeping);
    }

    /// Installs the test command hook.
    pub fn set_command_hook(&mut self, hook: Box<dyn CommandHook>) {
        self.command_hook = Some(hook);
    }

    /// Consults the test hook for `command`.
    pub fn start_command_hook(
        &mut self,
        command: &protocol::Command,
    ) -> Option<protocol::Reply> {
        self.command_hook
            .as_mut()
            .and_then(|hook| hook.start_command(command))
    }

    /// Queues a message for the housekeeping process.
    pub fn send_message_to_housekeeping(&mut self, message: &[u8]) {
        if let Some(housekeeping) = self.housekeeping.as_mut() {
            housekeeping.send_message(message);
        }
    }

    /// The bound account.
    #[must_use]
    pub fn account_id(&self) -> i32 {
        self.account_id
    }

    /// Whether the session may mutate the store.
    #[must_use]
    pub fn session_is_read_only(&self) -> bool {
        self.read_only
    }

    /// The account's RAID block size (the quota unit).
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.disc_set.block_size()
    }

    /// The account's disc set.
    #[must_use]
    pub fn disc_set(&self) -> &DiscSet {
        &self.disc_set
    }

    /// The account's plain-file directory (lock, refcount db, secret).
    #[must_use]
    pub fn account_dir(&self) -> &std::path::Path {
        &self.account_dir
    }

    pub(crate) fn refcount_mut(&mut self) -> &mut RefCountDatabase {
        &mut self.refcount
    }

    pub(crate) fn info_mut(&mut self) -> &mut StoreInfo {
        &mut self.info
    }

    pub(crate) fn keys(&self) -> Option<&AccountKeys> {
        self.keys.as_ref()
    }

    pub(crate) fn invalidate_cached_directory(&mut self, object_id: i64) {
        self.cache.invalidate(object_id);
    }

    pub(crate) fn save_directory_object(&mut self, directory: &Directory) -> StoreResult<()> {
        self.save_directory(directory)
    }

    pub(crate) fn write_object_raw(&mut self, object_id: i64, bytes: &[u8]) -> StoreResult<()> {
        let name = self.object_raid_name(object_id);
        let mut writer = RaidFileWrite::create(&self.disc_set, &name, AllocationMode::Sparse)?;
        std::io::Write::write_all(&mut writer, bytes)?;
        writer.commit()?;
        Ok(())
    }

    pub(crate) fn delete_object_raw(&mut self, object_id: i64) -> StoreResult<()> {
        let name = self.object_raid_name(object_id);
        RaidFileWrite::delete(&self.disc_set, &name)?;
        Ok(())
    }

    /// Read access to the info blob.
    #[must_use]
    pub fn store_info(&self) -> &StoreInfo {
        &self.info
    }

    /// The client's opaque marker.
    #[must_use]
    pub fn client_store_marker(&self) -> i64 {
        self.info.client_store_marker
    }

    /// Sets the client's opaque marker. Persisted immediately; the marker
    /// exists for the client's crash recovery.
    pub fn set_client_store_marker(&mut self, marker: i64) -> StoreResult<()> {
        self.check_writable()?;
        self.info.client_store_marker = marker;
        self.save_store_info(false)
    }

    /// Sets the account's block limits. Persisted immediately.
    pub fn set_limits(&mut self, soft_limit: i64, hard_limit: i64) -> StoreResult<()> {
        self.check_writable()?;
        self.info.blocks_soft_limit = soft_limit;
        self.info.blocks_hard_limit = hard_limit;
        self.save_store_info(false)
    }

    /// Writes the info blob, or defers it when `allow_delay` and the
    /// batching counter has not run out.
    pub fn save_store_info(&mut self, allow_delay: bool) -> StoreResult<()> {
        if self.read_only {
            return Ok(());
        }
        if allow_delay {
            self.save_info_delay = self.save_info_delay.saturating_sub(1);
            if self.save_info_delay > 0 {
                return Ok(());
            }
        }
        self.info.save(&self.disc_set, &self.account_root)?;
        self.save_info_delay = STORE_INFO_SAVE_DELAY;
        Ok(())
    }

    /// Flushes deferred state at session end.
    pub fn finish(&mut self) -> StoreResult<()> {
        self.save_store_info(false)
    }

    /// The RAID name of an object, sharded by the id's high digits.
    #[must_use]
    pub fn object_raid_name(&self, object_id: i64) -> String {
        let hex = format!("{object_id:x}");
        let padded = if hex.len() % 2 == 1 {
            format!("0{hex}")
        } else {
            hex
        };
        let mut name = self.account_root.clone();
        let pairs: Vec<&str> = padded
            .as_bytes()
            .chunks(2)
            .map(|pair| std::str::from_utf8(pair).expect("hex digits"))
            .collect();
        for pair in &pairs[..pairs.len() - 1] {
            name.push_str(&format!("/o{pair}"));
        }
        name.push_str(&format!("/o{}.obj", pairs[pairs.len() - 1]));
        name
    }

    /// Returns a directory by id. The reference lives in the cache and
    /// dies at the next mutating call.
    pub fn get_directory(&mut self, object_id: i64) -> StoreResult<&Directory> {
        if self.cache.get(object_id).is_none() {
            let directory = self.load_directory(object_id)?;
            self.cache.put(directory);
        }
        Ok(self.cache.get(object_id).expect("just inserted"))
    }

    fn load_directory(&self, object_id: i64) -> StoreResult<Directory> {
        let name = self.object_raid_name(object_id);
        let reader = RaidFileRead::open(&self.disc_set, &name).map_err(|err| match err {
            raidfile::RaidError::DoesNotExist(_) => StoreError::ObjectDoesNotExist(object_id),
            other => StoreError::Raid(other),
        })?;
        let bytes = reader.read_all()?;
        match Directory::from_bytes(&bytes) {
            Ok(directory) if directory.object_id() == object_id => Ok(directory),
            Ok(_) => Err(StoreError::CorruptInfo(format!(
                "directory {object_id:#x} claims another id"
            ))),
            Err(_) => Err(StoreError::NotADirectory(object_id)),
        }
    }

    /// Persists a directory and keeps the accounting for its own size.
    fn save_directory(&mut self, directory: &Directory) -> StoreResult<()> {
        let object_id = directory.object_id();
        let bytes = directory.to_bytes();
        let new_blocks = filecodec::size_in_blocks(bytes.len() as u64, self.block_size()) as i64;

        let name = self.object_raid_name(object_id);
        let mut writer =
            RaidFileWrite::create(&self.disc_set, &name, AllocationMode::Sparse)?;
        std::io::Write::write_all(&mut writer, &bytes)?;
        writer.commit()?;

        let mut entry = self.refcount.entry(object_id)?.unwrap_or_default();
        let old_blocks = entry.size_in_blocks;
        if entry.refcount == 0 {
            entry.refcount = 1;
        }
        entry.flags |= entry_flags::DIR;
        entry.size_in_blocks = new_blocks;
        self.refcount.set_entry(object_id, &entry)?;

        self.info.blocks_used += new_blocks - old_blocks;
        self.info.blocks_in_directories += new_blocks - old_blocks;
        self.cache.put(directory.clone());
        Ok(())
    }

    /// Allocates the next object id. The info blob is persisted before the
    /// id can become externally visible.
    fn allocate_object_id(&mut self) -> StoreResult<i64> {
        self.info.last_object_id_used += 1;
        let id = self.info.last_object_id_used;
        self.save_store_info(false)?;
        Ok(id)
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.read_only {
            Err(StoreError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Creates the on-disc structure of a brand-new account: root
    /// directory, info blob, refcount database, secret. Used by the admin
    /// tooling, not by sessions.
    pub fn create_account_store(
        controller: &RaidController,
        record: &crate::accounts::AccountRecord,
        soft_limit: i64,
        hard_limit: i64,
        secret: &[u8],
    ) -> StoreResult<()> {
        let disc_set = controller.disc_set(record.disc_set)?;
        let account_dir = disc_set.dirs()[0].join(&record.root_path);
        std::fs::create_dir_all(account_dir.join("info"))?;
        std::fs::write(account_dir.join(ACCOUNT_SECRET_NAME), secret)?;

        // Root directory object.
        let root = Directory::new(ROOT_DIRECTORY_ID, 0);
        let root_bytes = root.to_bytes();
        let root_name = format!(
            "{}/o{ROOT_DIRECTORY_ID:02x}.obj",
            record.root_path
        );
        let mut writer = RaidFileWrite::create(disc_set, &root_name, AllocationMode::Sparse)?;
        std::io::Write::write_all(&mut writer, &root_bytes)?;
        writer.commit()?;
        let root_blocks =
            filecodec::size_in_blocks(root_bytes.len() as u64, disc_set.block_size()) as i64;

        // Refcount database with the root's single reference.
        let mut refcount = RefCountDatabase::create_temporary(&account_dir, record.id)?;
        refcount.set_entry(
            ROOT_DIRECTORY_ID,
            &RefCountEntry {
                flags: entry_flags::DIR,
                refcount: 1,
                size_in_blocks: root_blocks,
                depends_newer: 0,
                depends_older: 0,
            },
        )?;
        refcount.commit()?;

        // Info blob.
        let mut info = StoreInfo::new(record.id, soft_limit, hard_limit);
        info.blocks_used = root_blocks;
        info.blocks_in_directories = root_blocks;
        info.save(disc_set, &record.root_path)?;

        info!(account = format!("{:#010x}", record.id), "account store created");
        Ok(())
    }

    // ----- file and directory operations -------------------------------

    /// Stores an uploaded file object, streaming it to disc, and returns
    /// the new object id.
    ///
    /// `diff_from_file_id` non-zero marks the upload as a delta against an
    /// existing version in the same directory; the dependency links in the
    /// refcount database are maintained here.
    #[allow(clippy::too_many_arguments)]
    pub fn add_file<R: Read>(
        &mut self,
        dir_id: i64,
        modification_time: i64,
        attributes_hash: i64,
        diff_from_file_id: i64,
        filename: &StoreFilename,
        mark_same_name_as_old: bool,
        upload: &mut R,
    ) -> StoreResult<i64> {
        self.check_writable()?;
        if filename.is_empty() {
            return Err(StoreError::NameAlreadyExists(dir_id));
        }

        let directory = self.get_directory(dir_id)?.clone();
        if diff_from_file_id != 0 {
            let base = directory
                .find_by_id(diff_from_file_id)
                .ok_or(StoreError::ObjectDoesNotExist(diff_from_file_id))?;
            if base.flags & entry_flags::FILE == 0 {
                return Err(StoreError::NotAFile(diff_from_file_id));
            }
            let base_meta = self
                .refcount
                .entry(diff_from_file_id)?
                .filter(|e| e.refcount > 0)
                .ok_or(StoreError::ObjectDoesNotExist(diff_from_file_id))?;
            // Delta chains stay one level deep per base: a version that
            // already has a dependent must be reversed by housekeeping
            // before it can base another delta.
            if base_meta.depends_newer != 0 {
                return Err(StoreError::DependencyBroken(diff_from_file_id));
            }
        }
        if !mark_same_name_as_old && directory.find_current_by_name(filename).is_some() {
            return Err(StoreError::NameAlreadyExists(dir_id));
        }

        // Allocate and stream to staging. A failed upload burns the id;
        // ids are monotonic, not dense.
        let object_id = self.allocate_object_id()?;
        let name = self.object_raid_name(object_id);
        let mut writer = RaidFileWrite::create(&self.disc_set, &name, AllocationMode::Sparse)?;
        let copied = match std::io::copy(upload, &mut writer) {
            Ok(copied) => copied,
            Err(err) => {
                let _ = writer.discard();
                return Err(err.into());
            }
        };

        let new_blocks = filecodec::size_in_blocks(copied, self.block_size()) as i64;
        if self.info.would_exceed_hard_limit(new_blocks) {
            writer.discard()?;
            return Err(StoreError::HardLimitExceeded);
        }
        writer.commit()?;

        // Directory update.
        let mut directory = directory;
        let mut to_old_blocks = 0i64;
        let mut moved_to_old = 0i64;
        if mark_same_name_as_old {
            for entry in directory.entries_with_name_mut(filename) {
                if entry.is_current() {
                    entry.flags |= entry_flags::OLD_VERSION;
                    to_old_blocks += entry.size_in_blocks;
                    moved_to_old += 1;
                }
            }
        }
        directory.add_entry(DirectoryEntry {
            object_id,
            size_in_blocks: new_blocks,
            modification_time,
            attributes_hash,
            flags: entry_flags::FILE,
            name: filename.clone(),
            attributes: Vec::new(),
        });
        self.save_directory(&directory)?;

        // Meta-base and accounting.
        self.refcount.add_reference(object_id)?;
        let mut meta = self
            .refcount
            .entry(object_id)?
            .ok_or(StoreError::ObjectDoesNotExist(object_id))?;
        meta.flags |= entry_flags::FILE;
        meta.size_in_blocks = new_blocks;
        if diff_from_file_id != 0 {
            meta.depends_older = diff_from_file_id;
        }
        self.refcount.set_entry(object_id, &meta)?;
        if diff_from_file_id != 0 {
            let mut base_meta = self
                .refcount
                .entry(diff_from_file_id)?
                .ok_or(StoreError::ObjectDoesNotExist(diff_from_file_id))?;
            base_meta.depends_newer = object_id;
            self.refcount.set_entry(diff_from_file_id, &base_meta)?;
        }

        self.info.blocks_used += new_blocks;
        self.info.num_current_files += 1;
        self.info.blocks_in_old_files += to_old_blocks;
        self.info.num_old_files += moved_to_old;
        self.info.num_current_files -= moved_to_old;
        self.save_store_info(true)?;

        if self.info.soft_limit_exceeded() {
            warn!(
                account = format!("{:#010x}", self.account_id),
                "soft storage limit exceeded"
            );
        }
        debug!(account = self.account_id, object_id, op = "add_file", "stored");
        Ok(object_id)
    }

    /// Creates a sub-directory, returning `(already_existed, object_id)`.
    pub fn add_directory(
        &mut self,
        parent_id: i64,
        dirname: &StoreFilename,
        attributes: &[u8],
        attributes_mod_time: i64,
    ) -> StoreResult<(bool, i64)> {
        self.check_writable()?;
        let parent = self.get_directory(parent_id)?.clone();
        if let Some(existing) = parent.find_current_by_name(dirname) {
            if existing.flags & entry_flags::DIR != 0 {
                return Ok((true, existing.object_id));
            }
            return Err(StoreError::NameAlreadyExists(parent_id));
        }
        if self.info.would_exceed_hard_limit(1) {
            return Err(StoreError::HardLimitExceeded);
        }

        let object_id = self.allocate_object_id()?;
        let mut child = Directory::new(object_id, parent_id);
        child.set_attributes(attributes.to_vec(), attributes_mod_time);
        self.save_directory(&child)?;

        let child_blocks = self
            .refcount
            .entry(object_id)?
            .map(|e| e.size_in_blocks)
            .unwrap_or(1);
        let mut parent = parent;
        parent.add_entry(DirectoryEntry {
            object_id,
            size_in_blocks: child_blocks,
            modification_time: attributes_mod_time,
            attributes_hash: attributes_mod_time,
            flags: entry_flags::DIR,
            name: dirname.clone(),
            attributes: attributes.to_vec(),
        });
        self.save_directory(&parent)?;

        self.info.num_directories += 1;
        self.save_store_info(true)?;
        debug!(account = self.account_id, object_id, op = "add_directory", "created");
        Ok((false, object_id))
    }

    /// Replaces a directory's own attribute blob.
    pub fn change_dir_attributes(
        &mut self,
        object_id: i64,
        attributes: &[u8],
        attributes_mod_time: i64,
    ) -> StoreResult<()> {
        self.check_writable()?;
        let mut directory = self.get_directory(object_id)?.clone();
        directory.set_attributes(attributes.to_vec(), attributes_mod_time);
        self.save_directory(&directory)?;
        self.save_store_info(true)
    }

    /// Replaces the attributes on the current entry of `filename`,
    /// returning the object id it landed on.
    pub fn change_file_attributes(
        &mut self,
        dir_id: i64,
        filename: &StoreFilename,
        attributes: &[u8],
        attributes_hash: i64,
    ) -> StoreResult<i64> {
        self.check_writable()?;
        let mut directory = self.get_directory(dir_id)?.clone();
        let object_id = {
            let entry = directory
                .entries_with_name_mut(filename)
                .find(|e| e.is_current())
                .ok_or(StoreError::ObjectDoesNotExist(dir_id))?;
            entry.attributes = attributes.to_vec();
            entry.attributes_hash = attributes_hash;
            entry.flags |= entry_flags::ATTRIBUTES_MODIFIED;
            entry.object_id
        };
        self.save_directory(&directory)?;
        self.save_store_info(true)?;
        Ok(object_id)
    }

    /// Marks every not-yet-deleted version of `filename` as deleted,
    /// returning the id of the newest one.
    pub fn delete_file(
        &mut self,
        dir_id: i64,
        filename: &StoreFilename,
    ) -> StoreResult<i64> {
        self.check_writable()?;
        let mut directory = self.get_directory(dir_id)?.clone();
        let mut newest: Option<i64> = None;
        let mut deleted_blocks = 0i64;
        let mut from_old_blocks = 0i64;
        let mut newly_deleted_current = 0i64;
        let mut newly_deleted_old = 0i64;
        for entry in directory.entries_with_name_mut(filename) {
            if entry.flags & entry_flags::FILE == 0 || entry.flags & entry_flags::DELETED != 0 {
                continue;
            }
            if entry.is_current() {
                newest = Some(entry.object_id);
                newly_deleted_current += 1;
            } else {
                newly_deleted_old += 1;
                from_old_blocks += entry.size_in_blocks;
            }
            entry.flags |= entry_flags::DELETED;
            deleted_blocks += entry.size_in_blocks;
        }
        let newest = newest.ok_or(StoreError::ObjectDoesNotExist(dir_id))?;
        self.save_directory(&directory)?;

        self.info.blocks_in_deleted_files += deleted_blocks;
        self.info.blocks_in_old_files -= from_old_blocks;
        self.info.num_deleted_files += newly_deleted_current + newly_deleted_old;
        self.info.num_current_files -= newly_deleted_current;
        self.info.num_old_files -= newly_deleted_old;
        self.save_store_info(true)?;

        self.send_message_to_housekeeping(format!("delete {newest:#x}").as_bytes());
        Ok(newest)
    }

    /// Clears the deleted mark on one file version.
    pub fn undelete_file(&mut self, dir_id: i64, object_id: i64) -> StoreResult<()> {
        self.check_writable()?;
        let mut directory = self.get_directory(dir_id)?.clone();
        let (was_old, size, name) = {
            let entry = directory
                .find_by_id_mut(object_id)
                .filter(|e| e.flags & entry_flags::DELETED != 0)
                .ok_or(StoreError::ObjectDoesNotExist(object_id))?;
            entry.flags &= !entry_flags::DELETED;
            (
                entry.flags & entry_flags::OLD_VERSION != 0,
                entry.size_in_blocks,
                entry.name.clone(),
            )
        };
        // Keep one current entry per name: if undeleting collides with a
        // live entry, the revived version comes back as an old one.
        let collides = directory
            .entries()
            .iter()
            .any(|e| e.object_id != object_id && e.is_current() && e.name == name);
        let became_old = if collides && !was_old {
            if let Some(entry) = directory.find_by_id_mut(object_id) {
                entry.flags |= entry_flags::OLD_VERSION;
            }
            true
        } else {
            was_old
        };
        self.save_directory(&directory)?;

        self.info.blocks_in_deleted_files -= size;
        self.info.num_deleted_files -= 1;
        if became_old {
            self.info.blocks_in_old_files += size;
            self.info.num_old_files += 1;
        } else {
            self.info.num_current_files += 1;
        }
        self.save_store_info(true)
    }

    /// Marks a directory deleted (or undeleted), recursively.
    pub fn delete_directory(&mut self, object_id: i64, undelete: bool) -> StoreResult<()> {
        self.check_writable()?;
        if object_id == ROOT_DIRECTORY_ID {
            return Err(StoreError::NotADirectory(object_id));
        }
        let directory = self.get_directory(object_id)?.clone();
        let parent_id = directory.container_id();

        let mut parent = self.get_directory(parent_id)?.clone();
        {
            let entry = parent
                .find_by_id_mut(object_id)
                .ok_or(StoreError::ObjectDoesNotExist(object_id))?;
            if undelete {
                entry.flags &= !entry_flags::DELETED;
            } else {
                entry.flags |= entry_flags::DELETED;
            }
        }
        self.save_directory(&parent)?;

        self.delete_directory_recurse(object_id, undelete)?;
        self.save_store_info(true)?;
        self.send_message_to_housekeeping(format!("delete-dir {object_id:#x}").as_bytes());
        Ok(())
    }

    fn delete_directory_recurse(&mut self, dir_id: i64, undelete: bool) -> StoreResult<()> {
        let mut directory = self.get_directory(dir_id)?.clone();
        let sub_dirs: Vec<i64> = directory
            .entries()
            .iter()
            .filter(|e| e.flags & entry_flags::DIR != 0)
            .map(|e| e.object_id)
            .collect();

        let mut changed = false;
        let mut deleted_blocks = 0i64;
        let mut old_blocks = 0i64;
        let mut count_current = 0i64;
        let mut count_old = 0i64;
        for entry in directory.entries_mut() {
            if entry.flags & entry_flags::FILE == 0 {
                continue;
            }
            let is_deleted = entry.flags & entry_flags::DELETED != 0;
            if undelete && is_deleted {
                entry.flags &= !entry_flags::DELETED;
            } else if !undelete && !is_deleted {
                entry.flags |= entry_flags::DELETED;
            } else {
                continue;
            }
            changed = true;
            let sign = if undelete { -1 } else { 1 };
            deleted_blocks += sign * entry.size_in_blocks;
            if entry.flags & entry_flags::OLD_VERSION != 0 {
                count_old += sign;
                old_blocks -= sign * entry.size_in_blocks;
            } else {
                count_current += sign;
            }
        }
        if changed {
            self.save_directory(&directory)?;
            self.info.blocks_in_deleted_files += deleted_blocks;
            self.info.blocks_in_old_files += old_blocks;
            self.info.num_deleted_files += count_current + count_old;
            self.info.num_current_files -= count_current;
            self.info.num_old_files -= count_old;
        }
        for sub_dir in sub_dirs {
            self.delete_directory_recurse(sub_dir, undelete)?;
        }
        Ok(())
    }

    /// Moves (and/or renames) an object between directories.
    pub fn move_object(
        &mut self,
        object_id: i64,
        from_dir: i64,
        to_dir: i64,
        new_name: &StoreFilename,
        move_all_with_same_name: bool,
        allow_over_deleted: bool,
    ) -> StoreResult<()> {
        self.check_writable()?;
        let mut source = self.get_directory(from_dir)?.clone();
        let moving_name = source
            .find_by_id(object_id)
            .ok_or(StoreError::ObjectDoesNotExist(object_id))?
            .name
            .clone();

        let moving_ids: Vec<i64> = if move_all_with_same_name {
            source
                .entries()
                .iter()
                .filter(|e| e.name == moving_name)
                .map(|e| e.object_id)
                .collect()
        } else {
            vec![object_id]
        };

        if from_dir == to_dir {
            for id in &moving_ids {
                if let Some(entry) = source.find_by_id_mut(*id) {
                    entry.name = new_name.clone();
                }
            }
            let collision = source
                .entries()
                .iter()
                .filter(|e| e.is_current() && e.name == *new_name)
                .count()
                > 1;
            if collision {
                return Err(StoreError::NameAlreadyExists(to_dir));
            }
            self.save_directory(&source)?;
            return self.save_store_info(true);
        }

        let mut target = self.get_directory(to_dir)?.clone();
        if let Some(existing) = target.find_current_by_name(new_name) {
            let deleted = existing.flags & entry_flags::DELETED != 0;
            if !(allow_over_deleted && deleted) {
                return Err(StoreError::NameAlreadyExists(to_dir));
            }
        }

        for id in &moving_ids {
            let mut entry = source
                .remove_entry(*id)
                .ok_or(StoreError::ObjectDoesNotExist(*id))?;
            entry.name = new_name.clone();
            // A moved directory learns its new parent.
            if entry.flags & entry_flags::DIR != 0 {
                let mut child = self.load_directory(*id)?;
                child.set_container_id(to_dir);
                self.save_directory(&child)?;
            }
            target.add_entry(entry);
        }
        self.save_directory(&source)?;
        self.save_directory(&target)?;
        self.save_store_info(true)
    }

    /// Whether `object_id` exists, optionally constrained to a kind.
    pub fn object_exists(&mut self, object_id: i64, must_be_flags: u16) -> StoreResult<bool> {
        let Some(entry) = self.refcount.entry(object_id)? else {
            return Ok(false);
        };
        if entry.refcount == 0 {
            return Ok(false);
        }
        Ok(must_be_flags == 0 || entry.flags & must_be_flags != 0)
    }

    /// Opens an object's raw encoded bytes.
    pub fn open_object(&mut self, object_id: i64) -> StoreResult<Vec<u8>> {
        let name = self.object_raid_name(object_id);
        let reader = RaidFileRead::open(&self.disc_set, &name).map_err(|err| match err {
            raidfile::RaidError::DoesNotExist(_) => StoreError::ObjectDoesNotExist(object_id),
            other => StoreError::Raid(other),
        })?;
        Ok(reader.read_all()?)
    }

    /// Opens a file version for download, re-materialising delta chains so
    /// the client always receives a self-contained object.
    pub fn open_file_combined(&mut self, dir_id: i64, object_id: i64) -> StoreResult<Vec<u8>> {
        let directory = self.get_directory(dir_id)?;
        let entry = directory
            .find_by_id(object_id)
            .ok_or(StoreError::ObjectDoesNotExist(object_id))?;
        if entry.flags & entry_flags::FILE == 0 {
            return Err(StoreError::NotAFile(object_id));
        }
        self.reconstitute_object(object_id)
    }

    fn reconstitute_object(&mut self, object_id: i64) -> StoreResult<Vec<u8>> {
        let bytes = self.open_object(object_id)?;
        let meta = self.refcount.entry(object_id)?.unwrap_or_default();
        if meta.depends_older == 0 {
            return Ok(bytes);
        }
        let keys = self
            .keys
            .clone()
            .ok_or_else(|| StoreError::CorruptInfo("account secret missing".into()))?;
        // Walk back through the dependency chain, newest to oldest.
        let base = self.reconstitute_object(meta.depends_older)?;
        Ok(filecodec::merge_delta(&keys, &base, &bytes)?)
    }

    /// The block index of a file version, as a stream for the client's
    /// delta encoder.
    pub fn get_block_index_by_id(&mut self, object_id: i64) -> StoreResult<Vec<u8>> {
        let bytes = self.open_object(object_id)?;
        let index = filecodec::extract_block_index(&bytes)?;
        Ok(index.to_stream_bytes())
    }

    /// The block index of the current version of `filename`, returning
    /// the object id alongside the stream.
    pub fn get_block_index_by_name(
        &mut self,
        dir_id: i64,
        filename: &StoreFilename,
    ) -> StoreResult<(i64, Vec<u8>)> {
        let directory = self.get_directory(dir_id)?;
        let object_id = directory
            .find_current_by_name(filename)
            .filter(|e| e.flags & entry_flags::FILE != 0)
            .map(|e| e.object_id)
            .ok_or(StoreError::ObjectDoesNotExist(dir_id))?;
        let stream = self.get_block_index_by_id(object_id)?;
        Ok((object_id, stream))
    }

    /// Serialises a directory listing filtered by flag masks, optionally
    /// stripping per-entry attribute blobs.
    pub fn list_directory(
        &mut self,
        dir_id: i64,
        flags_must_be_set: u16,
        flags_not_to_be_set: u16,
        send_attributes: bool,
    ) -> StoreResult<Vec<u8>> {
        let directory = self.get_directory(dir_id)?;
        let mut filtered = Directory::new(directory.object_id(), directory.container_id());
        filtered.set_attributes(
            directory.attributes().to_vec(),
            directory.attributes_hash(),
        );
        for entry in directory.entries_matching(flags_must_be_set, flags_not_to_be_set) {
            let mut entry = entry.clone();
            if !send_attributes {
                entry.attributes = Vec::new();
            }
            filtered.add_entry(entry);
        }
        Ok(filtered.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountRecord;
    use std::io::Cursor;
    use std::path::Path;

    pub(crate) fn test_store(
        root: &Path,
    ) -> (RaidController, AccountDatabase, AccountRecord) {
        let dirs: Vec<std::path::PathBuf> = (0..3)
            .map(|n| {
                let dir = root.join(format!("disc{n}"));
                std::fs::create_dir_all(&dir).unwrap();
                dir
            })
            .collect();
        let set = DiscSet::striped(
            0,
            1024,
            [dirs[0].clone(), dirs[1].clone(), dirs[2].clone()],
        )
        .unwrap();
        let controller = RaidController::from_sets(vec![set]);

        let record = AccountRecord {
            id: 0x0123_4567,
            disc_set: 0,
            root_path: AccountRecord::default_root(0x0123_4567),
        };
        StoreContext::create_account_store(&controller, &record, 1000, 2000, b"test-secret")
            .unwrap();

        let mut accounts = AccountDatabase::load(&root.join("accounts.txt")).unwrap();
        accounts.insert(record.clone()).unwrap();
        (controller, accounts, record)
    }

    fn encode_upload(data: &[u8]) -> Vec<u8> {
        let keys = AccountKeys::derive(b"test-secret");
        filecodec::encode(&keys, data, None).unwrap().bytes
    }

    #[test]
    fn fresh_account_has_a_root_directory_and_one_block_accounted() {
        let root = tempfile::tempdir().unwrap();
        let (controller, accounts, _) = test_store(root.path());
        let mut context =
            StoreContext::open(&controller, &accounts, 0x0123_4567, false).unwrap();
        let dir = context.get_directory(ROOT_DIRECTORY_ID).unwrap();
        assert_eq!(dir.entry_count(), 0);
        assert_eq!(context.store_info().blocks_used, 1);
        assert_eq!(context.store_info().last_object_id_used, 1);
    }

    #[test]
    fn second_writer_is_locked_out_but_reader_is_not() {
        let root = tempfile::tempdir().unwrap();
        let (controller, accounts, _) = test_store(root.path());
        let _first = StoreContext::open(&controller, &accounts, 0x0123_4567, false).unwrap();
        assert!(matches!(
            StoreContext::open(&controller, &accounts, 0x0123_4567, false),
            Err(StoreError::AlreadyLocked)
        ));
        StoreContext::open(&controller, &accounts, 0x0123_4567, true).unwrap();
    }

    #[test]
    fn add_file_lists_and_reads_back() {
        let root = tempfile::tempdir().unwrap();
        let (controller, accounts, _) = test_store(root.path());
        let mut context =
            StoreContext::open(&controller, &accounts, 0x0123_4567, false).unwrap();

        let upload = encode_upload(b"hello");
        let name = StoreFilename::from(&b"a"[..]);
        let id = context
            .add_file(ROOT_DIRECTORY_ID, 10, 0, 0, &name, true, &mut Cursor::new(&upload))
            .unwrap();
        assert_eq!(id, 2);

        let listing = context
            .list_directory(ROOT_DIRECTORY_ID, entry_flags::FILE, 0, true)
            .unwrap();
        let listing = Directory::from_bytes(&listing).unwrap();
        assert_eq!(listing.entry_count(), 1);
        let entry = &listing.entries()[0];
        assert_eq!(entry.object_id, 2);
        assert_eq!(entry.flags, entry_flags::FILE);
        assert_eq!(entry.name, name);

        let bytes = context.open_file_combined(ROOT_DIRECTORY_ID, 2).unwrap();
        let keys = AccountKeys::derive(b"test-secret");
        assert_eq!(filecodec::decode(&keys, &bytes, None).unwrap(), b"hello");
    }

    #[test]
    fn delta_upload_links_dependencies_and_marks_old() {
        let root = tempfile::tempdir().unwrap();
        let (controller, accounts, _) = test_store(root.path());
        let mut context =
            StoreContext::open(&controller, &accounts, 0x0123_4567, false).unwrap();
        let keys = AccountKeys::derive(b"test-secret");
        let name = StoreFilename::from(&b"a"[..]);

        let first = filecodec::encode(&keys, b"hello", None).unwrap();
        let id1 = context
            .add_file(ROOT_DIRECTORY_ID, 10, 0, 0, &name, true, &mut Cursor::new(&first.bytes))
            .unwrap();

        let delta = filecodec::encode(&keys, b"hello world", Some(&first.index)).unwrap();
        let id2 = context
            .add_file(
                ROOT_DIRECTORY_ID,
                20,
                0,
                id1,
                &name,
                true,
                &mut Cursor::new(&delta.bytes),
            )
            .unwrap();
        assert_eq!((id1, id2), (2, 3));

        // Directory shows the new current version and the old one.
        let listing = context
            .list_directory(ROOT_DIRECTORY_ID, entry_flags::FILE, 0, false)
            .unwrap();
        let listing = Directory::from_bytes(&listing).unwrap();
        let flags: Vec<(i64, u16)> = listing
            .entries()
            .iter()
            .map(|e| (e.object_id, e.flags))
            .collect();
        assert!(flags.contains(&(2, entry_flags::FILE | entry_flags::OLD_VERSION)));
        assert!(flags.contains(&(3, entry_flags::FILE)));

        // Meta-base carries the dependency links both ways.
        let meta2 = context.refcount.entry(2).unwrap().unwrap();
        let meta3 = context.refcount.entry(3).unwrap().unwrap();
        assert_eq!(meta2.refcount, 1);
        assert_eq!(meta3.refcount, 1);
        assert_eq!(meta2.depends_newer, 3);
        assert_eq!(meta3.depends_older, 2);

        // Download of the delta version is reconstituted server-side.
        let combined = context.open_file_combined(ROOT_DIRECTORY_ID, 3).unwrap();
        assert_eq!(
            filecodec::decode(&keys, &combined, None).unwrap(),
            b"hello world"
        );

        // A second delta against the same base is refused until reversal.
        let another = filecodec::encode(&keys, b"hello again", Some(&first.index)).unwrap();
        assert!(matches!(
            context.add_file(
                ROOT_DIRECTORY_ID,
                30,
                0,
                id1,
                &name,
                true,
                &mut Cursor::new(&another.bytes),
            ),
            Err(StoreError::DependencyBroken(_))
        ));
    }

    #[test]
    fn hard_limit_discards_the_upload() {
        let root = tempfile::tempdir().unwrap();
        let (controller, accounts, record) = test_store(root.path());
        let mut context =
            StoreContext::open(&controller, &accounts, 0x0123_4567, false).unwrap();
        context.info.blocks_hard_limit = 2;

        // Incompressible payload so the encoded object really is large.
        let mut payload = vec![0u8; 100_000];
        rand::Rng::fill(&mut rand::thread_rng(), &mut payload[..]);
        let upload = encode_upload(&payload);
        let name = StoreFilename::from(&b"big"[..]);
        assert!(matches!(
            context.add_file(ROOT_DIRECTORY_ID, 0, 0, 0, &name, true, &mut Cursor::new(&upload)),
            Err(StoreError::HardLimitExceeded)
        ));

        // Nothing published, no staging leaked.
        let set = controller.disc_set(record.disc_set).unwrap();
        assert!(raidfile::scan_staging(set).unwrap().is_empty());
        let listing = context
            .list_directory(ROOT_DIRECTORY_ID, entry_flags::FILE, 0, false)
            .unwrap();
        assert_eq!(Directory::from_bytes(&listing).unwrap().entry_count(), 0);
    }

    #[test]
    fn delete_and_undelete_round_trip_the_accounting() {
        let root = tempfile::tempdir().unwrap();
        let (controller, accounts, _) = test_store(root.path());
        let mut context =
            StoreContext::open(&controller, &accounts, 0x0123_4567, false).unwrap();
        let name = StoreFilename::from(&b"a"[..]);
        let upload = encode_upload(b"some file content");
        let id = context
            .add_file(ROOT_DIRECTORY_ID, 0, 0, 0, &name, true, &mut Cursor::new(&upload))
            .unwrap();
        let before = context.store_info().clone();

        let deleted = context.delete_file(ROOT_DIRECTORY_ID, &name).unwrap();
        assert_eq!(deleted, id);
        assert_eq!(context.store_info().num_deleted_files, 1);
        assert_eq!(context.store_info().num_current_files, 0);
        assert!(context.store_info().blocks_in_deleted_files > 0);

        context.undelete_file(ROOT_DIRECTORY_ID, id).unwrap();
        assert_eq!(context.store_info().num_deleted_files, before.num_deleted_files);
        assert_eq!(context.store_info().num_current_files, before.num_current_files);
        assert_eq!(
            context.store_info().blocks_in_deleted_files,
            before.blocks_in_deleted_files
        );
    }

    #[test]
    fn directories_nest_move_and_delete_recursively() {
        let root = tempfile::tempdir().unwrap();
        let (controller, accounts, _) = test_store(root.path());
        let mut context =
            StoreContext::open(&controller, &accounts, 0x0123_4567, false).unwrap();

        let (existed, dir_a) = context
            .add_directory(ROOT_DIRECTORY_ID, &StoreFilename::from(&b"A"[..]), &[], 1)
            .unwrap();
        assert!(!existed);
        let (existed_again, dir_a_again) = context
            .add_directory(ROOT_DIRECTORY_ID, &StoreFilename::from(&b"A"[..]), &[], 1)
            .unwrap();
        assert!(existed_again);
        assert_eq!(dir_a, dir_a_again);

        let upload = encode_upload(b"inside");
        let file_name = StoreFilename::from(&b"f"[..]);
        let file_id = context
            .add_file(dir_a, 0, 0, 0, &file_name, true, &mut Cursor::new(&upload))
            .unwrap();

        // Move the file up into the root under a new name.
        context
            .move_object(
                file_id,
                dir_a,
                ROOT_DIRECTORY_ID,
                &StoreFilename::from(&b"g"[..]),
                false,
                false,
            )
            .unwrap();
        assert!(context
            .get_directory(ROOT_DIRECTORY_ID)
            .unwrap()
            .find_current_by_name(&StoreFilename::from(&b"g"[..]))
            .is_some());

        // Delete the (now empty-of-files) directory, then undelete it.
        context.delete_directory(dir_a, false).unwrap();
        let parent = context.get_directory(ROOT_DIRECTORY_ID).unwrap();
        assert!(parent.find_by_id(dir_a).unwrap().flags & entry_flags::DELETED != 0);
        context.delete_directory(dir_a, true).unwrap();
        let parent = context.get_directory(ROOT_DIRECTORY_ID).unwrap();
        assert!(parent.find_by_id(dir_a).unwrap().flags & entry_flags::DELETED == 0);
    }

    #[test]
    fn read_only_context_rejects_mutation() {
        let root = tempfile::tempdir().unwrap();
        let (controller, accounts, _) = test_store(root.path());
        let mut context =
            StoreContext::open(&controller, &accounts, 0x0123_4567, true).unwrap();
        let upload = encode_upload(b"x");
        assert!(matches!(
            context.add_file(
                ROOT_DIRECTORY_ID,
                0,
                0,
                0,
                &StoreFilename::from(&b"a"[..]),
                true,
                &mut Cursor::new(&upload),
            ),
            Err(StoreError::ReadOnly)
        ));
    }

    #[test]
    fn object_ids_allocate_monotonically_across_sessions() {
        let root = tempfile::tempdir().unwrap();
        let (controller, accounts, _) = test_store(root.path());
        let first_id = {
            let mut context =
                StoreContext::open(&controller, &accounts, 0x0123_4567, false).unwrap();
            let upload = encode_upload(b"one");
            let id = context
                .add_file(
                    ROOT_DIRECTORY_ID,
                    0,
                    0,
                    0,
                    &StoreFilename::from(&b"a"[..]),
                    true,
                    &mut Cursor::new(&upload),
                )
                .unwrap();
            context.finish().unwrap();
            id
        };
        let mut context =
            StoreContext::open(&controller, &accounts, 0x0123_4567, false).unwrap();
        let upload = encode_upload(b"two");
        let second_id = context
            .add_file(
                ROOT_DIRECTORY_ID,
                0,
                0,
                0,
                &StoreFilename::from(&b"b"[..]),
                true,
                &mut Cursor::new(&upload),
            )
            .unwrap();
        assert!(second_id > first_id);
    }

    #[test]
    fn object_names_shard_by_high_digits() {
        let root = tempfile::tempdir().unwrap();
        let (controller, accounts, _) = test_store(root.path());
        let context = StoreContext::open(&controller, &accounts, 0x0123_4567, true).unwrap();
        assert!(context.object_raid_name(2).ends_with("/o02.obj"));
        let long = context.object_raid_name(0x1234_5678);
        assert!(long.ends_with("/o12/o34/o56/o78.obj"), "{long}");
    }
}
