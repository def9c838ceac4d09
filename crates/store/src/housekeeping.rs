//! Out-of-band account maintenance.
//!
//! Sessions queue work for housekeeping instead of blocking on it:
//! staging garbage collection, refcount rebuild and audit, usage
//! recomputation, and the physical removal of deleted objects (with delta
//! dependency reversal where needed). All of it runs under the same
//! per-account write lock as a mutating session, so an account is never
//! touched by two writers at once.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use raidfile::RaidController;

use crate::accounts::AccountDatabase;
use crate::context::{Housekeeping, StoreContext};
use crate::directory::entry_flags;
use crate::error::{StoreError, StoreResult};
use crate::refcount::{RefCountDatabase, RefCountEntry};
use crate::ROOT_DIRECTORY_ID;

/// Result of a consistency check run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Stale staging files found (and removed when fixing).
    pub stale_staging: usize,
    /// Refcount entries that did not match the directory walk.
    pub refcount_mismatches: usize,
    /// Info-blob usage figures that did not match the walk.
    pub usage_mismatches: usize,
    /// Whether corrections were written back.
    pub fixed: bool,
}

/// Result of a housekeeping run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HousekeepingSummary {
    /// Stale staging files removed.
    pub stale_staging_removed: usize,
    /// Deleted objects physically removed.
    pub objects_removed: usize,
    /// Delta dependents re-materialised before their base was removed.
    pub deltas_reversed: usize,
    /// Blocks reclaimed.
    pub blocks_freed: i64,
}

/// An in-process housekeeping queue: sessions push messages, the daemon
/// drains them after the session ends.
#[derive(Clone, Default)]
pub struct MessageQueue {
    messages: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl MessageQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns the oldest message.
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.messages.lock().expect("queue poisoned").pop_front()
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.lock().expect("queue poisoned").len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Housekeeping for MessageQueue {
    fn send_message(&mut self, message: &[u8]) {
        self.messages
            .lock()
            .expect("queue poisoned")
            .push_back(message.to_vec());
    }
}

/// Audits (and optionally repairs) an account: staging garbage, the
/// refcount database, and the info-blob usage partition, all recomputed
/// from a walk of the directory tree.
pub fn check_account(
    controller: &RaidController,
    accounts: &AccountDatabase,
    account_id: i32,
    fix: bool,
) -> StoreResult<CheckReport> {
    let mut context = StoreContext::open(controller, accounts, account_id, false)?;
    let mut report = CheckReport::default();

    let stale = raidfile::scan_staging(context.disc_set())?;
    report.stale_staging = stale.len();
    if fix && !stale.is_empty() {
        raidfile::discard_stale_staging(context.disc_set())?;
    }

    // Rebuild the meta-base from the tree into a temporary database.
    let mut rebuilt = RefCountDatabase::create_temporary(context.account_dir(), account_id)?;
    let walk = match walk_tree(&mut context, &mut rebuilt) {
        Ok(walk) => walk,
        Err(err) => {
            rebuilt.discard()?;
            return Err(err);
        }
    };
    report.refcount_mismatches = rebuilt.report_changes_to(context.refcount_mut())?;

    let info = context.store_info();
    let usage_checks = [
        (info.blocks_used, walk.blocks_used),
        (info.blocks_in_old_files, walk.blocks_in_old_files),
        (info.blocks_in_deleted_files, walk.blocks_in_deleted_files),
        (info.blocks_in_directories, walk.blocks_in_directories),
        (info.num_current_files, walk.num_current_files),
        (info.num_old_files, walk.num_old_files),
        (info.num_deleted_files, walk.num_deleted_files),
        (info.num_directories, walk.num_directories),
    ];
    report.usage_mismatches = usage_checks
        .iter()
        .filter(|(recorded, actual)| recorded != actual)
        .count();

    if fix && (report.refcount_mismatches > 0 || report.usage_mismatches > 0) {
        rebuilt.commit()?;
        let info = context.info_mut();
        info.blocks_used = walk.blocks_used;
        info.blocks_in_old_files = walk.blocks_in_old_files;
        info.blocks_in_deleted_files = walk.blocks_in_deleted_files;
        info.blocks_in_directories = walk.blocks_in_directories;
        info.num_current_files = walk.num_current_files;
        info.num_old_files = walk.num_old_files;
        info.num_deleted_files = walk.num_deleted_files;
        info.num_directories = walk.num_directories;
        context.save_store_info(false)?;
        report.fixed = true;
        info!(
            account = format!("{account_id:#010x}"),
            mismatches = report.refcount_mismatches,
            "consistency check repaired the account"
        );
    } else {
        rebuilt.discard()?;
    }
    Ok(report)
}

/// Runs the reclaim pass: removes staging garbage and physically deletes
/// objects whose only references are deleted entries, reversing delta
/// dependencies first.
pub fn run_housekeeping(
    controller: &RaidController,
    accounts: &AccountDatabase,
    account_id: i32,
) -> StoreResult<HousekeepingSummary> {
    let mut context = StoreContext::open(controller, accounts, account_id, false)?;
    let mut summary = HousekeepingSummary {
        stale_staging_removed: raidfile::discard_stale_staging(context.disc_set())?,
        ..HousekeepingSummary::default()
    };

    prune_deleted(&mut context, ROOT_DIRECTORY_ID, &mut summary)?;
    context.finish()?;
    info!(
        account = format!("{account_id:#010x}"),
        removed = summary.objects_removed,
        blocks = summary.blocks_freed,
        "housekeeping complete"
    );
    Ok(summary)
}

struct TreeTotals {
    blocks_used: i64,
    blocks_in_old_files: i64,
    blocks_in_deleted_files: i64,
    blocks_in_directories: i64,
    num_current_files: i64,
    num_old_files: i64,
    num_deleted_files: i64,
    num_directories: i64,
}

/// Walks every directory reachable from the root, accumulating usage and
/// writing refcounts (with sizes, flags and the live dependency links)
/// into `rebuilt`.
fn walk_tree(
    context: &mut StoreContext,
    rebuilt: &mut RefCountDatabase,
) -> StoreResult<TreeTotals> {
    let root_size = context
        .refcount_mut()
        .entry(ROOT_DIRECTORY_ID)?
        .map_or(1, |e| e.size_in_blocks);
    let mut totals = TreeTotals {
        blocks_used: root_size,
        blocks_in_old_files: 0,
        blocks_in_deleted_files: 0,
        blocks_in_directories: root_size,
        num_current_files: 0,
        num_old_files: 0,
        num_deleted_files: 0,
        num_directories: 1,
    };
    rebuilt.set_entry(
        ROOT_DIRECTORY_ID,
        &RefCountEntry {
            flags: entry_flags::DIR,
            refcount: 1,
            size_in_blocks: root_size,
            depends_newer: 0,
            depends_older: 0,
        },
    )?;

    let mut pending = vec![ROOT_DIRECTORY_ID];
    while let Some(dir_id) = pending.pop() {
        let directory = context.get_directory(dir_id)?.clone();
        for entry in directory.entries() {
            let is_dir = entry.flags & entry_flags::DIR != 0;
            let deleted = entry.flags & entry_flags::DELETED != 0;
            let old = entry.flags & entry_flags::OLD_VERSION != 0;

            if is_dir {
                totals.num_directories += 1;
                totals.blocks_used += entry.size_in_blocks;
                totals.blocks_in_directories += entry.size_in_blocks;
                pending.push(entry.object_id);
            } else {
                totals.blocks_used += entry.size_in_blocks;
                if deleted {
                    totals.num_deleted_files += 1;
                    totals.blocks_in_deleted_files += entry.size_in_blocks;
                } else if old {
                    totals.num_old_files += 1;
                    totals.blocks_in_old_files += entry.size_in_blocks;
                } else {
                    totals.num_current_files += 1;
                }
            }

            let previous = rebuilt.entry(entry.object_id)?.unwrap_or_default();
            let live = context
                .refcount_mut()
                .entry(entry.object_id)?
                .unwrap_or_default();
            rebuilt.set_entry(
                entry.object_id,
                &RefCountEntry {
                    flags: entry.flags & !entry_flags::ATTRIBUTES_MODIFIED,
                    refcount: previous.refcount + 1,
                    size_in_blocks: entry.size_in_blocks,
                    depends_newer: live.depends_newer,
                    depends_older: live.depends_older,
                },
            )?;
        }
    }
    Ok(totals)
}

/// Removes deleted file objects under `dir_id`, recursively. An object
/// another version still depends on is re-materialised into its dependent
/// first, so removal never breaks a chain.
fn prune_deleted(
    context: &mut StoreContext,
    dir_id: i64,
    summary: &mut HousekeepingSummary,
) -> StoreResult<()> {
    let directory = context.get_directory(dir_id)?.clone();
    let mut remaining = directory.clone();
    let mut changed = false;

    for entry in directory.entries() {
        if entry.flags & entry_flags::DIR != 0 {
            prune_deleted(context, entry.object_id, summary)?;
            continue;
        }
        if entry.flags & entry_flags::DELETED == 0 {
            continue;
        }
        let object_id = entry.object_id;
        let meta = context
            .refcount_mut()
            .entry(object_id)?
            .unwrap_or_default();

        if meta.depends_newer != 0 {
            let new_blocks = reverse_dependency(context, object_id, meta.depends_newer)?;
            if let Some(dependent) = remaining.find_by_id_mut(meta.depends_newer) {
                dependent.size_in_blocks = new_blocks;
            }
            summary.deltas_reversed += 1;
        }

        let new_count = context.refcount_mut().remove_reference(object_id)?;
        if new_count == 0 {
            context.delete_object_raw(object_id)?;
            summary.objects_removed += 1;
            summary.blocks_freed += entry.size_in_blocks;
            let info = context.info_mut();
            info.blocks_used -= entry.size_in_blocks;
            info.blocks_in_deleted_files -= entry.size_in_blocks;
            info.num_deleted_files -= 1;
        }
        remaining.remove_entry(object_id);
        changed = true;

        // This object may itself have been a delta; its base no longer
        // has a dependent.
        if meta.depends_older != 0 {
            if let Some(mut base) = context.refcount_mut().entry(meta.depends_older)? {
                if base.depends_newer == object_id {
                    base.depends_newer = 0;
                    context.refcount_mut().set_entry(meta.depends_older, &base)?;
                }
            }
        }
    }

    if changed {
        context.save_directory_object(&remaining)?;
        context.invalidate_cached_directory(dir_id);
        context.save_store_info(true)?;
    }
    Ok(())
}

/// Re-materialises `dependent` (a delta on `base_id`) as a full object so
/// the base can be removed. Returns the dependent's new size in blocks.
fn reverse_dependency(
    context: &mut StoreContext,
    base_id: i64,
    dependent_id: i64,
) -> StoreResult<i64> {
    let keys = context
        .keys()
        .cloned()
        .ok_or_else(|| StoreError::DependencyBroken(base_id))?;
    let base_bytes = context.open_object(base_id)?;
    let delta_bytes = context.open_object(dependent_id)?;
    let merged = filecodec::merge_delta(&keys, &base_bytes, &delta_bytes)?;

    let old_blocks = context
        .refcount_mut()
        .entry(dependent_id)?
        .map_or(0, |e| e.size_in_blocks);
    let new_blocks =
        filecodec::size_in_blocks(merged.len() as u64, context.block_size()) as i64;
    context.write_object_raw(dependent_id, &merged)?;

    let mut meta = context
        .refcount_mut()
        .entry(dependent_id)?
        .ok_or(StoreError::DependencyBroken(dependent_id))?;
    meta.depends_older = 0;
    meta.size_in_blocks = new_blocks;
    context.refcount_mut().set_entry(dependent_id, &meta)?;

    let mut base_meta = context
        .refcount_mut()
        .entry(base_id)?
        .ok_or(StoreError::DependencyBroken(base_id))?;
    base_meta.depends_newer = 0;
    context.refcount_mut().set_entry(base_id, &base_meta)?;

    let info = context.info_mut();
    info.blocks_used += new_blocks - old_blocks;
    if new_blocks != old_blocks {
        warn!(
            object_id = dependent_id,
            old_blocks, new_blocks, "delta reversal changed object size"
        );
    }
    Ok(new_blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountRecord;
    use crate::filename::StoreFilename;
    use filecodec::AccountKeys;
    use raidfile::DiscSet;
    use std::io::Cursor;
    use std::path::Path;

    const ACCOUNT: i32 = 0x0123_4567;

    fn test_store(root: &Path) -> (RaidController, AccountDatabase) {
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
            id: ACCOUNT,
            disc_set: 0,
            root_path: AccountRecord::default_root(ACCOUNT),
        };
        StoreContext::create_account_store(&controller, &record, 10_000, 20_000, b"test-secret")
            .unwrap();
        let mut accounts = AccountDatabase::load(&root.join("accounts.txt")).unwrap();
        accounts.insert(record).unwrap();
        (controller, accounts)
    }

    fn add_file(
        controller: &RaidController,
        accounts: &AccountDatabase,
        name: &[u8],
        content: &[u8],
        diff_from: i64,
    ) -> i64 {
        let keys = AccountKeys::derive(b"test-secret");
        let mut context = StoreContext::open(controller, accounts, ACCOUNT, false).unwrap();
        let prior = if diff_from != 0 {
            let object = context.open_object(diff_from).unwrap();
            Some(filecodec::extract_block_index(&object).unwrap())
        } else {
            None
        };
        let encoded = filecodec::encode(&keys, content, prior.as_ref()).unwrap();
        let id = context
            .add_file(
                ROOT_DIRECTORY_ID,
                0,
                0,
                diff_from,
                &StoreFilename::from(name),
                true,
                &mut Cursor::new(&encoded.bytes),
            )
            .unwrap();
        context.finish().unwrap();
        id
    }

    #[test]
    fn clean_account_checks_clean() {
        let root = tempfile::tempdir().unwrap();
        let (controller, accounts) = test_store(root.path());
        add_file(&controller, &accounts, b"a", b"some data", 0);

        let report = check_account(&controller, &accounts, ACCOUNT, false).unwrap();
        assert_eq!(report.refcount_mismatches, 0);
        assert_eq!(report.usage_mismatches, 0);
        assert!(!report.fixed);
    }

    #[test]
    fn corrupted_refcount_is_detected_and_fixed() {
        let root = tempfile::tempdir().unwrap();
        let (controller, accounts) = test_store(root.path());
        let id = add_file(&controller, &accounts, b"a", b"some data", 0);

        // Sabotage the live meta-base.
        {
            let mut context =
                StoreContext::open(&controller, &accounts, ACCOUNT, false).unwrap();
            context.refcount_mut().add_reference(id).unwrap();
        }

        let report = check_account(&controller, &accounts, ACCOUNT, false).unwrap();
        assert_eq!(report.refcount_mismatches, 1);

        let report = check_account(&controller, &accounts, ACCOUNT, true).unwrap();
        assert!(report.fixed);
        let report = check_account(&controller, &accounts, ACCOUNT, false).unwrap();
        assert_eq!(report.refcount_mismatches, 0);
    }

    #[test]
    fn housekeeping_reclaims_deleted_objects() {
        let root = tempfile::tempdir().unwrap();
        let (controller, accounts) = test_store(root.path());
        let id = add_file(&controller, &accounts, b"a", b"payload to reclaim", 0);
        {
            let mut context =
                StoreContext::open(&controller, &accounts, ACCOUNT, false).unwrap();
            context
                .delete_file(ROOT_DIRECTORY_ID, &StoreFilename::from(&b"a"[..]))
                .unwrap();
            context.finish().unwrap();
        }

        let summary = run_housekeeping(&controller, &accounts, ACCOUNT).unwrap();
        assert_eq!(summary.objects_removed, 1);
        assert!(summary.blocks_freed > 0);

        let mut context = StoreContext::open(&controller, &accounts, ACCOUNT, false).unwrap();
        assert!(matches!(
            context.open_object(id),
            Err(StoreError::ObjectDoesNotExist(_))
        ));
        assert_eq!(context.store_info().num_deleted_files, 0);
        // The account still audits clean afterwards.
        drop(context);
        let report = check_account(&controller, &accounts, ACCOUNT, false).unwrap();
        assert_eq!(report.refcount_mismatches, 0);
        assert_eq!(report.usage_mismatches, 0);
    }

    #[test]
    fn removing_a_depended_on_base_reverses_the_delta_first() {
        let root = tempfile::tempdir().unwrap();
        let (controller, accounts) = test_store(root.path());
        let keys = AccountKeys::derive(b"test-secret");

        let base_content: Vec<u8> = (0u32..30_000).map(|v| (v % 251) as u8).collect();
        let mut new_content = base_content.clone();
        new_content.extend_from_slice(b" trailer");

        let base_id = add_file(&controller, &accounts, b"f", &base_content, 0);
        let delta_id = add_file(&controller, &accounts, b"f", &new_content, base_id);

        // The base is an old version now; delete the whole name history,
        // then undelete the current version so only the base stays dead.
        {
            let mut context =
                StoreContext::open(&controller, &accounts, ACCOUNT, false).unwrap();
            context
                .delete_file(ROOT_DIRECTORY_ID, &StoreFilename::from(&b"f"[..]))
                .unwrap();
            context.undelete_file(ROOT_DIRECTORY_ID, delta_id).unwrap();
            context.finish().unwrap();
        }

        let summary = run_housekeeping(&controller, &accounts, ACCOUNT).unwrap();
        assert_eq!(summary.deltas_reversed, 1);
        assert_eq!(summary.objects_removed, 1);

        // The dependent stands alone now and decodes without a base.
        let mut context = StoreContext::open(&controller, &accounts, ACCOUNT, false).unwrap();
        let merged = context.open_object(delta_id).unwrap();
        assert_eq!(
            filecodec::decode(&keys, &merged, None).unwrap(),
            new_content
        );
        let meta = context.refcount_mut().entry(delta_id).unwrap().unwrap();
        assert_eq!(meta.depends_older, 0);
    }

    #[test]
    fn message_queue_delivers_in_order() {
        let queue = MessageQueue::new();
        let mut sender = queue.clone();
        sender.send_message(b"first");
        sender.send_message(b"second");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap(), b"first");
        assert_eq!(queue.pop().unwrap(), b"second");
        assert!(queue.pop().is_none());
    }
}
