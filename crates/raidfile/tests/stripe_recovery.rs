//! Round-trip and disc-loss behaviour of the striped file layer.

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use raidfile::{
    AllocationMode, DiscSet, RaidError, RaidFileRead, RaidFileWrite, FINAL_SUFFIX,
};

const BLOCK_SIZE: usize = 1024;

fn striped_set(root: &tempfile::TempDir) -> DiscSet {
    let dirs: Vec<PathBuf> = (0..3)
        .map(|n| {
            let dir = root.path().join(format!("disc{n}"));
            fs::create_dir_all(&dir).unwrap();
            dir
        })
        .collect();
    DiscSet::striped(0, BLOCK_SIZE, [dirs[0].clone(), dirs[1].clone(), dirs[2].clone()]).unwrap()
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7 + i / 251) % 256) as u8).collect()
}

fn write_file(set: &DiscSet, name: &str, data: &[u8]) {
    let mut writer = RaidFileWrite::create(set, name, AllocationMode::Dense).unwrap();
    writer.write_all(data).unwrap();
    writer.commit().unwrap();
}

fn remove_disc_copy(set: &DiscSet, name: &str, role: usize) {
    let dir = set.role_dirs_for(name)[role].to_path_buf();
    fs::remove_file(dir.join(format!("{name}{FINAL_SUFFIX}"))).unwrap();
}

#[test]
fn round_trips_boundary_sizes() {
    let root = tempfile::tempdir().unwrap();
    let set = striped_set(&root);
    for (index, len) in [
        0usize,
        1,
        BLOCK_SIZE - 1,
        BLOCK_SIZE,
        BLOCK_SIZE + 1,
        64 * 1024,
        64 * 1024 + 1,
    ]
    .into_iter()
    .enumerate()
    {
        let name = format!("o00/{index}");
        let data = patterned(len);
        write_file(&set, &name, &data);
        let read = RaidFileRead::open(&set, &name).unwrap();
        assert_eq!(read.length(), len as u64);
        assert_eq!(read.read_all().unwrap(), data, "len {len}");
    }
}

#[test]
fn survives_the_loss_of_any_single_disc() {
    for lost_role in 0..3 {
        let root = tempfile::tempdir().unwrap();
        let set = striped_set(&root);
        let data = patterned(10 * BLOCK_SIZE + 123);
        write_file(&set, "obj", &data);

        remove_disc_copy(&set, "obj", lost_role);
        let read = RaidFileRead::open(&set, "obj").unwrap();
        assert_eq!(read.read_all().unwrap(), data, "lost role {lost_role}");
    }
}

#[test]
fn two_lost_discs_are_unrecoverable() {
    let root = tempfile::tempdir().unwrap();
    let set = striped_set(&root);
    write_file(&set, "obj", &patterned(5000));

    remove_disc_copy(&set, "obj", 0);
    remove_disc_copy(&set, "obj", 2);
    match RaidFileRead::open(&set, "obj") {
        Err(RaidError::Unrecoverable { .. }) => {}
        other => panic!("expected Unrecoverable, got {other:?}"),
    }
}

#[test]
fn truncated_data_disc_is_repaired_from_parity() {
    let root = tempfile::tempdir().unwrap();
    let set = striped_set(&root);
    let data = patterned(6 * BLOCK_SIZE);
    write_file(&set, "obj", &data);

    // Chop a block off one data disc; the parity trailer arbitrates.
    let dir = set.role_dirs_for("obj")[1].to_path_buf();
    let path = dir.join(format!("obj{FINAL_SUFFIX}"));
    let len = fs::metadata(&path).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - BLOCK_SIZE as u64).unwrap();

    let read = RaidFileRead::open(&set, "obj").unwrap();
    assert_eq!(read.read_all().unwrap(), data);
}

#[test]
fn discard_removes_staging_without_publishing() {
    let root = tempfile::tempdir().unwrap();
    let set = striped_set(&root);
    let mut writer = RaidFileWrite::create(&set, "obj", AllocationMode::Dense).unwrap();
    writer.write_all(&patterned(3000)).unwrap();
    writer.discard().unwrap();

    assert!(!RaidFileRead::exists(&set, "obj"));
    assert!(raidfile::scan_staging(&set).unwrap().is_empty());
}

#[test]
fn uncommitted_writer_leaves_only_staging() {
    let root = tempfile::tempdir().unwrap();
    let set = striped_set(&root);
    {
        let mut writer = RaidFileWrite::create(&set, "obj", AllocationMode::Dense).unwrap();
        writer.write_all(&patterned(3000)).unwrap();
        // Dropped without commit, as after a client disconnect.
    }
    assert!(!RaidFileRead::exists(&set, "obj"));
    assert_eq!(raidfile::scan_staging(&set).unwrap().len(), 3);
    assert_eq!(raidfile::discard_stale_staging(&set).unwrap(), 3);
}

#[test]
fn delete_removes_every_disc_copy() {
    let root = tempfile::tempdir().unwrap();
    let set = striped_set(&root);
    write_file(&set, "obj", &patterned(100));
    assert!(RaidFileRead::exists(&set, "obj"));

    RaidFileWrite::delete(&set, "obj").unwrap();
    assert!(!RaidFileRead::exists(&set, "obj"));
    assert!(matches!(
        RaidFileWrite::delete(&set, "obj"),
        Err(RaidError::DoesNotExist(_))
    ));
}

#[test]
fn plain_set_round_trips() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("plain");
    fs::create_dir_all(&dir).unwrap();
    let set = DiscSet::plain(0, BLOCK_SIZE, dir).unwrap();

    let data = patterned(12345);
    write_file(&set, "o01/obj", &data);
    let read = RaidFileRead::open(&set, "o01/obj").unwrap();
    assert_eq!(read.read_all().unwrap(), data);
}

#[test]
fn sparse_reserve_reads_back_as_zeros() {
    let root = tempfile::tempdir().unwrap();
    let set = striped_set(&root);
    let mut writer = RaidFileWrite::create(&set, "reserved", AllocationMode::Sparse).unwrap();
    writer.reserve(3 * BLOCK_SIZE as u64 + 10).unwrap();
    writer.commit().unwrap();

    let read = RaidFileRead::open(&set, "reserved").unwrap();
    let bytes = read.read_all().unwrap();
    assert_eq!(bytes.len(), 3 * BLOCK_SIZE + 10);
    assert!(bytes.iter().all(|&b| b == 0));
}
