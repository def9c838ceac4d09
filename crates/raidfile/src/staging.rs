//! Staging-file garbage collection.
//!
//! A writer that dies before commit leaves `.rfw` files behind. They are
//! harmless (readers only see `.rf` names) but waste space, so startup and
//! housekeeping sweep them.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::controller::DiscSet;
use crate::error::RaidResult;
use crate::STAGING_SUFFIX;

/// Finds every leftover staging file on the set's discs.
pub fn scan_staging(set: &DiscSet) -> RaidResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    for dir in set.dirs() {
        if dir.is_dir() {
            scan_dir(dir, &mut found)?;
        }
    }
    Ok(found)
}

/// Deletes every leftover staging file on the set's discs, returning how
/// many were removed.
pub fn discard_stale_staging(set: &DiscSet) -> RaidResult<usize> {
    let stale = scan_staging(set)?;
    let count = stale.len();
    for path in stale {
        info!(path = %path.display(), "removing stale staging file");
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(count)
}

fn scan_dir(dir: &Path, found: &mut Vec<PathBuf>) -> RaidResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            scan_dir(&path, found)?;
        } else if path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(STAGING_SUFFIX))
        {
            found.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::DiscSet;
    use std::fs::File;

    #[test]
    fn finds_and_removes_nested_staging_files() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("plain");
        fs::create_dir_all(dir.join("o01")).unwrap();
        File::create(dir.join("o01/2.rfw")).unwrap();
        File::create(dir.join("o01/2.rf")).unwrap();
        File::create(dir.join("keep.rf")).unwrap();

        let set = DiscSet::plain(0, 1024, dir.clone()).unwrap();
        let stale = scan_staging(&set).unwrap();
        assert_eq!(stale.len(), 1);
        assert!(stale[0].ends_with("o01/2.rfw"));

        assert_eq!(discard_stale_staging(&set).unwrap(), 1);
        assert!(!dir.join("o01/2.rfw").exists());
        assert!(dir.join("o01/2.rf").exists());
    }
}
