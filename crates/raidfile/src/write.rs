use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::controller::DiscSet;
use crate::error::{RaidError, RaidResult};
use crate::layout::StripeLayout;
use crate::{layout, FINAL_SUFFIX, STAGING_SUFFIX};

/// How an initial empty region is reserved at format time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationMode {
    /// Let the filesystem keep the reservation sparse.
    Sparse,
    /// Pre-allocate by writing zero blocks.
    Dense,
}

/// A logical file being written through staging.
///
/// Bytes stream in through [`io::Write`]; nothing becomes visible to
/// readers until [`commit`](Self::commit) renames every disc's staging
/// file at once. Dropping the writer without committing leaves only
/// staging files, which startup garbage collection reclaims.
pub struct RaidFileWrite {
    name: String,
    block_size: usize,
    striped: bool,
    mode: AllocationMode,
    staging: Vec<PathBuf>,
    finals: Vec<PathBuf>,
    files: Vec<File>,
    pair_buf: Vec<u8>,
    total_len: u64,
    reserved: bool,
}

impl RaidFileWrite {
    /// Creates staging files for `name` on every disc of the set.
    pub fn create(set: &DiscSet, name: &str, mode: AllocationMode) -> RaidResult<Self> {
        let roles = set.role_dirs_for(name);
        let mut staging = Vec::with_capacity(roles.len());
        let mut finals = Vec::with_capacity(roles.len());
        let mut files = Vec::with_capacity(roles.len());
        for dir in roles {
            let final_path = dir.join(format!("{name}{FINAL_SUFFIX}"));
            let staging_path = dir.join(format!("{name}{STAGING_SUFFIX}"));
            if let Some(parent) = staging_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&staging_path)?;
            staging.push(staging_path);
            finals.push(final_path);
            files.push(file);
        }
        Ok(Self {
            name: name.to_owned(),
            block_size: set.block_size(),
            striped: set.is_striped(),
            mode,
            staging,
            finals,
            files,
            pair_buf: Vec::new(),
            total_len: 0,
            reserved: false,
        })
    }

    /// Logical bytes accepted so far.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Reserves an initial region of `length` zero bytes. Only valid on a
    /// fresh writer; a reserved file takes no further writes.
    pub fn reserve(&mut self, length: u64) -> RaidResult<()> {
        if self.total_len != 0 || self.reserved {
            return Err(RaidError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reserve requires a fresh writer",
            )));
        }
        match self.mode {
            AllocationMode::Dense => {
                let zeros = vec![0u8; self.block_size];
                let mut remaining = length;
                while remaining > 0 {
                    let chunk = zeros.len().min(remaining as usize);
                    self.write_all(&zeros[..chunk])?;
                    remaining -= chunk as u64;
                }
            }
            AllocationMode::Sparse => {
                if self.striped {
                    let layout = StripeLayout::compute(length, self.block_size);
                    self.files[0].set_len(layout.disc0_len())?;
                    self.files[1].set_len(layout.disc1_len())?;
                    // Parity of zeros is zeros; only the trailer is real.
                    self.files[2].set_len(layout.disc0_len())?;
                } else {
                    self.files[0].set_len(length)?;
                }
                self.total_len = length;
            }
        }
        self.reserved = true;
        Ok(())
    }

    /// Commits the file: flushes buffered blocks, writes the parity
    /// trailer, syncs, and atomically renames every staging file to its
    /// final name.
    pub fn commit(mut self) -> RaidResult<()> {
        if self.striped {
            self.flush_remainder()?;
            // Trailer: the logical length, so a lost data disc can be
            // rebuilt byte-exact.
            self.files[2].seek(SeekFrom::End(0))?;
            self.files[2].write_all(&self.total_len.to_be_bytes())?;
        }
        for file in &mut self.files {
            file.sync_all()?;
        }
        self.files.clear();
        for (from, to) in self.staging.iter().zip(self.finals.iter()) {
            fs::rename(from, to)?;
        }
        debug!(name = %self.name, len = self.total_len, "raid file committed");
        self.staging.clear();
        Ok(())
    }

    /// Abandons the write, removing the staging files.
    pub fn discard(mut self) -> RaidResult<()> {
        self.files.clear();
        for path in std::mem::take(&mut self.staging) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Removes a committed logical file from every disc of the set.
    pub fn delete(set: &DiscSet, name: &str) -> RaidResult<()> {
        let mut found = false;
        for dir in set.role_dirs_for(name) {
            let path = dir.join(format!("{name}{FINAL_SUFFIX}"));
            match fs::remove_file(&path) {
                Ok(()) => found = true,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        if found {
            Ok(())
        } else {
            Err(RaidError::DoesNotExist(name.to_owned()))
        }
    }

    fn flush_pair(&mut self) -> io::Result<()> {
        let block = self.block_size;
        let (first, second) = {
            let (a, rest) = self.pair_buf.split_at(block);
            (a.to_vec(), rest[..block].to_vec())
        };
        self.files[0].write_all(&first)?;
        self.files[1].write_all(&second)?;
        let parity = layout::xor_blocks(&first, &second);
        self.files[2].write_all(&parity)?;
        self.pair_buf.drain(..2 * block);
        Ok(())
    }

    fn flush_remainder(&mut self) -> io::Result<()> {
        if self.pair_buf.is_empty() {
            return Ok(());
        }
        let block = self.block_size;
        let first_len = self.pair_buf.len().min(block);
        let first = self.pair_buf[..first_len].to_vec();
        let residue = self.pair_buf[first_len..].to_vec();

        // The final full block and any residue both land on data disc 0;
        // parity mirrors data disc 0 at positions with no disc-1 partner.
        self.files[0].write_all(&first)?;
        self.files[2].write_all(&first)?;
        if !residue.is_empty() {
            self.files[0].write_all(&residue)?;
            self.files[2].write_all(&residue)?;
        }
        self.pair_buf.clear();
        Ok(())
    }
}

impl Write for RaidFileWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.reserved && self.mode == AllocationMode::Sparse {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "sparse-reserved file takes no writes",
            ));
        }
        if self.striped {
            self.pair_buf.extend_from_slice(buf);
            while self.pair_buf.len() >= 2 * self.block_size {
                self.flush_pair()?;
            }
        } else {
            self.files[0].write_all(buf)?;
        }
        self.total_len += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Buffered partial pairs only hit the discs at commit.
        if !self.striped {
            self.files[0].flush()?;
        }
        Ok(())
    }
}

impl Drop for RaidFileWrite {
    fn drop(&mut self) {
        if !self.staging.is_empty() {
            debug!(name = %self.name, "raid write dropped without commit; staging files remain");
        }
    }
}

/// Final-name path of `name` on a given role directory. Shared with the
/// read path.
pub(crate) fn final_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}{FINAL_SUFFIX}"))
}
