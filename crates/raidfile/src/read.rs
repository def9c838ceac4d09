use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};

use tracing::warn;

use crate::controller::DiscSet;
use crate::error::{RaidError, RaidResult};
use crate::layout::{self, StripeLayout, PARITY_TRAILER_LEN};
use crate::write::final_path;

/// A committed logical file opened for reading.
///
/// Serves the exact original byte stream regardless of whether all discs
/// of a striped set are present; a single lost disc is reconstructed from
/// the survivors on the fly.
#[derive(Debug)]
pub struct RaidFileRead {
    inner: Inner,
    length: u64,
}

#[derive(Debug)]
enum Inner {
    Plain(File),
    Striped(StripedReader),
}

#[derive(Debug)]
struct StripedReader {
    name: String,
    layout: StripeLayout,
    disc0: Option<BufReader<File>>,
    disc1: Option<BufReader<File>>,
    parity: Option<BufReader<File>>,
    position: usize,
    pending: Vec<u8>,
    pending_offset: usize,
}

impl RaidFileRead {
    /// Opens `name` on the disc set.
    pub fn open(set: &DiscSet, name: &str) -> RaidResult<Self> {
        if !set.is_striped() {
            let path = final_path(&set.dirs()[0], name);
            let file = File::open(&path).map_err(|err| {
                if err.kind() == io::ErrorKind::NotFound {
                    RaidError::DoesNotExist(name.to_owned())
                } else {
                    RaidError::Io(err)
                }
            })?;
            let length = file.metadata()?.len();
            return Ok(Self {
                inner: Inner::Plain(file),
                length,
            });
        }
        Self::open_striped(set, name)
    }

    /// Whether `name` is present (readably) on the disc set.
    #[must_use]
    pub fn exists(set: &DiscSet, name: &str) -> bool {
        let roles = set.role_dirs_for(name);
        if set.is_striped() {
            roles
                .iter()
                .filter(|dir| final_path(dir, name).is_file())
                .count()
                >= 2
        } else {
            final_path(&roles[0], name).is_file()
        }
    }

    /// Logical length of the file in bytes.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Reads the whole file into memory.
    pub fn read_all(mut self) -> RaidResult<Vec<u8>> {
        let mut out = Vec::with_capacity(usize::try_from(self.length).unwrap_or(0));
        io::Read::read_to_end(&mut self, &mut out)?;
        Ok(out)
    }

    fn open_striped(set: &DiscSet, name: &str) -> RaidResult<Self> {
        let roles = set.role_dirs_for(name);
        let mut handles: Vec<Option<(File, u64)>> = Vec::with_capacity(3);
        for dir in &roles {
            let path = final_path(dir, name);
            match File::open(&path) {
                Ok(file) => {
                    let len = file.metadata()?.len();
                    handles.push(Some((file, len)));
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => handles.push(None),
                Err(err) => return Err(err.into()),
            }
        }
        let present = handles.iter().flatten().count();
        if present == 0 {
            return Err(RaidError::DoesNotExist(name.to_owned()));
        }

        let block_size = set.block_size();
        let mut parity = handles.pop().expect("three roles");
        let disc1 = handles.pop().expect("three roles");
        let disc0 = handles.pop().expect("three roles");

        // Establish the logical length, preferring the parity trailer when
        // it is available for cross-checking truncated data discs.
        let trailer_len = match &mut parity {
            Some((file, len)) => {
                if *len < PARITY_TRAILER_LEN as u64 {
                    None
                } else {
                    file.seek(SeekFrom::End(-(PARITY_TRAILER_LEN as i64)))?;
                    let mut trailer = [0u8; PARITY_TRAILER_LEN];
                    file.read_exact(&mut trailer)?;
                    file.seek(SeekFrom::Start(0))?;
                    Some(u64::from_be_bytes(trailer))
                }
            }
            None => None,
        };

        let (total_len, disc0_ok, disc1_ok) = match (&disc0, &disc1, trailer_len) {
            (Some((_, len0)), Some((_, len1)), None) => (*len0 + *len1, true, true),
            (Some((_, len0)), Some((_, len1)), Some(expected)) => {
                let layout = StripeLayout::compute(expected, block_size);
                let ok0 = *len0 == layout.disc0_len();
                let ok1 = *len1 == layout.disc1_len();
                if ok0 && ok1 {
                    (expected, true, true)
                } else {
                    // One data disc is truncated; the trailer decides which
                    // survivors to trust.
                    (expected, ok0, ok1)
                }
            }
            (Some((_, len0)), None, Some(expected)) => {
                let layout = StripeLayout::compute(expected, block_size);
                (expected, *len0 == layout.disc0_len(), false)
            }
            (None, Some((_, len1)), Some(expected)) => {
                let layout = StripeLayout::compute(expected, block_size);
                (expected, false, *len1 == layout.disc1_len())
            }
            // A lone data disc (or no parity trailer to arbitrate) cannot
            // reconstruct the stripe.
            _ => {
                return Err(RaidError::Unrecoverable {
                    name: name.to_owned(),
                    missing: 3 - present,
                })
            }
        };

        let usable = usize::from(disc0_ok) + usize::from(disc1_ok) + usize::from(parity.is_some());
        if usable < 2 {
            return Err(RaidError::Unrecoverable {
                name: name.to_owned(),
                missing: 3 - usable,
            });
        }
        if !(disc0_ok && disc1_ok) {
            warn!(name, "repair read: reconstructing a lost disc from parity");
        }

        let layout = StripeLayout::compute(total_len, block_size);
        Ok(Self {
            length: total_len,
            inner: Inner::Striped(StripedReader {
                name: name.to_owned(),
                layout,
                disc0: disc0.filter(|_| disc0_ok).map(|(f, _)| BufReader::new(f)),
                disc1: disc1.filter(|_| disc1_ok).map(|(f, _)| BufReader::new(f)),
                parity: parity.map(|(f, _)| BufReader::new(f)),
                position: 0,
                pending: Vec::new(),
                pending_offset: 0,
            }),
        })
    }
}

impl Read for RaidFileRead {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::Plain(file) => file.read(buf),
            Inner::Striped(striped) => striped.read(buf),
        }
    }
}

impl StripedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending_offset >= self.pending.len() {
            if !self.fill_next_position()? {
                return Ok(0);
            }
        }
        let available = &self.pending[self.pending_offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_offset += n;
        Ok(n)
    }

    /// Loads the logical bytes of stripe position `self.position`: the
    /// disc-0 block followed by its disc-1 partner (when one exists),
    /// reconstructing whichever side is missing from parity.
    fn fill_next_position(&mut self) -> io::Result<bool> {
        let position = self.position;
        if position >= self.layout.disc0_blocks.len() {
            return Ok(false);
        }
        let len0 = self.layout.disc0_blocks[position];
        let len1 = self.layout.disc1_blocks.get(position).copied();

        let block0_direct = read_block_opt(&mut self.disc0, len0)?;
        let block1_direct = match len1 {
            Some(len) => read_block_opt(&mut self.disc1, len)?,
            None => Some(Vec::new()),
        };
        let (block0, block1) = match (block0_direct, block1_direct) {
            (Some(b0), Some(b1)) => {
                // Keep the parity reader in step for the next position.
                if self.parity.is_some() {
                    read_block_opt(&mut self.parity, len0)?;
                }
                (b0, b1)
            }
            (Some(b0), None) => {
                let parity = read_block_opt(&mut self.parity, len0)?
                    .ok_or_else(|| corrupt(&self.name))?;
                let len1 = len1.expect("reconstructing a block that exists");
                let mut rebuilt = layout::xor_blocks(&parity, &b0);
                rebuilt.truncate(len1);
                (b0, rebuilt)
            }
            (None, Some(b1)) => {
                let parity = read_block_opt(&mut self.parity, len0)?
                    .ok_or_else(|| corrupt(&self.name))?;
                let mut rebuilt = layout::xor_blocks(&parity, &b1);
                rebuilt.truncate(len0);
                (rebuilt, b1)
            }
            (None, None) => return Err(corrupt(&self.name)),
        };

        self.pending.clear();
        self.pending.extend_from_slice(&block0);
        self.pending.extend_from_slice(&block1);
        self.pending_offset = 0;
        self.position += 1;
        Ok(true)
    }
}

fn read_block_opt(
    reader: &mut Option<BufReader<File>>,
    len: usize,
) -> io::Result<Option<Vec<u8>>> {
    let Some(reader) = reader.as_mut() else {
        return Ok(None);
    };
    let mut block = vec![0u8; len];
    reader.read_exact(&mut block)?;
    Ok(Some(block))
}

fn corrupt(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("raid file {name:?} stripe inconsistent"),
    )
}
