use std::path::{Path, PathBuf};

use config::verify::{KeyRule, Schema, SubBlocks, ValueKind};
use config::Configuration;

use crate::error::{RaidError, RaidResult};

/// One disc set: a single plain directory, or three directories striped
/// with parity.
#[derive(Clone, Debug)]
pub struct DiscSet {
    set_number: u32,
    block_size: usize,
    dirs: Vec<PathBuf>,
}

impl DiscSet {
    /// Number of directories in a striped set.
    pub const STRIPED_DISC_COUNT: usize = 3;

    /// Creates a plain single-directory set.
    pub fn plain(set_number: u32, block_size: usize, dir: PathBuf) -> RaidResult<Self> {
        if block_size == 0 {
            return Err(RaidError::BadConfig("block size must be non-zero".into()));
        }
        Ok(Self {
            set_number,
            block_size,
            dirs: vec![dir],
        })
    }

    /// Creates a striped three-directory set. The directories must be
    /// distinct.
    pub fn striped(set_number: u32, block_size: usize, dirs: [PathBuf; 3]) -> RaidResult<Self> {
        if block_size == 0 {
            return Err(RaidError::BadConfig("block size must be non-zero".into()));
        }
        if dirs[0] == dirs[1] || dirs[1] == dirs[2] || dirs[0] == dirs[2] {
            return Err(RaidError::BadConfig(format!(
                "disc set {set_number} repeats a directory"
            )));
        }
        Ok(Self {
            set_number,
            block_size,
            dirs: dirs.into(),
        })
    }

    /// The set's number in the controller table.
    #[must_use]
    pub fn set_number(&self) -> u32 {
        self.set_number
    }

    /// Stripe unit in bytes.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Whether this set stripes across three discs.
    #[must_use]
    pub fn is_striped(&self) -> bool {
        self.dirs.len() == Self::STRIPED_DISC_COUNT
    }

    /// The set's directories.
    #[must_use]
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Which disc a logical name starts its stripe on. A byte-sum hash,
    /// so different objects rotate their roles around the set.
    #[must_use]
    pub fn start_disc_for(&self, name: &str) -> usize {
        let sum: u32 = name.bytes().map(u32::from).sum();
        (sum as usize) % self.dirs.len()
    }

    /// The physical directories in role order for `name`: first data disc,
    /// second data disc, parity. For a plain set this is the one directory.
    #[must_use]
    pub fn role_dirs_for(&self, name: &str) -> Vec<&Path> {
        let start = self.start_disc_for(name);
        (0..self.dirs.len())
            .map(|role| self.dirs[(start + role) % self.dirs.len()].as_path())
            .collect()
    }
}

/// The disc-set table, read once from the RAID configuration file.
#[derive(Clone, Debug, Default)]
pub struct RaidController {
    sets: Vec<DiscSet>,
}

impl RaidController {
    /// Builds a controller from already-constructed sets (tests, embedders).
    #[must_use]
    pub fn from_sets(sets: Vec<DiscSet>) -> Self {
        Self { sets }
    }

    /// Loads and verifies the RAID configuration file.
    ///
    /// Each sub-block describes one disc set with `SetNumber`, `BlockSize`
    /// and `Dir0`..`Dir2`. All three dirs equal means a plain set; all
    /// distinct means striped; anything else is a configuration error. Set
    /// numbers must be contiguous from zero in file order.
    pub fn from_config_file(path: &Path) -> RaidResult<Self> {
        let schema = Schema::new(
            vec![],
            SubBlocks::AnyName(Box::new(Schema::new(
                vec![
                    KeyRule::required("SetNumber", ValueKind::Int),
                    KeyRule::required("BlockSize", ValueKind::Int),
                    KeyRule::required("Dir0", ValueKind::Any),
                    KeyRule::required("Dir1", ValueKind::Any),
                    KeyRule::required("Dir2", ValueKind::Any),
                ],
                SubBlocks::None,
            ))),
        );
        let parsed = Configuration::load_and_verify(path, &schema)
            .map_err(|err| RaidError::BadConfig(err.to_string()))?;

        let mut sets = Vec::new();
        for (expected, (name, block)) in parsed.sub_blocks().enumerate() {
            let set_number = block
                .key_value_int("SetNumber")
                .map_err(|err| RaidError::BadConfig(err.to_string()))?;
            if set_number != expected as i64 {
                return Err(RaidError::BadConfig(format!(
                    "disc set {name:?} has SetNumber {set_number}, expected {expected}"
                )));
            }
            let block_size = block
                .key_value_int("BlockSize")
                .map_err(|err| RaidError::BadConfig(err.to_string()))?;
            let block_size = usize::try_from(block_size)
                .ok()
                .filter(|size| *size > 0)
                .ok_or_else(|| {
                    RaidError::BadConfig(format!("disc set {name:?} has bad BlockSize"))
                })?;
            let dir = |key: &str| -> RaidResult<PathBuf> {
                Ok(PathBuf::from(
                    block
                        .key_value(key)
                        .map_err(|err| RaidError::BadConfig(err.to_string()))?,
                ))
            };
            let (d0, d1, d2) = (dir("Dir0")?, dir("Dir1")?, dir("Dir2")?);
            let set = if d0 == d1 && d1 == d2 {
                DiscSet::plain(set_number as u32, block_size, d0)?
            } else {
                DiscSet::striped(set_number as u32, block_size, [d0, d1, d2])?
            };
            sets.push(set);
        }
        Ok(Self { sets })
    }

    /// Returns the disc set with the given number.
    pub fn disc_set(&self, number: u32) -> RaidResult<&DiscSet> {
        self.sets
            .get(number as usize)
            .ok_or(RaidError::NoSuchDiscSet(number))
    }

    /// Number of configured disc sets.
    #[must_use]
    pub fn disc_set_count(&self) -> usize {
        self.sets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const RAID_CONF: &str = "\
disc0
{
    SetNumber = 0
    BlockSize = 2048
    Dir0 = /raid/0_0
    Dir1 = /raid/0_1
    Dir2 = /raid/0_2
}
disc1
{
    SetNumber = 1
    BlockSize = 4096
    Dir0 = /plain
    Dir1 = /plain
    Dir2 = /plain
}
";

    fn write_conf(text: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raidfile.conf");
        fs::write(&path, text).unwrap();
        (dir, path)
    }

    #[test]
    fn loads_striped_and_plain_sets() {
        let (_dir, path) = write_conf(RAID_CONF);
        let controller = RaidController::from_config_file(&path).unwrap();
        assert_eq!(controller.disc_set_count(), 2);

        let striped = controller.disc_set(0).unwrap();
        assert!(striped.is_striped());
        assert_eq!(striped.block_size(), 2048);

        let plain = controller.disc_set(1).unwrap();
        assert!(!plain.is_striped());
        assert_eq!(plain.dirs().len(), 1);
    }

    #[test]
    fn out_of_order_set_numbers_are_rejected() {
        let (_dir, path) = write_conf(
            "discA\n{\nSetNumber = 1\nBlockSize = 1024\nDir0 = /a\nDir1 = /a\nDir2 = /a\n}\n",
        );
        let err = RaidController::from_config_file(&path).unwrap_err();
        assert!(matches!(err, RaidError::BadConfig(_)));
    }

    #[test]
    fn partially_repeated_dirs_are_rejected() {
        let (_dir, path) = write_conf(
            "disc\n{\nSetNumber = 0\nBlockSize = 1024\nDir0 = /a\nDir1 = /a\nDir2 = /b\n}\n",
        );
        let err = RaidController::from_config_file(&path).unwrap_err();
        assert!(matches!(err, RaidError::BadConfig(_)));
    }

    #[test]
    fn missing_set_is_no_such_disc_set() {
        let controller = RaidController::from_sets(vec![]);
        assert!(matches!(
            controller.disc_set(3),
            Err(RaidError::NoSuchDiscSet(3))
        ));
    }

    #[test]
    fn start_disc_balances_by_name_bytes() {
        let set = DiscSet::striped(
            0,
            1024,
            [
                PathBuf::from("/a"),
                PathBuf::from("/b"),
                PathBuf::from("/c"),
            ],
        )
        .unwrap();
        // Byte-sum hash: "b" is one more than "a", rotating one disc on.
        let first = set.start_disc_for("a");
        let second = set.start_disc_for("b");
        assert_eq!((first + 1) % 3, second);

        let roles = set.role_dirs_for("a");
        assert_eq!(roles.len(), 3);
        assert_eq!(roles[0], set.dirs()[first].as_path());
    }
}
