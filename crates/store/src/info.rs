//! The per-account info blob: usage figures, limits, counters, and the
//! client's crash-recovery marker. Saved atomically through the RAID
//! layer's staging rename.

use std::io::Read;

use raidfile::{AllocationMode, DiscSet, RaidFileRead, RaidFileWrite};

use crate::error::{StoreError, StoreResult};

/// Magic prefix of a serialised info blob.
pub const INFO_MAGIC: u32 = 0x56_4E_46_4F; // "VNFO"

/// Logical RAID name of the info blob under an account root.
pub const INFO_NAME: &str = "info/info";

/// Per-account summary state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreInfo {
    /// Account this blob belongs to.
    pub account_id: i32,
    /// Total blocks charged to the account.
    pub blocks_used: i64,
    /// Blocks held by old file versions.
    pub blocks_in_old_files: i64,
    /// Blocks held by deleted objects.
    pub blocks_in_deleted_files: i64,
    /// Blocks held by directories.
    pub blocks_in_directories: i64,
    /// Advisory soft limit.
    pub blocks_soft_limit: i64,
    /// Enforced hard limit.
    pub blocks_hard_limit: i64,
    /// Highest object id ever allocated; persisted before new ids become
    /// externally visible and never decreases.
    pub last_object_id_used: i64,
    /// Opaque 64-bit token owned by the client.
    pub client_store_marker: i64,
    /// Number of current file versions.
    pub num_current_files: i64,
    /// Number of old file versions.
    pub num_old_files: i64,
    /// Number of deleted objects.
    pub num_deleted_files: i64,
    /// Number of directories.
    pub num_directories: i64,
    /// Cap on retained versions per name (0 = unlimited); enforcement is
    /// housekeeping's job.
    pub version_count_limit: i64,
    /// Whether the account accepts logins.
    pub is_enabled: bool,
}

impl StoreInfo {
    /// A fresh info blob for a new account. `blocks_used` starts at the
    /// root directory's block.
    #[must_use]
    pub fn new(account_id: i32, soft_limit: i64, hard_limit: i64) -> Self {
        Self {
            account_id,
            blocks_soft_limit: soft_limit,
            blocks_hard_limit: hard_limit,
            last_object_id_used: crate::ROOT_DIRECTORY_ID,
            num_directories: 1,
            is_enabled: true,
            ..Self::default()
        }
    }

    /// Loads the info blob from the account's store.
    pub fn load(set: &DiscSet, account_root: &str, account_id: i32) -> StoreResult<Self> {
        let name = format!("{account_root}/{INFO_NAME}");
        let mut reader = RaidFileRead::open(set, &name)?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let info = Self::from_bytes(&bytes)?;
        if info.account_id != account_id {
            return Err(StoreError::CorruptInfo(format!(
                "info blob is for account {:#010x}, expected {account_id:#010x}",
                info.account_id
            )));
        }
        Ok(info)
    }

    /// Saves the info blob atomically.
    pub fn save(&self, set: &DiscSet, account_root: &str) -> StoreResult<()> {
        use std::io::Write as _;
        let name = format!("{account_root}/{INFO_NAME}");
        let mut writer = RaidFileWrite::create(set, &name, AllocationMode::Dense)?;
        writer.write_all(&self.to_bytes())?;
        writer.commit()?;
        Ok(())
    }

    /// Serialises the blob.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 4 + 13 * 8 + 1);
        out.extend_from_slice(&INFO_MAGIC.to_be_bytes());
        out.extend_from_slice(&self.account_id.to_be_bytes());
        for value in [
            self.blocks_used,
            self.blocks_in_old_files,
            self.blocks_in_deleted_files,
            self.blocks_in_directories,
            self.blocks_soft_limit,
            self.blocks_hard_limit,
            self.last_object_id_used,
            self.client_store_marker,
            self.num_current_files,
            self.num_old_files,
            self.num_deleted_files,
            self.num_directories,
            self.version_count_limit,
        ] {
            out.extend_from_slice(&value.to_be_bytes());
        }
        out.push(u8::from(self.is_enabled));
        out
    }

    /// Parses a serialised blob.
    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        const EXPECTED_LEN: usize = 4 + 4 + 13 * 8 + 1;
        if bytes.len() != EXPECTED_LEN {
            return Err(StoreError::CorruptInfo(format!(
                "info blob is {} bytes, expected {EXPECTED_LEN}",
                bytes.len()
            )));
        }
        let magic = u32::from_be_bytes(bytes[0..4].try_into().expect("length checked"));
        if magic != INFO_MAGIC {
            return Err(StoreError::CorruptInfo(format!(
                "bad info magic {magic:#010x}"
            )));
        }
        let account_id = i32::from_be_bytes(bytes[4..8].try_into().expect("length checked"));
        let mut fields = [0i64; 13];
        for (n, field) in fields.iter_mut().enumerate() {
            let start = 8 + n * 8;
            *field = i64::from_be_bytes(
                bytes[start..start + 8].try_into().expect("length checked"),
            );
        }
        Ok(Self {
            account_id,
            blocks_used: fields[0],
            blocks_in_old_files: fields[1],
            blocks_in_deleted_files: fields[2],
            blocks_in_directories: fields[3],
            blocks_soft_limit: fields[4],
            blocks_hard_limit: fields[5],
            last_object_id_used: fields[6],
            client_store_marker: fields[7],
            num_current_files: fields[8],
            num_old_files: fields[9],
            num_deleted_files: fields[10],
            num_directories: fields[11],
            version_count_limit: fields[12],
            is_enabled: bytes[EXPECTED_LEN - 1] != 0,
        })
    }

    /// Whether `additional_blocks` more blocks would cross the hard limit.
    #[must_use]
    pub fn would_exceed_hard_limit(&self, additional_blocks: i64) -> bool {
        self.blocks_hard_limit > 0 && self.blocks_used + additional_blocks > self.blocks_hard_limit
    }

    /// Whether usage has crossed the advisory soft limit.
    #[must_use]
    pub fn soft_limit_exceeded(&self) -> bool {
        self.blocks_soft_limit > 0 && self.blocks_used > self.blocks_soft_limit
    }
}
