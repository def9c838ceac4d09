use std::io;

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the store engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object id names nothing in this account.
    #[error("object {0:#x} does not exist")]
    ObjectDoesNotExist(i64),
    /// A current (not old, not deleted) entry already uses the name.
    #[error("name already exists in directory {0:#x}")]
    NameAlreadyExists(i64),
    /// The object exists but is not a directory.
    #[error("object {0:#x} is not a directory")]
    NotADirectory(i64),
    /// The object exists but is not a file.
    #[error("object {0:#x} is not a file")]
    NotAFile(i64),
    /// A delta dependency chain is inconsistent.
    #[error("delta dependency broken at object {0:#x}")]
    DependencyBroken(i64),
    /// A command arrived in the wrong session phase.
    #[error("command out of phase")]
    WrongPhase,
    /// Login failed (unknown or disabled account).
    #[error("login failed for account {0:#010x}")]
    LoginFailed(i32),
    /// Another session holds the account's write lock.
    #[error("account is locked by another session")]
    AlreadyLocked,
    /// A mutating command arrived on a read-only session.
    #[error("session is read-only")]
    ReadOnly,
    /// Accepting the upload would cross the hard block limit.
    #[error("hard storage limit exceeded")]
    HardLimitExceeded,
    /// The account is not in the account database.
    #[error("account {0:#010x} does not exist")]
    AccountDoesNotExist(i32),
    /// The info blob is unreadable or inconsistent.
    #[error("store info corrupt: {0}")]
    CorruptInfo(String),
    /// The refcount database is unreadable or inconsistent.
    #[error("refcount database corrupt: {0}")]
    CorruptRefCountDb(String),
    /// The account database file is unreadable or inconsistent.
    #[error("account database corrupt: {0}")]
    CorruptAccountDb(String),
    /// Protocol failure on the session's connection.
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),
    /// RAID layer failure.
    #[error(transparent)]
    Raid(#[from] raidfile::RaidError),
    /// Codec failure on a stored object.
    #[error(transparent)]
    Codec(#[from] filecodec::CodecError),
    /// Plain filesystem failure.
    #[error("store I/O error: {0}")]
    Io(
        #[from]
        #[source]
        io::Error,
    ),
}

impl StoreError {
    /// Whether this error must terminate the session (corruption and
    /// infrastructure failures) rather than being reported and survived.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CorruptInfo(_)
                | Self::CorruptRefCountDb(_)
                | Self::CorruptAccountDb(_)
                | Self::Protocol(_)
                | Self::Raid(_)
                | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_is_fatal_but_store_errors_are_not() {
        assert!(StoreError::CorruptRefCountDb("short file".into()).is_fatal());
        assert!(!StoreError::ObjectDoesNotExist(2).is_fatal());
        assert!(!StoreError::HardLimitExceeded.is_fatal());
    }

    #[test]
    fn object_ids_format_as_hex() {
        assert!(StoreError::ObjectDoesNotExist(0x1F)
            .to_string()
            .contains("0x1f"));
    }
}
