//! The client side of the store protocol.
//!
//! [`StoreClient`] wraps a transport connection with typed operations:
//! each method sends one command, reads the reply, maps wire errors back
//! onto [`StoreError`], and handles the attached streams. Encoding and
//! decoding of file objects stays with the caller (the client owns the
//! account keys; the store only ever sees ciphertext).
//!
//! [`ClientConfig`] loads the client's configuration file with the same
//! verification discipline the daemon applies to its own.

use std::io::Read;
use std::path::{Path, PathBuf};

use config::verify::{KeyRule, Schema, SubBlocks, ValueKind};
use config::Configuration;
use filecodec::BlockIndex;
use protocol::{error_codes, Command, Protocol, ProtocolError, Reply, StreamSize};
use transport::Connection;

use crate::directory::Directory;
use crate::error::{StoreError, StoreResult};
use crate::filename::StoreFilename;
use crate::PROTOCOL_VERSION;

/// Client configuration (§ client keys): account binding, store address,
/// TLS material, key file and local state directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Account to log in to.
    pub account_number: i32,
    /// Host name of the store server (also the expected certificate name).
    pub store_hostname: String,
    /// Client certificate.
    pub certificate_file: PathBuf,
    /// Client private key.
    pub private_key_file: PathBuf,
    /// CA store both peers are verified against.
    pub trusted_cas_file: PathBuf,
    /// File holding the account secret the codec keys derive from.
    pub keys_file: PathBuf,
    /// Local working state directory.
    pub data_directory: PathBuf,
}

impl ClientConfig {
    fn schema() -> Schema {
        Schema::new(
            vec![
                KeyRule::required("AccountNumber", ValueKind::Any),
                KeyRule::required("StoreHostname", ValueKind::Any),
                KeyRule::required("CertificateFile", ValueKind::Any),
                KeyRule::required("PrivateKeyFile", ValueKind::Any),
                KeyRule::required("TrustedCAsFile", ValueKind::Any),
                KeyRule::required("KeysFile", ValueKind::Any),
                KeyRule::required("DataDirectory", ValueKind::Any),
            ],
            SubBlocks::None,
        )
    }

    /// Loads and verifies a client configuration file.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let parsed = Configuration::load_and_verify(path, &Self::schema())
            .map_err(|err| StoreError::CorruptAccountDb(err.to_string()))?;
        let key = |name: &str| -> StoreResult<String> {
            parsed
                .key_value(name)
                .map(ToOwned::to_owned)
                .map_err(|err| StoreError::CorruptAccountDb(err.to_string()))
        };
        let account_text = key("AccountNumber")?;
        let account_number = u32::from_str_radix(account_text.trim_start_matches("0x"), 16)
            .map_err(|_| {
                StoreError::CorruptAccountDb(format!("bad AccountNumber {account_text:?}"))
            })? as i32;
        Ok(Self {
            account_number,
            store_hostname: key("StoreHostname")?,
            certificate_file: PathBuf::from(key("CertificateFile")?),
            private_key_file: PathBuf::from(key("PrivateKeyFile")?),
            trusted_cas_file: PathBuf::from(key("TrustedCAsFile")?),
            keys_file: PathBuf::from(key("KeysFile")?),
            data_directory: PathBuf::from(key("DataDirectory")?),
        })
    }
}

/// What the server reported at login.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoginOutcome {
    /// Whether the session ended up read-only.
    pub read_only: bool,
    /// The client's stored marker.
    pub client_store_marker: i64,
    /// Blocks currently charged to the account.
    pub blocks_used: i64,
    /// Advisory soft limit.
    pub blocks_soft_limit: i64,
    /// Enforced hard limit.
    pub blocks_hard_limit: i64,
}

/// A logged-in (or logging-in) client session.
pub struct StoreClient<S: Connection> {
    protocol: Protocol<S>,
}

impl<S: Connection> StoreClient<S> {
    /// Wraps a connected transport.
    pub fn new(connection: S) -> Self {
        Self {
            protocol: Protocol::new(connection),
        }
    }

    /// Access to the underlying protocol (timeouts, raw frames).
    pub fn protocol_mut(&mut self) -> &mut Protocol<S> {
        &mut self.protocol
    }

    /// Runs the version exchange and logs in.
    pub fn login(&mut self, account_id: i32, read_only: bool) -> StoreResult<LoginOutcome> {
        self.protocol.send_command(&Command::Version {
            version: PROTOCOL_VERSION,
        })?;
        match self.protocol.receive_reply()? {
            Reply::Version { .. } => {}
            Reply::Error {
                error_type,
                sub_type,
            } => return Err(error_from_wire(error_type, sub_type)),
            other => return Err(unexpected(&other)),
        }

        let flags = if read_only {
            protocol::login_flags::READ_ONLY
        } else {
            0
        };
        self.protocol.send_command(&Command::Login {
            account_id,
            flags,
        })?;
        match self.protocol.receive_reply()? {
            Reply::LoginConfirmed {
                read_only,
                client_store_marker,
                blocks_used,
                blocks_soft_limit,
                blocks_hard_limit,
            } => Ok(LoginOutcome {
                read_only,
                client_store_marker,
                blocks_used,
                blocks_soft_limit,
                blocks_hard_limit,
            }),
            Reply::Error {
                error_type,
                sub_type,
            } => Err(error_from_wire(error_type, sub_type)),
            other => Err(unexpected(&other)),
        }
    }

    /// Ends the session cleanly.
    pub fn finish(mut self) -> StoreResult<()> {
        self.protocol.send_command(&Command::Finished)?;
        self.expect_success()?;
        Ok(())
    }

    /// Uploads an encoded file object, returning the new object id.
    #[allow(clippy::too_many_arguments)]
    pub fn store_file<R: Read>(
        &mut self,
        dir_id: i64,
        modification_time: i64,
        attributes_hash: i64,
        diff_from_file_id: i64,
        filename: &StoreFilename,
        mark_same_name_as_old: bool,
        object: &mut R,
    ) -> StoreResult<i64> {
        self.protocol.send_command(&Command::StoreFile {
            dir_id,
            modification_time,
            attributes_hash,
            diff_from_file_id,
            filename: filename.as_bytes().to_vec(),
            mark_same_name_as_old,
        })?;
        self.protocol.send_stream(object, StreamSize::Uncertain)?;
        self.expect_success()
    }

    /// Downloads a file version's (self-contained) encoded object.
    pub fn get_file(&mut self, dir_id: i64, object_id: i64) -> StoreResult<Vec<u8>> {
        self.protocol
            .send_command(&Command::GetFile { dir_id, object_id })?;
        self.expect_success()?;
        Ok(self.protocol.receive_stream()?.read_to_vec()?)
    }

    /// Downloads any object's raw bytes (admin).
    pub fn get_object(&mut self, object_id: i64) -> StoreResult<Vec<u8>> {
        self.protocol.send_command(&Command::GetObject { object_id })?;
        self.expect_success()?;
        Ok(self.protocol.receive_stream()?.read_to_vec()?)
    }

    /// Fetches a file version's block index for delta encoding.
    pub fn get_block_index_by_id(&mut self, object_id: i64) -> StoreResult<BlockIndex> {
        self.protocol
            .send_command(&Command::GetBlockIndexById { object_id })?;
        self.expect_success()?;
        let stream = self.protocol.receive_stream()?.read_to_vec()?;
        Ok(BlockIndex::from_stream_bytes(&stream)?)
    }

    /// Fetches the current version's block index by name, with its id.
    pub fn get_block_index_by_name(
        &mut self,
        dir_id: i64,
        filename: &StoreFilename,
    ) -> StoreResult<(i64, BlockIndex)> {
        self.protocol.send_command(&Command::GetBlockIndexByName {
            dir_id,
            filename: filename.as_bytes().to_vec(),
        })?;
        let object_id = self.expect_success()?;
        let stream = self.protocol.receive_stream()?.read_to_vec()?;
        Ok((object_id, BlockIndex::from_stream_bytes(&stream)?))
    }

    /// Lists a directory filtered by flag masks.
    pub fn list_directory(
        &mut self,
        dir_id: i64,
        flags_must_be_set: i16,
        flags_not_to_be_set: i16,
        send_attributes: bool,
    ) -> StoreResult<Directory> {
        self.protocol.send_command(&Command::ListDirectory {
            dir_id,
            flags_must_be_set,
            flags_not_to_be_set,
            send_attributes,
        })?;
        self.expect_success()?;
        let stream = self.protocol.receive_stream()?.read_to_vec()?;
        Directory::from_bytes(&stream)
    }

    /// Creates a sub-directory, returning its object id.
    pub fn create_directory(
        &mut self,
        dir_id: i64,
        attributes_mod_time: i64,
        dirname: &StoreFilename,
        attributes: &[u8],
    ) -> StoreResult<i64> {
        self.protocol.send_command(&Command::CreateDirectory {
            dir_id,
            attributes_mod_time,
            dirname: dirname.as_bytes().to_vec(),
            attributes: attributes.to_vec(),
        })?;
        self.expect_success()
    }

    /// Marks a name's versions deleted, returning the newest version's id.
    pub fn delete_file(&mut self, dir_id: i64, filename: &StoreFilename) -> StoreResult<i64> {
        self.protocol.send_command(&Command::DeleteFile {
            dir_id,
            filename: filename.as_bytes().to_vec(),
        })?;
        self.expect_success()
    }

    /// Clears the deleted mark on one version.
    pub fn undelete_file(&mut self, dir_id: i64, object_id: i64) -> StoreResult<()> {
        self.protocol
            .send_command(&Command::UndeleteFile { dir_id, object_id })?;
        self.expect_success().map(|_| ())
    }

    /// Recursively marks a directory deleted.
    pub fn delete_directory(&mut self, object_id: i64) -> StoreResult<()> {
        self.protocol
            .send_command(&Command::DeleteDirectory { object_id })?;
        self.expect_success().map(|_| ())
    }

    /// Reverses a recursive directory delete.
    pub fn undelete_directory(&mut self, object_id: i64) -> StoreResult<()> {
        self.protocol
            .send_command(&Command::UndeleteDirectory { object_id })?;
        self.expect_success().map(|_| ())
    }

    /// Moves (and/or renames) an object between directories.
    pub fn move_object(
        &mut self,
        object_id: i64,
        move_from: i64,
        move_to: i64,
        flags: i32,
        new_filename: &StoreFilename,
    ) -> StoreResult<()> {
        self.protocol.send_command(&Command::MoveObject {
            object_id,
            move_from,
            move_to,
            flags,
            new_filename: new_filename.as_bytes().to_vec(),
        })?;
        self.expect_success().map(|_| ())
    }

    /// Replaces a directory's attribute blob.
    pub fn change_dir_attributes(
        &mut self,
        object_id: i64,
        attributes_mod_time: i64,
        attributes: &[u8],
    ) -> StoreResult<()> {
        self.protocol.send_command(&Command::ChangeDirAttributes {
            object_id,
            attributes_mod_time,
            attributes: attributes.to_vec(),
        })?;
        self.expect_success().map(|_| ())
    }

    /// Replaces the attributes on the current entry of a name.
    pub fn set_replacement_file_attributes(
        &mut self,
        dir_id: i64,
        attributes_hash: i64,
        filename: &StoreFilename,
        attributes: &[u8],
    ) -> StoreResult<i64> {
        self.protocol
            .send_command(&Command::SetReplacementFileAttributes {
                dir_id,
                attributes_hash,
                filename: filename.as_bytes().to_vec(),
                attributes: attributes.to_vec(),
            })?;
        self.expect_success()
    }

    /// Reads the opaque client marker.
    pub fn get_client_store_marker(&mut self) -> StoreResult<i64> {
        self.protocol.send_command(&Command::GetClientStoreMarker)?;
        self.expect_success()
    }

    /// Sets the opaque client marker.
    pub fn set_client_store_marker(&mut self, marker: i64) -> StoreResult<()> {
        self.protocol
            .send_command(&Command::SetClientStoreMarker { marker })?;
        self.expect_success().map(|_| ())
    }

    /// Fetches the account's usage figures.
    pub fn get_account_usage(&mut self) -> StoreResult<protocol::AccountUsage> {
        self.protocol.send_command(&Command::GetAccountUsage)?;
        match self.protocol.receive_reply()? {
            Reply::AccountUsage(usage) => Ok(usage),
            Reply::Error {
                error_type,
                sub_type,
            } => Err(error_from_wire(error_type, sub_type)),
            other => Err(unexpected(&other)),
        }
    }

    /// Liveness probe.
    pub fn is_alive(&mut self) -> StoreResult<()> {
        self.protocol.send_command(&Command::GetIsAlive)?;
        match self.protocol.receive_reply()? {
            Reply::IsAlive => Ok(()),
            Reply::Error {
                error_type,
                sub_type,
            } => Err(error_from_wire(error_type, sub_type)),
            other => Err(unexpected(&other)),
        }
    }

    fn expect_success(&mut self) -> StoreResult<i64> {
        match self.protocol.receive_reply()? {
            Reply::Success { object_id } => Ok(object_id),
            Reply::Error {
                error_type,
                sub_type,
            } => Err(error_from_wire(error_type, sub_type)),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(reply: &Reply) -> StoreError {
    StoreError::Protocol(ProtocolError::UnexpectedReply(reply.type_tag()))
}

/// Maps a wire error envelope back onto a [`StoreError`]. The inverse of
/// the session's mapping, modulo detail lost on the wire.
#[must_use]
pub fn error_from_wire(error_type: i32, sub_type: i32) -> StoreError {
    use error_codes as ec;
    match (error_type, sub_type) {
        (ec::TYPE_SESSION, ec::SESSION_WRONG_PHASE) => StoreError::WrongPhase,
        (ec::TYPE_SESSION, ec::SESSION_LOGIN_FAILED) => StoreError::LoginFailed(0),
        (ec::TYPE_SESSION, ec::SESSION_ALREADY_LOCKED) => StoreError::AlreadyLocked,
        (ec::TYPE_SESSION, ec::SESSION_READ_ONLY) => StoreError::ReadOnly,
        (ec::TYPE_STORE, ec::STORE_OBJECT_DOES_NOT_EXIST) => StoreError::ObjectDoesNotExist(0),
        (ec::TYPE_STORE, ec::STORE_NAME_ALREADY_EXISTS) => StoreError::NameAlreadyExists(0),
        (ec::TYPE_STORE, ec::STORE_NOT_A_DIRECTORY) => StoreError::NotADirectory(0),
        (ec::TYPE_STORE, ec::STORE_NOT_A_FILE) => StoreError::NotAFile(0),
        (ec::TYPE_STORE, ec::STORE_DEPENDENCY_BROKEN) => StoreError::DependencyBroken(0),
        (ec::TYPE_STORE, ec::STORE_HMAC_MISMATCH) => {
            StoreError::Codec(filecodec::CodecError::HmacMismatch)
        }
        (ec::TYPE_QUOTA, ec::QUOTA_HARD_LIMIT_EXCEEDED) => StoreError::HardLimitExceeded,
        (ec::TYPE_INFRA, ec::INFRA_CORRUPT_INFO) => {
            StoreError::CorruptInfo("reported by server".into())
        }
        (ec::TYPE_INFRA, ec::INFRA_CORRUPT_REFCOUNT_DB) => {
            StoreError::CorruptRefCountDb("reported by server".into())
        }
        (error_type, sub_type) => StoreError::CorruptInfo(format!(
            "server error {error_type}/{sub_type}"
        )),
    }
}
