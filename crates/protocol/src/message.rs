//! The message catalogue: client commands and server replies.
//!
//! Every message has a stable integer tag carried in the frame header.
//! Commands and replies share one tag space so a trace of a connection is
//! unambiguous. Messages read and write their own fields through the codec
//! primitives; the enums dispatch on the tag.

use crate::codec::{MessageReader, MessageWriter};
use crate::error::{ProtocolError, ProtocolResult};

/// Flags accepted by [`Command::Login`].
pub mod login_flags {
    /// The session will not mutate the store and takes no write lock.
    pub const READ_ONLY: i32 = 0x1;
}

/// Entry-flag bitset used by `ListDirectory` masks and directory entries.
pub mod list_flags {
    /// Entry is a file version.
    pub const FILE: i16 = 1;
    /// Entry is a directory.
    pub const DIR: i16 = 2;
    /// Entry has been deleted.
    pub const DELETED: i16 = 4;
    /// Entry is an old (superseded) version.
    pub const OLD_VERSION: i16 = 8;
    /// Include mask accepting every entry.
    pub const INCLUDE_EVERYTHING: i16 = 0x7FFF;
    /// Exclude mask rejecting nothing.
    pub const EXCLUDE_NOTHING: i16 = 0;
}

/// Flags accepted by [`Command::MoveObject`].
pub mod move_flags {
    /// Move every version sharing the name, not just the given object.
    pub const MOVE_ALL_WITH_SAME_NAME: i32 = 0x1;
    /// Permit the move to land on a deleted entry of the same name.
    pub const ALLOW_MOVE_OVER_DELETED: i32 = 0x2;
}

/// The wire error catalogue (§ error envelope). Both peers agree on these
/// numbers; the session maps internal errors onto them.
pub mod error_codes {
    /// Transport-level failure.
    pub const TYPE_TRANSPORT: i32 = 1;
    /// Framing violation; always fatal.
    pub const TYPE_FRAMING: i32 = 2;
    /// Session state violation.
    pub const TYPE_SESSION: i32 = 3;
    /// Store-level failure; session usually survives.
    pub const TYPE_STORE: i32 = 4;
    /// Quota condition.
    pub const TYPE_QUOTA: i32 = 5;
    /// Infrastructure (disc) failure.
    pub const TYPE_INFRA: i32 = 6;

    /// Framing: object frame exceeded the size cap.
    pub const FRAMING_BAD_OBJECT_SIZE: i32 = 1;
    /// Framing: malformed stream chunk header.
    pub const FRAMING_BAD_STREAM_HEADER: i32 = 2;
    /// Framing: unknown message tag.
    pub const FRAMING_UNKNOWN_MESSAGE: i32 = 3;

    /// Session: command sent in the wrong phase.
    pub const SESSION_WRONG_PHASE: i32 = 1;
    /// Session: login rejected.
    pub const SESSION_LOGIN_FAILED: i32 = 2;
    /// Session: another session holds the account write lock.
    pub const SESSION_ALREADY_LOCKED: i32 = 3;
    /// Session: mutating command on a read-only session.
    pub const SESSION_READ_ONLY: i32 = 4;

    /// Store: no such object.
    pub const STORE_OBJECT_DOES_NOT_EXIST: i32 = 1;
    /// Store: name already taken by a current entry.
    pub const STORE_NAME_ALREADY_EXISTS: i32 = 2;
    /// Store: object is not a directory.
    pub const STORE_NOT_A_DIRECTORY: i32 = 3;
    /// Store: object is not a file.
    pub const STORE_NOT_A_FILE: i32 = 4;
    /// Store: delta dependency chain is broken.
    pub const STORE_DEPENDENCY_BROKEN: i32 = 5;
    /// Store: object failed authentication.
    pub const STORE_HMAC_MISMATCH: i32 = 6;

    /// Quota: advisory soft limit crossed.
    pub const QUOTA_SOFT_LIMIT_EXCEEDED: i32 = 1;
    /// Quota: hard limit would be exceeded; upload refused.
    pub const QUOTA_HARD_LIMIT_EXCEEDED: i32 = 2;

    /// Infrastructure: disc full.
    pub const INFRA_DISC_FULL: i32 = 1;
    /// Infrastructure: read error.
    pub const INFRA_DISC_READ_ERROR: i32 = 2;
    /// Infrastructure: striped set unrecoverable.
    pub const INFRA_DISC_UNRECOVERABLE: i32 = 3;
    /// Infrastructure: info blob corrupt.
    pub const INFRA_CORRUPT_INFO: i32 = 4;
    /// Infrastructure: refcount database corrupt.
    pub const INFRA_CORRUPT_REFCOUNT_DB: i32 = 5;
}

// Tag space. Replies live below 10, commands from 10 up.
const TAG_ERROR: u32 = 0;
const TAG_VERSION: u32 = 1;
const TAG_LOGIN: u32 = 2;
const TAG_FINISHED: u32 = 3;
const TAG_LOGIN_CONFIRMED: u32 = 4;
const TAG_SUCCESS: u32 = 5;
const TAG_IS_ALIVE: u32 = 6;
const TAG_ACCOUNT_USAGE: u32 = 7;

const TAG_LIST_DIRECTORY: u32 = 10;
const TAG_STORE_FILE: u32 = 11;
const TAG_GET_OBJECT: u32 = 12;
const TAG_GET_FILE: u32 = 13;
const TAG_CREATE_DIRECTORY: u32 = 14;
const TAG_CHANGE_DIR_ATTRIBUTES: u32 = 15;
const TAG_SET_REPLACEMENT_FILE_ATTRIBUTES: u32 = 16;
const TAG_DELETE_FILE: u32 = 17;
const TAG_UNDELETE_FILE: u32 = 18;
const TAG_DELETE_DIRECTORY: u32 = 19;
const TAG_UNDELETE_DIRECTORY: u32 = 20;
const TAG_MOVE_OBJECT: u32 = 21;
const TAG_GET_BLOCK_INDEX_BY_ID: u32 = 22;
const TAG_GET_BLOCK_INDEX_BY_NAME: u32 = 23;
const TAG_GET_CLIENT_STORE_MARKER: u32 = 24;
const TAG_SET_CLIENT_STORE_MARKER: u32 = 25;
const TAG_GET_ACCOUNT_USAGE: u32 = 26;
const TAG_GET_IS_ALIVE: u32 = 27;

/// Account usage figures returned by `GetAccountUsage`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccountUsage {
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
    /// RAID block size the figures are counted in.
    pub block_size: i32,
}

/// Client → server messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Opens the exchange and states the protocol version.
    Version {
        /// Client's protocol version.
        version: i32,
    },
    /// Binds the session to an account.
    Login {
        /// Account to log in to.
        account_id: i32,
        /// [`login_flags`] bitset.
        flags: i32,
    },
    /// Ends the session cleanly.
    Finished,
    /// Requests a directory listing as a stream.
    ListDirectory {
        /// Directory object to list.
        dir_id: i64,
        /// Entries must have all these flags set ([`list_flags`]).
        flags_must_be_set: i16,
        /// Entries must have none of these flags set.
        flags_not_to_be_set: i16,
        /// Include per-entry attribute blobs in the stream.
        send_attributes: bool,
    },
    /// Uploads a file version; an object stream follows.
    StoreFile {
        /// Directory to add the file to.
        dir_id: i64,
        /// Client-side modification time.
        modification_time: i64,
        /// Fingerprint of content + metadata.
        attributes_hash: i64,
        /// Base version for delta encoding, or 0 for a full upload.
        diff_from_file_id: i64,
        /// Opaque encrypted filename.
        filename: Vec<u8>,
        /// Mark existing entries of the same name as old versions.
        mark_same_name_as_old: bool,
    },
    /// Fetches any object's raw encoded bytes (admin).
    GetObject {
        /// Object to fetch.
        object_id: i64,
    },
    /// Fetches a file version, verifying it lives in `dir_id`.
    GetFile {
        /// Directory the file is expected in.
        dir_id: i64,
        /// File version to fetch.
        object_id: i64,
    },
    /// Creates a sub-directory.
    CreateDirectory {
        /// Parent directory.
        dir_id: i64,
        /// Modification time of the attributes.
        attributes_mod_time: i64,
        /// Opaque encrypted directory name.
        dirname: Vec<u8>,
        /// Attribute blob for the new directory.
        attributes: Vec<u8>,
    },
    /// Replaces a directory's attribute blob.
    ChangeDirAttributes {
        /// Directory to change.
        object_id: i64,
        /// Modification time of the attributes.
        attributes_mod_time: i64,
        /// New attribute blob.
        attributes: Vec<u8>,
    },
    /// Replaces the attributes on the current file entry of a name.
    SetReplacementFileAttributes {
        /// Directory holding the entry.
        dir_id: i64,
        /// New content+metadata fingerprint.
        attributes_hash: i64,
        /// Name of the entry.
        filename: Vec<u8>,
        /// New attribute blob.
        attributes: Vec<u8>,
    },
    /// Marks the current version of a name as deleted.
    DeleteFile {
        /// Directory holding the entry.
        dir_id: i64,
        /// Name to delete.
        filename: Vec<u8>,
    },
    /// Removes the deleted mark from a file version.
    UndeleteFile {
        /// Directory holding the entry.
        dir_id: i64,
        /// Object to undelete.
        object_id: i64,
    },
    /// Marks a directory (recursively) as deleted.
    DeleteDirectory {
        /// Directory object to delete.
        object_id: i64,
    },
    /// Reverses a recursive directory delete.
    UndeleteDirectory {
        /// Directory object to undelete.
        object_id: i64,
    },
    /// Moves an object between directories and/or renames it.
    MoveObject {
        /// Object to move.
        object_id: i64,
        /// Directory it currently lives in.
        move_from: i64,
        /// Destination directory.
        move_to: i64,
        /// [`move_flags`] bitset.
        flags: i32,
        /// Name in the destination directory.
        new_filename: Vec<u8>,
    },
    /// Fetches the block index of a file version by object id.
    GetBlockIndexById {
        /// File version.
        object_id: i64,
    },
    /// Fetches the block index of the current version of a name.
    GetBlockIndexByName {
        /// Directory holding the entry.
        dir_id: i64,
        /// Name to look up.
        filename: Vec<u8>,
    },
    /// Reads the opaque client marker.
    GetClientStoreMarker,
    /// Sets the opaque client marker.
    SetClientStoreMarker {
        /// New marker value, owned by the client.
        marker: i64,
    },
    /// Requests usage figures.
    GetAccountUsage,
    /// Liveness probe.
    GetIsAlive,
}

impl Command {
    /// The frame type tag for this message.
    #[must_use]
    pub fn type_tag(&self) -> u32 {
        match self {
            Self::Version { .. } => TAG_VERSION,
            Self::Login { .. } => TAG_LOGIN,
            Self::Finished => TAG_FINISHED,
            Self::ListDirectory { .. } => TAG_LIST_DIRECTORY,
            Self::StoreFile { .. } => TAG_STORE_FILE,
            Self::GetObject { .. } => TAG_GET_OBJECT,
            Self::GetFile { .. } => TAG_GET_FILE,
            Self::CreateDirectory { .. } => TAG_CREATE_DIRECTORY,
            Self::ChangeDirAttributes { .. } => TAG_CHANGE_DIR_ATTRIBUTES,
            Self::SetReplacementFileAttributes { .. } => TAG_SET_REPLACEMENT_FILE_ATTRIBUTES,
            Self::DeleteFile { .. } => TAG_DELETE_FILE,
            Self::UndeleteFile { .. } => TAG_UNDELETE_FILE,
            Self::DeleteDirectory { .. } => TAG_DELETE_DIRECTORY,
            Self::UndeleteDirectory { .. } => TAG_UNDELETE_DIRECTORY,
            Self::MoveObject { .. } => TAG_MOVE_OBJECT,
            Self::GetBlockIndexById { .. } => TAG_GET_BLOCK_INDEX_BY_ID,
            Self::GetBlockIndexByName { .. } => TAG_GET_BLOCK_INDEX_BY_NAME,
            Self::GetClientStoreMarker => TAG_GET_CLIENT_STORE_MARKER,
            Self::SetClientStoreMarker { .. } => TAG_SET_CLIENT_STORE_MARKER,
            Self::GetAccountUsage => TAG_GET_ACCOUNT_USAGE,
            Self::GetIsAlive => TAG_GET_IS_ALIVE,
        }
    }

    /// Serialises the message fields into `writer`.
    pub fn write_fields(&self, writer: &mut MessageWriter) {
        match self {
            Self::Version { version } => writer.put_i32(*version),
            Self::Login { account_id, flags } => {
                writer.put_i32(*account_id);
                writer.put_i32(*flags);
            }
            Self::Finished
            | Self::GetClientStoreMarker
            | Self::GetAccountUsage
            | Self::GetIsAlive => {}
            Self::ListDirectory {
                dir_id,
                flags_must_be_set,
                flags_not_to_be_set,
                send_attributes,
            } => {
                writer.put_i64(*dir_id);
                writer.put_i16(*flags_must_be_set);
                writer.put_i16(*flags_not_to_be_set);
                writer.put_bool(*send_attributes);
            }
            Self::StoreFile {
                dir_id,
                modification_time,
                attributes_hash,
                diff_from_file_id,
                filename,
                mark_same_name_as_old,
            } => {
                writer.put_i64(*dir_id);
                writer.put_i64(*modification_time);
                writer.put_i64(*attributes_hash);
                writer.put_i64(*diff_from_file_id);
                writer.put_bytes(filename);
                writer.put_bool(*mark_same_name_as_old);
            }
            Self::GetObject { object_id }
            | Self::DeleteDirectory { object_id }
            | Self::UndeleteDirectory { object_id }
            | Self::GetBlockIndexById { object_id } => writer.put_i64(*object_id),
            Self::GetFile { dir_id, object_id } | Self::UndeleteFile { dir_id, object_id } => {
                writer.put_i64(*dir_id);
                writer.put_i64(*object_id);
            }
            Self::CreateDirectory {
                dir_id,
                attributes_mod_time,
                dirname,
                attributes,
            } => {
                writer.put_i64(*dir_id);
                writer.put_i64(*attributes_mod_time);
                writer.put_bytes(dirname);
                writer.put_bytes(attributes);
            }
            Self::ChangeDirAttributes {
                object_id,
                attributes_mod_time,
                attributes,
            } => {
                writer.put_i64(*object_id);
                writer.put_i64(*attributes_mod_time);
                writer.put_bytes(attributes);
            }
            Self::SetReplacementFileAttributes {
                dir_id,
                attributes_hash,
                filename,
                attributes,
            } => {
                writer.put_i64(*dir_id);
                writer.put_i64(*attributes_hash);
                writer.put_bytes(filename);
                writer.put_bytes(attributes);
            }
            Self::DeleteFile { dir_id, filename }
            | Self::GetBlockIndexByName { dir_id, filename } => {
                writer.put_i64(*dir_id);
                writer.put_bytes(filename);
            }
            Self::MoveObject {
                object_id,
                move_from,
                move_to,
                flags,
                new_filename,
            } => {
                writer.put_i64(*object_id);
                writer.put_i64(*move_from);
                writer.put_i64(*move_to);
                writer.put_i32(*flags);
                writer.put_bytes(new_filename);
            }
            Self::SetClientStoreMarker { marker } => writer.put_i64(*marker),
        }
    }

    /// Parses a command with the given frame tag from `reader`.
    pub fn read_fields(tag: u32, reader: &mut MessageReader<'_>) -> ProtocolResult<Self> {
        let command = match tag {
            TAG_VERSION => Self::Version {
                version: reader.get_i32()?,
            },
            TAG_LOGIN => Self::Login {
                account_id: reader.get_i32()?,
                flags: reader.get_i32()?,
            },
            TAG_FINISHED => Self::Finished,
            TAG_LIST_DIRECTORY => Self::ListDirectory {
                dir_id: reader.get_i64()?,
                flags_must_be_set: reader.get_i16()?,
                flags_not_to_be_set: reader.get_i16()?,
                send_attributes: reader.get_bool()?,
            },
            TAG_STORE_FILE => Self::StoreFile {
                dir_id: reader.get_i64()?,
                modification_time: reader.get_i64()?,
                attributes_hash: reader.get_i64()?,
                diff_from_file_id: reader.get_i64()?,
                filename: reader.get_bytes()?,
                mark_same_name_as_old: reader.get_bool()?,
            },
            TAG_GET_OBJECT => Self::GetObject {
                object_id: reader.get_i64()?,
            },
            TAG_GET_FILE => Self::GetFile {
                dir_id: reader.get_i64()?,
                object_id: reader.get_i64()?,
            },
            TAG_CREATE_DIRECTORY => Self::CreateDirectory {
                dir_id: reader.get_i64()?,
                attributes_mod_time: reader.get_i64()?,
                dirname: reader.get_bytes()?,
                attributes: reader.get_bytes()?,
            },
            TAG_CHANGE_DIR_ATTRIBUTES => Self::ChangeDirAttributes {
                object_id: reader.get_i64()?,
                attributes_mod_time: reader.get_i64()?,
                attributes: reader.get_bytes()?,
            },
            TAG_SET_REPLACEMENT_FILE_ATTRIBUTES => Self::SetReplacementFileAttributes {
                dir_id: reader.get_i64()?,
                attributes_hash: reader.get_i64()?,
                filename: reader.get_bytes()?,
                attributes: reader.get_bytes()?,
            },
            TAG_DELETE_FILE => Self::DeleteFile {
                dir_id: reader.get_i64()?,
                filename: reader.get_bytes()?,
            },
            TAG_UNDELETE_FILE => Self::UndeleteFile {
                dir_id: reader.get_i64()?,
                object_id: reader.get_i64()?,
            },
            TAG_DELETE_DIRECTORY => Self::DeleteDirectory {
                object_id: reader.get_i64()?,
            },
            TAG_UNDELETE_DIRECTORY => Self::UndeleteDirectory {
                object_id: reader.get_i64()?,
            },
            TAG_MOVE_OBJECT => Self::MoveObject {
                object_id: reader.get_i64()?,
                move_from: reader.get_i64()?,
                move_to: reader.get_i64()?,
                flags: reader.get_i32()?,
                new_filename: reader.get_bytes()?,
            },
            TAG_GET_BLOCK_INDEX_BY_ID => Self::GetBlockIndexById {
                object_id: reader.get_i64()?,
            },
            TAG_GET_BLOCK_INDEX_BY_NAME => Self::GetBlockIndexByName {
                dir_id: reader.get_i64()?,
                filename: reader.get_bytes()?,
            },
            TAG_GET_CLIENT_STORE_MARKER => Self::GetClientStoreMarker,
            TAG_SET_CLIENT_STORE_MARKER => Self::SetClientStoreMarker {
                marker: reader.get_i64()?,
            },
            TAG_GET_ACCOUNT_USAGE => Self::GetAccountUsage,
            TAG_GET_IS_ALIVE => Self::GetIsAlive,
            other => return Err(ProtocolError::UnknownCommand(other)),
        };
        Ok(command)
    }
}

/// Server → client messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Error envelope; the only payload is the two catalogue numbers.
    Error {
        /// [`error_codes`] type.
        error_type: i32,
        /// [`error_codes`] subtype.
        sub_type: i32,
    },
    /// Version echo closing the version exchange.
    Version {
        /// Server's protocol version.
        version: i32,
    },
    /// Successful login, with the account's headline figures.
    LoginConfirmed {
        /// Whether the session ended up read-only.
        read_only: bool,
        /// Current opaque client marker.
        client_store_marker: i64,
        /// Blocks currently charged to the account.
        blocks_used: i64,
        /// Advisory soft limit.
        blocks_soft_limit: i64,
        /// Enforced hard limit.
        blocks_hard_limit: i64,
    },
    /// Generic success carrying the object id the command produced or
    /// operated on.
    Success {
        /// Relevant object id (0 where none applies).
        object_id: i64,
    },
    /// Liveness reply.
    IsAlive,
    /// Usage figures.
    AccountUsage(AccountUsage),
}

impl Reply {
    /// The frame type tag for this message.
    #[must_use]
    pub fn type_tag(&self) -> u32 {
        match self {
            Self::Error { .. } => TAG_ERROR,
            Self::Version { .. } => TAG_VERSION,
            Self::LoginConfirmed { .. } => TAG_LOGIN_CONFIRMED,
            Self::Success { .. } => TAG_SUCCESS,
            Self::IsAlive => TAG_IS_ALIVE,
            Self::AccountUsage(_) => TAG_ACCOUNT_USAGE,
        }
    }

    /// Serialises the message fields into `writer`.
    pub fn write_fields(&self, writer: &mut MessageWriter) {
        match self {
            Self::Error {
                error_type,
                sub_type,
            } => {
                writer.put_i32(*error_type);
                writer.put_i32(*sub_type);
            }
            Self::Version { version } => writer.put_i32(*version),
            Self::LoginConfirmed {
                read_only,
                client_store_marker,
                blocks_used,
                blocks_soft_limit,
                blocks_hard_limit,
            } => {
                writer.put_bool(*read_only);
                writer.put_i64(*client_store_marker);
                writer.put_i64(*blocks_used);
                writer.put_i64(*blocks_soft_limit);
                writer.put_i64(*blocks_hard_limit);
            }
            Self::Success { object_id } => writer.put_i64(*object_id),
            Self::IsAlive => {}
            Self::AccountUsage(usage) => {
                writer.put_i64(usage.blocks_used);
                writer.put_i64(usage.blocks_in_old_files);
                writer.put_i64(usage.blocks_in_deleted_files);
                writer.put_i64(usage.blocks_in_directories);
                writer.put_i64(usage.blocks_soft_limit);
                writer.put_i64(usage.blocks_hard_limit);
                writer.put_i32(usage.block_size);
            }
        }
    }

    /// Parses a reply with the given frame tag from `reader`.
    pub fn read_fields(tag: u32, reader: &mut MessageReader<'_>) -> ProtocolResult<Self> {
        let reply = match tag {
            TAG_ERROR => Self::Error {
                error_type: reader.get_i32()?,
                sub_type: reader.get_i32()?,
            },
            TAG_VERSION => Self::Version {
                version: reader.get_i32()?,
            },
            TAG_LOGIN_CONFIRMED => Self::LoginConfirmed {
                read_only: reader.get_bool()?,
                client_store_marker: reader.get_i64()?,
                blocks_used: reader.get_i64()?,
                blocks_soft_limit: reader.get_i64()?,
                blocks_hard_limit: reader.get_i64()?,
            },
            TAG_SUCCESS => Self::Success {
                object_id: reader.get_i64()?,
            },
            TAG_IS_ALIVE => Self::IsAlive,
            TAG_ACCOUNT_USAGE => Self::AccountUsage(AccountUsage {
                blocks_used: reader.get_i64()?,
                blocks_in_old_files: reader.get_i64()?,
                blocks_in_deleted_files: reader.get_i64()?,
                blocks_in_directories: reader.get_i64()?,
                blocks_soft_limit: reader.get_i64()?,
                blocks_hard_limit: reader.get_i64()?,
                block_size: reader.get_i32()?,
            }),
            other => return Err(ProtocolError::UnexpectedReply(other)),
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_command(command: &Command) -> Command {
        let mut writer = MessageWriter::new();
        command.write_fields(&mut writer);
        let payload = writer.into_payload();
        let mut reader = MessageReader::new(&payload);
        let parsed = Command::read_fields(command.type_tag(), &mut reader).unwrap();
        reader.finish().unwrap();
        parsed
    }

    fn round_trip_reply(reply: &Reply) -> Reply {
        let mut writer = MessageWriter::new();
        reply.write_fields(&mut writer);
        let payload = writer.into_payload();
        let mut reader = MessageReader::new(&payload);
        let parsed = Reply::read_fields(reply.type_tag(), &mut reader).unwrap();
        reader.finish().unwrap();
        parsed
    }

    #[test]
    fn every_command_round_trips() {
        let commands = [
            Command::Version { version: 1 },
            Command::Login {
                account_id: 0x0123_4567,
                flags: login_flags::READ_ONLY,
            },
            Command::Finished,
            Command::ListDirectory {
                dir_id: 1,
                flags_must_be_set: list_flags::FILE,
                flags_not_to_be_set: list_flags::DELETED | list_flags::OLD_VERSION,
                send_attributes: true,
            },
            Command::StoreFile {
                dir_id: 1,
                modification_time: 10,
                attributes_hash: -7,
                diff_from_file_id: 0,
                filename: b"a".to_vec(),
                mark_same_name_as_old: true,
            },
            Command::GetObject { object_id: 42 },
            Command::GetFile {
                dir_id: 1,
                object_id: 2,
            },
            Command::CreateDirectory {
                dir_id: 1,
                attributes_mod_time: 5,
                dirname: b"photos".to_vec(),
                attributes: vec![1, 2, 3],
            },
            Command::ChangeDirAttributes {
                object_id: 3,
                attributes_mod_time: 6,
                attributes: vec![],
            },
            Command::SetReplacementFileAttributes {
                dir_id: 1,
                attributes_hash: 9,
                filename: b"a".to_vec(),
                attributes: vec![9, 9],
            },
            Command::DeleteFile {
                dir_id: 1,
                filename: b"a".to_vec(),
            },
            Command::UndeleteFile {
                dir_id: 1,
                object_id: 2,
            },
            Command::DeleteDirectory { object_id: 3 },
            Command::UndeleteDirectory { object_id: 3 },
            Command::MoveObject {
                object_id: 2,
                move_from: 1,
                move_to: 3,
                flags: move_flags::MOVE_ALL_WITH_SAME_NAME,
                new_filename: b"b".to_vec(),
            },
            Command::GetBlockIndexById { object_id: 2 },
            Command::GetBlockIndexByName {
                dir_id: 1,
                filename: b"a".to_vec(),
            },
            Command::GetClientStoreMarker,
            Command::SetClientStoreMarker { marker: i64::MIN },
            Command::GetAccountUsage,
            Command::GetIsAlive,
        ];
        for command in commands {
            assert_eq!(round_trip_command(&command), command);
        }
    }

    #[test]
    fn every_reply_round_trips() {
        let replies = [
            Reply::Error {
                error_type: error_codes::TYPE_QUOTA,
                sub_type: error_codes::QUOTA_HARD_LIMIT_EXCEEDED,
            },
            Reply::Version { version: 1 },
            Reply::LoginConfirmed {
                read_only: false,
                client_store_marker: 0,
                blocks_used: 1,
                blocks_soft_limit: 1000,
                blocks_hard_limit: 2000,
            },
            Reply::Success { object_id: 2 },
            Reply::IsAlive,
            Reply::AccountUsage(AccountUsage {
                blocks_used: 10,
                blocks_in_old_files: 1,
                blocks_in_deleted_files: 2,
                blocks_in_directories: 3,
                blocks_soft_limit: 100,
                blocks_hard_limit: 200,
                block_size: 4096,
            }),
        ];
        for reply in replies {
            assert_eq!(round_trip_reply(&reply), reply);
        }
    }

    #[test]
    fn unknown_command_tag_is_rejected() {
        let mut reader = MessageReader::new(&[]);
        assert!(matches!(
            Command::read_fields(9999, &mut reader),
            Err(ProtocolError::UnknownCommand(9999))
        ));
    }

    #[test]
    fn command_tags_are_distinct_from_reply_tags() {
        // Replies occupy tags < 10 (bar Version, which both sides send);
        // commands sit at 10 and above, plus the three session-control
        // messages. A collision here would corrupt dispatch.
        let reply_tags = [0u32, 1, 4, 5, 6, 7];
        let command_only_tags: Vec<u32> = (10..=27).collect();
        for tag in &command_only_tags {
            assert!(!reply_tags.contains(tag));
        }
    }
}
