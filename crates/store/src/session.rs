//! The per-connection command loop.
//!
//! Phases run `Version → Login → Commands → end`. Failures before the
//! commands phase are fatal to the session; store errors inside the
//! commands phase are reported through the wire error envelope and the
//! session continues, except for corruption and infrastructure failures.

use tracing::{debug, error, info, warn};

use protocol::{error_codes, Command, Protocol, ProtocolError, Reply, StreamSize};
use transport::{Connection, ShutdownHow};

use crate::accounts::AccountDatabase;
use crate::context::{CommandHook, Housekeeping, StoreContext};
use crate::error::{StoreError, StoreResult};
use crate::filename::StoreFilename;
use crate::PROTOCOL_VERSION;

use raidfile::RaidController;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Version,
    Login,
    Commands,
}

/// One server-side session over an accepted connection.
pub struct Session<'a, S: Connection> {
    protocol: Protocol<S>,
    controller: &'a RaidController,
    accounts: &'a AccountDatabase,
    context: Option<StoreContext>,
    housekeeping: Option<Box<dyn Housekeeping>>,
    command_hook: Option<Box<dyn CommandHook>>,
    phase: Phase,
}

impl<'a, S: Connection> Session<'a, S> {
    /// Wraps an accepted connection.
    pub fn new(
        connection: S,
        controller: &'a RaidController,
        accounts: &'a AccountDatabase,
    ) -> Self {
        Self {
            protocol: Protocol::new(connection),
            controller,
            accounts,
            context: None,
            housekeeping: None,
            command_hook: None,
            phase: Phase::Version,
        }
    }

    /// Attaches the housekeeping channel handed to the context at login.
    #[must_use]
    pub fn with_housekeeping(mut self, housekeeping: Box<dyn Housekeeping>) -> Self {
        self.housekeeping = Some(housekeeping);
        self
    }

    /// Installs the test command hook.
    #[must_use]
    pub fn with_command_hook(mut self, hook: Box<dyn CommandHook>) -> Self {
        self.command_hook = Some(hook);
        self
    }

    /// Runs the session to completion. Returns `Ok` for a clean end
    /// (including client disconnect); `Err` only for failures worth a
    /// daemon-level log.
    pub fn run(mut self) -> StoreResult<()> {
        let outcome = self.run_loop();
        if let Some(context) = self.context.as_mut() {
            if let Err(err) = context.finish() {
                error!(account = context.account_id(), %err, "flushing session state failed");
            }
        }
        let _ = self.protocol.stream_mut().shutdown(ShutdownHow::Both);
        outcome
    }

    fn run_loop(&mut self) -> StoreResult<()> {
        loop {
            let command = match self.protocol.receive_command() {
                Ok(command) => command,
                Err(ProtocolError::ConnectionClosed) => {
                    // Disconnect unwinds the command in progress; any
                    // staging files are left for housekeeping.
                    debug!("peer closed the connection");
                    return Ok(());
                }
                Err(err @ ProtocolError::ObjectTooBig { .. }) => {
                    warn!(%err, "rejecting oversized frame");
                    let _ = self.protocol.send_reply(&Reply::Error {
                        error_type: error_codes::TYPE_FRAMING,
                        sub_type: error_codes::FRAMING_BAD_OBJECT_SIZE,
                    });
                    return Ok(());
                }
                Err(err @ ProtocolError::UnknownCommand(_)) => {
                    warn!(%err, "unknown message type");
                    let _ = self.protocol.send_reply(&Reply::Error {
                        error_type: error_codes::TYPE_FRAMING,
                        sub_type: error_codes::FRAMING_UNKNOWN_MESSAGE,
                    });
                    return Ok(());
                }
                Err(err) => {
                    warn!(%err, "protocol failure, ending session");
                    return Ok(());
                }
            };

            match self.phase {
                Phase::Version => {
                    if !self.handle_version(&command)? {
                        return Ok(());
                    }
                }
                Phase::Login => {
                    if !self.handle_login(&command)? {
                        return Ok(());
                    }
                }
                Phase::Commands => match self.handle_command(command) {
                    Ok(true) => {}
                    Ok(false) => return Ok(()),
                    Err(err) => {
                        let fatal = err.is_fatal();
                        let context = self.context.as_ref().expect("commands phase");
                        if fatal {
                            error!(
                                account = context.account_id(),
                                %err,
                                "fatal store error, ending session"
                            );
                        } else {
                            debug!(account = context.account_id(), %err, "command failed");
                        }
                        let (error_type, sub_type) = wire_error(&err);
                        self.protocol.send_reply(&Reply::Error {
                            error_type,
                            sub_type,
                        })?;
                        if fatal {
                            return Ok(());
                        }
                    }
                },
            }
        }
    }

    fn handle_version(&mut self, command: &Command) -> StoreResult<bool> {
        match command {
            Command::Version { version } if *version == PROTOCOL_VERSION => {
                self.protocol.send_reply(&Reply::Version {
                    version: PROTOCOL_VERSION,
                })?;
                self.phase = Phase::Login;
                Ok(true)
            }
            Command::Version { version } => {
                warn!(version, "unacceptable protocol version");
                self.protocol.send_reply(&Reply::Error {
                    error_type: error_codes::TYPE_SESSION,
                    sub_type: error_codes::SESSION_LOGIN_FAILED,
                })?;
                Ok(false)
            }
            _ => {
                self.protocol.send_reply(&Reply::Error {
                    error_type: error_codes::TYPE_SESSION,
                    sub_type: error_codes::SESSION_WRONG_PHASE,
                })?;
                Ok(false)
            }
        }
    }

    fn handle_login(&mut self, command: &Command) -> StoreResult<bool> {
        let Command::Login { account_id, flags } = command else {
            self.protocol.send_reply(&Reply::Error {
                error_type: error_codes::TYPE_SESSION,
                sub_type: error_codes::SESSION_WRONG_PHASE,
            })?;
            return Ok(false);
        };
        let read_only = flags & protocol::login_flags::READ_ONLY != 0;
        match StoreContext::open(self.controller, self.accounts, *account_id, read_only) {
            Ok(mut context) => {
                if let Some(housekeeping) = self.housekeeping.take() {
                    context.set_housekeeping(housekeeping);
                }
                if let Some(hook) = self.command_hook.take() {
                    context.set_command_hook(hook);
                }
                let info = context.store_info();
                self.protocol.send_reply(&Reply::LoginConfirmed {
                    read_only,
                    client_store_marker: info.client_store_marker,
                    blocks_used: info.blocks_used,
                    blocks_soft_limit: info.blocks_soft_limit,
                    blocks_hard_limit: info.blocks_hard_limit,
                })?;
                info!(
                    account = format!("{account_id:#010x}"),
                    read_only, "session logged in"
                );
                self.context = Some(context);
                self.phase = Phase::Commands;
                Ok(true)
            }
            Err(err) => {
                warn!(
                    account = format!("{account_id:#010x}"),
                    %err,
                    "login refused"
                );
                let (error_type, sub_type) = wire_error(&err);
                self.protocol.send_reply(&Reply::Error {
                    error_type,
                    sub_type,
                })?;
                // Any failure from login onward is fatal to the session.
                Ok(false)
            }
        }
    }

    /// Handles one commands-phase message. `Ok(false)` ends the session.
    fn handle_command(&mut self, command: Command) -> StoreResult<bool> {
        let context = self.context.as_mut().expect("commands phase");
        if let Some(reply) = context.start_command_hook(&command) {
            self.protocol.send_reply(&reply)?;
            return Ok(true);
        }
        match command {
            Command::Finished => {
                self.protocol.send_reply(&Reply::Success { object_id: 0 })?;
                info!(account = context.account_id(), "session finished");
                Ok(false)
            }
            Command::GetIsAlive => {
                self.protocol.send_reply(&Reply::IsAlive)?;
                Ok(true)
            }
            Command::ListDirectory {
                dir_id,
                flags_must_be_set,
                flags_not_to_be_set,
                send_attributes,
            } => {
                let listing = context.list_directory(
                    dir_id,
                    flags_must_be_set as u16,
                    flags_not_to_be_set as u16,
                    send_attributes,
                )?;
                self.protocol.send_reply(&Reply::Success { object_id: dir_id })?;
                self.protocol.send_stream(
                    &mut listing.as_slice(),
                    StreamSize::Exact(listing.len() as u64),
                )?;
                Ok(true)
            }
            Command::StoreFile {
                dir_id,
                modification_time,
                attributes_hash,
                diff_from_file_id,
                filename,
                mark_same_name_as_old,
            } => {
                let mut stream = self.protocol.receive_stream()?;
                let result = context.add_file(
                    dir_id,
                    modification_time,
                    attributes_hash,
                    diff_from_file_id,
                    &StoreFilename::new(filename),
                    mark_same_name_as_old,
                    &mut stream,
                );
                // Whatever happened, the announced stream must be fully
                // consumed before the next frame.
                let mut sink = [0u8; 8192];
                while matches!(stream.read_some(&mut sink), Ok(n) if n > 0) {}
                let object_id = result?;
                self.protocol.send_reply(&Reply::Success { object_id })?;
                Ok(true)
            }
            Command::GetObject { object_id } => {
                let bytes = context.open_object(object_id)?;
                self.protocol.send_reply(&Reply::Success { object_id })?;
                self.protocol
                    .send_stream(&mut bytes.as_slice(), StreamSize::Exact(bytes.len() as u64))?;
                Ok(true)
            }
            Command::GetFile { dir_id, object_id } => {
                let bytes = context.open_file_combined(dir_id, object_id)?;
                self.protocol.send_reply(&Reply::Success { object_id })?;
                self.protocol
                    .send_stream(&mut bytes.as_slice(), StreamSize::Exact(bytes.len() as u64))?;
                Ok(true)
            }
            Command::CreateDirectory {
                dir_id,
                attributes_mod_time,
                dirname,
                attributes,
            } => {
                let (_existed, object_id) = context.add_directory(
                    dir_id,
                    &StoreFilename::new(dirname),
                    &attributes,
                    attributes_mod_time,
                )?;
                self.protocol.send_reply(&Reply::Success { object_id })?;
                Ok(true)
            }
            Command::ChangeDirAttributes {
                object_id,
                attributes_mod_time,
                attributes,
            } => {
                context.change_dir_attributes(object_id, &attributes, attributes_mod_time)?;
                self.protocol.send_reply(&Reply::Success { object_id })?;
                Ok(true)
            }
            Command::SetReplacementFileAttributes {
                dir_id,
                attributes_hash,
                filename,
                attributes,
            } => {
                let object_id = context.change_file_attributes(
                    dir_id,
                    &StoreFilename::new(filename),
                    &attributes,
                    attributes_hash,
                )?;
                self.protocol.send_reply(&Reply::Success { object_id })?;
                Ok(true)
            }
            Command::DeleteFile { dir_id, filename } => {
                let object_id = context.delete_file(dir_id, &StoreFilename::new(filename))?;
                self.protocol.send_reply(&Reply::Success { object_id })?;
                Ok(true)
            }
            Command::UndeleteFile { dir_id, object_id } => {
                context.undelete_file(dir_id, object_id)?;
                self.protocol.send_reply(&Reply::Success { object_id })?;
                Ok(true)
            }
            Command::DeleteDirectory { object_id } => {
                context.delete_directory(object_id, false)?;
                self.protocol.send_reply(&Reply::Success { object_id })?;
                Ok(true)
            }
            Command::UndeleteDirectory { object_id } => {
                context.delete_directory(object_id, true)?;
                self.protocol.send_reply(&Reply::Success { object_id })?;
                Ok(true)
            }
            Command::MoveObject {
                object_id,
                move_from,
                move_to,
                flags,
                new_filename,
            } => {
                context.move_object(
                    object_id,
                    move_from,
                    move_to,
                    &StoreFilename::new(new_filename),
                    flags & protocol::move_flags::MOVE_ALL_WITH_SAME_NAME != 0,
                    flags & protocol::move_flags::ALLOW_MOVE_OVER_DELETED != 0,
                )?;
                self.protocol.send_reply(&Reply::Success { object_id })?;
                Ok(true)
            }
            Command::GetBlockIndexById { object_id } => {
                let index = context.get_block_index_by_id(object_id)?;
                self.protocol.send_reply(&Reply::Success { object_id })?;
                self.protocol
                    .send_stream(&mut index.as_slice(), StreamSize::Exact(index.len() as u64))?;
                Ok(true)
            }
            Command::GetBlockIndexByName { dir_id, filename } => {
                let (object_id, index) =
                    context.get_block_index_by_name(dir_id, &StoreFilename::new(filename))?;
                self.protocol.send_reply(&Reply::Success { object_id })?;
                self.protocol
                    .send_stream(&mut index.as_slice(), StreamSize::Exact(index.len() as u64))?;
                Ok(true)
            }
            Command::GetClientStoreMarker => {
                let marker = context.client_store_marker();
                self.protocol.send_reply(&Reply::Success { object_id: marker })?;
                Ok(true)
            }
            Command::SetClientStoreMarker { marker } => {
                context.set_client_store_marker(marker)?;
                self.protocol.send_reply(&Reply::Success { object_id: marker })?;
                Ok(true)
            }
            Command::GetAccountUsage => {
                let info = context.store_info();
                let usage = protocol::AccountUsage {
                    blocks_used: info.blocks_used,
                    blocks_in_old_files: info.blocks_in_old_files,
                    blocks_in_deleted_files: info.blocks_in_deleted_files,
                    blocks_in_directories: info.blocks_in_directories,
                    blocks_soft_limit: info.blocks_soft_limit,
                    blocks_hard_limit: info.blocks_hard_limit,
                    block_size: context.block_size() as i32,
                };
                self.protocol.send_reply(&Reply::AccountUsage(usage))?;
                Ok(true)
            }
            Command::Version { .. } | Command::Login { .. } => {
                self.protocol.send_reply(&Reply::Error {
                    error_type: error_codes::TYPE_SESSION,
                    sub_type: error_codes::SESSION_WRONG_PHASE,
                })?;
                Ok(true)
            }
        }
    }
}

/// Maps a store error onto the wire catalogue.
fn wire_error(err: &StoreError) -> (i32, i32) {
    use error_codes as ec;
    match err {
        StoreError::WrongPhase => (ec::TYPE_SESSION, ec::SESSION_WRONG_PHASE),
        StoreError::LoginFailed(_) | StoreError::AccountDoesNotExist(_) => {
            (ec::TYPE_SESSION, ec::SESSION_LOGIN_FAILED)
        }
        StoreError::AlreadyLocked => (ec::TYPE_SESSION, ec::SESSION_ALREADY_LOCKED),
        StoreError::ReadOnly => (ec::TYPE_SESSION, ec::SESSION_READ_ONLY),
        StoreError::ObjectDoesNotExist(_) => (ec::TYPE_STORE, ec::STORE_OBJECT_DOES_NOT_EXIST),
        StoreError::NameAlreadyExists(_) => (ec::TYPE_STORE, ec::STORE_NAME_ALREADY_EXISTS),
        StoreError::NotADirectory(_) => (ec::TYPE_STORE, ec::STORE_NOT_A_DIRECTORY),
        StoreError::NotAFile(_) => (ec::TYPE_STORE, ec::STORE_NOT_A_FILE),
        StoreError::DependencyBroken(_) => (ec::TYPE_STORE, ec::STORE_DEPENDENCY_BROKEN),
        StoreError::HardLimitExceeded => (ec::TYPE_QUOTA, ec::QUOTA_HARD_LIMIT_EXCEEDED),
        StoreError::Codec(filecodec::CodecError::HmacMismatch) => {
            (ec::TYPE_STORE, ec::STORE_HMAC_MISMATCH)
        }
        StoreError::Codec(_) => (ec::TYPE_INFRA, ec::INFRA_DISC_READ_ERROR),
        StoreError::CorruptInfo(_) | StoreError::CorruptAccountDb(_) => {
            (ec::TYPE_INFRA, ec::INFRA_CORRUPT_INFO)
        }
        StoreError::CorruptRefCountDb(_) => (ec::TYPE_INFRA, ec::INFRA_CORRUPT_REFCOUNT_DB),
        StoreError::Raid(raidfile::RaidError::Unrecoverable { .. }) => {
            (ec::TYPE_INFRA, ec::INFRA_DISC_UNRECOVERABLE)
        }
        StoreError::Raid(_) | StoreError::Io(_) => (ec::TYPE_INFRA, ec::INFRA_DISC_READ_ERROR),
        StoreError::Protocol(_) => (ec::TYPE_TRANSPORT, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_error_mapping_covers_the_session_group() {
        assert_eq!(
            wire_error(&StoreError::AlreadyLocked),
            (error_codes::TYPE_SESSION, error_codes::SESSION_ALREADY_LOCKED)
        );
        assert_eq!(
            wire_error(&StoreError::HardLimitExceeded),
            (error_codes::TYPE_QUOTA, error_codes::QUOTA_HARD_LIMIT_EXCEEDED)
        );
        assert_eq!(
            wire_error(&StoreError::Codec(filecodec::CodecError::HmacMismatch)),
            (error_codes::TYPE_STORE, error_codes::STORE_HMAC_MISMATCH)
        );
    }
}
