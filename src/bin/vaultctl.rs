//! Administrative tooling for the store daemon's accounts.
//!
//! Exit codes: 0 success, 1 fatal error, 2 account not found, 3 lock
//! contention.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;

use config::Configuration;
use raidfile::RaidController;
use store::accounts::{AccountDatabase, AccountRecord};
use store::context::StoreContext;
use store::housekeeping;
use store::StoreError;

const EXIT_FATAL: u8 = 1;
const EXIT_NO_ACCOUNT: u8 = 2;
const EXIT_LOCKED: u8 = 3;

#[derive(Parser)]
#[command(name = "vaultctl", about = "Backup store account administration")]
struct Args {
    /// Daemon configuration file.
    #[arg(short, long, default_value = "/etc/vault/vaultd.conf")]
    config: PathBuf,

    #[command(subcommand)]
    command: AdminCommand,
}

#[derive(Subcommand)]
enum AdminCommand {
    /// Create an account and its on-disc store.
    CreateAccount {
        /// Account id (hex).
        id: String,
        /// Disc set the account's store lives on.
        disc_set: u32,
        /// Soft block limit.
        soft_limit: i64,
        /// Hard block limit.
        hard_limit: i64,
    },
    /// Show an account's usage and limits.
    Info {
        /// Account id (hex).
        id: String,
    },
    /// Reclaim deleted objects and stale staging files.
    Housekeeping {
        /// Account id (hex).
        id: String,
    },
    /// Audit refcounts and usage against the directory tree.
    Check {
        /// Account id (hex).
        id: String,
        /// Write corrections back.
        #[arg(long)]
        fix: bool,
    },
    /// Change an account's block limits.
    SetLimit {
        /// Account id (hex).
        id: String,
        /// New soft block limit.
        soft_limit: i64,
        /// New hard block limit.
        hard_limit: i64,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "command failed");
            eprintln!("vaultctl: {err}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn exit_code_for(err: &StoreError) -> u8 {
    match err {
        StoreError::AccountDoesNotExist(_) => EXIT_NO_ACCOUNT,
        StoreError::AlreadyLocked => EXIT_LOCKED,
        _ => EXIT_FATAL,
    }
}

struct Store {
    controller: RaidController,
    accounts_path: PathBuf,
}

// The daemon verifies its full configuration; this tool only needs the
// two store keys and leaves the rest alone.
fn load_store(config_path: &Path) -> Result<Store, StoreError> {
    let parsed = Configuration::load(config_path)
        .map_err(|err| StoreError::CorruptAccountDb(err.to_string()))?;
    let key = |name: &str| {
        parsed
            .key_value(name)
            .map(ToOwned::to_owned)
            .map_err(|err| StoreError::CorruptAccountDb(err.to_string()))
    };
    let controller = RaidController::from_config_file(Path::new(&key("RaidFileConf")?))?;
    Ok(Store {
        controller,
        accounts_path: PathBuf::from(key("AccountDatabase")?),
    })
}

fn parse_account_id(text: &str) -> Result<i32, StoreError> {
    let trimmed = text.trim_start_matches("0x");
    u32::from_str_radix(trimmed, 16)
        .map(|id| id as i32)
        .map_err(|_| StoreError::CorruptAccountDb(format!("bad account id {text:?}")))
}

fn run(args: &Args) -> Result<(), StoreError> {
    let store = load_store(&args.config)?;
    match &args.command {
        AdminCommand::CreateAccount {
            id,
            disc_set,
            soft_limit,
            hard_limit,
        } => {
            let id = parse_account_id(id)?;
            let record = AccountRecord {
                id,
                disc_set: *disc_set,
                root_path: AccountRecord::default_root(id),
            };
            let mut secret = [0u8; 32];
            rand::Rng::fill(&mut rand::thread_rng(), &mut secret[..]);
            StoreContext::create_account_store(
                &store.controller,
                &record,
                *soft_limit,
                *hard_limit,
                &secret,
            )?;
            let mut accounts = AccountDatabase::load(&store.accounts_path)?;
            accounts.insert(record)?;
            println!("account {id:#010x} created");
            Ok(())
        }
        AdminCommand::Info { id } => {
            let id = parse_account_id(id)?;
            let accounts = AccountDatabase::load(&store.accounts_path)?;
            let mut context = StoreContext::open(&store.controller, &accounts, id, true)?;
            let block_size = context.block_size();
            let info = context.store_info();
            println!("account:              {id:#010x}");
            println!("enabled:              {}", info.is_enabled);
            println!("block size:           {block_size}");
            println!("blocks used:          {}", info.blocks_used);
            println!("  in old files:       {}", info.blocks_in_old_files);
            println!("  in deleted files:   {}", info.blocks_in_deleted_files);
            println!("  in directories:     {}", info.blocks_in_directories);
            println!("soft limit:           {}", info.blocks_soft_limit);
            println!("hard limit:           {}", info.blocks_hard_limit);
            println!("files (cur/old/del):  {}/{}/{}", info.num_current_files, info.num_old_files, info.num_deleted_files);
            println!("directories:          {}", info.num_directories);
            println!("last object id:       {}", info.last_object_id_used);
            println!("client store marker:  {}", info.client_store_marker);
            let _ = context.finish();
            Ok(())
        }
        AdminCommand::Housekeeping { id } => {
            let id = parse_account_id(id)?;
            let accounts = AccountDatabase::load(&store.accounts_path)?;
            let summary = housekeeping::run_housekeeping(&store.controller, &accounts, id)?;
            println!(
                "removed {} objects ({} blocks), reversed {} deltas, swept {} staging files",
                summary.objects_removed,
                summary.blocks_freed,
                summary.deltas_reversed,
                summary.stale_staging_removed
            );
            Ok(())
        }
        AdminCommand::Check { id, fix } => {
            let id = parse_account_id(id)?;
            let accounts = AccountDatabase::load(&store.accounts_path)?;
            let report = housekeeping::check_account(&store.controller, &accounts, id, *fix)?;
            println!(
                "staging: {}, refcount mismatches: {}, usage mismatches: {}{}",
                report.stale_staging,
                report.refcount_mismatches,
                report.usage_mismatches,
                if report.fixed { " (fixed)" } else { "" }
            );
            Ok(())
        }
        AdminCommand::SetLimit {
            id,
            soft_limit,
            hard_limit,
        } => {
            let id = parse_account_id(id)?;
            let accounts = AccountDatabase::load(&store.accounts_path)?;
            let mut context = StoreContext::open(&store.controller, &accounts, id, false)?;
            context.set_limits(*soft_limit, *hard_limit)?;
            println!("account {id:#010x} limits set to {soft_limit}/{hard_limit}");
            Ok(())
        }
    }
}
