//! The store daemon: accepts mutually authenticated TLS connections and
//! runs one session per connection on its own thread.
//!
//! Deliberately thin: daemonisation, PID files and signal handling are
//! the init system's business. The daemon loads its configuration, binds
//! the listeners, and serves until killed.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use config::verify::{KeyRule, Schema, SubBlocks, ValueKind};
use config::Configuration;
use raidfile::RaidController;
use store::accounts::AccountDatabase;
use store::housekeeping::MessageQueue;
use store::session::Session;
use transport::{Listener, TlsContext};

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "vaultd", about = "Backup store daemon")]
struct Args {
    /// Daemon configuration file.
    #[arg(short, long, default_value = "/etc/vault/vaultd.conf")]
    config: PathBuf,
}

struct DaemonConfig {
    account_database: PathBuf,
    raid_file_conf: PathBuf,
    listen_addresses: Vec<SocketAddr>,
    certificate_file: PathBuf,
    private_key_file: PathBuf,
    trusted_cas_file: PathBuf,
}

fn daemon_schema() -> Schema {
    Schema::new(
        vec![
            KeyRule::required("AccountDatabase", ValueKind::Any),
            KeyRule::required("RaidFileConf", ValueKind::Any),
            KeyRule::required("PidFile", ValueKind::Any),
            KeyRule::required("ListenAddresses", ValueKind::Any).multi(),
            KeyRule::required("CertificateFile", ValueKind::Any),
            KeyRule::required("PrivateKeyFile", ValueKind::Any),
            KeyRule::required("TrustedCAsFile", ValueKind::Any),
            KeyRule::with_default("MaximumObjectSize", ValueKind::Int, "16384"),
        ],
        SubBlocks::None,
    )
}

fn load_daemon_config(path: &Path) -> Result<DaemonConfig, String> {
    let parsed =
        Configuration::load_and_verify(path, &daemon_schema()).map_err(|err| err.to_string())?;
    let key = |name: &str| -> Result<String, String> {
        parsed
            .key_value(name)
            .map(ToOwned::to_owned)
            .map_err(|err| err.to_string())
    };
    let mut listen_addresses = Vec::new();
    for address in parsed
        .key_values("ListenAddresses")
        .map_err(|err| err.to_string())?
    {
        // Address form: `inet:host:port` (the prefix is optional).
        let bare = address.strip_prefix("inet:").unwrap_or(address);
        listen_addresses.push(
            bare.parse()
                .map_err(|_| format!("bad listen address {address:?}"))?,
        );
    }
    Ok(DaemonConfig {
        account_database: PathBuf::from(key("AccountDatabase")?),
        raid_file_conf: PathBuf::from(key("RaidFileConf")?),
        listen_addresses,
        certificate_file: PathBuf::from(key("CertificateFile")?),
        private_key_file: PathBuf::from(key("PrivateKeyFile")?),
        trusted_cas_file: PathBuf::from(key("TrustedCAsFile")?),
    })
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match run(&args.config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "daemon failed");
            eprintln!("vaultd: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(config_path: &Path) -> Result<(), String> {
    let daemon_config = load_daemon_config(config_path)?;
    let controller = Arc::new(
        RaidController::from_config_file(&daemon_config.raid_file_conf)
            .map_err(|err| err.to_string())?,
    );
    let accounts = Arc::new(
        AccountDatabase::load(&daemon_config.account_database).map_err(|err| err.to_string())?,
    );
    let tls = TlsContext::from_files(
        &daemon_config.certificate_file,
        &daemon_config.private_key_file,
        &daemon_config.trusted_cas_file,
    )
    .map_err(|err| err.to_string())?;

    let housekeeping_queue = MessageQueue::new();
    let mut listeners = Vec::new();
    for address in &daemon_config.listen_addresses {
        listeners.push(tls.listen(*address).map_err(|err| err.to_string())?);
        info!(%address, "listening");
    }
    if listeners.is_empty() {
        return Err("no listen addresses configured".into());
    }

    loop {
        for listener in &mut listeners {
            match listener.accept(ACCEPT_TIMEOUT) {
                Ok(Some(connection)) => {
                    let controller = Arc::clone(&controller);
                    let accounts = Arc::clone(&accounts);
                    let queue = housekeeping_queue.clone();
                    thread::spawn(move || {
                        let session = Session::new(connection, &controller, &accounts)
                            .with_housekeeping(Box::new(queue));
                        if let Err(err) = session.run() {
                            warn!(%err, "session ended with error");
                        }
                    });
                }
                Ok(None) => {}
                Err(err) => warn!(%err, "accept failed"),
            }
        }
        // Out-of-band requests queued by sessions; reclaim work is done by
        // vaultctl or a dedicated housekeeping run, this loop just logs.
        while let Some(message) = housekeeping_queue.pop() {
            info!(
                message = %String::from_utf8_lossy(&message),
                "housekeeping request"
            );
        }
    }
}
