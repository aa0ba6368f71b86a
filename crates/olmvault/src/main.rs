//! Olmvault admin binary.
//!
//! # Usage
//!
//! ```bash
//! # Health of the configured store (reads DATABASE_URL / POSTGRES_* / .env)
//! olmvault health --user @bot:example.org --device BOTDEVICE
//!
//! # Back up one account, restore it elsewhere
//! olmvault export --user @bot:example.org --device BOTDEVICE > backup.json
//! olmvault --database-url sqlite://keys.db import --user @bot:example.org \
//!     --device BOTDEVICE --input backup.json
//!
//! # Copy every account from SQLite to Postgres
//! olmvault migrate --from sqlite://keys.db --to postgres://matrix_user@db/matrix_store --all
//! ```

use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use clap::{Args as ClapArgs, Parser, Subcommand};
use olmvault::{
    AccountKey, AccountSnapshot, BackendConfig, DurableStore, KeyStore, KeyVault, MegolmSession,
    Mode, PoolSettings, StoreConfig, open_vault,
};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Olm/Megolm key store administration
#[derive(Parser, Debug)]
#[command(name = "olmvault")]
#[command(about = "Inspect, back up and migrate a Matrix E2EE key store")]
#[command(version)]
struct Args {
    /// Durable backend URL (postgres://... or sqlite://path); overrides the environment
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
struct AccountArgs {
    /// Matrix user id of the local account
    #[arg(long, env = "MATRIX_USER_ID")]
    user: String,

    /// Device id of the local account
    #[arg(long, env = "MATRIX_DEVICE_ID")]
    device: String,
}

impl AccountArgs {
    fn key(&self) -> AccountKey {
        AccountKey::new(&self.user, &self.device)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the health report as JSON
    Health {
        /// Include counters for this account
        #[arg(long, requires = "device")]
        user: Option<String>,

        /// Device id for --user
        #[arg(long, requires = "user")]
        device: Option<String>,
    },

    /// Export an account snapshot, or one room's Megolm keys
    Export {
        #[command(flatten)]
        account: AccountArgs,

        /// Only export Megolm sessions of this room
        #[arg(long)]
        room: Option<String>,

        /// Write to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Import an account snapshot (upserts every record)
    Import {
        #[command(flatten)]
        account: AccountArgs,

        /// Snapshot JSON produced by `export`
        #[arg(long, short)]
        input: PathBuf,
    },

    /// Import exported room keys, skipping sessions already stored
    ImportRoomKeys {
        #[command(flatten)]
        account: AccountArgs,

        /// Room key JSON produced by `export --room`
        #[arg(long, short)]
        input: PathBuf,
    },

    /// Copy accounts from one backend to another
    Migrate {
        /// Source backend URL
        #[arg(long)]
        from: String,

        /// Target backend URL
        #[arg(long)]
        to: String,

        /// Copy only this user's account (with --device)
        #[arg(long, requires = "device", conflicts_with = "all")]
        user: Option<String>,

        /// Device id for --user
        #[arg(long, requires = "user")]
        device: Option<String>,

        /// Copy every account in the source
        #[arg(long)]
        all: bool,
    },

    /// Delete every record of an account
    Wipe {
        #[command(flatten)]
        account: AccountArgs,

        /// Confirm the irreversible delete
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> CliResult<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    // stdout carries the JSON output
    tracing_subscriber::registry().with(fmt::layer().with_writer(io::stderr)).with(filter).init();

    match args.command {
        Command::Migrate { from, to, user, device, all } => {
            let account = user.zip(device).map(|(user, device)| AccountKey::new(user, device));
            migrate(&from, &to, account, all)
        },
        command => {
            let mut config = StoreConfig::from_env()?;
            if let Some(url) = &args.database_url {
                config.backend = BackendConfig::from_url(url)?;
            }
            tracing::info!(backend = config.backend.label(), "opening key store");
            let vault = open_vault(&config)?;
            run(&vault, command)
        },
    }
}

fn run(vault: &KeyVault<DurableStore>, command: Command) -> CliResult<()> {
    match command {
        Command::Health { user, device } => {
            let account = user.zip(device).map(|(user, device)| AccountKey::new(user, device));
            let report = vault.health(account.as_ref())?;
            tracing::info!("{}", report.summary());
            emit(&report, None)
        },
        Command::Export { account, room, output } => {
            // A degraded vault would export the empty fallback
            require_durable(vault)?;
            let key = account.key();
            match room {
                Some(room) => emit(&vault.export_room_keys(&key, &room)?, output),
                None => emit(&vault.export_account(&key)?, output),
            }
        },
        Command::Import { account, input } => {
            require_durable(vault)?;
            let snapshot: AccountSnapshot = serde_json::from_str(&fs::read_to_string(input)?)?;
            vault.import_account(&account.key(), &snapshot)?;
            emit(&json!({ "imported": true, "stats": vault.stats(&account.key())? }), None)
        },
        Command::ImportRoomKeys { account, input } => {
            require_durable(vault)?;
            let sessions: Vec<MegolmSession> =
                serde_json::from_str(&fs::read_to_string(input)?)?;
            let imported = vault.import_room_keys(&account.key(), &sessions)?;
            emit(&json!({ "imported": imported, "skipped": sessions.len() - imported }), None)
        },
        Command::Wipe { account, yes } => {
            if !yes {
                return Err("wipe deletes every key of the account; pass --yes to confirm".into());
            }
            require_durable(vault)?;
            let existed = vault.wipe_account(&account.key())?;
            tracing::warn!(account = %account.key(), existed, "account wiped");
            emit(&json!({ "wiped": existed }), None)
        },
        Command::Migrate { .. } => Err("migrate does not use the configured store".into()),
    }
}

/// Writes made now would only reach the in-memory fallback and vanish on exit.
fn require_durable(vault: &KeyVault<DurableStore>) -> CliResult<()> {
    match vault.mode() {
        Mode::Durable => Ok(()),
        mode => Err(format!(
            "key store is {mode} ({} unreachable); refusing to write changes that would not persist",
            vault.durable_backend()
        )
        .into()),
    }
}

fn migrate(from: &str, to: &str, account: Option<AccountKey>, all: bool) -> CliResult<()> {
    let source = DurableStore::open(&BackendConfig::from_url(from)?, PoolSettings::default());
    let target = DurableStore::open(&BackendConfig::from_url(to)?, PoolSettings::default());
    source.probe()?;
    target.probe()?;
    target.ensure_schema()?;

    let accounts = match (account, all) {
        (Some(account), _) => vec![account],
        (None, true) => source.list_accounts()?,
        (None, false) => return Err("migrate needs --user/--device or --all".into()),
    };

    let mut copied = Vec::with_capacity(accounts.len());
    for account in accounts {
        let snapshot = source.export_account(&account)?;
        target.import_account(&account, &snapshot)?;
        tracing::info!(
            %account,
            megolm = snapshot.megolm_sessions.len(),
            olm = snapshot.olm_sessions.len(),
            devices = snapshot.device_keys.len(),
            "account migrated"
        );
        copied.push(json!({ "account": account, "stats": target.stats(&account)? }));
    }
    emit(&json!({ "from": source.backend(), "to": target.backend(), "accounts": copied }), None)
}

fn emit<T: Serialize>(value: &T, output: Option<PathBuf>) -> CliResult<()> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    match output {
        Some(path) => fs::write(path, text)?,
        None => io::stdout().lock().write_all(text.as_bytes())?,
    }
    Ok(())
}
