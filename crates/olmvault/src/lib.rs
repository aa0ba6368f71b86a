//! Olmvault: durable storage for Matrix end-to-end encryption state.
//!
//! Persists the opaque state a cryptographic engine produces (the pickled Olm
//! account, pairwise Olm sessions, inbound Megolm sessions, remote device
//! keys, the sync cursor and per-room rotation policy) and keeps serving when
//! the durable backend goes away.
//!
//! # Architecture
//!
//! - [`pool::ConnectionManager`]: bounded `r2d2` pool with probe
//! - [`schema`]: declarative table catalogue, idempotent create-or-complete
//! - [`KeyStore`]: upsert-only persistence contract, implemented by
//!   [`SqliteKeyStore`], [`PostgresKeyStore`] and [`MemoryKeyStore`]
//! - [`KeyVault`]: degradation controller routing to the durable store or the
//!   in-memory fallback
//! - [`HealthReport`]: mode, counters and probe age for health checks
//! - [`SharedVault`]: Tokio handle that keeps blocking calls off the runtime
//!
//! # Example
//!
//! ```no_run
//! use olmvault::{AccountKey, AccountRecord, KeyStore, StoreConfig, open_vault};
//!
//! let vault = open_vault(&StoreConfig::sqlite("/var/lib/bot/keys.db"))?;
//! let account = AccountKey::new("@bot:example.org", "BOTDEVICE");
//! vault.save_account(&account, &AccountRecord { pickle: b"...".to_vec(), shared: false })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod error;
pub mod health;
pub mod pool;
pub mod record;
pub mod runtime;
pub mod schema;
pub mod store;
pub mod vault;

pub use config::{BackendConfig, ConfigError, PoolSettings, PostgresConfig, RecoverySettings, StoreConfig};
pub use error::StoreError;
pub use health::HealthReport;
pub use record::{
    AccountKey, AccountRecord, AccountSnapshot, AccountStats, DeviceKey, EncryptedRoom,
    MegolmSession, OlmSession,
};
pub use runtime::SharedVault;
pub use schema::SchemaError;
pub use store::{
    ChaoticKeyStore, DurableStore, KeyStore, MemoryKeyStore, PostgresKeyStore, SqliteKeyStore,
};
pub use vault::{KeyVault, Mode, ReplaySummary};

/// Build and initialise a vault from configuration.
///
/// With the durable store switched off the vault runs on memory only. An
/// unreachable backend yields a `Degraded` vault, not an error.
///
/// # Errors
///
/// - `SchemaError` if the durable schema is structurally incompatible
pub fn open_vault(config: &StoreConfig) -> Result<KeyVault<DurableStore>, SchemaError> {
    let durable = config
        .durable_enabled
        .then(|| DurableStore::open(&config.backend, config.pool));
    KeyVault::open(durable, config.recovery)
}
