//! Stats/health reporting.
//!
//! A pure read over the vault: building a report never probes the backend,
//! never triggers recovery and never changes the mode.

use serde::Serialize;

use crate::{
    error::StoreError,
    record::{AccountKey, AccountStats},
    store::KeyStore,
    vault::{KeyVault, Mode},
};

/// Health payload for an outer health-check surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Current mode
    pub mode: Mode,
    /// Whether a durable backend is configured
    pub durable_enabled: bool,
    /// Configured durable backend label (`"memory"` when disabled)
    pub backend: &'static str,
    /// Whether writes currently survive a restart
    pub persistent: bool,
    /// Milliseconds since the durable backend last answered a probe
    pub last_probe_age_ms: Option<u64>,
    /// Durable -> Degraded transitions since startup
    pub downgrades: u64,
    /// Accounts held only in memory, lost on restart
    pub fallback_accounts: usize,
    /// Degraded-mode wipes, device deletes and room-key imports awaiting replay
    pub pending_replay_ops: usize,
    /// Counters for the requested account
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountStats>,
}

impl HealthReport {
    /// One-line status for logs.
    pub fn summary(&self) -> String {
        if self.persistent {
            format!("{} ({}), persistent", self.mode, self.backend)
        } else {
            format!(
                "{} ({}), NOT persistent: {} account(s) in memory only",
                self.mode, self.backend, self.fallback_accounts
            )
        }
    }
}

impl<S: KeyStore> KeyVault<S> {
    /// Build a health report, with counters for `account` when given.
    ///
    /// # Errors
    ///
    /// - `StoreError::Malformed` or `StoreError::Backend` from the stats read.
    ///   Unavailability is served from the fallback, never returned.
    pub fn health(&self, account: Option<&AccountKey>) -> Result<HealthReport, StoreError> {
        let account = account.map(|key| self.stats(key)).transpose()?;
        let mode = self.mode();
        Ok(HealthReport {
            mode,
            durable_enabled: self.durable_enabled(),
            backend: self.durable_backend(),
            persistent: mode == Mode::Durable,
            last_probe_age_ms: self
                .last_probe_age()
                .map(|age| u64::try_from(age.as_millis()).unwrap_or(u64::MAX)),
            downgrades: self.downgrades(),
            fallback_accounts: self.fallback_accounts(),
            pending_replay_ops: self.pending_replay_ops(),
            account,
        })
    }
}
