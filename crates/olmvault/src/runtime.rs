//! Tokio integration.
//!
//! The vault and its drivers block, so async callers must not invoke them on
//! a runtime worker thread. [`SharedVault`] moves every call onto the
//! blocking pool. Dropping the returned future does not cancel the call: it
//! runs to completion against the backend.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{
    error::StoreError,
    health::HealthReport,
    record::AccountKey,
    store::KeyStore,
    vault::{KeyVault, Mode},
};

/// Cheaply clonable async handle to a [`KeyVault`].
pub struct SharedVault<S> {
    vault: Arc<KeyVault<S>>,
}

impl<S> Clone for SharedVault<S> {
    fn clone(&self) -> Self {
        Self { vault: Arc::clone(&self.vault) }
    }
}

impl<S: KeyStore + 'static> SharedVault<S> {
    /// Share a vault.
    pub fn new(vault: KeyVault<S>) -> Self {
        Self { vault: Arc::new(vault) }
    }

    /// The underlying vault, for synchronous callers.
    pub fn vault(&self) -> &Arc<KeyVault<S>> {
        &self.vault
    }

    /// Current mode without touching the blocking pool.
    pub fn mode(&self) -> Mode {
        self.vault.mode()
    }

    /// Run `f` against the vault on the blocking pool.
    ///
    /// # Errors
    ///
    /// - Whatever `f` returns
    /// - `StoreError::Backend` if the blocking task panicked
    pub async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&KeyVault<S>) -> Result<T, StoreError> + Send + 'static,
    {
        let vault = Arc::clone(&self.vault);
        tokio::task::spawn_blocking(move || f(&vault))
            .await
            .map_err(|err| StoreError::Backend(format!("key store task failed: {err}")))?
    }

    /// Health report built on the blocking pool.
    ///
    /// # Errors
    ///
    /// - See [`KeyVault::health`]
    pub async fn health(&self, account: Option<AccountKey>) -> Result<HealthReport, StoreError> {
        self.run(move |vault| vault.health(account.as_ref())).await
    }

    /// Drive [`KeyVault::heartbeat`] every `interval` until the handle is
    /// aborted or the runtime shuts down.
    pub fn spawn_recovery_task(&self, interval: Duration) -> JoinHandle<()> {
        let vault = Arc::clone(&self.vault);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            let mut last = vault.mode();
            loop {
                ticker.tick().await;
                let probe = Arc::clone(&vault);
                let mode = match tokio::task::spawn_blocking(move || probe.heartbeat()).await {
                    Ok(mode) => mode,
                    Err(err) => {
                        tracing::error!(error = %err, "key store heartbeat task failed");
                        continue;
                    },
                };
                if mode != last {
                    tracing::debug!(from = %last, to = %mode, "key store mode changed by heartbeat");
                    last = mode;
                }
            }
        })
    }
}

impl<S> From<KeyVault<S>> for SharedVault<S> {
    fn from(vault: KeyVault<S>) -> Self {
        Self { vault: Arc::new(vault) }
    }
}
