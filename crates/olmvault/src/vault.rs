//! Degradation controller.
//!
//! [`KeyVault`] wraps a durable [`KeyStore`] and a volatile
//! [`MemoryKeyStore`] fallback. While the durable backend answers, every call
//! goes to it. The first [`StoreError::Unavailable`] flips the vault to
//! [`Mode::Degraded`] for every caller (sticky downgrade) and the failed call
//! is served by the fallback instead, so unavailability never reaches the
//! caller.
//!
//! # Recovery
//!
//! In `Degraded` mode every `check_every`-th call (no more often than
//! `min_interval`) re-probes the backend. Timers can drive the same check
//! through [`KeyVault::heartbeat`]. A successful probe moves the vault to
//! `Recovering`, completes the schema, then replays the fallback into the
//! durable store while holding the routing gate exclusively:
//!
//! 1. wipes performed while degraded
//! 2. every fallback account snapshot (last write wins per identity key)
//! 3. room-key imports, which never overwrite a session the backend holds
//! 4. device soft-deletes for devices the fallback never held
//!
//! Only a complete replay clears the fallback and returns to `Durable`. A
//! failed replay leaves everything in place for the next attempt; replay is
//! idempotent. [`KeyVault::init`] on a degraded vault takes the same path, so
//! re-running it never skips the replay.

use std::{
    sync::{
        Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    config::RecoverySettings,
    error::StoreError,
    record::{
        AccountKey, AccountRecord, AccountSnapshot, AccountStats, DeviceKey, EncryptedRoom,
        MegolmSession, OlmSession,
    },
    schema::SchemaError,
    store::{KeyStore, MemoryKeyStore},
};

/// Which store is serving calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Durable backend is serving; writes survive a restart
    Durable,
    /// In-memory fallback is serving; writes are lost on restart
    Degraded,
    /// Backend answered a probe and the fallback is being replayed
    Recovering,
}

impl Mode {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Durable => 0,
            Self::Degraded => 1,
            Self::Recovering => 2,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Durable,
            1 => Self::Degraded,
            _ => Self::Recovering,
        }
    }

    /// Lowercase label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Durable => "durable",
            Self::Degraded => "degraded",
            Self::Recovering => "recovering",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A degraded-mode mutation that a snapshot of the fallback cannot express.
#[derive(Debug, Clone)]
enum PendingOp {
    Wipe(AccountKey),
    DeleteDevice { account: AccountKey, user_id: String, device_id: String },
    /// Sessions a degraded `import_room_keys` added to the fallback that no
    /// later explicit write has touched
    ImportRoomKeys { account: AccountKey, sessions: Vec<MegolmSession> },
}

impl PendingOp {
    fn imports_for<'a>(&'a self, account: &AccountKey) -> Option<&'a [MegolmSession]> {
        match self {
            Self::ImportRoomKeys { account: owner, sessions } if owner == account => {
                Some(sessions.as_slice())
            },
            _ => None,
        }
    }
}

/// An explicit write of these sessions supersedes any pending import of them.
fn supersede_imports(
    pending: &mut Vec<PendingOp>,
    account: &AccountKey,
    written: &[MegolmSession],
) {
    let imports = pending.iter_mut().filter_map(|op| match op {
        PendingOp::ImportRoomKeys { account: owner, sessions } if *owner == *account => {
            Some(sessions)
        },
        _ => None,
    });
    for sessions in imports {
        sessions.retain(|imported| !written.iter().any(|session| same_session(session, imported)));
    }
    pending.retain(|op| {
        !matches!(op, PendingOp::ImportRoomKeys { sessions, .. } if sessions.is_empty())
    });
}

fn same_session(a: &MegolmSession, b: &MegolmSession) -> bool {
    a.room_id == b.room_id && a.session_id == b.session_id
}

/// What one successful replay wrote to the durable store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Account wipes re-applied
    pub wipes: usize,
    /// Account snapshots imported
    pub accounts: usize,
    /// Megolm sessions added by replayed room-key imports
    pub room_keys: usize,
    /// Device soft-deletes re-applied
    pub device_deletes: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Key store front that degrades to memory instead of failing.
///
/// `S` is the durable backend. `None` means the durable store is switched off
/// by configuration: the vault is permanently `Degraded` and never probes.
pub struct KeyVault<S> {
    durable: Option<S>,
    fallback: MemoryKeyStore,
    mode: AtomicU8,
    /// Shared by routed calls, exclusive during replay
    gate: RwLock<()>,
    calls_since_check: AtomicU64,
    last_recovery_attempt: Mutex<Option<Instant>>,
    last_probe_ok: Mutex<Option<Instant>>,
    downgrades: AtomicU64,
    pending: Mutex<Vec<PendingOp>>,
    settings: RecoverySettings,
}

impl<S: KeyStore> KeyVault<S> {
    /// Build a vault without touching the backend. Starts `Degraded` until
    /// [`init`](Self::init) runs.
    pub fn new(durable: Option<S>, settings: RecoverySettings) -> Self {
        Self {
            durable,
            fallback: MemoryKeyStore::new(),
            mode: AtomicU8::new(Mode::Degraded.to_u8()),
            gate: RwLock::new(()),
            calls_since_check: AtomicU64::new(0),
            last_recovery_attempt: Mutex::new(None),
            last_probe_ok: Mutex::new(None),
            downgrades: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            settings,
        }
    }

    /// Build and [`init`](Self::init) a vault.
    ///
    /// # Errors
    ///
    /// - `SchemaError` if the existing durable schema is structurally
    ///   incompatible
    pub fn open(durable: Option<S>, settings: RecoverySettings) -> Result<Self, SchemaError> {
        let vault = Self::new(durable, settings);
        vault.init()?;
        Ok(vault)
    }

    /// Probe the backend and ensure the schema, choosing the starting mode.
    ///
    /// An unreachable backend yields `Degraded`; it is never an error. On a
    /// degraded vault this is a recovery attempt: anything the fallback holds
    /// is replayed before the vault goes `Durable`. On a durable vault it only
    /// re-checks the schema.
    ///
    /// # Errors
    ///
    /// - `SchemaError` if the existing durable schema is structurally
    ///   incompatible. Running against it would risk corrupt persistence.
    pub fn init(&self) -> Result<Mode, SchemaError> {
        let Some(durable) = &self.durable else {
            self.set_mode(Mode::Degraded);
            warn!(
                "durable key store disabled by configuration, \
                 encryption state will not survive a restart"
            );
            return Ok(Mode::Degraded);
        };

        match self.mode() {
            Mode::Durable => match durable.ensure_schema() {
                Ok(()) => Ok(Mode::Durable),
                Err(StoreError::Schema(err)) => {
                    let backend = durable.backend();
                    error!(backend, error = %err, "incompatible key store schema");
                    Err(err)
                },
                Err(err) => {
                    self.degrade("ensure_schema", &err);
                    Ok(self.mode())
                },
            },
            Mode::Recovering => Ok(Mode::Recovering),
            Mode::Degraded => match self.claim_recovery(durable) {
                None => Ok(self.mode()),
                Some(Ok(_)) => Ok(Mode::Durable),
                Some(Err(StoreError::Schema(err))) => {
                    let backend = durable.backend();
                    error!(backend, error = %err, "incompatible key store schema");
                    Err(err)
                },
                Some(Err(err)) => {
                    warn!(
                        backend = durable.backend(),
                        error = %err,
                        "durable key store unreachable, running on in-memory fallback; \
                         encryption state will not survive a restart"
                    );
                    Ok(Mode::Degraded)
                },
            },
        }
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        Mode::from_u8(self.mode.load(Ordering::Acquire))
    }

    fn set_mode(&self, mode: Mode) {
        self.mode.store(mode.to_u8(), Ordering::Release);
    }

    /// Whether writes currently survive a restart.
    pub fn is_persistent(&self) -> bool {
        self.mode() == Mode::Durable
    }

    /// Whether a durable backend is configured at all.
    pub fn durable_enabled(&self) -> bool {
        self.durable.is_some()
    }

    /// The durable backend, if configured.
    pub fn durable(&self) -> Option<&S> {
        self.durable.as_ref()
    }

    /// Label of the configured durable backend, `"memory"` when disabled.
    pub fn durable_backend(&self) -> &'static str {
        self.durable.as_ref().map_or("memory", KeyStore::backend)
    }

    /// Number of Durable -> Degraded transitions so far.
    pub fn downgrades(&self) -> u64 {
        self.downgrades.load(Ordering::Relaxed)
    }

    /// Accounts currently held only in memory.
    pub fn fallback_accounts(&self) -> usize {
        self.fallback.account_count()
    }

    /// Degraded-mode mutations waiting for replay that a fallback snapshot
    /// cannot express.
    pub fn pending_replay_ops(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Time since the durable backend last answered a probe.
    pub fn last_probe_age(&self) -> Option<Duration> {
        lock(&self.last_probe_ok).map(|at| at.elapsed())
    }

    fn mark_probe_ok(&self) {
        *lock(&self.last_probe_ok) = Some(Instant::now());
    }

    /// Sticky downgrade. Only the caller that wins the transition logs it.
    fn degrade(&self, operation: &'static str, err: &StoreError) {
        let swapped = self.mode.compare_exchange(
            Mode::Durable.to_u8(),
            Mode::Degraded.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_ok() {
            self.downgrades.fetch_add(1, Ordering::Relaxed);
            self.calls_since_check.store(0, Ordering::Relaxed);
            *lock(&self.last_recovery_attempt) = Some(Instant::now());
            warn!(
                backend = self.durable_backend(),
                operation,
                error = %err,
                "durable key store unavailable, degraded to in-memory fallback; \
                 writes will not survive a restart until recovery"
            );
        }
    }

    /// Count a degraded call and run a recovery check when one is due.
    fn maybe_recover(&self) {
        if self.durable.is_none() || self.mode() != Mode::Degraded {
            return;
        }
        let calls = self.calls_since_check.fetch_add(1, Ordering::Relaxed) + 1;
        if calls < self.settings.check_every {
            return;
        }
        {
            let mut last = lock(&self.last_recovery_attempt);
            if last.is_some_and(|at| at.elapsed() < self.settings.min_interval) {
                return;
            }
            *last = Some(Instant::now());
        }
        self.calls_since_check.store(0, Ordering::Relaxed);
        self.try_recover();
    }

    /// Attempt recovery now if the vault is `Degraded`. Returns the mode
    /// afterwards.
    pub fn try_recover(&self) -> Mode {
        let Some(durable) = &self.durable else {
            return self.mode();
        };
        match self.claim_recovery(durable) {
            None => self.mode(),
            Some(Ok(_)) => Mode::Durable,
            Some(Err(StoreError::Schema(err))) => {
                error!(error = %err, "incompatible key store schema, staying degraded");
                Mode::Degraded
            },
            Some(Err(err)) => {
                debug!(error = %err, "key store recovery attempt failed");
                Mode::Degraded
            },
        }
    }

    /// Run one recovery if this caller wins the `Degraded -> Recovering`
    /// transition. `None` when the vault was not `Degraded`.
    fn claim_recovery(&self, durable: &S) -> Option<Result<ReplaySummary, StoreError>> {
        self.mode
            .compare_exchange(
                Mode::Degraded.to_u8(),
                Mode::Recovering.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;

        let result = self.recover(durable);
        match &result {
            Ok(summary) if *summary == ReplaySummary::default() => {
                info!(backend = durable.backend(), "key store running in durable mode");
            },
            Ok(summary) => info!(
                backend = durable.backend(),
                accounts = summary.accounts,
                wipes = summary.wipes,
                room_keys = summary.room_keys,
                device_deletes = summary.device_deletes,
                "durable key store recovered, fallback replayed"
            ),
            Err(_) => self.set_mode(Mode::Degraded),
        }
        Some(result)
    }

    fn recover(&self, durable: &S) -> Result<ReplaySummary, StoreError> {
        durable.probe()?;
        self.mark_probe_ok();
        durable.ensure_schema()?;

        let _gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        let summary = self.replay(durable)?;
        self.fallback.clear();
        lock(&self.pending).clear();
        self.set_mode(Mode::Durable);
        Ok(summary)
    }

    fn replay(&self, durable: &S) -> Result<ReplaySummary, StoreError> {
        let pending = lock(&self.pending).clone();
        let mut summary = ReplaySummary::default();

        for op in &pending {
            if let PendingOp::Wipe(account) = op {
                durable.wipe_account(account)?;
                summary.wipes += 1;
            }
        }
        for (account, mut snapshot) in self.fallback.snapshot_all() {
            // Sessions that only arrived by room-key import must not upsert.
            snapshot.megolm_sessions.retain(|session| {
                !pending
                    .iter()
                    .filter_map(|op| op.imports_for(&account))
                    .any(|imported| imported.iter().any(|other| same_session(session, other)))
            });
            durable.import_account(&account, &snapshot)?;
            summary.accounts += 1;
        }
        for op in &pending {
            if let PendingOp::ImportRoomKeys { account, sessions } = op {
                summary.room_keys += durable.import_room_keys(account, sessions)?;
            }
        }
        for op in &pending {
            if let PendingOp::DeleteDevice { account, user_id, device_id } = op {
                // A device the fallback holds was replayed with its flag above.
                if !self.fallback.has_device(account, user_id, device_id) {
                    durable.delete_device_key(account, user_id, device_id)?;
                    summary.device_deletes += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Probe in `Durable` mode, attempt recovery in `Degraded` mode. Meant
    /// for a periodic timer. Returns the mode afterwards.
    pub fn heartbeat(&self) -> Mode {
        match self.mode() {
            Mode::Durable => {
                if let Some(durable) = &self.durable {
                    match durable.probe() {
                        Ok(()) => self.mark_probe_ok(),
                        Err(err) if err.is_unavailable() => self.degrade("probe", &err),
                        Err(err) => debug!(error = %err, "key store probe failed"),
                    }
                }
                self.mode()
            },
            Mode::Degraded => self.try_recover(),
            Mode::Recovering => Mode::Recovering,
        }
    }

    fn route<T>(
        &self,
        operation: &'static str,
        f: impl Fn(&dyn KeyStore) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.maybe_recover();

        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(result) = self.serve_durable(operation, &f) {
            return result;
        }
        f(&self.fallback)
    }

    /// Like [`route`](Self::route) for mutations that a fallback snapshot
    /// cannot replay faithfully. `journal` edits the pending ops when the
    /// fallback serves, under the same lock as the fallback write.
    fn route_journaled<T>(
        &self,
        operation: &'static str,
        journal: impl FnOnce(&mut Vec<PendingOp>),
        f: impl Fn(&dyn KeyStore) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.maybe_recover();

        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(result) = self.serve_durable(operation, &f) {
            return result;
        }
        if self.durable.is_none() {
            return f(&self.fallback);
        }
        let mut pending = lock(&self.pending);
        journal(&mut pending);
        f(&self.fallback)
    }

    /// Try the durable store in `Durable` mode. `None` means the fallback
    /// must serve, downgrading first if the backend just became unavailable.
    fn serve_durable<T>(
        &self,
        operation: &'static str,
        f: impl Fn(&dyn KeyStore) -> Result<T, StoreError>,
    ) -> Option<Result<T, StoreError>> {
        let durable = self.durable.as_ref()?;
        if self.mode() != Mode::Durable {
            return None;
        }
        match f(durable) {
            Err(err) if err.is_unavailable() => {
                self.degrade(operation, &err);
                None
            },
            result => Some(result),
        }
    }

    /// Read path with no recovery trigger and no mode change.
    fn observe<T>(&self, f: impl Fn(&dyn KeyStore) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(durable) = &self.durable {
            if self.mode() == Mode::Durable {
                match f(durable) {
                    Err(err) if err.is_unavailable() => {},
                    result => return result,
                }
            }
        }
        f(&self.fallback)
    }
}

impl<S: KeyStore> KeyStore for KeyVault<S> {
    fn backend(&self) -> &'static str {
        if self.is_persistent() { self.durable_backend() } else { self.fallback.backend() }
    }

    /// Runs a [`heartbeat`](KeyVault::heartbeat). Never reports
    /// unavailability.
    fn probe(&self) -> Result<(), StoreError> {
        self.heartbeat();
        Ok(())
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        self.init()?;
        Ok(())
    }

    fn save_account(
        &self,
        account: &AccountKey,
        record: &AccountRecord,
    ) -> Result<(), StoreError> {
        self.route("save_account", |store| store.save_account(account, record))
    }

    fn load_account(&self, account: &AccountKey) -> Result<Option<AccountRecord>, StoreError> {
        self.route("load_account", |store| store.load_account(account))
    }

    fn save_device_key(
        &self,
        account: &AccountKey,
        device: &DeviceKey,
    ) -> Result<(), StoreError> {
        self.route("save_device_key", |store| store.save_device_key(account, device))
    }

    fn delete_device_key(
        &self,
        account: &AccountKey,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, StoreError> {
        let journal = PendingOp::DeleteDevice {
            account: account.clone(),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
        };
        self.route_journaled("delete_device_key", |pending| pending.push(journal), |store| {
            store.delete_device_key(account, user_id, device_id)
        })
    }

    fn load_device_keys(
        &self,
        account: &AccountKey,
        include_deleted: bool,
    ) -> Result<Vec<DeviceKey>, StoreError> {
        self.route("load_device_keys", |store| store.load_device_keys(account, include_deleted))
    }

    fn save_olm_session(
        &self,
        account: &AccountKey,
        session: &OlmSession,
    ) -> Result<(), StoreError> {
        self.route("save_olm_session", |store| store.save_olm_session(account, session))
    }

    fn load_olm_sessions(
        &self,
        account: &AccountKey,
        sender_key: &str,
    ) -> Result<Vec<OlmSession>, StoreError> {
        self.route("load_olm_sessions", |store| store.load_olm_sessions(account, sender_key))
    }

    fn load_all_olm_sessions(&self, account: &AccountKey) -> Result<Vec<OlmSession>, StoreError> {
        self.route("load_all_olm_sessions", |store| store.load_all_olm_sessions(account))
    }

    fn save_megolm_session(
        &self,
        account: &AccountKey,
        session: &MegolmSession,
    ) -> Result<(), StoreError> {
        self.route_journaled(
            "save_megolm_session",
            |pending| supersede_imports(pending, account, std::slice::from_ref(session)),
            |store| store.save_megolm_session(account, session),
        )
    }

    fn load_megolm_sessions(
        &self,
        account: &AccountKey,
    ) -> Result<Vec<MegolmSession>, StoreError> {
        self.route("load_megolm_sessions", |store| store.load_megolm_sessions(account))
    }

    fn load_room_megolm_sessions(
        &self,
        account: &AccountKey,
        room_id: &str,
    ) -> Result<Vec<MegolmSession>, StoreError> {
        self.route("load_room_megolm_sessions", |store| {
            store.load_room_megolm_sessions(account, room_id)
        })
    }

    fn load_megolm_session(
        &self,
        account: &AccountKey,
        room_id: &str,
        session_id: &str,
    ) -> Result<Option<MegolmSession>, StoreError> {
        self.route("load_megolm_session", |store| {
            store.load_megolm_session(account, room_id, session_id)
        })
    }

    fn save_sync_cursor(&self, account: &AccountKey, token: &str) -> Result<(), StoreError> {
        self.route("save_sync_cursor", |store| store.save_sync_cursor(account, token))
    }

    fn load_sync_cursor(&self, account: &AccountKey) -> Result<Option<String>, StoreError> {
        self.route("load_sync_cursor", |store| store.load_sync_cursor(account))
    }

    fn save_encrypted_room(
        &self,
        account: &AccountKey,
        room: &EncryptedRoom,
    ) -> Result<(), StoreError> {
        self.route("save_encrypted_room", |store| store.save_encrypted_room(account, room))
    }

    fn load_encrypted_rooms(
        &self,
        account: &AccountKey,
    ) -> Result<Vec<EncryptedRoom>, StoreError> {
        self.route("load_encrypted_rooms", |store| store.load_encrypted_rooms(account))
    }

    /// Counters from whichever store is serving. Never triggers recovery.
    fn stats(&self, account: &AccountKey) -> Result<AccountStats, StoreError> {
        self.observe(|store| store.stats(account))
    }

    fn wipe_account(&self, account: &AccountKey) -> Result<bool, StoreError> {
        let journal = |pending: &mut Vec<PendingOp>| {
            pending.retain(|op| op.imports_for(account).is_none());
            pending.push(PendingOp::Wipe(account.clone()));
        };
        self.route_journaled("wipe_account", journal, |store| store.wipe_account(account))
    }

    fn list_accounts(&self) -> Result<Vec<AccountKey>, StoreError> {
        self.route("list_accounts", |store| store.list_accounts())
    }

    fn export_account(&self, account: &AccountKey) -> Result<AccountSnapshot, StoreError> {
        self.route("export_account", |store| store.export_account(account))
    }

    fn import_account(
        &self,
        account: &AccountKey,
        snapshot: &AccountSnapshot,
    ) -> Result<(), StoreError> {
        self.route_journaled(
            "import_account",
            |pending| supersede_imports(pending, account, &snapshot.megolm_sessions),
            |store| store.import_account(account, snapshot),
        )
    }

    fn import_room_keys(
        &self,
        account: &AccountKey,
        sessions: &[MegolmSession],
    ) -> Result<usize, StoreError> {
        self.maybe_recover();

        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(result) = self
            .serve_durable("import_room_keys", |store| store.import_room_keys(account, sessions))
        {
            return result;
        }
        if self.durable.is_none() {
            return self.fallback.import_room_keys(account, sessions);
        }

        // The fallback cannot see what the backend holds, so the skip-existing
        // check is repeated against the backend at replay.
        let mut pending = lock(&self.pending);
        let mut imported: Vec<MegolmSession> = Vec::new();
        for session in sessions {
            let known = imported.iter().any(|other| same_session(session, other))
                || self
                    .fallback
                    .load_megolm_session(account, &session.room_id, &session.session_id)?
                    .is_some();
            if !known {
                self.fallback.save_megolm_session(account, session)?;
                imported.push(session.clone());
            }
        }
        let count = imported.len();
        if count > 0 {
            let op = PendingOp::ImportRoomKeys { account: account.clone(), sessions: imported };
            pending.push(op);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::store::ChaoticKeyStore;

    type Chaos = ChaoticKeyStore<MemoryKeyStore>;

    fn eager() -> RecoverySettings {
        RecoverySettings { check_every: 1, min_interval: Duration::ZERO }
    }

    fn never() -> RecoverySettings {
        RecoverySettings { check_every: u64::MAX, min_interval: Duration::from_secs(3600) }
    }

    fn acct() -> AccountKey {
        AccountKey::new("@bot:x", "BOT")
    }

    fn megolm(id: &str, pickle: &[u8]) -> MegolmSession {
        MegolmSession {
            room_id: "!r:x".into(),
            session_id: id.into(),
            sender_key: "curve".into(),
            pickle: pickle.to_vec(),
            signing_keys: BTreeMap::new(),
            forwarding_chain: Vec::new(),
            created_at_ms: 0,
        }
    }

    #[test]
    fn test_init_durable() {
        let vault = KeyVault::new(Some(Chaos::reliable(MemoryKeyStore::new())), never());
        assert_eq!(vault.init().unwrap(), Mode::Durable);
        assert!(vault.is_persistent());
        assert!(vault.last_probe_age().is_some());
    }

    #[test]
    fn test_init_unreachable_is_degraded() {
        let chaos = Chaos::reliable(MemoryKeyStore::new());
        chaos.set_outage(true);
        let vault = KeyVault::open(Some(chaos), never()).unwrap();

        assert_eq!(vault.mode(), Mode::Degraded);
        assert_eq!(vault.downgrades(), 0);
        vault.save_sync_cursor(&acct(), "s1").unwrap();
        assert_eq!(vault.load_sync_cursor(&acct()).unwrap().as_deref(), Some("s1"));
    }

    #[test]
    fn test_disabled_never_recovers() {
        let vault: KeyVault<MemoryKeyStore> = KeyVault::open(None, eager()).unwrap();
        vault.save_sync_cursor(&acct(), "s1").unwrap();

        assert_eq!(vault.try_recover(), Mode::Degraded);
        assert_eq!(vault.heartbeat(), Mode::Degraded);
        assert!(!vault.durable_enabled());
        assert_eq!(vault.pending_replay_ops(), 0);
    }

    #[test]
    fn test_failed_call_served_by_fallback() {
        let chaos = Chaos::reliable(MemoryKeyStore::new());
        let vault = KeyVault::open(Some(chaos.clone()), never()).unwrap();

        chaos.set_outage(true);
        vault.save_megolm_session(&acct(), &megolm("s1", b"k1")).unwrap();

        assert_eq!(vault.mode(), Mode::Degraded);
        assert_eq!(vault.downgrades(), 1);
        assert_eq!(vault.load_megolm_session(&acct(), "!r:x", "s1").unwrap().unwrap().pickle, b"k1");
        assert!(chaos.inner().load_megolm_sessions(&acct()).unwrap().is_empty());
    }

    #[test]
    fn test_downgrade_is_sticky() {
        let chaos = Chaos::reliable(MemoryKeyStore::new());
        let vault = KeyVault::open(Some(chaos.clone()), never()).unwrap();

        chaos.set_outage(true);
        vault.save_sync_cursor(&acct(), "s1").unwrap();
        let attempts = chaos.operation_count();

        chaos.set_outage(false);
        vault.save_sync_cursor(&acct(), "s2").unwrap();
        vault.load_sync_cursor(&acct()).unwrap();

        assert_eq!(chaos.operation_count(), attempts);
        assert_eq!(vault.mode(), Mode::Degraded);
    }

    #[test]
    fn test_recovery_replays_and_clears() {
        let chaos = Chaos::reliable(MemoryKeyStore::new());
        chaos.inner().save_sync_cursor(&acct(), "old").unwrap();
        let vault = KeyVault::open(Some(chaos.clone()), never()).unwrap();

        chaos.set_outage(true);
        vault.save_sync_cursor(&acct(), "new").unwrap();
        vault.save_megolm_session(&acct(), &megolm("s1", b"k1")).unwrap();

        chaos.set_outage(false);
        assert_eq!(vault.try_recover(), Mode::Durable);
        assert_eq!(vault.fallback_accounts(), 0);
        assert_eq!(chaos.inner().load_sync_cursor(&acct()).unwrap().as_deref(), Some("new"));
        assert_eq!(chaos.inner().load_megolm_sessions(&acct()).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_replay_keeps_fallback() {
        let chaos = Chaos::reliable(MemoryKeyStore::new());
        chaos.set_outage(true);
        let vault = KeyVault::open(Some(chaos.clone()), never()).unwrap();
        vault.save_sync_cursor(&acct(), "s1").unwrap();

        assert_eq!(vault.try_recover(), Mode::Degraded);
        assert_eq!(vault.fallback_accounts(), 1);
        assert_eq!(vault.load_sync_cursor(&acct()).unwrap().as_deref(), Some("s1"));
    }

    #[test]
    fn test_replay_applies_pending_wipe_first() {
        let chaos = Chaos::reliable(MemoryKeyStore::new());
        chaos.inner().save_sync_cursor(&acct(), "stale").unwrap();
        chaos.inner().save_megolm_session(&acct(), &megolm("old", b"x")).unwrap();
        let vault = KeyVault::open(Some(chaos.clone()), never()).unwrap();

        chaos.set_outage(true);
        vault.save_sync_cursor(&acct(), "tmp").unwrap();
        assert!(vault.wipe_account(&acct()).unwrap());
        vault.save_sync_cursor(&acct(), "fresh").unwrap();
        assert_eq!(vault.pending_replay_ops(), 1);

        chaos.set_outage(false);
        assert_eq!(vault.try_recover(), Mode::Durable);
        assert_eq!(vault.pending_replay_ops(), 0);
        assert_eq!(chaos.inner().load_sync_cursor(&acct()).unwrap().as_deref(), Some("fresh"));
        assert!(chaos.inner().load_megolm_sessions(&acct()).unwrap().is_empty());
    }

    #[test]
    fn test_reinit_replays_degraded_writes() {
        let chaos = Chaos::reliable(MemoryKeyStore::new());
        let vault = KeyVault::open(Some(chaos.clone()), never()).unwrap();

        chaos.set_outage(true);
        vault.save_megolm_session(&acct(), &megolm("s1", b"degraded-v1")).unwrap();
        chaos.set_outage(false);

        vault.ensure_schema().unwrap();
        assert_eq!(vault.mode(), Mode::Durable);
        assert_eq!(vault.fallback_accounts(), 0);
        let stored = chaos.inner().load_megolm_session(&acct(), "!r:x", "s1").unwrap().unwrap();
        assert_eq!(stored.pickle, b"degraded-v1");

        // A later outage must not resurrect the replayed write
        vault.save_megolm_session(&acct(), &megolm("s1", b"durable-v2")).unwrap();
        chaos.set_outage(true);
        vault.save_sync_cursor(&acct(), "t1").unwrap();
        chaos.set_outage(false);
        assert_eq!(vault.try_recover(), Mode::Durable);

        let stored = chaos.inner().load_megolm_session(&acct(), "!r:x", "s1").unwrap().unwrap();
        assert_eq!(stored.pickle, b"durable-v2");
        assert_eq!(chaos.inner().load_sync_cursor(&acct()).unwrap().as_deref(), Some("t1"));
    }

    #[test]
    fn test_reinit_while_durable_keeps_mode() {
        let chaos = Chaos::reliable(MemoryKeyStore::new());
        let vault = KeyVault::open(Some(chaos.clone()), never()).unwrap();
        vault.save_sync_cursor(&acct(), "t1").unwrap();

        assert_eq!(vault.init().unwrap(), Mode::Durable);
        assert_eq!(vault.downgrades(), 0);
        assert_eq!(chaos.inner().load_sync_cursor(&acct()).unwrap().as_deref(), Some("t1"));

        chaos.set_outage(true);
        assert_eq!(vault.init().unwrap(), Mode::Degraded);
        assert_eq!(vault.downgrades(), 1);
    }

    #[test]
    fn test_degraded_import_does_not_overwrite_backend() {
        let chaos = Chaos::reliable(MemoryKeyStore::new());
        chaos.inner().save_megolm_session(&acct(), &megolm("s1", b"live")).unwrap();
        let vault = KeyVault::open(Some(chaos.clone()), never()).unwrap();

        chaos.set_outage(true);
        let export = [megolm("s1", b"exported"), megolm("s2", b"exported")];
        assert_eq!(vault.import_room_keys(&acct(), &export).unwrap(), 2);
        assert_eq!(vault.import_room_keys(&acct(), &export).unwrap(), 0);
        assert_eq!(vault.pending_replay_ops(), 1);

        chaos.set_outage(false);
        assert_eq!(vault.try_recover(), Mode::Durable);
        assert_eq!(vault.pending_replay_ops(), 0);

        let durable = chaos.inner();
        assert_eq!(durable.load_megolm_session(&acct(), "!r:x", "s1").unwrap().unwrap().pickle, b"live");
        assert_eq!(durable.load_megolm_session(&acct(), "!r:x", "s2").unwrap().unwrap().pickle, b"exported");
    }

    #[test]
    fn test_degraded_save_supersedes_import() {
        let chaos = Chaos::reliable(MemoryKeyStore::new());
        chaos.inner().save_megolm_session(&acct(), &megolm("s1", b"live")).unwrap();
        let vault = KeyVault::open(Some(chaos.clone()), never()).unwrap();

        chaos.set_outage(true);
        vault.import_room_keys(&acct(), &[megolm("s1", b"exported")]).unwrap();
        vault.save_megolm_session(&acct(), &megolm("s1", b"advanced")).unwrap();
        assert_eq!(vault.pending_replay_ops(), 0);

        chaos.set_outage(false);
        assert_eq!(vault.try_recover(), Mode::Durable);
        let stored = chaos.inner().load_megolm_session(&acct(), "!r:x", "s1").unwrap().unwrap();
        assert_eq!(stored.pickle, b"advanced");
    }

    #[test]
    fn test_degraded_wipe_drops_pending_import() {
        let chaos = Chaos::reliable(MemoryKeyStore::new());
        let vault = KeyVault::open(Some(chaos.clone()), never()).unwrap();

        chaos.set_outage(true);
        vault.import_room_keys(&acct(), &[megolm("s1", b"exported")]).unwrap();
        vault.wipe_account(&acct()).unwrap();
        assert_eq!(vault.pending_replay_ops(), 1);

        chaos.set_outage(false);
        assert_eq!(vault.try_recover(), Mode::Durable);
        assert!(chaos.inner().load_megolm_sessions(&acct()).unwrap().is_empty());
    }

    #[test]
    fn test_replay_applies_device_delete() {
        let chaos = Chaos::reliable(MemoryKeyStore::new());
        let device = DeviceKey {
            user_id: "@peer:x".into(),
            device_id: "P".into(),
            key_bundle: vec![7],
            display_name: String::new(),
            deleted: false,
        };
        chaos.inner().save_device_key(&acct(), &device).unwrap();
        let vault = KeyVault::open(Some(chaos.clone()), never()).unwrap();

        chaos.set_outage(true);
        vault.delete_device_key(&acct(), "@peer:x", "P").unwrap();
        chaos.set_outage(false);
        assert_eq!(vault.try_recover(), Mode::Durable);

        let devices = chaos.inner().load_device_keys(&acct(), true).unwrap();
        assert!(devices[0].deleted);
    }

    #[test]
    fn test_recovery_check_every_nth_call() {
        let chaos = Chaos::reliable(MemoryKeyStore::new());
        let settings = RecoverySettings { check_every: 3, min_interval: Duration::ZERO };
        let vault = KeyVault::open(Some(chaos.clone()), settings).unwrap();

        chaos.set_outage(true);
        vault.save_sync_cursor(&acct(), "s1").unwrap();
        chaos.set_outage(false);

        vault.load_sync_cursor(&acct()).unwrap();
        vault.load_sync_cursor(&acct()).unwrap();
        assert_eq!(vault.mode(), Mode::Degraded);
        vault.load_sync_cursor(&acct()).unwrap();
        assert_eq!(vault.mode(), Mode::Durable);
    }

    #[test]
    fn test_stats_do_not_trigger_recovery() {
        let chaos = Chaos::reliable(MemoryKeyStore::new());
        chaos.set_outage(true);
        let vault = KeyVault::open(Some(chaos.clone()), eager()).unwrap();
        chaos.set_outage(false);

        vault.stats(&acct()).unwrap();
        assert_eq!(vault.mode(), Mode::Degraded);
        vault.load_account(&acct()).unwrap();
        assert_eq!(vault.mode(), Mode::Durable);
    }

    #[test]
    fn test_heartbeat_detects_outage() {
        let chaos = Chaos::reliable(MemoryKeyStore::new());
        let vault = KeyVault::open(Some(chaos.clone()), never()).unwrap();

        chaos.set_outage(true);
        assert_eq!(vault.heartbeat(), Mode::Degraded);
        assert_eq!(vault.downgrades(), 1);

        chaos.set_outage(false);
        assert_eq!(vault.heartbeat(), Mode::Durable);
    }

    #[test]
    fn test_conflict_is_not_absorbed() {
        struct Rejecting;
        impl KeyStore for Rejecting {
            fn backend(&self) -> &'static str {
                "rejecting"
            }
            fn probe(&self) -> Result<(), StoreError> {
                Ok(())
            }
            fn ensure_schema(&self) -> Result<(), StoreError> {
                Ok(())
            }
            fn save_account(&self, _: &AccountKey, _: &AccountRecord) -> Result<(), StoreError> {
                Err(StoreError::Conflict("accounts identity".into()))
            }
            fn load_account(&self, _: &AccountKey) -> Result<Option<AccountRecord>, StoreError> {
                Ok(None)
            }
            fn save_device_key(&self, _: &AccountKey, _: &DeviceKey) -> Result<(), StoreError> {
                Ok(())
            }
            fn delete_device_key(&self, _: &AccountKey, _: &str, _: &str) -> Result<bool, StoreError> {
                Ok(false)
            }
            fn load_device_keys(&self, _: &AccountKey, _: bool) -> Result<Vec<DeviceKey>, StoreError> {
                Ok(Vec::new())
            }
            fn save_olm_session(&self, _: &AccountKey, _: &OlmSession) -> Result<(), StoreError> {
                Ok(())
            }
            fn load_olm_sessions(&self, _: &AccountKey, _: &str) -> Result<Vec<OlmSession>, StoreError> {
                Ok(Vec::new())
            }
            fn load_all_olm_sessions(&self, _: &AccountKey) -> Result<Vec<OlmSession>, StoreError> {
                Ok(Vec::new())
            }
            fn save_megolm_session(&self, _: &AccountKey, _: &MegolmSession) -> Result<(), StoreError> {
                Ok(())
            }
            fn load_megolm_sessions(&self, _: &AccountKey) -> Result<Vec<MegolmSession>, StoreError> {
                Ok(Vec::new())
            }
            fn load_room_megolm_sessions(
                &self,
                _: &AccountKey,
                _: &str,
            ) -> Result<Vec<MegolmSession>, StoreError> {
                Ok(Vec::new())
            }
            fn load_megolm_session(
                &self,
                _: &AccountKey,
                _: &str,
                _: &str,
            ) -> Result<Option<MegolmSession>, StoreError> {
                Ok(None)
            }
            fn save_sync_cursor(&self, _: &AccountKey, _: &str) -> Result<(), StoreError> {
                Ok(())
            }
            fn load_sync_cursor(&self, _: &AccountKey) -> Result<Option<String>, StoreError> {
                Ok(None)
            }
            fn save_encrypted_room(&self, _: &AccountKey, _: &EncryptedRoom) -> Result<(), StoreError> {
                Ok(())
            }
            fn load_encrypted_rooms(&self, _: &AccountKey) -> Result<Vec<EncryptedRoom>, StoreError> {
                Ok(Vec::new())
            }
            fn stats(&self, _: &AccountKey) -> Result<AccountStats, StoreError> {
                Ok(AccountStats::default())
            }
            fn wipe_account(&self, _: &AccountKey) -> Result<bool, StoreError> {
                Ok(false)
            }
            fn list_accounts(&self) -> Result<Vec<AccountKey>, StoreError> {
                Ok(Vec::new())
            }
        }

        let vault = KeyVault::open(Some(Rejecting), never()).unwrap();
        let record = AccountRecord { pickle: b"acct".to_vec(), shared: false };
        let err = vault.save_account(&acct(), &record).unwrap_err();

        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(vault.mode(), Mode::Durable);
        assert_eq!(vault.fallback_accounts(), 0);
    }
}
