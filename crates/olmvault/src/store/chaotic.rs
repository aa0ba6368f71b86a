//! Chaotic key store wrapper for fault injection testing
//!
//! Delegates to an inner store but fails operations with
//! [`StoreError::Unavailable`], either at random (seeded, reproducible) or
//! unconditionally while an outage is switched on. Used to drive the
//! degradation controller through downgrade and recovery.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use super::KeyStore;
use crate::{
    error::StoreError,
    record::{
        AccountKey, AccountRecord, AccountStats, DeviceKey, EncryptedRoom, MegolmSession,
        OlmSession,
    },
};

/// Key store wrapper that injects unavailability.
#[derive(Clone)]
pub struct ChaoticKeyStore<S> {
    inner: S,
    chaos: Arc<Mutex<Chaos>>,
    /// Operation counter, failed attempts included
    operation_count: Arc<AtomicUsize>,
}

struct Chaos {
    rng: ChaoticRng,
    /// 0.0 = never fail, 1.0 = always fail
    failure_rate: f64,
    outage: bool,
}

/// Linear congruential generator, deterministic per seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

fn check_rate(failure_rate: f64) {
    assert!(
        (0.0..=1.0).contains(&failure_rate),
        "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
    );
}

impl<S: KeyStore> ChaoticKeyStore<S> {
    /// Wrap `inner`, failing each operation with probability `failure_rate`.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Wrap with an explicit seed for reproducible chaos.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        check_rate(failure_rate);
        Self {
            inner,
            chaos: Arc::new(Mutex::new(Chaos {
                rng: ChaoticRng { state: seed },
                failure_rate,
                outage: false,
            })),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wrap with no random failures; use [`set_outage`](Self::set_outage) to
    /// take the store down.
    pub fn reliable(inner: S) -> Self {
        Self::new(inner, 0.0)
    }

    /// Underlying store (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Operations attempted so far.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Switch a total outage on or off.
    pub fn set_outage(&self, outage: bool) {
        self.chaos().outage = outage;
    }

    /// Change the random failure rate.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn set_failure_rate(&self, failure_rate: f64) {
        check_rate(failure_rate);
        self.chaos().failure_rate = failure_rate;
    }

    fn chaos(&self) -> std::sync::MutexGuard<'_, Chaos> {
        self.chaos.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the operation and decide whether it fails.
    fn gate(&self) -> Result<(), StoreError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        let mut chaos = self.chaos();
        if chaos.outage {
            return Err(StoreError::Unavailable("chaotic outage".to_string()));
        }
        let failure_rate = chaos.failure_rate;
        if chaos.rng.next() < failure_rate {
            return Err(StoreError::Unavailable("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<S: KeyStore> KeyStore for ChaoticKeyStore<S> {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    fn probe(&self) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.probe()
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.ensure_schema()
    }

    fn save_account(
        &self,
        account: &AccountKey,
        record: &AccountRecord,
    ) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.save_account(account, record)
    }

    fn load_account(&self, account: &AccountKey) -> Result<Option<AccountRecord>, StoreError> {
        self.gate()?;
        self.inner.load_account(account)
    }

    fn save_device_key(
        &self,
        account: &AccountKey,
        device: &DeviceKey,
    ) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.save_device_key(account, device)
    }

    fn delete_device_key(
        &self,
        account: &AccountKey,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, StoreError> {
        self.gate()?;
        self.inner.delete_device_key(account, user_id, device_id)
    }

    fn load_device_keys(
        &self,
        account: &AccountKey,
        include_deleted: bool,
    ) -> Result<Vec<DeviceKey>, StoreError> {
        self.gate()?;
        self.inner.load_device_keys(account, include_deleted)
    }

    fn save_olm_session(
        &self,
        account: &AccountKey,
        session: &OlmSession,
    ) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.save_olm_session(account, session)
    }

    fn load_olm_sessions(
        &self,
        account: &AccountKey,
        sender_key: &str,
    ) -> Result<Vec<OlmSession>, StoreError> {
        self.gate()?;
        self.inner.load_olm_sessions(account, sender_key)
    }

    fn load_all_olm_sessions(&self, account: &AccountKey) -> Result<Vec<OlmSession>, StoreError> {
        self.gate()?;
        self.inner.load_all_olm_sessions(account)
    }

    fn save_megolm_session(
        &self,
        account: &AccountKey,
        session: &MegolmSession,
    ) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.save_megolm_session(account, session)
    }

    fn load_megolm_sessions(
        &self,
        account: &AccountKey,
    ) -> Result<Vec<MegolmSession>, StoreError> {
        self.gate()?;
        self.inner.load_megolm_sessions(account)
    }

    fn load_room_megolm_sessions(
        &self,
        account: &AccountKey,
        room_id: &str,
    ) -> Result<Vec<MegolmSession>, StoreError> {
        self.gate()?;
        self.inner.load_room_megolm_sessions(account, room_id)
    }

    fn load_megolm_session(
        &self,
        account: &AccountKey,
        room_id: &str,
        session_id: &str,
    ) -> Result<Option<MegolmSession>, StoreError> {
        self.gate()?;
        self.inner.load_megolm_session(account, room_id, session_id)
    }

    fn save_sync_cursor(&self, account: &AccountKey, token: &str) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.save_sync_cursor(account, token)
    }

    fn load_sync_cursor(&self, account: &AccountKey) -> Result<Option<String>, StoreError> {
        self.gate()?;
        self.inner.load_sync_cursor(account)
    }

    fn save_encrypted_room(
        &self,
        account: &AccountKey,
        room: &EncryptedRoom,
    ) -> Result<(), StoreError> {
        self.gate()?;
        self.inner.save_encrypted_room(account, room)
    }

    fn load_encrypted_rooms(
        &self,
        account: &AccountKey,
    ) -> Result<Vec<EncryptedRoom>, StoreError> {
        self.gate()?;
        self.inner.load_encrypted_rooms(account)
    }

    fn stats(&self, account: &AccountKey) -> Result<AccountStats, StoreError> {
        self.gate()?;
        self.inner.stats(account)
    }

    fn wipe_account(&self, account: &AccountKey) -> Result<bool, StoreError> {
        self.gate()?;
        self.inner.wipe_account(account)
    }

    fn list_accounts(&self) -> Result<Vec<AccountKey>, StoreError> {
        self.gate()?;
        self.inner.list_accounts()
    }
}
