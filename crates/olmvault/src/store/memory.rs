//! Volatile in-memory key store.
//!
//! Used as the fallback while the durable backend is unreachable, and as a
//! reference implementation in tests. Upsert, ordering and isolation
//! semantics match the durable stores exactly; nothing survives a restart.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use super::KeyStore;
use crate::{
    error::StoreError,
    record::{
        AccountKey, AccountRecord, AccountSnapshot, AccountStats, DeviceKey, EncryptedRoom,
        MegolmSession, OlmSession,
    },
};

/// Everything held for one account. Maps are keyed by identity so upserts
/// replace in place and iteration order is deterministic.
#[derive(Default, Clone)]
struct AccountTables {
    account: Option<AccountRecord>,
    /// `(user_id, device_id)` -> device
    device_keys: BTreeMap<(String, String), DeviceKey>,
    /// `(sender_key, session_id)` -> session
    olm_sessions: BTreeMap<(String, String), OlmSession>,
    /// `(room_id, session_id)` -> session
    megolm_sessions: BTreeMap<(String, String), MegolmSession>,
    sync_cursor: Option<String>,
    encrypted_rooms: BTreeMap<String, EncryptedRoom>,
}

impl AccountTables {
    fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            account: self.account.clone(),
            device_keys: self.device_keys.values().cloned().collect(),
            olm_sessions: sort_by_recency(self.olm_sessions.values().cloned().collect()),
            megolm_sessions: self.megolm_sessions.values().cloned().collect(),
            sync_cursor: self.sync_cursor.clone(),
            encrypted_rooms: self.encrypted_rooms.values().cloned().collect(),
        }
    }
}

/// Most recently used first, ties by session id.
fn sort_by_recency(mut sessions: Vec<OlmSession>) -> Vec<OlmSession> {
    sessions.sort_by(|a, b| {
        b.last_used_ms.cmp(&a.last_used_ms).then_with(|| a.session_id.cmp(&b.session_id))
    });
    sessions
}

/// In-memory key store.
///
/// Clones share the same state. A single `RwLock` guards all accounts, so
/// every operation (including [`wipe_account`](KeyStore::wipe_account)) is
/// atomic with respect to every other.
#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    inner: Arc<RwLock<HashMap<AccountKey, AccountTables>>>,
}

impl MemoryKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // Every mutation is a single map operation, so a poisoned lock still
    // guards consistent data.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<AccountKey, AccountTables>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<AccountKey, AccountTables>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_account<T>(&self, account: &AccountKey, f: impl FnOnce(&AccountTables) -> T) -> T
    where
        T: Default,
    {
        self.read().get(account).map(f).unwrap_or_default()
    }

    fn with_account_mut<T>(
        &self,
        account: &AccountKey,
        f: impl FnOnce(&mut AccountTables) -> T,
    ) -> T {
        f(self.write().entry(account.clone()).or_default())
    }

    /// Number of accounts holding any record.
    pub fn account_count(&self) -> usize {
        self.read().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot of every account, for replay.
    pub fn snapshot_all(&self) -> Vec<(AccountKey, AccountSnapshot)> {
        let guard = self.read();
        let mut all: Vec<_> =
            guard.iter().map(|(key, tables)| (key.clone(), tables.snapshot())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Whether the store holds the given device for an account.
    pub fn has_device(&self, account: &AccountKey, user_id: &str, device_id: &str) -> bool {
        self.with_account(account, |tables| {
            tables.device_keys.contains_key(&(user_id.to_string(), device_id.to_string()))
        })
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.write().clear();
    }
}

impl KeyStore for MemoryKeyStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn probe(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn save_account(
        &self,
        account: &AccountKey,
        record: &AccountRecord,
    ) -> Result<(), StoreError> {
        self.with_account_mut(account, |tables| tables.account = Some(record.clone()));
        Ok(())
    }

    fn load_account(&self, account: &AccountKey) -> Result<Option<AccountRecord>, StoreError> {
        Ok(self.with_account(account, |tables| tables.account.clone()))
    }

    fn save_device_key(
        &self,
        account: &AccountKey,
        device: &DeviceKey,
    ) -> Result<(), StoreError> {
        self.with_account_mut(account, |tables| {
            tables
                .device_keys
                .insert((device.user_id.clone(), device.device_id.clone()), device.clone());
        });
        Ok(())
    }

    fn delete_device_key(
        &self,
        account: &AccountKey,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, StoreError> {
        let mut guard = self.write();
        let device = guard.get_mut(account).and_then(|tables| {
            tables.device_keys.get_mut(&(user_id.to_string(), device_id.to_string()))
        });
        Ok(match device {
            Some(device) => {
                device.deleted = true;
                true
            },
            None => false,
        })
    }

    fn load_device_keys(
        &self,
        account: &AccountKey,
        include_deleted: bool,
    ) -> Result<Vec<DeviceKey>, StoreError> {
        Ok(self.with_account(account, |tables| {
            tables
                .device_keys
                .values()
                .filter(|device| include_deleted || !device.deleted)
                .cloned()
                .collect()
        }))
    }

    fn save_olm_session(
        &self,
        account: &AccountKey,
        session: &OlmSession,
    ) -> Result<(), StoreError> {
        self.with_account_mut(account, |tables| {
            tables
                .olm_sessions
                .insert((session.sender_key.clone(), session.session_id.clone()), session.clone());
        });
        Ok(())
    }

    fn load_olm_sessions(
        &self,
        account: &AccountKey,
        sender_key: &str,
    ) -> Result<Vec<OlmSession>, StoreError> {
        let sessions = self.with_account(account, |tables| {
            tables
                .olm_sessions
                .values()
                .filter(|session| session.sender_key == sender_key)
                .cloned()
                .collect()
        });
        Ok(sort_by_recency(sessions))
    }

    fn load_all_olm_sessions(&self, account: &AccountKey) -> Result<Vec<OlmSession>, StoreError> {
        let sessions =
            self.with_account(account, |tables| tables.olm_sessions.values().cloned().collect());
        Ok(sort_by_recency(sessions))
    }

    fn save_megolm_session(
        &self,
        account: &AccountKey,
        session: &MegolmSession,
    ) -> Result<(), StoreError> {
        self.with_account_mut(account, |tables| {
            tables
                .megolm_sessions
                .insert((session.room_id.clone(), session.session_id.clone()), session.clone());
        });
        Ok(())
    }

    fn load_megolm_sessions(
        &self,
        account: &AccountKey,
    ) -> Result<Vec<MegolmSession>, StoreError> {
        Ok(self.with_account(account, |tables| tables.megolm_sessions.values().cloned().collect()))
    }

    fn load_room_megolm_sessions(
        &self,
        account: &AccountKey,
        room_id: &str,
    ) -> Result<Vec<MegolmSession>, StoreError> {
        Ok(self.with_account(account, |tables| {
            tables
                .megolm_sessions
                .values()
                .filter(|session| session.room_id == room_id)
                .cloned()
                .collect()
        }))
    }

    fn load_megolm_session(
        &self,
        account: &AccountKey,
        room_id: &str,
        session_id: &str,
    ) -> Result<Option<MegolmSession>, StoreError> {
        Ok(self.with_account(account, |tables| {
            tables.megolm_sessions.get(&(room_id.to_string(), session_id.to_string())).cloned()
        }))
    }

    fn save_sync_cursor(&self, account: &AccountKey, token: &str) -> Result<(), StoreError> {
        self.with_account_mut(account, |tables| tables.sync_cursor = Some(token.to_string()));
        Ok(())
    }

    fn load_sync_cursor(&self, account: &AccountKey) -> Result<Option<String>, StoreError> {
        Ok(self.with_account(account, |tables| tables.sync_cursor.clone()))
    }

    fn save_encrypted_room(
        &self,
        account: &AccountKey,
        room: &EncryptedRoom,
    ) -> Result<(), StoreError> {
        self.with_account_mut(account, |tables| {
            tables.encrypted_rooms.insert(room.room_id.clone(), room.clone());
        });
        Ok(())
    }

    fn load_encrypted_rooms(
        &self,
        account: &AccountKey,
    ) -> Result<Vec<EncryptedRoom>, StoreError> {
        Ok(self.with_account(account, |tables| tables.encrypted_rooms.values().cloned().collect()))
    }

    fn stats(&self, account: &AccountKey) -> Result<AccountStats, StoreError> {
        Ok(self.with_account(account, |tables| {
            let mut rooms: Vec<&str> =
                tables.megolm_sessions.keys().map(|(room, _)| room.as_str()).collect();
            rooms.dedup();
            AccountStats {
                account_present: tables.account.is_some(),
                session_count: tables.megolm_sessions.len() as u64,
                room_count: rooms.len() as u64,
                olm_session_count: tables.olm_sessions.len() as u64,
                device_count: tables.device_keys.values().filter(|d| !d.deleted).count() as u64,
                encrypted_room_count: tables.encrypted_rooms.len() as u64,
                has_sync_cursor: tables.sync_cursor.is_some(),
            }
        }))
    }

    fn wipe_account(&self, account: &AccountKey) -> Result<bool, StoreError> {
        Ok(self.write().remove(account).is_some())
    }

    fn list_accounts(&self) -> Result<Vec<AccountKey>, StoreError> {
        let mut keys: Vec<AccountKey> = self.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn export_account(&self, account: &AccountKey) -> Result<AccountSnapshot, StoreError> {
        Ok(self.with_account(account, AccountTables::snapshot))
    }
}
