//! Key store abstraction.
//!
//! The [`KeyStore`] trait is synchronous and object safe. Durable
//! implementations block on their driver; callers on an async runtime go
//! through [`crate::runtime::SharedVault`].
//!
//! # Write semantics
//!
//! Every `save_*` is an upsert on the record's identity key: saving the same
//! identity twice leaves exactly one record holding the second payload.
//! Records are scoped to one [`AccountKey`] and never visible to another.
//! Dependent writes do not require the account blob to exist.

mod chaotic;
mod memory;
mod postgres;
mod sqlite;

pub use chaotic::ChaoticKeyStore;
pub use memory::MemoryKeyStore;

pub use self::{postgres::PostgresKeyStore, sqlite::SqliteKeyStore};
use crate::{
    config::{BackendConfig, PoolSettings},
    error::StoreError,
    record::{
        AccountKey, AccountRecord, AccountSnapshot, AccountStats, DeviceKey, EncryptedRoom,
        MegolmSession, OlmSession,
    },
};

/// Persistence contract for Olm/Megolm state.
pub trait KeyStore: Send + Sync {
    /// Backend label for logs and health reports.
    fn backend(&self) -> &'static str;

    /// Cheap reachability check.
    fn probe(&self) -> Result<(), StoreError>;

    /// Create or complete the schema. Idempotent.
    fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Upsert the account blob.
    fn save_account(&self, account: &AccountKey, record: &AccountRecord)
    -> Result<(), StoreError>;

    /// Load the account blob, `None` if never saved.
    fn load_account(&self, account: &AccountKey) -> Result<Option<AccountRecord>, StoreError>;

    /// Upsert a remote device's keys on `(user_id, device_id)`.
    fn save_device_key(&self, account: &AccountKey, device: &DeviceKey)
    -> Result<(), StoreError>;

    /// Soft-delete a device key. Returns whether a row was marked.
    fn delete_device_key(
        &self,
        account: &AccountKey,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, StoreError>;

    /// Device keys ordered by user then device. Soft-deleted entries only
    /// when `include_deleted`.
    fn load_device_keys(
        &self,
        account: &AccountKey,
        include_deleted: bool,
    ) -> Result<Vec<DeviceKey>, StoreError>;

    /// Upsert an Olm session on `(sender_key, session_id)`.
    fn save_olm_session(&self, account: &AccountKey, session: &OlmSession)
    -> Result<(), StoreError>;

    /// Olm sessions with one remote device, most recently used first.
    fn load_olm_sessions(
        &self,
        account: &AccountKey,
        sender_key: &str,
    ) -> Result<Vec<OlmSession>, StoreError>;

    /// All Olm sessions, most recently used first.
    fn load_all_olm_sessions(&self, account: &AccountKey) -> Result<Vec<OlmSession>, StoreError>;

    /// Upsert a Megolm session on `(room_id, session_id)`.
    fn save_megolm_session(
        &self,
        account: &AccountKey,
        session: &MegolmSession,
    ) -> Result<(), StoreError>;

    /// Every Megolm session, ordered by room then session id.
    fn load_megolm_sessions(&self, account: &AccountKey)
    -> Result<Vec<MegolmSession>, StoreError>;

    /// Megolm sessions for one room, ordered by session id.
    fn load_room_megolm_sessions(
        &self,
        account: &AccountKey,
        room_id: &str,
    ) -> Result<Vec<MegolmSession>, StoreError>;

    /// One Megolm session.
    fn load_megolm_session(
        &self,
        account: &AccountKey,
        room_id: &str,
        session_id: &str,
    ) -> Result<Option<MegolmSession>, StoreError>;

    /// Replace the sync cursor.
    fn save_sync_cursor(&self, account: &AccountKey, token: &str) -> Result<(), StoreError>;

    /// Current sync cursor.
    fn load_sync_cursor(&self, account: &AccountKey) -> Result<Option<String>, StoreError>;

    /// Upsert a room's rotation policy.
    fn save_encrypted_room(&self, account: &AccountKey, room: &EncryptedRoom)
    -> Result<(), StoreError>;

    /// Rotation policies ordered by room id.
    fn load_encrypted_rooms(&self, account: &AccountKey)
    -> Result<Vec<EncryptedRoom>, StoreError>;

    /// Counters for one account from a single consistent read.
    fn stats(&self, account: &AccountKey) -> Result<AccountStats, StoreError>;

    /// Remove every record of the account atomically. Returns whether the
    /// account existed.
    fn wipe_account(&self, account: &AccountKey) -> Result<bool, StoreError>;

    /// Every account with at least one stored record.
    fn list_accounts(&self) -> Result<Vec<AccountKey>, StoreError>;

    /// Everything stored for an account.
    fn export_account(&self, account: &AccountKey) -> Result<AccountSnapshot, StoreError> {
        Ok(AccountSnapshot {
            account: self.load_account(account)?,
            device_keys: self.load_device_keys(account, true)?,
            olm_sessions: self.load_all_olm_sessions(account)?,
            megolm_sessions: self.load_megolm_sessions(account)?,
            sync_cursor: self.load_sync_cursor(account)?,
            encrypted_rooms: self.load_encrypted_rooms(account)?,
        })
    }

    /// Upsert every record of a snapshot. Records absent from the snapshot
    /// are left alone.
    fn import_account(
        &self,
        account: &AccountKey,
        snapshot: &AccountSnapshot,
    ) -> Result<(), StoreError> {
        if let Some(record) = &snapshot.account {
            self.save_account(account, record)?;
        }
        for device in &snapshot.device_keys {
            self.save_device_key(account, device)?;
        }
        for session in &snapshot.olm_sessions {
            self.save_olm_session(account, session)?;
        }
        for session in &snapshot.megolm_sessions {
            self.save_megolm_session(account, session)?;
        }
        if let Some(token) = &snapshot.sync_cursor {
            self.save_sync_cursor(account, token)?;
        }
        for room in &snapshot.encrypted_rooms {
            self.save_encrypted_room(account, room)?;
        }
        Ok(())
    }

    /// Megolm sessions of one room, for key export.
    fn export_room_keys(
        &self,
        account: &AccountKey,
        room_id: &str,
    ) -> Result<Vec<MegolmSession>, StoreError> {
        self.load_room_megolm_sessions(account, room_id)
    }

    /// Import exported Megolm sessions, skipping any already stored.
    /// Returns how many were imported.
    fn import_room_keys(
        &self,
        account: &AccountKey,
        sessions: &[MegolmSession],
    ) -> Result<usize, StoreError> {
        let mut imported = 0;
        for session in sessions {
            if self.load_megolm_session(account, &session.room_id, &session.session_id)?.is_none()
            {
                self.save_megolm_session(account, session)?;
                imported += 1;
            }
        }
        Ok(imported)
    }
}

/// Durable backend chosen at runtime from configuration.
pub enum DurableStore {
    /// SQLite file
    Sqlite(SqliteKeyStore),
    /// Postgres server
    Postgres(PostgresKeyStore),
}

impl DurableStore {
    /// Build the store for a backend. Opens no connection.
    pub fn open(backend: &BackendConfig, pool: PoolSettings) -> Self {
        match backend {
            BackendConfig::Sqlite { path } => Self::Sqlite(SqliteKeyStore::open(path, pool)),
            BackendConfig::Postgres(config) => {
                Self::Postgres(PostgresKeyStore::open(config, pool))
            },
        }
    }

    fn inner(&self) -> &dyn KeyStore {
        match self {
            Self::Sqlite(store) => store,
            Self::Postgres(store) => store,
        }
    }
}

impl KeyStore for DurableStore {
    fn backend(&self) -> &'static str {
        self.inner().backend()
    }

    fn probe(&self) -> Result<(), StoreError> {
        self.inner().probe()
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        self.inner().ensure_schema()
    }

    fn save_account(
        &self,
        account: &AccountKey,
        record: &AccountRecord,
    ) -> Result<(), StoreError> {
        self.inner().save_account(account, record)
    }

    fn load_account(&self, account: &AccountKey) -> Result<Option<AccountRecord>, StoreError> {
        self.inner().load_account(account)
    }

    fn save_device_key(
        &self,
        account: &AccountKey,
        device: &DeviceKey,
    ) -> Result<(), StoreError> {
        self.inner().save_device_key(account, device)
    }

    fn delete_device_key(
        &self,
        account: &AccountKey,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, StoreError> {
        self.inner().delete_device_key(account, user_id, device_id)
    }

    fn load_device_keys(
        &self,
        account: &AccountKey,
        include_deleted: bool,
    ) -> Result<Vec<DeviceKey>, StoreError> {
        self.inner().load_device_keys(account, include_deleted)
    }

    fn save_olm_session(
        &self,
        account: &AccountKey,
        session: &OlmSession,
    ) -> Result<(), StoreError> {
        self.inner().save_olm_session(account, session)
    }

    fn load_olm_sessions(
        &self,
        account: &AccountKey,
        sender_key: &str,
    ) -> Result<Vec<OlmSession>, StoreError> {
        self.inner().load_olm_sessions(account, sender_key)
    }

    fn load_all_olm_sessions(&self, account: &AccountKey) -> Result<Vec<OlmSession>, StoreError> {
        self.inner().load_all_olm_sessions(account)
    }

    fn save_megolm_session(
        &self,
        account: &AccountKey,
        session: &MegolmSession,
    ) -> Result<(), StoreError> {
        self.inner().save_megolm_session(account, session)
    }

    fn load_megolm_sessions(
        &self,
        account: &AccountKey,
    ) -> Result<Vec<MegolmSession>, StoreError> {
        self.inner().load_megolm_sessions(account)
    }

    fn load_room_megolm_sessions(
        &self,
        account: &AccountKey,
        room_id: &str,
    ) -> Result<Vec<MegolmSession>, StoreError> {
        self.inner().load_room_megolm_sessions(account, room_id)
    }

    fn load_megolm_session(
        &self,
        account: &AccountKey,
        room_id: &str,
        session_id: &str,
    ) -> Result<Option<MegolmSession>, StoreError> {
        self.inner().load_megolm_session(account, room_id, session_id)
    }

    fn save_sync_cursor(&self, account: &AccountKey, token: &str) -> Result<(), StoreError> {
        self.inner().save_sync_cursor(account, token)
    }

    fn load_sync_cursor(&self, account: &AccountKey) -> Result<Option<String>, StoreError> {
        self.inner().load_sync_cursor(account)
    }

    fn save_encrypted_room(
        &self,
        account: &AccountKey,
        room: &EncryptedRoom,
    ) -> Result<(), StoreError> {
        self.inner().save_encrypted_room(account, room)
    }

    fn load_encrypted_rooms(
        &self,
        account: &AccountKey,
    ) -> Result<Vec<EncryptedRoom>, StoreError> {
        self.inner().load_encrypted_rooms(account)
    }

    fn stats(&self, account: &AccountKey) -> Result<AccountStats, StoreError> {
        self.inner().stats(account)
    }

    fn wipe_account(&self, account: &AccountKey) -> Result<bool, StoreError> {
        self.inner().wipe_account(account)
    }

    fn list_accounts(&self) -> Result<Vec<AccountKey>, StoreError> {
        self.inner().list_accounts()
    }
}
