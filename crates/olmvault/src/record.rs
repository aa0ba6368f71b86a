//! Records persisted by the key store.
//!
//! Every blob field (`pickle`, `key_bundle`) is opaque: the store writes and
//! returns exactly the bytes it was given and never looks inside them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default Megolm rotation period for encrypted rooms (one week).
pub const DEFAULT_ROTATION_PERIOD_MS: i64 = 604_800_000;

/// Default Megolm rotation message count for encrypted rooms.
pub const DEFAULT_ROTATION_MESSAGES: i64 = 100;

/// Identity of one local Olm account: the bot's user and device.
///
/// Every other record is scoped to exactly one `AccountKey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountKey {
    /// Matrix user id, e.g. `@bot:example.org`
    pub user_id: String,
    /// Matrix device id
    pub device_id: String,
}

impl AccountKey {
    /// Build a key from user and device ids.
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), device_id: device_id.into() }
    }
}

impl std::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.device_id)
    }
}

/// The pickled Olm account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Opaque pickled account
    pub pickle: Vec<u8>,
    /// Whether the device keys have been published to the homeserver
    pub shared: bool,
}

/// A remote device's published keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKey {
    /// Owner of the remote device
    pub user_id: String,
    /// Remote device id
    pub device_id: String,
    /// Opaque serialized key bundle
    pub key_bundle: Vec<u8>,
    /// Human readable device name, empty when unknown
    pub display_name: String,
    /// Soft-delete flag; deleted rows are kept but hidden by default
    pub deleted: bool,
}

/// A pairwise Olm session with one remote device.
///
/// Identity: `(account, sender_key, session_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmSession {
    /// Curve25519 identity key of the remote device
    pub sender_key: String,
    /// Session identifier
    pub session_id: String,
    /// Opaque pickled session
    pub pickle: Vec<u8>,
    /// When the session was established (ms since epoch)
    pub created_at_ms: i64,
    /// When the session last encrypted or decrypted (ms since epoch)
    pub last_used_ms: i64,
}

/// An inbound Megolm group session.
///
/// Identity: `(account, room_id, session_id)`. Re-saving the same identity
/// replaces the ratchet state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MegolmSession {
    /// Room the session decrypts
    pub room_id: String,
    /// Session identifier
    pub session_id: String,
    /// Curve25519 key of the sending device
    pub sender_key: String,
    /// Opaque pickled ratchet state
    pub pickle: Vec<u8>,
    /// Claimed signing keys by algorithm
    pub signing_keys: BTreeMap<String, String>,
    /// Curve25519 keys the session was forwarded through
    pub forwarding_chain: Vec<String>,
    /// When the session was received (ms since epoch)
    pub created_at_ms: i64,
}

/// Megolm rotation policy for a room the account encrypts in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRoom {
    /// Room id
    pub room_id: String,
    /// Rotate the outbound session after this many milliseconds
    pub rotation_period_ms: i64,
    /// Rotate the outbound session after this many messages
    pub rotation_messages: i64,
}

impl EncryptedRoom {
    /// Room with the default rotation policy.
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            rotation_period_ms: DEFAULT_ROTATION_PERIOD_MS,
            rotation_messages: DEFAULT_ROTATION_MESSAGES,
        }
    }
}

/// Per-account counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStats {
    /// Whether an account blob has been saved
    pub account_present: bool,
    /// Inbound Megolm sessions
    pub session_count: u64,
    /// Distinct rooms with at least one Megolm session
    pub room_count: u64,
    /// Pairwise Olm sessions
    pub olm_session_count: u64,
    /// Device keys that are not soft-deleted
    pub device_count: u64,
    /// Rooms with a stored rotation policy
    pub encrypted_room_count: u64,
    /// Whether a sync cursor is stored
    pub has_sync_cursor: bool,
}

/// Everything stored for one account.
///
/// Used for fallback replay, backend migration and backups. Device keys
/// include soft-deleted entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Account blob, absent when only dependent records exist
    pub account: Option<AccountRecord>,
    /// Device keys, including soft-deleted ones
    pub device_keys: Vec<DeviceKey>,
    /// Olm sessions
    pub olm_sessions: Vec<OlmSession>,
    /// Megolm sessions
    pub megolm_sessions: Vec<MegolmSession>,
    /// Sync cursor
    pub sync_cursor: Option<String>,
    /// Rotation policies
    pub encrypted_rooms: Vec<EncryptedRoom>,
}

impl AccountSnapshot {
    /// Whether the snapshot holds nothing at all.
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.device_keys.is_empty()
            && self.olm_sessions.is_empty()
            && self.megolm_sessions.is_empty()
            && self.sync_cursor.is_none()
            && self.encrypted_rooms.is_empty()
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
