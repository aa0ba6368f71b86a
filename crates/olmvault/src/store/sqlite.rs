//! SQLite key store.
//!
//! One database file, pooled connections, WAL journal. Each connection is
//! configured on open with foreign keys on and a busy timeout so concurrent
//! writers queue instead of failing.

use std::{path::Path, time::Duration};

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Params, Transaction, TransactionBehavior, params,
};

use super::KeyStore;
use crate::{
    codec,
    config::PoolSettings,
    error::StoreError,
    pool::{ConnectionManager, Handle},
    record::{
        AccountKey, AccountRecord, AccountStats, DeviceKey, EncryptedRoom, MegolmSession,
        OlmSession, now_ms,
    },
    schema::{self, Dialect, ExistingColumn, SchemaConnection, SchemaError},
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Key store backed by a SQLite file.
#[derive(Clone)]
pub struct SqliteKeyStore {
    connections: ConnectionManager<SqliteConnectionManager>,
}

impl SqliteKeyStore {
    /// Pool for the database at `path`. Opens no connection; a path whose
    /// directory does not exist makes every operation `Unavailable`.
    pub fn open(path: impl AsRef<Path>, settings: PoolSettings) -> Self {
        let manager = SqliteConnectionManager::file(path).with_init(configure_connection);
        Self { connections: ConnectionManager::new(manager, settings) }
    }

    /// The underlying Connection Manager.
    pub fn connections(&self) -> &ConnectionManager<SqliteConnectionManager> {
        &self.connections
    }

    fn conn(&self) -> Result<Handle<SqliteConnectionManager>, StoreError> {
        self.connections.acquire()
    }
}

fn configure_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Map a driver error onto the store taxonomy.
fn map_err(entity: &'static str, err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation => StoreError::Conflict(format!("{entity}: {err}")),
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::OutOfMemory => StoreError::Unavailable(format!("sqlite: {err}")),
            _ => StoreError::Backend(format!("sqlite {entity}: {err}")),
        },
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..)
        | rusqlite::Error::Utf8Error(..) => StoreError::malformed(entity, err),
        _ => StoreError::Backend(format!("sqlite {entity}: {err}")),
    }
}

/// Resolve the account row id, creating an anchor row (NULL pickle) when the
/// account has not been saved yet.
fn anchor(conn: &Connection, account: &AccountKey, now: i64) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO accounts (user_id, device_id, pickle, shared, created_at, updated_at) \
         VALUES (?1, ?2, NULL, FALSE, ?3, ?3) ON CONFLICT (user_id, device_id) DO NOTHING",
        params![account.user_id, account.device_id, now],
    )
    .map_err(|e| map_err("account", e))?;
    conn.query_row(
        "SELECT id FROM accounts WHERE user_id = ?1 AND device_id = ?2",
        params![account.user_id, account.device_id],
        |row| row.get(0),
    )
    .map_err(|e| map_err("account", e))
}

fn query_olm<P: Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> Result<Vec<OlmSession>, StoreError> {
    let sql = format!(
        "SELECT o.sender_key, o.session_id, o.pickle, o.session_created_at, o.last_used_at \
         FROM olm_sessions o JOIN accounts a ON a.id = o.account_id \
         WHERE a.user_id = ?1 AND a.device_id = ?2{filter} \
         ORDER BY o.last_used_at DESC, o.session_id"
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| map_err("olm session", e))?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(OlmSession {
                sender_key: row.get(0)?,
                session_id: row.get(1)?,
                pickle: row.get(2)?,
                created_at_ms: row.get(3)?,
                last_used_ms: row.get(4)?,
            })
        })
        .map_err(|e| map_err("olm session", e))?;
    rows.map(|row| row.map_err(|e| map_err("olm session", e))).collect()
}

struct RawMegolm {
    room_id: String,
    session_id: String,
    sender_key: String,
    pickle: Vec<u8>,
    signing_keys: Vec<u8>,
    forwarding_chain: Vec<u8>,
    created_at_ms: i64,
}

impl RawMegolm {
    fn decode(self) -> Result<MegolmSession, StoreError> {
        Ok(MegolmSession {
            signing_keys: codec::decode_signing_keys(&self.signing_keys)?,
            forwarding_chain: codec::decode_forwarding_chain(&self.forwarding_chain)?,
            room_id: self.room_id,
            session_id: self.session_id,
            sender_key: self.sender_key,
            pickle: self.pickle,
            created_at_ms: self.created_at_ms,
        })
    }
}

fn query_megolm<P: Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> Result<Vec<MegolmSession>, StoreError> {
    let sql = format!(
        "SELECT m.room_id, m.session_id, m.sender_key, m.pickle, m.signing_keys, \
         m.forwarding_chain, m.session_created_at \
         FROM megolm_inbound_sessions m JOIN accounts a ON a.id = m.account_id \
         WHERE a.user_id = ?1 AND a.device_id = ?2{filter} \
         ORDER BY m.room_id, m.session_id"
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| map_err("megolm session", e))?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(RawMegolm {
                room_id: row.get(0)?,
                session_id: row.get(1)?,
                sender_key: row.get(2)?,
                pickle: row.get(3)?,
                signing_keys: row.get(4)?,
                forwarding_chain: row.get(5)?,
                created_at_ms: row.get(6)?,
            })
        })
        .map_err(|e| map_err("megolm session", e))?;
    rows.map(|row| row.map_err(|e| map_err("megolm session", e)).and_then(RawMegolm::decode))
        .collect()
}

impl KeyStore for SqliteKeyStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn probe(&self) -> Result<(), StoreError> {
        self.connections.check()
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_err("schema", e))?;
        schema::apply(&mut SqliteSchema { tx: &tx })?;
        tx.commit().map_err(|e| map_err("schema", e))
    }

    fn save_account(
        &self,
        account: &AccountKey,
        record: &AccountRecord,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO accounts (user_id, device_id, pickle, shared, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5) ON CONFLICT (user_id, device_id) DO UPDATE SET \
             pickle = excluded.pickle, shared = excluded.shared, updated_at = excluded.updated_at",
            params![account.user_id, account.device_id, record.pickle, record.shared, now_ms()],
        )
        .map_err(|e| map_err("account", e))?;
        Ok(())
    }

    fn load_account(&self, account: &AccountKey) -> Result<Option<AccountRecord>, StoreError> {
        let conn = self.conn()?;
        let row: Option<(Option<Vec<u8>>, bool)> = conn
            .query_row(
                "SELECT pickle, shared FROM accounts WHERE user_id = ?1 AND device_id = ?2",
                params![account.user_id, account.device_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| map_err("account", e))?;
        Ok(row.and_then(|(pickle, shared)| pickle.map(|pickle| AccountRecord { pickle, shared })))
    }

    fn save_device_key(
        &self,
        account: &AccountKey,
        device: &DeviceKey,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let now = now_ms();
        let account_id = anchor(&conn, account, now)?;
        conn.execute(
            "INSERT INTO device_keys (account_id, user_id, device_id, key_bundle, display_name, \
             deleted, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7) \
             ON CONFLICT (account_id, user_id, device_id) DO UPDATE SET \
             key_bundle = excluded.key_bundle, display_name = excluded.display_name, \
             deleted = excluded.deleted, updated_at = excluded.updated_at",
            params![
                account_id,
                device.user_id,
                device.device_id,
                device.key_bundle,
                device.display_name,
                device.deleted,
                now
            ],
        )
        .map_err(|e| map_err("device key", e))?;
        Ok(())
    }

    fn delete_device_key(
        &self,
        account: &AccountKey,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE device_keys SET deleted = TRUE, updated_at = ?5 \
                 WHERE user_id = ?3 AND device_id = ?4 AND account_id = \
                 (SELECT id FROM accounts WHERE user_id = ?1 AND device_id = ?2)",
                params![account.user_id, account.device_id, user_id, device_id, now_ms()],
            )
            .map_err(|e| map_err("device key", e))?;
        Ok(changed > 0)
    }

    fn load_device_keys(
        &self,
        account: &AccountKey,
        include_deleted: bool,
    ) -> Result<Vec<DeviceKey>, StoreError> {
        let conn = self.conn()?;
        let filter = if include_deleted { "" } else { " AND d.deleted = FALSE" };
        let sql = format!(
            "SELECT d.user_id, d.device_id, d.key_bundle, d.display_name, d.deleted \
             FROM device_keys d JOIN accounts a ON a.id = d.account_id \
             WHERE a.user_id = ?1 AND a.device_id = ?2{filter} ORDER BY d.user_id, d.device_id"
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| map_err("device key", e))?;
        let rows = stmt
            .query_map(params![account.user_id, account.device_id], |row| {
                Ok(DeviceKey {
                    user_id: row.get(0)?,
                    device_id: row.get(1)?,
                    key_bundle: row.get(2)?,
                    display_name: row.get(3)?,
                    deleted: row.get(4)?,
                })
            })
            .map_err(|e| map_err("device key", e))?;
        rows.map(|row| row.map_err(|e| map_err("device key", e))).collect()
    }

    fn save_olm_session(
        &self,
        account: &AccountKey,
        session: &OlmSession,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let now = now_ms();
        let account_id = anchor(&conn, account, now)?;
        conn.execute(
            "INSERT INTO olm_sessions (account_id, sender_key, session_id, pickle, \
             session_created_at, last_used_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7) \
             ON CONFLICT (account_id, sender_key, session_id) DO UPDATE SET \
             pickle = excluded.pickle, session_created_at = excluded.session_created_at, \
             last_used_at = excluded.last_used_at, updated_at = excluded.updated_at",
            params![
                account_id,
                session.sender_key,
                session.session_id,
                session.pickle,
                session.created_at_ms,
                session.last_used_ms,
                now
            ],
        )
        .map_err(|e| map_err("olm session", e))?;
        Ok(())
    }

    fn load_olm_sessions(
        &self,
        account: &AccountKey,
        sender_key: &str,
    ) -> Result<Vec<OlmSession>, StoreError> {
        let conn = self.conn()?;
        query_olm(
            &conn,
            " AND o.sender_key = ?3",
            params![account.user_id, account.device_id, sender_key],
        )
    }

    fn load_all_olm_sessions(&self, account: &AccountKey) -> Result<Vec<OlmSession>, StoreError> {
        let conn = self.conn()?;
        query_olm(&conn, "", params![account.user_id, account.device_id])
    }

    fn save_megolm_session(
        &self,
        account: &AccountKey,
        session: &MegolmSession,
    ) -> Result<(), StoreError> {
        let signing_keys = codec::encode_signing_keys(&session.signing_keys)?;
        let forwarding_chain = codec::encode_forwarding_chain(&session.forwarding_chain)?;
        let conn = self.conn()?;
        let now = now_ms();
        let account_id = anchor(&conn, account, now)?;
        conn.execute(
            "INSERT INTO megolm_inbound_sessions (account_id, room_id, session_id, sender_key, \
             pickle, signing_keys, forwarding_chain, session_created_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9) \
             ON CONFLICT (account_id, room_id, session_id) DO UPDATE SET \
             sender_key = excluded.sender_key, pickle = excluded.pickle, \
             signing_keys = excluded.signing_keys, forwarding_chain = excluded.forwarding_chain, \
             session_created_at = excluded.session_created_at, updated_at = excluded.updated_at",
            params![
                account_id,
                session.room_id,
                session.session_id,
                session.sender_key,
                session.pickle,
                signing_keys,
                forwarding_chain,
                session.created_at_ms,
                now
            ],
        )
        .map_err(|e| map_err("megolm session", e))?;
        Ok(())
    }

    fn load_megolm_sessions(
        &self,
        account: &AccountKey,
    ) -> Result<Vec<MegolmSession>, StoreError> {
        let conn = self.conn()?;
        query_megolm(&conn, "", params![account.user_id, account.device_id])
    }

    fn load_room_megolm_sessions(
        &self,
        account: &AccountKey,
        room_id: &str,
    ) -> Result<Vec<MegolmSession>, StoreError> {
        let conn = self.conn()?;
        query_megolm(
            &conn,
            " AND m.room_id = ?3",
            params![account.user_id, account.device_id, room_id],
        )
    }

    fn load_megolm_session(
        &self,
        account: &AccountKey,
        room_id: &str,
        session_id: &str,
    ) -> Result<Option<MegolmSession>, StoreError> {
        let conn = self.conn()?;
        let sessions = query_megolm(
            &conn,
            " AND m.room_id = ?3 AND m.session_id = ?4",
            params![account.user_id, account.device_id, room_id, session_id],
        )?;
        Ok(sessions.into_iter().next())
    }

    fn save_sync_cursor(&self, account: &AccountKey, token: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let now = now_ms();
        let account_id = anchor(&conn, account, now)?;
        conn.execute(
            "INSERT INTO sync_cursors (account_id, token, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?3) ON CONFLICT (account_id) DO UPDATE SET \
             token = excluded.token, updated_at = excluded.updated_at",
            params![account_id, token, now],
        )
        .map_err(|e| map_err("sync cursor", e))?;
        Ok(())
    }

    fn load_sync_cursor(&self, account: &AccountKey) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT s.token FROM sync_cursors s JOIN accounts a ON a.id = s.account_id \
             WHERE a.user_id = ?1 AND a.device_id = ?2",
            params![account.user_id, account.device_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| map_err("sync cursor", e))
    }

    fn save_encrypted_room(
        &self,
        account: &AccountKey,
        room: &EncryptedRoom,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let now = now_ms();
        let account_id = anchor(&conn, account, now)?;
        conn.execute(
            "INSERT INTO encrypted_rooms (account_id, room_id, rotation_period_ms, \
             rotation_messages, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
             ON CONFLICT (account_id, room_id) DO UPDATE SET \
             rotation_period_ms = excluded.rotation_period_ms, \
             rotation_messages = excluded.rotation_messages, updated_at = excluded.updated_at",
            params![
                account_id,
                room.room_id,
                room.rotation_period_ms,
                room.rotation_messages,
                now
            ],
        )
        .map_err(|e| map_err("encrypted room", e))?;
        Ok(())
    }

    fn load_encrypted_rooms(
        &self,
        account: &AccountKey,
    ) -> Result<Vec<EncryptedRoom>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT r.room_id, r.rotation_period_ms, r.rotation_messages \
                 FROM encrypted_rooms r JOIN accounts a ON a.id = r.account_id \
                 WHERE a.user_id = ?1 AND a.device_id = ?2 ORDER BY r.room_id",
            )
            .map_err(|e| map_err("encrypted room", e))?;
        let rows = stmt
            .query_map(params![account.user_id, account.device_id], |row| {
                Ok(EncryptedRoom {
                    room_id: row.get(0)?,
                    rotation_period_ms: row.get(1)?,
                    rotation_messages: row.get(2)?,
                })
            })
            .map_err(|e| map_err("encrypted room", e))?;
        rows.map(|row| row.map_err(|e| map_err("encrypted room", e))).collect()
    }

    fn stats(&self, account: &AccountKey) -> Result<AccountStats, StoreError> {
        let conn = self.conn()?;
        let stats = conn
            .query_row(
                "SELECT a.pickle IS NOT NULL, \
                 (SELECT COUNT(*) FROM megolm_inbound_sessions WHERE account_id = a.id), \
                 (SELECT COUNT(DISTINCT room_id) FROM megolm_inbound_sessions \
                  WHERE account_id = a.id), \
                 (SELECT COUNT(*) FROM olm_sessions WHERE account_id = a.id), \
                 (SELECT COUNT(*) FROM device_keys WHERE account_id = a.id AND deleted = FALSE), \
                 (SELECT COUNT(*) FROM encrypted_rooms WHERE account_id = a.id), \
                 EXISTS (SELECT 1 FROM sync_cursors WHERE account_id = a.id) \
                 FROM accounts a WHERE a.user_id = ?1 AND a.device_id = ?2",
                params![account.user_id, account.device_id],
                |row| {
                    Ok(AccountStats {
                        account_present: row.get(0)?,
                        session_count: row.get::<_, i64>(1)? as u64,
                        room_count: row.get::<_, i64>(2)? as u64,
                        olm_session_count: row.get::<_, i64>(3)? as u64,
                        device_count: row.get::<_, i64>(4)? as u64,
                        encrypted_room_count: row.get::<_, i64>(5)? as u64,
                        has_sync_cursor: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(|e| map_err("stats", e))?;
        Ok(stats.unwrap_or_default())
    }

    fn wipe_account(&self, account: &AccountKey) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_err("account", e))?;
        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM accounts WHERE user_id = ?1 AND device_id = ?2",
                params![account.user_id, account.device_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| map_err("account", e))?;
        let Some(id) = id else {
            return Ok(false);
        };
        for table in schema::TABLES.iter().skip(1).rev() {
            tx.execute(&format!("DELETE FROM {} WHERE account_id = ?1", table.name), [id])
                .map_err(|e| map_err("account", e))?;
        }
        tx.execute("DELETE FROM accounts WHERE id = ?1", [id])
            .map_err(|e| map_err("account", e))?;
        tx.commit().map_err(|e| map_err("account", e))?;
        Ok(true)
    }

    fn list_accounts(&self) -> Result<Vec<AccountKey>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT user_id, device_id FROM accounts ORDER BY user_id, device_id")
            .map_err(|e| map_err("account", e))?;
        let rows = stmt
            .query_map([], |row| Ok(AccountKey { user_id: row.get(0)?, device_id: row.get(1)? }))
            .map_err(|e| map_err("account", e))?;
        rows.map(|row| row.map_err(|e| map_err("account", e))).collect()
    }
}

/// Schema gate primitives over one SQLite transaction.
struct SqliteSchema<'a, 'conn> {
    tx: &'a Transaction<'conn>,
}

fn ddl_err(err: rusqlite::Error) -> StoreError {
    match map_err("schema", err) {
        StoreError::Unavailable(reason) => StoreError::Unavailable(reason),
        other => SchemaError::Statement(other.to_string()).into(),
    }
}

impl SchemaConnection for SqliteSchema<'_, '_> {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute_ddl(&mut self, sql: &str) -> Result<(), StoreError> {
        self.tx.execute_batch(sql).map_err(ddl_err)
    }

    fn columns(&mut self, table: &str) -> Result<Vec<ExistingColumn>, StoreError> {
        let mut stmt = self.tx.prepare("SELECT * FROM pragma_table_info(?1)").map_err(ddl_err)?;
        let rows = stmt
            .query_map([table], |row| {
                Ok(ExistingColumn {
                    name: row.get(1)?,
                    data_type: row.get(2)?,
                    nullable: !row.get::<_, bool>(3)?,
                })
            })
            .map_err(ddl_err)?;
        rows.map(|row| row.map_err(ddl_err)).collect()
    }

    fn recorded_version(&mut self) -> Result<Option<i64>, StoreError> {
        self.tx
            .query_row(&format!("SELECT MAX(version) FROM {}", schema::VERSION_TABLE), [], |row| {
                row.get(0)
            })
            .map_err(ddl_err)
    }

    fn record_version(&mut self, version: i64) -> Result<(), StoreError> {
        self.tx
            .execute(
                &format!(
                    "INSERT INTO {} (version, applied_at) VALUES (?1, ?2) \
                     ON CONFLICT (version) DO NOTHING",
                    schema::VERSION_TABLE
                ),
                params![version, now_ms()],
            )
            .map_err(ddl_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(code: std::ffi::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_constraint_violation_is_conflict() {
        let err = map_err("megolm session", failure(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE));
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_busy_and_cantopen_are_unavailable() {
        assert!(map_err("account", failure(rusqlite::ffi::SQLITE_BUSY)).is_unavailable());
        assert!(map_err("account", failure(rusqlite::ffi::SQLITE_CANTOPEN)).is_unavailable());
    }

    #[test]
    fn test_decode_failure_is_malformed() {
        let err = map_err(
            "account",
            rusqlite::Error::InvalidColumnType(0, "pickle".into(), rusqlite::types::Type::Text),
        );
        assert!(matches!(err, StoreError::Malformed { entity: "account", .. }));
    }

    #[test]
    fn test_ddl_failure_is_schema_error() {
        let err = ddl_err(failure(rusqlite::ffi::SQLITE_ERROR));
        assert!(matches!(err, StoreError::Schema(SchemaError::Statement(_))));
    }
}
