//! Postgres key store.
//!
//! Uses the blocking `postgres` client pooled through `r2d2_postgres`. The
//! client drives its own runtime internally, so operations must not run on an
//! async executor thread; see [`crate::runtime`].

use r2d2_postgres::{
    PostgresConnectionManager,
    postgres::{
        self, NoTls, Row, Transaction,
        types::{FromSql, ToSql},
    },
};

use super::KeyStore;
use crate::{
    codec,
    config::{PoolSettings, PostgresConfig},
    error::StoreError,
    pool::{ConnectionManager, Handle},
    record::{
        AccountKey, AccountRecord, AccountStats, DeviceKey, EncryptedRoom, MegolmSession,
        OlmSession, now_ms,
    },
    schema::{self, Dialect, ExistingColumn, SchemaConnection, SchemaError},
};

type Manager = PostgresConnectionManager<NoTls>;

/// Advisory lock key serialising schema migration across processes.
const SCHEMA_LOCK_KEY: i64 = 0x6f6c_6d76_6175_6c74;

/// Key store backed by a Postgres server.
pub struct PostgresKeyStore {
    connections: Option<ConnectionManager<Manager>>,
}

impl Drop for PostgresKeyStore {
    fn drop(&mut self) {
        // The blocking client must not be torn down on an async runtime thread.
        if let Some(connections) = self.connections.take() {
            let _ = std::thread::spawn(move || drop(connections));
        }
    }
}

impl PostgresKeyStore {
    /// Pool for the configured server. Opens no connection.
    pub fn open(config: &PostgresConfig, settings: PoolSettings) -> Self {
        let manager = PostgresConnectionManager::new(config.driver_config(), NoTls);
        Self { connections: Some(ConnectionManager::new(manager, settings)) }
    }

    /// The underlying Connection Manager.
    pub fn connections(&self) -> Result<&ConnectionManager<Manager>, StoreError> {
        self.connections
            .as_ref()
            .ok_or_else(|| StoreError::Backend("postgres store closed".to_string()))
    }

    fn conn(&self) -> Result<Handle<Manager>, StoreError> {
        self.connections()?.acquire()
    }
}

/// Map a driver error onto the store taxonomy.
fn map_err(entity: &'static str, err: &postgres::Error) -> StoreError {
    let io_failure =
        std::error::Error::source(err).is_some_and(|source| source.is::<std::io::Error>());
    classify(entity, err, err.is_closed(), err.code().map(|code| code.code()), io_failure)
}

/// Only a lost connection or a server-side resource state is `Unavailable`.
/// Client-side failures without a SQLSTATE (conversions, row counts) are
/// logic errors and must not downgrade the vault.
fn classify(
    entity: &'static str,
    err: &dyn std::fmt::Display,
    closed: bool,
    sqlstate: Option<&str>,
    io_failure: bool,
) -> StoreError {
    if closed {
        return StoreError::Unavailable(format!("postgres connection closed: {err}"));
    }
    match sqlstate {
        Some(code) if code.starts_with("23") => StoreError::Conflict(format!("{entity}: {err}")),
        // connection exception, insufficient resources, operator intervention
        Some(code) if ["08", "53", "57"].iter().any(|class| code.starts_with(class)) => {
            StoreError::Unavailable(format!("postgres: {err}"))
        },
        None if io_failure => StoreError::Unavailable(format!("postgres: {err}")),
        _ => StoreError::Backend(format!("postgres {entity}: {err}")),
    }
}

fn column<'a, T: FromSql<'a>>(
    row: &'a Row,
    idx: usize,
    entity: &'static str,
) -> Result<T, StoreError> {
    row.try_get(idx).map_err(|e| StoreError::malformed(entity, e))
}

fn count(row: &Row, idx: usize) -> Result<u64, StoreError> {
    column::<i64>(row, idx, "stats").map(|n| n as u64)
}

fn anchor(
    conn: &mut postgres::Client,
    account: &AccountKey,
    now: i64,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO accounts (user_id, device_id, pickle, shared, created_at, updated_at) \
         VALUES ($1, $2, NULL, FALSE, $3, $3) ON CONFLICT (user_id, device_id) DO NOTHING",
        &[&account.user_id, &account.device_id, &now],
    )
    .map_err(|e| map_err("account", &e))?;
    let row = conn
        .query_one(
            "SELECT id FROM accounts WHERE user_id = $1 AND device_id = $2",
            &[&account.user_id, &account.device_id],
        )
        .map_err(|e| map_err("account", &e))?;
    column(&row, 0, "account")
}

fn olm_from_row(row: &Row) -> Result<OlmSession, StoreError> {
    const ENTITY: &str = "olm session";
    Ok(OlmSession {
        sender_key: column(row, 0, ENTITY)?,
        session_id: column(row, 1, ENTITY)?,
        pickle: column(row, 2, ENTITY)?,
        created_at_ms: column(row, 3, ENTITY)?,
        last_used_ms: column(row, 4, ENTITY)?,
    })
}

fn megolm_from_row(row: &Row) -> Result<MegolmSession, StoreError> {
    const ENTITY: &str = "megolm session";
    let signing_keys: Vec<u8> = column(row, 4, ENTITY)?;
    let forwarding_chain: Vec<u8> = column(row, 5, ENTITY)?;
    Ok(MegolmSession {
        room_id: column(row, 0, ENTITY)?,
        session_id: column(row, 1, ENTITY)?,
        sender_key: column(row, 2, ENTITY)?,
        pickle: column(row, 3, ENTITY)?,
        signing_keys: codec::decode_signing_keys(&signing_keys)?,
        forwarding_chain: codec::decode_forwarding_chain(&forwarding_chain)?,
        created_at_ms: column(row, 6, ENTITY)?,
    })
}

const OLM_SELECT: &str = "SELECT o.sender_key, o.session_id, o.pickle, o.session_created_at, \
                          o.last_used_at FROM olm_sessions o \
                          JOIN accounts a ON a.id = o.account_id \
                          WHERE a.user_id = $1 AND a.device_id = $2";

const MEGOLM_SELECT: &str = "SELECT m.room_id, m.session_id, m.sender_key, m.pickle, \
                             m.signing_keys, m.forwarding_chain, m.session_created_at \
                             FROM megolm_inbound_sessions m \
                             JOIN accounts a ON a.id = m.account_id \
                             WHERE a.user_id = $1 AND a.device_id = $2";

impl PostgresKeyStore {
    fn query_olm(
        &self,
        filter: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<OlmSession>, StoreError> {
        let mut conn = self.conn()?;
        let sql = format!("{OLM_SELECT}{filter} ORDER BY o.last_used_at DESC, o.session_id");
        let rows = conn.query(sql.as_str(), params).map_err(|e| map_err("olm session", &e))?;
        rows.iter().map(olm_from_row).collect()
    }

    fn query_megolm(
        &self,
        filter: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<MegolmSession>, StoreError> {
        let mut conn = self.conn()?;
        let sql = format!("{MEGOLM_SELECT}{filter} ORDER BY m.room_id, m.session_id");
        let rows = conn.query(sql.as_str(), params).map_err(|e| map_err("megolm session", &e))?;
        rows.iter().map(megolm_from_row).collect()
    }
}

impl KeyStore for PostgresKeyStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    fn probe(&self) -> Result<(), StoreError> {
        self.connections()?.check()
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let mut tx = conn.transaction().map_err(|e| map_err("schema", &e))?;
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&SCHEMA_LOCK_KEY])
            .map_err(|e| map_err("schema", &e))?;
        schema::apply(&mut PostgresSchema { tx: &mut tx })?;
        tx.commit().map_err(|e| map_err("schema", &e))
    }

    fn save_account(
        &self,
        account: &AccountKey,
        record: &AccountRecord,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        conn.execute(
            "INSERT INTO accounts (user_id, device_id, pickle, shared, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $5) ON CONFLICT (user_id, device_id) DO UPDATE SET \
             pickle = EXCLUDED.pickle, shared = EXCLUDED.shared, updated_at = EXCLUDED.updated_at",
            &[&account.user_id, &account.device_id, &record.pickle, &record.shared, &now_ms()],
        )
        .map_err(|e| map_err("account", &e))?;
        Ok(())
    }

    fn load_account(&self, account: &AccountKey) -> Result<Option<AccountRecord>, StoreError> {
        let mut conn = self.conn()?;
        let row = conn
            .query_opt(
                "SELECT pickle, shared FROM accounts WHERE user_id = $1 AND device_id = $2",
                &[&account.user_id, &account.device_id],
            )
            .map_err(|e| map_err("account", &e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let pickle: Option<Vec<u8>> = column(&row, 0, "account")?;
        let shared: bool = column(&row, 1, "account")?;
        Ok(pickle.map(|pickle| AccountRecord { pickle, shared }))
    }

    fn save_device_key(
        &self,
        account: &AccountKey,
        device: &DeviceKey,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let now = now_ms();
        let account_id = anchor(&mut conn, account, now)?;
        conn.execute(
            "INSERT INTO device_keys (account_id, user_id, device_id, key_bundle, display_name, \
             deleted, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $7) \
             ON CONFLICT (account_id, user_id, device_id) DO UPDATE SET \
             key_bundle = EXCLUDED.key_bundle, display_name = EXCLUDED.display_name, \
             deleted = EXCLUDED.deleted, updated_at = EXCLUDED.updated_at",
            &[
                &account_id,
                &device.user_id,
                &device.device_id,
                &device.key_bundle,
                &device.display_name,
                &device.deleted,
                &now,
            ],
        )
        .map_err(|e| map_err("device key", &e))?;
        Ok(())
    }

    fn delete_device_key(
        &self,
        account: &AccountKey,
        user_id: &str,
        device_id: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE device_keys SET deleted = TRUE, updated_at = $5 \
                 WHERE user_id = $3 AND device_id = $4 AND account_id = \
                 (SELECT id FROM accounts WHERE user_id = $1 AND device_id = $2)",
                &[&account.user_id, &account.device_id, &user_id, &device_id, &now_ms()],
            )
            .map_err(|e| map_err("device key", &e))?;
        Ok(changed > 0)
    }

    fn load_device_keys(
        &self,
        account: &AccountKey,
        include_deleted: bool,
    ) -> Result<Vec<DeviceKey>, StoreError> {
        const ENTITY: &str = "device key";
        let mut conn = self.conn()?;
        let filter = if include_deleted { "" } else { " AND d.deleted = FALSE" };
        let sql = format!(
            "SELECT d.user_id, d.device_id, d.key_bundle, d.display_name, d.deleted \
             FROM device_keys d JOIN accounts a ON a.id = d.account_id \
             WHERE a.user_id = $1 AND a.device_id = $2{filter} ORDER BY d.user_id, d.device_id"
        );
        let rows = conn
            .query(sql.as_str(), &[&account.user_id, &account.device_id])
            .map_err(|e| map_err(ENTITY, &e))?;
        rows.iter()
            .map(|row| {
                Ok(DeviceKey {
                    user_id: column(row, 0, ENTITY)?,
                    device_id: column(row, 1, ENTITY)?,
                    key_bundle: column(row, 2, ENTITY)?,
                    display_name: column(row, 3, ENTITY)?,
                    deleted: column(row, 4, ENTITY)?,
                })
            })
            .collect()
    }

    fn save_olm_session(
        &self,
        account: &AccountKey,
        session: &OlmSession,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let now = now_ms();
        let account_id = anchor(&mut conn, account, now)?;
        conn.execute(
            "INSERT INTO olm_sessions (account_id, sender_key, session_id, pickle, \
             session_created_at, last_used_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7) \
             ON CONFLICT (account_id, sender_key, session_id) DO UPDATE SET \
             pickle = EXCLUDED.pickle, session_created_at = EXCLUDED.session_created_at, \
             last_used_at = EXCLUDED.last_used_at, updated_at = EXCLUDED.updated_at",
            &[
                &account_id,
                &session.sender_key,
                &session.session_id,
                &session.pickle,
                &session.created_at_ms,
                &session.last_used_ms,
                &now,
            ],
        )
        .map_err(|e| map_err("olm session", &e))?;
        Ok(())
    }

    fn load_olm_sessions(
        &self,
        account: &AccountKey,
        sender_key: &str,
    ) -> Result<Vec<OlmSession>, StoreError> {
        self.query_olm(
            " AND o.sender_key = $3",
            &[&account.user_id, &account.device_id, &sender_key],
        )
    }

    fn load_all_olm_sessions(&self, account: &AccountKey) -> Result<Vec<OlmSession>, StoreError> {
        self.query_olm("", &[&account.user_id, &account.device_id])
    }

    fn save_megolm_session(
        &self,
        account: &AccountKey,
        session: &MegolmSession,
    ) -> Result<(), StoreError> {
        let signing_keys = codec::encode_signing_keys(&session.signing_keys)?;
        let forwarding_chain = codec::encode_forwarding_chain(&session.forwarding_chain)?;
        let mut conn = self.conn()?;
        let now = now_ms();
        let account_id = anchor(&mut conn, account, now)?;
        conn.execute(
            "INSERT INTO megolm_inbound_sessions (account_id, room_id, session_id, sender_key, \
             pickle, signing_keys, forwarding_chain, session_created_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9) \
             ON CONFLICT (account_id, room_id, session_id) DO UPDATE SET \
             sender_key = EXCLUDED.sender_key, pickle = EXCLUDED.pickle, \
             signing_keys = EXCLUDED.signing_keys, forwarding_chain = EXCLUDED.forwarding_chain, \
             session_created_at = EXCLUDED.session_created_at, updated_at = EXCLUDED.updated_at",
            &[
                &account_id,
                &session.room_id,
                &session.session_id,
                &session.sender_key,
                &session.pickle,
                &signing_keys,
                &forwarding_chain,
                &session.created_at_ms,
                &now,
            ],
        )
        .map_err(|e| map_err("megolm session", &e))?;
        Ok(())
    }

    fn load_megolm_sessions(
        &self,
        account: &AccountKey,
    ) -> Result<Vec<MegolmSession>, StoreError> {
        self.query_megolm("", &[&account.user_id, &account.device_id])
    }

    fn load_room_megolm_sessions(
        &self,
        account: &AccountKey,
        room_id: &str,
    ) -> Result<Vec<MegolmSession>, StoreError> {
        self.query_megolm(" AND m.room_id = $3", &[&account.user_id, &account.device_id, &room_id])
    }

    fn load_megolm_session(
        &self,
        account: &AccountKey,
        room_id: &str,
        session_id: &str,
    ) -> Result<Option<MegolmSession>, StoreError> {
        let sessions = self.query_megolm(
            " AND m.room_id = $3 AND m.session_id = $4",
            &[&account.user_id, &account.device_id, &room_id, &session_id],
        )?;
        Ok(sessions.into_iter().next())
    }

    fn save_sync_cursor(&self, account: &AccountKey, token: &str) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let now = now_ms();
        let account_id = anchor(&mut conn, account, now)?;
        conn.execute(
            "INSERT INTO sync_cursors (account_id, token, created_at, updated_at) \
             VALUES ($1, $2, $3, $3) ON CONFLICT (account_id) DO UPDATE SET \
             token = EXCLUDED.token, updated_at = EXCLUDED.updated_at",
            &[&account_id, &token, &now],
        )
        .map_err(|e| map_err("sync cursor", &e))?;
        Ok(())
    }

    fn load_sync_cursor(&self, account: &AccountKey) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn()?;
        let row = conn
            .query_opt(
                "SELECT s.token FROM sync_cursors s JOIN accounts a ON a.id = s.account_id \
                 WHERE a.user_id = $1 AND a.device_id = $2",
                &[&account.user_id, &account.device_id],
            )
            .map_err(|e| map_err("sync cursor", &e))?;
        row.map(|row| column(&row, 0, "sync cursor")).transpose()
    }

    fn save_encrypted_room(
        &self,
        account: &AccountKey,
        room: &EncryptedRoom,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let now = now_ms();
        let account_id = anchor(&mut conn, account, now)?;
        conn.execute(
            "INSERT INTO encrypted_rooms (account_id, room_id, rotation_period_ms, \
             rotation_messages, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $5) \
             ON CONFLICT (account_id, room_id) DO UPDATE SET \
             rotation_period_ms = EXCLUDED.rotation_period_ms, \
             rotation_messages = EXCLUDED.rotation_messages, updated_at = EXCLUDED.updated_at",
            &[&account_id, &room.room_id, &room.rotation_period_ms, &room.rotation_messages, &now],
        )
        .map_err(|e| map_err("encrypted room", &e))?;
        Ok(())
    }

    fn load_encrypted_rooms(
        &self,
        account: &AccountKey,
    ) -> Result<Vec<EncryptedRoom>, StoreError> {
        const ENTITY: &str = "encrypted room";
        let mut conn = self.conn()?;
        let rows = conn
            .query(
                "SELECT r.room_id, r.rotation_period_ms, r.rotation_messages \
                 FROM encrypted_rooms r JOIN accounts a ON a.id = r.account_id \
                 WHERE a.user_id = $1 AND a.device_id = $2 ORDER BY r.room_id",
                &[&account.user_id, &account.device_id],
            )
            .map_err(|e| map_err(ENTITY, &e))?;
        rows.iter()
            .map(|row| {
                Ok(EncryptedRoom {
                    room_id: column(row, 0, ENTITY)?,
                    rotation_period_ms: column(row, 1, ENTITY)?,
                    rotation_messages: column(row, 2, ENTITY)?,
                })
            })
            .collect()
    }

    fn stats(&self, account: &AccountKey) -> Result<AccountStats, StoreError> {
        let mut conn = self.conn()?;
        let row = conn
            .query_opt(
                "SELECT a.pickle IS NOT NULL, \
                 (SELECT COUNT(*) FROM megolm_inbound_sessions WHERE account_id = a.id), \
                 (SELECT COUNT(DISTINCT room_id) FROM megolm_inbound_sessions \
                  WHERE account_id = a.id), \
                 (SELECT COUNT(*) FROM olm_sessions WHERE account_id = a.id), \
                 (SELECT COUNT(*) FROM device_keys WHERE account_id = a.id AND deleted = FALSE), \
                 (SELECT COUNT(*) FROM encrypted_rooms WHERE account_id = a.id), \
                 EXISTS (SELECT 1 FROM sync_cursors WHERE account_id = a.id) \
                 FROM accounts a WHERE a.user_id = $1 AND a.device_id = $2",
                &[&account.user_id, &account.device_id],
            )
            .map_err(|e| map_err("stats", &e))?;
        let Some(row) = row else {
            return Ok(AccountStats::default());
        };
        Ok(AccountStats {
            account_present: column(&row, 0, "stats")?,
            session_count: count(&row, 1)?,
            room_count: count(&row, 2)?,
            olm_session_count: count(&row, 3)?,
            device_count: count(&row, 4)?,
            encrypted_room_count: count(&row, 5)?,
            has_sync_cursor: column(&row, 6, "stats")?,
        })
    }

    fn wipe_account(&self, account: &AccountKey) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let mut tx = conn.transaction().map_err(|e| map_err("account", &e))?;
        let row = tx
            .query_opt(
                "SELECT id FROM accounts WHERE user_id = $1 AND device_id = $2 FOR UPDATE",
                &[&account.user_id, &account.device_id],
            )
            .map_err(|e| map_err("account", &e))?;
        let Some(row) = row else {
            return Ok(false);
        };
        let id: i64 = column(&row, 0, "account")?;
        for table in schema::TABLES.iter().skip(1).rev() {
            tx.execute(format!("DELETE FROM {} WHERE account_id = $1", table.name).as_str(), &[&id])
                .map_err(|e| map_err("account", &e))?;
        }
        tx.execute("DELETE FROM accounts WHERE id = $1", &[&id])
            .map_err(|e| map_err("account", &e))?;
        tx.commit().map_err(|e| map_err("account", &e))?;
        Ok(true)
    }

    fn list_accounts(&self) -> Result<Vec<AccountKey>, StoreError> {
        let mut conn = self.conn()?;
        let rows = conn
            .query("SELECT user_id, device_id FROM accounts ORDER BY user_id, device_id", &[])
            .map_err(|e| map_err("account", &e))?;
        rows.iter()
            .map(|row| {
                Ok(AccountKey {
                    user_id: column(row, 0, "account")?,
                    device_id: column(row, 1, "account")?,
                })
            })
            .collect()
    }
}

/// Schema gate primitives over one Postgres transaction.
struct PostgresSchema<'a, 'conn> {
    tx: &'a mut Transaction<'conn>,
}

fn ddl_err(err: &postgres::Error) -> StoreError {
    match map_err("schema", err) {
        StoreError::Unavailable(reason) => StoreError::Unavailable(reason),
        other => SchemaError::Statement(other.to_string()).into(),
    }
}

impl SchemaConnection for PostgresSchema<'_, '_> {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute_ddl(&mut self, sql: &str) -> Result<(), StoreError> {
        self.tx.batch_execute(sql).map_err(|e| ddl_err(&e))
    }

    fn columns(&mut self, table: &str) -> Result<Vec<ExistingColumn>, StoreError> {
        let rows = self
            .tx
            .query(
                "SELECT column_name::text, data_type::text, is_nullable::text \
                 FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1",
                &[&table],
            )
            .map_err(|e| ddl_err(&e))?;
        rows.iter()
            .map(|row| {
                let nullable: String = column(row, 2, "schema")?;
                Ok(ExistingColumn {
                    name: column(row, 0, "schema")?,
                    data_type: column(row, 1, "schema")?,
                    nullable: nullable == "YES",
                })
            })
            .collect()
    }

    fn recorded_version(&mut self) -> Result<Option<i64>, StoreError> {
        let row = self
            .tx
            .query_one(format!("SELECT MAX(version) FROM {}", schema::VERSION_TABLE).as_str(), &[])
            .map_err(|e| ddl_err(&e))?;
        column(&row, 0, "schema")
    }

    fn record_version(&mut self, version: i64) -> Result<(), StoreError> {
        self.tx
            .execute(
                format!(
                    "INSERT INTO {} (version, applied_at) VALUES ($1, $2) \
                     ON CONFLICT (version) DO NOTHING",
                    schema::VERSION_TABLE
                )
                .as_str(),
                &[&version, &now_ms()],
            )
            .map_err(|e| ddl_err(&e))?;
        Ok(())
    }
}
