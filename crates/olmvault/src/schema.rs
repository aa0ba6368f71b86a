//! Schema/Migration Gate.
//!
//! The table layout is declared once in [`TABLES`] and rendered per
//! [`Dialect`]. [`apply`] brings any database up to that layout:
//!
//! - Tables and indexes are created with `IF NOT EXISTS`, so re-running is a
//!   no-op and a partially created schema is completed.
//! - Missing columns are added when they are nullable or have a default.
//! - Existing columns are checked against the declared type family.
//! - A recorded schema version newer than [`SCHEMA_VERSION`] is refused
//!   before anything is touched.
//!
//! Existing rows are never modified.

use std::fmt::Write as _;

use thiserror::Error;

use crate::error::StoreError;

/// Schema version written by this build.
pub const SCHEMA_VERSION: i64 = 1;

/// Table recording applied schema versions.
pub const VERSION_TABLE: &str = "olmvault_schema_version";

/// Structural schema problems. Fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Column exists with a type or nullability the store cannot use
    #[error("column {table}.{column} is {found}, expected {expected}")]
    IncompatibleColumn {
        /// Table name
        table: &'static str,
        /// Column name
        column: &'static str,
        /// Declared type in the catalogue
        expected: String,
        /// Type found in the database
        found: String,
    },

    /// Required column absent and not addable without a default
    #[error("column {table}.{column} is missing and has no default to add it with")]
    MissingColumn {
        /// Table name
        table: &'static str,
        /// Column name
        column: &'static str,
    },

    /// Database was migrated by a newer build
    #[error("schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion {
        /// Highest recorded version
        found: i64,
        /// Version this build understands
        supported: i64,
    },

    /// DDL statement rejected by the backend
    #[error("schema statement failed: {0}")]
    Statement(String),
}

/// Logical column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Auto-incrementing primary key
    Id,
    /// Foreign key to `accounts(id)`, cascading on delete
    AccountRef,
    /// 64-bit integer
    Integer,
    /// UTF-8 text
    Text,
    /// Opaque bytes
    Bytes,
    /// Boolean
    Flag,
}

/// Column default, rendered per dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnDefault {
    /// Integer literal
    Int(i64),
    /// Boolean false
    False,
    /// Empty string
    EmptyText,
    /// Zero-length byte string
    EmptyBytes,
}

/// One declared column.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    /// Column name
    pub name: &'static str,
    /// Logical type
    pub ty: ColumnType,
    /// Whether NULL is allowed
    pub nullable: bool,
    /// Default used for new rows and when adding the column
    pub default: Option<ColumnDefault>,
}

impl Column {
    const fn required(name: &'static str, ty: ColumnType) -> Self {
        Self { name, ty, nullable: false, default: None }
    }

    const fn optional(name: &'static str, ty: ColumnType) -> Self {
        Self { name, ty, nullable: true, default: None }
    }

    const fn defaulted(name: &'static str, ty: ColumnType, default: ColumnDefault) -> Self {
        Self { name, ty, nullable: false, default: Some(default) }
    }

    fn addable(&self) -> bool {
        !matches!(self.ty, ColumnType::Id | ColumnType::AccountRef)
            && (self.nullable || self.default.is_some())
    }
}

/// A secondary index.
#[derive(Debug, Clone, Copy)]
pub struct Index {
    /// Index name
    pub name: &'static str,
    /// Indexed columns in order
    pub columns: &'static [&'static str],
}

/// One declared table.
#[derive(Debug, Clone, Copy)]
pub struct Table {
    /// Table name
    pub name: &'static str,
    /// Columns in creation order
    pub columns: &'static [Column],
    /// Identity columns, enforced by a unique index and used as the upsert
    /// conflict target
    pub identity: &'static [&'static str],
    /// Lookup indexes
    pub indexes: &'static [Index],
}

use ColumnType::{AccountRef, Bytes, Flag, Id, Integer, Text};

const ID: Column = Column::required("id", Id);
const ACCOUNT_ID: Column = Column::required("account_id", AccountRef);
const CREATED_AT: Column = Column::defaulted("created_at", Integer, ColumnDefault::Int(0));
const UPDATED_AT: Column = Column::defaulted("updated_at", Integer, ColumnDefault::Int(0));

/// Account blobs. `pickle` is NULL for anchor rows created by dependent
/// writes.
pub const ACCOUNTS: Table = Table {
    name: "accounts",
    columns: &[
        ID,
        Column::required("user_id", Text),
        Column::required("device_id", Text),
        Column::optional("pickle", Bytes),
        Column::defaulted("shared", Flag, ColumnDefault::False),
        CREATED_AT,
        UPDATED_AT,
    ],
    identity: &["user_id", "device_id"],
    indexes: &[],
};

/// Remote device keys.
pub const DEVICE_KEYS: Table = Table {
    name: "device_keys",
    columns: &[
        ID,
        ACCOUNT_ID,
        Column::required("user_id", Text),
        Column::required("device_id", Text),
        Column::required("key_bundle", Bytes),
        Column::defaulted("display_name", Text, ColumnDefault::EmptyText),
        Column::defaulted("deleted", Flag, ColumnDefault::False),
        CREATED_AT,
        UPDATED_AT,
    ],
    identity: &["account_id", "user_id", "device_id"],
    indexes: &[Index { name: "idx_device_keys_user", columns: &["user_id"] }],
};

/// Pairwise Olm sessions.
pub const OLM_SESSIONS: Table = Table {
    name: "olm_sessions",
    columns: &[
        ID,
        ACCOUNT_ID,
        Column::required("sender_key", Text),
        Column::required("session_id", Text),
        Column::required("pickle", Bytes),
        Column::defaulted("session_created_at", Integer, ColumnDefault::Int(0)),
        Column::defaulted("last_used_at", Integer, ColumnDefault::Int(0)),
        CREATED_AT,
        UPDATED_AT,
    ],
    identity: &["account_id", "sender_key", "session_id"],
    indexes: &[Index {
        name: "idx_olm_sender",
        columns: &["account_id", "sender_key", "last_used_at"],
    }],
};

/// Inbound Megolm sessions.
pub const MEGOLM_SESSIONS: Table = Table {
    name: "megolm_inbound_sessions",
    columns: &[
        ID,
        ACCOUNT_ID,
        Column::required("room_id", Text),
        Column::required("session_id", Text),
        Column::required("sender_key", Text),
        Column::required("pickle", Bytes),
        Column::defaulted("signing_keys", Bytes, ColumnDefault::EmptyBytes),
        Column::defaulted("forwarding_chain", Bytes, ColumnDefault::EmptyBytes),
        Column::defaulted("session_created_at", Integer, ColumnDefault::Int(0)),
        CREATED_AT,
        UPDATED_AT,
    ],
    identity: &["account_id", "room_id", "session_id"],
    indexes: &[Index { name: "idx_megolm_room", columns: &["account_id", "room_id"] }],
};

/// Sync cursors, one per account.
pub const SYNC_CURSORS: Table = Table {
    name: "sync_cursors",
    columns: &[ID, ACCOUNT_ID, Column::required("token", Text), CREATED_AT, UPDATED_AT],
    identity: &["account_id"],
    indexes: &[],
};

/// Megolm rotation policy per room.
pub const ENCRYPTED_ROOMS: Table = Table {
    name: "encrypted_rooms",
    columns: &[
        ID,
        ACCOUNT_ID,
        Column::required("room_id", Text),
        Column::defaulted(
            "rotation_period_ms",
            Integer,
            ColumnDefault::Int(crate::record::DEFAULT_ROTATION_PERIOD_MS),
        ),
        Column::defaulted(
            "rotation_messages",
            Integer,
            ColumnDefault::Int(crate::record::DEFAULT_ROTATION_MESSAGES),
        ),
        CREATED_AT,
        UPDATED_AT,
    ],
    identity: &["account_id", "room_id"],
    indexes: &[],
};

/// Applied schema versions.
pub const SCHEMA_VERSIONS: Table = Table {
    name: VERSION_TABLE,
    columns: &[
        Column::required("version", Integer),
        Column::defaulted("applied_at", Integer, ColumnDefault::Int(0)),
    ],
    identity: &["version"],
    indexes: &[],
};

/// Every key store table, parents before children.
pub const TABLES: &[Table] =
    &[ACCOUNTS, DEVICE_KEYS, OLM_SESSIONS, MEGOLM_SESSIONS, SYNC_CURSORS, ENCRYPTED_ROOMS];

/// SQL flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// SQLite 3
    Sqlite,
    /// PostgreSQL
    Postgres,
}

impl Dialect {
    /// Column type as written in DDL.
    pub fn sql_type(self, ty: ColumnType) -> &'static str {
        match (self, ty) {
            (Self::Sqlite, Id) => "INTEGER PRIMARY KEY",
            (Self::Postgres, Id) => "BIGSERIAL PRIMARY KEY",
            (Self::Sqlite, AccountRef) => {
                "INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE"
            },
            (Self::Postgres, AccountRef) => {
                "BIGINT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE"
            },
            (Self::Sqlite, Integer) => "INTEGER",
            (Self::Postgres, Integer) => "BIGINT",
            (_, Text) => "TEXT",
            (Self::Sqlite, Bytes) => "BLOB",
            (Self::Postgres, Bytes) => "BYTEA",
            (_, Flag) => "BOOLEAN",
        }
    }

    fn default_literal(self, default: ColumnDefault) -> String {
        match (self, default) {
            (_, ColumnDefault::Int(n)) => n.to_string(),
            (_, ColumnDefault::False) => "FALSE".to_string(),
            (_, ColumnDefault::EmptyText) => "''".to_string(),
            (Self::Sqlite, ColumnDefault::EmptyBytes) => "X''".to_string(),
            (Self::Postgres, ColumnDefault::EmptyBytes) => "''::bytea".to_string(),
        }
    }

    /// Whether a live column's reported type can hold `ty`.
    ///
    /// `found` is `PRAGMA table_info` type for SQLite and
    /// `information_schema.columns.data_type` for Postgres.
    pub fn accepts(self, ty: ColumnType, found: &str) -> bool {
        match self {
            Self::Sqlite => {
                let found = found.to_ascii_uppercase();
                match ty {
                    Id | AccountRef | Integer => found.contains("INT"),
                    Text => ["TEXT", "CHAR", "CLOB"].iter().any(|t| found.contains(t)),
                    Bytes => found.is_empty() || found.contains("BLOB"),
                    Flag => found.contains("BOOL") || found.contains("INT"),
                }
            },
            Self::Postgres => {
                let found = found.to_ascii_lowercase();
                match ty {
                    Id | AccountRef | Integer => found == "bigint",
                    Text => found == "text" || found == "character varying",
                    Bytes => found == "bytea",
                    Flag => found == "boolean",
                }
            },
        }
    }

    fn column_sql(self, column: &Column) -> String {
        let mut sql = format!("{} {}", column.name, self.sql_type(column.ty));
        if !column.nullable && !matches!(column.ty, Id | AccountRef) {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = column.default {
            let _ = write!(sql, " DEFAULT {}", self.default_literal(default));
        }
        sql
    }

    /// `CREATE TABLE IF NOT EXISTS` for a table.
    pub fn create_table(self, table: &Table) -> String {
        let columns: Vec<String> = table.columns.iter().map(|c| self.column_sql(c)).collect();
        format!("CREATE TABLE IF NOT EXISTS {} ({})", table.name, columns.join(", "))
    }

    /// Identity and lookup indexes for a table.
    pub fn create_indexes(self, table: &Table) -> Vec<String> {
        let mut statements = vec![format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {}_identity ON {} ({})",
            table.name,
            table.name,
            table.identity.join(", ")
        )];
        statements.extend(table.indexes.iter().map(|index| {
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                index.name,
                table.name,
                index.columns.join(", ")
            )
        }));
        statements
    }

    /// `ALTER TABLE ... ADD COLUMN` for a missing column.
    pub fn add_column(self, table: &Table, column: &Column) -> String {
        format!("ALTER TABLE {} ADD COLUMN {}", table.name, self.column_sql(column))
    }
}

/// A column as reported by the live database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingColumn {
    /// Column name
    pub name: String,
    /// Reported type
    pub data_type: String,
    /// Whether NULL is allowed
    pub nullable: bool,
}

/// Statements needed to bring one table's columns up to the catalogue.
pub fn plan_columns(
    dialect: Dialect,
    table: &Table,
    existing: &[ExistingColumn],
) -> Result<Vec<String>, SchemaError> {
    let mut statements = Vec::new();
    for column in table.columns {
        let Some(live) = existing.iter().find(|c| c.name.eq_ignore_ascii_case(column.name))
        else {
            if !column.addable() {
                return Err(SchemaError::MissingColumn { table: table.name, column: column.name });
            }
            statements.push(dialect.add_column(table, column));
            continue;
        };

        if !dialect.accepts(column.ty, &live.data_type) {
            return Err(SchemaError::IncompatibleColumn {
                table: table.name,
                column: column.name,
                expected: dialect.sql_type(column.ty).to_string(),
                found: live.data_type.clone(),
            });
        }
        if column.nullable && !live.nullable {
            return Err(SchemaError::IncompatibleColumn {
                table: table.name,
                column: column.name,
                expected: format!("nullable {}", dialect.sql_type(column.ty)),
                found: format!("{} NOT NULL", live.data_type),
            });
        }
    }
    Ok(statements)
}

/// Refuse databases migrated by a newer build.
pub fn check_version(found: Option<i64>) -> Result<(), SchemaError> {
    match found {
        Some(found) if found > SCHEMA_VERSION => {
            Err(SchemaError::UnsupportedVersion { found, supported: SCHEMA_VERSION })
        },
        _ => Ok(()),
    }
}

/// Connection-level primitives the gate needs from a backend.
///
/// Implementations run inside one backend transaction.
pub(crate) trait SchemaConnection {
    fn dialect(&self) -> Dialect;

    /// Run one DDL statement.
    fn execute_ddl(&mut self, sql: &str) -> Result<(), StoreError>;

    /// Live columns of `table`, empty when the table does not exist.
    fn columns(&mut self, table: &str) -> Result<Vec<ExistingColumn>, StoreError>;

    /// Highest recorded schema version.
    fn recorded_version(&mut self) -> Result<Option<i64>, StoreError>;

    /// Record `version` as applied.
    fn record_version(&mut self, version: i64) -> Result<(), StoreError>;
}

/// Bring the database up to the catalogue.
pub(crate) fn apply<C: SchemaConnection>(conn: &mut C) -> Result<(), StoreError> {
    let dialect = conn.dialect();

    conn.execute_ddl(&dialect.create_table(&SCHEMA_VERSIONS))?;
    let existing = conn.columns(SCHEMA_VERSIONS.name)?;
    for statement in plan_columns(dialect, &SCHEMA_VERSIONS, &existing)? {
        conn.execute_ddl(&statement)?;
    }
    for statement in dialect.create_indexes(&SCHEMA_VERSIONS) {
        conn.execute_ddl(&statement)?;
    }
    check_version(conn.recorded_version()?)?;

    for table in TABLES {
        conn.execute_ddl(&dialect.create_table(table))?;
    }
    for table in TABLES {
        let existing = conn.columns(table.name)?;
        for statement in plan_columns(dialect, table, &existing)? {
            tracing::info!(table = table.name, %statement, "adding missing column");
            conn.execute_ddl(&statement)?;
        }
    }
    for table in TABLES {
        for statement in dialect.create_indexes(table) {
            conn.execute_ddl(&statement)?;
        }
    }

    conn.record_version(SCHEMA_VERSION)?;
    Ok(())
}
