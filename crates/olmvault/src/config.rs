//! Store configuration.
//!
//! Configuration comes from environment variables (see [`StoreConfig::from_env`]).
//! `from_lookup` takes any `name -> value` function so tests never touch the
//! process environment.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was set to a value that cannot be parsed
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        /// Variable name
        var: String,
        /// Offending value
        value: String,
        /// Parser message
        reason: String,
    },

    /// Database URL with a scheme no backend understands
    #[error("unsupported database URL scheme: {0}")]
    UnsupportedScheme(String),

    /// Database URL missing a required component
    #[error("database URL missing {0}")]
    Incomplete(&'static str),
}

/// Postgres connection settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Database name
    pub database: String,
    /// Login role
    pub user: String,
    /// Login password
    pub password: Option<String>,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-statement timeout in milliseconds
    pub statement_timeout_ms: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "matrix_store".to_string(),
            user: "matrix_user".to_string(),
            password: None,
            connect_timeout_ms: 5_000,
            statement_timeout_ms: 30_000,
        }
    }
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("statement_timeout_ms", &self.statement_timeout_ms)
            .finish()
    }
}

impl PostgresConfig {
    /// Parse a `postgres://` or `postgresql://` URL.
    ///
    /// Credentials are percent-decoded by the driver's parser.
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let parsed = url.parse::<postgres::Config>().map_err(|e| ConfigError::InvalidValue {
            var: "DATABASE_URL".to_string(),
            value: redact_url(url),
            reason: e.to_string(),
        })?;

        let host = parsed
            .get_hosts()
            .iter()
            .find_map(|host| match host {
                postgres::config::Host::Tcp(name) => Some(name.clone()),
                #[allow(unreachable_patterns)]
                _ => None,
            })
            .ok_or(ConfigError::Incomplete("host"))?;
        let database = parsed.get_dbname().ok_or(ConfigError::Incomplete("database name"))?;
        let user = parsed.get_user().ok_or(ConfigError::Incomplete("user"))?;
        let password = parsed
            .get_password()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned());

        Ok(Self {
            host,
            port: parsed.get_ports().first().copied().unwrap_or(5432),
            database: database.to_string(),
            user: user.to_string(),
            password,
            ..Self::default()
        })
    }

    /// Driver configuration for this target.
    pub(crate) fn driver_config(&self) -> postgres::Config {
        let mut config = postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .application_name("olmvault")
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms.max(1)))
            .options(&format!("-c statement_timeout={}", self.statement_timeout_ms));
        if let Some(password) = &self.password {
            config.password(password);
        }
        config
    }
}

/// Durable backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Networked Postgres server
    Postgres(PostgresConfig),
    /// Local SQLite file
    Sqlite {
        /// Database file; its directory must already exist
        path: PathBuf,
    },
}

impl BackendConfig {
    /// Parse a database URL: `postgres://`, `postgresql://` or `sqlite://<path>`.
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        if let Some(path) = url.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(ConfigError::Incomplete("file path"));
            }
            return Ok(Self::Sqlite { path: PathBuf::from(path) });
        }
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return PostgresConfig::from_url(url).map(Self::Postgres);
        }
        let scheme = url.split_once("://").map_or(url, |(scheme, _)| scheme);
        Err(ConfigError::UnsupportedScheme(scheme.to_string()))
    }

    /// Short backend label for logs and health reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Sqlite { .. } => "sqlite",
        }
    }

    /// SQLite file backend.
    pub fn sqlite(path: impl AsRef<Path>) -> Self {
        Self::Sqlite { path: path.as_ref().to_path_buf() }
    }
}

/// Connection pool bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum simultaneously open connections
    pub max_size: u32,
    /// How long `acquire` waits for a free connection
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { max_size: 20, acquire_timeout: Duration::from_secs(5) }
    }
}

/// When the degradation controller re-checks the durable backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySettings {
    /// Check after this many calls served from the fallback
    pub check_every: u64,
    /// Never check more often than this
    pub min_interval: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self { check_every: 64, min_interval: Duration::from_secs(30) }
    }
}

/// Complete store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Durable backend target
    pub backend: BackendConfig,
    /// Whether to use the durable backend at all
    pub durable_enabled: bool,
    /// Pool bounds
    pub pool: PoolSettings,
    /// Recovery cadence
    pub recovery: RecoverySettings,
}

impl StoreConfig {
    /// Configuration for a durable SQLite file with default settings.
    pub fn sqlite(path: impl AsRef<Path>) -> Self {
        Self {
            backend: BackendConfig::sqlite(path),
            durable_enabled: true,
            pool: PoolSettings::default(),
            recovery: RecoverySettings::default(),
        }
    }

    /// Read configuration from the process environment.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `DATABASE_URL` | discrete `POSTGRES_*` settings |
    /// | `POSTGRES_HOST` / `_PORT` / `_DB` / `_USER` / `_PASSWORD` | `localhost`, `5432`, `matrix_store`, `matrix_user`, none |
    /// | `USE_DURABLE_STORE` (alias `USE_POSTGRES_STORE`) | `true` |
    /// | `DATABASE_POOL_SIZE` | `20` |
    /// | `DATABASE_ACQUIRE_TIMEOUT_MS` | `5000` |
    /// | `DATABASE_CONNECT_TIMEOUT_MS` | `5000` |
    /// | `DATABASE_STATEMENT_TIMEOUT_MS` | `30000` |
    /// | `KEYSTORE_RECOVERY_EVERY` | `64` |
    /// | `KEYSTORE_RECOVERY_INTERVAL_MS` | `30000` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut backend = match get("DATABASE_URL") {
            Some(url) => BackendConfig::from_url(url.trim())?,
            None => {
                let defaults = PostgresConfig::default();
                BackendConfig::Postgres(PostgresConfig {
                    host: get("POSTGRES_HOST").unwrap_or(defaults.host),
                    port: parse_var("POSTGRES_PORT", get("POSTGRES_PORT"))?
                        .unwrap_or(defaults.port),
                    database: get("POSTGRES_DB").unwrap_or(defaults.database),
                    user: get("POSTGRES_USER").unwrap_or(defaults.user),
                    password: get("POSTGRES_PASSWORD"),
                    ..defaults
                })
            },
        };

        if let BackendConfig::Postgres(pg) = &mut backend {
            if let Some(ms) =
                parse_var("DATABASE_CONNECT_TIMEOUT_MS", get("DATABASE_CONNECT_TIMEOUT_MS"))?
            {
                pg.connect_timeout_ms = ms;
            }
            if let Some(ms) =
                parse_var("DATABASE_STATEMENT_TIMEOUT_MS", get("DATABASE_STATEMENT_TIMEOUT_MS"))?
            {
                pg.statement_timeout_ms = ms;
            }
        }

        let durable_enabled = match get("USE_DURABLE_STORE") {
            Some(value) => parse_flag("USE_DURABLE_STORE", &value)?,
            None => match get("USE_POSTGRES_STORE") {
                Some(value) => parse_flag("USE_POSTGRES_STORE", &value)?,
                None => true,
            },
        };

        let pool_defaults = PoolSettings::default();
        let max_size: u32 = parse_var("DATABASE_POOL_SIZE", get("DATABASE_POOL_SIZE"))?
            .unwrap_or(pool_defaults.max_size);
        if max_size == 0 {
            return Err(ConfigError::InvalidValue {
                var: "DATABASE_POOL_SIZE".to_string(),
                value: "0".to_string(),
                reason: "pool needs at least one connection".to_string(),
            });
        }
        let acquire_timeout =
            parse_var("DATABASE_ACQUIRE_TIMEOUT_MS", get("DATABASE_ACQUIRE_TIMEOUT_MS"))?
                .map_or(pool_defaults.acquire_timeout, Duration::from_millis);

        let recovery_defaults = RecoverySettings::default();
        let check_every = parse_var("KEYSTORE_RECOVERY_EVERY", get("KEYSTORE_RECOVERY_EVERY"))?
            .unwrap_or(recovery_defaults.check_every);
        let min_interval =
            parse_var("KEYSTORE_RECOVERY_INTERVAL_MS", get("KEYSTORE_RECOVERY_INTERVAL_MS"))?
                .map_or(recovery_defaults.min_interval, Duration::from_millis);

        Ok(Self {
            backend,
            durable_enabled,
            pool: PoolSettings { max_size, acquire_timeout },
            recovery: RecoverySettings { check_every, min_interval },
        })
    }
}

fn parse_var<T>(var: &str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                var: var.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_flag(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var: var.to_string(),
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

/// Strip credentials from a URL before it lands in an error message.
fn redact_url(url: &str) -> String {
    match (url.split_once("://"), url.rfind('@')) {
        (Some((scheme, _)), Some(at)) => format!("{scheme}://<redacted>{}", &url[at..]),
        _ => url.to_string(),
    }
}
