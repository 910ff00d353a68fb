use crate::core::{DbError, IsolationLevel, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

const URL_SCHEME: &str = "memdb://";
const DEFAULT_PORT: u16 = 5432;

/// Largest pool a semaphore can bound
pub const MAX_CONNECTIONS: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Pool configuration for one logical database
///
/// Similar to PostgreSQL/MySQL connection strings. The in-memory pool keys
/// stores by database name only: `host` and `port` are informational and
/// show up in the URL form and in logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPoolConfig", into = "RawPoolConfig")]
pub struct PoolConfig {
    /// Database host, informational for the in-memory pool
    pub host: String,

    /// Database port, informational for the in-memory pool
    pub port: u16,

    /// Physical database name
    pub database: String,

    /// Maximum number of simultaneously open connections
    pub max_connections: usize,

    /// How long `acquire` waits for a free connection
    pub connect_timeout: Duration,

    /// How long a statement waits for a row lock
    pub lock_timeout: Duration,

    /// Isolation level new connections start with
    pub default_isolation: IsolationLevel,
}

impl PoolConfig {
    pub fn new(database: &str) -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            database: database.to_string(),
            max_connections: 10,
            connect_timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(5),
            default_isolation: IsolationLevel::ReadCommitted,
        }
    }

    /// Set the database name
    pub fn database(mut self, database: &str) -> Self {
        self.database = database.to_string();
        self
    }

    /// Set the host
    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set row-lock wait timeout
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn default_isolation(mut self, level: IsolationLevel) -> Self {
        self.default_isolation = level;
        self
    }

    /// Parse from connection string
    ///
    /// Format: "memdb://host[:port]/database"
    ///
    /// # Examples
    ///
    /// ```
    /// use txscope::PoolConfig;
    ///
    /// let config = PoolConfig::from_url("memdb://db.local:6000/app").unwrap();
    /// assert_eq!(config.port, 6000);
    /// assert_eq!(config.database, "app");
    /// ```
    pub fn from_url(url: &str) -> std::result::Result<Self, String> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| format!("URL must start with '{}'", URL_SCHEME))?;

        let (host_port, database) = rest
            .split_once('/')
            .ok_or_else(|| "Invalid host/database format".to_string())?;

        if database.is_empty() || database.contains('/') {
            return Err("Invalid database name".to_string());
        }

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => (
                host,
                port.parse().map_err(|_| "Invalid port".to_string())?,
            ),
            None => (host_port, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err("Host cannot be empty".to_string());
        }

        Ok(Self::new(database).host(host).port(port))
    }

    /// Convert to connection string
    pub fn to_url(&self) -> String {
        format!("{}{}:{}/{}", URL_SCHEME, self.host, self.port, self.database)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.database.is_empty() {
            return Err("Database name cannot be empty".to_string());
        }

        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }

        if self.max_connections > MAX_CONNECTIONS {
            return Err(format!("max_connections must be <= {}", MAX_CONNECTIONS));
        }

        if self.connect_timeout.is_zero() {
            return Err("connect_timeout must be > 0".to_string());
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

/// On-disk shape of [`PoolConfig`]: either a `url` or discrete fields,
/// durations in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPoolConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_connections: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connect_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lock_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    isolation: Option<IsolationLevel>,
}

impl TryFrom<RawPoolConfig> for PoolConfig {
    type Error = String;

    fn try_from(raw: RawPoolConfig) -> std::result::Result<Self, Self::Error> {
        let mut config = match raw.url.as_deref() {
            Some(url) => PoolConfig::from_url(url)?,
            None => PoolConfig::default(),
        };

        if let Some(host) = raw.host {
            config.host = host;
        }
        if let Some(port) = raw.port {
            config.port = port;
        }
        if let Some(database) = raw.database {
            config.database = database;
        }
        if let Some(max) = raw.max_connections {
            config.max_connections = max;
        }
        if let Some(ms) = raw.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.lock_timeout_ms {
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(level) = raw.isolation {
            config.default_isolation = level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl From<PoolConfig> for RawPoolConfig {
    fn from(config: PoolConfig) -> Self {
        Self {
            url: Some(config.to_url()),
            host: None,
            port: None,
            database: None,
            max_connections: Some(config.max_connections),
            connect_timeout_ms: Some(config.connect_timeout.as_millis() as u64),
            lock_timeout_ms: Some(config.lock_timeout.as_millis() as u64),
            isolation: Some(config.default_isolation),
        }
    }
}

/// Named logical databases and the one used when no name is given.
///
/// ```json
/// {
///   "default": "app",
///   "databases": {
///     "app":     { "url": "memdb://localhost/app", "max_connections": 4 },
///     "reports": { "database": "reports", "isolation": "serializable" }
///   }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabasesConfig {
    #[serde(default = "default_database_name")]
    pub default: String,

    #[serde(default)]
    pub databases: BTreeMap<String, PoolConfig>,
}

fn default_database_name() -> String {
    "default".to_string()
}

impl Default for DatabasesConfig {
    fn default() -> Self {
        Self {
            default: default_database_name(),
            databases: BTreeMap::new(),
        }
    }
}

impl DatabasesConfig {
    /// Single database registered under `name`, which is also the default
    pub fn single(name: &str, config: PoolConfig) -> Self {
        let mut databases = BTreeMap::new();
        databases.insert(name.to_string(), config);
        Self {
            default: name.to_string(),
            databases,
        }
    }

    pub fn with_database(mut self, name: &str, config: PoolConfig) -> Self {
        self.databases.insert(name.to_string(), config);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: DatabasesConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            DbError::InvalidConfig(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.databases.is_empty() && !self.databases.contains_key(&self.default) {
            return Err(DbError::InvalidConfig(format!(
                "Default database '{}' is not configured",
                self.default
            )));
        }

        for (name, config) in &self.databases {
            config
                .validate()
                .map_err(|e| DbError::InvalidConfig(format!("{}: {}", name, e)))?;
        }

        Ok(())
    }
}
