//! Store configuration.
//!
//! `DatabaseConfig` mirrors the connection parameters a record store is
//! built with. It can be assembled in code or read from a TOML document:
//!
//! ```toml
//! user = "app"
//! password = "secret"
//! database = "/var/lib/app/records.db"
//!
//! [pool]
//! max_size = 8
//! trace_sql = true
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DataError, DataResult};
use crate::pool::PoolConfig;

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    3306
}

/// Connection parameters and pool policy for one backing-store target.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Database name; for SQLite, the database file path.
    pub database: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl DatabaseConfig {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            user: String::new(),
            password: String::new(),
            database: database.into(),
            host: default_host(),
            port: default_port(),
            pool: PoolConfig::default(),
        }
    }

    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn from_toml_str(text: &str) -> DataResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| DataError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> DataResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DataError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> DataResult<()> {
        if self.database.trim().is_empty() {
            return Err(DataError::InvalidConfig(
                "database must not be empty".to_string(),
            ));
        }
        self.pool.validate()
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("pool", &self.pool)
            .finish()
    }
}
