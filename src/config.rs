//! Configuration handling for the DB HTTP gateway.
//!
//! Two layers: command line arguments (with environment fallbacks) choose the
//! config file and logging, and the JSON config file describes the server and
//! every database alias and cluster.

use crate::db::executor::DEFAULT_CHECKOUT_TIMEOUT_SECS;
use crate::db::pool::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_IDLE_EXPIRATION_SECS, DEFAULT_MAX_CONNECTIONS,
    PoolPolicy,
};
use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use clap::Parser;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Command line arguments.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-http-gateway",
    about = "HTTP gateway that runs JSON statement batches against pooled SQL connections",
    version,
    author
)]
pub struct Cli {
    /// Path to the JSON config file
    #[arg(
        short,
        long,
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_PATH,
        env = "GATEWAY_CONFIG"
    )]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GATEWAY_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "GATEWAY_JSON_LOGS")]
    pub json_logs: bool,

    /// Start without opening a test connection per alias
    #[arg(long, env = "GATEWAY_SKIP_CONNECT_CHECK")]
    pub skip_connect_check: bool,
}

/// One database alias.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasConfig {
    pub alias: String,
    /// Driver name; inferred from the DSN scheme when absent.
    #[serde(default)]
    pub driver: Option<String>,
    pub dsn: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub max_connections: Option<i64>,
    /// Seconds an idle connection may sit before it is destroyed.
    #[serde(default)]
    pub expiration_time: Option<i64>,
    /// Seconds to wait for a new connection.
    #[serde(default)]
    pub connect_timeout: Option<i64>,
}

impl AliasConfig {
    /// Resolve the database type from `driver` and the DSN scheme.
    pub fn db_type(&self) -> DbResult<DatabaseType> {
        let from_dsn = DatabaseType::from_connection_string(&self.dsn);

        match self.driver.as_deref().filter(|d| !d.trim().is_empty()) {
            Some(driver) => {
                let from_driver = DatabaseType::from_driver_name(driver).ok_or_else(|| {
                    DbError::config(format!(
                        "Unknown driver '{}' for alias '{}'",
                        driver, self.alias
                    ))
                })?;
                match from_dsn {
                    Some(dsn_type) if dsn_type != from_driver => Err(DbError::config(format!(
                        "Driver '{}' does not match the dsn of alias '{}'",
                        driver, self.alias
                    ))),
                    _ => Ok(from_driver),
                }
            }
            None => from_dsn.ok_or_else(|| {
                DbError::config(format!(
                    "Cannot infer the driver from the dsn of alias '{}'",
                    self.alias
                ))
            }),
        }
    }

    pub fn max_connections_or_default(&self) -> usize {
        positive_or_default(
            &self.alias,
            "maxConnections",
            self.max_connections,
            DEFAULT_MAX_CONNECTIONS as i64,
        ) as usize
    }

    pub fn expiration_or_default(&self) -> Duration {
        Duration::from_secs(positive_or_default(
            &self.alias,
            "expirationTime",
            self.expiration_time,
            DEFAULT_IDLE_EXPIRATION_SECS as i64,
        ) as u64)
    }

    pub fn connect_timeout_or_default(&self) -> Duration {
        Duration::from_secs(positive_or_default(
            &self.alias,
            "connectTimeout",
            self.connect_timeout,
            DEFAULT_CONNECT_TIMEOUT_SECS as i64,
        ) as u64)
    }

    /// Pool policy for this alias, defaults applied.
    pub fn policy(&self) -> PoolPolicy {
        PoolPolicy {
            max_connections: self.max_connections_or_default(),
            idle_expiration: self.expiration_or_default(),
            connect_timeout: self.connect_timeout_or_default(),
        }
    }
}

fn positive_or_default(alias: &str, key: &str, value: Option<i64>, default: i64) -> i64 {
    match value {
        Some(v) if v > 0 => v,
        _ => {
            warn!(alias = %alias, key, default, "Setting missing or not positive; using default");
            default
        }
    }
}

/// A read/write-splitting cluster over db aliases.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub alias: String,
    pub write_to: String,
    #[serde(default)]
    pub read_from: Vec<String>,
}

/// Contents of the JSON config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default)]
    pub server_port: u16,
    #[serde(default)]
    pub use_gzip: bool,
    #[serde(default)]
    pub max_concurrent_requests: usize,
    /// Seconds a request may wait for a pooled connection.
    #[serde(default)]
    pub checkout_timeout: Option<u64>,
    #[serde(default)]
    pub macro_path: Option<PathBuf>,
    #[serde(default)]
    pub db_aliases: Vec<AliasConfig>,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

fn default_server_host() -> String {
    DEFAULT_SERVER_HOST.to_string()
}

impl GatewayConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> DbResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DbError::config(format!(
                "{} could not be found and/or read: {}",
                path.display(),
                e
            ))
        })?;
        if text.trim().is_empty() {
            return Err(DbError::config(format!("{} is empty", path.display())));
        }
        Self::from_json(&text)
    }

    /// Parse and validate config JSON.
    pub fn from_json(json: &str) -> DbResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DbError::config(format!("Config does not contain valid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that can be checked without touching a database.
    pub fn validate(&self) -> DbResult<()> {
        if self.server_port == 0 {
            return Err(DbError::config("The server port was not specified"));
        }
        if self.max_concurrent_requests == 0 {
            return Err(DbError::config(
                "The max concurrent requests setting was not specified",
            ));
        }
        if self.db_aliases.is_empty() {
            return Err(DbError::config("No dbAliases defined"));
        }

        let mut db_aliases = HashSet::new();
        for alias in &self.db_aliases {
            if alias.alias.trim().is_empty() {
                return Err(DbError::config("A db alias has an empty name"));
            }
            if alias.dsn.trim().is_empty() {
                return Err(DbError::config(format!(
                    "Alias '{}' has an empty dsn",
                    alias.alias
                )));
            }
            alias.db_type()?;
            if !db_aliases.insert(alias.alias.as_str()) {
                return Err(DbError::alias_already_defined(&alias.alias));
            }
        }

        let mut cluster_aliases = HashSet::new();
        for cluster in &self.clusters {
            if cluster.alias.trim().is_empty() {
                return Err(DbError::config("A cluster has an empty name"));
            }
            if db_aliases.contains(cluster.alias.as_str())
                || !cluster_aliases.insert(cluster.alias.as_str())
            {
                return Err(DbError::alias_already_defined(&cluster.alias));
            }
            if cluster.read_from.is_empty() {
                return Err(DbError::config(format!(
                    "Cluster '{}' has an empty readFrom list",
                    cluster.alias
                )));
            }
            for member in std::iter::once(&cluster.write_to).chain(&cluster.read_from) {
                if !db_aliases.contains(member.as_str()) {
                    return Err(DbError::config(format!(
                        "Cluster '{}' references unknown db alias '{}'",
                        cluster.alias, member
                    )));
                }
            }
        }

        Ok(())
    }

    /// Get the HTTP bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn checkout_timeout_duration(&self) -> Duration {
        Duration::from_secs(
            self.checkout_timeout
                .filter(|t| *t > 0)
                .unwrap_or(DEFAULT_CHECKOUT_TIMEOUT_SECS),
        )
    }
}
