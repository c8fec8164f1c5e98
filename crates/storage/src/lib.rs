use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use shared::domain::{ConnectionId, ConnectionInfo};
use thiserror::Error;

mod keys;
mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

pub const DEFAULT_CONNECTION_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_CHECK_EXPIRED_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_KEY_PREFIX: &str = "statehouse";
/// Upper bound on a connection TTL accepted by [`open_store`].
pub const MAX_CONNECTION_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Final per-module states of one connection, keyed by module name.
pub type ModuleStates = BTreeMap<String, Value>;

/// Produces a module's initial state the first time it is read.
pub type StateFactory<'a> = &'a (dyn Fn() -> Value + Send + Sync);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("corrupt value under key {key}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("state backend failure")]
    Backend(#[from] redis::RedisError),
}

impl StoreError {
    pub fn is_unknown_connection(&self) -> bool {
        matches!(self, Self::UnknownConnection(_))
    }
}

/// Per-connection, per-module state persistence with TTL-bound liveness.
///
/// Every operation except [`SessionStore::new_connection`] fails with
/// [`StoreError::UnknownConnection`] once the connection marker is absent or
/// expired, whatever module keys may still linger.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Lifetime granted to the connection marker and every state key on write or renew.
    fn ttl(&self) -> Duration;

    async fn new_connection(&self) -> Result<ConnectionId, StoreError>;

    async fn connection_info(&self, id: &ConnectionId) -> Result<ConnectionInfo, StoreError>;

    /// Resets the TTL of the connection marker and of each named module's state key.
    /// Module keys that do not exist are skipped.
    async fn renew_connection(
        &self,
        id: &ConnectionId,
        module_names: &[String],
    ) -> Result<(), StoreError>;

    /// Returns the persisted state, or persists and returns `initial()` when none exists.
    async fn get_state(
        &self,
        id: &ConnectionId,
        module_name: &str,
        initial: StateFactory<'_>,
    ) -> Result<Value, StoreError>;

    /// Writes every given module state in one batch, refreshing each key's TTL.
    async fn update_state(
        &self,
        id: &ConnectionId,
        states: &ModuleStates,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Redis,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => anyhow::bail!("invalid backend '{other}', expected 'memory' or 'redis'"),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Redis => f.write_str("redis"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub connection_ttl: Duration,
    /// Sweep period of the memory backend. `None` relies on lazy expiry alone.
    pub check_expired_interval: Option<Duration>,
    pub redis_url: String,
    pub key_prefix: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Memory,
            connection_ttl: DEFAULT_CONNECTION_TTL,
            check_expired_interval: Some(DEFAULT_CHECK_EXPIRED_INTERVAL),
            redis_url: "redis://127.0.0.1:6379".into(),
            key_prefix: DEFAULT_KEY_PREFIX.into(),
        }
    }
}

/// Builds the configured backend. Must run inside a tokio runtime.
pub async fn open_store(config: &BackendConfig) -> anyhow::Result<Arc<dyn SessionStore>> {
    anyhow::ensure!(
        !config.connection_ttl.is_zero(),
        "connection ttl must be greater than zero"
    );
    anyhow::ensure!(
        config.connection_ttl <= MAX_CONNECTION_TTL,
        "connection ttl must not exceed {}s",
        MAX_CONNECTION_TTL.as_secs()
    );
    match config.kind {
        BackendKind::Memory => Ok(Arc::new(MemoryStore::from_config(config))),
        BackendKind::Redis => {
            let store = RedisStore::connect(
                &config.redis_url,
                &config.key_prefix,
                config.connection_ttl,
            )
            .await
            .with_context(|| format!("failed to connect to redis at {}", config.redis_url))?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
