use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::Context;
use storage::{
    BackendConfig, BackendKind, DEFAULT_CHECK_EXPIRED_INTERVAL, DEFAULT_CONNECTION_TTL,
    DEFAULT_KEY_PREFIX, MAX_CONNECTION_TTL,
};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub backend: BackendKind,
    pub connection_ttl_seconds: u64,
    /// `0` turns the memory sweeper off; expired entries are then dropped lazily.
    pub check_expired_interval_seconds: u64,
    pub redis_url: String,
    pub key_prefix: String,
    pub ping_interval_seconds: u64,
    pub serialize_connections: bool,
    pub body_limit_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8080".into(),
            backend: BackendKind::Memory,
            connection_ttl_seconds: DEFAULT_CONNECTION_TTL.as_secs(),
            check_expired_interval_seconds: DEFAULT_CHECK_EXPIRED_INTERVAL.as_secs(),
            redis_url: "redis://127.0.0.1:6379".into(),
            key_prefix: DEFAULT_KEY_PREFIX.into(),
            ping_interval_seconds: DEFAULT_PING_INTERVAL.as_secs(),
            serialize_connections: true,
            body_limit_bytes: 1024 * 1024,
        }
    }
}

impl Settings {
    /// Validated store configuration.
    pub fn backend_config(&self) -> anyhow::Result<BackendConfig> {
        anyhow::ensure!(
            self.connection_ttl_seconds > 0,
            "connection ttl must be greater than zero"
        );
        anyhow::ensure!(
            self.connection_ttl_seconds <= MAX_CONNECTION_TTL.as_secs(),
            "connection ttl ({}s) must not exceed {}s",
            self.connection_ttl_seconds,
            MAX_CONNECTION_TTL.as_secs()
        );
        anyhow::ensure!(
            self.ping_interval_seconds <= self.connection_ttl_seconds,
            "ping interval ({}s) must not exceed the connection ttl ({}s)",
            self.ping_interval_seconds,
            self.connection_ttl_seconds
        );
        Ok(BackendConfig {
            kind: self.backend,
            connection_ttl: Duration::from_secs(self.connection_ttl_seconds),
            check_expired_interval: (self.check_expired_interval_seconds > 0)
                .then(|| Duration::from_secs(self.check_expired_interval_seconds)),
            redis_url: self.redis_url.clone(),
            key_prefix: self.key_prefix.clone(),
        })
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds)
    }

    fn apply(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let value = value.trim();
        match key {
            "bind_addr" => self.server_bind = value.to_string(),
            "backend" => self.backend = value.parse()?,
            "connection_ttl_seconds" => {
                self.connection_ttl_seconds = parse_number(key, value)?;
            }
            "check_expired_interval_seconds" => {
                self.check_expired_interval_seconds = parse_number(key, value)?;
            }
            "redis_url" => self.redis_url = value.to_string(),
            "key_prefix" => self.key_prefix = value.to_string(),
            "ping_interval_seconds" => self.ping_interval_seconds = parse_number(key, value)?,
            "serialize_connections" => {
                self.serialize_connections = value
                    .parse()
                    .with_context(|| format!("{key} must be true or false, got '{value}'"))?;
            }
            "body_limit_bytes" => self.body_limit_bytes = parse_number(key, value)?,
            _ => {}
        }
        Ok(())
    }
}

fn parse_number<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("{key} must be a number, got '{value}'"))
}

const KEYS: [&str; 9] = [
    "bind_addr",
    "backend",
    "connection_ttl_seconds",
    "check_expired_interval_seconds",
    "redis_url",
    "key_prefix",
    "ping_interval_seconds",
    "serialize_connections",
    "body_limit_bytes",
];

/// Defaults, then `server.toml` in the working directory, then `APP__*`
/// environment variables (`SERVER_BIND` and `REDIS_URL` are accepted too).
pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Path::new("server.toml"), |name| std::env::var(name).ok())
}

pub(crate) fn load_settings_from(
    file: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(file) {
        let file_cfg = toml::from_str::<HashMap<String, String>>(&raw)
            .with_context(|| format!("failed to parse {}", file.display()))?;
        for key in KEYS {
            if let Some(v) = file_cfg.get(key) {
                settings.apply(key, v)?;
            }
        }
    }

    if let Some(v) = env("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = env("REDIS_URL") {
        settings.redis_url = v;
    }
    for key in KEYS {
        let name = format!("APP__{}", key.to_ascii_uppercase());
        if let Some(v) = env(&name) {
            settings
                .apply(key, &v)
                .with_context(|| format!("invalid value in {name}"))?;
        }
    }

    Ok(settings)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
