//! Config Resolver (C3)
//!
//! Merges compiled-in defaults, an optional TOML file, environment variables,
//! and persisted `settings` rows into an immutable snapshot. Readers hold an
//! `Arc<Config>` clone; a hot-reload publishes a new snapshot without
//! disturbing requests already in flight.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::Deserialize;

use crate::db::DbPooledConnection;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_path: PathBuf,
    pub max_concurrent_streams: u32,
    pub per_stream_concurrency_default: u32,
    pub deferred_first_byte_deadline_ms: u64,
    pub deferred_handover_deadline_ms: u64,
    pub deferred_start_threshold_ms: u64,
    pub session_idle_grace_seconds: u64,
    pub session_idle_ceiling_seconds: u64,
    pub epg_refresh_parallelism: usize,
    pub timezone: String,
    pub transcoder_binary_path: String,
    pub transcoder_default_profile: String,
    pub log_level: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_number: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5004".parse().expect("valid default bind address"),
            database_path: PathBuf::from("iptv-bridge.db"),
            max_concurrent_streams: 4,
            per_stream_concurrency_default: 1,
            deferred_first_byte_deadline_ms: 1000,
            deferred_handover_deadline_ms: 30_000,
            deferred_start_threshold_ms: 3000,
            session_idle_grace_seconds: 20,
            session_idle_ceiling_seconds: 90,
            epg_refresh_parallelism: 2,
            timezone: "UTC".to_string(),
            transcoder_binary_path: "ffmpeg".to_string(),
            transcoder_default_profile: "fallback".to_string(),
            log_level: "info".to_string(),
            friendly_name: "IPTV Bridge".to_string(),
            manufacturer: "IPTV Bridge Project".to_string(),
            model_number: "HDHR5-4K".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid bind address: {0}")]
    InvalidBindAddress(#[from] std::net::AddrParseError),
}

impl Config {
    /// Load defaults, overlay an optional TOML file, then overlay environment variables.
    pub fn load(file_path: Option<&PathBuf>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = file_path {
            if path.exists() {
                let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
                    path: path.clone(),
                    source,
                })?;
                let file_config: PartialConfig =
                    toml::from_str(&contents).map_err(|source| ConfigError::ParseFailed {
                        path: path.clone(),
                        source,
                    })?;
                file_config.apply_to(&mut config);
            }
        }

        if let Ok(addr) = std::env::var("IPTV_BIND_ADDRESS") {
            config.bind_address = addr.parse()?;
        }
        if let Ok(path) = std::env::var("IPTV_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Ok(v) = std::env::var("IPTV_MAX_CONCURRENT_STREAMS") {
            if let Ok(parsed) = v.parse() {
                config.max_concurrent_streams = parsed;
            }
        }
        if let Ok(level) = std::env::var("IPTV_LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Overlay settings persisted in the database (lowest-precedence layer that
    /// is nonetheless applied last, since it represents live runtime state an
    /// operator changed after the process started).
    pub fn apply_persisted_settings(&mut self, conn: &mut DbPooledConnection) {
        use crate::db::schema::settings::dsl::*;
        use diesel::prelude::*;

        let Ok(rows) = settings.load::<crate::db::Setting>(conn) else {
            return;
        };

        for row in rows {
            match row.key.as_str() {
                "max_concurrent_streams" => {
                    if let Ok(v) = row.value.parse() {
                        self.max_concurrent_streams = v;
                    }
                }
                "per_stream_concurrency_default" => {
                    if let Ok(v) = row.value.parse() {
                        self.per_stream_concurrency_default = v;
                    }
                }
                "deferred_start_threshold_ms" => {
                    if let Ok(v) = row.value.parse() {
                        self.deferred_start_threshold_ms = v;
                    }
                }
                "session_idle_grace_seconds" => {
                    if let Ok(v) = row.value.parse() {
                        self.session_idle_grace_seconds = v;
                    }
                }
                "timezone" => self.timezone = row.value,
                "transcoder_binary_path" => self.transcoder_binary_path = row.value,
                "transcoder_default_profile" => self.transcoder_default_profile = row.value,
                _ => {}
            }
        }
    }
}

/// Mirrors `Config` but with every field optional, for partial TOML overlays.
#[derive(Debug, Deserialize, Default)]
struct PartialConfig {
    bind_address: Option<SocketAddr>,
    database_path: Option<PathBuf>,
    max_concurrent_streams: Option<u32>,
    per_stream_concurrency_default: Option<u32>,
    deferred_first_byte_deadline_ms: Option<u64>,
    deferred_handover_deadline_ms: Option<u64>,
    deferred_start_threshold_ms: Option<u64>,
    session_idle_grace_seconds: Option<u64>,
    session_idle_ceiling_seconds: Option<u64>,
    epg_refresh_parallelism: Option<usize>,
    timezone: Option<String>,
    transcoder_binary_path: Option<String>,
    transcoder_default_profile: Option<String>,
    log_level: Option<String>,
    friendly_name: Option<String>,
    manufacturer: Option<String>,
    model_number: Option<String>,
}

impl PartialConfig {
    fn apply_to(self, config: &mut Config) {
        macro_rules! overlay {
            ($field:ident) => {
                if let Some(v) = self.$field {
                    config.$field = v;
                }
            };
        }
        overlay!(bind_address);
        overlay!(database_path);
        overlay!(max_concurrent_streams);
        overlay!(per_stream_concurrency_default);
        overlay!(deferred_first_byte_deadline_ms);
        overlay!(deferred_handover_deadline_ms);
        overlay!(deferred_start_threshold_ms);
        overlay!(session_idle_grace_seconds);
        overlay!(session_idle_ceiling_seconds);
        overlay!(epg_refresh_parallelism);
        overlay!(timezone);
        overlay!(transcoder_binary_path);
        overlay!(transcoder_default_profile);
        overlay!(log_level);
        overlay!(friendly_name);
        overlay!(manufacturer);
        overlay!(model_number);
    }
}

/// Holds the current configuration snapshot behind a short read lock; hot-reload
/// publishes a fresh `Arc<Config>` so in-flight requests keep using the snapshot
/// they already captured.
#[derive(Clone)]
pub struct ConfigResolver {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigResolver {
    pub fn new(initial: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    /// Capture the current snapshot. Cheap: one `Arc` clone.
    pub fn snapshot(&self) -> Arc<Config> {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Publish a new snapshot atomically.
    pub fn publish(&self, new_config: Config) {
        let mut guard = self.inner.write().expect("config lock poisoned");
        *guard = Arc::new(new_config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_binds_lan_visible() {
        let config = Config::default();
        assert_eq!(config.bind_address.ip().to_string(), "0.0.0.0");
        assert_eq!(config.max_concurrent_streams, 4);
    }

    #[test]
    fn resolver_publish_does_not_affect_existing_snapshot() {
        let resolver = ConfigResolver::new(Config::default());
        let snapshot = resolver.snapshot();
        assert_eq!(snapshot.max_concurrent_streams, 4);

        let mut updated = Config::default();
        updated.max_concurrent_streams = 8;
        resolver.publish(updated);

        assert_eq!(snapshot.max_concurrent_streams, 4);
        assert_eq!(resolver.snapshot().max_concurrent_streams, 8);
    }

    #[test]
    fn partial_toml_overlay_only_touches_named_fields() {
        let mut config = Config::default();
        let partial: PartialConfig = toml::from_str("max_concurrent_streams = 10\n").unwrap();
        partial.apply_to(&mut config);
        assert_eq!(config.max_concurrent_streams, 10);
        assert_eq!(config.timezone, "UTC");
    }
}
