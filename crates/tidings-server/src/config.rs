//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development: SQLite in the working directory,
//! in-process cache and bus, unsigned attachment references.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tidings_shared::constants::{DEFAULT_HTTP_PORT, MAX_PAYLOAD_BYTES, ROLLING_CACHE_TTL_SECS};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite file holding the durable message log.
    /// Env: `DATABASE_PATH`
    /// Default: `./tidings.db`
    pub database_path: PathBuf,

    /// Redis connection string. When present the rolling cache and the
    /// broadcast bus are shared across processes through Redis.
    /// Env: `REDIS_URL`
    pub redis_url: Option<String>,

    /// HMAC key for attachment URLs. Without it references are returned
    /// unsigned.
    /// Env: `SIGNING_SECRET`
    pub signing_secret: Option<String>,

    /// Bearer token that authorizes directory sync (`PUT /users/:id`). The
    /// route is disabled without it.
    /// Env: `DIRECTORY_TOKEN`
    pub directory_token: Option<String>,

    /// Public prefix prepended to signed attachment references.
    /// Env: `ATTACHMENT_BASE_URL`
    /// Default: `/files`
    pub attachment_base_url: String,

    /// Lifetime of a signed attachment URL.
    /// Env: `ATTACHMENT_URL_TTL_SECS`
    /// Default: 900
    pub attachment_url_ttl: Duration,

    /// Rolling cache entry lifetime, refreshed on every write.
    /// Env: `CACHE_TTL_SECS`
    /// Default: 3600
    pub cache_ttl: Duration,

    /// Budget for a single cache call before it counts as a miss.
    /// Env: `CACHE_TIMEOUT_MS`
    /// Default: 150
    pub cache_timeout: Duration,

    /// Budget for a durable-log read.
    /// Env: `READ_TIMEOUT_MS`
    /// Default: 5000
    pub read_timeout: Duration,

    /// Largest accepted send payload (body plus attachment metadata).
    /// Env: `MAX_PAYLOAD_BYTES`
    /// Default: 1 MiB
    pub max_payload_bytes: usize,

    /// How often expired cache entries are swept.
    /// Env: `SWEEP_INTERVAL_SECS`
    /// Default: 300
    pub sweep_interval: Duration,

    /// Whether operator broadcasts raise unread counts.
    /// Env: `BROADCAST_COUNTS_UNREAD` (true/false)
    /// Default: `true`
    pub broadcast_counts_unread: bool,

    /// Name of this process in logs and bus envelopes.
    /// Env: `INSTANCE_ID`
    /// Default: random UUID
    pub instance_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./tidings.db"),
            redis_url: None,
            signing_secret: None,
            directory_token: None,
            attachment_base_url: "/files".to_string(),
            attachment_url_ttl: Duration::from_secs(900),
            cache_ttl: Duration::from_secs(ROLLING_CACHE_TTL_SECS),
            cache_timeout: Duration::from_millis(150),
            read_timeout: Duration::from_millis(5000),
            max_payload_bytes: MAX_PAYLOAD_BYTES,
            sweep_interval: Duration::from_secs(300),
            broadcast_counts_unread: true,
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

// Secrets stay out of the startup log.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("redis", &self.redis_url.is_some())
            .field("signing", &self.signing_secret.is_some())
            .field("directory_sync", &self.directory_token.is_some())
            .field("attachment_base_url", &self.attachment_base_url)
            .field("cache_ttl", &self.cache_ttl)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .field("broadcast_counts_unread", &self.broadcast_counts_unread)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        config.redis_url = var("REDIS_URL").filter(|v| !v.is_empty());
        config.signing_secret = var("SIGNING_SECRET").filter(|v| !v.is_empty());
        config.directory_token = var("DIRECTORY_TOKEN").filter(|v| !v.is_empty());

        if let Some(url) = var("ATTACHMENT_BASE_URL") {
            config.attachment_base_url = url.trim_end_matches('/').to_string();
        }

        if let Some(secs) = parse_num(&var, "ATTACHMENT_URL_TTL_SECS") {
            config.attachment_url_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_num(&var, "CACHE_TTL_SECS") {
            config.cache_ttl = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = parse_num(&var, "CACHE_TIMEOUT_MS") {
            config.cache_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_num(&var, "READ_TIMEOUT_MS") {
            config.read_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = parse_num(&var, "MAX_PAYLOAD_BYTES") {
            config.max_payload_bytes = bytes as usize;
        }
        if let Some(secs) = parse_num(&var, "SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }

        if let Some(val) = var("BROADCAST_COUNTS_UNREAD") {
            config.broadcast_counts_unread = val != "false" && val != "0";
        }

        if let Some(id) = var("INSTANCE_ID").filter(|v| !v.is_empty()) {
            config.instance_id = id;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_num(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = var(key)?;
    match raw.trim().parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid numeric setting, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.max_payload_bytes, 1024 * 1024);
        assert!(config.broadcast_counts_unread);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("REDIS_URL", "redis://cache:6379"),
            ("ATTACHMENT_BASE_URL", "https://cdn.example.org/"),
            ("CACHE_TIMEOUT_MS", "40"),
            ("BROADCAST_COUNTS_UNREAD", "false"),
            ("INSTANCE_ID", "node-a"),
            ("DIRECTORY_TOKEN", "sync-me"),
        ]
        .into_iter()
        .collect();

        let config = ServerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.attachment_base_url, "https://cdn.example.org");
        assert_eq!(config.cache_timeout, Duration::from_millis(40));
        assert!(!config.broadcast_counts_unread);
        assert_eq!(config.instance_id, "node-a");
        assert_eq!(config.directory_token.as_deref(), Some("sync-me"));
        assert!(!format!("{config:?}").contains("sync-me"));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ServerConfig::from_lookup(|k| match k {
            "HTTP_ADDR" => Some("not-an-addr".into()),
            "READ_TIMEOUT_MS" => Some("soon".into()),
            _ => None,
        });
        assert_eq!(config.http_addr, ServerConfig::default().http_addr);
        assert_eq!(config.read_timeout, Duration::from_millis(5000));
    }
}
