//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use palaver_shared::constants::DEFAULT_HTTP_PORT;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:5000`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./data/palaver.db`
    pub database_path: PathBuf,

    /// Directory where uploaded images are stored.
    /// Env: `BLOB_STORAGE_PATH`
    /// Default: `./uploads`
    pub blob_storage_path: PathBuf,

    /// Maximum upload size in bytes.
    /// Env: `MAX_BLOB_SIZE`
    /// Default: 10 MiB
    pub max_blob_size: usize,

    /// Base URL used to build image URLs returned by `/uploads`.
    /// Env: `PUBLIC_BASE_URL`
    /// Default: `http://localhost:5000`
    pub public_base_url: String,

    /// Key for signing bearer tokens (hex-encoded, 64 chars).
    /// Env: `TOKEN_SECRET`
    /// Default: random per boot, so tokens do not survive a restart.
    pub token_secret: [u8; 32],

    /// Lifetime of issued tokens.
    /// Env: `TOKEN_TTL_SECS`
    /// Default: 7 days
    pub token_ttl: Duration,

    /// How long an unauthenticated socket may wait before sending its
    /// `authenticate` frame.
    /// Env: `HANDSHAKE_TIMEOUT_SECS`
    /// Default: 10 s
    pub handshake_timeout: Duration,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Palaver"`
    pub instance_name: String,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Sustained inbound socket events per second, per connection.
    /// Env: `EVENTS_PER_SEC`
    /// Default: 20
    pub events_per_sec: f64,

    /// Socket event burst allowance, per connection.
    /// Env: `EVENT_BURST`
    /// Default: 40
    pub event_burst: f64,
}

// Secrets stay out of the boot log.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("blob_storage_path", &self.blob_storage_path)
            .field("max_blob_size", &self.max_blob_size)
            .field("public_base_url", &self.public_base_url)
            .field("token_ttl", &self.token_ttl)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("instance_name", &self.instance_name)
            .field("admin_enabled", &self.admin_token.is_some())
            .field("events_per_sec", &self.events_per_sec)
            .field("event_burst", &self.event_burst)
            .finish_non_exhaustive()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./data/palaver.db"),
            blob_storage_path: PathBuf::from("./uploads"),
            max_blob_size: 10 * 1024 * 1024, // 10 MiB
            public_base_url: format!("http://localhost:{DEFAULT_HTTP_PORT}"),
            token_secret: rand::random(),
            token_ttl: Duration::from_secs(7 * 24 * 3600),
            handshake_timeout: Duration::from_secs(10),
            instance_name: "Palaver".to_string(),
            admin_token: None,
            events_per_sec: 20.0,
            event_burst: 40.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("BLOB_STORAGE_PATH") {
            config.blob_storage_path = PathBuf::from(path);
        }

        if let Some(n) = parse_var::<usize>("MAX_BLOB_SIZE") {
            config.max_blob_size = n;
        }

        if let Ok(url) = std::env::var("PUBLIC_BASE_URL") {
            config.public_base_url = url.trim_end_matches('/').to_string();
        }

        match std::env::var("TOKEN_SECRET") {
            Ok(hex_key) => match parse_hex_key(&hex_key) {
                Ok(key) => config.token_secret = key,
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid TOKEN_SECRET, using a random key");
                }
            },
            Err(_) => {
                tracing::warn!("TOKEN_SECRET not set, tokens will not survive a restart");
            }
        }

        if let Some(secs) = parse_var::<u64>("TOKEN_TTL_SECS") {
            config.token_ttl = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_var::<u64>("HANDSHAKE_TIMEOUT_SECS") {
            config.handshake_timeout = Duration::from_secs(secs);
        }

        if let Ok(name) = std::env::var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(rate) = parse_var::<f64>("EVENTS_PER_SEC").filter(|r| *r > 0.0) {
            config.events_per_sec = rate;
        }

        if let Some(burst) = parse_var::<f64>("EVENT_BURST").filter(|b| *b >= 1.0) {
            config.event_burst = burst;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}

/// Parse a 64-character hex string into a 32-byte key.
fn parse_hex_key(hex_str: &str) -> Result<[u8; 32], String> {
    let hex_str = hex_str.trim();
    if hex_str.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex_str.len()));
    }
    let mut key = [0u8; 32];
    hex::decode_to_slice(hex_str, &mut key).map_err(|e| e.to_string())?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 5000).into());
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_default_secret_is_random() {
        assert_ne!(
            ServerConfig::default().token_secret,
            ServerConfig::default().token_secret
        );
    }

    #[test]
    fn test_parse_hex_key() {
        let hex = "ab".repeat(32);
        let key = parse_hex_key(&hex).unwrap();
        assert_eq!(key, [0xab; 32]);
    }

    #[test]
    fn test_parse_hex_key_rejects_bad_input() {
        assert!(parse_hex_key("abcd").is_err());
        assert!(parse_hex_key(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let mut config = ServerConfig::default();
        config.admin_token = Some("hunter2".into());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("token_secret"));
    }
}
