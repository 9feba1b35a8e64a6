//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the server can start with zero
//! configuration for local development.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use permsync_shared::constants::{
    CREDENTIAL_KEY_SIZE, DEFAULT_FETCH_MAX_BYTES, DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_HTTP_PORT,
    DEFAULT_SYNC_INTERVAL_SECS, DEFAULT_SYNC_JITTER_SECS,
};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the admin API.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./permsync.db`
    pub database_path: PathBuf,

    /// Bearer token for the admin API.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Key sealing subscription fetch passwords (hex-encoded, 64 chars).
    /// Env: `CREDENTIAL_KEY`
    /// Default: all-zeros (development only).
    pub credential_key: [u8; CREDENTIAL_KEY_SIZE],

    /// Env: `SYNC_INTERVAL_SECS`
    pub sync_interval: Duration,

    /// Upper bound of the random delay added to each interval.
    /// Env: `SYNC_JITTER_SECS`
    pub sync_jitter: Duration,

    /// Env: `FETCH_TIMEOUT_SECS`
    pub fetch_timeout: Duration,

    /// Largest list body accepted, in bytes.
    /// Env: `FETCH_MAX_BYTES`
    pub fetch_max_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./permsync.db"),
            admin_token: None,
            credential_key: [0u8; CREDENTIAL_KEY_SIZE],
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            sync_jitter: Duration::from_secs(DEFAULT_SYNC_JITTER_SECS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            fetch_max_bytes: DEFAULT_FETCH_MAX_BYTES,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("admin_enabled", &self.admin_token.is_some())
            .field("credential_key", &"<redacted>")
            .field("sync_interval", &self.sync_interval)
            .field("sync_jitter", &self.sync_jitter)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("fetch_max_bytes", &self.fetch_max_bytes)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&var, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(token) = var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        match var("CREDENTIAL_KEY") {
            Some(hex_key) => match parse_hex_key(&hex_key) {
                Ok(key) => config.credential_key = key,
                Err(e) => tracing::warn!(
                    error = %e,
                    "Invalid CREDENTIAL_KEY, using default (dev-only)"
                ),
            },
            None => tracing::warn!("CREDENTIAL_KEY not set, using default (dev-only)"),
        }

        let mut secs = config.sync_interval.as_secs();
        parse_into(&var, "SYNC_INTERVAL_SECS", &mut secs);
        config.sync_interval = Duration::from_secs(secs.max(1));

        let mut secs = config.sync_jitter.as_secs();
        parse_into(&var, "SYNC_JITTER_SECS", &mut secs);
        config.sync_jitter = Duration::from_secs(secs);

        let mut secs = config.fetch_timeout.as_secs();
        parse_into(&var, "FETCH_TIMEOUT_SECS", &mut secs);
        config.fetch_timeout = Duration::from_secs(secs.max(1));

        parse_into(&var, "FETCH_MAX_BYTES", &mut config.fetch_max_bytes);

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

/// Overwrite `target` with the parsed variable, keeping it on parse errors.
fn parse_into<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str, target: &mut T) {
    let Some(raw) = var(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(variable = name, value = %raw, "Invalid value, using default"),
    }
}

/// Parse a 64-character hex string into a 32-byte key.
fn parse_hex_key(hex: &str) -> Result<[u8; CREDENTIAL_KEY_SIZE], String> {
    let hex = hex.trim();
    if hex.len() != CREDENTIAL_KEY_SIZE * 2 {
        return Err(format!(
            "expected {} hex chars, got {}",
            CREDENTIAL_KEY_SIZE * 2,
            hex.len()
        ));
    }

    let bytes = hex::decode(hex).map_err(|e| format!("invalid hex: {e}"))?;
    let mut key = [0u8; CREDENTIAL_KEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = config_from(&[]);
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.credential_key, [0u8; 32]);
        assert_eq!(config.admin_token, None);
        assert_eq!(config.sync_interval, Duration::from_secs(86_400));
        assert_eq!(config.fetch_max_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn test_overrides() {
        let key = "ab".repeat(32);
        let config = config_from(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("ADMIN_TOKEN", "s3cret"),
            ("CREDENTIAL_KEY", key.as_str()),
            ("SYNC_INTERVAL_SECS", "3600"),
            ("FETCH_MAX_BYTES", "1024"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.admin_token.as_deref(), Some("s3cret"));
        assert_eq!(config.credential_key, [0xab; 32]);
        assert_eq!(config.sync_interval, Duration::from_secs(3600));
        assert_eq!(config.fetch_max_bytes, 1024);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = config_from(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("ADMIN_TOKEN", ""),
            ("CREDENTIAL_KEY", "abcd"),
            ("FETCH_TIMEOUT_SECS", "soon"),
        ]);
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.admin_token, None);
        assert_eq!(config.credential_key, [0u8; 32]);
        assert_eq!(config.fetch_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let key = "ab".repeat(32);
        let config = config_from(&[("ADMIN_TOKEN", "s3cret"), ("CREDENTIAL_KEY", key.as_str())]);
        let printed = format!("{config:?}");
        assert!(!printed.contains("s3cret"));
        assert!(!printed.contains("abab"));
    }

    #[test]
    fn test_parse_hex_key() {
        assert_eq!(parse_hex_key(&"0f".repeat(32)).unwrap(), [0x0f; 32]);
        assert!(parse_hex_key("abcd").is_err());
        assert!(parse_hex_key(&"zz".repeat(32)).is_err());
    }
}
