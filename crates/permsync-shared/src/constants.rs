/// Application name, used in the fetcher's `User-Agent`.
pub const APP_NAME: &str = "permsync";

/// Highest subscription priority. Priorities are `u8`, so 0 is the lowest.
pub const MAX_PRIORITY: i64 = 255;

/// Maximum length of a subscription title, in characters.
pub const MAX_TITLE_LEN: usize = 200;

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Credential sealing key size in bytes
pub const CREDENTIAL_KEY_SIZE: usize = 32;

/// Default interval between two scheduled cycles of one subscription (24 h)
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 86_400;

/// Upper bound of the random delay added to every scheduled cycle (10 min)
pub const DEFAULT_SYNC_JITTER_SECS: u64 = 600;

/// Default fetch timeout in seconds
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Default maximum size of a fetched list in bytes (8 MiB)
pub const DEFAULT_FETCH_MAX_BYTES: usize = 8 * 1024 * 1024;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Comment marker for plain-text lists
pub const PLAIN_COMMENT_MARKER: char = '#';

/// CSV `severity` value that denotes a full block
pub const CSV_SEVERITY_SUSPEND: &str = "suspend";
