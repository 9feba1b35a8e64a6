//! HTTP retrieval of remote permission lists.
//!
//! The fetcher only moves bytes: it never looks at the content. Every
//! request is bounded by a timeout and every response by a size limit, which
//! in turn bounds the parse and merge work done on it.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

use permsync_shared::constants::APP_NAME;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("remote answered HTTP {0}")]
    Status(u16),

    #[error("response exceeds the {limit} byte limit")]
    TooLarge { limit: usize },

    #[error("HTTP client setup failed: {0}")]
    Setup(String),
}

/// Basic-auth credentials for a list. Only exists when both halves do.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    /// `None` unless both `username` and `password` are present and
    /// non-empty.
    pub fn from_pair(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        match (username, password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(Self {
                username: u.to_string(),
                password: p.to_string(),
            }),
            _ => None,
        }
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything needed to fetch one list.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub uri: String,
    pub auth: Option<BasicAuth>,
    /// Validators from the last merged response.
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedList {
    pub body: Bytes,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched(FetchedList),
    /// `304 Not Modified`: the list is unchanged since the validators were
    /// recorded.
    NotModified,
}

/// Bounded HTTP GET client for permission lists.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    max_bytes: usize,
}

impl Fetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("{APP_NAME}/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Setup(e.to_string()))?;

        Ok(Self { client, max_bytes })
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub async fn fetch(&self, req: &FetchRequest) -> Result<FetchOutcome, FetchError> {
        let mut builder = self.client.get(&req.uri);

        if let Some(auth) = &req.auth {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        }
        if let Some(etag) = &req.etag {
            builder = builder.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &req.last_modified {
            builder = builder.header(IF_MODIFIED_SINCE, last_modified);
        }

        let mut resp = builder.send().await.map_err(map_reqwest)?;
        let status = resp.status();

        if status == StatusCode::NOT_MODIFIED {
            debug!(uri = %req.uri, "List not modified");
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if let Some(len) = resp.content_length() {
            if len > self.max_bytes as u64 {
                return Err(FetchError::TooLarge {
                    limit: self.max_bytes,
                });
            }
        }

        let header = |name: HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);

        // Content-Length can be absent or wrong; count what actually arrives.
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(map_reqwest)? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(FetchError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        debug!(uri = %req.uri, size = body.len(), "Fetched list");

        Ok(FetchOutcome::Fetched(FetchedList {
            body: Bytes::from(body),
            etag,
            last_modified,
        }))
    }
}

fn map_reqwest(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(e.to_string())
    }
}
