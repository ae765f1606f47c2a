use std::fmt;
use std::io;
use std::path::PathBuf;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::store::ContentHash;

/// Coarse classification surfaced in events and run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Connection failures, timeouts and 5xx responses. Retryable.
    Network,
    /// 4xx and other non-success responses. Not retryable.
    Client,
    /// Content that does not match the expected structure.
    Parse,
    /// Persistence failure. Fatal to a run.
    Store,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Client => "client",
            Self::Parse => "parse",
            Self::Store => "store",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("connection to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("{url} answered with server error {status}")]
    Server { url: String, status: StatusCode },
    #[error("{url} answered with client error {status}")]
    Client { url: String, status: StatusCode },
    #[error("{url} answered with unexpected status {status}")]
    Status { url: String, status: StatusCode },
    #[error("couldn't read body of {url}: {reason}")]
    Body { url: String, reason: String },
    #[error("invalid url {url}: {reason}")]
    Url { url: String, reason: String },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect { .. } | Self::Timeout { .. } | Self::Server { .. } => ErrorKind::Network,
            Self::Client { .. } | Self::Status { .. } | Self::Body { .. } | Self::Url { .. } => {
                ErrorKind::Client
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Network
    }

    pub(crate) fn from_reqwest(url: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else if e.is_decode() {
            Self::Body {
                url: url.to_string(),
                reason: e.to_string(),
            }
        } else {
            Self::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

/// Content did not match the expected structure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} (at {locator})")]
pub struct ParseError {
    pub reason: String,
    pub locator: String,
}

impl ParseError {
    pub fn new(reason: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            locator: locator.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("couldn't (de)serialize {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("record {record_id} references payload {hash} which is not stored")]
    DanglingPayload { record_id: String, hash: ContentHash },
}

#[derive(Debug, thiserror::Error)]
pub enum ListingError {
    #[error("couldn't fetch listing page: {0}")]
    Fetch(#[from] FetchError),
    #[error("couldn't parse listing page {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: ParseError,
    },
    #[error("listing fetch cancelled")]
    Cancelled,
}

impl ListingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(e) => e.kind(),
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Cancelled => ErrorKind::Network,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration: {field} {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

/// Failure to set up a pipeline, before any run starts.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("couldn't open data directory: {0}")]
    Store(#[from] StoreError),
    #[error("couldn't build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}
