//! Error types for the collaborators and configuration
//!
//! The core never bubbles these up past a task boundary: query and store
//! errors are logged and the tick is skipped, sink errors drive reconnect
//! coordination. Only [`ConfigError`] and bootstrap [`SinkError`]s end the
//! process.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while counting hits for a rule
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("search request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("search returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("search did not finish within {0:?}")]
    Timeout(Duration),

    #[error("search returned a negative hit count ({0})")]
    NegativeCount(i64),
}

/// Errors raised while fetching saved searches from a rule store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("saved-search request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("saved-search store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("saved-search fetch did not finish within {0:?}")]
    Timeout(Duration),

    #[error("malformed saved-search payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors on the sink transport
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connecting to {endpoint} did not finish within {timeout:?}")]
    DialTimeout { endpoint: String, timeout: Duration },

    #[error("health probe was not acknowledged within {0:?}")]
    ProbeTimeout(Duration),

    #[error("write did not finish within {0:?}")]
    WriteTimeout(Duration),

    #[error("sink closed the connection")]
    Closed,

    #[error("sink is reconnecting, sample dropped")]
    NotReady,

    #[error("sink supervisor is not running")]
    SupervisorGone,

    #[error("could not connect to sink after {attempts} attempts: {last}")]
    Bootstrap { attempts: u32, last: Box<SinkError> },
}

/// Errors while reading or validating the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("no config file given and none found at the default location")]
    NotFound,

    #[error("invalid duration {0:?} (expected e.g. \"500ms\", \"10s\", \"1m30s\")")]
    Duration(String),

    #[error("{0}")]
    Invalid(String),
}

