//! Typed error hierarchy for the middleware core.
//!
//! Errors that are part of normal command outcomes (timeout, not connected) are
//! surfaced to callers through callbacks and events, not through `Result`. The
//! types here are for conditions that prevent a component from running at all:
//! bad configuration, socket setup failure, or a misuse of the public API.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("local port {0} is already in use or could not be bound")]
    Bind(u16, #[source] std::io::Error),

    #[error("socket io error")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("command queue is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
