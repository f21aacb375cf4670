//! # Error Taxonomy
//!
//! One error enum per pipeline component. Every component boundary converts its
//! internal failures into one of these values; nothing crosses a boundary as a
//! panic.
//!
//! - [`TransportError`]: connect failures, malformed frames, dispatch overflow.
//!   Recovered locally (backoff, drop-and-log).
//! - [`DerivationError`]: invalid samples and non-finite results. Recovered by
//!   rejecting the single frame.
//! - [`PersistenceError`]: query and write failures. Fatal only for the
//!   mandatory startup connection.
//! - [`ConfigError`]: schema violations and out-of-range parameters. Fatal at
//!   load time.
//! - [`FeedEventError`]: a feed event that cannot be created.

use thiserror::Error;

/// Failures of the live telemetry connection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Invalid endpoint '{0}': {1}")]
    InvalidEndpoint(String, String),

    #[error("Malformed frame discarded: {0}")]
    MalformedFrame(String),

    #[error("Subscriber '{subscriber}' lagged, {dropped} oldest items dropped")]
    DispatchOverflow { subscriber: String, dropped: u64 },

    #[error("Transport manager is closed")]
    Closed,
}

/// Failures of the metric derivation engine. Each one rejects exactly one frame.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DerivationError {
    #[error("Invalid sample at {timestamp}: {reason}")]
    InvalidSample { timestamp: String, reason: String },

    #[error("Out-of-order frame at {timestamp} (last accepted {last})")]
    OutOfOrder { timestamp: String, last: String },

    #[error("Non-finite result computing {0}")]
    NonFinite(&'static str),
}

/// Failures of the upstream or local store.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("Failed to connect to database: {0}")]
    ConnectionError(String),

    #[error("Upstream process store is unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Query execution failed: {0}")]
    QueryError(String),

    #[error("Write failed: {0}")]
    WriteError(String),

    #[error("Invalid timestamp '{0}': expected ISO-8601")]
    InvalidTimestamp(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Configuration and schema violations. Never silently corrected.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("I/O error reading '{0}': {1}")]
    Io(String, String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Missing required key '{0}'")]
    MissingKey(String),

    #[error("Invalid value for '{key}': {reason}")]
    OutOfRange { key: String, reason: String },
}

impl ConfigError {
    /// Shorthand for an [`ConfigError::OutOfRange`] violation.
    pub fn out_of_range(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::OutOfRange {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Feed events are rejected at creation rather than clamped.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FeedEventError {
    #[error("Feed volume {volume} L outside configured range [{min}, {max}]")]
    VolumeOutOfRange { volume: f64, min: f64, max: f64 },

    #[error("Unknown feed type: {0}")]
    UnknownFeedType(String),

    #[error("Unknown feed source: {0}")]
    UnknownFeedSource(String),
}
