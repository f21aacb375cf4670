//! # lib_bioreactor
//!
//! Real-time metrics pipeline for bioreactor experiments. Raw sensor frames
//! arrive over a WebSocket transport, are turned into derived metrics and feed
//! events by a stateful engine, then published in-process and persisted.
//!
//! Module groups are gated by Cargo features (`configs`, `loggers`,
//! `connections`, `analysis`, `core`; `full` enables all). The data model and
//! error types are always compiled.

#![forbid(unsafe_code)]

/// Error taxonomy shared by every component.
pub mod errors;
/// Raw frames, derived metrics, feed events and feed settings.
pub mod models;

/// Pipeline configuration and process-wide feed settings.
#[cfg(feature = "configs")]
pub mod configs;

/// Console and file logging setup.
#[cfg(feature = "loggers")]
pub mod loggers;

/// Upstream and local stores.
#[cfg(feature = "connections")]
pub mod connections;

/// Metric derivation, feed detection and feed statistics.
#[cfg(feature = "analysis")]
pub mod analysis;

/// Dispatcher, transport manager and the metrics pipeline.
#[cfg(feature = "core")]
pub mod core;

pub use errors::{ConfigError, DerivationError, FeedEventError, PersistenceError, TransportError};
pub use models::{ConnectionState, DerivedMetrics, FeedEvent, FeedSettings, FeedType, RawFrame};
