//! # Analysis
//!
//! Everything that turns raw frames into science: the sliding sample window,
//! the metric derivation engine, weight-delta feed detection, feed statistics,
//! the manual feed log and historical replay.

/// Time-bounded sliding sample window.
pub mod window;
/// DO saturation, drop rate, recovery time, OUR and sOUR.
pub mod derivation;
/// Feed event detection from balance readings.
pub mod feed_detection;
/// Feed totals, intervals and carbon to oxygen ratio.
pub mod feed_stats;
/// In-memory append-only feed log with manual entry.
pub mod feed_log;
/// Re-derivation of historical ranges.
pub mod replay;

pub use derivation::{DropPhase, MetricEngine};
pub use feed_detection::FeedDetector;
pub use feed_log::{FeedLog, ManualFeedEntry};
pub use feed_stats::FeedStatistics;
pub use replay::{derive_series, ReplaySeries};
pub use window::SampleWindow;
