//! # Data Model
//!
//! Plain data shared by every pipeline component: the raw telemetry frame,
//! the derived metrics record, feed events and feed settings, and the
//! connection state of the transport.

use serde::{Deserialize, Serialize};

/// Raw sensor snapshots and their validation.
pub mod raw_frame;
/// The derived metrics record.
pub mod metrics;
/// Feed events, feed types and volume bounds.
pub mod feed;
/// Feed composition settings and schema validation.
pub mod feed_settings;

pub use feed::{FeedEvent, FeedParameters, FeedSource, FeedType, VolumeBounds};
pub use feed_settings::{FeedComposition, FeedSettings};
pub use metrics::DerivedMetrics;
pub use raw_frame::{FlowReading, PumpTelemetry, RawFrame, SensorSnapshot};

/// Lifecycle of the one logical connection owned by a transport manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection attempted yet.
    Idle,
    Connecting,
    Connected,
    /// Lost or failed; a retry may be scheduled.
    Disconnected,
    /// Explicitly shut down. Terminal.
    Closed,
}
