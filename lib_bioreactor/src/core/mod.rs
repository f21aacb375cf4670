//! # Core Engine Module
//!
//! The moving parts of the live pipeline:
//!
//! - **`dispatcher`**: generic fan-out with a bounded, drop-oldest queue per
//!   subscriber. Used for raw frames and as the publication bus.
//! - **`transport`**: the WebSocket connection to the telemetry source, with
//!   backoff, an inactivity watchdog and an explicit connection state machine.
//! - **`pipeline`**: drives the metric engine and feed detector from transport
//!   events, persists results and publishes them.

pub mod dispatcher;
pub mod pipeline;
pub mod transport;

pub use dispatcher::{Delivery, Dispatcher, Subscription, SubscriptionHandle};
pub use pipeline::{LatestMetrics, MetricsPipeline, PipelineEvent, PipelineHandle, PipelineStats};
pub use transport::{TransportEvent, TransportManager};
