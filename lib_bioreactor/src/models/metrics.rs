use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metrics derived from one raw frame plus the rolling analysis window.
///
/// `timestamp` is always the capture timestamp of the triggering frame.
/// `drop_rate`, `our` and `sour` are only present on the frames where a drop
/// window is closed; `recovery_time` only on the frame where DO crosses back
/// over the recovery threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub timestamp: DateTime<Utc>,
    /// DO as a percentage of the configured maximum, clamped to [0, 100].
    pub do_saturation: f64,
    /// The raw saturation fell outside [0, 100] and was clamped.
    pub saturation_clamped: bool,
    /// DO decrease per second over the closed drop window, non-negative.
    pub drop_rate: Option<f64>,
    /// Seconds from drop start to the recovery crossing.
    pub recovery_time: Option<f64>,
    /// A drop has been detected and DO has not recovered yet.
    pub recovery_pending: bool,
    /// Oxygen uptake rate.
    pub our: Option<f64>,
    /// Biomass-specific oxygen uptake rate.
    pub sour: Option<f64>,
    pub ph: f64,
    /// DO sensor temperature.
    pub temperature: f64,
    /// The analysis window has filled at least once.
    pub window_ready: bool,
}
