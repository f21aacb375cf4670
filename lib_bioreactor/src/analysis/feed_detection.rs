//! # Feed Detection
//!
//! Detects feed additions from the balance readings. For each feed bottle the
//! weight change over the configured time window is measured; changes within
//! the noise filter count as zero, and a change beyond the weight threshold
//! raises one [`FeedEvent`] for the bottle that moved. A per-bottle latch keeps
//! the same step from firing again until the delta has settled back inside the
//! noise band.

use chrono::Duration;

use crate::analysis::window::{span_seconds, SampleWindow};
use crate::configs::FeedDetectionConfig;
use crate::errors::FeedEventError;
use crate::models::{FeedEvent, FeedSource, FeedType, SensorSnapshot, VolumeBounds};

/// Absorbs float error when comparing deltas against the configured limits.
const WEIGHT_EPSILON_KG: f64 = 1e-9;

#[derive(Debug)]
struct BottleChannel {
    feed_type: FeedType,
    window: SampleWindow<f64>,
    latched: bool,
}

impl BottleChannel {
    fn new(feed_type: FeedType, span: Duration) -> Self {
        Self {
            feed_type,
            window: SampleWindow::new(span),
            latched: false,
        }
    }
}

pub struct FeedDetector {
    config: FeedDetectionConfig,
    bounds: VolumeBounds,
    control: BottleChannel,
    experimental: BottleChannel,
    reactor: SampleWindow<f64>,
}

impl FeedDetector {
    pub fn new(config: FeedDetectionConfig, bounds: VolumeBounds) -> Self {
        let span = span_seconds(config.time_window_seconds);
        Self {
            control: BottleChannel::new(FeedType::Control, span),
            experimental: BottleChannel::new(FeedType::Experimental, span),
            reactor: SampleWindow::new(span),
            config,
            bounds,
        }
    }

    /// Zeroes deltas inside the noise band.
    pub fn filter_noise(&self, delta_kg: f64) -> f64 {
        if delta_kg.abs() <= self.config.noise_filter_kg + WEIGHT_EPSILON_KG {
            0.0
        } else {
            delta_kg
        }
    }

    pub fn bounds(&self) -> VolumeBounds {
        self.bounds
    }

    pub fn is_latched(&self, feed_type: FeedType) -> bool {
        match feed_type {
            FeedType::Control => self.control.latched,
            FeedType::Experimental => self.experimental.latched,
        }
    }

    /// Feeds one validated snapshot. Returns the detected event, if any.
    ///
    /// A detected volume outside the configured bounds is an error and the
    /// event is not created; the latch is still set so the same step is not
    /// reported again.
    pub fn observe(&mut self, snap: &SensorSnapshot) -> Result<Option<FeedEvent>, FeedEventError> {
        let ts = snap.timestamp;
        if !self.control.window.push(ts, snap.control_bottle_weight)
            || !self.experimental.window.push(ts, snap.experimental_bottle_weight)
            || !self.reactor.push(ts, snap.reactor_weight)
        {
            log::debug!("Feed detector ignored out-of-order snapshot at {}", ts);
            return Ok(None);
        }

        let control_delta = self.filter_noise(window_delta(&self.control.window));
        let experimental_delta = self.filter_noise(window_delta(&self.experimental.window));
        let reactor_delta = window_delta(&self.reactor);

        let threshold = self.config.weight_threshold_kg + WEIGHT_EPSILON_KG;
        let mut candidate: Option<(FeedType, f64)> = None;
        for (channel, delta) in [
            (&mut self.control, control_delta),
            (&mut self.experimental, experimental_delta),
        ] {
            if delta == 0.0 {
                if channel.latched {
                    log::debug!("{} bottle settled, feed latch released", channel.feed_type);
                }
                channel.latched = false;
                continue;
            }
            if channel.latched || delta.abs() <= threshold {
                continue;
            }
            channel.latched = true;
            if candidate.map_or(true, |(_, best)| delta.abs() > best.abs()) {
                candidate = Some((channel.feed_type, delta));
            }
        }

        let Some((feed_type, delta)) = candidate else {
            return Ok(None);
        };

        let volume = delta.abs();
        let event = FeedEvent::new(ts, feed_type, volume, FeedSource::Detected, &self.bounds)?
            .with_note(format!(
                "bottle delta {:+.3} kg, reactor delta {:+.3} kg over {}s",
                delta, reactor_delta, self.config.time_window_seconds
            ));
        log::info!("{} feed of {:.3} L detected at {}", feed_type, volume, ts);
        Ok(Some(event))
    }
}

/// Newest minus oldest value in the window.
fn window_delta(window: &SampleWindow<f64>) -> f64 {
    match (window.oldest(), window.latest()) {
        (Some((_, first)), Some((_, last))) => last - first,
        _ => 0.0,
    }
}
