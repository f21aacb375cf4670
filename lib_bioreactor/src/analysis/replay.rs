//! Re-derives metrics over a historical range of raw frames with a fresh
//! engine, so exported series match what the live pipeline would have produced.

use serde::Serialize;

use crate::analysis::derivation::MetricEngine;
use crate::analysis::feed_detection::FeedDetector;
use crate::configs::PipelineConfig;
use crate::models::{DerivedMetrics, FeedEvent, RawFrame};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplaySeries {
    pub metrics: Vec<DerivedMetrics>,
    pub feed_events: Vec<FeedEvent>,
    /// Frames the engine refused (invalid or out of order).
    pub rejected: usize,
}

pub fn derive_series(frames: &[RawFrame], config: &PipelineConfig) -> ReplaySeries {
    let mut engine = MetricEngine::new(config.analysis.clone());
    let mut detector = FeedDetector::new(config.feed_detection.clone(), config.feed_volume);
    let mut series = ReplaySeries {
        metrics: Vec::with_capacity(frames.len()),
        ..Default::default()
    };

    for frame in frames {
        match engine.process(frame) {
            Ok(metrics) => series.metrics.push(metrics),
            Err(e) => {
                log::debug!("Replay skipped frame: {}", e);
                series.rejected += 1;
                continue;
            }
        }
        // process() succeeded, so the frame validates.
        if let Ok(snapshot) = frame.validate() {
            match detector.observe(&snapshot) {
                Ok(Some(event)) => series.feed_events.push(event),
                Ok(None) => {}
                Err(e) => log::debug!("Replay dropped feed detection: {}", e),
            }
        }
    }
    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn replay_matches_frame_count_minus_rejections() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let mut frames: Vec<RawFrame> = (0..120)
            .map(|s| {
                let bottle = if s < 100 { 1.0 } else { 0.9 };
                RawFrame::new(start + Duration::seconds(s))
                    .with_do(800.0, 30.0)
                    .with_ph(7.0, 30.0)
                    .with_weights(2.0, bottle, 1.0)
            })
            .collect();
        frames[10].ph = None;

        let series = derive_series(&frames, &PipelineConfig::default());
        assert_eq!(series.rejected, 1);
        assert_eq!(series.metrics.len(), 119);
        assert_eq!(series.feed_events.len(), 1);
        assert!(series
            .metrics
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp));
    }
}
