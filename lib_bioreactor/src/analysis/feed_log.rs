//! # Feed Log
//!
//! Append-only, in-memory log of the feed events seen during this run, both
//! detected and entered by an operator. Manual entries are validated here: the
//! feed type must be known and the volume (or the feed's configured default
//! volume when none is given) must lie within the volume bounds.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::analysis::feed_stats::FeedStatistics;
use crate::configs::SharedFeedSettings;
use crate::errors::FeedEventError;
use crate::models::{FeedEvent, FeedSource, FeedType, VolumeBounds};

/// Operator request to record a feed.
#[derive(Debug, Clone, Deserialize)]
pub struct ManualFeedEntry {
    pub feed_type: String,
    /// Litres. Falls back to the feed's default volume.
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    /// Defaults to the time of entry.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

pub struct FeedLog {
    bounds: VolumeBounds,
    settings: SharedFeedSettings,
    events: Vec<FeedEvent>,
}

impl FeedLog {
    pub fn new(bounds: VolumeBounds, settings: SharedFeedSettings) -> Self {
        Self {
            bounds,
            settings,
            events: Vec::new(),
        }
    }

    /// Seeds the log with events persisted by an earlier run.
    pub fn with_history(mut self, mut history: Vec<FeedEvent>) -> Self {
        history.sort_by_key(|e| e.timestamp);
        self.events = history;
        self
    }

    pub fn append(&mut self, event: FeedEvent) {
        self.events.push(event);
    }

    /// Validates an operator entry, appends and returns the resulting event.
    pub fn record_manual(&mut self, entry: ManualFeedEntry, now: DateTime<Utc>) -> Result<FeedEvent, FeedEventError> {
        let feed_type: FeedType = entry.feed_type.parse()?;
        let volume = match entry.volume {
            Some(v) => v,
            None => self.settings.get().composition(feed_type).default_volume,
        };
        let mut event = FeedEvent::new(
            entry.timestamp.unwrap_or(now),
            feed_type,
            volume,
            FeedSource::Manual,
            &self.bounds,
        )?;
        if let Some(operator) = entry.operator.filter(|o| !o.trim().is_empty()) {
            event = event.with_operator(operator);
        }
        if let Some(note) = entry.note.filter(|n| !n.trim().is_empty()) {
            event = event.with_note(note);
        }
        log::info!("Recorded manual {} feed of {:.3} L", feed_type, volume);
        self.events.push(event.clone());
        Ok(event)
    }

    /// Events not older than `hours` before `now`. A span reaching past the
    /// earliest representable time returns every event.
    pub fn recent(&self, hours: f64, now: DateTime<Utc>) -> Vec<FeedEvent> {
        let millis = (hours.max(0.0) * 3_600_000.0).round() as i64;
        let cutoff = Duration::try_milliseconds(millis).and_then(|span| now.checked_sub_signed(span));
        self.events
            .iter()
            .filter(|e| cutoff.map_or(true, |cutoff| e.timestamp >= cutoff))
            .cloned()
            .collect()
    }

    pub fn statistics(&self) -> FeedStatistics {
        FeedStatistics::from_events(&self.events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FeedSettings;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn entry(feed_type: &str, volume: Option<f64>) -> ManualFeedEntry {
        ManualFeedEntry {
            feed_type: feed_type.to_string(),
            volume,
            operator: Some("jd".to_string()),
            note: Some("  ".to_string()),
            timestamp: None,
        }
    }

    fn feed_log() -> FeedLog {
        let mut settings = FeedSettings::default();
        settings.experimental_feed.default_volume = 0.25;
        let shared = SharedFeedSettings::new(settings).unwrap();
        FeedLog::new(VolumeBounds::default(), shared)
    }

    #[test]
    fn manual_entry_is_validated() {
        let mut log = feed_log();
        let event = log.record_manual(entry("Control", Some(0.1)), now()).unwrap();
        assert_eq!(event.feed_type, FeedType::Control);
        assert_eq!(event.source, FeedSource::Manual);
        assert_eq!(event.operator.as_deref(), Some("jd"));
        assert_eq!(event.note, None);
        assert_eq!(event.timestamp, now());

        assert!(matches!(
            log.record_manual(entry("glucose", Some(0.1)), now()),
            Err(FeedEventError::UnknownFeedType(_))
        ));
        assert!(matches!(
            log.record_manual(entry("control", Some(5.0)), now()),
            Err(FeedEventError::VolumeOutOfRange { .. })
        ));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn missing_volume_uses_feed_default() {
        let mut log = feed_log();
        let event = log.record_manual(entry("experimental", None), now()).unwrap();
        assert_eq!(event.volume, 0.25);
        // Control default is 0 L, below the minimum volume.
        assert!(log.record_manual(entry("control", None), now()).is_err());
    }

    #[test]
    fn recent_filters_by_age() {
        let mut log = feed_log();
        let mut old = entry("control", Some(0.1));
        old.timestamp = Some(now() - Duration::hours(3));
        log.record_manual(old, now()).unwrap();
        log.record_manual(entry("control", Some(0.2)), now()).unwrap();

        assert_eq!(log.recent(1.0, now()).len(), 1);
        assert_eq!(log.recent(4.0, now()).len(), 2);
        assert_eq!(log.statistics().feed_events_count, 2);
    }

    #[test]
    fn recent_tolerates_extreme_spans() {
        let mut log = feed_log();
        let mut old = entry("control", Some(0.1));
        old.timestamp = Some(now() - Duration::days(3650));
        log.record_manual(old, now()).unwrap();
        log.record_manual(entry("control", Some(0.2)), now()).unwrap();

        assert_eq!(log.recent(f64::MAX, now()).len(), 2);
        assert_eq!(log.recent(1e15, now()).len(), 2);
        assert_eq!(log.recent(-5.0, now()).len(), 1);
        assert_eq!(log.recent(f64::NAN, now()).len(), 1);
    }
}
