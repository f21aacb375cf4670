use serde::{Deserialize, Serialize};

use crate::errors::DerivationError;
use crate::models::{FeedEvent, FeedSettings, FeedType};

/// g/mol
pub const GLUCOSE_MOLAR_MASS: f64 = 180.156;
pub const CARBONS_PER_GLUCOSE: f64 = 6.0;
/// g/mol
pub const CARBON_MOLAR_MASS: f64 = 12.01;

/// Aggregate view over a set of feed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FeedStatistics {
    pub total_control_volume: f64,
    pub total_experimental_volume: f64,
    pub feed_events_count: usize,
    /// Mean spacing between consecutive events in seconds, 0 with fewer than two.
    pub average_interval_seconds: f64,
}

impl FeedStatistics {
    pub fn from_events(events: &[FeedEvent]) -> Self {
        let mut stats = FeedStatistics {
            feed_events_count: events.len(),
            ..Default::default()
        };
        for event in events {
            match event.feed_type {
                FeedType::Control => stats.total_control_volume += event.volume,
                FeedType::Experimental => stats.total_experimental_volume += event.volume,
            }
        }

        if events.len() > 1 {
            let mut stamps: Vec<_> = events.iter().map(|e| e.timestamp).collect();
            stamps.sort();
            let total: f64 = stamps
                .windows(2)
                .map(|pair| (pair[1] - pair[0]).num_milliseconds() as f64 / 1000.0)
                .sum();
            stats.average_interval_seconds = total / (stamps.len() - 1) as f64;
        }
        stats
    }
}

/// Moles of carbon delivered by one feed.
///
/// Control feed carbon comes from its glucose (6 C per molecule), experimental
/// feed carbon from its total organic carbon.
pub fn carbon_mol(event: &FeedEvent, settings: &FeedSettings) -> f64 {
    let composition = settings.composition(event.feed_type);
    match event.feed_type {
        FeedType::Control => {
            event.volume * composition.glucose_concentration / GLUCOSE_MOLAR_MASS * CARBONS_PER_GLUCOSE
        }
        FeedType::Experimental => event.volume * composition.toc_concentration / CARBON_MOLAR_MASS,
    }
}

/// Molar carbon to oxygen ratio of a feed. Zero when no oxygen was consumed.
pub fn carbon_oxygen_ratio(
    event: &FeedEvent,
    settings: &FeedSettings,
    oxygen_consumed_mol: f64,
) -> Result<f64, DerivationError> {
    if oxygen_consumed_mol <= 0.0 {
        return Ok(0.0);
    }
    let ratio = carbon_mol(event, settings) / oxygen_consumed_mol;
    if !ratio.is_finite() {
        return Err(DerivationError::NonFinite("carbon_oxygen_ratio"));
    }
    Ok(ratio)
}
