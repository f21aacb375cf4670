//! # Feed Events
//!
//! Discrete nutrient additions, either detected from balance readings or
//! entered by an operator. A [`FeedEvent`] can only be built through
//! [`FeedEvent::new`], which enforces the configured volume range, and is never
//! mutated afterwards.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::FeedEventError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedType {
    Control,
    Experimental,
}

impl FeedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedType::Control => "control",
            FeedType::Experimental => "experimental",
        }
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedType {
    type Err = FeedEventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "control" => Ok(FeedType::Control),
            "experimental" => Ok(FeedType::Experimental),
            other => Err(FeedEventError::UnknownFeedType(other.to_string())),
        }
    }
}

/// How the event entered the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedSource {
    Detected,
    Manual,
}

impl FeedSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedSource::Detected => "detected",
            FeedSource::Manual => "manual",
        }
    }
}

impl FromStr for FeedSource {
    type Err = FeedEventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detected" => Ok(FeedSource::Detected),
            "manual" => Ok(FeedSource::Manual),
            other => Err(FeedEventError::UnknownFeedSource(other.to_string())),
        }
    }
}

/// Accepted feed volume range in litres, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeBounds {
    pub min_volume_l: f64,
    pub max_volume_l: f64,
}

impl Default for VolumeBounds {
    fn default() -> Self {
        Self {
            min_volume_l: 0.001,
            max_volume_l: 2.0,
        }
    }
}

impl VolumeBounds {
    pub fn contains(&self, volume: f64) -> bool {
        volume.is_finite() && volume >= self.min_volume_l && volume <= self.max_volume_l
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub feed_type: FeedType,
    /// Litres.
    pub volume: f64,
    pub source: FeedSource,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl FeedEvent {
    /// Creates an event with a fresh id, rejecting volumes outside `bounds`.
    pub fn new(
        timestamp: DateTime<Utc>,
        feed_type: FeedType,
        volume: f64,
        source: FeedSource,
        bounds: &VolumeBounds,
    ) -> Result<Self, FeedEventError> {
        if !bounds.contains(volume) {
            return Err(FeedEventError::VolumeOutOfRange {
                volume,
                min: bounds.min_volume_l,
                max: bounds.max_volume_l,
            });
        }
        Ok(Self {
            id: Uuid::new_v4(),
            timestamp,
            feed_type,
            volume,
            source,
            operator: None,
            note: None,
        })
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Feed composition parameters recorded by an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedParameters {
    pub feed_type: FeedType,
    pub toc_value: Option<f64>,
    pub glucose_concentration: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_outside_bounds_is_rejected() {
        let bounds = VolumeBounds { min_volume_l: 0.01, max_volume_l: 0.5 };
        let now = Utc::now();

        assert!(FeedEvent::new(now, FeedType::Control, 0.1, FeedSource::Manual, &bounds).is_ok());
        assert!(FeedEvent::new(now, FeedType::Control, 0.01, FeedSource::Manual, &bounds).is_ok());
        assert!(FeedEvent::new(now, FeedType::Control, 0.5, FeedSource::Manual, &bounds).is_ok());

        let err = FeedEvent::new(now, FeedType::Control, 0.6, FeedSource::Manual, &bounds).unwrap_err();
        assert_eq!(err, FeedEventError::VolumeOutOfRange { volume: 0.6, min: 0.01, max: 0.5 });
        assert!(FeedEvent::new(now, FeedType::Experimental, 0.001, FeedSource::Detected, &bounds).is_err());
        assert!(FeedEvent::new(now, FeedType::Experimental, f64::NAN, FeedSource::Detected, &bounds).is_err());
    }

    #[test]
    fn feed_type_parses_case_insensitively() {
        assert_eq!("Control".parse::<FeedType>().unwrap(), FeedType::Control);
        assert_eq!(" experimental ".parse::<FeedType>().unwrap(), FeedType::Experimental);
        assert!("glucose".parse::<FeedType>().is_err());
    }

    #[test]
    fn unknown_source_is_its_own_error() {
        assert_eq!("manual".parse::<FeedSource>().unwrap(), FeedSource::Manual);
        assert_eq!(
            "scale".parse::<FeedSource>().unwrap_err(),
            FeedEventError::UnknownFeedSource("scale".to_string())
        );
    }
}
