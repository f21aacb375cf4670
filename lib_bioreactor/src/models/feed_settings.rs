//! # Feed Settings
//!
//! Chemical composition and default volumes of the control and experimental
//! feeds. Settings arriving as JSON are checked against the schema before they
//! are accepted: both top-level feeds must be present, numeric fields must be
//! non-negative, volumes and component fractions lie in [0, 1], and the
//! component fractions of one feed may not exceed the whole.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ConfigError;
use crate::models::feed::FeedType;

const FRACTION_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FeedComposition {
    /// g/L
    #[serde(default)]
    pub glucose_concentration: f64,
    /// Total organic carbon, g/L
    #[serde(default)]
    pub toc_concentration: f64,
    /// Mass fraction of each named component.
    #[serde(default)]
    pub components: BTreeMap<String, f64>,
    /// Litres added per feed when no volume is given.
    #[serde(default)]
    pub default_volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FeedSettings {
    pub control_feed: FeedComposition,
    pub experimental_feed: FeedComposition,
}

impl FeedSettings {
    /// Parses and validates settings from an untyped JSON document.
    pub fn from_json(value: &Value) -> Result<Self, ConfigError> {
        let object = value
            .as_object()
            .ok_or_else(|| ConfigError::Parse("feed settings must be a JSON object".to_string()))?;
        for key in ["control_feed", "experimental_feed"] {
            if !object.contains_key(key) {
                return Err(ConfigError::MissingKey(key.to_string()));
            }
        }
        let settings: FeedSettings =
            serde_json::from_value(value.clone()).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_composition("control_feed", &self.control_feed)?;
        validate_composition("experimental_feed", &self.experimental_feed)
    }

    pub fn composition(&self, feed_type: FeedType) -> &FeedComposition {
        match feed_type {
            FeedType::Control => &self.control_feed,
            FeedType::Experimental => &self.experimental_feed,
        }
    }
}

fn validate_composition(prefix: &str, feed: &FeedComposition) -> Result<(), ConfigError> {
    non_negative(&format!("{}.glucose_concentration", prefix), feed.glucose_concentration)?;
    non_negative(&format!("{}.toc_concentration", prefix), feed.toc_concentration)?;
    unit_interval(&format!("{}.default_volume", prefix), feed.default_volume)?;

    let mut total = 0.0;
    for (name, fraction) in &feed.components {
        unit_interval(&format!("{}.components.{}", prefix, name), *fraction)?;
        total += fraction;
    }
    if total > 1.0 + FRACTION_TOLERANCE {
        return Err(ConfigError::out_of_range(
            format!("{}.components", prefix),
            format!("fractions sum to {:.4}, more than the whole feed", total),
        ));
    }
    Ok(())
}

fn non_negative(key: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::out_of_range(key, format!("{} must be a non-negative number", value)));
    }
    Ok(())
}

fn unit_interval(key: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::out_of_range(key, format!("{} must lie within [0, 1]", value)));
    }
    Ok(())
}
