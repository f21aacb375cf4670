//! # Pipeline Configuration
//!
//! Every tunable of the pipeline in one serde document, split in sections:
//! `transport`, `analysis`, `feed_detection`, `feed_volume`, `database` and
//! `logging`. Values are layered, lowest first:
//!
//! 1. built-in defaults (the `Default` impls below),
//! 2. an optional JSON file,
//! 3. environment variables `BIOREACTOR_<SECTION>__<KEY>` (nested keys are
//!    joined with `__` as well).
//!
//! The layers are stacked with `more-config`; keys are case-insensitive. Each
//! value is converted using the type of the built-in default at the same path,
//! so `"9100"` becomes a number and `"none"` clears an optional number.
//!
//! The resulting configuration is validated once. Out-of-range values are a
//! [`ConfigError`] and are never corrected.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{ext::*, *};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ConfigError;
use crate::models::VolumeBounds;

/// Prefix of the environment variables that override file values.
pub const ENV_PREFIX: &str = "BIOREACTOR_";
const ENV_SEPARATOR: &str = "__";
const KEY_DELIMITER: &str = ":";

/// Upper bound of every window length, in seconds (one week).
pub const MAX_WINDOW_SECONDS: u64 = 7 * 24 * 3600;
/// Upper bound of every retry delay and timeout, in milliseconds (one day).
pub const MAX_DELAY_MS: u64 = 24 * 3600 * 1000;

/// How the delay between reconnect attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// `base_delay * attempt`.
    Linear,
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay_ms`.
    Exponential { max_delay_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Use `wss://` instead of `ws://`.
    pub secure: bool,
    pub backoff: BackoffPolicy,
    pub base_delay_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Silence on an open connection longer than this counts as a disconnect.
    pub inactivity_timeout_ms: u64,
    /// Per-subscriber queue length before the oldest frames are dropped.
    pub subscriber_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8765,
            path: "/ws".to_string(),
            secure: false,
            backoff: BackoffPolicy::Linear,
            base_delay_ms: 1000,
            max_attempts: Some(5),
            inactivity_timeout_ms: 30_000,
            subscriber_capacity: 256,
        }
    }
}

impl TransportConfig {
    /// `ws[s]://host:port/path`
    pub fn endpoint(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}:{}{}", scheme, self.host, self.port, path)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let millis = match self.backoff {
            BackoffPolicy::Linear => self.base_delay_ms.saturating_mul(attempt as u64),
            BackoffPolicy::Exponential { max_delay_ms } => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor).min(max_delay_ms)
            }
        };
        Duration::from_millis(millis)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::out_of_range("transport.host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(ConfigError::out_of_range("transport.port", "must be non-zero"));
        }
        if self.base_delay_ms == 0 {
            return Err(ConfigError::out_of_range("transport.base_delay_ms", "must be positive"));
        }
        at_most("transport.base_delay_ms", self.base_delay_ms, MAX_DELAY_MS)?;
        if let BackoffPolicy::Exponential { max_delay_ms } = self.backoff {
            at_most("transport.backoff.max_delay_ms", max_delay_ms, MAX_DELAY_MS)?;
            if max_delay_ms < self.base_delay_ms {
                return Err(ConfigError::out_of_range(
                    "transport.backoff.max_delay_ms",
                    format!("{} is below base_delay_ms {}", max_delay_ms, self.base_delay_ms),
                ));
            }
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::out_of_range(
                "transport.max_attempts",
                "must be at least 1, or null for unlimited",
            ));
        }
        if self.inactivity_timeout_ms == 0 {
            return Err(ConfigError::out_of_range("transport.inactivity_timeout_ms", "must be positive"));
        }
        at_most("transport.inactivity_timeout_ms", self.inactivity_timeout_ms, MAX_DELAY_MS)?;
        if self.subscriber_capacity == 0 {
            return Err(ConfigError::out_of_range("transport.subscriber_capacity", "must be positive"));
        }
        Ok(())
    }
}

/// Windows, thresholds and physical constants of the derivation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// History needed before drop and recovery detection starts.
    pub analysis_window_seconds: u64,
    /// Span over which one `drop_rate` value is computed.
    pub stability_window_seconds: u64,
    /// Minimum cumulative DO decrease (ppm) that counts as a drop.
    pub stability_threshold: f64,
    /// Fraction of the pre-drop baseline that counts as recovered.
    pub recovery_threshold: f64,
    /// Consecutive decreasing samples needed to confirm a drop.
    pub drop_confirm_samples: usize,
    /// Volumetric mass-transfer coefficient.
    pub kla: f64,
    pub reactor_volume_l: f64,
    /// g/L, divides OUR into sOUR.
    pub biomass_density: f64,
    /// DO reading that corresponds to 100 % saturation.
    pub max_do_ppm: f64,
    /// Publication bus queue length per subscriber before the oldest events
    /// are dropped.
    pub backlog_capacity: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            analysis_window_seconds: 300,
            stability_window_seconds: 300,
            stability_threshold: 0.1,
            recovery_threshold: 0.95,
            drop_confirm_samples: 3,
            kla: 10.0,
            reactor_volume_l: 1.0,
            biomass_density: 1.0,
            max_do_ppm: 1000.0,
            backlog_capacity: 64,
        }
    }
}

impl AnalysisConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.analysis_window_seconds == 0 {
            return Err(ConfigError::out_of_range("analysis.analysis_window_seconds", "must be positive"));
        }
        if self.stability_window_seconds == 0 {
            return Err(ConfigError::out_of_range("analysis.stability_window_seconds", "must be positive"));
        }
        at_most("analysis.analysis_window_seconds", self.analysis_window_seconds, MAX_WINDOW_SECONDS)?;
        at_most("analysis.stability_window_seconds", self.stability_window_seconds, MAX_WINDOW_SECONDS)?;
        positive("analysis.stability_threshold", self.stability_threshold)?;
        if !(self.recovery_threshold > 0.0 && self.recovery_threshold <= 1.0) {
            return Err(ConfigError::out_of_range(
                "analysis.recovery_threshold",
                format!("{} must lie within (0, 1]", self.recovery_threshold),
            ));
        }
        if self.drop_confirm_samples < 2 {
            return Err(ConfigError::out_of_range("analysis.drop_confirm_samples", "must be at least 2"));
        }
        positive("analysis.kla", self.kla)?;
        positive("analysis.reactor_volume_l", self.reactor_volume_l)?;
        positive("analysis.biomass_density", self.biomass_density)?;
        positive("analysis.max_do_ppm", self.max_do_ppm)?;
        if self.backlog_capacity == 0 {
            return Err(ConfigError::out_of_range("analysis.backlog_capacity", "must be positive"));
        }
        Ok(())
    }
}

/// Balance weight-delta feed detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedDetectionConfig {
    /// A bottle delta must exceed this (kg) to raise an event.
    pub weight_threshold_kg: f64,
    /// Span over which deltas are measured.
    pub time_window_seconds: u64,
    /// Deltas at or below this (kg) are treated as zero.
    pub noise_filter_kg: f64,
}

impl Default for FeedDetectionConfig {
    fn default() -> Self {
        Self {
            weight_threshold_kg: 0.05,
            time_window_seconds: 60,
            noise_filter_kg: 0.02,
        }
    }
}

impl FeedDetectionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        positive("feed_detection.weight_threshold_kg", self.weight_threshold_kg)?;
        if !self.noise_filter_kg.is_finite() || self.noise_filter_kg < 0.0 {
            return Err(ConfigError::out_of_range("feed_detection.noise_filter_kg", "must be non-negative"));
        }
        if self.noise_filter_kg >= self.weight_threshold_kg {
            return Err(ConfigError::out_of_range(
                "feed_detection.noise_filter_kg",
                format!(
                    "{} must be below weight_threshold_kg {}",
                    self.noise_filter_kg, self.weight_threshold_kg
                ),
            ));
        }
        if self.time_window_seconds == 0 {
            return Err(ConfigError::out_of_range("feed_detection.time_window_seconds", "must be positive"));
        }
        at_most("feed_detection.time_window_seconds", self.time_window_seconds, MAX_WINDOW_SECONDS)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL URL of the process-data store. `None` runs local-only.
    pub upstream_url: Option<String>,
    /// Refuse to start when the upstream store cannot be reached.
    pub upstream_required: bool,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub query_timeout_seconds: u64,
    /// SQLite file holding settings, feed events and derived metrics.
    pub local_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            upstream_url: None,
            upstream_required: false,
            max_connections: 5,
            acquire_timeout_seconds: 3,
            query_timeout_seconds: 10,
            local_path: PathBuf::from("bioreactor.db"),
        }
    }
}

impl DatabaseConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream_required && self.upstream_url.is_none() {
            return Err(ConfigError::MissingKey("database.upstream_url".to_string()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::out_of_range("database.max_connections", "must be positive"));
        }
        if self.acquire_timeout_seconds == 0 || self.query_timeout_seconds == 0 {
            return Err(ConfigError::out_of_range("database", "timeouts must be positive"));
        }
        if self.local_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingKey("database.local_path".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    /// trace, debug, info, warn or error. Anything else means info.
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            log_level: "info".to_string(),
        }
    }
}

/// The complete, validated pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub transport: TransportConfig,
    pub analysis: AnalysisConfig,
    pub feed_detection: FeedDetectionConfig,
    pub feed_volume: VolumeBounds,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Defaults, overlaid with `path` (if any), overlaid with the `BIOREACTOR_`
    /// variables found in `vars`, then validated.
    ///
    /// `vars` is usually `std::env::vars()`; tests pass their own list.
    pub fn load<I>(path: Option<&Path>, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let overrides = env_overrides(vars);
        let pairs: Vec<(&str, &str)> = overrides.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let mut builder = DefaultConfigurationBuilder::new();
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::Io(path.display().to_string(), "file not found".to_string()));
            }
            let file = path.to_string_lossy().to_string();
            builder.add_json_file(&file.is().optional());
        }
        builder.add_in_memory(&pairs);
        let root = builder
            .build()
            .map_err(|e| ConfigError::Parse(format!("{:?}", e)))?;

        let mut doc = serde_json::to_value(PipelineConfig::default())
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        bind_node(&*root, "", &mut doc);

        let config: PipelineConfig =
            serde_json::from_value(doc).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON file over the defaults without looking at the environment.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::load(Some(path), std::iter::empty())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate()?;
        self.analysis.validate()?;
        self.feed_detection.validate()?;
        if !(self.feed_volume.min_volume_l.is_finite() && self.feed_volume.min_volume_l >= 0.0) {
            return Err(ConfigError::out_of_range("feed_volume.min_volume_l", "must be non-negative"));
        }
        if !(self.feed_volume.max_volume_l.is_finite()
            && self.feed_volume.max_volume_l >= self.feed_volume.min_volume_l)
        {
            return Err(ConfigError::out_of_range(
                "feed_volume.max_volume_l",
                "must not be below min_volume_l",
            ));
        }
        self.database.validate()
    }
}

fn positive(key: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::out_of_range(key, format!("{} must be a positive number", value)));
    }
    Ok(())
}

fn at_most(key: &str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::out_of_range(key, format!("{} exceeds the maximum of {}", value, max)));
    }
    Ok(())
}

/// `BIOREACTOR_TRANSPORT__PORT` becomes the configuration key `TRANSPORT:PORT`.
fn env_overrides<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter_map(|(name, value)| {
            let rest = name.strip_prefix(ENV_PREFIX)?;
            let parts: Vec<&str> = rest.split(ENV_SEPARATOR).collect();
            if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
                log::debug!("Ignoring environment variable {} (expected {}<SECTION>__<KEY>)", name, ENV_PREFIX);
                return None;
            }
            Some((parts.join(KEY_DELIMITER), value))
        })
        .collect()
}

/// Replaces the leaves of the serialized defaults with the layered values
/// found under the same path. Keys the defaults lack (the fields of a
/// non-default backoff policy) are picked up from the section children.
fn bind_node(root: &dyn ConfigurationRoot, path: &str, node: &mut Value) {
    match node {
        Value::Object(map) => {
            let children = if path.is_empty() {
                root.children()
            } else {
                root.section(path).children()
            };
            for child in children {
                map.entry(child.key().to_lowercase()).or_insert(Value::Null);
            }
            for (key, child) in map.iter_mut() {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}{}{}", path, KEY_DELIMITER, key)
                };
                bind_node(root, &child_path, child);
            }
        }
        leaf => {
            if let Some(raw) = root.get(path) {
                *leaf = typed_value(leaf, raw.as_str());
            }
        }
    }
}

/// Converts a raw configuration string using the default's JSON type as the
/// hint. Anything that does not fit stays a string and fails deserialization.
fn typed_value(hint: &Value, raw: &str) -> Value {
    let trimmed = raw.trim();
    let is_null = trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") || trimmed.eq_ignore_ascii_case("none");
    match hint {
        Value::String(_) => Value::String(raw.to_string()),
        Value::Bool(_) => match trimmed.to_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(raw.to_string()),
        },
        _ if is_null => Value::Null,
        _ => number(trimmed).unwrap_or_else(|| Value::String(raw.to_string())),
    }
}

fn number(raw: &str) -> Option<Value> {
    if let Ok(u) = raw.parse::<u64>() {
        return Some(Value::from(u));
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Some(Value::from(i));
    }
    raw.parse::<f64>().ok().filter(|f| f.is_finite()).map(Value::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn vars(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::load(None, Vec::new()).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.transport.endpoint(), "ws://localhost:8765/ws");
        assert_eq!(config.analysis.kla, 10.0);
        assert_eq!(config.feed_detection.time_window_seconds, 60);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let mut file = fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"transport": {{"host": "reactor-gw", "backoff": {{"kind": "exponential", "max_delay_ms": 30000}}}},
                "analysis": {{"kla": 12.5}}}}"#
        )
        .unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.transport.host, "reactor-gw");
        assert_eq!(config.transport.port, 8765);
        assert_eq!(config.transport.backoff, BackoffPolicy::Exponential { max_delay_ms: 30000 });
        assert_eq!(config.analysis.kla, 12.5);
        assert_eq!(config.analysis.stability_window_seconds, 300);
    }

    #[test]
    fn env_overrides_file_and_parses_types() {
        let config = PipelineConfig::load(
            None,
            vars(&[
                ("BIOREACTOR_TRANSPORT__PORT", "9100"),
                ("BIOREACTOR_TRANSPORT__SECURE", "true"),
                ("BIOREACTOR_TRANSPORT__MAX_ATTEMPTS", "none"),
                ("BIOREACTOR_ANALYSIS__STABILITY_THRESHOLD", "0.25"),
                ("BIOREACTOR_DATABASE__LOCAL_PATH", "/var/lib/bio.db"),
                ("UNRELATED", "1"),
            ]),
        )
        .unwrap();
        assert_eq!(config.transport.port, 9100);
        assert!(config.transport.secure);
        assert_eq!(config.transport.max_attempts, None);
        assert_eq!(config.analysis.stability_threshold, 0.25);
        assert_eq!(config.database.local_path, PathBuf::from("/var/lib/bio.db"));
    }

    #[test]
    fn out_of_range_values_are_fatal() {
        let err = PipelineConfig::load(None, vars(&[("BIOREACTOR_ANALYSIS__RECOVERY_THRESHOLD", "1.5")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { ref key, .. } if key == "analysis.recovery_threshold"));

        let err = PipelineConfig::load(None, vars(&[("BIOREACTOR_FEED_DETECTION__NOISE_FILTER_KG", "0.06")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));

        let err = PipelineConfig::load(None, vars(&[("BIOREACTOR_TRANSPORT__PORT", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = PipelineConfig::load(None, vars(&[("BIOREACTOR_DATABASE__UPSTREAM_REQUIRED", "true")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingKey("database.upstream_url".to_string()));
    }

    #[test]
    fn oversized_windows_and_delays_are_rejected_at_load() {
        let err = PipelineConfig::load(
            None,
            vars(&[("BIOREACTOR_ANALYSIS__ANALYSIS_WINDOW_SECONDS", "10000000000000000")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { ref key, .. } if key == "analysis.analysis_window_seconds"));

        let err = PipelineConfig::load(
            None,
            vars(&[("BIOREACTOR_FEED_DETECTION__TIME_WINDOW_SECONDS", "18446744073709551615")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { ref key, .. } if key == "feed_detection.time_window_seconds"));

        let err = PipelineConfig::load(None, vars(&[("BIOREACTOR_TRANSPORT__BASE_DELAY_MS", "99999999999999")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { ref key, .. } if key == "transport.base_delay_ms"));

        let config = PipelineConfig::load(
            None,
            vars(&[("BIOREACTOR_ANALYSIS__ANALYSIS_WINDOW_SECONDS", &MAX_WINDOW_SECONDS.to_string())]),
        )
        .unwrap();
        assert_eq!(config.analysis.analysis_window_seconds, MAX_WINDOW_SECONDS);
    }

    #[test]
    fn env_keys_are_case_insensitive_and_reach_nested_sections() {
        let config = PipelineConfig::load(
            None,
            vars(&[
                ("BIOREACTOR_TRANSPORT__BACKOFF__KIND", "exponential"),
                ("BIOREACTOR_TRANSPORT__BACKOFF__MAX_DELAY_MS", "8000"),
                ("BIOREACTOR_transport__host", "reactor-gw"),
                ("BIOREACTOR_PORT", "1"),
            ]),
        )
        .unwrap();
        assert_eq!(config.transport.backoff, BackoffPolicy::Exponential { max_delay_ms: 8000 });
        assert_eq!(config.transport.host, "reactor-gw");
        assert_eq!(config.transport.port, 8765);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = PipelineConfig::from_file(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));
    }

    #[test]
    fn retry_delay_follows_policy() {
        let mut transport = TransportConfig::default();
        assert_eq!(transport.retry_delay(1), Duration::from_secs(1));
        assert_eq!(transport.retry_delay(3), Duration::from_secs(3));

        transport.backoff = BackoffPolicy::Exponential { max_delay_ms: 5000 };
        assert_eq!(transport.retry_delay(1), Duration::from_secs(1));
        assert_eq!(transport.retry_delay(3), Duration::from_secs(4));
        assert_eq!(transport.retry_delay(10), Duration::from_secs(5));
        assert_eq!(transport.retry_delay(200), Duration::from_secs(5));
    }
}
