//! # Configuration Modules
//!
//! Layered pipeline configuration (defaults, JSON file, environment) and the
//! shared, reloadable feed settings handle.

/// Pipeline configuration sections, layering and validation.
pub mod config_pipeline;

/// Process-wide feed settings.
pub mod feed_settings;

pub use config_pipeline::{
    AnalysisConfig, BackoffPolicy, DatabaseConfig, FeedDetectionConfig, LoggingConfig, PipelineConfig,
    TransportConfig,
};
pub use feed_settings::SharedFeedSettings;
