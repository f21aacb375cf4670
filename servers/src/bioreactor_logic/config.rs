use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use lib_bioreactor::ConfigError;
use lib_bioreactor::configs::PipelineConfig;
use lib_bioreactor::models::FeedSettings;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_CONFIG_FILE: &str = "server_bioreactor.json";

#[derive(Parser, Debug, Clone, Default)]
#[clap(about = "Bioreactor real-time metrics server", version)]
pub struct Cli {
    #[clap(long, env = "BIOREACTOR_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "BIOREACTOR_HOST", help = "Address the downstream API binds to.")]
    pub host: Option<String>,

    #[clap(long, env = "BIOREACTOR_PORT", help = "Port of the downstream API.")]
    pub port: Option<u16>,

    #[clap(long, env = "BIOREACTOR_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "BIOREACTOR_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error, fatal).")]
    pub log_level: Option<String>,

    #[clap(long, env = "BIOREACTOR_SOURCE_HOST", help = "Host of the telemetry WebSocket source.")]
    pub source_host: Option<String>,

    #[clap(long, env = "BIOREACTOR_SOURCE_PORT", help = "Port of the telemetry WebSocket source.")]
    pub source_port: Option<u16>,

    #[clap(long, env = "BIOREACTOR_UPSTREAM_URL", help = "PostgreSQL URL of the upstream process store.")]
    pub upstream_url: Option<String>,

    #[clap(long, env = "BIOREACTOR_UPSTREAM_REQUIRED", help = "Refuse to start when the upstream store is unreachable.")]
    pub upstream_required: Option<bool>,

    #[clap(long, env = "BIOREACTOR_LOCAL_DB", help = "Path of the local SQLite store.")]
    pub local_path: Option<PathBuf>,

    #[clap(long, env = "BIOREACTOR_DATAFLOW_CHECK_INTERVAL_SECONDS", help = "Interval in seconds between dataflow checks.")]
    pub dataflow_check_interval_seconds: Option<u64>,

    #[clap(long, env = "BIOREACTOR_DATAFLOW_INACTIVITY_THRESHOLD_SECONDS", help = "Seconds without processed frames before warning.")]
    pub dataflow_inactivity_threshold_seconds: Option<u64>,
}

/// The `server` section of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub dataflow_check_interval_seconds: u64,
    pub dataflow_inactivity_threshold_seconds: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            dataflow_check_interval_seconds: 10,
            dataflow_inactivity_threshold_seconds: 60,
        }
    }
}

impl ServerSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::out_of_range("server.port", "must be non-zero"));
        }
        if self.dataflow_check_interval_seconds == 0 {
            return Err(ConfigError::out_of_range("server.dataflow_check_interval_seconds", "must be positive"));
        }
        if self.dataflow_inactivity_threshold_seconds == 0 {
            return Err(ConfigError::out_of_range(
                "server.dataflow_inactivity_threshold_seconds",
                "must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub pipeline: PipelineConfig,
    pub server: ServerSettings,
    /// Seed for the local store when it holds no feed settings yet.
    pub feed_settings: FeedSettings,
}

pub fn load_config() -> Result<ServerConfig> {
    resolve(Cli::parse(), std::env::vars())
}

/// Defaults, then the config file, then `BIOREACTOR_<SECTION>__<KEY>`
/// variables, then command-line flags.
pub fn resolve<I>(cli: Cli, vars: I) -> Result<ServerConfig>
where
    I: IntoIterator<Item = (String, String)>,
{
    let config_path = cli.config_path.clone().or_else(|| {
        let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
        fallback.exists().then_some(fallback)
    });
    match &config_path {
        Some(path) => log::info!("Loading configuration from {}", path.display()),
        None => log::info!("No config file found; using defaults and environment/CLI variables."),
    }

    let mut pipeline =
        PipelineConfig::load(config_path.as_deref(), vars).context("Invalid pipeline configuration")?;

    let document = match &config_path {
        Some(path) => read_document(path)?,
        None => Value::Null,
    };
    let mut server: ServerSettings = match document.get("server") {
        Some(section) => serde_json::from_value(section.clone()).context("Invalid 'server' section")?,
        None => ServerSettings::default(),
    };
    let feed_settings = match document.get("feed_settings") {
        Some(section) => FeedSettings::from_json(section).context("Invalid 'feed_settings' section")?,
        None => FeedSettings::default(),
    };

    server.host = cli.host.unwrap_or(server.host);
    server.port = cli.port.unwrap_or(server.port);
    server.dataflow_check_interval_seconds = cli
        .dataflow_check_interval_seconds
        .unwrap_or(server.dataflow_check_interval_seconds);
    server.dataflow_inactivity_threshold_seconds = cli
        .dataflow_inactivity_threshold_seconds
        .unwrap_or(server.dataflow_inactivity_threshold_seconds);

    pipeline.logging.log_dir = cli.log_dir.unwrap_or(pipeline.logging.log_dir);
    pipeline.logging.log_level = cli.log_level.unwrap_or(pipeline.logging.log_level);
    pipeline.transport.host = cli.source_host.unwrap_or(pipeline.transport.host);
    pipeline.transport.port = cli.source_port.unwrap_or(pipeline.transport.port);
    pipeline.database.upstream_url = cli.upstream_url.or(pipeline.database.upstream_url);
    pipeline.database.upstream_required = cli.upstream_required.unwrap_or(pipeline.database.upstream_required);
    pipeline.database.local_path = cli.local_path.unwrap_or(pipeline.database.local_path);

    pipeline.validate().context("Invalid configuration after command-line overrides")?;
    server.validate()?;

    Ok(ServerConfig {
        pipeline,
        server,
        feed_settings,
    })
}

fn read_document(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}
