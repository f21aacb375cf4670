//! # Connections
//!
//! The persistence layer: a read-only upstream process store (PostgreSQL) and a
//! locally owned store (SQLite) for settings, feed events, feed parameters and
//! derived metrics.

/// Read-only PostgreSQL process-data store.
pub mod upstream_store;
/// Locally owned SQLite store.
pub mod local_store;

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::configs::DatabaseConfig;
use crate::errors::PersistenceError;

pub use local_store::LocalStore;
pub use upstream_store::{Fetched, UpstreamStore};

/// Both stores, opened together.
pub struct PersistenceLayer {
    pub upstream: UpstreamStore,
    pub local: LocalStore,
}

impl PersistenceLayer {
    /// Opens the local store, then connects the upstream store. Fails when the
    /// local store cannot be opened, or when the upstream store is required and
    /// unreachable.
    pub async fn connect(config: &DatabaseConfig, cancel: CancellationToken) -> Result<Self, PersistenceError> {
        let local = LocalStore::open(&config.local_path).await?;
        let upstream = UpstreamStore::connect(config, cancel).await?;
        Ok(Self { upstream, local })
    }

    pub async fn close(&self) {
        self.upstream.close().await;
        self.local.close().await;
    }
}

/// Parses an ISO-8601 timestamp. Accepts RFC 3339 with an offset, or a naive
/// date-time which is taken as UTC.
pub fn parse_iso(value: &str) -> Result<DateTime<Utc>, PersistenceError> {
    let trimmed = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(PersistenceError::InvalidTimestamp(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_offset_and_naive_timestamps() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        assert_eq!(parse_iso("2024-05-01T10:30:00Z").unwrap(), expected);
        assert_eq!(parse_iso("2024-05-01T12:30:00+02:00").unwrap(), expected);
        assert_eq!(parse_iso("2024-05-01T10:30:00").unwrap(), expected);
        assert_eq!(parse_iso("2024-05-01 10:30:00.000").unwrap(), expected);
        assert!(parse_iso("01/05/2024").is_err());
    }

    #[tokio::test]
    async fn local_only_layer_connects() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            local_path: dir.path().join("bio.db"),
            ..DatabaseConfig::default()
        };
        let layer = PersistenceLayer::connect(&config, CancellationToken::new()).await.unwrap();
        assert!(!layer.upstream.is_available());
        assert!(layer.local.get_feed_settings().await.is_none());
        layer.close().await;
    }
}
