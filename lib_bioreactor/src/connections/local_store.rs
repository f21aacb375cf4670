//! # Local Store
//!
//! SQLite database owned by the pipeline. Holds the feed settings, the
//! append-only feed event log, operator-recorded feed parameters and the
//! derived metrics series.
//!
//! The schema is created idempotently on open. Every write is a single
//! statement and is reported to the caller; reads log failures and return
//! empty or absent values. Timestamps are stored as RFC 3339 UTC strings with
//! microsecond precision, which sort lexicographically.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::errors::PersistenceError;
use crate::models::{DerivedMetrics, FeedEvent, FeedParameters, FeedSettings, FeedSource, FeedType};

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS feed_settings (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        settings TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS feed_events (
        id TEXT PRIMARY KEY,
        timestamp TEXT NOT NULL,
        feed_type TEXT NOT NULL,
        volume REAL NOT NULL,
        source TEXT NOT NULL,
        operator TEXT,
        note TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_feed_events_timestamp ON feed_events (timestamp)",
    "CREATE TABLE IF NOT EXISTS feed_parameters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        feed_type TEXT NOT NULL,
        toc_value REAL,
        glucose_concentration REAL,
        recorded_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS derived_metrics (
        timestamp TEXT PRIMARY KEY,
        do_saturation REAL NOT NULL,
        saturation_clamped INTEGER NOT NULL,
        drop_rate REAL,
        recovery_time REAL,
        recovery_pending INTEGER NOT NULL,
        our REAL,
        sour REAL,
        ph REAL NOT NULL,
        temperature REAL NOT NULL,
        window_ready INTEGER NOT NULL
    )",
];

fn ts_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| PersistenceError::InvalidTimestamp(text.to_string()))
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    /// Opens (creating if missing) the database file and its schema.
    pub async fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| PersistenceError::ConnectionError(format!("{}: {}", parent.display(), e)))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e: sqlx::Error| PersistenceError::ConnectionError(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        log::info!("Local store ready at {}", path.display());
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), PersistenceError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PersistenceError::ConnectionError(e.to_string()))?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| PersistenceError::QueryError(e.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|e| PersistenceError::WriteError(e.to_string()))
    }

    // --- Feed settings ---

    /// Validates and stores the settings, replacing any previous value.
    pub async fn save_feed_settings(&self, settings: &FeedSettings) -> Result<(), PersistenceError> {
        settings.validate()?;
        let document = serde_json::to_string(settings).map_err(|e| PersistenceError::WriteError(e.to_string()))?;
        sqlx::query(
            "INSERT INTO feed_settings (id, settings, updated_at) VALUES (1, ?, ?)
             ON CONFLICT(id) DO UPDATE SET settings = excluded.settings, updated_at = excluded.updated_at",
        )
        .bind(document)
        .bind(ts_text(&Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::WriteError(e.to_string()))?;
        log::info!("Feed settings saved");
        Ok(())
    }

    /// Schema-checks an untyped settings document, then stores it.
    pub async fn save_feed_settings_json(&self, document: &serde_json::Value) -> Result<FeedSettings, PersistenceError> {
        let settings = FeedSettings::from_json(document)?;
        self.save_feed_settings(&settings).await?;
        Ok(settings)
    }

    /// `None` when nothing is stored yet or the stored value cannot be read.
    pub async fn get_feed_settings(&self) -> Option<FeedSettings> {
        let row = match sqlx::query("SELECT settings FROM feed_settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row?,
            Err(e) => {
                log::error!("Failed to read feed settings: {}", e);
                return None;
            }
        };
        let document: String = match row.try_get("settings") {
            Ok(document) => document,
            Err(e) => {
                log::error!("Failed to read feed settings column: {}", e);
                return None;
            }
        };
        match serde_json::from_str::<serde_json::Value>(&document)
            .map_err(|e| e.to_string())
            .and_then(|value| FeedSettings::from_json(&value).map_err(|e| e.to_string()))
        {
            Ok(settings) => Some(settings),
            Err(e) => {
                log::error!("Stored feed settings are invalid: {}", e);
                None
            }
        }
    }

    // --- Feed events ---

    /// Appends an event. An event with an existing id is refused.
    pub async fn save_feed_event(&self, event: &FeedEvent) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO feed_events (id, timestamp, feed_type, volume, source, operator, note)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(ts_text(&event.timestamp))
        .bind(event.feed_type.as_str())
        .bind(event.volume)
        .bind(event.source.as_str())
        .bind(event.operator.as_deref())
        .bind(event.note.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::WriteError(e.to_string()))?;
        Ok(())
    }

    /// Events in `[start, end]` (either bound optional), optionally of one
    /// type, oldest first.
    pub async fn feed_events(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        feed_type: Option<FeedType>,
    ) -> Vec<FeedEvent> {
        let start_text = start.as_ref().map(ts_text);
        let end_text = end.as_ref().map(ts_text);
        let type_text = feed_type.map(|t| t.as_str());
        let rows = sqlx::query(
            "SELECT id, timestamp, feed_type, volume, source, operator, note FROM feed_events
             WHERE (? IS NULL OR timestamp >= ?)
               AND (? IS NULL OR timestamp <= ?)
               AND (? IS NULL OR feed_type = ?)
             ORDER BY timestamp ASC",
        )
        .bind(start_text.clone())
        .bind(start_text)
        .bind(end_text.clone())
        .bind(end_text)
        .bind(type_text)
        .bind(type_text)
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => rows
                .iter()
                .filter_map(|row| match feed_event_from_row(row) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        log::warn!("Skipping unreadable feed event row: {}", e);
                        None
                    }
                })
                .collect(),
            Err(e) => {
                log::error!("Failed to query feed events: {}", e);
                Vec::new()
            }
        }
    }

    // --- Feed parameters ---

    pub async fn save_feed_parameters(&self, params: &FeedParameters) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO feed_parameters (feed_type, toc_value, glucose_concentration, recorded_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(params.feed_type.as_str())
        .bind(params.toc_value)
        .bind(params.glucose_concentration)
        .bind(ts_text(&params.recorded_at))
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::WriteError(e.to_string()))?;
        Ok(())
    }

    pub async fn latest_feed_parameters(&self, feed_type: FeedType) -> Option<FeedParameters> {
        let row = sqlx::query(
            "SELECT feed_type, toc_value, glucose_concentration, recorded_at FROM feed_parameters
             WHERE feed_type = ? ORDER BY recorded_at DESC, id DESC LIMIT 1",
        )
        .bind(feed_type.as_str())
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some(row)) => match feed_parameters_from_row(&row) {
                Ok(params) => Some(params),
                Err(e) => {
                    log::warn!("Unreadable feed parameters row: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::error!("Failed to query feed parameters: {}", e);
                None
            }
        }
    }

    // --- Derived metrics ---

    /// Stores one metrics record. A record with the same timestamp is replaced.
    pub async fn save_metrics(&self, metrics: &DerivedMetrics) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT OR REPLACE INTO derived_metrics
             (timestamp, do_saturation, saturation_clamped, drop_rate, recovery_time, recovery_pending,
              our, sour, ph, temperature, window_ready)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(ts_text(&metrics.timestamp))
        .bind(metrics.do_saturation)
        .bind(metrics.saturation_clamped)
        .bind(metrics.drop_rate)
        .bind(metrics.recovery_time)
        .bind(metrics.recovery_pending)
        .bind(metrics.our)
        .bind(metrics.sour)
        .bind(metrics.ph)
        .bind(metrics.temperature)
        .bind(metrics.window_ready)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::WriteError(e.to_string()))?;
        Ok(())
    }

    /// Stored metrics in `[start, end]`, oldest first.
    pub async fn metrics_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DerivedMetrics> {
        let rows = sqlx::query(
            "SELECT timestamp, do_saturation, saturation_clamped, drop_rate, recovery_time, recovery_pending,
                    our, sour, ph, temperature, window_ready
             FROM derived_metrics WHERE timestamp BETWEEN ? AND ? ORDER BY timestamp ASC",
        )
        .bind(ts_text(&start))
        .bind(ts_text(&end))
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => rows.iter().filter_map(|row| metrics_from_row(row).ok()).collect(),
            Err(e) => {
                log::error!("Failed to query derived metrics: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn feed_event_from_row(row: &SqliteRow) -> Result<FeedEvent, PersistenceError> {
    let read = |e: sqlx::Error| PersistenceError::QueryError(e.to_string());
    let id: String = row.try_get("id").map_err(read)?;
    let timestamp: String = row.try_get("timestamp").map_err(read)?;
    let feed_type: String = row.try_get("feed_type").map_err(read)?;
    let source: String = row.try_get("source").map_err(read)?;
    Ok(FeedEvent {
        id: Uuid::from_str(&id).map_err(|e| PersistenceError::QueryError(e.to_string()))?,
        timestamp: parse_ts(&timestamp)?,
        feed_type: feed_type
            .parse()
            .map_err(|e: crate::errors::FeedEventError| PersistenceError::QueryError(e.to_string()))?,
        volume: row.try_get("volume").map_err(read)?,
        source: source
            .parse::<FeedSource>()
            .map_err(|e| PersistenceError::QueryError(e.to_string()))?,
        operator: row.try_get("operator").map_err(read)?,
        note: row.try_get("note").map_err(read)?,
    })
}

fn feed_parameters_from_row(row: &SqliteRow) -> Result<FeedParameters, PersistenceError> {
    let read = |e: sqlx::Error| PersistenceError::QueryError(e.to_string());
    let feed_type: String = row.try_get("feed_type").map_err(read)?;
    let recorded_at: String = row.try_get("recorded_at").map_err(read)?;
    Ok(FeedParameters {
        feed_type: feed_type
            .parse()
            .map_err(|e: crate::errors::FeedEventError| PersistenceError::QueryError(e.to_string()))?,
        toc_value: row.try_get("toc_value").map_err(read)?,
        glucose_concentration: row.try_get("glucose_concentration").map_err(read)?,
        recorded_at: parse_ts(&recorded_at)?,
    })
}

fn metrics_from_row(row: &SqliteRow) -> Result<DerivedMetrics, PersistenceError> {
    let read = |e: sqlx::Error| PersistenceError::QueryError(e.to_string());
    let timestamp: String = row.try_get("timestamp").map_err(read)?;
    Ok(DerivedMetrics {
        timestamp: parse_ts(&timestamp)?,
        do_saturation: row.try_get("do_saturation").map_err(read)?,
        saturation_clamped: row.try_get("saturation_clamped").map_err(read)?,
        drop_rate: row.try_get("drop_rate").map_err(read)?,
        recovery_time: row.try_get("recovery_time").map_err(read)?,
        recovery_pending: row.try_get("recovery_pending").map_err(read)?,
        our: row.try_get("our").map_err(read)?,
        sour: row.try_get("sour").map_err(read)?,
        ph: row.try_get("ph").map_err(read)?,
        temperature: row.try_get("temperature").map_err(read)?,
        window_ready: row.try_get("window_ready").map_err(read)?,
    })
}
