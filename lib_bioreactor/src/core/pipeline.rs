//! # Metrics Pipeline
//!
//! Consumes transport events in arrival order, runs each frame through the
//! metric engine and the feed detector, persists what comes out and publishes
//! it on the publication bus.
//!
//! The pipeline task owns the engine and detector. Everything other tasks need
//! (latest metrics, counters, the feed log, manual feed entry) goes through a
//! cloneable [`PipelineHandle`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::analysis::{FeedDetector, FeedLog, FeedStatistics, ManualFeedEntry, MetricEngine};
use crate::configs::SharedFeedSettings;
use crate::connections::LocalStore;
use crate::core::dispatcher::{lock, Delivery, Dispatcher, Subscription};
use crate::core::transport::TransportEvent;
use crate::errors::FeedEventError;
use crate::models::{ConnectionState, DerivedMetrics, FeedEvent, RawFrame};

/// What the publication bus carries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PipelineEvent {
    Metrics(Arc<DerivedMetrics>),
    Feed(Arc<FeedEvent>),
    Rejected { timestamp: DateTime<Utc>, reason: String },
    SourceStatus { state: ConnectionState, available: bool },
}

/// Last derived metrics, flagged unavailable while the source is down.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatestMetrics {
    pub metrics: Option<Arc<DerivedMetrics>>,
    pub available: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub frames_rejected: u64,
    pub backlog_drops: u64,
    pub feed_events: u64,
    pub persist_failures: u64,
}

#[derive(Default)]
struct Counters {
    frames_processed: AtomicU64,
    frames_rejected: AtomicU64,
    backlog_drops: AtomicU64,
    feed_events: AtomicU64,
    persist_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            backlog_drops: self.backlog_drops.load(Ordering::Relaxed),
            feed_events: self.feed_events.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    bus: Arc<Dispatcher<PipelineEvent>>,
    local: LocalStore,
    settings: SharedFeedSettings,
    latest: RwLock<LatestMetrics>,
    feed_log: Mutex<FeedLog>,
    counters: Counters,
    last_processed: Mutex<Option<Instant>>,
}

/// Cloneable access to a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
}

impl PipelineHandle {
    pub fn latest(&self) -> LatestMetrics {
        self.shared
            .latest
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.counters.snapshot()
    }

    pub fn bus(&self) -> Arc<Dispatcher<PipelineEvent>> {
        Arc::clone(&self.shared.bus)
    }

    pub fn settings(&self) -> &SharedFeedSettings {
        &self.shared.settings
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.shared.local
    }

    /// Time since the last frame was turned into metrics.
    pub fn since_last_frame(&self) -> Option<Duration> {
        lock(&self.shared.last_processed).map(|at| at.elapsed())
    }

    pub fn recent_feeds(&self, hours: f64) -> Vec<FeedEvent> {
        lock(&self.shared.feed_log).recent(hours, Utc::now())
    }

    pub fn feed_statistics(&self) -> FeedStatistics {
        lock(&self.shared.feed_log).statistics()
    }

    /// Validates and records an operator feed entry, then persists and
    /// publishes it. A failed write is logged; the event stays in the log.
    pub async fn record_manual_feed(&self, entry: ManualFeedEntry) -> Result<FeedEvent, FeedEventError> {
        let event = lock(&self.shared.feed_log).record_manual(entry, Utc::now())?;
        self.persist_and_publish_feed(event.clone()).await;
        Ok(event)
    }

    async fn persist_and_publish_feed(&self, event: FeedEvent) {
        self.shared.counters.feed_events.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.shared.local.save_feed_event(&event).await {
            self.shared.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
            log::error!("Failed to persist feed event {}: {}", event.id, e);
        }
        self.shared.bus.publish(PipelineEvent::Feed(Arc::new(event)));
    }

    fn set_available(&self, available: bool) {
        let mut latest = self
            .shared
            .latest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        latest.available = available;
    }
}

pub struct MetricsPipeline {
    engine: MetricEngine,
    detector: FeedDetector,
    handle: PipelineHandle,
}

impl MetricsPipeline {
    pub fn new(
        engine: MetricEngine,
        detector: FeedDetector,
        bus: Arc<Dispatcher<PipelineEvent>>,
        local: LocalStore,
        settings: SharedFeedSettings,
    ) -> Self {
        let feed_log = FeedLog::new(detector.bounds(), settings.clone());
        Self {
            engine,
            detector,
            handle: PipelineHandle {
                shared: Arc::new(Shared {
                    bus,
                    local,
                    settings,
                    latest: RwLock::new(LatestMetrics::default()),
                    feed_log: Mutex::new(feed_log),
                    counters: Counters::default(),
                    last_processed: Mutex::new(None),
                }),
            },
        }
    }

    /// Seeds the feed log with events persisted by an earlier run.
    pub fn with_feed_history(self, history: Vec<FeedEvent>) -> Self {
        let seeded = FeedLog::new(self.detector.bounds(), self.handle.shared.settings.clone()).with_history(history);
        *lock(&self.handle.shared.feed_log) = seeded;
        self
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    pub fn latest(&self) -> LatestMetrics {
        self.handle.latest()
    }

    pub fn stats(&self) -> PipelineStats {
        self.handle.stats()
    }

    /// Processes transport events until the stream closes or `cancel` fires.
    pub async fn run(mut self, mut events: Subscription<TransportEvent>, cancel: CancellationToken) -> PipelineStats {
        log::info!("Metrics pipeline started");
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                delivery = events.recv() => delivery,
            };
            match delivery {
                Delivery::Item(TransportEvent::Frame(frame)) => self.handle_frame(&frame).await,
                Delivery::Item(TransportEvent::StateChanged(state)) => {
                    let available = state == ConnectionState::Connected;
                    self.handle.set_available(available);
                    self.handle
                        .shared
                        .bus
                        .publish(PipelineEvent::SourceStatus { state, available });
                }
                Delivery::Item(TransportEvent::Unreachable { attempts }) => {
                    log::error!(
                        "Telemetry source unreachable after {} attempts; serving last known metrics",
                        attempts
                    );
                    self.handle.set_available(false);
                    self.handle.shared.bus.publish(PipelineEvent::SourceStatus {
                        state: ConnectionState::Disconnected,
                        available: false,
                    });
                }
                Delivery::Dropped(n) => {
                    self.handle.shared.counters.backlog_drops.fetch_add(n, Ordering::Relaxed);
                    log::warn!("Derivation backlog: {} oldest frames dropped", n);
                }
                Delivery::Closed => break,
            }
        }
        let stats = self.handle.stats();
        log::info!(
            "Metrics pipeline stopped: {} processed, {} rejected, {} dropped, {} feeds",
            stats.frames_processed,
            stats.frames_rejected,
            stats.backlog_drops,
            stats.feed_events
        );
        stats
    }

    async fn handle_frame(&mut self, frame: &RawFrame) {
        let shared = &self.handle.shared;
        let metrics = match self.engine.process(frame) {
            Ok(metrics) => Arc::new(metrics),
            Err(e) => {
                shared.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected frame at {}: {}", frame.timestamp, e);
                shared.bus.publish(PipelineEvent::Rejected {
                    timestamp: frame.timestamp,
                    reason: e.to_string(),
                });
                return;
            }
        };

        shared.counters.frames_processed.fetch_add(1, Ordering::Relaxed);
        *lock(&shared.last_processed) = Some(Instant::now());
        {
            let mut latest = shared.latest.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            latest.metrics = Some(Arc::clone(&metrics));
            latest.available = true;
        }
        if let Err(e) = shared.local.save_metrics(&metrics).await {
            shared.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
            log::error!("Failed to persist metrics for {}: {}", metrics.timestamp, e);
        }
        shared.bus.publish(PipelineEvent::Metrics(metrics));

        let Ok(snapshot) = frame.validate() else {
            return;
        };
        match self.detector.observe(&snapshot) {
            Ok(Some(event)) => {
                lock(&shared.feed_log).append(event.clone());
                self.handle.persist_and_publish_feed(event).await;
            }
            Ok(None) => {}
            Err(e) => log::warn!("Feed detected at {} but not recorded: {}", frame.timestamp, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::{AnalysisConfig, FeedDetectionConfig};
    use crate::models::{FeedSource, FeedType, VolumeBounds};
    use chrono::TimeZone;

    fn frame(second: i64, control_bottle: f64) -> RawFrame {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::seconds(second);
        RawFrame::new(ts)
            .with_do(800.0, 30.0)
            .with_ph(7.0, 30.0)
            .with_weights(5.0, control_bottle, 1.0)
    }

    async fn pipeline(dir: &tempfile::TempDir) -> (MetricsPipeline, Arc<Dispatcher<PipelineEvent>>) {
        let local = LocalStore::open(&dir.path().join("bio.db")).await.unwrap();
        let bus = Arc::new(Dispatcher::new("bus", 64));
        let pipeline = MetricsPipeline::new(
            MetricEngine::new(AnalysisConfig::default()),
            FeedDetector::new(FeedDetectionConfig::default(), VolumeBounds::default()),
            Arc::clone(&bus),
            local,
            SharedFeedSettings::default(),
        );
        (pipeline, bus)
    }

    fn drain(sub: &mut Subscription<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut out = Vec::new();
        while let Some(Delivery::Item(event)) = sub.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn derives_publishes_and_persists_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, bus) = pipeline(&dir).await;
        let handle = pipeline.handle();
        let mut observer = bus.subscribe("observer");

        let transport = Dispatcher::new("transport", 64);
        let events = transport.subscribe("pipeline");
        let task = tokio::spawn(pipeline.run(events, CancellationToken::new()));

        let mut broken = frame(1, 1.0);
        broken.ph = None;
        transport.publish(TransportEvent::StateChanged(ConnectionState::Connected));
        transport.publish(TransportEvent::Frame(Arc::new(frame(0, 1.0))));
        transport.publish(TransportEvent::Frame(Arc::new(broken)));
        transport.publish(TransportEvent::Frame(Arc::new(frame(2, 0.949))));
        transport.publish(TransportEvent::StateChanged(ConnectionState::Disconnected));
        transport.close();

        let stats = task.await.unwrap();
        assert_eq!(
            stats,
            PipelineStats {
                frames_processed: 2,
                frames_rejected: 1,
                backlog_drops: 0,
                feed_events: 1,
                persist_failures: 0,
            }
        );

        let published = drain(&mut observer);
        let kinds: Vec<&str> = published
            .iter()
            .map(|e| match e {
                PipelineEvent::Metrics(_) => "metrics",
                PipelineEvent::Feed(_) => "feed",
                PipelineEvent::Rejected { .. } => "rejected",
                PipelineEvent::SourceStatus { .. } => "status",
            })
            .collect();
        assert_eq!(kinds, vec!["status", "metrics", "rejected", "metrics", "feed", "status"]);

        let PipelineEvent::Feed(feed) = &published[4] else {
            panic!("expected a feed event");
        };
        assert_eq!(feed.feed_type, FeedType::Control);
        assert_eq!(feed.source, FeedSource::Detected);

        let latest = handle.latest();
        assert!(!latest.available);
        assert_eq!(latest.metrics.unwrap().timestamp, frame(2, 0.0).timestamp);

        let store = handle.local_store();
        assert_eq!(store.feed_events(None, None, None).await.len(), 1);
        let start = frame(0, 0.0).timestamp;
        let end = frame(10, 0.0).timestamp;
        assert_eq!(store.metrics_range(start, end).await.len(), 2);
        assert_eq!(handle.feed_statistics().feed_events_count, 1);
    }

    #[tokio::test]
    async fn manual_feed_is_validated_persisted_and_published() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, bus) = pipeline(&dir).await;
        let handle = pipeline.handle();
        let mut observer = bus.subscribe("observer");

        let entry = ManualFeedEntry {
            feed_type: "experimental".to_string(),
            volume: Some(0.25),
            operator: Some("lab".to_string()),
            note: None,
            timestamp: None,
        };
        let event = handle.record_manual_feed(entry.clone()).await.unwrap();
        assert_eq!(event.source, FeedSource::Manual);
        assert_eq!(event.operator.as_deref(), Some("lab"));
        assert_eq!(drain(&mut observer), vec![PipelineEvent::Feed(Arc::new(event.clone()))]);
        assert_eq!(handle.recent_feeds(1.0).len(), 1);

        let stored = handle.local_store().feed_events(None, None, Some(FeedType::Experimental)).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, event.id);

        let too_much = ManualFeedEntry {
            volume: Some(5.0),
            ..entry
        };
        assert!(matches!(
            handle.record_manual_feed(too_much).await,
            Err(FeedEventError::VolumeOutOfRange { .. })
        ));
        assert_eq!(handle.stats().feed_events, 1);
    }

    #[tokio::test]
    async fn backlog_drops_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _bus) = pipeline(&dir).await;
        let transport = Dispatcher::new("transport", 2);
        let events = transport.subscribe("pipeline");
        for second in 0..5 {
            transport.publish(TransportEvent::Frame(Arc::new(frame(second, 1.0))));
        }
        transport.close();

        let stats = pipeline.run(events, CancellationToken::new()).await;
        assert_eq!(stats.backlog_drops, 3);
        assert_eq!(stats.frames_processed, 2);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(PipelineEvent::SourceStatus {
            state: ConnectionState::Connected,
            available: true,
        })
        .unwrap();
        assert_eq!(json["type"], "source_status");
        assert_eq!(json["data"]["state"], "connected");
    }
}
