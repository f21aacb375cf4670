use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::SinkExt;
use lib_bioreactor::analysis::{FeedDetector, MetricEngine};
use lib_bioreactor::configs::{PipelineConfig, SharedFeedSettings, TransportConfig};
use lib_bioreactor::connections::LocalStore;
use lib_bioreactor::core::{
    Delivery, Dispatcher, MetricsPipeline, PipelineEvent, PipelineStats, Subscription, TransportManager,
};
use lib_bioreactor::models::{ConnectionState, DerivedMetrics, FeedEvent, FeedType, RawFrame};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

fn t(second: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + chrono::Duration::seconds(second)
}

fn frame(second: i64, do_ppm: f64, control_bottle: f64) -> RawFrame {
    RawFrame::new(t(second))
        .with_do(do_ppm, 30.0)
        .with_ph(7.0, 30.0)
        .with_weights(5.0, control_bottle, 1.0)
        .with_flow_controller(0.5, 0.5)
}

/// Serves `frames` to the first client that connects, then keeps the socket open.
async fn telemetry_source(frames: Vec<RawFrame>) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        for frame in frames {
            let text = serde_json::to_string(&frame).unwrap();
            ws.send(Message::Text(text.into())).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(60)).await;
    });
    (port, handle)
}

struct Harness {
    transport: TransportManager,
    bus: Arc<Dispatcher<PipelineEvent>>,
    observer: Subscription<PipelineEvent>,
    store: LocalStore,
    cancel: CancellationToken,
    pipeline: JoinHandle<PipelineStats>,
    _dir: tempfile::TempDir,
}

async fn start(port: u16, max_attempts: Option<u32>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        transport: TransportConfig {
            host: "127.0.0.1".to_string(),
            port,
            base_delay_ms: 10,
            max_attempts,
            subscriber_capacity: 1024,
            ..TransportConfig::default()
        },
        ..PipelineConfig::default()
    };
    config.validate().unwrap();

    let store = LocalStore::open(&dir.path().join("bioreactor.db")).await.unwrap();
    let transport = TransportManager::new(config.transport.clone());
    let bus = Arc::new(Dispatcher::new("publication_bus", 1024));
    let observer = bus.subscribe("observer");
    let pipeline = MetricsPipeline::new(
        MetricEngine::new(config.analysis.clone()),
        FeedDetector::new(config.feed_detection.clone(), config.feed_volume),
        Arc::clone(&bus),
        store.clone(),
        SharedFeedSettings::default(),
    );
    let cancel = CancellationToken::new();
    let frames = transport.subscribe("metrics_pipeline");
    let pipeline = tokio::spawn(pipeline.run(frames, cancel.clone()));
    transport.connect().unwrap();

    Harness {
        transport,
        bus,
        observer,
        store,
        cancel,
        pipeline,
        _dir: dir,
    }
}

impl Harness {
    /// Collects bus events until `done` says so.
    async fn collect_until<F>(&mut self, mut done: F) -> Vec<PipelineEvent>
    where
        F: FnMut(&PipelineEvent) -> bool,
    {
        let mut events = Vec::new();
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                match self.observer.recv().await {
                    Delivery::Item(event) => {
                        let finished = done(&event);
                        events.push(event);
                        if finished {
                            break;
                        }
                    }
                    Delivery::Dropped(n) => panic!("observer lost {} events", n),
                    Delivery::Closed => break,
                }
            }
        })
        .await
        .expect("pipeline did not produce the expected events in time");
        events
    }

    async fn stop(self) -> PipelineStats {
        self.transport.disconnect().await;
        self.cancel.cancel();
        self.bus.close();
        self.pipeline.await.unwrap()
    }
}

fn metrics(events: &[PipelineEvent]) -> Vec<Arc<DerivedMetrics>> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Metrics(m) => Some(Arc::clone(m)),
            _ => None,
        })
        .collect()
}

fn feeds(events: &[PipelineEvent]) -> Vec<Arc<FeedEvent>> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Feed(f) => Some(Arc::clone(f)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn oxygen_drop_and_recovery_through_the_live_pipeline() {
    // 300 s at 800 ppm fills the analysis window, then 800 -> 650 over 30 s,
    // then 650 -> 780 over 90 s, then 30 s flat.
    let mut series: Vec<RawFrame> = (0..=300).map(|s| frame(s, 800.0, 1.0)).collect();
    series.extend((301..=330).map(|s| frame(s, 800.0 - 5.0 * (s - 300) as f64, 1.0)));
    series.extend((331..=420).map(|s| frame(s, 650.0 + 130.0 * (s - 330) as f64 / 90.0, 1.0)));
    series.extend((421..=450).map(|s| frame(s, 780.0, 1.0)));
    let last = t(450);

    let (port, source) = telemetry_source(series).await;
    let mut harness = start(port, Some(5)).await;
    let events = harness
        .collect_until(|e| matches!(e, PipelineEvent::Metrics(m) if m.timestamp == last))
        .await;

    let derived = metrics(&events);
    assert_eq!(derived.len(), 451);
    assert!(derived.iter().all(|m| (0.0..=100.0).contains(&m.do_saturation)));
    assert!(derived.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    let drops: Vec<_> = derived.iter().filter(|m| m.drop_rate.is_some()).collect();
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].timestamp, t(331));
    assert!((drops[0].drop_rate.unwrap() - 5.0).abs() < 1e-6);
    assert!((drops[0].our.unwrap() - 50.0).abs() < 1e-6);

    let recoveries: Vec<_> = derived.iter().filter(|m| m.recovery_time.is_some()).collect();
    assert_eq!(recoveries.len(), 1);
    let crossing = recoveries[0];
    // 95 % of the 800 ppm baseline is 760 ppm, first reached at t=407.
    assert_eq!(crossing.timestamp, t(407));
    assert!((crossing.recovery_time.unwrap() - 107.0).abs() <= 1.0);
    assert!(derived
        .iter()
        .filter(|m| m.timestamp < t(407))
        .all(|m| m.recovery_time.is_none()));

    assert!(feeds(&events).is_empty());
    assert_eq!(harness.store.metrics_range(t(0), last).await.len(), 451);

    let stats = harness.stop().await;
    assert_eq!(stats.frames_processed, 451);
    assert_eq!(stats.frames_rejected, 0);
    source.abort();
}

#[tokio::test]
async fn bottle_step_raises_one_persisted_feed_event() {
    // Control bottle loses 60 g at t=60; small jitter elsewhere stays inside the noise band.
    let series: Vec<RawFrame> = (0..=120)
        .map(|s| {
            let jitter = if s % 2 == 0 { 0.0 } else { 0.01 };
            let control = if s < 60 { 1.0 } else { 0.94 };
            frame(s, 800.0, control + jitter)
        })
        .collect();
    let last = t(120);

    let (port, source) = telemetry_source(series).await;
    let mut harness = start(port, Some(5)).await;
    let events = harness
        .collect_until(|e| matches!(e, PipelineEvent::Metrics(m) if m.timestamp == last))
        .await;

    let detected = feeds(&events);
    assert_eq!(detected.len(), 1);
    assert_eq!(detected[0].feed_type, FeedType::Control);
    assert!((detected[0].volume - 0.06).abs() < 0.011);

    let stored = harness.store.feed_events(None, None, Some(FeedType::Control)).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, detected[0].id);

    harness.stop().await;
    source.abort();
}

#[tokio::test]
async fn unreachable_source_is_reported_on_the_bus() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut harness = start(port, Some(2)).await;

    // Two failed attempts, then the give-up notice.
    let mut disconnects = 0;
    let events = harness
        .collect_until(|e| {
            if matches!(
                e,
                PipelineEvent::SourceStatus {
                    state: ConnectionState::Disconnected,
                    available: false
                }
            ) {
                disconnects += 1;
            }
            disconnects == 3
        })
        .await;
    assert!(metrics(&events).is_empty());
    assert_eq!(harness.transport.state(), ConnectionState::Disconnected);

    let stats = harness.stop().await;
    assert_eq!(stats.frames_processed, 0);
}
