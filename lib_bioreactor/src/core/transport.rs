//! # Transport Manager
//!
//! Keeps one WebSocket connection to the telemetry source alive and fans every
//! received [`RawFrame`] out to its subscribers.
//!
//! Lifecycle: `Idle → Connecting → Connected → Disconnected → Connecting → …`,
//! with `Closed` reached only through [`TransportManager::disconnect`]. After
//! `max_attempts` consecutive failures the manager stays `Disconnected` and
//! publishes [`TransportEvent::Unreachable`]; a later [`TransportManager::connect`]
//! starts over with a fresh attempt counter.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::configs::TransportConfig;
use crate::core::dispatcher::{lock, Dispatcher, Subscription, SubscriptionHandle};
use crate::errors::TransportError;
use crate::models::{ConnectionState, RawFrame};

/// What transport subscribers receive.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(Arc<RawFrame>),
    StateChanged(ConnectionState),
    /// Retries are exhausted; no further automatic attempt will be made.
    Unreachable { attempts: u32 },
}

/// Why a live session ended.
enum SessionEnd {
    Cancelled,
    Closed,
    Failed(String),
    Inactive,
}

struct Link {
    config: TransportConfig,
    endpoint: String,
    dispatcher: Arc<Dispatcher<TransportEvent>>,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    /// Set once the worker has given up; it only returns from then on.
    exhausted: AtomicBool,
}

impl Link {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log::info!("Transport {:?} -> {:?} ({})", previous, next, self.endpoint);
            self.dispatcher.publish(TransportEvent::StateChanged(next));
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut last_dispatched: Option<DateTime<Utc>> = None;
        loop {
            self.set_state(ConnectionState::Connecting);
            log::info!("Connecting to telemetry source: {}", self.endpoint);

            let connected = tokio::select! {
                _ = cancel.cancelled() => return,
                result = connect_async(self.endpoint.as_str()) => result,
            };

            match connected {
                Ok((ws_stream, _)) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    self.set_state(ConnectionState::Connected);
                    match self.session(ws_stream, &cancel, &mut last_dispatched).await {
                        SessionEnd::Cancelled => return,
                        SessionEnd::Closed => log::warn!("Telemetry stream closed by remote host"),
                        SessionEnd::Failed(reason) => log::error!("Telemetry stream error: {}", reason),
                        SessionEnd::Inactive => log::warn!(
                            "No telemetry for {}ms, treating connection as lost",
                            self.config.inactivity_timeout_ms
                        ),
                    }
                }
                Err(e) => {
                    let err = TransportError::Connect {
                        url: self.endpoint.clone(),
                        reason: e.to_string(),
                    };
                    log::error!("{}", err);
                }
            }

            self.set_state(ConnectionState::Disconnected);
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(max) = self.config.max_attempts {
                if attempt >= max {
                    log::error!(
                        "Telemetry source unreachable after {} attempts; automatic retries stopped",
                        attempt
                    );
                    self.exhausted.store(true, Ordering::SeqCst);
                    self.dispatcher.publish(TransportEvent::Unreachable { attempts: attempt });
                    return;
                }
            }

            let delay = self.config.retry_delay(attempt);
            log::info!("Reconnecting in {:?} (attempt {})", delay, attempt + 1);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn session(
        &self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        cancel: &CancellationToken,
        last_dispatched: &mut Option<DateTime<Utc>>,
    ) -> SessionEnd {
        let (mut write, mut read) = ws_stream.split();
        let timeout = self.config.inactivity_timeout();
        let tick = timeout.min(Duration::from_secs(1)) / 2;
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_activity = Instant::now();
                            self.handle_payload(text.as_str().as_bytes(), last_dispatched);
                        }
                        Some(Ok(Message::Binary(bin))) => {
                            last_activity = Instant::now();
                            self.handle_payload(&bin, last_dispatched);
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            last_activity = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => return SessionEnd::Closed,
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                    }
                }
                _ = tokio::time::sleep(tick) => {
                    if last_activity.elapsed() > timeout {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Inactive;
                    }
                }
            }
        }
    }

    fn handle_payload(&self, payload: &[u8], last_dispatched: &mut Option<DateTime<Utc>>) {
        let frame: RawFrame = match serde_json::from_slice(payload) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("{}", TransportError::MalformedFrame(e.to_string()));
                return;
            }
        };
        if let Some(last) = *last_dispatched {
            if frame.timestamp < last {
                log::warn!(
                    "Dropping out-of-order frame at {} (last dispatched {})",
                    frame.timestamp,
                    last
                );
                return;
            }
        }
        *last_dispatched = Some(frame.timestamp);
        self.dispatcher.publish(TransportEvent::Frame(Arc::new(frame)));
    }
}

pub struct TransportManager {
    link: Arc<Link>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl TransportManager {
    pub fn new(config: TransportConfig) -> Self {
        let endpoint = config.endpoint();
        let dispatcher = Arc::new(Dispatcher::new("transport", config.subscriber_capacity));
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            link: Arc::new(Link {
                config,
                endpoint,
                dispatcher,
                state,
                attempts: AtomicU32::new(0),
                exhausted: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.link.endpoint
    }

    /// Starts the connection task. A no-op while a connection is live or being
    /// retried; otherwise the attempt counter starts again from zero. A worker
    /// that has given up counts as stopped even before its task has returned,
    /// so an `Unreachable` subscriber may call this directly.
    pub fn connect(&self) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let url = url::Url::parse(&self.link.endpoint)
            .map_err(|e| TransportError::InvalidEndpoint(self.link.endpoint.clone(), e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidEndpoint(
                self.link.endpoint.clone(),
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }

        let mut worker = lock(&self.worker);
        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() && !self.link.exhausted.load(Ordering::SeqCst) {
                log::debug!("Transport already active, connect ignored");
                return Ok(());
            }
        }
        self.link.attempts.store(0, Ordering::SeqCst);
        self.link.exhausted.store(false, Ordering::SeqCst);
        let link = Arc::clone(&self.link);
        let cancel = self.shutdown.child_token();
        *worker = Some(tokio::spawn(link.run(cancel)));
        Ok(())
    }

    /// Tears the connection down for good: pending retries and the live socket
    /// are cancelled, state becomes `Closed` and subscribers see the end of
    /// their streams.
    pub async fn disconnect(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Transport task ended abnormally: {}", e);
            }
        }
        self.link.set_state(ConnectionState::Closed);
        self.link.dispatcher.close();
    }

    pub fn state(&self) -> ConnectionState {
        *self.link.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.state.subscribe()
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.link.attempts.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, name: impl Into<String>) -> Subscription<TransportEvent> {
        self.link.dispatcher.subscribe(name)
    }

    pub fn subscribe_inline<F>(&self, name: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.link.dispatcher.subscribe_inline(name, handler)
    }

    pub fn subscribe_with<F>(&self, name: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: FnMut(TransportEvent) + Send + 'static,
    {
        self.link.dispatcher.subscribe_with(name, handler)
    }

    pub fn subscriber_count(&self) -> usize {
        self.link.dispatcher.subscriber_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatcher::Delivery;
    use chrono::TimeZone;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn config_for(port: u16) -> TransportConfig {
        TransportConfig {
            host: "127.0.0.1".to_string(),
            port,
            base_delay_ms: 10,
            max_attempts: Some(3),
            inactivity_timeout_ms: 5_000,
            ..TransportConfig::default()
        }
    }

    fn frame_json(second: u32) -> String {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, second).unwrap();
        let frame = RawFrame::new(ts).with_do(800.0, 30.0).with_ph(7.0, 30.0).with_weights(5.0, 1.0, 1.0);
        serde_json::to_string(&frame).unwrap()
    }

    async fn next_event(sub: &mut Subscription<TransportEvent>) -> TransportEvent {
        match tokio::time::timeout(Duration::from_secs(5), sub.recv()).await {
            Ok(Delivery::Item(event)) => event,
            other => panic!("unexpected delivery: {:?}", other),
        }
    }

    async fn next_frame(sub: &mut Subscription<TransportEvent>) -> Arc<RawFrame> {
        loop {
            if let TransportEvent::Frame(frame) = next_event(sub).await {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn streams_frames_and_skips_bad_payloads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            for payload in [frame_json(1), "not json".to_string(), frame_json(3), frame_json(2), frame_json(4)] {
                ws.send(Message::Text(payload.into())).await.unwrap();
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let manager = TransportManager::new(config_for(port));
        let mut sub = manager.subscribe("test");
        manager.connect().unwrap();
        manager.connect().unwrap();

        assert_eq!(next_event(&mut sub).await, TransportEvent::StateChanged(ConnectionState::Connecting));
        assert_eq!(next_event(&mut sub).await, TransportEvent::StateChanged(ConnectionState::Connected));
        assert_eq!(manager.state(), ConnectionState::Connected);

        let seconds: Vec<u32> = {
            let mut out = Vec::new();
            for _ in 0..3 {
                out.push(chrono::Timelike::second(&next_frame(&mut sub).await.timestamp));
            }
            out
        };
        assert_eq!(seconds, vec![1, 3, 4]);

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(next_event(&mut sub).await, TransportEvent::StateChanged(ConnectionState::Closed));
        assert_eq!(sub.recv().await, Delivery::Closed);
        assert_eq!(manager.connect(), Err(TransportError::Closed));
        server.abort();
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_and_connect_starts_over() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let manager = TransportManager::new(config_for(port));
        let mut sub = manager.subscribe("test");
        manager.connect().unwrap();

        let mut connecting = 0;
        loop {
            match next_event(&mut sub).await {
                TransportEvent::StateChanged(ConnectionState::Connecting) => connecting += 1,
                TransportEvent::Unreachable { attempts } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(connecting, 3);
        assert_eq!(manager.attempts(), 3);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(sub.try_recv().is_none());

        manager.connect().unwrap();
        loop {
            if let TransportEvent::Unreachable { attempts } = next_event(&mut sub).await {
                assert_eq!(attempts, 3);
                break;
            }
        }
        manager.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connect_from_an_unreachable_handler_restarts_retries() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let manager = Arc::new(TransportManager::new(config_for(port)));
        let signals = Arc::new(AtomicU32::new(0));
        let mut sub = manager.subscribe("test");

        let handler_manager = Arc::clone(&manager);
        let handler_signals = Arc::clone(&signals);
        let _handle = manager.subscribe_inline("reconnector", move |event| {
            if let TransportEvent::Unreachable { .. } = event {
                if handler_signals.fetch_add(1, Ordering::SeqCst) == 0 {
                    handler_manager.connect().unwrap();
                }
            }
        });
        manager.connect().unwrap();

        let mut unreachable = 0;
        while unreachable < 2 {
            if let TransportEvent::Unreachable { attempts } = next_event(&mut sub).await {
                assert_eq!(attempts, 3);
                unreachable += 1;
            }
        }
        assert_eq!(signals.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn silent_source_is_treated_as_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ws = accept_async(stream).await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let manager = TransportManager::new(TransportConfig {
            inactivity_timeout_ms: 200,
            ..config_for(port)
        });
        let mut watch = manager.watch_state();
        manager.connect().unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            watch.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
            watch.wait_for(|s| *s == ConnectionState::Disconnected).await.unwrap();
        })
        .await
        .unwrap();

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
        server.abort();
    }

    #[test]
    fn rejects_invalid_endpoints() {
        let manager = TransportManager::new(TransportConfig {
            host: "bad host".to_string(),
            ..TransportConfig::default()
        });
        assert!(matches!(manager.connect(), Err(TransportError::InvalidEndpoint(_, _))));
    }
}
