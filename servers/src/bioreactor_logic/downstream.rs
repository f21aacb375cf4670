use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::StreamExt;
use chrono::Utc;
use lib_bioreactor::analysis::feed_stats::{carbon_mol, carbon_oxygen_ratio};
use lib_bioreactor::analysis::{FeedStatistics, ManualFeedEntry, ReplaySeries, derive_series};
use lib_bioreactor::connections::{Fetched, parse_iso};
use lib_bioreactor::core::{Delivery, LatestMetrics, PipelineStats};
use lib_bioreactor::models::{
    ConnectionState, DerivedMetrics, FeedEvent, FeedParameters, FeedSettings, FeedType, RawFrame,
};
use lib_bioreactor::{DerivationError, FeedEventError, PersistenceError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::bioreactor_logic::state::AppState;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Derivation(#[from] DerivationError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Feed(#[from] FeedEventError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Derivation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Feed(_) => StatusCode::BAD_REQUEST,
            AppError::Persistence(PersistenceError::InvalidTimestamp(_)) => StatusCode::BAD_REQUEST,
            AppError::Persistence(PersistenceError::Config(_)) => StatusCode::BAD_REQUEST,
            AppError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        } else {
            log::warn!("Request rejected: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/metrics/latest", get(latest_metrics))
        .route("/api/data/historical", get(historical_data))
        .route("/api/data/latest", get(latest_frame))
        .route("/api/feed/settings", get(get_feed_settings).post(post_feed_settings))
        .route("/api/feed/parameters", get(get_feed_parameters).post(post_feed_parameters))
        .route("/api/feed/events", get(get_feed_events).post(post_feed_event))
        .route("/api/feed/events/{id}/carbon_oxygen_ratio", get(feed_carbon_oxygen_ratio))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(host: String, port: u16, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    log::info!("Downstream server listening on {}", addr);

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            log::info!("Downstream server shutting down.");
        })
        .await
        .context("Downstream server failed")
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    source: ConnectionState,
    upstream_available: bool,
    stats: PipelineStats,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthReport {
        status: "ok",
        source: state.transport.state(),
        upstream_available: state.persistence.upstream.is_available(),
        stats: state.pipeline.stats(),
    })
}

#[derive(Debug, Serialize)]
struct LatestReport {
    #[serde(flatten)]
    latest: LatestMetrics,
    source: ConnectionState,
}

async fn latest_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(LatestReport {
        latest: state.pipeline.latest(),
        source: state.transport.state(),
    })
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Serialize)]
pub struct HistoricalData {
    /// Whether the upstream store answered. When it did not, `raw` is empty
    /// and `derived` comes from the locally stored series.
    pub available: bool,
    pub raw: Vec<RawFrame>,
    pub derived: Vec<DerivedMetrics>,
    pub feed_events: Vec<FeedEvent>,
    pub rejected: usize,
}

async fn historical_data(
    State(state): State<AppState>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<HistoricalData>, AppError> {
    let start = parse_iso(&range.start_time)?;
    let end = parse_iso(&range.end_time)?;
    let fetched = state
        .persistence
        .upstream
        .fetch_range(&range.start_time, &range.end_time)
        .await?;

    let data = match fetched {
        Fetched::Available(raw) => {
            let ReplaySeries {
                metrics,
                feed_events,
                rejected,
            } = derive_series(&raw, &state.config);
            HistoricalData {
                available: true,
                raw,
                derived: metrics,
                feed_events,
                rejected,
            }
        }
        Fetched::Unavailable => HistoricalData {
            available: false,
            raw: Vec::new(),
            derived: state.persistence.local.metrics_range(start, end).await,
            feed_events: state.persistence.local.feed_events(Some(start), Some(end), None).await,
            rejected: 0,
        },
    };
    Ok(Json(data))
}

#[derive(Debug, Serialize)]
pub struct LatestFrame {
    pub available: bool,
    pub frame: Option<RawFrame>,
}

/// Most recent raw frame in the upstream process store.
async fn latest_frame(State(state): State<AppState>) -> Json<LatestFrame> {
    let latest = match state.persistence.upstream.fetch_latest().await {
        Fetched::Available(frame) => LatestFrame { available: true, frame },
        Fetched::Unavailable => LatestFrame {
            available: false,
            frame: None,
        },
    };
    Json(latest)
}

async fn get_feed_settings(State(state): State<AppState>) -> Json<FeedSettings> {
    Json((*state.pipeline.settings().get()).clone())
}

async fn post_feed_settings(
    State(state): State<AppState>,
    Json(document): Json<Value>,
) -> Result<Json<Value>, AppError> {
    state.persistence.local.save_feed_settings_json(&document).await?;
    let settings = state.pipeline.settings().reload(&state.persistence.local).await?;
    log::info!("Feed settings updated");
    Ok(Json(json!({ "message": "Settings updated successfully", "settings": settings })))
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedEventsQuery {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub feed_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FeedEventsReport {
    pub events: Vec<FeedEvent>,
    pub statistics: FeedStatistics,
}

async fn get_feed_events(
    State(state): State<AppState>,
    Query(query): Query<FeedEventsQuery>,
) -> Result<Json<FeedEventsReport>, AppError> {
    let start = query.start_time.as_deref().map(parse_iso).transpose()?;
    let end = query.end_time.as_deref().map(parse_iso).transpose()?;
    let feed_type = query
        .feed_type
        .as_deref()
        .map(str::parse::<FeedType>)
        .transpose()?;
    let events = state.persistence.local.feed_events(start, end, feed_type).await;
    let statistics = FeedStatistics::from_events(&events);
    Ok(Json(FeedEventsReport { events, statistics }))
}

async fn post_feed_event(
    State(state): State<AppState>,
    Json(entry): Json<ManualFeedEntry>,
) -> Result<(StatusCode, Json<FeedEvent>), AppError> {
    let event = state.pipeline.record_manual_feed(entry).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

#[derive(Debug, Serialize)]
pub struct FeedParametersReport {
    pub control: Option<FeedParameters>,
    pub experimental: Option<FeedParameters>,
}

async fn get_feed_parameters(State(state): State<AppState>) -> Json<FeedParametersReport> {
    let local = &state.persistence.local;
    Json(FeedParametersReport {
        control: local.latest_feed_parameters(FeedType::Control).await,
        experimental: local.latest_feed_parameters(FeedType::Experimental).await,
    })
}

#[derive(Debug, Deserialize)]
pub struct FeedParametersEntry {
    pub feed_type: String,
    pub toc_value: Option<f64>,
    pub glucose_concentration: Option<f64>,
}

async fn post_feed_parameters(
    State(state): State<AppState>,
    Json(entry): Json<FeedParametersEntry>,
) -> Result<(StatusCode, Json<FeedParameters>), AppError> {
    let feed_type: FeedType = entry.feed_type.parse()?;
    for (name, value) in [("toc_value", entry.toc_value), ("glucose_concentration", entry.glucose_concentration)] {
        if let Some(v) = value {
            if !v.is_finite() || v < 0.0 {
                return Err(AppError::BadRequest(format!("{} must be a non-negative number", name)));
            }
        }
    }
    let params = FeedParameters {
        feed_type,
        toc_value: entry.toc_value,
        glucose_concentration: entry.glucose_concentration,
        recorded_at: Utc::now(),
    };
    state.persistence.local.save_feed_parameters(&params).await?;
    log::info!("Feed parameters recorded for {} feed", feed_type);
    Ok((StatusCode::CREATED, Json(params)))
}

#[derive(Debug, Deserialize)]
pub struct OxygenQuery {
    /// Oxygen consumed over the feed's response, in mol.
    pub oxygen_consumed_mol: f64,
}

#[derive(Debug, Serialize)]
pub struct CarbonOxygenReport {
    pub event: FeedEvent,
    pub carbon_mol: f64,
    pub oxygen_consumed_mol: f64,
    pub ratio: f64,
}

/// Molar C:O ratio of one stored feed event under the current feed settings.
async fn feed_carbon_oxygen_ratio(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<OxygenQuery>,
) -> Result<Json<CarbonOxygenReport>, AppError> {
    if !query.oxygen_consumed_mol.is_finite() {
        return Err(AppError::BadRequest("oxygen_consumed_mol must be a finite number".to_string()));
    }
    let event = state
        .persistence
        .local
        .feed_events(None, None, None)
        .await
        .into_iter()
        .find(|e| e.id.to_string() == id)
        .ok_or_else(|| AppError::NotFound(format!("No feed event with id {}", id)))?;
    let settings = state.pipeline.settings().get();
    let ratio = carbon_oxygen_ratio(&event, &settings, query.oxygen_consumed_mol)?;
    Ok(Json(CarbonOxygenReport {
        carbon_mol: carbon_mol(&event, &settings),
        oxygen_consumed_mol: query.oxygen_consumed_mol,
        ratio,
        event,
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let bus = state.pipeline.bus();
    let mut events = bus.subscribe(format!("ws-client-{}", client_id));
    log::info!("Client {} connected", client_id);

    loop {
        tokio::select! {
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
            delivery = events.recv() => {
                match delivery {
                    Delivery::Item(event) => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Delivery::Dropped(n) => log::debug!("Client {} skipped {} events", client_id, n),
                    Delivery::Closed => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    log::info!("Client {} disconnected", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use lib_bioreactor::analysis::{FeedDetector, MetricEngine};
    use lib_bioreactor::configs::{DatabaseConfig, PipelineConfig, SharedFeedSettings};
    use lib_bioreactor::connections::PersistenceLayer;
    use lib_bioreactor::core::{Dispatcher, MetricsPipeline, TransportManager};

    async fn app_state(dir: &tempfile::TempDir) -> AppState {
        let config = PipelineConfig {
            database: DatabaseConfig {
                local_path: dir.path().join("bio.db"),
                ..DatabaseConfig::default()
            },
            ..PipelineConfig::default()
        };
        let persistence = PersistenceLayer::connect(&config.database, CancellationToken::new())
            .await
            .unwrap();
        let pipeline = MetricsPipeline::new(
            MetricEngine::new(config.analysis.clone()),
            FeedDetector::new(config.feed_detection.clone(), config.feed_volume),
            Arc::new(Dispatcher::new("bus", 16)),
            persistence.local.clone(),
            SharedFeedSettings::default(),
        );
        AppState::new(
            config.clone(),
            pipeline.handle(),
            Arc::new(TransportManager::new(config.transport.clone())),
            Arc::new(persistence),
        )
    }

    fn settings_document() -> Value {
        json!({
            "control_feed": { "glucose_concentration": 450.0, "default_volume": 0.1 },
            "experimental_feed": { "toc_concentration": 18.0, "default_volume": 0.05 }
        })
    }

    #[tokio::test]
    async fn feed_settings_are_validated_stored_and_served() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(&dir).await;

        let bad = json!({ "control_feed": {} });
        let response = post_feed_settings(State(state.clone()), Json(bad)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        post_feed_settings(State(state.clone()), Json(settings_document()))
            .await
            .unwrap();
        let Json(served) = get_feed_settings(State(state.clone())).await;
        assert_eq!(served.control_feed.glucose_concentration, 450.0);
        assert_eq!(state.persistence.local.get_feed_settings().await, Some(served));
    }

    #[tokio::test]
    async fn manual_feed_events_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(&dir).await;

        let entry: ManualFeedEntry =
            serde_json::from_value(json!({ "feed_type": "control", "volume": 0.2, "operator": "lab" })).unwrap();
        let (status, Json(event)) = post_feed_event(State(state.clone()), Json(entry)).await.unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let unknown: ManualFeedEntry = serde_json::from_value(json!({ "feed_type": "glucose" })).unwrap();
        let response = post_feed_event(State(state.clone()), Json(unknown)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let Json(report) = get_feed_events(State(state.clone()), Query(FeedEventsQuery::default()))
            .await
            .unwrap();
        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].id, event.id);
        assert_eq!(report.statistics.total_control_volume, 0.2);
    }

    #[tokio::test]
    async fn feed_parameters_are_recorded_per_type() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(&dir).await;

        let Json(empty) = get_feed_parameters(State(state.clone())).await;
        assert!(empty.control.is_none() && empty.experimental.is_none());

        let entry = FeedParametersEntry {
            feed_type: "experimental".to_string(),
            toc_value: Some(18.5),
            glucose_concentration: None,
        };
        let (status, Json(saved)) = post_feed_parameters(State(state.clone()), Json(entry)).await.unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let negative = FeedParametersEntry {
            feed_type: "control".to_string(),
            toc_value: None,
            glucose_concentration: Some(-1.0),
        };
        let response = post_feed_parameters(State(state.clone()), Json(negative)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let unknown = FeedParametersEntry {
            feed_type: "glucose".to_string(),
            toc_value: Some(1.0),
            glucose_concentration: None,
        };
        let response = post_feed_parameters(State(state.clone()), Json(unknown)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let Json(report) = get_feed_parameters(State(state)).await;
        assert!(report.control.is_none());
        let experimental = report.experimental.unwrap();
        assert_eq!(experimental.toc_value, Some(18.5));
        assert_eq!(experimental.feed_type, saved.feed_type);
    }

    #[tokio::test]
    async fn carbon_oxygen_ratio_uses_current_settings() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(&dir).await;
        post_feed_settings(State(state.clone()), Json(settings_document()))
            .await
            .unwrap();
        assert_eq!(state.pipeline.settings().get().control_feed.glucose_concentration, 450.0);

        let entry: ManualFeedEntry =
            serde_json::from_value(json!({ "feed_type": "control", "volume": 0.2 })).unwrap();
        let (_, Json(event)) = post_feed_event(State(state.clone()), Json(entry)).await.unwrap();

        let Json(report) = feed_carbon_oxygen_ratio(
            State(state.clone()),
            Path(event.id.to_string()),
            Query(OxygenQuery { oxygen_consumed_mol: 0.5 }),
        )
        .await
        .unwrap();
        let expected_carbon = 0.2 * 450.0 / 180.156 * 6.0;
        assert!((report.carbon_mol - expected_carbon).abs() < 1e-9);
        assert!((report.ratio - expected_carbon / 0.5).abs() < 1e-9);

        let response = feed_carbon_oxygen_ratio(
            State(state),
            Path("00000000-0000-0000-0000-000000000000".to_string()),
            Query(OxygenQuery { oxygen_consumed_mol: 0.5 }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn latest_frame_reports_missing_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(&dir).await;
        let Json(latest) = latest_frame(State(state)).await;
        assert!(!latest.available);
        assert!(latest.frame.is_none());
    }

    #[tokio::test]
    async fn historical_range_degrades_without_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(&dir).await;

        let range = RangeQuery {
            start_time: "2024-05-01T00:00:00Z".to_string(),
            end_time: "2024-05-01T01:00:00Z".to_string(),
        };
        let Json(data) = historical_data(State(state.clone()), Query(range)).await.unwrap();
        assert!(!data.available);
        assert!(data.raw.is_empty());
        assert!(data.derived.is_empty());

        let bad = RangeQuery {
            start_time: "yesterday".to_string(),
            end_time: "2024-05-01T01:00:00Z".to_string(),
        };
        let response = historical_data(State(state), Query(bad)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
