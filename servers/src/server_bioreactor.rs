use std::sync::Arc;

use anyhow::{Context, Result};
use lib_bioreactor::analysis::{FeedDetector, MetricEngine};
use lib_bioreactor::configs::SharedFeedSettings;
use lib_bioreactor::connections::PersistenceLayer;
use lib_bioreactor::core::{Dispatcher, MetricsPipeline, TransportManager};
use lib_bioreactor::loggers::setup_logging;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod bioreactor_logic;
use bioreactor_logic::{config, downstream, monitor, state};

const APP_NAME: &str = "server_bioreactor";

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    let _ = dotenvy::dotenv();

    let config = config::load_config()?;
    let logging = &config.pipeline.logging;
    let log_file = setup_logging(&logging.log_dir, &logging.log_level, APP_NAME)
        .context("Failed to set up logging")?;
    log::info!("Logging to {}", log_file.display());

    let shutdown = CancellationToken::new();

    let persistence = PersistenceLayer::connect(&config.pipeline.database, shutdown.child_token())
        .await
        .context("Failed to open the persistence layer")?;

    let settings = match persistence.local.get_feed_settings().await {
        Some(stored) => SharedFeedSettings::new(stored).context("Stored feed settings are invalid")?,
        None => {
            log::info!("No feed settings stored; seeding from configuration");
            persistence
                .local
                .save_feed_settings(&config.feed_settings)
                .await
                .context("Failed to seed feed settings")?;
            SharedFeedSettings::new(config.feed_settings.clone())?
        }
    };
    let history = persistence.local.feed_events(None, None, None).await;
    log::info!("Loaded {} feed events from the local store", history.len());

    let transport = Arc::new(TransportManager::new(config.pipeline.transport.clone()));
    let bus = Arc::new(Dispatcher::new("publication_bus", config.pipeline.analysis.backlog_capacity));
    let pipeline = MetricsPipeline::new(
        MetricEngine::new(config.pipeline.analysis.clone()),
        FeedDetector::new(config.pipeline.feed_detection.clone(), config.pipeline.feed_volume),
        Arc::clone(&bus),
        persistence.local.clone(),
        settings,
    )
    .with_feed_history(history);

    let persistence = Arc::new(persistence);
    let app_state = state::AppState::new(
        config.pipeline.clone(),
        pipeline.handle(),
        Arc::clone(&transport),
        Arc::clone(&persistence),
    );

    let frames = transport.subscribe("metrics_pipeline");
    let pipeline_handle = tokio::spawn(pipeline.run(frames, shutdown.child_token()));
    transport.connect().context("Failed to start the telemetry transport")?;

    let monitor_handle = tokio::spawn(monitor::run(
        config.server.clone(),
        app_state.clone(),
        shutdown.child_token(),
    ));
    let downstream_handle = tokio::spawn(downstream::run(
        config.server.host.clone(),
        config.server.port,
        app_state,
        shutdown.child_token(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }

    shutdown.cancel();
    transport.disconnect().await;
    bus.close();

    let (pipeline_result, monitor_result, downstream_result) =
        tokio::join!(pipeline_handle, monitor_handle, downstream_handle);
    match pipeline_result {
        Ok(stats) => log::info!("Pipeline totals: {:?}", stats),
        Err(e) => log::error!("Pipeline task failed: {}", e),
    }
    if let Err(e) = monitor_result {
        log::error!("Monitor task failed: {}", e);
    }
    match downstream_result {
        Ok(Err(e)) => log::error!("{:#}", e),
        Err(e) => log::error!("Downstream task failed: {}", e),
        Ok(Ok(())) => {}
    }

    persistence.close().await;
    log::info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            log::error!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    // On non-unix platforms, just wait forever.
    std::future::pending::<()>().await;
}
