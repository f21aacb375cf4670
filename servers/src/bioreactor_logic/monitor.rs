use std::time::Duration;

use lib_bioreactor::models::ConnectionState;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::bioreactor_logic::config::ServerSettings;
use crate::bioreactor_logic::state::AppState;

/// Outcome of one dataflow check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dataflow {
    Flowing,
    /// No frame processed for longer than the threshold (or ever).
    Stalled,
}

pub fn check_dataflow(since_last_frame: Option<Duration>, uptime: Duration, threshold: Duration) -> Dataflow {
    match since_last_frame {
        Some(idle) if idle > threshold => Dataflow::Stalled,
        Some(_) => Dataflow::Flowing,
        None if uptime > threshold => Dataflow::Stalled,
        None => Dataflow::Flowing,
    }
}

pub async fn run(settings: ServerSettings, app_state: AppState, shutdown: CancellationToken) {
    let mut check_interval = interval(Duration::from_secs(settings.dataflow_check_interval_seconds));
    let threshold = Duration::from_secs(settings.dataflow_inactivity_threshold_seconds);
    let started = tokio::time::Instant::now();
    let mut stalled = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("Monitor service received shutdown signal.");
                break;
            }
            _ = check_interval.tick() => {
                let state = app_state.transport.state();
                match check_dataflow(app_state.pipeline.since_last_frame(), started.elapsed(), threshold) {
                    Dataflow::Stalled if !stalled => {
                        stalled = true;
                        log::warn!(
                            "No frames processed for {} seconds (source {:?}, {} attempts).",
                            settings.dataflow_inactivity_threshold_seconds,
                            state,
                            app_state.transport.attempts()
                        );
                        if state == ConnectionState::Disconnected {
                            log::warn!("Telemetry source is down; serving last known metrics as unavailable.");
                        }
                    }
                    Dataflow::Flowing if stalled => {
                        stalled = false;
                        log::info!("Dataflow resumed.");
                    }
                    _ => {}
                }
                let stats = app_state.pipeline.stats();
                log::debug!(
                    "Pipeline: {} processed, {} rejected, {} dropped, {} feeds, upstream {}",
                    stats.frames_processed,
                    stats.frames_rejected,
                    stats.backlog_drops,
                    stats.feed_events,
                    if app_state.persistence.upstream.is_available() { "up" } else { "down" }
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stalls_only_past_the_threshold() {
        let threshold = Duration::from_secs(60);
        let early = Duration::from_secs(5);
        let late = Duration::from_secs(90);
        assert_eq!(check_dataflow(Some(early), late, threshold), Dataflow::Flowing);
        assert_eq!(check_dataflow(Some(late), late, threshold), Dataflow::Stalled);
        assert_eq!(check_dataflow(None, early, threshold), Dataflow::Flowing);
        assert_eq!(check_dataflow(None, late, threshold), Dataflow::Stalled);
    }
}
