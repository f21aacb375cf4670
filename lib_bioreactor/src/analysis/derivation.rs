//! # Metric Derivation Engine
//!
//! Stateful transform from one validated [`RawFrame`] plus the rolling DO
//! history into a [`DerivedMetrics`] record.
//!
//! ## Drop and recovery tracking
//!
//! The engine moves between three phases:
//!
//! - **Stable**: no drop in progress. A drop is confirmed once at least
//!   `drop_confirm_samples` consecutive samples each read lower than the one
//!   before, with a cumulative decrease above `stability_threshold`. The first
//!   sample of that run is the drop start and its DO is the pre-drop baseline.
//! - **Dropping**: DO keeps falling. Every time a full stability window has
//!   elapsed since the last emission, one `drop_rate` (least-squares slope
//!   magnitude over that window) is emitted together with OUR and sOUR. When DO
//!   climbs more than `stability_threshold` above the lowest reading, the drop
//!   ends and the remaining partial window up to the lowest reading is emitted.
//! - **Recovering**: waiting for DO to reach `recovery_threshold × baseline`.
//!   The first sample at or above it emits `recovery_time`, measured from the
//!   drop start. A new drop confirmed while recovering keeps the original
//!   baseline and start.
//!
//! Nothing is detected before one full analysis window of history exists.

use chrono::{DateTime, Duration, Utc};

use crate::analysis::window::{span_seconds, SampleWindow};
use crate::configs::AnalysisConfig;
use crate::errors::DerivationError;
use crate::models::{DerivedMetrics, RawFrame, SensorSnapshot};

/// Coarse phase of the drop/recovery tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPhase {
    Stable,
    Dropping,
    Recovering,
}

#[derive(Debug, Clone, Copy)]
struct DecreaseRun {
    start_ts: DateTime<Utc>,
    start_do: f64,
    steps: usize,
}

#[derive(Debug, Clone, Copy)]
struct ActiveDrop {
    start_ts: DateTime<Utc>,
    baseline: f64,
    /// Start of the stability window not yet covered by an emission.
    anchor_ts: DateTime<Utc>,
    nadir: f64,
    nadir_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Stable,
    Dropping(ActiveDrop),
    Recovering { start_ts: DateTime<Utc>, baseline: f64 },
}

pub struct MetricEngine {
    config: AnalysisConfig,
    window: SampleWindow<f64>,
    first_ts: Option<DateTime<Utc>>,
    last: Option<(DateTime<Utc>, f64)>,
    run: Option<DecreaseRun>,
    phase: Phase,
}

impl MetricEngine {
    /// The config is expected to be validated already.
    pub fn new(config: AnalysisConfig) -> Self {
        let span_secs = config
            .analysis_window_seconds
            .max(config.stability_window_seconds);
        Self {
            window: SampleWindow::new(span_seconds(span_secs)),
            config,
            first_ts: None,
            last: None,
            run: None,
            phase: Phase::Stable,
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn phase(&self) -> DropPhase {
        match self.phase {
            Phase::Stable => DropPhase::Stable,
            Phase::Dropping(_) => DropPhase::Dropping,
            Phase::Recovering { .. } => DropPhase::Recovering,
        }
    }

    /// Span of samples currently held.
    pub fn retained(&self) -> Duration {
        self.window.covered()
    }

    /// Maximum span the engine will ever hold.
    pub fn retention_span(&self) -> Duration {
        self.window.span()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last.map(|(ts, _)| ts)
    }

    /// Forgets all history, e.g. after a long source outage.
    pub fn reset(&mut self) {
        self.window.clear();
        self.first_ts = None;
        self.last = None;
        self.run = None;
        self.phase = Phase::Stable;
    }

    /// Derives metrics for one frame. An invalid or out-of-order frame is
    /// rejected without touching the engine state.
    pub fn process(&mut self, frame: &RawFrame) -> Result<DerivedMetrics, DerivationError> {
        let snapshot = frame.validate()?;
        if let Some((last_ts, _)) = self.last {
            if snapshot.timestamp < last_ts {
                return Err(DerivationError::OutOfOrder {
                    timestamp: snapshot.timestamp.to_rfc3339(),
                    last: last_ts.to_rfc3339(),
                });
            }
        }
        self.process_snapshot(&snapshot)
    }

    fn process_snapshot(&mut self, snap: &SensorSnapshot) -> Result<DerivedMetrics, DerivationError> {
        let ts = snap.timestamp;
        let dissolved = snap.do_ppm;

        let raw_saturation = dissolved / self.config.max_do_ppm * 100.0;
        if !raw_saturation.is_finite() {
            return Err(DerivationError::NonFinite("do_saturation"));
        }
        let do_saturation = raw_saturation.clamp(0.0, 100.0);
        let saturation_clamped = do_saturation != raw_saturation;
        if saturation_clamped {
            log::warn!(
                "DO saturation {:.2}% at {} outside [0, 100], clamped to {:.0}%",
                raw_saturation,
                ts,
                do_saturation
            );
        }

        self.window.push(ts, dissolved);
        let first_ts = *self.first_ts.get_or_insert(ts);
        let window_ready =
            ts - first_ts >= span_seconds(self.config.analysis_window_seconds);

        self.track_run(dissolved);
        self.last = Some((ts, dissolved));

        let mut drop_window: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
        let mut recovery_time = None;

        if window_ready {
            if let Some(run) = self.confirmed_run(dissolved) {
                match self.phase {
                    Phase::Stable => {
                        log::info!(
                            "DO drop detected at {}: baseline {:.2} ppm, started {}",
                            ts,
                            run.start_do,
                            run.start_ts
                        );
                        self.phase = Phase::Dropping(ActiveDrop {
                            start_ts: run.start_ts,
                            baseline: run.start_do,
                            anchor_ts: run.start_ts,
                            nadir: dissolved,
                            nadir_ts: ts,
                        });
                    }
                    Phase::Recovering { start_ts, baseline } => {
                        log::info!(
                            "DO dropped again at {} before recovering; keeping baseline {:.2} ppm",
                            ts,
                            baseline
                        );
                        self.phase = Phase::Dropping(ActiveDrop {
                            start_ts,
                            baseline,
                            anchor_ts: run.start_ts,
                            nadir: dissolved,
                            nadir_ts: ts,
                        });
                    }
                    Phase::Dropping(_) => {}
                }
            }

            if let Phase::Dropping(mut drop) = self.phase {
                if dissolved < drop.nadir {
                    drop.nadir = dissolved;
                    drop.nadir_ts = ts;
                }
                if dissolved > drop.nadir + self.config.stability_threshold {
                    if drop.nadir_ts > drop.anchor_ts {
                        drop_window = Some((drop.anchor_ts, drop.nadir_ts));
                    }
                    log::info!(
                        "DO drop ended at {}: lowest {:.2} ppm at {}",
                        ts,
                        drop.nadir,
                        drop.nadir_ts
                    );
                    self.phase = Phase::Recovering {
                        start_ts: drop.start_ts,
                        baseline: drop.baseline,
                    };
                } else {
                    let stability = span_seconds(self.config.stability_window_seconds);
                    if ts - drop.anchor_ts >= stability {
                        drop_window = Some((drop.anchor_ts, ts));
                        drop.anchor_ts = ts;
                    }
                    self.phase = Phase::Dropping(drop);
                }
            }

            if let Phase::Recovering { start_ts, baseline } = self.phase {
                if dissolved >= self.config.recovery_threshold * baseline {
                    let elapsed = (ts - start_ts).num_milliseconds() as f64 / 1000.0;
                    log::info!(
                        "DO recovered to {:.2} ppm at {}, {:.1}s after drop start",
                        dissolved,
                        ts,
                        elapsed
                    );
                    recovery_time = Some(elapsed);
                    self.phase = Phase::Stable;
                }
            }
        }

        let (drop_rate, our, sour) = match drop_window {
            Some((from, to)) => match self.drop_rate_between(from, to) {
                Some(rate) => {
                    let (our, sour) = self.uptake_rates(rate)?;
                    (Some(rate), Some(our), Some(sour))
                }
                None => (None, None, None),
            },
            None => (None, None, None),
        };

        Ok(DerivedMetrics {
            timestamp: ts,
            do_saturation,
            saturation_clamped,
            drop_rate,
            recovery_time,
            recovery_pending: !matches!(self.phase, Phase::Stable),
            our,
            sour,
            ph: snap.ph,
            temperature: snap.do_temperature,
            window_ready,
        })
    }

    fn track_run(&mut self, dissolved: f64) {
        match self.last {
            Some((prev_ts, prev_do)) if dissolved < prev_do => {
                let run = self.run.get_or_insert(DecreaseRun {
                    start_ts: prev_ts,
                    start_do: prev_do,
                    steps: 0,
                });
                run.steps += 1;
            }
            _ => self.run = None,
        }
    }

    fn confirmed_run(&self, dissolved: f64) -> Option<DecreaseRun> {
        self.run.filter(|run| {
            run.steps >= self.config.drop_confirm_samples
                && run.start_do - dissolved > self.config.stability_threshold
        })
    }

    /// Least-squares slope magnitude (ppm/s) of the samples in `[from, to]`.
    fn drop_rate_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Option<f64> {
        let points: Vec<(f64, f64)> = self
            .window
            .since(from)
            .take_while(|(ts, _)| *ts <= to)
            .map(|(ts, v)| ((*ts - from).num_milliseconds() as f64 / 1000.0, *v))
            .collect();
        let slope = least_squares_slope(&points)?;
        Some((-slope).max(0.0))
    }

    fn uptake_rates(&self, drop_rate: f64) -> Result<(f64, f64), DerivationError> {
        let our = drop_rate * self.config.kla * self.config.reactor_volume_l;
        if !our.is_finite() {
            return Err(DerivationError::NonFinite("our"));
        }
        let sour = our / self.config.biomass_density;
        if !sour.is_finite() {
            return Err(DerivationError::NonFinite("sour"));
        }
        Ok((our, sour))
    }
}

/// Ordinary least-squares slope of `(x, y)` points. `None` with fewer than two
/// points or no spread in `x`.
pub fn least_squares_slope(points: &[(f64, f64)]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let (mut num, mut den) = (0.0, 0.0);
    for (x, y) in points {
        num += (x - mean_x) * (y - mean_y);
        den += (x - mean_x) * (x - mean_x);
    }
    if den == 0.0 {
        return None;
    }
    let slope = num / den;
    slope.is_finite().then_some(slope)
}
