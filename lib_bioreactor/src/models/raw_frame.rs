//! # Raw Sensor Frame
//!
//! The immutable snapshot delivered by the telemetry source once per sample
//! interval. Every sensor channel is optional on the wire so that a partially
//! populated payload still parses; [`RawFrame::validate`] decides whether the
//! frame is usable for derivation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DerivationError;

/// Setpoint / process-value pair of one mass flow controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowReading {
    pub setpoint: f64,
    pub process_value: f64,
}

/// Peristaltic feed pump telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PumpTelemetry {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub on_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub off_at: Option<DateTime<Utc>>,
}

/// One raw telemetry snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    /// Capture time at the source.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub flow_controllers: Vec<FlowReading>,
    /// Dissolved oxygen concentration (PPM).
    #[serde(default)]
    pub do_ppm: Option<f64>,
    /// DO sensor temperature (°C).
    #[serde(default)]
    pub do_temperature: Option<f64>,
    #[serde(default)]
    pub ph: Option<f64>,
    /// pH sensor temperature (°C).
    #[serde(default)]
    pub ph_temperature: Option<f64>,
    /// Reactor balance (kg).
    #[serde(default)]
    pub reactor_weight: Option<f64>,
    /// Control feed bottle balance (kg).
    #[serde(default)]
    pub control_bottle_weight: Option<f64>,
    /// Experimental feed bottle balance (kg).
    #[serde(default)]
    pub experimental_bottle_weight: Option<f64>,
    #[serde(default)]
    pub pump: Option<PumpTelemetry>,
    #[serde(default)]
    pub agitation_rpm: Option<f64>,
    #[serde(default)]
    pub torque: Option<f64>,
}

/// The channels the derivation engine needs, guaranteed present and finite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSnapshot {
    pub timestamp: DateTime<Utc>,
    pub do_ppm: f64,
    pub do_temperature: f64,
    pub ph: f64,
    pub reactor_weight: f64,
    pub control_bottle_weight: f64,
    pub experimental_bottle_weight: f64,
}

impl RawFrame {
    /// An empty frame captured at `timestamp`; populate it with the `with_*` setters.
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            flow_controllers: Vec::new(),
            do_ppm: None,
            do_temperature: None,
            ph: None,
            ph_temperature: None,
            reactor_weight: None,
            control_bottle_weight: None,
            experimental_bottle_weight: None,
            pump: None,
            agitation_rpm: None,
            torque: None,
        }
    }

    pub fn with_do(mut self, ppm: f64, temperature: f64) -> Self {
        self.do_ppm = Some(ppm);
        self.do_temperature = Some(temperature);
        self
    }

    pub fn with_ph(mut self, ph: f64, temperature: f64) -> Self {
        self.ph = Some(ph);
        self.ph_temperature = Some(temperature);
        self
    }

    pub fn with_weights(mut self, reactor: f64, control_bottle: f64, experimental_bottle: f64) -> Self {
        self.reactor_weight = Some(reactor);
        self.control_bottle_weight = Some(control_bottle);
        self.experimental_bottle_weight = Some(experimental_bottle);
        self
    }

    pub fn with_flow_controller(mut self, setpoint: f64, process_value: f64) -> Self {
        self.flow_controllers.push(FlowReading { setpoint, process_value });
        self
    }

    pub fn with_agitation(mut self, rpm: f64, torque: f64) -> Self {
        self.agitation_rpm = Some(rpm);
        self.torque = Some(torque);
        self
    }

    /// Checks that every required channel is present and finite, and that any
    /// optional channel that is present is finite.
    pub fn validate(&self) -> Result<SensorSnapshot, DerivationError> {
        let required = |name: &str, value: Option<f64>| -> Result<f64, DerivationError> {
            match value {
                None => Err(self.invalid(format!("missing {}", name))),
                Some(v) if !v.is_finite() => Err(self.invalid(format!("{} is not finite", name))),
                Some(v) => Ok(v),
            }
        };

        let snapshot = SensorSnapshot {
            timestamp: self.timestamp,
            do_ppm: required("do_ppm", self.do_ppm)?,
            do_temperature: required("do_temperature", self.do_temperature)?,
            ph: required("ph", self.ph)?,
            reactor_weight: required("reactor_weight", self.reactor_weight)?,
            control_bottle_weight: required("control_bottle_weight", self.control_bottle_weight)?,
            experimental_bottle_weight: required(
                "experimental_bottle_weight",
                self.experimental_bottle_weight,
            )?,
        };

        let optional = [
            ("ph_temperature", self.ph_temperature),
            ("agitation_rpm", self.agitation_rpm),
            ("torque", self.torque),
        ];
        for (name, value) in optional {
            if matches!(value, Some(v) if !v.is_finite()) {
                return Err(self.invalid(format!("{} is not finite", name)));
            }
        }
        for (idx, mfc) in self.flow_controllers.iter().enumerate() {
            if !mfc.setpoint.is_finite() || !mfc.process_value.is_finite() {
                return Err(self.invalid(format!("flow controller {} is not finite", idx + 1)));
            }
        }

        Ok(snapshot)
    }

    fn invalid(&self, reason: String) -> DerivationError {
        DerivationError::InvalidSample {
            timestamp: self.timestamp.to_rfc3339(),
            reason,
        }
    }
}
