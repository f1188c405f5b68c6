//! Threshold policy: turns a sensor snapshot into alerts and autonomous
//! actuator changes.
//!
//! Rules are evaluated independently per channel:
//!
//! ```text
//! temperature < temp_min  → warning   (no actuation)
//! temperature > temp_max  → critical  + fan ON if off
//! soil        < soil_min  → warning   + pump ON if off
//! luminosity  < lux_min   → info      (no actuation)
//! ```
//!
//! Nothing here ever switches an actuator OFF; once auto-activated it stays on
//! until a remote command turns it off. Humidity and the upper soil/light
//! bounds carry no rule.

use crate::actuator::{ActuatorId, ActuatorState};
use crate::config::Thresholds;
use crate::reader::SensorSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AlertKind {
    Temperature,
    SoilMoisture,
    Luminosity,
}

impl AlertKind {
    /// Wire name of the alert category.
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            AlertKind::Temperature => "temperatura",
            AlertKind::SoilMoisture => "humedad_suelo",
            AlertKind::Luminosity => "luminosidad",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Alert {
    pub(crate) kind: AlertKind,
    pub(crate) severity: Severity,
    pub(crate) message: &'static str,
    /// Channel value that triggered the alert.
    pub(crate) value: f32,
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct Evaluation {
    pub(crate) alerts: Vec<Alert>,
    pub(crate) changes: Vec<(ActuatorId, bool)>,
}

pub(crate) struct PolicyEngine {
    thresholds: Thresholds,
}

impl PolicyEngine {
    pub(crate) fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    /// Pure function of `snapshot` and `actuators`: an actuator already on
    /// never appears in `changes`, so re-evaluating after applying the
    /// changes yields none.
    pub(crate) fn evaluate(&self, snapshot: &SensorSnapshot, actuators: &ActuatorState) -> Evaluation {
        let t = &self.thresholds;
        let mut out = Evaluation::default();

        let temperature = snapshot.temperature();
        if temperature < t.temp_min {
            out.alerts.push(Alert {
                kind: AlertKind::Temperature,
                severity: Severity::Warning,
                message: "Temperatura muy baja",
                value: temperature,
            });
        } else if temperature > t.temp_max {
            out.alerts.push(Alert {
                kind: AlertKind::Temperature,
                severity: Severity::Critical,
                message: "Temperatura muy alta",
                value: temperature,
            });
            switch_on(&mut out, actuators, ActuatorId::Fan);
        }

        let soil = snapshot.soil_moisture();
        if soil < t.soil_min {
            out.alerts.push(Alert {
                kind: AlertKind::SoilMoisture,
                severity: Severity::Warning,
                message: "Suelo muy seco",
                value: soil,
            });
            switch_on(&mut out, actuators, ActuatorId::Pump);
        }

        let luminosity = snapshot.luminosity();
        if luminosity < t.lux_min {
            out.alerts.push(Alert {
                kind: AlertKind::Luminosity,
                severity: Severity::Info,
                message: "Poca luz detectada",
                value: luminosity,
            });
        }

        out
    }
}

fn switch_on(out: &mut Evaluation, actuators: &ActuatorState, id: ActuatorId) {
    if !actuators.is_on(id) {
        out.changes.push((id, true));
    }
}

// ===========================================================================
// Tests
// ===========================================================================
