use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::policy::Alert;
use crate::reader::SensorSnapshot;

// ---------------------------------------------------------------------------
// Outbound message types
// ---------------------------------------------------------------------------

/// Full sensor snapshot; the same payload goes to every telemetry topic.
/// Field names and order are what the dashboards expect on the wire.
#[derive(Debug, Serialize)]
pub(crate) struct TelemetryMsg<'a> {
    pub(crate) thing: &'a str,
    pub(crate) timestamp: u64,
    pub(crate) temperatura: f64,
    pub(crate) humedad: f64,
    #[serde(rename = "humedadSuelo")]
    pub(crate) humedad_suelo: f64,
    pub(crate) luminosidad: f64,
}

impl<'a> TelemetryMsg<'a> {
    pub(crate) fn new(thing: &'a str, snapshot: &SensorSnapshot) -> Self {
        Self {
            thing,
            timestamp: snapshot.timestamp_ms(),
            temperatura: round2(snapshot.temperature()),
            humedad: round2(snapshot.humidity()),
            humedad_suelo: round2(snapshot.soil_moisture()),
            luminosidad: round2(snapshot.luminosity()),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct AlertEntry {
    #[serde(rename = "type")]
    pub(crate) kind: &'static str,
    pub(crate) severity: &'static str,
    pub(crate) message: &'static str,
    pub(crate) value: f64,
}

#[derive(Debug, Serialize)]
pub(crate) struct AlertMsg<'a> {
    pub(crate) thing: &'a str,
    pub(crate) timestamp: u64,
    pub(crate) alerts: Vec<AlertEntry>,
}

impl<'a> AlertMsg<'a> {
    pub(crate) fn new(thing: &'a str, timestamp: u64, alerts: &[Alert]) -> Self {
        Self {
            thing,
            timestamp,
            alerts: alerts
                .iter()
                .map(|a| AlertEntry {
                    kind: a.kind.as_str(),
                    severity: a.severity.as_str(),
                    message: a.message,
                    value: round2(a.value),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Status {
    Online,
    Offline,
}

#[derive(Debug, Serialize)]
pub(crate) struct StatusMsg<'a> {
    pub(crate) thing: &'a str,
    pub(crate) status: Status,
    pub(crate) timestamp: u64,
}

/// Round to two decimals for the wire.
fn round2(v: f32) -> f64 {
    (f64::from(v) * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Inbound command payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub(crate) enum CommandError {
    #[error("payload is not valid JSON: {0}")]
    Json(String),
    #[error("payload is not a JSON object")]
    NotObject,
    #[error("payload has neither \"state\" nor \"value\"")]
    MissingKey,
    #[error("\"value\" must be a boolean, got {0}")]
    InvalidValue(String),
}

/// Parse an actuator command into the requested on/off state.
///
/// Accepts `{"state": "on"|"ON"|"true"|"1"}` (anything else under `state`
/// means off) or `{"value": <bool>}`. `state` wins when both are present.
pub(crate) fn parse_command(payload: &[u8]) -> Result<bool, CommandError> {
    let doc: Value =
        serde_json::from_slice(payload).map_err(|e| CommandError::Json(e.to_string()))?;
    let obj = doc.as_object().ok_or(CommandError::NotObject)?;

    if let Some(state) = obj.get("state") {
        return Ok(match state {
            Value::String(s) => matches!(s.as_str(), "on" | "ON" | "true" | "1"),
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
            _ => false,
        });
    }

    match obj.get("value") {
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(CommandError::InvalidValue(other.to_string())),
        None => Err(CommandError::MissingKey),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AlertKind, Severity};

    // -- parse_command ------------------------------------------------------

    #[test]
    fn state_on_variants_mean_on() {
        for payload in [
            r#"{"state":"on"}"#,
            r#"{"state":"ON"}"#,
            r#"{"state":"true"}"#,
            r#"{"state":"1"}"#,
        ] {
            assert_eq!(parse_command(payload.as_bytes()), Ok(true), "{payload}");
        }
    }

    #[test]
    fn state_off_variants_mean_off() {
        for payload in [
            r#"{"state":"off"}"#,
            r#"{"state":"false"}"#,
            r#"{"state":"0"}"#,
            r#"{"state":"On"}"#,
        ] {
            assert_eq!(parse_command(payload.as_bytes()), Ok(false), "{payload}");
        }
    }

    #[test]
    fn state_accepts_non_string_scalars() {
        assert_eq!(parse_command(br#"{"state":true}"#), Ok(true));
        assert_eq!(parse_command(br#"{"state":1}"#), Ok(true));
        assert_eq!(parse_command(br#"{"state":false}"#), Ok(false));
        assert_eq!(parse_command(br#"{"state":null}"#), Ok(false));
    }

    #[test]
    fn numeric_state_is_truthy_when_nonzero() {
        assert_eq!(parse_command(br#"{"state":2}"#), Ok(true));
        assert_eq!(parse_command(br#"{"state":1.0}"#), Ok(true));
        assert_eq!(parse_command(br#"{"state":-1}"#), Ok(true));
        assert_eq!(parse_command(br#"{"state":0}"#), Ok(false));
        assert_eq!(parse_command(br#"{"state":0.0}"#), Ok(false));
        assert_eq!(parse_command(br#"{"state":[1]}"#), Ok(false));
    }

    #[test]
    fn value_bool_accepted() {
        assert_eq!(parse_command(br#"{"value":true}"#), Ok(true));
        assert_eq!(parse_command(br#"{"value":false}"#), Ok(false));
    }

    #[test]
    fn state_checked_before_value() {
        assert_eq!(parse_command(br#"{"value":true,"state":"off"}"#), Ok(false));
        assert_eq!(parse_command(br#"{"state":"on","value":false}"#), Ok(true));
    }

    #[test]
    fn value_must_be_bool() {
        assert!(matches!(
            parse_command(br#"{"value":"on"}"#),
            Err(CommandError::InvalidValue(_))
        ));
    }

    #[test]
    fn garbage_rejected() {
        assert!(matches!(parse_command(b"ON"), Err(CommandError::Json(_))));
        assert!(matches!(parse_command(b""), Err(CommandError::Json(_))));
    }

    #[test]
    fn non_object_rejected() {
        assert_eq!(parse_command(b"[1,2]"), Err(CommandError::NotObject));
        assert_eq!(parse_command(b"true"), Err(CommandError::NotObject));
    }

    #[test]
    fn missing_keys_rejected() {
        assert_eq!(parse_command(br#"{"on":true}"#), Err(CommandError::MissingKey));
    }

    // -- Outbound serialization ---------------------------------------------

    #[test]
    fn telemetry_keeps_wire_field_order() {
        let snap = SensorSnapshot::new(24.456, 65.0, 60.004, 50.5, 1234);
        let json = serde_json::to_string(&TelemetryMsg::new("invernadero-01", &snap)).unwrap();
        assert_eq!(
            json,
            r#"{"thing":"invernadero-01","timestamp":1234,"temperatura":24.46,"humedad":65.0,"humedadSuelo":60.0,"luminosidad":50.5}"#
        );
    }

    #[test]
    fn alert_message_shape() {
        let alerts = [Alert {
            kind: AlertKind::Temperature,
            severity: Severity::Critical,
            message: "Temperatura muy alta",
            value: 36.0,
        }];
        let json = serde_json::to_value(AlertMsg::new("gh", 99, &alerts)).unwrap();
        assert_eq!(json["thing"], "gh");
        assert_eq!(json["timestamp"], 99);
        let entry = &json["alerts"][0];
        assert_eq!(entry["type"], "temperatura");
        assert_eq!(entry["severity"], "critical");
        assert_eq!(entry["message"], "Temperatura muy alta");
        assert_eq!(entry["value"], 36.0);
        assert_eq!(entry.as_object().unwrap().len(), 4);
    }

    #[test]
    fn status_message_shape() {
        let msg = StatusMsg {
            thing: "gh",
            status: Status::Offline,
            timestamp: 5,
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"thing":"gh","status":"offline","timestamp":5}"#
        );
    }

    #[test]
    fn round2_keeps_two_decimals() {
        assert_eq!(round2(1.005_f32), 1.0); // 1.005f32 is 1.00499999...
        assert_eq!(round2(-3.456), -3.46);
        assert_eq!(round2(20.0), 20.0);
    }
}
