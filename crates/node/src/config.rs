//! TOML config file loading, environment overrides, and validation.
//!
//! Every field defaults to the value the deployed greenhouse nodes ship with,
//! so a missing or empty file yields a working (if unauthenticated) node.
//! Configuration is read once at startup; nothing here is reloaded.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub logging: LogConfig,
    pub mqtt: MqttConfig,
    pub topics: TopicConfig,
    pub sensors: SensorConfig,
    pub thresholds: Thresholds,
    pub relays: RelayConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device identity; published as `thing` in every outbound message.
    pub thing_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Fallback filter directive when `RUST_LOG` is unset.
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Defaults to the thing name when empty.
    pub client_id: String,
    pub keep_alive_s: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub max_packet_size: usize,
    pub ca_path: Option<String>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub temperature: String,
    pub humidity: String,
    pub soil_moisture: String,
    pub luminosity: String,
    pub status: String,
    pub alerts: String,
    pub fan: String,
    pub pump: String,
    pub lights: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub read_interval_ms: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    /// Largest accepted jump between consecutive temperature readings (°C).
    pub temp_spike: f32,
    /// Largest accepted jump between consecutive humidity readings (%).
    pub humidity_spike: f32,
    pub analog_samples: u32,
    pub analog_spacing_ms: u64,
    pub soil_channel: u8,
    pub light_channel: u8,
    pub soil_dry_raw: u16,
    pub soil_wet_raw: u16,
    pub light_dark_raw: u16,
    pub light_bright_raw: u16,
    /// I2C address of the ADS1115 (only used with the `adc` feature).
    pub adc_address: u16,
    /// sysfs directory of the kernel's DHT IIO device. When unset the
    /// simulated climate sensor is used.
    pub iio_device: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub temp_min: f32,
    pub temp_max: f32,
    pub humidity_min: f32,
    pub humidity_max: f32,
    pub soil_min: f32,
    pub soil_max: f32,
    pub lux_min: f32,
    pub lux_max: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub fan_pin: u8,
    pub pump_pin: u8,
    pub lights_pin: u8,
    pub status_led_pin: u8,
    /// Most relay boards switch on when the input is pulled LOW.
    pub active_low: bool,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            thing_name: "invernadero-01".into(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8883,
            client_id: String::new(),
            keep_alive_s: 60,
            connect_timeout_ms: 10_000,
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 5,
            max_packet_size: 512,
            ca_path: None,
            cert_path: None,
            key_path: None,
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            temperature: "invernadero/sensores/temperatura".into(),
            humidity: "invernadero/sensores/humedad".into(),
            soil_moisture: "invernadero/sensores/humedad-suelo".into(),
            luminosity: "invernadero/sensores/luminosidad".into(),
            status: "invernadero/estado".into(),
            alerts: "invernadero/alertas".into(),
            fan: "invernadero/actuadores/ventilador".into(),
            pump: "invernadero/actuadores/bomba".into(),
            lights: "invernadero/actuadores/luces".into(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            read_interval_ms: 30_000,
            retry_count: 3,
            retry_delay_ms: 2_000,
            temp_spike: 10.0,
            humidity_spike: 20.0,
            analog_samples: 10,
            analog_spacing_ms: 10,
            soil_channel: 0,
            light_channel: 1,
            soil_dry_raw: 3500,
            soil_wet_raw: 1200,
            light_dark_raw: 50,
            light_bright_raw: 3500,
            adc_address: 0x48,
            iio_device: None,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            temp_min: 15.0,
            temp_max: 35.0,
            humidity_min: 40.0,
            humidity_max: 80.0,
            soil_min: 30.0,
            soil_max: 80.0,
            lux_min: 20.0,
            lux_max: 100.0,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            fan_pin: 25,
            pump_pin: 26,
            lights_pin: 27,
            status_led_pin: 23,
            active_low: true,
        }
    }
}

impl MqttConfig {
    pub fn effective_client_id<'a>(&'a self, thing_name: &'a str) -> &'a str {
        if self.client_id.trim().is_empty() {
            thing_name
        } else {
            &self.client_id
        }
    }

    /// Paths of the mutual-TLS material as `(ca, cert, key)`, if configured.
    pub fn tls_paths(&self) -> Option<(&str, &str, &str)> {
        match (&self.ca_path, &self.cert_path, &self.key_path) {
            (Some(ca), Some(cert), Some(key)) => Some((ca.as_str(), cert.as_str(), key.as_str())),
            _ => None,
        }
    }
}

impl TopicConfig {
    /// Topics the node subscribes to for remote actuator commands.
    pub fn command_topics(&self) -> [&str; 3] {
        [&self.fan, &self.pump, &self.lights]
    }

    /// Topics the full telemetry payload is republished to.
    pub fn telemetry_topics(&self) -> [&str; 4] {
        [
            &self.temperature,
            &self.humidity,
            &self.soil_moisture,
            &self.luminosity,
        ]
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_identity(&mut errors);
        self.validate_mqtt(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_thresholds(&mut errors);
        self.validate_relays(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_identity(&self, errors: &mut Vec<String>) {
        if self.device.thing_name.trim().is_empty() {
            errors.push("device.thing_name is empty".into());
        }

        let t = &self.topics;
        let named = [
            ("temperature", &t.temperature),
            ("humidity", &t.humidity),
            ("soil_moisture", &t.soil_moisture),
            ("luminosity", &t.luminosity),
            ("status", &t.status),
            ("alerts", &t.alerts),
            ("fan", &t.fan),
            ("pump", &t.pump),
            ("lights", &t.lights),
        ];
        for (name, topic) in named {
            if topic.trim().is_empty() {
                errors.push(format!("topics.{name} is empty"));
            } else if topic.contains(['+', '#']) {
                errors.push(format!("topics.{name} '{topic}' must not contain wildcards"));
            }
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for topic in t.command_topics() {
            if !topic.is_empty() && !seen.insert(topic) {
                errors.push(format!("command topic '{topic}' is used by more than one actuator"));
            }
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if m.keep_alive_s == 0 {
            errors.push("mqtt.keep_alive_s must be positive".into());
        }
        if m.connect_timeout_ms == 0 {
            errors.push("mqtt.connect_timeout_ms must be positive".into());
        }
        if m.max_reconnect_attempts == 0 {
            errors.push("mqtt.max_reconnect_attempts must be positive".into());
        }
        if m.max_packet_size < 128 {
            errors.push(format!(
                "mqtt.max_packet_size {} is too small for a telemetry message (min 128)",
                m.max_packet_size
            ));
        }

        let given = [&m.ca_path, &m.cert_path, &m.key_path]
            .iter()
            .filter(|p| p.is_some())
            .count();
        if given != 0 && given != 3 {
            errors.push("mqtt TLS needs all of ca_path, cert_path and key_path (or none)".into());
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let s = &self.sensors;
        if s.read_interval_ms == 0 {
            errors.push("sensors.read_interval_ms must be positive".into());
        }
        if s.retry_count == 0 {
            errors.push("sensors.retry_count must be at least 1".into());
        }
        if s.analog_samples == 0 {
            errors.push("sensors.analog_samples must be at least 1".into());
        }
        if !(s.temp_spike > 0.0) {
            errors.push(format!("sensors.temp_spike must be positive, got {}", s.temp_spike));
        }
        if !(s.humidity_spike > 0.0) {
            errors.push(format!(
                "sensors.humidity_spike must be positive, got {}",
                s.humidity_spike
            ));
        }
        if !(0x03..=0x77).contains(&s.adc_address) {
            errors.push(format!(
                "sensors.adc_address {:#04x} is not a valid 7-bit I2C address",
                s.adc_address
            ));
        }
        for (name, channel) in [("soil_channel", s.soil_channel), ("light_channel", s.light_channel)] {
            if channel > crate::adc::MAX_CHANNEL {
                errors.push(format!(
                    "sensors.{name} {channel} out of range (0-{})",
                    crate::adc::MAX_CHANNEL
                ));
            }
        }
        if s.soil_channel == s.light_channel {
            errors.push(format!(
                "sensors.soil_channel and light_channel are both {}",
                s.soil_channel
            ));
        }
        if s.soil_dry_raw == s.soil_wet_raw {
            errors.push(format!(
                "sensors: soil_dry_raw and soil_wet_raw are both {}: calibration range is zero",
                s.soil_dry_raw
            ));
        }
        if s.light_dark_raw == s.light_bright_raw {
            errors.push(format!(
                "sensors: light_dark_raw and light_bright_raw are both {}: calibration range is zero",
                s.light_dark_raw
            ));
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let t = &self.thresholds;
        let percent = [
            ("humidity_min", t.humidity_min),
            ("humidity_max", t.humidity_max),
            ("soil_min", t.soil_min),
            ("soil_max", t.soil_max),
            ("lux_min", t.lux_min),
            ("lux_max", t.lux_max),
        ];
        for (name, value) in percent {
            if !(0.0..=100.0).contains(&value) {
                errors.push(format!("thresholds.{name} {value} out of range [0, 100]"));
            }
        }
        for (name, value) in [("temp_min", t.temp_min), ("temp_max", t.temp_max)] {
            if !(-40.0..=80.0).contains(&value) {
                errors.push(format!("thresholds.{name} {value} out of range [-40, 80]"));
            }
        }

        let pairs = [
            ("temp", t.temp_min, t.temp_max),
            ("humidity", t.humidity_min, t.humidity_max),
            ("soil", t.soil_min, t.soil_max),
            ("lux", t.lux_min, t.lux_max),
        ];
        for (name, min, max) in pairs {
            if min >= max {
                errors.push(format!(
                    "thresholds: {name}_max ({max}) must be greater than {name}_min ({min})"
                ));
            }
        }
    }

    fn validate_relays(&self, errors: &mut Vec<String>) {
        let r = &self.relays;
        let pins = [
            ("fan_pin", r.fan_pin),
            ("pump_pin", r.pump_pin),
            ("lights_pin", r.lights_pin),
            ("status_led_pin", r.status_led_pin),
        ];
        let mut seen: HashSet<u8> = HashSet::new();
        for (name, pin) in pins {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "relays.{name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen.insert(pin) {
                errors.push(format!("relays.{name} {pin} is already used by another output"));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Environment overrides
    // -----------------------------------------------------------------------

    /// Apply overrides from the environment. `lookup` is `std::env::var` in
    /// production; tests pass a map.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid MQTT_PORT: {port:?}"))?;
        }
        if let Some(thing) = lookup("THING_NAME") {
            self.device.thing_name = thing;
        }
        if let Some(ms) = lookup("SENSOR_INTERVAL_MS") {
            self.sensors.read_interval_ms = ms
                .trim()
                .parse()
                .with_context(|| format!("invalid SENSOR_INTERVAL_MS: {ms:?}"))?;
        }
        if let Some(v) = lookup("RELAY_ACTIVE_LOW") {
            self.relays.active_low = v == "1" || v.eq_ignore_ascii_case("true");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse a TOML config string, layer environment overrides on top, then
/// validate the result.
pub fn parse<F>(contents: &str, lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.apply_overrides(lookup)?;
    config.validate()?;
    Ok(config)
}

/// Read the config file at `path` (a missing file means all defaults), apply
/// environment overrides, and validate. Runs before logging is installed,
/// so the caller reports the outcome.
pub fn load(path: &str) -> Result<Config> {
    let contents = if Path::new(path).exists() {
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?
    } else {
        String::new()
    };

    parse(&contents, |key| std::env::var(key).ok()).with_context(|| format!("invalid config: {path}"))
}

// ===========================================================================
// Tests
// ===========================================================================
