//! Greenhouse node: reads climate, soil and light sensors, applies the
//! threshold policy to the fan and pump relays, and talks to the broker over
//! MQTT (telemetry, alerts, status, remote actuator commands).

mod actuator;
mod adc;
mod config;
mod connection;
mod control;
mod iio;
mod mqtt;
mod policy;
mod reader;
#[cfg(feature = "sim")]
mod sim;
mod transport;

use std::env;
use std::path::Path;

use anyhow::Result;
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::actuator::{Actuators, RelayBoard};
use crate::config::SensorConfig;
use crate::connection::{ConnectionManager, LinkSettings};
use crate::control::ControlLoop;
use crate::iio::IioClimate;
use crate::policy::PolicyEngine;
use crate::reader::{AnalogInput, ClimateSensor, SensorReader};
use crate::transport::MqttTransport;

const DEFAULT_CONFIG_PATH: &str = "greenhouse.toml";

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

// ---------------------------------------------------------------------------
// Sensor sources
// ---------------------------------------------------------------------------

fn climate_source(cfg: &SensorConfig) -> Result<Box<dyn ClimateSensor>> {
    match &cfg.iio_device {
        Some(dir) => Ok(Box::new(IioClimate::new(dir)?)),
        None => simulated_climate(),
    }
}

#[cfg(feature = "sim")]
fn sim_scenario() -> sim::Scenario {
    sim::Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default())
}

#[cfg(feature = "sim")]
fn simulated_climate() -> Result<Box<dyn ClimateSensor>> {
    let scenario = sim_scenario();
    info!(%scenario, "[sim] climate sensor");
    Ok(Box::new(sim::SimClimate::new(scenario)))
}

#[cfg(not(feature = "sim"))]
fn simulated_climate() -> Result<Box<dyn ClimateSensor>> {
    anyhow::bail!("sensors.iio_device is not set and the `sim` feature is disabled")
}

#[cfg(feature = "adc")]
fn analog_source(cfg: &SensorConfig) -> Result<Box<dyn AnalogInput>> {
    Ok(Box::new(adc::Ads1115::new(cfg.adc_address)?))
}

#[cfg(all(not(feature = "adc"), feature = "sim"))]
fn analog_source(cfg: &SensorConfig) -> Result<Box<dyn AnalogInput>> {
    const SIM_DAY: std::time::Duration = std::time::Duration::from_secs(600);
    let scenario = sim_scenario();
    info!(%scenario, "[sim] analog inputs");
    Ok(Box::new(sim::SimAnalog::new(scenario, cfg, SIM_DAY)))
}

#[cfg(not(any(feature = "adc", feature = "sim")))]
fn analog_source(_cfg: &SensorConfig) -> Result<Box<dyn AnalogInput>> {
    anyhow::bail!("no analog source: build with the `adc` or `sim` feature")
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg = config::load(&config_path)?;
    init_tracing(&cfg.logging.level);

    info!(
        path = %config_path,
        from_file = Path::new(&config_path).exists(),
        thing = %cfg.device.thing_name,
        broker = %format_args!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        tls = cfg.mqtt.tls_paths().is_some(),
        "config loaded"
    );

    let boot = Instant::now();

    // Relays are forced off before anything else can fail.
    let board = RelayBoard::new(&cfg.relays)?;
    let actuators = Actuators::new(board, &cfg.topics);

    let reader = SensorReader::new(
        climate_source(&cfg.sensors)?,
        analog_source(&cfg.sensors)?,
        cfg.sensors.clone(),
        boot,
    );

    let client_id = cfg.mqtt.effective_client_id(&cfg.device.thing_name);
    let transport = MqttTransport::new(&cfg.mqtt, client_id)?;
    let link = ConnectionManager::new(transport, actuators, LinkSettings::from_config(&cfg), boot);
    let policy = PolicyEngine::new(cfg.thresholds.clone());
    let mut control = ControlLoop::new(reader, policy, link, &cfg);

    info!(
        interval_ms = cfg.sensors.read_interval_ms,
        client_id, "greenhouse node starting"
    );

    let outcome = tokio::select! {
        res = control.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    control.shutdown().await;
    outcome
}
