//! Simulated greenhouse sensors for running the node without hardware.
//!
//! Models enough behaviour to exercise the reader and the policy:
//! - Temporal coherence via random walk with mean reversion
//! - Scenario-driven drift (heat build-up, soil drying)
//! - Per-sample electronic noise on analog channels
//! - Occasional missing readings and spikes (flaky DHT wiring)
//! - Day/night light cycle
//!
//! Analog channels are produced as raw counts through the inverse of the
//! configured calibration, so the reader's mapping is exercised end to end.

use std::fmt;
use std::time::{Duration, Instant};

use crate::config::SensorConfig;
use crate::reader::{AnalogInput, ClimateSensor};

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Irwin-Hall approximation of N(0,1): sum of 12 uniform [0,1) minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Simulation profile, selected with `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scenario {
    /// Comfortable greenhouse; no rule should fire.
    Stable,
    /// Temperature climbs past `temp_max` over the first few hundred reads.
    Heatwave,
    /// Soil dries steadily below `soil_min`.
    Drought,
    /// Nominal climate, but ~20% of DHT reads fail and ~10% spike by 15 °C.
    Flaky,
}

impl Scenario {
    pub(crate) fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "heatwave" => Self::Heatwave,
            "drought" => Self::Drought,
            "flaky" => Self::Flaky,
            _ => Self::Stable,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Heatwave => write!(f, "heatwave"),
            Self::Drought => write!(f, "drought"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

/// Mean-reverting random walk.
struct Walk {
    value: f64,
    center: f64,
    reversion: f64,
    sigma: f64,
    bounds: (f64, f64),
}

impl Walk {
    fn step(&mut self) -> f64 {
        let pull = self.reversion * (self.center - self.value);
        self.value = (self.value + pull + gaussian(0.0, self.sigma)).clamp(self.bounds.0, self.bounds.1);
        self.value
    }
}

// ---------------------------------------------------------------------------
// Climate (DHT22 stand-in)
// ---------------------------------------------------------------------------

pub(crate) struct SimClimate {
    temperature: Walk,
    humidity: Walk,
    dropout_prob: f32,
    spike_prob: f32,
}

impl SimClimate {
    pub(crate) fn new(scenario: Scenario) -> Self {
        // (start °C, target °C, reversion, humidity target, walk sigma, dropout, spike)
        let (start, target, reversion, humidity, sigma, dropout_prob, spike_prob) = match scenario {
            Scenario::Stable => (24.0, 24.0, 0.05, 60.0, 0.1, 0.01, 0.0),
            Scenario::Heatwave => (26.0, 38.0, 0.01, 45.0, 0.1, 0.01, 0.0),
            Scenario::Drought => (27.0, 27.0, 0.05, 40.0, 0.1, 0.01, 0.0),
            Scenario::Flaky => (24.0, 24.0, 0.05, 60.0, 0.3, 0.20, 0.10_f32),
        };

        Self {
            temperature: Walk {
                value: start,
                center: target,
                reversion,
                sigma,
                bounds: (-10.0, 50.0),
            },
            humidity: Walk {
                value: humidity,
                center: humidity,
                reversion: 0.05,
                sigma: sigma * 2.0,
                bounds: (5.0, 99.0),
            },
            dropout_prob,
            spike_prob,
        }
    }

    fn sample(walk: &mut Walk, dropout_prob: f32, spike_prob: f32) -> Option<f32> {
        let value = walk.step();
        if fastrand::f32() < dropout_prob {
            return None;
        }
        let spike = if fastrand::f32() < spike_prob {
            if fastrand::bool() { 15.0 } else { -15.0 }
        } else {
            0.0
        };
        Some((value + spike) as f32)
    }
}

impl ClimateSensor for SimClimate {
    fn read_temperature(&mut self) -> Option<f32> {
        Self::sample(&mut self.temperature, self.dropout_prob, self.spike_prob)
    }

    fn read_humidity(&mut self) -> Option<f32> {
        Self::sample(&mut self.humidity, self.dropout_prob, self.spike_prob)
    }
}

// ---------------------------------------------------------------------------
// Analog (soil + light)
// ---------------------------------------------------------------------------

#[cfg_attr(feature = "adc", allow(dead_code))]
pub(crate) struct SimAnalog {
    soil: Walk,
    soil_channel: u8,
    light_channel: u8,
    // Calibration endpoints as (0 %, 100 %) raw counts.
    soil_cal: (f64, f64),
    light_cal: (f64, f64),
    noise_sigma: f64,
    dropout_prob: f32,
    started: Instant,
    day_length: Duration,
}

#[cfg_attr(feature = "adc", allow(dead_code))]
impl SimAnalog {
    /// `day_length` is one full light cycle; 600 s makes day/night visible
    /// during development.
    pub(crate) fn new(scenario: Scenario, cfg: &SensorConfig, day_length: Duration) -> Self {
        // (start %, target %, reversion, raw noise sigma, dropout)
        let (start, target, reversion, noise_sigma, dropout_prob) = match scenario {
            Scenario::Stable => (60.0, 60.0, 0.02, 15.0, 0.0),
            Scenario::Heatwave => (55.0, 35.0, 0.005, 15.0, 0.0),
            Scenario::Drought => (45.0, 10.0, 0.003, 15.0, 0.0),
            Scenario::Flaky => (60.0, 60.0, 0.02, 60.0, 0.05_f32),
        };

        Self {
            soil: Walk {
                value: start,
                center: target,
                reversion,
                sigma: 0.05,
                bounds: (0.0, 100.0),
            },
            soil_channel: cfg.soil_channel,
            light_channel: cfg.light_channel,
            soil_cal: (f64::from(cfg.soil_dry_raw), f64::from(cfg.soil_wet_raw)),
            light_cal: (f64::from(cfg.light_dark_raw), f64::from(cfg.light_bright_raw)),
            noise_sigma,
            dropout_prob,
            started: Instant::now(),
            day_length,
        }
    }

    /// Light level in percent: a half-sine by day, dark by night.
    fn daylight(&self) -> f64 {
        let phase = self.started.elapsed().as_secs_f64() / self.day_length.as_secs_f64().max(1.0);
        let sun = (2.0 * std::f64::consts::PI * phase).sin().max(0.0);
        5.0 + 85.0 * sun
    }

    fn to_raw(&self, percent: f64, (zero, full): (f64, f64)) -> u16 {
        let raw = zero + percent / 100.0 * (full - zero) + gaussian(0.0, self.noise_sigma);
        raw.round().clamp(0.0, 4095.0) as u16
    }
}

impl AnalogInput for SimAnalog {
    fn read_raw(&mut self, channel: u8) -> Option<u16> {
        if fastrand::f32() < self.dropout_prob {
            return None;
        }
        if channel == self.soil_channel {
            let pct = self.soil.step();
            Some(self.to_raw(pct, self.soil_cal))
        } else if channel == self.light_channel {
            Some(self.to_raw(self.daylight(), self.light_cal))
        } else {
            None
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
