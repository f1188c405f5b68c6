//! Sensor acquisition: one validated snapshot of all four channels per call.
//!
//! Digital channels (temperature, humidity) are read with retries. A reading
//! is accepted only if it is present, inside the channel's physical range,
//! and within the spike threshold of the previous accepted value. When every
//! attempt is rejected the previous accepted value is returned unchanged.
//!
//! Analog channels (soil moisture, luminosity) average a burst of raw
//! samples and map the result through the calibration endpoints onto
//! [0, 100]. They have no retry and no spike filter.

use std::ops::RangeInclusive;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::SensorConfig;

pub(crate) const TEMPERATURE_RANGE: RangeInclusive<f32> = -40.0..=80.0;
pub(crate) const PERCENT_RANGE: RangeInclusive<f32> = 0.0..=100.0;

// ---------------------------------------------------------------------------
// Hardware seams
// ---------------------------------------------------------------------------

/// Combined temperature/humidity sensor (DHT22 class). `None` means the
/// sensor produced no reading this time.
pub(crate) trait ClimateSensor {
    fn read_temperature(&mut self) -> Option<f32>;
    fn read_humidity(&mut self) -> Option<f32>;
}

/// Raw analog input; `None` means the conversion failed.
pub(crate) trait AnalogInput {
    fn read_raw(&mut self, channel: u8) -> Option<u16>;
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One acquisition cycle's worth of readings. `valid` is derived at
/// construction: true iff every channel lies in its physical range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SensorSnapshot {
    temperature: f32,
    humidity: f32,
    soil_moisture: f32,
    luminosity: f32,
    timestamp_ms: u64,
    valid: bool,
}

impl SensorSnapshot {
    pub(crate) fn new(
        temperature: f32,
        humidity: f32,
        soil_moisture: f32,
        luminosity: f32,
        timestamp_ms: u64,
    ) -> Self {
        let valid = TEMPERATURE_RANGE.contains(&temperature)
            && PERCENT_RANGE.contains(&humidity)
            && PERCENT_RANGE.contains(&soil_moisture)
            && PERCENT_RANGE.contains(&luminosity);
        Self {
            temperature,
            humidity,
            soil_moisture,
            luminosity,
            timestamp_ms,
            valid,
        }
    }

    pub(crate) fn temperature(&self) -> f32 {
        self.temperature
    }

    pub(crate) fn humidity(&self) -> f32 {
        self.humidity
    }

    pub(crate) fn soil_moisture(&self) -> f32 {
        self.soil_moisture
    }

    pub(crate) fn luminosity(&self) -> f32 {
        self.luminosity
    }

    /// Milliseconds since node start at the beginning of acquisition.
    pub(crate) fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid
    }
}

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

/// Last accepted value of a digital channel; only used for de-spiking and
/// the stale fallback.
#[derive(Debug)]
struct ChannelState {
    name: &'static str,
    range: RangeInclusive<f32>,
    spike: f32,
    last: Option<f32>,
}

impl ChannelState {
    fn new(name: &'static str, range: RangeInclusive<f32>, spike: f32) -> Self {
        Self {
            name,
            range,
            spike,
            last: None,
        }
    }
}

/// Linearly map `raw` from `[from, to]` onto `[0, 100]` and clamp. `from`
/// may be greater than `to` (soil sensors read lower when wetter).
pub(crate) fn map_calibrated(raw: f32, from: f32, to: f32) -> f32 {
    let span = to - from;
    if span == 0.0 {
        return 0.0;
    }
    ((raw - from) / span * 100.0).clamp(0.0, 100.0)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

pub(crate) struct SensorReader {
    climate: Box<dyn ClimateSensor>,
    analog: Box<dyn AnalogInput>,
    cfg: SensorConfig,
    temperature: ChannelState,
    humidity: ChannelState,
    last_soil: f32,
    last_light: f32,
    boot: Instant,
}

impl SensorReader {
    pub(crate) fn new(
        climate: Box<dyn ClimateSensor>,
        analog: Box<dyn AnalogInput>,
        cfg: SensorConfig,
        boot: Instant,
    ) -> Self {
        Self {
            climate,
            analog,
            temperature: ChannelState::new("temperature", TEMPERATURE_RANGE, cfg.temp_spike),
            humidity: ChannelState::new("humidity", PERCENT_RANGE, cfg.humidity_spike),
            cfg,
            last_soil: 0.0,
            last_light: 0.0,
            boot,
        }
    }

    /// Acquire one snapshot. Never fails; degraded channels surface as a
    /// stale value or, before the first accepted reading, as an invalid
    /// snapshot.
    pub(crate) async fn acquire(&mut self) -> SensorSnapshot {
        let started = Instant::now();
        let attempts = self.cfg.retry_count;
        let delay = Duration::from_millis(self.cfg.retry_delay_ms);

        let climate = &mut self.climate;
        let temperature = read_digital(
            &mut self.temperature,
            || climate.read_temperature(),
            attempts,
            delay,
        )
        .await;
        let humidity = read_digital(
            &mut self.humidity,
            || climate.read_humidity(),
            attempts,
            delay,
        )
        .await;

        let (soil_channel, soil_from, soil_to) = (
            self.cfg.soil_channel,
            f32::from(self.cfg.soil_dry_raw),
            f32::from(self.cfg.soil_wet_raw),
        );
        if let Some(raw) = self.average_raw(soil_channel).await {
            self.last_soil = map_calibrated(raw, soil_from, soil_to);
        } else {
            warn!(channel = soil_channel, "soil moisture: every sample failed, holding last value");
        }

        let (light_channel, light_from, light_to) = (
            self.cfg.light_channel,
            f32::from(self.cfg.light_dark_raw),
            f32::from(self.cfg.light_bright_raw),
        );
        if let Some(raw) = self.average_raw(light_channel).await {
            self.last_light = map_calibrated(raw, light_from, light_to);
        } else {
            warn!(channel = light_channel, "luminosity: every sample failed, holding last value");
        }

        let timestamp_ms = started.duration_since(self.boot).as_millis() as u64;
        let snapshot = SensorSnapshot::new(
            temperature,
            humidity,
            self.last_soil,
            self.last_light,
            timestamp_ms,
        );

        info!(
            temperature = snapshot.temperature(),
            humidity = snapshot.humidity(),
            soil = snapshot.soil_moisture(),
            luminosity = snapshot.luminosity(),
            valid = snapshot.is_valid(),
            "sensors read"
        );
        snapshot
    }

    /// Mean of the successful raw samples in one burst, or `None` if every
    /// sample failed.
    async fn average_raw(&mut self, channel: u8) -> Option<f32> {
        let samples = self.cfg.analog_samples;
        let spacing = Duration::from_millis(self.cfg.analog_spacing_ms);
        let mut sum: u64 = 0;
        let mut taken: u32 = 0;

        for i in 0..samples {
            match self.analog.read_raw(channel) {
                Some(raw) => {
                    sum += u64::from(raw);
                    taken += 1;
                }
                None => debug!(channel, sample = i, "analog sample failed"),
            }
            if i + 1 < samples {
                sleep(spacing).await;
            }
        }

        (taken > 0).then(|| sum as f32 / taken as f32)
    }
}

/// Read one digital channel with retries, range check and spike filter.
async fn read_digital<F>(channel: &mut ChannelState, mut read: F, attempts: u32, delay: Duration) -> f32
where
    F: FnMut() -> Option<f32>,
{
    for attempt in 1..=attempts {
        match read() {
            Some(value) if channel.range.contains(&value) => match channel.last {
                Some(previous) if (value - previous).abs() > channel.spike => {
                    warn!(
                        channel = channel.name,
                        value,
                        previous,
                        attempt,
                        "spike rejected"
                    );
                }
                _ => {
                    channel.last = Some(value);
                    return value;
                }
            },
            Some(value) if !value.is_nan() => {
                warn!(channel = channel.name, value, attempt, "reading out of range");
            }
            _ => {
                warn!(channel = channel.name, attempt, "no reading");
            }
        }
        if attempt < attempts {
            sleep(delay).await;
        }
    }

    match channel.last {
        Some(last) => {
            warn!(channel = channel.name, last, "retries exhausted, keeping last accepted value");
            last
        }
        None => {
            warn!(channel = channel.name, "retries exhausted with no previous value");
            f32::NAN
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Scripted climate sensor. Once a script runs dry it repeats its last
    /// entry. Call counts are shared so tests can inspect them after the
    /// sensor moves into the reader.
    #[derive(Clone, Default)]
    struct ScriptedClimate {
        temperature: Rc<RefCell<VecDeque<Option<f32>>>>,
        humidity: Rc<RefCell<VecDeque<Option<f32>>>>,
        temperature_calls: Rc<RefCell<u32>>,
    }

    impl ScriptedClimate {
        fn new(temperature: &[Option<f32>], humidity: &[Option<f32>]) -> Self {
            Self {
                temperature: Rc::new(RefCell::new(temperature.iter().copied().collect())),
                humidity: Rc::new(RefCell::new(humidity.iter().copied().collect())),
                temperature_calls: Rc::default(),
            }
        }

        fn push_temperature(&self, values: &[Option<f32>]) {
            self.temperature.borrow_mut().extend(values.iter().copied());
        }
    }

    fn next(script: &RefCell<VecDeque<Option<f32>>>) -> Option<f32> {
        let mut q = script.borrow_mut();
        if q.len() > 1 {
            q.pop_front().flatten()
        } else {
            q.front().copied().flatten()
        }
    }

    impl ClimateSensor for ScriptedClimate {
        fn read_temperature(&mut self) -> Option<f32> {
            *self.temperature_calls.borrow_mut() += 1;
            next(&self.temperature)
        }

        fn read_humidity(&mut self) -> Option<f32> {
            next(&self.humidity)
        }
    }

    /// Analog input returning a fixed raw value per channel.
    struct FixedAnalog {
        raw: [Option<u16>; 2],
    }

    impl AnalogInput for FixedAnalog {
        fn read_raw(&mut self, channel: u8) -> Option<u16> {
            self.raw[channel as usize]
        }
    }

    fn reader(climate: ScriptedClimate, soil_raw: Option<u16>, light_raw: Option<u16>) -> SensorReader {
        SensorReader::new(
            Box::new(climate),
            Box::new(FixedAnalog {
                raw: [soil_raw, light_raw],
            }),
            SensorConfig::default(),
            Instant::now(),
        )
    }

    // -- map_calibrated -------------------------------------------------------

    #[test]
    fn soil_mapping_is_inverted_and_clamped() {
        // dry 3500 → 0 %, wet 1200 → 100 %
        assert_eq!(map_calibrated(3500.0, 3500.0, 1200.0), 0.0);
        assert_eq!(map_calibrated(1200.0, 3500.0, 1200.0), 100.0);
        assert_eq!(map_calibrated(4095.0, 3500.0, 1200.0), 0.0);
        assert_eq!(map_calibrated(200.0, 3500.0, 1200.0), 100.0);
        assert_eq!(map_calibrated(2350.0, 3500.0, 1200.0), 50.0);
    }

    #[test]
    fn light_mapping_is_clamped() {
        assert_eq!(map_calibrated(0.0, 50.0, 3500.0), 0.0);
        assert_eq!(map_calibrated(4095.0, 50.0, 3500.0), 100.0);
    }

    #[test]
    fn mapping_is_monotonic() {
        let mut previous = map_calibrated(0.0, 3500.0, 1200.0);
        for raw in (0..=4095).step_by(5) {
            let pct = map_calibrated(raw as f32, 3500.0, 1200.0);
            assert!(pct <= previous, "soil mapping must fall as raw rises");
            assert!((0.0..=100.0).contains(&pct));
            previous = pct;
        }
    }

    #[test]
    fn degenerate_calibration_maps_to_zero() {
        assert_eq!(map_calibrated(1000.0, 1000.0, 1000.0), 0.0);
    }

    // -- Snapshot validity ----------------------------------------------------

    #[test]
    fn snapshot_validity_follows_ranges() {
        assert!(SensorSnapshot::new(24.0, 65.0, 60.0, 50.0, 0).is_valid());
        assert!(SensorSnapshot::new(-40.0, 0.0, 0.0, 100.0, 0).is_valid());
        assert!(!SensorSnapshot::new(81.0, 65.0, 60.0, 50.0, 0).is_valid());
        assert!(!SensorSnapshot::new(24.0, 101.0, 60.0, 50.0, 0).is_valid());
        assert!(!SensorSnapshot::new(f32::NAN, 65.0, 60.0, 50.0, 0).is_valid());
    }

    // -- Digital channels -----------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn in_range_reading_accepted_first_try() {
        let climate = ScriptedClimate::new(&[Some(24.0)], &[Some(65.0)]);
        let calls = climate.temperature_calls.clone();
        let mut r = reader(climate, Some(2350), Some(1775));

        let snap = r.acquire().await;
        assert!(snap.is_valid());
        assert_eq!(snap.temperature(), 24.0);
        assert_eq!(snap.humidity(), 65.0);
        assert_eq!(*calls.borrow(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_reading_retried() {
        let climate = ScriptedClimate::new(&[None, Some(f32::NAN), Some(22.5)], &[Some(60.0)]);
        let calls = climate.temperature_calls.clone();
        let mut r = reader(climate, Some(2350), Some(1775));

        let started = Instant::now();
        let snap = r.acquire().await;
        assert_eq!(snap.temperature(), 22.5);
        assert_eq!(*calls.borrow(), 3);
        // two retry delays of 2 s each, plus analog sample spacing
        assert!(started.elapsed() >= Duration::from_millis(4_000));
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_reading_rejected() {
        let climate = ScriptedClimate::new(&[Some(95.0), Some(-41.0), Some(25.0)], &[Some(60.0)]);
        let calls = climate.temperature_calls.clone();
        let mut r = reader(climate, Some(2350), Some(1775));

        let started = Instant::now();
        assert_eq!(r.acquire().await.temperature(), 25.0);
        assert_eq!(*calls.borrow(), 3);
        assert!(started.elapsed() >= Duration::from_millis(4_000));
    }

    #[tokio::test(start_paused = true)]
    async fn first_reading_failure_gives_invalid_snapshot() {
        let climate = ScriptedClimate::new(&[None], &[Some(60.0)]);
        let calls = climate.temperature_calls.clone();
        let mut r = reader(climate, Some(2350), Some(1775));

        let snap = r.acquire().await;
        assert!(!snap.is_valid());
        assert!(snap.temperature().is_nan());
        assert_eq!(*calls.borrow(), 3, "all retries consumed");
    }

    #[tokio::test(start_paused = true)]
    async fn spikes_rejected_and_last_value_held() {
        let climate = ScriptedClimate::new(&[Some(20.0)], &[Some(60.0)]);
        let calls = climate.temperature_calls.clone();
        let script = climate.clone();
        let mut r = reader(climate, Some(2350), Some(1775));
        assert_eq!(r.acquire().await.temperature(), 20.0);

        // 31 °C is in range but 11 °C away from the last accepted value.
        script.temperature.borrow_mut().clear();
        script.push_temperature(&[Some(31.0)]);
        *calls.borrow_mut() = 0;

        let started = Instant::now();
        let snap = r.acquire().await;
        assert_eq!(snap.temperature(), 20.0);
        assert!(snap.is_valid());
        assert_eq!(*calls.borrow(), 3);
        // each rejected spike waits out the retry delay like a range failure
        assert!(started.elapsed() >= Duration::from_millis(4_000));
    }

    #[tokio::test(start_paused = true)]
    async fn reading_within_spike_tolerance_accepted() {
        let climate = ScriptedClimate::new(&[Some(20.0), Some(29.5)], &[Some(60.0)]);
        let calls = climate.temperature_calls.clone();
        let mut r = reader(climate, Some(2350), Some(1775));
        assert_eq!(r.acquire().await.temperature(), 20.0);
        *calls.borrow_mut() = 0;

        let started = Instant::now();
        assert_eq!(r.acquire().await.temperature(), 29.5);
        assert_eq!(*calls.borrow(), 1);
        assert!(started.elapsed() < Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn spike_then_plausible_reading_recovers() {
        let climate = ScriptedClimate::new(&[Some(20.0), Some(45.0), Some(21.0)], &[Some(60.0)]);
        let mut r = reader(climate, Some(2350), Some(1775));
        r.acquire().await;
        assert_eq!(r.acquire().await.temperature(), 21.0);
    }

    #[tokio::test(start_paused = true)]
    async fn humidity_spike_threshold_is_twenty_points() {
        let climate = ScriptedClimate::new(&[Some(20.0)], &[Some(50.0), Some(75.0), Some(75.0), Some(75.0), Some(69.0)]);
        let mut r = reader(climate, Some(2350), Some(1775));
        assert_eq!(r.acquire().await.humidity(), 50.0);
        // 75 is 25 points away: three rejections, value held
        assert_eq!(r.acquire().await.humidity(), 50.0);
        // 69 is 19 points away: accepted
        assert_eq!(r.acquire().await.humidity(), 69.0);
    }

    // -- Analog channels ------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn analog_channels_are_mapped() {
        let climate = ScriptedClimate::new(&[Some(24.0)], &[Some(65.0)]);
        let mut r = reader(climate, Some(1200), Some(50));
        let snap = r.acquire().await;
        assert_eq!(snap.soil_moisture(), 100.0);
        assert_eq!(snap.luminosity(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_analog_channel_holds_previous_value() {
        let climate = ScriptedClimate::new(&[Some(24.0)], &[Some(65.0)]);
        let mut r = reader(climate, None, Some(3500));
        let snap = r.acquire().await;
        assert_eq!(snap.soil_moisture(), 0.0);
        assert_eq!(snap.luminosity(), 100.0);
        assert!(snap.is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn timestamp_is_millis_since_boot() {
        let boot = Instant::now();
        tokio::time::advance(Duration::from_millis(1_500)).await;
        let mut r = SensorReader::new(
            Box::new(ScriptedClimate::new(&[Some(24.0)], &[Some(65.0)])),
            Box::new(FixedAnalog {
                raw: [Some(2350), Some(1775)],
            }),
            SensorConfig::default(),
            boot,
        );
        assert_eq!(r.acquire().await.timestamp_ms(), 1_500);
    }
}
