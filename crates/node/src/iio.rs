//! DHT11/DHT22 climate sensor through the Linux IIO subsystem.
//!
//! With the `dht11` kernel overlay loaded, the driver exposes the sensor under
//! `/sys/bus/iio/devices/iio:deviceN/` as two files in milli-units:
//!
//! ```text
//! in_temp_input               23400  → 23.4 °C
//! in_humidityrelative_input   61200  → 61.2 %
//! ```
//!
//! The driver returns an I/O error (usually EIO or ETIMEDOUT) when a
//! transfer fails its checksum. That surfaces here as a missing reading and
//! the caller retries.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::reader::ClimateSensor;

const TEMPERATURE_FILE: &str = "in_temp_input";
const HUMIDITY_FILE: &str = "in_humidityrelative_input";

pub(crate) struct IioClimate {
    dir: PathBuf,
}

impl IioClimate {
    /// `dir` is the IIO device directory, e.g. `/sys/bus/iio/devices/iio:device0`.
    pub(crate) fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        anyhow::ensure!(
            dir.join(TEMPERATURE_FILE).exists(),
            "{} has no {TEMPERATURE_FILE}; is the dht11 overlay loaded?",
            dir.display()
        );
        tracing::info!(dir = %dir.display(), "iio climate sensor attached");
        Ok(Self { dir })
    }
}

/// Read a milli-unit sysfs attribute and scale it to units.
fn read_milli(path: &Path) -> Option<f32> {
    match fs::read_to_string(path) {
        Ok(text) => match text.trim().parse::<i64>() {
            Ok(milli) => Some(milli as f32 / 1000.0),
            Err(e) => {
                debug!(path = %path.display(), "unparseable iio value: {e}");
                None
            }
        },
        Err(e) => {
            debug!(path = %path.display(), "iio read failed: {e}");
            None
        }
    }
}

impl ClimateSensor for IioClimate {
    fn read_temperature(&mut self) -> Option<f32> {
        read_milli(&self.dir.join(TEMPERATURE_FILE))
    }

    fn read_humidity(&mut self) -> Option<f32> {
        read_milli(&self.dir.join(HUMIDITY_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn device(temp: Option<&str>, humidity: Option<&str>) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        if let Some(t) = temp {
            fs::write(dir.path().join(TEMPERATURE_FILE), t).unwrap();
        }
        if let Some(h) = humidity {
            fs::write(dir.path().join(HUMIDITY_FILE), h).unwrap();
        }
        dir
    }

    #[test]
    fn reads_milli_units() {
        let dir = device(Some("23400\n"), Some("61200\n"));
        let mut sensor = IioClimate::new(dir.path()).unwrap();
        assert_eq!(sensor.read_temperature(), Some(23.4));
        assert_eq!(sensor.read_humidity(), Some(61.2));
    }

    #[test]
    fn negative_temperature() {
        let dir = device(Some("-5500"), Some("40000"));
        let mut sensor = IioClimate::new(dir.path()).unwrap();
        assert_eq!(sensor.read_temperature(), Some(-5.5));
    }

    #[test]
    fn missing_humidity_file_is_no_reading() {
        let dir = device(Some("20000"), None);
        let mut sensor = IioClimate::new(dir.path()).unwrap();
        assert_eq!(sensor.read_humidity(), None);
    }

    #[test]
    fn garbage_is_no_reading() {
        let dir = device(Some("n/a"), Some(""));
        let mut sensor = IioClimate::new(dir.path()).unwrap();
        assert_eq!(sensor.read_temperature(), None);
        assert_eq!(sensor.read_humidity(), None);
    }

    #[test]
    fn new_rejects_directory_without_sensor() {
        let dir = device(None, None);
        assert!(IioClimate::new(dir.path()).is_err());
    }

    #[test]
    fn values_refresh_between_reads() {
        let dir = device(Some("20000"), Some("50000"));
        let mut sensor = IioClimate::new(dir.path()).unwrap();
        assert_eq!(sensor.read_temperature(), Some(20.0));
        fs::write(dir.path().join(TEMPERATURE_FILE), "21500").unwrap();
        assert_eq!(sensor.read_temperature(), Some(21.5));
    }
}
