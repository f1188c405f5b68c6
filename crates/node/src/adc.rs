//! ADS1115 16-bit ADC over I2C for the soil moisture and light sensors.
//!
//! Single-ended reads at PGA ±4.096 V, 128 SPS, single-shot. The converter
//! yields 15 significant bits for single-ended inputs; results are scaled
//! down to the 12-bit range (0..=4095) the calibration endpoints in
//! `[sensors]` are expressed in.
//!
//! The register math is always compiled so it can be tested off-target; the
//! driver itself needs the `adc` feature.
#![cfg_attr(not(feature = "adc"), allow(dead_code))]

#[cfg(feature = "adc")]
use rppal::i2c::I2c;
#[cfg(feature = "adc")]
use std::{thread, time::Duration};

#[cfg(feature = "adc")]
use crate::reader::AnalogInput;

// -- Registers ---------------------------------------------------------------

const REG_CONVERSION: u8 = 0x00;
const REG_CONFIG: u8 = 0x01;

// Config register, MSB first:
//   [15] OS  [14:12] MUX  [11:9] PGA  [8] MODE  [7:5] DR  [4:0] comparator

/// OS=1, PGA=001 (±4.096 V), MODE=1, DR=100 (128 SPS), comparator off.
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;
const MUX_SHIFT: u16 = 12;
/// Single-ended MUX selector for AINx vs GND is 0b100 + x.
const MUX_SINGLE_ENDED_BASE: u16 = 0b100;
pub(crate) const MAX_CHANNEL: u8 = 3;

/// Set in the config register once a conversion has finished.
const OS_READY_BIT: u16 = 1 << 15;

/// Right shift from the 15-bit single-ended result to 12 bits.
const TO_12_BIT: u32 = 3;

/// Config word that starts a single-shot conversion on `channel`, or `None`
/// if the channel does not exist.
pub(crate) fn config_word(channel: u8) -> Option<u16> {
    (channel <= MAX_CHANNEL)
        .then(|| CONFIG_BASE | ((MUX_SINGLE_ENDED_BASE + u16::from(channel)) << MUX_SHIFT))
}

/// Convert a signed conversion result to the 12-bit raw scale. Negative
/// results (noise around 0 V) clamp to zero.
pub(crate) fn to_raw12(conversion: i16) -> u16 {
    (conversion.max(0) as u16) >> TO_12_BIT
}

// -- Driver ------------------------------------------------------------------

#[cfg(feature = "adc")]
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

#[cfg(feature = "adc")]
pub(crate) struct Ads1115 {
    i2c: I2c,
}

#[cfg(feature = "adc")]
impl Ads1115 {
    /// Open I2C bus 1 and address the converter at `addr`.
    pub(crate) fn new(addr: u16) -> anyhow::Result<Self> {
        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr)?;
        tracing::info!(addr = format_args!("0x{addr:02x}"), "ads1115 initialised");
        Ok(Self { i2c })
    }

    fn convert(&mut self, config: u16) -> anyhow::Result<i16> {
        self.i2c.block_write(REG_CONFIG, &config.to_be_bytes())?;
        thread::sleep(CONVERSION_WAIT);

        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }
}

#[cfg(feature = "adc")]
impl AnalogInput for Ads1115 {
    fn read_raw(&mut self, channel: u8) -> Option<u16> {
        let config = config_word(channel)?;
        match self.convert(config) {
            Ok(conversion) => Some(to_raw12(conversion)),
            Err(e) => {
                tracing::error!(channel, "adc read failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- Config word ----------------------------------------------------------

    #[test]
    fn config_word_per_channel() {
        assert_eq!(config_word(0), Some(0xC383));
        assert_eq!(config_word(1), Some(0xD383));
        assert_eq!(config_word(2), Some(0xE383));
        assert_eq!(config_word(3), Some(0xF383));
    }

    #[test]
    fn config_word_rejects_missing_channel() {
        assert_eq!(config_word(4), None);
        assert_eq!(config_word(u8::MAX), None);
    }

    #[test]
    fn base_word_fields() {
        assert_eq!((CONFIG_BASE >> 15) & 1, 1, "OS starts conversion");
        assert_eq!((CONFIG_BASE >> 9) & 0b111, 0b001, "PGA ±4.096 V");
        assert_eq!((CONFIG_BASE >> 8) & 1, 1, "single-shot");
        assert_eq!((CONFIG_BASE >> 5) & 0b111, 0b100, "128 SPS");
        assert_eq!(CONFIG_BASE & 0b11, 0b11, "comparator disabled");
    }

    // -- Scaling --------------------------------------------------------------

    #[test]
    fn full_scale_maps_to_4095() {
        assert_eq!(to_raw12(i16::MAX), 4095);
        assert_eq!(to_raw12(0), 0);
        assert_eq!(to_raw12(16384), 2048);
    }

    #[test]
    fn negative_conversion_clamps_to_zero() {
        assert_eq!(to_raw12(-12), 0);
        assert_eq!(to_raw12(i16::MIN), 0);
    }
}
