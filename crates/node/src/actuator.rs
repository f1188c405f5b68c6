//! Actuators: identities, the owned on/off state, and the relay board that
//! drives them. The `gpio` feature gates the real rppal driver; without it, a
//! mock board records drive levels and logs state changes.

use anyhow::Result;
use std::fmt;
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::config::{RelayConfig, TopicConfig};
use crate::connection::CommandHandler;
use crate::mqtt::parse_command;

// ---------------------------------------------------------------------------
// Identity & state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ActuatorId {
    Fan,
    Pump,
    Lights,
}

impl ActuatorId {
    pub(crate) const ALL: [ActuatorId; 3] = [ActuatorId::Fan, ActuatorId::Pump, ActuatorId::Lights];

    fn index(self) -> usize {
        match self {
            ActuatorId::Fan => 0,
            ActuatorId::Pump => 1,
            ActuatorId::Lights => 2,
        }
    }
}

impl fmt::Display for ActuatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorId::Fan => write!(f, "fan"),
            ActuatorId::Pump => write!(f, "pump"),
            ActuatorId::Lights => write!(f, "lights"),
        }
    }
}

/// On/off state of every actuator. Starts all-off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ActuatorState {
    on: [bool; 3],
}

impl ActuatorState {
    pub(crate) fn is_on(&self, id: ActuatorId) -> bool {
        self.on[id.index()]
    }

    /// Returns whether the stored state changed.
    pub(crate) fn set(&mut self, id: ActuatorId, on: bool) -> bool {
        let slot = &mut self.on[id.index()];
        let changed = *slot != on;
        *slot = on;
        changed
    }

    pub(crate) fn any_on(&self) -> bool {
        self.on.iter().any(|&on| on)
    }
}

/// Pin level that realises `on` for a relay of the given polarity.
/// `true` = HIGH.
fn drive_level(on: bool, active_low: bool) -> bool {
    on != active_low
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal and Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct RelayBoard {
    relays: [OutputPin; 3], // indexed by ActuatorId
    led: OutputPin,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub(crate) fn new(cfg: &RelayConfig) -> Result<Self> {
        let gpio = Gpio::new()?;
        let output = |pin: u8| -> Result<OutputPin> { Ok(gpio.get(pin)?.into_output()) };

        let mut board = Self {
            relays: [output(cfg.fan_pin)?, output(cfg.pump_pin)?, output(cfg.lights_pin)?],
            led: output(cfg.status_led_pin)?,
            active_low: cfg.active_low,
        };

        // Fail-safe: every relay starts at its OFF level.
        for id in ActuatorId::ALL {
            board.set(id, false);
        }
        board.set_status_led(false);

        info!(
            fan = cfg.fan_pin,
            pump = cfg.pump_pin,
            lights = cfg.lights_pin,
            led = cfg.status_led_pin,
            active_low = cfg.active_low,
            "relay board initialised"
        );
        Ok(board)
    }

    pub(crate) fn set(&mut self, id: ActuatorId, on: bool) {
        let pin = &mut self.relays[id.index()];
        if drive_level(on, self.active_low) {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }

    pub(crate) fn set_status_led(&mut self, on: bool) {
        if on {
            self.led.set_high();
        } else {
            self.led.set_low();
        }
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (no hardware, logs state)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct RelayBoard {
    pub(super) levels: [bool; 3], // pin level per relay, true = HIGH
    pub(super) led: bool,
    active_low: bool,
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub(crate) fn new(cfg: &RelayConfig) -> Result<Self> {
        let off = drive_level(false, cfg.active_low);
        info!(
            fan = cfg.fan_pin,
            pump = cfg.pump_pin,
            lights = cfg.lights_pin,
            "[mock-gpio] relay board initialised (no hardware)"
        );
        Ok(Self {
            levels: [off; 3],
            led: false,
            active_low: cfg.active_low,
        })
    }

    pub(crate) fn set(&mut self, id: ActuatorId, on: bool) {
        self.levels[id.index()] = drive_level(on, self.active_low);
        info!(actuator = %id, level = if self.levels[id.index()] { "HIGH" } else { "LOW" }, "[mock-gpio] relay set");
    }

    pub(crate) fn set_status_led(&mut self, on: bool) {
        self.led = on;
    }
}

// ---------------------------------------------------------------------------
// Actuators: state + hardware + command routing
// ---------------------------------------------------------------------------

/// Where an actuator change came from; only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Remote,
    Policy,
    Shutdown,
}

/// Owns the actuator state and keeps the relay board in step with it.
pub(crate) struct Actuators {
    state: ActuatorState,
    board: RelayBoard,
    routes: [(String, ActuatorId); 3],
}

impl Actuators {
    pub(crate) fn new(board: RelayBoard, topics: &TopicConfig) -> Self {
        Self {
            state: ActuatorState::default(),
            board,
            routes: [
                (topics.fan.clone(), ActuatorId::Fan),
                (topics.pump.clone(), ActuatorId::Pump),
                (topics.lights.clone(), ActuatorId::Lights),
            ],
        }
    }

    pub(crate) fn state(&self) -> &ActuatorState {
        &self.state
    }

    /// Update the state, drive the relay, and mirror "anything on" on the
    /// status LED.
    pub(crate) fn apply(&mut self, id: ActuatorId, on: bool, source: Source) {
        let changed = self.state.set(id, on);
        self.board.set(id, on);
        self.board.set_status_led(self.state.any_on());
        info!(
            actuator = %id,
            on,
            changed,
            source = ?source,
            "actuator {}",
            if on { "ON" } else { "OFF" }
        );
    }

    /// Drive every relay to OFF. Used on shutdown.
    pub(crate) fn all_off(&mut self) {
        for id in ActuatorId::ALL {
            self.apply(id, false, Source::Shutdown);
        }
    }

    fn route(&self, topic: &str) -> Option<ActuatorId> {
        self.routes
            .iter()
            .find(|(t, _)| t == topic)
            .map(|(_, id)| *id)
    }
}

impl CommandHandler for Actuators {
    fn on_command(&mut self, topic: &str, payload: &[u8]) {
        let Some(id) = self.route(topic) else {
            warn!(topic, "command on unknown topic ignored");
            return;
        };
        match parse_command(payload) {
            Ok(on) => self.apply(id, on, Source::Remote),
            Err(e) => warn!(
                actuator = %id,
                payload = %String::from_utf8_lossy(payload),
                "dropping command: {e}"
            ),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
