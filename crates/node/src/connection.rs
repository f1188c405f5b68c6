//! Broker session lifecycle: connect, resubscribe, publish, throttled
//! reconnect with a bounded attempt counter, and synchronous dispatch of
//! inbound commands to a single handler.
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──ok──▶ Connected
//!      ▲                          │                  │
//!      └────────── failure ───────┘    link lost ────┘
//! ```
//!
//! After `max_attempts` consecutive failures the manager reports
//! [`ConnectOutcome::Fatal`] once and stops trying. Restarting the process is
//! the owner's job.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::mqtt::{Status, StatusMsg};
use crate::transport::Transport;

/// Receives every inbound message, in arrival order, from inside `tick`.
pub(crate) trait CommandHandler {
    fn on_command(&mut self, topic: &str, payload: &[u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a connect attempt or a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectOutcome {
    Connected,
    Disconnected,
    /// The reconnect ceiling was just reached.
    Fatal,
}

#[derive(Debug, Clone)]
pub(crate) struct LinkSettings {
    pub(crate) thing: String,
    pub(crate) status_topic: String,
    pub(crate) command_topics: Vec<String>,
    pub(crate) reconnect_delay: Duration,
    pub(crate) max_attempts: u32,
}

impl LinkSettings {
    pub(crate) fn from_config(cfg: &Config) -> Self {
        Self {
            thing: cfg.device.thing_name.clone(),
            status_topic: cfg.topics.status.clone(),
            command_topics: cfg
                .topics
                .command_topics()
                .iter()
                .map(|t| t.to_string())
                .collect(),
            reconnect_delay: Duration::from_millis(cfg.mqtt.reconnect_delay_ms),
            max_attempts: cfg.mqtt.max_reconnect_attempts,
        }
    }
}

pub(crate) struct ConnectionManager<T, H> {
    transport: T,
    handler: H,
    settings: LinkSettings,
    state: ConnectionState,
    failed_attempts: u32,
    faulted: bool,
    last_attempt: Option<Instant>,
    boot: Instant,
}

impl<T: Transport, H: CommandHandler> ConnectionManager<T, H> {
    pub(crate) fn new(transport: T, handler: H, settings: LinkSettings, boot: Instant) -> Self {
        Self {
            transport,
            handler,
            settings,
            state: ConnectionState::Disconnected,
            failed_attempts: 0,
            faulted: false,
            last_attempt: None,
            boot,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub(crate) fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub(crate) fn handler(&self) -> &H {
        &self.handler
    }

    pub(crate) fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Attempt one connection. A no-op when already connected; never
    /// attempts again once the ceiling has been reached.
    pub(crate) async fn connect(&mut self) -> ConnectOutcome {
        if self.is_connected() {
            return ConnectOutcome::Connected;
        }
        if self.faulted {
            debug!("reconnect ceiling reached, not attempting");
            return ConnectOutcome::Disconnected;
        }

        self.last_attempt = Some(Instant::now());
        self.set_state(ConnectionState::Connecting);

        match self.transport.connect().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                self.failed_attempts = 0;
                for topic in &self.settings.command_topics {
                    match self.transport.subscribe(topic) {
                        Ok(()) => debug!(topic = %topic, "subscribed"),
                        // No commands arrive on this topic until the next reconnect.
                        Err(e) => warn!(topic = %topic, "subscribe failed: {e:#}"),
                    }
                }
                self.publish_status(Status::Online);
                ConnectOutcome::Connected
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                self.failed_attempts += 1;
                warn!(
                    attempt = self.failed_attempts,
                    max = self.settings.max_attempts,
                    "connect failed: {e:#}"
                );
                if self.failed_attempts >= self.settings.max_attempts {
                    self.faulted = true;
                    error!(
                        attempts = self.failed_attempts,
                        "reconnect ceiling reached; connectivity unrecoverable"
                    );
                    ConnectOutcome::Fatal
                } else {
                    ConnectOutcome::Disconnected
                }
            }
        }
    }

    /// Publish if connected. Returns whether the message was handed to the
    /// transport.
    pub(crate) fn publish(&mut self, topic: &str, payload: Vec<u8>) -> bool {
        if !self.is_connected() {
            debug!(topic, "not connected, publish skipped");
            return false;
        }
        match self.transport.publish(topic, payload) {
            Ok(()) => true,
            Err(e) => {
                warn!(topic, "publish failed: {e:#}");
                false
            }
        }
    }

    /// One service iteration: detect link loss, then either pump inbound
    /// messages into the handler or make a throttled reconnect attempt.
    pub(crate) async fn tick(&mut self) -> ConnectOutcome {
        if self.is_connected() && !self.transport.is_alive() {
            warn!("connection lost");
            self.set_state(ConnectionState::Disconnected);
        }

        if self.is_connected() {
            match self.transport.poll().await {
                Ok(messages) => {
                    for msg in messages {
                        self.handler.on_command(&msg.topic, &msg.payload);
                    }
                }
                Err(e) => warn!("poll failed: {e:#}"),
            }
            return ConnectOutcome::Connected;
        }

        if self.faulted {
            return ConnectOutcome::Disconnected;
        }
        let due = self
            .last_attempt
            .map_or(true, |at| at.elapsed() >= self.settings.reconnect_delay);
        if !due {
            return ConnectOutcome::Disconnected;
        }
        self.connect().await
    }

    /// Best-effort "offline" status, then release the channel regardless.
    pub(crate) async fn shutdown(&mut self) {
        if self.is_connected() && !self.publish_status(Status::Offline) {
            warn!("offline status not sent");
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!("disconnect failed: {e:#}");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn publish_status(&mut self, status: Status) -> bool {
        let msg = StatusMsg {
            thing: &self.settings.thing,
            status,
            timestamp: self.boot.elapsed().as_millis() as u64,
        };
        let payload = match serde_json::to_vec(&msg) {
            Ok(p) => p,
            Err(e) => {
                error!("status serialisation failed: {e}");
                return false;
            }
        };
        let topic = self.settings.status_topic.clone();
        self.publish(&topic, payload)
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "mqtt state");
            self.state = next;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
