//! The cooperative control loop: service the broker session every tick and,
//! once per sensor interval, acquire → evaluate → actuate → publish.

use std::time::Duration;

use anyhow::{bail, Result};
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::actuator::{Actuators, Source};
use crate::config::Config;
use crate::connection::{ConnectOutcome, ConnectionManager};
use crate::mqtt::{AlertMsg, TelemetryMsg};
use crate::policy::{Alert, PolicyEngine};
use crate::reader::{SensorReader, SensorSnapshot};
use crate::transport::Transport;

/// Pause between loop iterations.
const IDLE: Duration = Duration::from_millis(100);

/// What one sensor cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CycleReport {
    pub(crate) valid: bool,
    pub(crate) changes: usize,
    pub(crate) alerts: usize,
    pub(crate) telemetry_sent: bool,
    pub(crate) alerts_sent: bool,
}

pub(crate) struct ControlLoop<T> {
    reader: SensorReader,
    policy: PolicyEngine,
    link: ConnectionManager<T, Actuators>,
    thing: String,
    telemetry_topics: Vec<String>,
    alert_topic: String,
    interval: Duration,
    last_cycle: Option<Instant>,
}

impl<T: Transport> ControlLoop<T> {
    pub(crate) fn new(
        reader: SensorReader,
        policy: PolicyEngine,
        link: ConnectionManager<T, Actuators>,
        cfg: &Config,
    ) -> Self {
        Self {
            reader,
            policy,
            link,
            thing: cfg.device.thing_name.clone(),
            telemetry_topics: cfg
                .topics
                .telemetry_topics()
                .iter()
                .map(|t| t.to_string())
                .collect(),
            alert_topic: cfg.topics.alerts.clone(),
            interval: Duration::from_millis(cfg.sensors.read_interval_ms),
            last_cycle: None,
        }
    }

    /// Run until connectivity becomes unrecoverable. Only returns with an
    /// error; the caller is expected to exit so the supervisor restarts us.
    pub(crate) async fn run(&mut self) -> Result<()> {
        if self.link.connect().await == ConnectOutcome::Fatal {
            bail!("initial mqtt connection failed");
        }
        loop {
            self.step().await?;
            sleep(IDLE).await;
        }
    }

    /// One loop iteration. Returns the cycle report when a sensor cycle ran.
    pub(crate) async fn step(&mut self) -> Result<Option<CycleReport>> {
        if self.link.tick().await == ConnectOutcome::Fatal {
            bail!(
                "mqtt unreachable after {} consecutive attempts",
                self.link.failed_attempts()
            );
        }

        let due = self
            .last_cycle
            .map_or(true, |at| at.elapsed() >= self.interval);
        if !due {
            return Ok(None);
        }
        self.last_cycle = Some(Instant::now());
        Ok(Some(self.cycle().await))
    }

    async fn cycle(&mut self) -> CycleReport {
        let snapshot = self.reader.acquire().await;
        let eval = self.policy.evaluate(&snapshot, self.link.handler().state());

        for &(id, on) in &eval.changes {
            self.link.handler_mut().apply(id, on, Source::Policy);
        }

        let telemetry_sent = if !snapshot.is_valid() {
            warn!("snapshot invalid, telemetry skipped this cycle");
            false
        } else if !self.link.is_connected() {
            warn!(state = %self.link.state(), "not connected, telemetry skipped");
            false
        } else {
            self.publish_telemetry(&snapshot)
        };

        let alerts_sent =
            !eval.alerts.is_empty() && self.publish_alerts(snapshot.timestamp_ms(), &eval.alerts);

        let report = CycleReport {
            valid: snapshot.is_valid(),
            changes: eval.changes.len(),
            alerts: eval.alerts.len(),
            telemetry_sent,
            alerts_sent,
        };
        info!(
            valid = report.valid,
            changes = report.changes,
            alerts = report.alerts,
            telemetry_sent = report.telemetry_sent,
            alerts_sent = report.alerts_sent,
            "cycle complete"
        );
        report
    }

    /// Same payload to every telemetry topic. True if all were accepted.
    fn publish_telemetry(&mut self, snapshot: &SensorSnapshot) -> bool {
        let payload = match serde_json::to_vec(&TelemetryMsg::new(&self.thing, snapshot)) {
            Ok(p) => p,
            Err(e) => {
                warn!("telemetry serialisation failed: {e}");
                return false;
            }
        };
        let mut all = true;
        for topic in &self.telemetry_topics {
            all &= self.link.publish(topic, payload.clone());
        }
        all
    }

    fn publish_alerts(&mut self, timestamp: u64, alerts: &[Alert]) -> bool {
        for alert in alerts {
            warn!(
                kind = alert.kind.as_str(),
                severity = alert.severity.as_str(),
                value = alert.value,
                "{}",
                alert.message
            );
        }
        match serde_json::to_vec(&AlertMsg::new(&self.thing, timestamp, alerts)) {
            Ok(payload) => self.link.publish(&self.alert_topic, payload),
            Err(e) => {
                warn!("alert serialisation failed: {e}");
                false
            }
        }
    }

    /// Announce offline, release the session, and switch every relay off.
    pub(crate) async fn shutdown(&mut self) {
        self.link.shutdown().await;
        self.link.handler_mut().all_off();
        info!("control loop stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
