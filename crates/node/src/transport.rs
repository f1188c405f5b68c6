//! The messaging channel seam and its rumqttc implementation.
//!
//! `ConnectionManager` owns all state-machine logic; a `Transport` only knows
//! how to open a session, move bytes, and report whether the session is still
//! alive. Keeping it this thin lets the manager be tested against a fake.

use std::fs;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use crate::config::MqttConfig;

/// An inbound message on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Inbound {
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
}

pub(crate) trait Transport {
    /// Open a fresh session and wait for the broker's acknowledgement.
    async fn connect(&mut self) -> Result<()>;

    fn subscribe(&mut self, topic: &str) -> Result<()>;

    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Service the session: flush queued requests and collect whatever
    /// inbound messages are ready. Returns promptly.
    async fn poll(&mut self) -> Result<Vec<Inbound>>;

    /// False once the session has failed or was closed by the broker.
    fn is_alive(&self) -> bool;

    /// Close the session, flushing anything already queued.
    async fn disconnect(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// rumqttc
// ---------------------------------------------------------------------------

const CHANNEL_CAPACITY: usize = 20;
/// How long one `poll` keeps draining the event loop.
const DRAIN_WINDOW: Duration = Duration::from_millis(50);
const MAX_EVENTS_PER_POLL: usize = 64;
const DISCONNECT_FLUSH: Duration = Duration::from_millis(250);

pub(crate) struct MqttTransport {
    options: MqttOptions,
    connect_timeout: Duration,
    session: Option<(AsyncClient, EventLoop)>,
    alive: bool,
}

impl MqttTransport {
    pub(crate) fn new(cfg: &MqttConfig, client_id: &str) -> Result<Self> {
        let mut options = MqttOptions::new(client_id, cfg.host.as_str(), cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_s));
        options.set_max_packet_size(cfg.max_packet_size, cfg.max_packet_size);

        if let Some((ca, cert, key)) = cfg.tls_paths() {
            let ca = fs::read(ca).with_context(|| format!("failed to read CA certificate: {ca}"))?;
            let cert =
                fs::read(cert).with_context(|| format!("failed to read client certificate: {cert}"))?;
            let key = fs::read(key).with_context(|| format!("failed to read client key: {key}"))?;
            options.set_transport(rumqttc::Transport::tls(ca, Some((cert, key)), None));
        }

        Ok(Self {
            options,
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
            session: None,
            alive: false,
        })
    }

    fn client(&self) -> Result<&AsyncClient> {
        self.session
            .as_ref()
            .map(|(client, _)| client)
            .ok_or_else(|| anyhow!("no mqtt session"))
    }
}

/// Poll a new event loop until the broker accepts or refuses the session.
async fn await_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        if let Event::Incoming(Packet::ConnAck(ack)) = eventloop.poll().await? {
            if ack.code == ConnectReturnCode::Success {
                return Ok(());
            }
            bail!("broker refused connection: {:?}", ack.code);
        }
    }
}

impl Transport for MqttTransport {
    async fn connect(&mut self) -> Result<()> {
        // A previous session's queued requests are not replayed.
        self.session = None;
        self.alive = false;

        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), CHANNEL_CAPACITY);
        timeout(self.connect_timeout, await_connack(&mut eventloop))
            .await
            .map_err(|_| anyhow!("no CONNACK within {:?}", self.connect_timeout))??;

        self.session = Some((client, eventloop));
        self.alive = true;
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.client()?
            .try_subscribe(topic, QoS::AtLeastOnce)
            .with_context(|| format!("subscribe {topic}"))
    }

    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client()?
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("publish {topic}"))
    }

    async fn poll(&mut self) -> Result<Vec<Inbound>> {
        let Some((_, eventloop)) = self.session.as_mut() else {
            bail!("no mqtt session");
        };

        let mut inbound = Vec::new();
        let deadline = Instant::now() + DRAIN_WINDOW;
        for _ in 0..MAX_EVENTS_PER_POLL {
            match timeout_at(deadline, eventloop.poll()).await {
                Err(_) => break,
                Ok(Ok(Event::Incoming(Packet::Publish(p)))) => {
                    debug!(topic = %p.topic, bytes = p.payload.len(), "mqtt message");
                    inbound.push(Inbound {
                        topic: p.topic,
                        payload: p.payload.to_vec(),
                    });
                }
                Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                    warn!("broker sent DISCONNECT");
                    self.alive = false;
                    break;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!("mqtt connection lost: {e}");
                    self.alive = false;
                    break;
                }
            }
        }
        Ok(inbound)
    }

    fn is_alive(&self) -> bool {
        self.alive && self.session.is_some()
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some((client, mut eventloop)) = self.session.take() else {
            return Ok(());
        };
        self.alive = false;
        if let Err(e) = client.try_disconnect() {
            warn!("could not queue DISCONNECT: {e}");
        }

        // Push out whatever is still queued (the offline status) plus the
        // DISCONNECT itself.
        let flush = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        let _ = timeout(DISCONNECT_FLUSH, flush).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> MqttConfig {
        MqttConfig {
            host: "broker.local".into(),
            port: 1883,
            keep_alive_s: 45,
            ..MqttConfig::default()
        }
    }

    #[test]
    fn options_follow_config() {
        let t = MqttTransport::new(&cfg(), "invernadero-01").unwrap();
        assert_eq!(t.options.client_id(), "invernadero-01");
        assert_eq!(t.options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(t.options.keep_alive(), Duration::from_secs(45));
        assert_eq!(t.connect_timeout, Duration::from_millis(10_000));
    }

    #[test]
    fn missing_tls_material_fails() {
        let cfg = MqttConfig {
            ca_path: Some("/nonexistent/ca.pem".into()),
            cert_path: Some("/nonexistent/cert.pem".into()),
            key_path: Some("/nonexistent/key.pem".into()),
            ..cfg()
        };
        let err = MqttTransport::new(&cfg, "n").err().unwrap();
        assert!(err.to_string().contains("CA certificate"), "{err}");
    }

    #[test]
    fn tls_material_read_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = |name: &str| dir.path().join(name).to_str().unwrap().to_string();
        for name in ["ca.pem", "cert.pem", "key.pem"] {
            fs::write(dir.path().join(name), b"-----BEGIN TEST-----").unwrap();
        }
        let cfg = MqttConfig {
            ca_path: Some(path("ca.pem")),
            cert_path: Some(path("cert.pem")),
            key_path: Some(path("key.pem")),
            ..cfg()
        };
        assert!(MqttTransport::new(&cfg, "n").is_ok());
    }

    #[test]
    fn no_session_before_connect() {
        let mut t = MqttTransport::new(&cfg(), "n").unwrap();
        assert!(!t.is_alive());
        assert!(t.publish("a/b", b"{}".to_vec()).is_err());
        assert!(t.subscribe("a/b").is_err());
    }

    #[tokio::test]
    async fn poll_and_disconnect_without_session() {
        let mut t = MqttTransport::new(&cfg(), "n").unwrap();
        assert!(t.poll().await.is_err());
        assert!(t.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn disconnect_with_full_request_queue_still_releases_session() {
        let unreachable = MqttConfig {
            host: "127.0.0.1".into(),
            port: 1,
            ..cfg()
        };
        let mut t = MqttTransport::new(&unreachable, "n").unwrap();
        let (client, eventloop) = AsyncClient::new(t.options.clone(), 1);
        client
            .try_publish("invernadero/estado", QoS::AtLeastOnce, false, b"{}".to_vec())
            .unwrap();
        t.session = Some((client, eventloop));
        t.alive = true;

        assert!(t.disconnect().await.is_ok());
        assert!(!t.is_alive());
        assert!(t.session.is_none());
    }
}
