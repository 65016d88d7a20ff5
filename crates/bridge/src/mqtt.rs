use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::config::MqttConfig;
use crate::error::BridgeError;
use crate::link::{Link, LinkStatus, ReconnectPolicy};
use crate::state::EventKind;

/// Prefix marking text that originated from the bridge; never relayed.
pub const BRIDGE_TAG: &str = "[BRIDGE]";

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_CAPACITY: usize = 64;
const ECHO_MEMORY: usize = 64;

// ---------------------------------------------------------------------------
// Outgoing messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl Publish {
    pub fn retained(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: true,
        }
    }

    pub fn transient(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    /// Empty retained payload: deletes the broker's retained copy.
    pub fn cleared(topic: impl Into<String>) -> Self {
        Self::retained(topic, "")
    }
}

/// Ordered queue of publishes for the MQTT session. Enqueueing never
/// blocks, so it is safe under the registry lock.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Publish>,
    echoes: Echoes,
}

/// Receiving end of the [`Outbox`], owned by the MQTT session.
pub struct OutboxRx {
    rx: mpsc::UnboundedReceiver<Publish>,
    echoes: Echoes,
}

/// Text-topic publishes the broker accepted recently, so the copies it hands
/// back on the bridge's own subscription can be recognised.
#[derive(Clone, Default)]
struct Echoes(Arc<Mutex<VecDeque<(String, String)>>>);

impl Echoes {
    fn remember(&self, topic: String, payload: String) {
        let mut echoes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if echoes.len() >= ECHO_MEMORY {
            echoes.pop_front();
        }
        echoes.push_back((topic, payload));
    }

    fn take(&self, topic: &str, payload: &str) -> bool {
        let mut echoes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match echoes.iter().position(|(t, p)| t == topic && p == payload) {
            Some(i) => {
                echoes.remove(i);
                true
            }
            None => false,
        }
    }
}

impl Outbox {
    pub fn new() -> (Self, OutboxRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let echoes = Echoes::default();
        let outbox = Self {
            tx,
            echoes: echoes.clone(),
        };
        (outbox, OutboxRx { rx, echoes })
    }

    pub fn send(&self, publish: Publish) {
        if self.tx.send(publish).is_err() {
            debug!("mqtt outbox closed; publish dropped");
        }
    }

    pub fn send_all(&self, publishes: impl IntoIterator<Item = Publish>) {
        for p in publishes {
            self.send(p);
        }
    }

    /// True (and forgotten) if the broker recently accepted this text from
    /// the bridge.
    pub fn take_echo(&self, topic: &str, payload: &str) -> bool {
        self.echoes.take(topic, payload)
    }

    /// Record a text as accepted by the broker without a live session.
    #[cfg(test)]
    pub fn accepted(&self, topic: &str, payload: &str) {
        self.echoes.remember(topic.into(), payload.into());
    }
}

impl OutboxRx {
    pub async fn recv(&mut self) -> Option<Publish> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<Publish> {
        self.rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Session manager
// ---------------------------------------------------------------------------

enum Ended {
    Lost(String),
    Reconfigured,
    Shutdown,
}

/// Owns the broker connection: connects with a fixed-delay policy, pumps
/// inbound messages into the bridge, forwards the outbox, and starts over
/// whenever the settings change.
pub struct MqttManager {
    settings: watch::Receiver<MqttConfig>,
    outbox: OutboxRx,
    link: Link,
    policy: ReconnectPolicy,
}

impl MqttManager {
    pub fn new(
        settings: watch::Receiver<MqttConfig>,
        outbox: OutboxRx,
        link: Link,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            settings,
            outbox,
            link,
            policy,
        }
    }

    pub async fn run(mut self, bridge: Bridge) {
        loop {
            let settings = self.settings.borrow_and_update().clone();

            if settings.host.trim().is_empty() {
                info!("mqtt broker not configured; waiting for settings");
                self.link.set(LinkStatus::Disconnected);
                tokio::select! {
                    _ = drain(&mut self.outbox) => return,
                    changed = self.settings.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }

            info!(host = %settings.host, port = settings.port, "connecting to mqtt broker");
            let connected = tokio::select! {
                c = self.policy.connect(&self.link, |_| connect(&settings)) => c,
                _ = drain(&mut self.outbox) => return,
                changed = self.settings.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            };
            let Some((client, mut eventloop)) = connected else {
                continue;
            };

            let topics = bridge.topics().await;
            for filter in topics.subscriptions() {
                if let Err(e) = client.subscribe(filter.as_str(), QoS::AtLeastOnce).await {
                    warn!(filter = %filter, "subscribe failed: {e}");
                }
            }
            bridge.on_mqtt_connected().await;

            let ended = tokio::select! {
                reason = pump(&mut eventloop, &bridge) => Ended::Lost(reason),
                reason = forward(&client, &mut self.outbox) => match reason {
                    Some(reason) => Ended::Lost(reason),
                    None => Ended::Shutdown,
                },
                changed = self.settings.changed() => match changed {
                    Ok(()) => Ended::Reconfigured,
                    Err(_) => Ended::Shutdown,
                },
            };

            match ended {
                Ended::Lost(reason) => {
                    warn!("mqtt connection lost: {reason}");
                    self.link.set(LinkStatus::Error(reason.clone()));
                    bridge
                        .on_link_change(EventKind::Error, format!("mqtt connection lost: {reason}"))
                        .await;
                    sleep(self.policy.delay).await;
                }
                Ended::Reconfigured => {
                    info!("mqtt settings changed; reconnecting");
                    // best effort: the request only goes out if the loop is still polled
                    let _ = client.try_disconnect();
                    self.link.set(LinkStatus::Disconnected);
                }
                Ended::Shutdown => {
                    self.link.set(LinkStatus::Disconnected);
                    return;
                }
            }
        }
    }
}

async fn connect(settings: &MqttConfig) -> Result<(AsyncClient, EventLoop), BridgeError> {
    let mut opts = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    opts.set_keep_alive(KEEP_ALIVE);
    if let Some(user) = settings.username.as_deref().filter(|u| !u.is_empty()) {
        opts.set_credentials(user, settings.password.clone().unwrap_or_default());
    }
    let (client, mut eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);

    let handshake = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(BridgeError::ConnectionFailure(e.to_string())),
            }
        }
    };
    match timeout(CONNECT_TIMEOUT, handshake).await {
        Ok(Ok(())) => Ok((client, eventloop)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(BridgeError::ConnectionFailure("timed out waiting for CONNACK".into())),
    }
}

/// Poll the event loop until the connection fails.
async fn pump(eventloop: &mut EventLoop, bridge: &Bridge) -> String {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let payload = String::from_utf8_lossy(&p.payload).into_owned();
                bridge.relay_inbound(&p.topic, &payload, p.retain).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => return "broker closed the session".into(),
            Ok(_) => {}
            Err(e) => return e.to_string(),
        }
    }
}

/// Forward queued publishes in order. `None` once every sender is gone.
async fn forward(client: &AsyncClient, outbox: &mut OutboxRx) -> Option<String> {
    while let Some(p) = outbox.recv().await {
        debug!(topic = %p.topic, retain = p.retain, "publish");
        let echo = (p.topic.ends_with("/text") && !p.payload.is_empty())
            .then(|| (p.topic.clone(), p.payload.clone()));
        if let Err(e) = client
            .publish(p.topic, QoS::AtLeastOnce, p.retain, p.payload)
            .await
        {
            return Some(e.to_string());
        }
        if let Some((topic, payload)) = echo {
            outbox.echoes.remember(topic, payload);
        }
    }
    None
}

/// Discard publishes while there is no session. Returns once every sender
/// is gone.
async fn drain(outbox: &mut OutboxRx) {
    while let Some(p) = outbox.recv().await {
        debug!(topic = %p.topic, "mqtt offline; publish dropped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Publish --------------------------------------------------------------

    #[test]
    fn cleared_is_empty_and_retained() {
        let p = Publish::cleared("a/b");
        assert!(p.retain);
        assert!(p.payload.is_empty());
        assert!(!Publish::transient("a/b", "x").retain);
    }

    // -- Outbox ---------------------------------------------------------------

    #[tokio::test]
    async fn outbox_preserves_order() {
        let (outbox, mut rx) = Outbox::new();
        outbox.send_all([
            Publish::retained("t/1", "a"),
            Publish::retained("t/2", "b"),
            Publish::retained("t/1", "c"),
        ]);
        let got: Vec<String> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|p| p.payload)
        .collect();
        assert_eq!(got, ["a", "b", "c"]);
    }

    fn offline_client() -> (AsyncClient, EventLoop) {
        AsyncClient::new(MqttOptions::new("test", "127.0.0.1", 1), REQUEST_CAPACITY)
    }

    #[tokio::test]
    async fn forwarded_text_is_remembered_once() {
        let (outbox, mut rx) = Outbox::new();
        let (client, _eventloop) = offline_client();
        outbox.send(Publish::retained("Mesh/feeds/!a/text", "hello"));
        outbox.send(Publish::retained("Mesh/feeds/!a/telemetry/voltage", "4.1"));
        outbox.send(Publish::cleared("Mesh/feeds/!b/text"));
        let echoes = outbox.echoes.clone();
        drop(outbox);

        assert_eq!(forward(&client, &mut rx).await, None);
        assert!(echoes.take("Mesh/feeds/!a/text", "hello"));
        assert!(!echoes.take("Mesh/feeds/!a/text", "hello"));
        assert!(!echoes.take("Mesh/feeds/!a/telemetry/voltage", "4.1"));
        assert!(!echoes.take("Mesh/feeds/!b/text", ""));
    }

    #[tokio::test]
    async fn text_dropped_offline_is_not_an_echo() {
        let (outbox, mut rx) = Outbox::new();
        outbox.send(Publish::retained("Mesh/feeds/!a/text", "hello"));
        let echoes = outbox.echoes.clone();
        drop(outbox);

        drain(&mut rx).await;
        assert!(!echoes.take("Mesh/feeds/!a/text", "hello"));
    }

    #[test]
    fn echo_memory_is_bounded() {
        let echoes = Echoes::default();
        for i in 0..(ECHO_MEMORY + 1) {
            echoes.remember("p/n/text".into(), i.to_string());
        }
        assert!(!echoes.take("p/n/text", "0"));
        assert!(echoes.take("p/n/text", &ECHO_MEMORY.to_string()));
    }

    #[test]
    fn outbox_send_after_close_is_silent() {
        let (outbox, rx) = Outbox::new();
        drop(rx);
        outbox.send(Publish::retained("t", "x"));
    }

    // -- drain ----------------------------------------------------------------

    #[tokio::test]
    async fn drain_returns_when_senders_close() {
        let (outbox, mut rx) = Outbox::new();
        outbox.send(Publish::retained("t", "x"));
        drop(outbox);
        drain(&mut rx).await;
        assert!(rx.recv().await.is_none());
    }

    // -- connect --------------------------------------------------------------

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let settings = MqttConfig {
            host: "127.0.0.1".into(),
            port: 1,
            ..MqttConfig::default()
        };
        let err = connect(&settings).await.err().unwrap();
        assert!(matches!(err, BridgeError::ConnectionFailure(_)));
    }
}
