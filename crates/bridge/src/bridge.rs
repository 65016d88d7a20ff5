//! The bridge core: one registry behind one lock, plus the channels that
//! carry its side effects out (MQTT outbox, persistence snapshots, UI
//! revision counter).
//!
//! Every mutation runs under the registry lock and, before the lock is
//! released, enqueues its publishes and hands the resulting snapshot to
//! the persistence writer. Publishes for one source therefore reach the
//! broker in the order the state changed.

use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::{Config, MqttConfig, NodeSeed};
use crate::error::{invalid, BridgeError, Result};
use crate::link::{Backoff, Link, LinkView};
use crate::logging::LogControl;
use crate::mesh::MeshHandle;
use crate::model::{CommandDefinition, Node, SensorDefinition, Snapshot};
use crate::mqtt::{Outbox, OutboxRx, Publish, BRIDGE_TAG};
use crate::registry::{ArmTimer, Registry};
use crate::state::{now_unix, ActivityView, EventKind, SharedState, SystemState};
use crate::topics::{Inbound, Topics, BROADCAST};

/// First wait between node-name lookup attempts; doubles each retry.
const LOOKUP_BASE: Duration = Duration::from_secs(1);

/// Stands in for the broker password in settings views. Sending it back
/// keeps the stored password.
const PASSWORD_MASK: &str = "********";

#[derive(Clone)]
pub struct Bridge {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) registry: Mutex<Registry>,
    outbox: Outbox,
    snapshots: watch::Sender<Snapshot>,
    revision: watch::Sender<u64>,
    pub(crate) mesh: MeshHandle,
    mqtt_link: Link,
    settings: watch::Sender<MqttConfig>,
    pub(crate) activity: SharedState,
    log: LogControl,
    config: StdMutex<Config>,
    config_path: Option<String>,
}

/// Receiving ends handed to the tasks that drain the bridge.
pub struct Channels {
    pub outbox: OutboxRx,
    pub snapshots: watch::Receiver<Snapshot>,
    pub settings: watch::Receiver<MqttConfig>,
    pub mesh_outgoing: mpsc::UnboundedReceiver<String>,
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub id: String,
    pub short_name: String,
    pub long_name: String,
    pub last_heard: i64,
    pub enabled: bool,
    pub known_keys: usize,
    pub sensors: usize,
    pub commands: usize,
}

#[derive(Serialize)]
pub struct StatusView {
    pub revision: u64,
    pub log_level: String,
    pub links: Vec<LinkView>,
    pub enabled: Vec<String>,
    pub nodes: Vec<NodeSummary>,
    pub activity: ActivityView,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: String,
    #[serde(flatten)]
    pub node: Node,
    pub pending_timers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettingsView {
    pub mqtt: MqttConfig,
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

impl Bridge {
    pub fn new(config: Config, config_path: Option<String>, log: LogControl) -> (Self, Channels) {
        let (outbox, outbox_rx) = Outbox::new();
        let (snapshots, snapshots_rx) = watch::channel(Snapshot::default());
        let (revision, _) = watch::channel(0u64);
        let (settings, settings_rx) = watch::channel(config.mqtt.clone());
        let (mesh, mesh_rx) = MeshHandle::new(
            Link::new("mesh"),
            Backoff::new(LOOKUP_BASE, config.mesh.lookup_attempts),
        );

        let inner = Inner {
            registry: Mutex::new(Registry::new(config.mqtt.topics())),
            outbox,
            snapshots,
            revision,
            mesh,
            mqtt_link: Link::new("mqtt"),
            settings,
            activity: SystemState::shared(),
            log,
            config: StdMutex::new(config),
            config_path,
        };
        let channels = Channels {
            outbox: outbox_rx,
            snapshots: snapshots_rx,
            settings: settings_rx,
            mesh_outgoing: mesh_rx,
        };
        (Self { inner: Arc::new(inner) }, channels)
    }

    pub fn mesh(&self) -> &MeshHandle {
        &self.inner.mesh
    }

    pub fn mqtt_link(&self) -> &Link {
        &self.inner.mqtt_link
    }

    pub fn activity(&self) -> &SharedState {
        &self.inner.activity
    }

    /// UI-refresh signal: bumped after every mutation.
    #[cfg(test)]
    pub fn revision(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub async fn topics(&self) -> Topics {
        self.inner.registry.lock().await.topics().clone()
    }

    // -- side effects ---------------------------------------------------------

    /// Enqueue `publishes`, hand the new snapshot to the writer and bump the
    /// revision. Call with the registry lock held.
    pub(crate) fn commit(&self, reg: &Registry, publishes: Vec<Publish>) {
        self.inner.outbox.send_all(publishes);
        self.inner.snapshots.send_replace(reg.snapshot());
        self.bump();
    }

    /// Revision bump for changes that are not persisted (message log).
    fn bump(&self) {
        self.inner.revision.send_modify(|r| *r += 1);
    }

    pub(crate) fn arm_delay_off(&self, reg: &mut Registry, node: &str, arm: ArmTimer) {
        let bridge = self.clone();
        let (owner, sensor) = (node.to_string(), arm.sensor.clone());
        let generation = reg.timers.schedule(node, &arm.sensor, arm.delay, move |generation| async move {
            bridge.expire_delay_off(&owner, &sensor, generation).await;
        });
        debug!(node, sensor = %arm.sensor, generation, delay_secs = arm.delay.as_secs(), "delay-off armed");
    }

    pub async fn expire_delay_off(&self, node: &str, sensor: &str, generation: u64) {
        let mut reg = self.inner.registry.lock().await;
        let out = reg.expire(node, sensor, generation, now_unix());
        if !out.is_empty() {
            self.commit(&reg, out);
        }
    }

    // -- lifecycle ------------------------------------------------------------

    /// Replace the registry with a persisted snapshot.
    pub async fn restore(&self, snapshot: Snapshot) {
        let mut reg = self.inner.registry.lock().await;
        let count = snapshot.nodes.len();
        reg.restore(snapshot);
        self.inner.snapshots.send_replace(reg.snapshot());
        info!(nodes = count, "state restored");
    }

    /// Startup: binary states are not trusted across a restart.
    pub async fn reset_binary_states(&self) {
        let mut reg = self.inner.registry.lock().await;
        let out = reg.reset_binary_states(now_unix());
        info!(sensors = out.len(), "binary sensors forced off");
        self.commit(&reg, out);
    }

    pub async fn seed_node(&self, seed: &NodeSeed) -> Result<()> {
        let mut reg = self.inner.registry.lock().await;
        let out = reg.seed(&seed.id, &seed.sensors, &seed.commands, seed.enabled, now_unix())?;
        self.commit(&reg, out);
        Ok(())
    }

    /// Cancels pending delay-off timers and returns the state to persist.
    pub async fn shutdown(&self) -> Snapshot {
        let mut reg = self.inner.registry.lock().await;
        reg.timers.cancel_all();
        reg.snapshot()
    }

    pub async fn on_mqtt_connected(&self) {
        {
            let reg = self.inner.registry.lock().await;
            self.inner.outbox.send_all(reg.connect_publishes());
        }
        self.bump();
        self.inner
            .activity
            .write()
            .await
            .record(EventKind::Mqtt, "mqtt connected");
    }

    pub async fn on_link_change(&self, kind: EventKind, detail: String) {
        self.inner.activity.write().await.record(kind, detail);
        self.bump();
    }

    // -- registry operations --------------------------------------------------

    pub async fn enable_node(&self, id: &str) {
        let mut reg = self.inner.registry.lock().await;
        let out = reg.enable(id, now_unix());
        self.commit(&reg, out);
    }

    pub async fn disable_node(&self, id: &str) -> Result<()> {
        let mut reg = self.inner.registry.lock().await;
        let out = reg.disable(id)?;
        self.commit(&reg, out);
        Ok(())
    }

    pub async fn clear_node(&self, id: &str) -> Result<()> {
        let mut reg = self.inner.registry.lock().await;
        let out = reg.clear(id)?;
        self.commit(&reg, out);
        Ok(())
    }

    pub async fn add_sensor(&self, id: &str, def: SensorDefinition) -> Result<()> {
        let mut reg = self.inner.registry.lock().await;
        let out = reg.add_sensor(id, def, now_unix())?;
        self.commit(&reg, out);
        Ok(())
    }

    pub async fn remove_sensor(&self, id: &str, name: &str) -> Result<()> {
        let mut reg = self.inner.registry.lock().await;
        let out = reg.remove_sensor(id, name)?;
        self.commit(&reg, out);
        Ok(())
    }

    pub async fn add_command(&self, id: &str, def: CommandDefinition) -> Result<()> {
        let mut reg = self.inner.registry.lock().await;
        let out = reg.add_command(id, def)?;
        self.commit(&reg, out);
        Ok(())
    }

    pub async fn remove_command(&self, id: &str, name: &str) -> Result<()> {
        let mut reg = self.inner.registry.lock().await;
        let out = reg.remove_command(id, name)?;
        self.commit(&reg, out);
        Ok(())
    }

    // -- outbound mesh traffic ------------------------------------------------

    /// Send free text over the mesh. `broadcast` addresses every node.
    pub async fn send_text(&self, node: &str, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(invalid("message text is empty"));
        }
        let destination = (node != BROADCAST).then_some(node);
        let mut reg = self.inner.registry.lock().await;
        if let Some(id) = destination {
            if reg.node(id).is_none() {
                return Err(BridgeError::UnknownNode(id.to_string()));
            }
        }
        self.inner.mesh.send_text(text, destination)?;
        if let Some(id) = destination {
            reg.text_sent(id, text, now_unix());
        }
        drop(reg);
        info!(node, "text sent to mesh");
        self.bump();
        Ok(())
    }

    /// Run a command from the UI: `press`, `on` or `off`.
    pub async fn execute_command(&self, node: &str, name: &str, action: &str) -> Result<()> {
        let mut reg = self.inner.registry.lock().await;
        let message = reg.resolve_action(node, name, action)?;
        self.dispatch_command(&mut reg, node, name, &message).await
    }

    /// Called with the registry lock held; takes the activity lock after it.
    async fn dispatch_command(&self, reg: &mut Registry, node: &str, name: &str, message: &str) -> Result<()> {
        self.inner.mesh.send_text(message, Some(node))?;
        let out = reg.command_sent(node, name, message, now_unix());
        self.commit(reg, out);
        info!(node, command = name, message, "command sent");
        self.inner
            .activity
            .write()
            .await
            .record(EventKind::Command, format!("{node} {name}: {message}"));
        Ok(())
    }

    // -- inbound MQTT relay ---------------------------------------------------

    /// Relay a message from the broker onto the mesh, unless the bridge
    /// wrote it itself or the topic is not a relay topic.
    pub async fn relay_inbound(&self, topic: &str, payload: &str, retained: bool) {
        if retained {
            debug!(topic, "ignoring retained message");
            return;
        }
        if payload.trim().is_empty() || payload.starts_with(BRIDGE_TAG) {
            return;
        }
        if self.inner.outbox.take_echo(topic, payload) {
            debug!(topic, "ignoring own publish");
            return;
        }

        let mut reg = self.inner.registry.lock().await;
        let Some(inbound) = reg.topics().parse_inbound(topic) else {
            debug!(topic, "not a relay topic");
            return;
        };
        let result = match inbound {
            Inbound::Text { node } => {
                let destination = (node != BROADCAST).then_some(node);
                self.inner.mesh.send_text(payload, destination).map(|()| {
                    reg.text_sent(node, payload, now_unix());
                    info!(node, "mqtt text relayed to mesh");
                    self.bump();
                })
            }
            Inbound::Command { node, name } => match reg.resolve_payload(node, name, payload) {
                Some(message) => self.dispatch_command(&mut reg, node, name, &message).await,
                None => {
                    warn!(node, command = name, payload, "unknown command or payload");
                    Ok(())
                }
            },
        };
        drop(reg);
        if let Err(e) = result {
            warn!(topic, "relay failed: {e}");
            self.inner.activity.write().await.record_error(format!("relay {topic}: {e}"));
        }
    }

    // -- display names --------------------------------------------------------

    /// Look up every node still lacking a display name.
    pub async fn refresh_names(&self) {
        let pending = self.inner.registry.lock().await.unnamed();
        for id in pending {
            match self.inner.mesh.lookup(&id).await {
                Ok(user) => {
                    let mut reg = self.inner.registry.lock().await;
                    let out = reg.set_identity(&id, &user, now_unix());
                    self.commit(&reg, out);
                }
                Err(e) => debug!(node = %id, "{e}"),
            }
        }
    }

    /// Periodic name refresh while the mesh is connected.
    pub async fn run_name_refresher(self, every: Duration) {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            if self.inner.mesh.link().is_connected() {
                self.refresh_names().await;
            }
        }
    }

    // -- views ----------------------------------------------------------------

    pub async fn status(&self) -> StatusView {
        let (enabled, nodes) = {
            let reg = self.inner.registry.lock().await;
            let enabled = reg.enabled().map(str::to_string).collect();
            let nodes = reg
                .nodes()
                .iter()
                .map(|(id, n)| NodeSummary {
                    id: id.clone(),
                    short_name: n.info.short_name.clone(),
                    long_name: n.info.long_name.clone(),
                    last_heard: n.info.last_heard,
                    enabled: n.enabled,
                    known_keys: n.known_keys.len(),
                    sensors: n.sensors.len(),
                    commands: n.commands.len(),
                })
                .collect();
            (enabled, nodes)
        };
        let activity = self.inner.activity.read().await.to_view();
        // copy out so the watch guard is not held across an await
        let revision = *self.inner.revision.borrow();
        StatusView {
            revision,
            log_level: self.inner.log.level(),
            links: vec![self.inner.mesh.link().view(), self.inner.mqtt_link.view()],
            enabled,
            nodes,
            activity,
        }
    }

    pub async fn node_view(&self, id: &str) -> Result<NodeView> {
        let reg = self.inner.registry.lock().await;
        let node = reg
            .node(id)
            .ok_or_else(|| BridgeError::UnknownNode(id.to_string()))?;
        let pending_timers = node
            .sensors
            .iter()
            .filter(|s| reg.timers.is_armed(id, s.name()))
            .map(|s| s.name().to_string())
            .collect();
        Ok(NodeView {
            id: id.to_string(),
            node: node.clone(),
            pending_timers,
        })
    }

    // -- settings -------------------------------------------------------------

    pub fn settings(&self) -> SettingsView {
        let config = self.inner.config.lock().unwrap_or_else(PoisonError::into_inner);
        let mut mqtt = config.mqtt.clone();
        if mqtt.password.is_some() {
            mqtt.password = Some(PASSWORD_MASK.to_string());
        }
        SettingsView {
            mqtt,
            log_level: self.inner.log.level(),
        }
    }

    /// Apply new broker settings: the MQTT session is torn down and
    /// re-established with them.
    pub async fn reconfigure(&self, mut mqtt: MqttConfig) -> Result<()> {
        if mqtt.password.as_deref() == Some(PASSWORD_MASK) {
            let config = self.inner.config.lock().unwrap_or_else(PoisonError::into_inner);
            mqtt.password = config.mqtt.password.clone();
        }
        let problems = mqtt.problems();
        if !problems.is_empty() {
            return Err(invalid(problems.join("; ")));
        }
        {
            let mut reg = self.inner.registry.lock().await;
            let topics = mqtt.topics();
            if reg.topics() != &topics {
                info!(prefix = %topics.prefix(), "topic layout changed");
                reg.set_topics(topics);
            }
        }
        self.update_config(|c| c.mqtt = mqtt.clone()).await;
        info!(host = %mqtt.host, port = mqtt.port, "mqtt reconfigured");
        self.inner.settings.send_replace(mqtt);
        self.inner
            .activity
            .write()
            .await
            .record_system("mqtt settings changed");
        self.bump();
        Ok(())
    }

    pub async fn set_log_level(&self, level: &str) -> Result<()> {
        self.inner.log.set_level(level)?;
        let level = self.inner.log.level();
        self.update_config(|c| c.log_level = level.clone()).await;
        self.bump();
        Ok(())
    }

    async fn update_config(&self, change: impl FnOnce(&mut Config)) {
        let config = {
            let mut config = self.inner.config.lock().unwrap_or_else(PoisonError::into_inner);
            change(&mut config);
            config.clone()
        };
        if let Some(path) = &self.inner.config_path {
            if let Err(e) = config.save(path).await {
                warn!(path = %path, "failed to save config: {e:#}");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::link::LinkStatus;
    use crate::model::OFF;

    pub(crate) fn bridge() -> (Bridge, Channels) {
        Bridge::new(Config::default(), None, LogControl::detached("INFO"))
    }

    pub(crate) fn drain(rx: &mut OutboxRx) -> Vec<Publish> {
        let mut out = Vec::new();
        while let Some(p) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    const N: &str = "!a1b2c3";

    // -- mutations ------------------------------------------------------------

    #[tokio::test]
    async fn mutation_publishes_snapshots_and_bumps_revision() {
        let (b, mut ch) = bridge();
        let rev = b.revision();
        b.enable_node(N).await;

        assert!(!drain(&mut ch.outbox).is_empty());
        assert!(ch.snapshots.has_changed().unwrap());
        assert!(ch.snapshots.borrow_and_update().nodes[N].enabled);
        assert_eq!(*rev.borrow(), 1);
    }

    #[tokio::test]
    async fn enable_then_disable_leaves_every_record_cleared() {
        let (b, mut ch) = bridge();
        b.enable_node(N).await;
        b.add_sensor(N, SensorDefinition::binary("leak", "leak", 0).unwrap())
            .await
            .unwrap();
        let announced: Vec<String> = drain(&mut ch.outbox)
            .into_iter()
            .filter(|p| p.topic.ends_with("/config") && !p.payload.is_empty())
            .map(|p| p.topic)
            .collect();

        b.disable_node(N).await.unwrap();
        let cleared: Vec<String> = drain(&mut ch.outbox)
            .into_iter()
            .filter(|p| p.payload.is_empty())
            .map(|p| p.topic)
            .collect();
        for topic in &announced {
            assert!(cleared.contains(topic), "{topic} not retracted");
        }
    }

    #[tokio::test]
    async fn reset_forces_binary_off() {
        let (b, mut ch) = bridge();
        b.enable_node(N).await;
        b.add_sensor(N, SensorDefinition::binary("door", "door", 0).unwrap())
            .await
            .unwrap();
        drain(&mut ch.outbox);
        b.reset_binary_states().await;
        assert_eq!(
            drain(&mut ch.outbox),
            vec![Publish::retained("Mesh/feeds/!a1b2c3/custom/door", OFF)]
        );
    }

    // -- commands -------------------------------------------------------------

    #[tokio::test]
    async fn command_needs_a_connected_mesh() {
        let (b, _ch) = bridge();
        b.enable_node(N).await;
        b.add_command(N, CommandDefinition::single_press("ping", "ping!").unwrap())
            .await
            .unwrap();
        let err = b.execute_command(N, "ping", "press").await.unwrap_err();
        assert!(matches!(err, BridgeError::TransportUnavailable("mesh")));
    }

    #[tokio::test]
    async fn command_goes_to_mesh_and_mqtt() {
        let (b, mut ch) = bridge();
        b.mesh().link().set(LinkStatus::Connected);
        b.enable_node(N).await;
        b.add_command(N, CommandDefinition::toggle("pump", "pump on", "pump off").unwrap())
            .await
            .unwrap();
        drain(&mut ch.outbox);

        b.execute_command(N, "pump", "on").await.unwrap();
        assert_eq!(
            ch.mesh_outgoing.try_recv().unwrap(),
            r#"{"sendText":"pump on","destinationId":"!a1b2c3"}"#
        );
        let out = drain(&mut ch.outbox);
        assert!(out.contains(&Publish::transient("Mesh/feeds/!a1b2c3/text", "pump on")));
        assert!(out.contains(&Publish::retained(
            "Mesh/feeds/!a1b2c3/command/pump/state",
            "pump on"
        )));

        let activity = b.status().await.activity;
        assert_eq!(activity.events[0].kind, EventKind::Command);
        assert_eq!(activity.events[0].detail, "!a1b2c3 pump: pump on");
    }

    #[tokio::test]
    async fn send_text_to_unknown_node_fails() {
        let (b, _ch) = bridge();
        b.mesh().link().set(LinkStatus::Connected);
        assert!(matches!(
            b.send_text("!ghost", "hi").await,
            Err(BridgeError::UnknownNode(_))
        ));
        b.send_text(BROADCAST, "hi all").await.unwrap();
    }

    // -- inbound relay --------------------------------------------------------

    #[tokio::test]
    async fn relay_forwards_text_and_commands() {
        let (b, mut ch) = bridge();
        b.mesh().link().set(LinkStatus::Connected);
        b.enable_node(N).await;
        b.add_command(N, CommandDefinition::single_press("ping", "ping!").unwrap())
            .await
            .unwrap();

        b.relay_inbound("Mesh/feeds/broadcast/text", "hello mesh", false).await;
        assert_eq!(ch.mesh_outgoing.try_recv().unwrap(), r#"{"sendText":"hello mesh"}"#);

        b.relay_inbound("Mesh/feeds/!a1b2c3/command/ping", "PRESS", false).await;
        assert_eq!(
            ch.mesh_outgoing.try_recv().unwrap(),
            r#"{"sendText":"ping!","destinationId":"!a1b2c3"}"#
        );
    }

    #[tokio::test]
    async fn relay_ignores_own_and_foreign_messages() {
        let (b, mut ch) = bridge();
        b.mesh().link().set(LinkStatus::Connected);
        b.enable_node(N).await;

        b.relay_inbound("Mesh/feeds/!a1b2c3/text", "[BRIDGE] status", false).await;
        b.relay_inbound("Mesh/feeds/!a1b2c3/text", "old", true).await;
        b.relay_inbound("Mesh/feeds/!a1b2c3/telemetry/voltage", "4.1", false).await;
        b.relay_inbound("Other/!a1b2c3/text", "hi", false).await;
        b.relay_inbound("Mesh/feeds/!a1b2c3/command/ghost", "PRESS", false).await;

        // our own text publish coming back from the broker
        b.inner.outbox.accepted("Mesh/feeds/!a1b2c3/text", "from node");
        b.relay_inbound("Mesh/feeds/!a1b2c3/text", "from node", false).await;

        assert!(ch.mesh_outgoing.try_recv().is_err());
    }

    #[tokio::test]
    async fn text_never_sent_to_the_broker_is_still_relayed() {
        let (b, mut ch) = bridge();
        b.mesh().link().set(LinkStatus::Connected);

        // queued while offline, then dropped by the session
        b.inner
            .outbox
            .send(Publish::retained("Mesh/feeds/!a1b2c3/text", "pump on"));
        drain(&mut ch.outbox);
        b.relay_inbound("Mesh/feeds/!a1b2c3/text", "pump on", false).await;

        assert!(ch.mesh_outgoing.try_recv().is_ok());
    }

    // -- settings -------------------------------------------------------------

    #[tokio::test]
    async fn reconfigure_validates_and_signals_the_session() {
        let (b, mut ch) = bridge();
        let mut mqtt = MqttConfig::default();
        mqtt.topic_prefix = "bad/#".into();
        assert!(matches!(
            b.reconfigure(mqtt.clone()).await,
            Err(BridgeError::InvalidConfiguration(_))
        ));
        assert!(!ch.settings.has_changed().unwrap());

        mqtt.topic_prefix = "Home/mesh".into();
        mqtt.password = Some("secret".into());
        b.reconfigure(mqtt).await.unwrap();
        assert!(ch.settings.has_changed().unwrap());
        assert_eq!(b.topics().await.prefix(), "Home/mesh");
        assert_eq!(b.settings().mqtt.password.as_deref(), Some(PASSWORD_MASK));

        let mut masked = b.settings().mqtt;
        masked.host = "broker.lan".into();
        b.reconfigure(masked).await.unwrap();
        assert_eq!(ch.settings.borrow_and_update().password.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn log_level_change_is_validated() {
        let (b, _ch) = bridge();
        b.set_log_level("debug").await.unwrap();
        assert_eq!(b.status().await.log_level, "DEBUG");
        assert!(b.set_log_level("chatty").await.is_err());
    }

    #[tokio::test]
    async fn settings_changes_are_written_to_the_config_file() {
        let path = std::env::temp_dir().join(format!("mesh-bridge-live-{}.toml", std::process::id()));
        let path = path.to_string_lossy().to_string();
        let (b, _ch) = Bridge::new(Config::default(), Some(path.clone()), LogControl::detached("INFO"));

        b.set_log_level("warning").await.unwrap();
        let saved = crate::config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(saved.log_level, "WARNING");
    }

    // -- views ----------------------------------------------------------------

    #[test]
    fn view_futures_are_send() {
        fn assert_send<T: Send>(_: &T) {}
        let (b, _ch) = bridge();
        assert_send(&b.status());
        assert_send(&b.node_view("!a"));
        assert_send(&b.set_log_level("debug"));
    }

    #[tokio::test]
    async fn node_view_reports_unknown_nodes() {
        let (b, _ch) = bridge();
        assert!(matches!(
            b.node_view("!nope").await,
            Err(BridgeError::UnknownNode(_))
        ));
        b.enable_node(N).await;
        let view = b.node_view(N).await.unwrap();
        assert!(view.node.enabled);
        let status = b.status().await;
        assert_eq!(status.enabled, vec![N.to_string()]);
        assert_eq!(status.links.len(), 2);
    }
}
