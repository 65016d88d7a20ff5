//! The registry owns every node, its definitions, sensor states and known
//! keys. It never does I/O: each operation mutates in-memory state and
//! returns the MQTT publishes that mutation implies, in order. The caller
//! holds the registry lock while it enqueues them.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::decoder::Metrics;
use crate::discovery::{self, is_numeric_key};
use crate::error::{invalid, BridgeError, Result};
use crate::model::{
    CommandDefinition, Direction, Node, NodeRecord, SensorDefinition, SensorKind, SensorState,
    Snapshot, StoredState, OFF, ON, POSITION_KEY,
};
use crate::mqtt::Publish;
use crate::packet::{NodeUser, Position};
use crate::sensors::format_reading;
use crate::timers::DelayOffTimers;
use crate::topics::Topics;

/// A delay-off timer the caller must arm for the node's sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmTimer {
    pub sensor: String,
    pub delay: Duration,
}

#[derive(Debug, Default)]
pub struct TextOutcome {
    pub publishes: Vec<Publish>,
    pub arm: Vec<ArmTimer>,
}

pub struct Registry {
    topics: Topics,
    nodes: BTreeMap<String, Node>,
    pub timers: DelayOffTimers,
}

fn ensure<'a>(nodes: &'a mut BTreeMap<String, Node>, id: &str, now: i64) -> &'a mut Node {
    nodes
        .entry(id.to_string())
        .or_insert_with(|| Node::new(id, now))
}

fn unknown(id: &str) -> BridgeError {
    BridgeError::UnknownNode(id.to_string())
}

fn announce_keys<'k>(
    topics: &Topics,
    id: &str,
    node: &Node,
    keys: impl IntoIterator<Item = &'k String>,
) -> Vec<Publish> {
    keys.into_iter()
        .flat_map(|k| discovery::announce(topics, id, node, k))
        .collect()
}

fn retract_keys<'k>(
    topics: &Topics,
    id: &str,
    node: &Node,
    keys: impl IntoIterator<Item = &'k String>,
) -> Vec<Publish> {
    keys.into_iter()
        .flat_map(|k| discovery::retract(topics, id, node, k))
        .collect()
}

/// Every key discovery may know about for `node`: known keys, definitions
/// and the position tracker.
fn all_keys(node: &Node) -> BTreeSet<String> {
    let mut keys = node.known_keys.clone();
    keys.extend(node.definition_names().map(str::to_string));
    keys.insert(POSITION_KEY.to_string());
    keys
}

/// Drop known keys that are neither a definition, a standard numeric
/// telemetry key nor the position tracker, and make sure every definition
/// is known. Returns the dropped keys. Idempotent.
fn prune(node: &mut Node) -> Vec<String> {
    let defs: BTreeSet<String> = node.definition_names().map(str::to_string).collect();
    let dropped: Vec<String> = node
        .known_keys
        .iter()
        .filter(|k| !defs.contains(*k) && !is_numeric_key(k) && k.as_str() != POSITION_KEY)
        .cloned()
        .collect();
    for k in &dropped {
        node.known_keys.remove(k);
    }
    node.known_keys.extend(defs);
    dropped
}

/// Text form of a telemetry value: numbers for numeric keys, raw text
/// otherwise.
fn telemetry_value(key: &str, value: &Value) -> String {
    if value.is_null() {
        return String::new();
    }
    if is_numeric_key(key) {
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            _ => None,
        };
        match parsed {
            Some(v) => return format_reading(v),
            None => warn!(key, value = %value, "non-numeric value for numeric key"),
        }
    }
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Registry {
    pub fn new(topics: Topics) -> Self {
        Self {
            topics,
            nodes: BTreeMap::new(),
            timers: DelayOffTimers::new(),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn set_topics(&mut self, topics: Topics) {
        self.topics = topics;
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> &BTreeMap<String, Node> {
        &self.nodes
    }

    pub fn enabled(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.enabled)
            .map(|(id, _)| id.as_str())
    }

    /// Nodes whose display name still needs a lookup.
    pub fn unnamed(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(id, n)| n.needs_name(id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    // -- packets --------------------------------------------------------------

    /// Make sure the node exists and mark it heard.
    pub fn touch(&mut self, id: &str, now: i64) {
        ensure(&mut self.nodes, id, now).info.last_heard = now;
    }

    /// Update display names; an enabled node gets its discovery refreshed
    /// so entity names follow.
    pub fn set_identity(&mut self, id: &str, user: &NodeUser, now: i64) -> Vec<Publish> {
        let node = ensure(&mut self.nodes, id, now);
        let pick = |s: &str| {
            if s.trim().is_empty() {
                id.to_string()
            } else {
                s.trim().to_string()
            }
        };
        node.info.short_name = pick(&user.short_name);
        node.info.long_name = pick(&user.long_name);
        info!(node = %id, short = %node.info.short_name, long = %node.info.long_name, "node identity");
        if node.enabled {
            self.refresh_discovery(id)
        } else {
            Vec::new()
        }
    }

    /// Re-announce every known key and definition of an enabled node.
    pub fn refresh_discovery(&self, id: &str) -> Vec<Publish> {
        match self.nodes.get(id) {
            Some(node) if node.enabled => {
                let mut keys = node.known_keys.clone();
                keys.extend(node.definition_names().map(str::to_string));
                announce_keys(&self.topics, id, node, &keys)
            }
            _ => Vec::new(),
        }
    }

    pub fn apply_telemetry(&mut self, id: &str, metrics: &Metrics, now: i64) -> Vec<Publish> {
        let node = ensure(&mut self.nodes, id, now);
        let Some(group) = metrics.get("deviceMetrics").and_then(Value::as_object) else {
            debug!(node = %id, "telemetry without device metrics");
            return Vec::new();
        };
        let mut out = Vec::new();
        for (key, value) in group {
            let key = key.to_lowercase();
            out.push(Publish::retained(
                self.topics.telemetry(id, &key),
                telemetry_value(&key, value),
            ));
            if is_numeric_key(&key) && node.known_keys.insert(key.clone()) {
                debug!(node = %id, key = %key, "new telemetry key");
                if node.enabled {
                    out.extend(discovery::announce(&self.topics, id, node, &key));
                }
            }
        }
        out
    }

    pub fn apply_position(&mut self, id: &str, pos: &Position, now: i64) -> Vec<Publish> {
        let node = ensure(&mut self.nodes, id, now);
        let location = json!({ "latitude": pos.lat(), "longitude": pos.lon() });
        let mut out = vec![Publish::retained(self.topics.location(id), location.to_string())];
        if node.known_keys.insert(POSITION_KEY.to_string()) && node.enabled {
            out.extend(discovery::announce(&self.topics, id, node, POSITION_KEY));
        }
        for (key, value) in pos.extras() {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push(Publish::retained(self.topics.position(id, key), text));
            if node.known_keys.insert(key.to_string()) && node.enabled {
                out.extend(discovery::announce(&self.topics, id, node, key));
            }
        }
        out
    }

    /// Log and publish a text message, then run it through every custom
    /// sensor of the node.
    pub fn apply_text(&mut self, id: &str, text: &str, now: i64) -> TextOutcome {
        let node = ensure(&mut self.nodes, id, now);
        node.log_message(now, Direction::Received, text);

        let mut outcome = TextOutcome::default();
        outcome
            .publishes
            .push(Publish::retained(self.topics.text(id), text));

        for def in node.sensors.clone() {
            let topic = self.topics.sensor(id, def.topic(), def.name());
            let value = match def.kind() {
                SensorKind::Numeric => match def.matcher().reading(text) {
                    Some(v) => format_reading(v),
                    None => continue,
                },
                SensorKind::Binary { delay_off } => {
                    let Some(on) = def.matcher().signal(text) else {
                        continue;
                    };
                    self.timers.cancel(id, def.name());
                    if on && !delay_off.is_zero() {
                        outcome.arm.push(ArmTimer {
                            sensor: def.name().to_string(),
                            delay: delay_off,
                        });
                    }
                    (if on { ON } else { OFF }).to_string()
                }
            };
            debug!(node = %id, sensor = %def.name(), value = %value, "sensor reading");
            node.states.insert(
                def.name().to_string(),
                SensorState::new(&value, now, def.delay_off()),
            );
            outcome.publishes.push(Publish::retained(topic, value));
            if node.known_keys.insert(def.name().to_string()) && node.enabled {
                outcome
                    .publishes
                    .extend(discovery::announce(&self.topics, id, node, def.name()));
            }
        }
        outcome
    }

    /// Delay-off timer fired. Turns the sensor OFF only if this timer is
    /// still the current one, the sensor is still ON and the full delay has
    /// passed since it last changed.
    pub fn expire(&mut self, id: &str, sensor: &str, generation: u64, now: i64) -> Vec<Publish> {
        if !self.timers.complete(id, sensor, generation) {
            debug!(node = %id, sensor, generation, "stale delay-off timer");
            return Vec::new();
        }
        let Some(node) = self.nodes.get_mut(id) else {
            return Vec::new();
        };
        let Some(def) = node.sensor(sensor).cloned() else {
            return Vec::new();
        };
        let Some(state) = node.states.get_mut(sensor) else {
            return Vec::new();
        };
        let delay = def.delay_off();
        let elapsed = match state.touched {
            Some(t) => t.elapsed() >= delay,
            None => now.saturating_sub(state.last_update) >= delay.as_secs() as i64,
        };
        if !state.is_on() || !elapsed {
            return Vec::new();
        }
        state.value = OFF.to_string();
        state.last_update = now;
        state.touched = Some(Instant::now());
        info!(node = %id, sensor, delay_secs = delay.as_secs(), "auto-off");
        vec![Publish::retained(
            self.topics.sensor(id, def.topic(), def.name()),
            OFF,
        )]
    }

    // -- definitions ----------------------------------------------------------

    pub fn add_sensor(&mut self, id: &str, def: SensorDefinition, now: i64) -> Result<Vec<Publish>> {
        let node = self.nodes.get_mut(id).ok_or_else(|| unknown(id))?;
        if node.has_definition(def.name()) {
            return Err(invalid(format!(
                "node '{id}' already has a sensor or command named '{}'",
                def.name()
            )));
        }
        let name = def.name().to_string();
        if def.is_binary() {
            node.states
                .insert(name.clone(), SensorState::new(OFF, now, def.delay_off()));
        }
        node.sensors.push(def);
        node.known_keys.insert(name.clone());
        info!(node = %id, sensor = %name, "sensor added");
        Ok(if node.enabled {
            discovery::announce(&self.topics, id, node, &name)
        } else {
            Vec::new()
        })
    }

    pub fn remove_sensor(&mut self, id: &str, name: &str) -> Result<Vec<Publish>> {
        let node = self.nodes.get_mut(id).ok_or_else(|| unknown(id))?;
        if node.sensor(name).is_none() {
            return Err(BridgeError::UnknownDefinition {
                node: id.to_string(),
                name: name.to_string(),
            });
        }
        let out = discovery::retract(&self.topics, id, node, name);
        self.timers.cancel(id, name);
        node.states.remove(name);
        node.sensors.retain(|s| s.name() != name);
        node.known_keys.remove(name);
        info!(node = %id, sensor = %name, "sensor removed");
        Ok(out)
    }

    pub fn add_command(&mut self, id: &str, def: CommandDefinition) -> Result<Vec<Publish>> {
        let node = self.nodes.get_mut(id).ok_or_else(|| unknown(id))?;
        if node.has_definition(def.name()) {
            return Err(invalid(format!(
                "node '{id}' already has a sensor or command named '{}'",
                def.name()
            )));
        }
        let name = def.name().to_string();
        node.commands.push(def);
        node.known_keys.insert(name.clone());
        info!(node = %id, command = %name, "command added");
        Ok(if node.enabled {
            discovery::announce(&self.topics, id, node, &name)
        } else {
            Vec::new()
        })
    }

    pub fn remove_command(&mut self, id: &str, name: &str) -> Result<Vec<Publish>> {
        let node = self.nodes.get_mut(id).ok_or_else(|| unknown(id))?;
        if node.command(name).is_none() {
            return Err(BridgeError::UnknownDefinition {
                node: id.to_string(),
                name: name.to_string(),
            });
        }
        let out = discovery::retract(&self.topics, id, node, name);
        node.commands.retain(|c| c.name() != name);
        node.known_keys.remove(name);
        info!(node = %id, command = %name, "command removed");
        Ok(out)
    }

    /// Create a node from startup configuration. Definitions whose name is
    /// already taken on the node are left alone.
    pub fn seed(
        &mut self,
        id: &str,
        sensors: &[SensorDefinition],
        commands: &[CommandDefinition],
        enable: bool,
        now: i64,
    ) -> Result<Vec<Publish>> {
        ensure(&mut self.nodes, id, now);
        let mut out = Vec::new();
        for def in sensors {
            if !self.nodes[id].has_definition(def.name()) {
                out.extend(self.add_sensor(id, def.clone(), now)?);
            }
        }
        for def in commands {
            if !self.nodes[id].has_definition(def.name()) {
                out.extend(self.add_command(id, def.clone())?);
            }
        }
        if enable && !self.nodes[id].enabled {
            out.extend(self.enable(id, now));
        }
        Ok(out)
    }

    // -- enablement -----------------------------------------------------------

    /// Enable discovery for a node, creating it if needed. Known keys are
    /// pruned first (stale ones retracted), then every remaining key, every
    /// definition and the position tracker is announced.
    pub fn enable(&mut self, id: &str, now: i64) -> Vec<Publish> {
        let node = ensure(&mut self.nodes, id, now);
        node.enabled = true;

        let mut out = Vec::new();
        let dropped = prune(node);
        if !dropped.is_empty() {
            info!(node = %id, keys = ?dropped, "pruned stale keys");
        }
        out.extend(retract_keys(&self.topics, id, node, &dropped));
        out.extend(announce_keys(&self.topics, id, node, &all_keys(node)));
        info!(node = %id, "node enabled");
        out
    }

    /// Retract everything discovery knows about the node. Known keys are
    /// left alone so a later enable restores the same entities.
    pub fn disable(&mut self, id: &str) -> Result<Vec<Publish>> {
        let node = self.nodes.get_mut(id).ok_or_else(|| unknown(id))?;
        node.enabled = false;
        info!(node = %id, "node disabled");
        Ok(retract_keys(&self.topics, id, node, &all_keys(node)))
    }

    /// Forget the node entirely.
    pub fn clear(&mut self, id: &str) -> Result<Vec<Publish>> {
        let node = self.nodes.get(id).ok_or_else(|| unknown(id))?;
        let out = retract_keys(&self.topics, id, node, &all_keys(node));
        self.timers.cancel_node(id);
        self.nodes.remove(id);
        info!(node = %id, "node cleared");
        Ok(out)
    }

    // -- commands -------------------------------------------------------------

    /// Message to send for a UI action on a command.
    pub fn resolve_action(&self, id: &str, name: &str, action: &str) -> Result<String> {
        let node = self.nodes.get(id).ok_or_else(|| unknown(id))?;
        let cmd = node.command(name).ok_or_else(|| BridgeError::UnknownDefinition {
            node: id.to_string(),
            name: name.to_string(),
        })?;
        cmd.message_for_action(action)
            .map(str::to_string)
            .ok_or_else(|| invalid(format!("command '{name}' does not accept action '{action}'")))
    }

    /// Message to send for an inbound MQTT command payload, if it is valid.
    pub fn resolve_payload(&self, id: &str, name: &str, payload: &str) -> Option<String> {
        self.nodes
            .get(id)?
            .command(name)?
            .message_for_payload(payload)
            .map(str::to_string)
    }

    /// Record a command message that went out over the mesh.
    pub fn command_sent(&mut self, id: &str, name: &str, message: &str, now: i64) -> Vec<Publish> {
        let Some(node) = self.nodes.get_mut(id) else {
            return Vec::new();
        };
        node.log_message(now, Direction::Sent, message);
        let mut out = vec![Publish::transient(self.topics.text(id), message)];
        if node.command(name).is_some_and(CommandDefinition::is_toggle) {
            out.push(Publish::retained(self.topics.command_state(id, name), message));
        }
        out
    }

    /// Record free text that went out over the mesh.
    pub fn text_sent(&mut self, id: &str, message: &str, now: i64) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.log_message(now, Direction::Sent, message);
        }
    }

    // -- lifecycle ------------------------------------------------------------

    /// Force every binary sensor OFF. Device-side edges cannot be trusted
    /// across a restart.
    pub fn reset_binary_states(&mut self, now: i64) -> Vec<Publish> {
        self.timers.cancel_all();
        let mut out = Vec::new();
        for (id, node) in self.nodes.iter_mut() {
            for def in node.sensors.iter().filter(|s| s.is_binary()) {
                node.states.insert(
                    def.name().to_string(),
                    SensorState::new(OFF, now, def.delay_off()),
                );
                out.push(Publish::retained(
                    self.topics.sensor(id, def.topic(), def.name()),
                    OFF,
                ));
            }
        }
        out
    }

    /// Everything a fresh broker session needs: current binary states and
    /// discovery for every enabled node.
    pub fn connect_publishes(&self) -> Vec<Publish> {
        let mut out = Vec::new();
        for (id, node) in &self.nodes {
            if node.enabled {
                // announce already carries binary states
                out.extend(self.refresh_discovery(id));
                continue;
            }
            for def in node.sensors.iter().filter(|s| s.is_binary()) {
                out.push(Publish::retained(
                    self.topics.sensor(id, def.topic(), def.name()),
                    node.state_value(def.name()),
                ));
            }
        }
        out
    }

    pub fn snapshot(&self) -> Snapshot {
        let nodes = self
            .nodes
            .iter()
            .map(|(id, n)| {
                let record = NodeRecord {
                    info: n.info.clone(),
                    enabled: n.enabled,
                    known_keys: n.known_keys.clone(),
                    sensors: n.sensors.clone(),
                    commands: n.commands.clone(),
                    states: n
                        .states
                        .iter()
                        .map(|(k, s)| (k.clone(), StoredState::from(s)))
                        .collect(),
                };
                (id.clone(), record)
            })
            .collect();
        Snapshot { nodes }
    }

    /// Replace all nodes with a persisted snapshot, reconciling known keys
    /// against the loaded definitions.
    pub fn restore(&mut self, snapshot: Snapshot) {
        self.timers.cancel_all();
        self.nodes.clear();
        for (id, record) in snapshot.nodes {
            let mut node = Node::new(&id, record.info.last_heard);
            node.info = record.info;
            node.enabled = record.enabled;
            node.known_keys = record.known_keys;
            node.sensors = record.sensors;
            node.commands = record.commands;
            node.states = record
                .states
                .into_iter()
                .map(|(k, s)| (k, SensorState::from(s)))
                .collect();
            let dropped = prune(&mut node);
            if !dropped.is_empty() {
                info!(node = %id, keys = ?dropped, "pruned stale keys on load");
            }
            self.nodes.insert(id, node);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
