//! Per-node data: display info, custom sensor and command definitions,
//! runtime sensor state, and the persisted snapshot shape.
//!
//! Definitions are validated when they are built, including when they are
//! deserialized from an API request or the store, so a definition value in
//! hand is always well-formed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::discovery::EntityKind;
use crate::error::{invalid, BridgeError, Result};
use crate::sensors::Matcher;

pub const ON: &str = "ON";
pub const OFF: &str = "OFF";

/// Well-known key for the combined latitude/longitude tracker.
pub const POSITION_KEY: &str = "position";

pub const DEFAULT_SENSOR_TOPIC: &str = "custom";
pub const DEFAULT_DEVICE_CLASS: &str = "sensor";

/// Payload a button entity sends when pressed.
pub const PRESS: &str = "PRESS";

/// Maximum number of messages retained per node.
const MAX_MESSAGES: usize = 200;

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn required(what: &str, value: &str) -> Result<String> {
    let v = value.trim();
    if v.is_empty() {
        return Err(invalid(format!("{what} is required")));
    }
    if v.contains(['+', '#']) {
        return Err(invalid(format!("{what} '{v}' contains an MQTT wildcard")));
    }
    Ok(v.to_string())
}

/// A name that ends up as a single topic segment.
fn segment(what: &str, value: &str) -> Result<String> {
    let v = required(what, value)?;
    if v.contains('/') {
        return Err(invalid(format!("{what} '{v}' must not contain '/'")));
    }
    Ok(v)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Sensor definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    #[default]
    Numeric,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    /// Publishes the number following the pattern.
    Numeric,
    /// ON/OFF; `delay_off` of zero disables the auto-off timer.
    Binary { delay_off: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SensorForm", into = "SensorForm")]
pub struct SensorDefinition {
    name: String,
    pattern: String,
    topic: String,
    device_class: String,
    kind: SensorKind,
    matcher: Matcher,
}

/// Flat wire shape of a sensor definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorForm {
    #[serde(alias = "sensor_name")]
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub device_class: Option<String>,
    #[serde(default)]
    pub value_type: ValueKind,
    /// Seconds; ignored for numeric sensors.
    #[serde(default)]
    pub delay_off: u64,
}

impl TryFrom<SensorForm> for SensorDefinition {
    type Error = BridgeError;

    fn try_from(form: SensorForm) -> Result<Self> {
        let name = segment("sensor name", &form.name)?;
        let pattern = form.pattern.trim();
        if pattern.is_empty() {
            return Err(invalid(format!("sensor '{name}': pattern is required")));
        }
        let topic = match non_blank(form.topic) {
            Some(t) => {
                let t = required("sensor topic", &t)?;
                if t.starts_with('/') || t.ends_with('/') || t.contains("//") {
                    return Err(invalid(format!("sensor topic '{t}' has an empty segment")));
                }
                t
            }
            None => DEFAULT_SENSOR_TOPIC.to_string(),
        };
        let device_class = non_blank(form.device_class)
            .map(|d| d.trim().to_string())
            .unwrap_or_else(|| DEFAULT_DEVICE_CLASS.to_string());
        let kind = match form.value_type {
            ValueKind::Numeric => SensorKind::Numeric,
            ValueKind::Binary => SensorKind::Binary {
                delay_off: Duration::from_secs(form.delay_off),
            },
        };
        let matcher = match kind {
            SensorKind::Numeric => Matcher::numeric(pattern),
            SensorKind::Binary { .. } => Matcher::binary(pattern),
        }
        .map_err(|e| invalid(format!("sensor '{name}': bad pattern: {e}")))?;
        Ok(Self {
            name,
            pattern: pattern.to_string(),
            topic,
            device_class,
            kind,
            matcher,
        })
    }
}

impl From<SensorDefinition> for SensorForm {
    fn from(def: SensorDefinition) -> Self {
        let (value_type, delay_off) = match def.kind {
            SensorKind::Numeric => (ValueKind::Numeric, 0),
            SensorKind::Binary { delay_off } => (ValueKind::Binary, delay_off.as_secs()),
        };
        Self {
            name: def.name,
            pattern: def.pattern,
            topic: Some(def.topic),
            device_class: Some(def.device_class),
            value_type,
            delay_off,
        }
    }
}

impl SensorDefinition {
    pub fn numeric(name: &str, pattern: &str) -> Result<Self> {
        Self::try_from(SensorForm {
            name: name.to_string(),
            pattern: pattern.to_string(),
            topic: None,
            device_class: None,
            value_type: ValueKind::Numeric,
            delay_off: 0,
        })
    }

    pub fn binary(name: &str, pattern: &str, delay_off_secs: u64) -> Result<Self> {
        Self::try_from(SensorForm {
            name: name.to_string(),
            pattern: pattern.to_string(),
            topic: None,
            device_class: None,
            value_type: ValueKind::Binary,
            delay_off: delay_off_secs,
        })
    }

    pub fn with_device_class(mut self, device_class: &str) -> Self {
        if !device_class.trim().is_empty() {
            self.device_class = device_class.trim().to_string();
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Compiled at validation; shared by every packet.
    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn device_class(&self) -> &str {
        &self.device_class
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.kind, SensorKind::Binary { .. })
    }

    pub fn delay_off(&self) -> Duration {
        match self.kind {
            SensorKind::Binary { delay_off } => delay_off,
            SensorKind::Numeric => Duration::ZERO,
        }
    }

    pub fn entity_kind(&self) -> EntityKind {
        if self.is_binary() {
            EntityKind::BinarySensor
        } else {
            EntityKind::Sensor
        }
    }
}

// ---------------------------------------------------------------------------
// Command definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAction {
    SinglePress { message: String },
    Toggle { on_message: String, off_message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CommandForm", into = "CommandForm")]
pub struct CommandDefinition {
    name: String,
    action: CommandAction,
}

/// Flat wire shape of a command definition. Exactly one of `single_press`
/// or the `on_message`/`off_message` pair must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandForm {
    #[serde(alias = "command_name")]
    pub name: String,
    #[serde(default)]
    pub single_press: Option<String>,
    #[serde(default)]
    pub on_message: Option<String>,
    #[serde(default)]
    pub off_message: Option<String>,
}

impl TryFrom<CommandForm> for CommandDefinition {
    type Error = BridgeError;

    fn try_from(form: CommandForm) -> Result<Self> {
        let name = segment("command name", &form.name)?;
        let single = non_blank(form.single_press);
        let on = non_blank(form.on_message);
        let off = non_blank(form.off_message);
        let action = match (single, on, off) {
            (Some(message), None, None) => CommandAction::SinglePress { message },
            (None, Some(on_message), Some(off_message)) => {
                if on_message == off_message {
                    return Err(invalid(format!(
                        "command '{name}': on and off messages must differ"
                    )));
                }
                CommandAction::Toggle {
                    on_message,
                    off_message,
                }
            }
            (None, None, None) => {
                return Err(invalid(format!(
                    "command '{name}': a single-press message or an on/off pair is required"
                )))
            }
            (Some(_), _, _) => {
                return Err(invalid(format!(
                    "command '{name}': single-press and on/off messages are mutually exclusive"
                )))
            }
            (None, _, _) => {
                return Err(invalid(format!(
                    "command '{name}': both on and off messages are required"
                )))
            }
        };
        Ok(Self { name, action })
    }
}

impl From<CommandDefinition> for CommandForm {
    fn from(def: CommandDefinition) -> Self {
        match def.action {
            CommandAction::SinglePress { message } => Self {
                name: def.name,
                single_press: Some(message),
                ..Self::default()
            },
            CommandAction::Toggle {
                on_message,
                off_message,
            } => Self {
                name: def.name,
                single_press: None,
                on_message: Some(on_message),
                off_message: Some(off_message),
            },
        }
    }
}

impl CommandDefinition {
    pub fn single_press(name: &str, message: &str) -> Result<Self> {
        Self::try_from(CommandForm {
            name: name.to_string(),
            single_press: Some(message.to_string()),
            ..CommandForm::default()
        })
    }

    pub fn toggle(name: &str, on_message: &str, off_message: &str) -> Result<Self> {
        Self::try_from(CommandForm {
            name: name.to_string(),
            single_press: None,
            on_message: Some(on_message.to_string()),
            off_message: Some(off_message.to_string()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> &CommandAction {
        &self.action
    }

    pub fn is_toggle(&self) -> bool {
        matches!(self.action, CommandAction::Toggle { .. })
    }

    pub fn entity_kind(&self) -> EntityKind {
        if self.is_toggle() {
            EntityKind::Switch
        } else {
            EntityKind::Button
        }
    }

    /// Message for a UI action: `press`, `on`, or `off`.
    pub fn message_for_action(&self, action: &str) -> Option<&str> {
        match (&self.action, action.to_ascii_lowercase().as_str()) {
            (CommandAction::SinglePress { message }, "press") => Some(message),
            (CommandAction::Toggle { on_message, .. }, "on") => Some(on_message),
            (CommandAction::Toggle { off_message, .. }, "off") => Some(off_message),
            _ => None,
        }
    }

    /// Message for an inbound MQTT command payload: `PRESS` for buttons,
    /// the on or off message itself for switches.
    pub fn message_for_payload(&self, payload: &str) -> Option<&str> {
        match &self.action {
            CommandAction::SinglePress { message } => (payload == PRESS).then_some(message.as_str()),
            CommandAction::Toggle {
                on_message,
                off_message,
            } => [on_message, off_message]
                .into_iter()
                .find(|m| m.as_str() == payload)
                .map(String::as_str),
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorState {
    /// `ON`/`OFF` for binary sensors, the last published number otherwise.
    pub value: String,
    /// Unix seconds of the last transition.
    pub last_update: i64,
    /// Auto-off delay in seconds, copied from the definition when the state
    /// was created.
    pub delay_off: u64,
    /// Monotonic time of the last transition; `None` after a restart.
    #[serde(skip)]
    pub touched: Option<Instant>,
}

impl SensorState {
    pub fn new(value: &str, last_update: i64, delay_off: Duration) -> Self {
        Self {
            value: value.to_string(),
            last_update,
            delay_off: delay_off.as_secs(),
            touched: Some(Instant::now()),
        }
    }

    pub fn is_on(&self) -> bool {
        self.value == ON
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub short_name: String,
    pub long_name: String,
    pub last_heard: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Received,
    Sent,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageEntry {
    pub time: i64,
    pub direction: Direction,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub info: NodeInfo,
    pub enabled: bool,
    pub known_keys: BTreeSet<String>,
    pub sensors: Vec<SensorDefinition>,
    pub commands: Vec<CommandDefinition>,
    pub states: BTreeMap<String, SensorState>,
    pub messages: VecDeque<MessageEntry>,
}

impl Node {
    pub fn new(id: &str, now: i64) -> Self {
        Self {
            info: NodeInfo {
                short_name: id.to_string(),
                long_name: id.to_string(),
                last_heard: now,
            },
            enabled: false,
            known_keys: BTreeSet::new(),
            sensors: Vec::new(),
            commands: Vec::new(),
            states: BTreeMap::new(),
            messages: VecDeque::new(),
        }
    }

    pub fn sensor(&self, name: &str) -> Option<&SensorDefinition> {
        self.sensors.iter().find(|s| s.name() == name)
    }

    pub fn command(&self, name: &str) -> Option<&CommandDefinition> {
        self.commands.iter().find(|c| c.name() == name)
    }

    pub fn has_definition(&self, name: &str) -> bool {
        self.sensor(name).is_some() || self.command(name).is_some()
    }

    pub fn definition_names(&self) -> impl Iterator<Item = &str> {
        self.sensors
            .iter()
            .map(SensorDefinition::name)
            .chain(self.commands.iter().map(CommandDefinition::name))
    }

    /// Entity kind a key is announced as.
    pub fn entity_kind(&self, key: &str) -> EntityKind {
        if let Some(s) = self.sensor(key) {
            s.entity_kind()
        } else if let Some(c) = self.command(key) {
            c.entity_kind()
        } else if key == POSITION_KEY {
            EntityKind::DeviceTracker
        } else {
            EntityKind::Sensor
        }
    }

    pub fn state_value(&self, name: &str) -> &str {
        self.states.get(name).map_or(OFF, |s| s.value.as_str())
    }

    pub fn log_message(&mut self, time: i64, direction: Direction, message: &str) {
        if self.messages.len() >= MAX_MESSAGES {
            self.messages.pop_front();
        }
        self.messages.push_back(MessageEntry {
            time,
            direction,
            message: message.to_string(),
        });
    }

    /// True when the short name is still a placeholder worth looking up.
    pub fn needs_name(&self, id: &str) -> bool {
        let short = self.info.short_name.as_str();
        short.is_empty() || short == id || short.eq_ignore_ascii_case("unknown")
    }
}

// ---------------------------------------------------------------------------
// Persisted snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub nodes: BTreeMap<String, NodeRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub info: NodeInfo,
    pub enabled: bool,
    pub known_keys: BTreeSet<String>,
    pub sensors: Vec<SensorDefinition>,
    pub commands: Vec<CommandDefinition>,
    pub states: BTreeMap<String, StoredState>,
}

/// Sensor state without its runtime timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredState {
    pub value: String,
    pub last_update: i64,
    pub delay_off: u64,
}

impl From<&SensorState> for StoredState {
    fn from(s: &SensorState) -> Self {
        Self {
            value: s.value.clone(),
            last_update: s.last_update,
            delay_off: s.delay_off,
        }
    }
}

impl From<StoredState> for SensorState {
    fn from(s: StoredState) -> Self {
        Self {
            value: s.value,
            last_update: s.last_update,
            delay_off: s.delay_off,
            touched: None,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
