//! Home Assistant discovery records.
//!
//! Pure translation from a node's key to the retained publishes that
//! announce or retract the matching entity. Nothing here touches the
//! network; callers enqueue the returned [`Publish`]es.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::model::{CommandAction, Node, OFF, ON, POSITION_KEY, PRESS};
use crate::mqtt::Publish;
use crate::topics::Topics;

const MANUFACTURER: &str = "Meshtastic";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Sensor,
    BinarySensor,
    DeviceTracker,
    Button,
    Switch,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Sensor => "sensor",
            EntityKind::BinarySensor => "binary_sensor",
            EntityKind::DeviceTracker => "device_tracker",
            EntityKind::Button => "button",
            EntityKind::Switch => "switch",
        }
    }
}

/// Position sub-keys published under `position/` rather than `telemetry/`.
pub const POSITION_KEYS: &[&str] = &["altitude", "groundspeed", "groundtrack", "satsinview", "pdop"];

/// Device class and unit for the standard numeric telemetry keys. A key
/// with an entry here is a numeric sensor; nothing else is.
pub fn telemetry_class(key: &str) -> Option<(&'static str, &'static str)> {
    let class = match key.to_ascii_lowercase().as_str() {
        "batterylevel" | "battery_level" => ("battery", "%"),
        "voltage" => ("voltage", "V"),
        "temperature" => ("temperature", "°C"),
        "humidity" => ("humidity", "%"),
        "pressure" => ("pressure", "hPa"),
        "airutiltx" | "air_util_tx" | "channelutilization" | "channel_utilization" => {
            ("signal_strength", "%")
        }
        "uptimeseconds" | "uptime_seconds" => ("duration", "s"),
        "altitude" => ("distance", "m"),
        "groundspeed" => ("speed", "km/h"),
        "groundtrack" => ("angle", "°"),
        "satsinview" => ("count", ""),
        "pdop" => ("signal_strength", ""),
        _ => return None,
    };
    Some(class)
}

pub fn is_numeric_key(key: &str) -> bool {
    telemetry_class(key).is_some()
}

pub fn is_position_key(key: &str) -> bool {
    POSITION_KEYS.contains(&key.to_ascii_lowercase().as_str())
}

/// Unit implied by a custom sensor's declared device class.
fn custom_unit(device_class: &str) -> &'static str {
    match device_class {
        "battery" | "humidity" => "%",
        "voltage" => "V",
        "temperature" => "°C",
        "pressure" => "hPa",
        "distance" => "m",
        "speed" => "km/h",
        "angle" => "°",
        "current" => "A",
        "energy" => "kWh",
        "power" => "W",
        "duration" => "s",
        "illuminance" => "lx",
        "signal_strength" => "dBm",
        _ => "",
    }
}

const BINARY_CLASSES: &[&str] = &[
    "battery",
    "battery_charging",
    "carbon_monoxide",
    "cold",
    "connectivity",
    "door",
    "garage_door",
    "gas",
    "heat",
    "light",
    "lock",
    "moisture",
    "motion",
    "moving",
    "occupancy",
    "opening",
    "plug",
    "power",
    "presence",
    "problem",
    "running",
    "safety",
    "smoke",
    "sound",
    "tamper",
    "update",
    "vibration",
    "window",
];

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier-safe form of a node id: leading `!` dropped, anything outside
/// `[A-Za-z0-9_-]` replaced by `_`.
pub fn sanitize_node(node_id: &str) -> String {
    node_id
        .trim_start_matches('!')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn sanitize_key(key: &str) -> String {
    key.trim().to_lowercase().replace(' ', "_")
}

pub fn object_id(node_id: &str, key: &str) -> String {
    format!("{}_{}", sanitize_node(node_id), sanitize_key(key))
}

fn title_case(key: &str) -> String {
    key.replace('_', " ")
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn display_name(node_id: &str, node: &Node) -> String {
    let safe = sanitize_node(node_id);
    let tail: String = {
        let chars: Vec<char> = safe.chars().collect();
        chars[chars.len().saturating_sub(3)..].iter().collect()
    };
    format!("{}.{tail}", node.info.short_name)
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// State topic an entity reads from.
pub fn state_topic(topics: &Topics, node_id: &str, node: &Node, key: &str) -> String {
    if let Some(def) = node.sensor(key) {
        topics.sensor(node_id, def.topic(), def.name())
    } else if let Some(cmd) = node.command(key) {
        if cmd.is_toggle() {
            topics.command_state(node_id, cmd.name())
        } else {
            topics.command(node_id, cmd.name())
        }
    } else if key == POSITION_KEY {
        topics.location(node_id)
    } else if is_position_key(key) {
        topics.position(node_id, key)
    } else {
        topics.telemetry(node_id, key)
    }
}

/// The JSON discovery record for one key of one node.
pub fn record(topics: &Topics, node_id: &str, node: &Node, key: &str) -> Value {
    let safe = sanitize_node(node_id);
    let kind = node.entity_kind(key);
    let state = state_topic(topics, node_id, node, key);

    let mut rec = Map::new();
    rec.insert(
        "name".into(),
        json!(format!("{} {}", display_name(node_id, node), title_case(key))),
    );
    rec.insert("unique_id".into(), json!(format!("mesh_{}", object_id(node_id, key))));
    rec.insert(
        "device".into(),
        json!({
            "identifiers": [format!("mesh_{safe}")],
            "name": node.info.long_name,
            "model": safe,
            "manufacturer": MANUFACTURER,
        }),
    );
    rec.insert("force_update".into(), json!(true));

    match kind {
        EntityKind::DeviceTracker => {
            rec.insert("state_topic".into(), json!(state));
            rec.insert("json_attributes_topic".into(), json!(state));
            rec.insert("source_type".into(), json!("gps"));
            rec.insert(
                "value_template".into(),
                json!("{{ value_json.latitude ~ ',' ~ value_json.longitude if value_json.latitude is not none and value_json.longitude is not none else '' }}"),
            );
        }
        EntityKind::BinarySensor => {
            rec.insert("state_topic".into(), json!(state));
            rec.insert("payload_on".into(), json!(ON));
            rec.insert("payload_off".into(), json!(OFF));
            rec.insert("value_template".into(), json!("{{ value }}"));
            if let Some(def) = node.sensor(key) {
                if BINARY_CLASSES.contains(&def.device_class()) {
                    rec.insert("device_class".into(), json!(def.device_class()));
                }
            }
        }
        EntityKind::Sensor => {
            rec.insert("state_topic".into(), json!(state));
            rec.insert("value_template".into(), json!("{{ value | float(0) }}"));
            let (class, unit) = match node.sensor(key) {
                Some(def) => (def.device_class(), custom_unit(def.device_class())),
                None => telemetry_class(key).unwrap_or(("", "")),
            };
            if !class.is_empty() && class != "sensor" {
                rec.insert("device_class".into(), json!(class));
            }
            if !unit.is_empty() {
                rec.insert("unit_of_measurement".into(), json!(unit));
            }
        }
        EntityKind::Button => {
            rec.insert("command_topic".into(), json!(topics.command(node_id, key)));
            rec.insert("payload_press".into(), json!(PRESS));
        }
        EntityKind::Switch => {
            rec.insert("command_topic".into(), json!(topics.command(node_id, key)));
            rec.insert("state_topic".into(), json!(state));
            if let Some(CommandAction::Toggle {
                on_message,
                off_message,
            }) = node.command(key).map(|c| c.action())
            {
                rec.insert("payload_on".into(), json!(on_message));
                rec.insert("payload_off".into(), json!(off_message));
                rec.insert("state_on".into(), json!(on_message));
                rec.insert("state_off".into(), json!(off_message));
            }
        }
    }
    Value::Object(rec)
}

/// Publishes that announce `key`. Binary sensors also get their current
/// state so the entity never starts out unknown.
pub fn announce(topics: &Topics, node_id: &str, node: &Node, key: &str) -> Vec<Publish> {
    let kind = node.entity_kind(key);
    let rec = record(topics, node_id, node, key);
    let mut out = vec![Publish::retained(
        topics.discovery(kind, &object_id(node_id, key)),
        rec.to_string(),
    )];
    if kind == EntityKind::BinarySensor {
        out.push(Publish::retained(
            state_topic(topics, node_id, node, key),
            node.state_value(key),
        ));
    }
    out
}

/// Publishes that retract `key`: empty retained payloads on the discovery
/// topic, the state topic and the node's refresh-button topic. Must be
/// called while the key's definition (if any) is still on the node.
pub fn retract(topics: &Topics, node_id: &str, node: &Node, key: &str) -> Vec<Publish> {
    let kind = node.entity_kind(key);
    vec![
        Publish::cleared(topics.discovery(kind, &object_id(node_id, key))),
        Publish::cleared(state_topic(topics, node_id, node, key)),
        Publish::cleared(topics.refresh_button(&sanitize_node(node_id))),
    ]
}

// ===========================================================================
// Tests
// ===========================================================================
