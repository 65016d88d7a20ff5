//! Stateful mesh traffic simulator for local development.
//!
//! Each simulated node keeps its own slowly drifting device metrics and
//! position, so consecutive telemetry from one node looks plausible:
//! - Battery drains with a random walk and occasionally "recharges"
//! - Temperature follows mean reversion around a per-node set point
//! - Leak sensors flip between detected and cleared
//! - The flaky scenario mixes in literal-text telemetry and unreadable lines

use serde_json::{json, Value};
use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

fn round_to(v: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (v * scale).round() / scale
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured traffic profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mostly telemetry and the odd position. Rare texts.
    Quiet,
    /// Frequent texts and leak events. Good for exercising custom sensors
    /// and delay-off timers from the UI.
    Chatty,
    /// Like chatty, plus literal-text telemetry and ~5% unreadable lines.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "chatty" => Self::Chatty,
            "flaky" => Self::Flaky,
            _ => Self::Quiet,
        }
    }

    /// Relative weights: telemetry, position, text, identity.
    fn weights(self) -> [u32; 4] {
        match self {
            Self::Quiet => [70, 15, 5, 10],
            Self::Chatty => [40, 10, 40, 10],
            Self::Flaky => [45, 10, 35, 10],
        }
    }

    fn garbage_prob(self) -> f64 {
        match self {
            Self::Flaky => 0.05,
            _ => 0.0,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quiet => write!(f, "quiet"),
            Self::Chatty => write!(f, "chatty"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-node state
// ---------------------------------------------------------------------------

pub struct SimNode {
    pub id: String,
    pub short_name: String,
    pub long_name: String,
    battery: f64,
    set_point: f64,
    temperature: f64,
    lat: f64,
    lon: f64,
    leak: bool,
}

impl SimNode {
    fn new(index: usize) -> Self {
        let set_point = gaussian(20.0, 3.0);
        Self {
            id: format!("!{:08x}", 0xa1b2_c300_u32 + index as u32),
            short_name: format!("N{index:02}"),
            long_name: format!("Sim node {index}"),
            battery: 60.0 + fastrand::f64() * 40.0,
            set_point,
            temperature: set_point,
            lat: 47.6 + gaussian(0.0, 0.01),
            lon: -122.3 + gaussian(0.0, 0.01),
            leak: false,
        }
    }

    fn step(&mut self) {
        self.battery -= 0.2 + fastrand::f64() * 0.3;
        if self.battery < 15.0 && fastrand::f64() < 0.1 {
            self.battery = 100.0;
        }
        self.battery = self.battery.clamp(0.0, 100.0);

        let pull = 0.1 * (self.set_point - self.temperature);
        self.temperature += pull + gaussian(0.0, 0.3);

        self.lat += gaussian(0.0, 0.0001);
        self.lon += gaussian(0.0, 0.0001);
    }

    fn voltage(&self) -> f64 {
        round_to(3.3 + 0.9 * self.battery / 100.0, 2)
    }

    fn user(&self) -> Value {
        json!({
            "id": self.id,
            "shortName": self.short_name,
            "longName": self.long_name,
        })
    }
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

/// Produces JSON lines in the format the bridge's mesh endpoint speaks.
pub struct MeshSim {
    scenario: Scenario,
    nodes: Vec<SimNode>,
}

impl MeshSim {
    pub fn new(scenario: Scenario, node_count: usize) -> Self {
        Self {
            scenario,
            nodes: (0..node_count.max(1)).map(SimNode::new).collect(),
        }
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    /// Node-database entries, as the endpoint reports them on connect.
    pub fn node_infos(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|n| json!({ "nodeInfo": n.user() }).to_string())
            .collect()
    }

    /// The next packet from a randomly chosen node.
    pub fn next_line(&mut self, now: i64) -> String {
        if fastrand::f64() < self.scenario.garbage_prob() {
            return if fastrand::bool() {
                "{not json".to_string()
            } else {
                let id = &self.nodes[fastrand::usize(..self.nodes.len())].id;
                json!({ "fromId": id, "decoded": { "telemetry": "%%%" } }).to_string()
            };
        }

        let scenario = self.scenario;
        let index = fastrand::usize(..self.nodes.len());
        let node = &mut self.nodes[index];
        node.step();

        let decoded = match pick(&scenario.weights()) {
            0 => telemetry(node, scenario == Scenario::Flaky && fastrand::bool()),
            1 => position(node),
            2 => json!({ "portnum": "TEXT_MESSAGE_APP", "text": text(node) }),
            _ => json!({ "user": node.user() }),
        };
        json!({ "fromId": node.id, "rxTime": now, "decoded": decoded }).to_string()
    }

    /// A text packet from `id`, used to answer requests sent to it.
    pub fn reply(&self, id: &str, text: &str, now: i64) -> Option<String> {
        let node = self.nodes.iter().find(|n| n.id == id)?;
        Some(
            json!({
                "fromId": node.id,
                "rxTime": now,
                "decoded": { "portnum": "TEXT_MESSAGE_APP", "text": format!("ack {text}") }
            })
            .to_string(),
        )
    }
}

/// Index into `weights`, chosen proportionally.
fn pick(weights: &[u32]) -> usize {
    let total: u32 = weights.iter().sum();
    let mut roll = fastrand::u32(..total.max(1));
    for (i, w) in weights.iter().enumerate() {
        if roll < *w {
            return i;
        }
        roll -= w;
    }
    weights.len() - 1
}

fn telemetry(node: &SimNode, literal: bool) -> Value {
    let battery = node.battery.round() as i64;
    let voltage = node.voltage();
    let channel = round_to(fastrand::f64() * 20.0, 2);
    let air = round_to(fastrand::f64() * 5.0, 2);
    if literal {
        // Python-style dict text, as some firmware relays it
        let text = format!(
            "{{'deviceMetrics': {{'batteryLevel': {battery}, 'voltage': {voltage}, \
             'channelUtilization': {channel}, 'airUtilTx': {air}}}}}"
        );
        json!({ "portnum": "TELEMETRY_APP", "telemetry": text })
    } else {
        json!({
            "portnum": "TELEMETRY_APP",
            "telemetry": {
                "deviceMetrics": {
                    "batteryLevel": battery,
                    "voltage": voltage,
                    "channelUtilization": channel,
                    "airUtilTx": air,
                }
            }
        })
    }
}

fn position(node: &SimNode) -> Value {
    json!({
        "portnum": "POSITION_APP",
        "position": {
            "latitudeI": (node.lat * 1e7).round() as i64,
            "longitudeI": (node.lon * 1e7).round() as i64,
            "altitude": 40 + fastrand::i64(-5..5),
            "satsInView": fastrand::u8(4..12),
        }
    })
}

fn text(node: &mut SimNode) -> String {
    if fastrand::f64() < 0.3 {
        node.leak = !node.leak;
        return if node.leak { "leak detected" } else { "leak cleared" }.to_string();
    }
    format!("temp {:.1}", node.temperature)
}

// ===========================================================================
// Tests
// ===========================================================================
