//! Decoded mesh packets and the JSON-lines framing the mesh endpoint
//! speaks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeUser {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "shortName", alias = "short_name", default)]
    pub short_name: String,
    #[serde(rename = "longName", alias = "long_name", default)]
    pub long_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Fixed-point degrees, 1e-7 scale.
    pub latitude_i: Option<i64>,
    pub longitude_i: Option<i64>,
    pub altitude: Option<Value>,
    pub ground_speed: Option<Value>,
    pub ground_track: Option<Value>,
    pub sats_in_view: Option<Value>,
    #[serde(rename = "PDOP", alias = "pdop")]
    pub pdop: Option<Value>,
}

impl Position {
    pub fn lat(&self) -> Option<f64> {
        self.latitude.or(self.latitude_i.map(|i| i as f64 / 1e7))
    }

    pub fn lon(&self) -> Option<f64> {
        self.longitude.or(self.longitude_i.map(|i| i as f64 / 1e7))
    }

    /// Sub-fields that are present, under their published key names.
    pub fn extras(&self) -> Vec<(&'static str, &Value)> {
        [
            ("altitude", &self.altitude),
            ("groundspeed", &self.ground_speed),
            ("groundtrack", &self.ground_track),
            ("satsinview", &self.sats_in_view),
            ("pdop", &self.pdop),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.as_ref().filter(|v| !v.is_null()).map(|v| (k, v)))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    NodeIdentity(NodeUser),
    Text(String),
    /// Raw telemetry in whatever shape it arrived; see `decoder`.
    Telemetry(Value),
    Position(Position),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::NodeIdentity(_) => "node-identity",
            Payload::Text(_) => "text",
            Payload::Telemetry(_) => "telemetry",
            Payload::Position(_) => "position",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeshPacket {
    pub from: String,
    /// Unix seconds; `None` when the radio did not stamp it.
    pub rx_time: Option<i64>,
    pub payload: Option<Payload>,
}

/// One line read from the mesh endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshLine {
    Packet(MeshPacket),
    NodeInfo(NodeUser),
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WirePacket {
    /// Missing or null on locally generated packets.
    #[serde(rename = "fromId", default)]
    from_id: Option<String>,
    #[serde(rename = "rxTime", default)]
    rx_time: Option<i64>,
    #[serde(default)]
    decoded: Option<WireDecoded>,
}

#[derive(Deserialize)]
struct WireDecoded {
    #[serde(default)]
    user: Option<NodeUser>,
    #[serde(default)]
    data: Option<WireData>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    telemetry: Option<Value>,
    #[serde(default)]
    position: Option<Position>,
}

#[derive(Deserialize)]
struct WireData {
    #[serde(default)]
    user: Option<NodeUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireNodeInfo {
    node_info: NodeUser,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireSend<'a> {
    send_text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination_id: Option<&'a str>,
}

pub fn parse_line(line: &str) -> Result<MeshLine, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    if value.get("nodeInfo").is_some() {
        let info: WireNodeInfo = serde_json::from_value(value)?;
        return Ok(MeshLine::NodeInfo(info.node_info));
    }
    let wire: WirePacket = serde_json::from_value(value)?;
    let payload = wire.decoded.and_then(|d| {
        let user = d.user.or(d.data.and_then(|data| data.user));
        if let Some(user) = user {
            Some(Payload::NodeIdentity(user))
        } else if let Some(text) = d.text {
            Some(Payload::Text(text))
        } else if let Some(t) = d.telemetry {
            Some(Payload::Telemetry(t))
        } else {
            d.position.map(Payload::Position)
        }
    });
    Ok(MeshLine::Packet(MeshPacket {
        from: wire.from_id.unwrap_or_default(),
        rx_time: wire.rx_time,
        payload,
    }))
}

/// Outbound text request; `None` destination broadcasts.
pub fn encode_send(text: &str, destination: Option<&str>) -> String {
    let msg = WireSend {
        send_text: text,
        destination_id: destination,
    };
    serde_json::to_string(&msg).unwrap_or_default()
}

// ===========================================================================
// Tests
// ===========================================================================
