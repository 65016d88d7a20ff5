use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

/// Current unix time in seconds.
pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Process-level activity shown on the status page. Not persisted.
pub struct SystemState {
    pub started_at: Instant,
    pub packets: u64,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Packet,
    Mesh,
    Mqtt,
    Command,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct ActivityView {
    pub uptime_secs: u64,
    pub packets: u64,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            packets: 0,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Count a packet; only identity changes and errors make it into the
    /// event list, the rest would drown it.
    pub fn record_packet(&mut self, node_id: &str, kind: &str) {
        self.packets += 1;
        if kind == "node-identity" {
            self.push_event(EventKind::Packet, format!("{node_id}: {kind}"));
        }
    }

    pub fn record(&mut self, kind: EventKind, detail: impl Into<String>) {
        self.push_event(kind, detail.into());
    }

    pub fn record_error(&mut self, detail: impl Into<String>) {
        self.push_event(EventKind::Error, detail.into());
    }

    pub fn record_system(&mut self, detail: impl Into<String>) {
        self.push_event(EventKind::System, detail.into());
    }

    /// Build the JSON view, newest event first.
    pub fn to_view(&self) -> ActivityView {
        ActivityView {
            uptime_secs: self.started_at.elapsed().as_secs(),
            packets: self.packets,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
