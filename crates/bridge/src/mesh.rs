//! Mesh endpoint transport: one TCP connection carrying JSON lines in both
//! directions. Reconnects with a fixed delay; outbound text while the link
//! is down is refused rather than queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::error::{BridgeError, Result};
use crate::link::{Backoff, Link, LinkStatus, ReconnectPolicy};
use crate::packet::{encode_send, NodeUser};
use crate::state::EventKind;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Send side of the mesh transport plus the endpoint's node database.
/// Cheap to clone.
#[derive(Clone)]
pub struct MeshHandle {
    outgoing: mpsc::UnboundedSender<String>,
    link: Link,
    nodedb: Arc<Mutex<HashMap<String, NodeUser>>>,
    lookup: Backoff,
}

impl MeshHandle {
    pub fn new(link: Link, lookup: Backoff) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            outgoing: tx,
            link,
            nodedb: Arc::new(Mutex::new(HashMap::new())),
            lookup,
        };
        (handle, rx)
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Queue a text for the mesh. `None` broadcasts.
    pub fn send_text(&self, text: &str, destination: Option<&str>) -> Result<()> {
        if !self.link.is_connected() {
            warn!(?destination, "mesh not connected; text dropped");
            return Err(BridgeError::TransportUnavailable("mesh"));
        }
        self.outgoing
            .send(encode_send(text, destination))
            .map_err(|_| BridgeError::TransportUnavailable("mesh"))
    }

    pub fn remember(&self, id: &str, user: &NodeUser) {
        let mut db = self.nodedb.lock().unwrap_or_else(PoisonError::into_inner);
        db.insert(bare(id).to_string(), user.clone());
    }

    fn cached(&self, id: &str) -> Option<NodeUser> {
        let db = self.nodedb.lock().unwrap_or_else(PoisonError::into_inner);
        db.get(bare(id))
            .filter(|u| !u.short_name.trim().is_empty())
            .cloned()
    }

    /// Find a node's display names, retrying with exponential backoff while
    /// the endpoint has not reported it yet.
    pub async fn lookup(&self, id: &str) -> Result<NodeUser> {
        let found = self
            .lookup
            .retry(|attempt| {
                debug!(node = id, attempt, "node lookup");
                std::future::ready(self.cached(id))
            })
            .await;
        found.ok_or_else(|| BridgeError::LookupFailure {
            node: id.to_string(),
            attempts: self.lookup.attempts,
        })
    }
}

/// Ids appear with and without the leading `!`.
fn bare(id: &str) -> &str {
    id.strip_prefix('!').unwrap_or(id)
}

// ---------------------------------------------------------------------------
// Connection manager
// ---------------------------------------------------------------------------

pub struct MeshManager {
    address: String,
    policy: ReconnectPolicy,
    outgoing: mpsc::UnboundedReceiver<String>,
}

impl MeshManager {
    pub fn new(
        address: impl Into<String>,
        policy: ReconnectPolicy,
        outgoing: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            address: address.into(),
            policy,
            outgoing,
        }
    }

    pub async fn run(mut self, bridge: Bridge) {
        let link = bridge.mesh().link().clone();
        loop {
            info!(address = %self.address, "connecting to mesh endpoint");
            let address = self.address.clone();
            let stream = tokio::select! {
                s = self.policy.connect(&link, |_| connect(&address)) => s,
                _ = drain(&mut self.outgoing) => return,
            };
            let Some(stream) = stream else {
                continue;
            };
            bridge
                .on_link_change(EventKind::Mesh, format!("mesh connected to {}", self.address))
                .await;

            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let reason = loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => bridge.handle_line(&line).await,
                        Ok(None) => break "endpoint closed the connection".to_string(),
                        Err(e) => break e.to_string(),
                    },
                    out = self.outgoing.recv() => match out {
                        Some(msg) => {
                            if let Err(e) = write_line(&mut write, &msg).await {
                                break e.to_string();
                            }
                        }
                        None => {
                            link.set(LinkStatus::Disconnected);
                            return;
                        }
                    },
                }
            };

            warn!("mesh connection lost: {reason}");
            link.set(LinkStatus::Error(reason.clone()));
            bridge
                .on_link_change(EventKind::Error, format!("mesh connection lost: {reason}"))
                .await;
            sleep(self.policy.delay).await;
        }
    }
}

async fn connect(address: &str) -> Result<TcpStream> {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(BridgeError::ConnectionFailure(format!("{address}: {e}"))),
        Err(_) => Err(BridgeError::ConnectionFailure(format!("{address}: timed out"))),
    }
}

async fn write_line(write: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    debug!(line, "to mesh");
    write.write_all(line.as_bytes()).await?;
    write.write_all(b"\n").await?;
    write.flush().await
}

/// Discard outbound text while there is no connection. Returns once every
/// sender is gone.
async fn drain(outgoing: &mut mpsc::UnboundedReceiver<String>) {
    while let Some(line) = outgoing.recv().await {
        debug!(line, "mesh offline; text dropped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
