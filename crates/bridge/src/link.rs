//! Connection status tracking and retry policies shared by the mesh and
//! MQTT transports.

use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Link status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "lowercase")]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Observable connection state of one transport. Cheap to clone.
#[derive(Clone)]
pub struct Link {
    name: &'static str,
    status: Arc<watch::Sender<LinkStatus>>,
    connects: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkView {
    pub name: &'static str,
    pub status: LinkStatus,
    pub connects: u64,
}

impl Link {
    pub fn new(name: &'static str) -> Self {
        let (tx, _) = watch::channel(LinkStatus::Disconnected);
        Self {
            name,
            status: Arc::new(tx),
            connects: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn set(&self, status: LinkStatus) {
        if status == LinkStatus::Connected {
            self.connects.fetch_add(1, Ordering::Relaxed);
        }
        self.status.send_replace(status);
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.status.borrow() == LinkStatus::Connected
    }

    /// How many times the link has reached `Connected`.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn view(&self) -> LinkView {
        LinkView {
            name: self.name,
            status: self.status(),
            connects: self.connects(),
        }
    }
}

// ---------------------------------------------------------------------------
// Fixed-delay reconnection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    #[cfg(test)]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Drive `connect` until it succeeds, sleeping `delay` between failed
    /// attempts. Marks the link `Connected` exactly once, on success.
    /// Returns `None` only when `max_attempts` is exhausted.
    pub async fn connect<T, E, F, Fut>(&self, link: &Link, mut connect: F) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            link.set(LinkStatus::Connecting);
            match connect(attempt).await {
                Ok(conn) => {
                    info!(link = link.name(), attempt, "connected");
                    link.set(LinkStatus::Connected);
                    return Some(conn);
                }
                Err(e) => {
                    warn!(link = link.name(), attempt, "connect failed: {e}");
                    link.set(LinkStatus::Error(e.to_string()));
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        return None;
                    }
                    sleep(self.delay).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bounded exponential backoff
// ---------------------------------------------------------------------------

/// Retries a fallible lookup, waiting `base`, `2*base`, `4*base`, ...
/// between attempts. No wait after the final attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, attempts: u32) -> Self {
        Self {
            base,
            attempts: attempts.max(1),
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(1u32 << attempt.min(16))
    }

    pub async fn retry<T, F, Fut>(&self, mut op: F) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for attempt in 0..self.attempts {
            if let Some(v) = op(attempt + 1).await {
                return Some(v);
            }
            if attempt + 1 < self.attempts {
                let wait = self.delay_for(attempt);
                debug!(attempt = attempt + 1, wait_ms = wait.as_millis() as u64, "backing off");
                sleep(wait).await;
            }
        }
        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================
