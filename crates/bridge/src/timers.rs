//! One-shot delay-off timers for binary sensors, at most one per
//! (node, sensor) pair.
//!
//! Every schedule gets a fresh generation number. The fired callback is
//! handed its generation and must claim its slot with
//! [`DelayOffTimers::complete`] (under the same lock that guards the timers)
//! before acting, so a timer that lost a race with a reschedule does nothing.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

type Key = (String, String);

#[derive(Default)]
pub struct DelayOffTimers {
    next_gen: u64,
    slots: HashMap<Key, (u64, JoinHandle<()>)>,
}

impl DelayOffTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer, cancelling any timer already armed for the pair.
    /// Returns the new generation.
    pub fn schedule<F, Fut>(&mut self, node: &str, sensor: &str, delay: Duration, fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.next_gen += 1;
        let generation = self.next_gen;
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            fire(generation).await;
        });
        let key = (node.to_string(), sensor.to_string());
        if let Some((old, prev)) = self.slots.insert(key, (generation, handle)) {
            debug!(node, sensor, generation = old, "delay-off superseded");
            prev.abort();
        }
        generation
    }

    pub fn cancel(&mut self, node: &str, sensor: &str) -> bool {
        match self.slots.remove(&(node.to_string(), sensor.to_string())) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_node(&mut self, node: &str) {
        self.slots.retain(|(n, _), (_, handle)| {
            if n == node {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.slots.drain() {
            handle.abort();
        }
    }

    pub fn is_armed(&self, node: &str, sensor: &str) -> bool {
        self.slots
            .contains_key(&(node.to_string(), sensor.to_string()))
    }

    #[cfg(test)]
    pub fn is_current(&self, node: &str, sensor: &str, generation: u64) -> bool {
        self.slots
            .get(&(node.to_string(), sensor.to_string()))
            .is_some_and(|(g, _)| *g == generation)
    }

    /// Forget the slot once its timer has fired. Does not abort: the caller
    /// is the timer task itself.
    pub fn complete(&mut self, node: &str, sensor: &str, generation: u64) -> bool {
        let key = (node.to_string(), sensor.to_string());
        if self.slots.get(&key).is_some_and(|(g, _)| *g == generation) {
            self.slots.remove(&key);
            true
        } else {
            false
        }
    }

    pub fn pending(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for DelayOffTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
