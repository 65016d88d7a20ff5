//! Tracing setup with a reloadable level filter.

use anyhow::{Context, Result};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::error::{invalid, BridgeError};

/// Filter directive for a configured level name. `WARNING` and `CRITICAL`
/// are accepted alongside the usual names.
pub fn directive(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => Some("trace"),
        "DEBUG" => Some("debug"),
        "INFO" => Some("info"),
        "WARN" | "WARNING" => Some("warn"),
        "ERROR" | "CRITICAL" => Some("error"),
        _ => None,
    }
}

/// Handle for changing the log level at runtime. Cheap to clone.
#[derive(Clone)]
pub struct LogControl {
    handle: Option<reload::Handle<EnvFilter, Registry>>,
    level: Arc<RwLock<String>>,
}

impl LogControl {
    /// Install the global subscriber. `RUST_LOG` wins over `level` when set.
    pub fn init(level: &str) -> Result<Self> {
        let from_env = std::env::var("RUST_LOG").ok().filter(|v| !v.trim().is_empty());
        let filter = match &from_env {
            Some(directives) => EnvFilter::try_new(directives).context("invalid RUST_LOG")?,
            None => EnvFilter::new(directive(level).unwrap_or("info")),
        };
        let (filter, handle) = reload::Layer::new(filter);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()
            .context("failed to install tracing subscriber")?;
        Ok(Self {
            handle: Some(handle),
            level: Arc::new(RwLock::new(level.to_ascii_uppercase())),
        })
    }

    /// A control that only remembers the level; used when another
    /// subscriber is already installed (tests).
    pub fn detached(level: &str) -> Self {
        Self {
            handle: None,
            level: Arc::new(RwLock::new(level.to_ascii_uppercase())),
        }
    }

    pub fn level(&self) -> String {
        self.level
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_level(&self, level: &str) -> Result<(), BridgeError> {
        let d = directive(level).ok_or_else(|| invalid(format!("unknown log level '{level}'")))?;
        if let Some(handle) = &self.handle {
            handle
                .reload(EnvFilter::new(d))
                .map_err(|e| invalid(format!("failed to apply log level: {e}")))?;
        }
        *self.level.write().unwrap_or_else(PoisonError::into_inner) = level.trim().to_ascii_uppercase();
        info!(level = d, "log level changed");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
