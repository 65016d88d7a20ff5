//! Error types surfaced at the core boundary (registry operations,
//! command relay, node lookups).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Rejected definition or setting. Never partially applied.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("node '{node}' has no sensor or command named '{name}'")]
    UnknownDefinition { node: String, name: String },

    /// Send attempted while the named transport is down. The message is dropped.
    #[error("{0} transport unavailable")]
    TransportUnavailable(&'static str),

    #[error("connection failed: {0}")]
    ConnectionFailure(String),

    #[error("lookup for node '{node}' failed after {attempts} attempts")]
    LookupFailure { node: String, attempts: u32 },
}

/// A telemetry payload none of the decoders could make sense of.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not decode telemetry payload: {preview}")]
pub struct DecodeError {
    pub preview: String,
}

pub type Result<T> = std::result::Result<T, BridgeError>;

pub(crate) fn invalid(msg: impl Into<String>) -> BridgeError {
    BridgeError::InvalidConfiguration(msg.into())
}
