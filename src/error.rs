//! Error types for robot telemetry and script operations

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error on {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out during {operation} on {endpoint}")]
    Timeout { endpoint: String, operation: String },

    #[error("RTDE negotiation failed: {0}")]
    Negotiation(String),

    #[error("Malformed telemetry frame: {0}")]
    Decode(String),

    #[error("No recorded steps to compile")]
    EmptySequence,

    #[error("Recorded pose at step {index} has a non-finite coordinate")]
    NonFinitePose { index: usize },

    #[error("Telemetry link is not connected")]
    NotConnected,

    #[error("No telemetry frame has been received yet")]
    NoFrame,

    #[error("Recipe error: {0}")]
    Recipe(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Gripper device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn transport(endpoint: impl Into<String>, source: io::Error) -> Self {
        Error::Transport { endpoint: endpoint.into(), source }
    }

    pub(crate) fn timeout(endpoint: impl Into<String>, operation: impl Into<String>) -> Self {
        Error::Timeout { endpoint: endpoint.into(), operation: operation.into() }
    }

    /// Whether the reader loop may drop this error as "no frame this tick".
    ///
    /// Decode failures and timeouts before any byte of a packet arrived are
    /// transient. Every transport error is not, including a stall in the
    /// middle of a packet: the stream is out of step and the session is
    /// unusable until an explicit reconnect.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Decode(_) | Error::Timeout { .. })
    }
}
