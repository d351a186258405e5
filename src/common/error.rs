//! Common error types for the pipeline workers
//!
//! One taxonomy shared by every worker: transport, parsing, configuration,
//! I/O, plug-in and per-event data errors. Startup transport and I/O
//! failures are fatal and drive the state machine into its shutdown chain;
//! configuration failures during a reconfigure keep the previous table
//! active; data errors are per-event and never fatal.

use thiserror::Error;

/// Pipeline errors shared across workers
#[derive(Error, Debug)]
pub enum PipelineError {
    /// ZeroMQ socket create/bind/connect/send/recv failure
    #[error("transport error: {0}")]
    Transport(#[from] zmq::Error),

    /// Malformed JSON configuration or command
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Semantically invalid configuration
    #[error("configuration error: {0}")]
    Configure(String),

    /// File open/read failure during configuration load
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Dynamic-library load or symbol-resolution failure
    #[error("plugin error: {0}")]
    Plugin(#[from] libloading::Error),

    /// Truncated or malformed binary frame, or an out-of-range gate
    #[error("data error: {0}")]
    Data(String),
}

impl PipelineError {
    /// Create a configuration error
    pub fn configure(msg: impl Into<String>) -> Self {
        Self::Configure(msg.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Short tag used in `{"type": "error", "error": "<tag>"}` events
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Parse(_) => "parse",
            Self::Configure(_) => "configure",
            Self::Io(_) => "io",
            Self::Plugin(_) => "plugin",
            Self::Data(_) => "data",
        }
    }
}

/// Result type alias using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;
