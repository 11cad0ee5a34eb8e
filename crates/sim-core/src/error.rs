use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimError>;

#[derive(Debug, Error)]
pub enum SimError {
    /// The simulated server could not claim its endpoint. Fatal at startup.
    #[error("failed to bind simulated server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to simulated server at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A single simulated call failed unexpectedly. Contained to that call.
    #[error("simulation fault: {0}")]
    Simulation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("driver has already been started")]
    AlreadyStarted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SimError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SimError::Config(msg.into())
    }
}
