//! The cstate hub.
//!
//! Accepts agent sessions over WebSocket, admits at most one live connection
//! per agent name, forwards `state`/`query` requests to their target agent,
//! relays log and event traffic to groups, and keeps per-agent statistics.
//! A bootstrap agent named `state` exposes the registry to every agent.

mod peer;
mod registry;
mod relay;
mod server;
mod state_agent;

#[cfg(test)]
mod e2e_tests;

pub use peer::{Peer, SendError};
pub use registry::Registry;
pub use server::{Hub, ServerConfig};

/// Errors produced by the hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bootstrap agent: {0}")]
    Agent(#[from] cstate_agent::SessionError),

    #[error("invalid hub address: {0}")]
    Url(#[from] url::ParseError),
}

/// Reasons a connection is not admitted to the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("connection carries no agent name")]
    EmptyName,

    #[error("agent {0:?} is already connected")]
    Duplicate(String),
}
