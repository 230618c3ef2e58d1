//! Agent side of the cstate fabric.
//!
//! An [`AgentSession`] holds one named agent's connection to the hub. It
//! answers inbound `state`/`query` requests from its [`HandlerTable`]s, asks
//! and queries other agents through the hub, publishes events, and exposes a
//! [`Topic`] multiplexer for every agent it subscribes to. Topic joins are
//! replayed after every reconnect and a heartbeat reports uptime while the
//! link is up.

mod handlers;
mod heartbeat;
mod inbound;
mod link;
mod pumps;
mod reconnection;
mod session;
mod topics;
pub mod types;

pub use handlers::{
    HandlerFuture, HandlerTable, QueryHandler, QueryTable, StateHandler, StateTable,
};
pub use heartbeat::process_uptime;
pub use session::{AgentSession, Asker, Publisher, Querier};
pub use topics::{Topic, TopicEvent, TopicReceiver};
pub use types::{ConnectionState, ReconnectConfig, SessionConfig, SessionEvent};

/// Errors produced by the agent session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] cstate_protocol::ProtocolError),

    #[error("connection closed before the reply arrived")]
    Disconnected,

    #[error("send queue full, message dropped")]
    QueueFull,
}
