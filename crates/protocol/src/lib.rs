//! Wire protocol shared by the cstate hub and its agents.
//!
//! Every frame is a JSON [`Message`] envelope; the payload shapes for each
//! [`MessageType`] live in [`messages`].

pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::Message;
pub use messages::{
    EventEnvelope, ForwardedQuery, LogBroadcast, LogRecord, QueryRequest, RelayedEvent,
    StateRequest,
};
pub use types::{AgentIdentity, AgentStats, Stats};

/// Errors produced while building or parsing protocol values.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid hub URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("hub URL must use ws:// or wss://, got {0}://")]
    UnsupportedScheme(String),
}
