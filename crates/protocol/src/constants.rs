use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Port the hub listens on when nothing else is configured.
pub const DEFAULT_PORT: u16 = 9200;

/// Group assigned to agents that do not name one.
pub const DEFAULT_GROUP: &str = "unknown";

/// Reserved name of the bootstrap agent running inside the hub process.
pub const STATE_AGENT_NAME: &str = "state";

/// Group that receives every log record.
pub const GROUP_ALL: &str = "all";

/// Group dedicated to log records.
pub const GROUP_LOG: &str = "log";

/// Handshake query parameter carrying the agent name.
pub const QUERY_NAME: &str = "name";

/// Handshake query parameter carrying the agent group.
pub const QUERY_GROUP: &str = "group";

/// Statistics field written by the hub on every report.
pub const STATS_LAST_SEEN: &str = "lastSeen";

/// Statistics field written by the agent heartbeat.
pub const STATS_UPTIME: &str = "uptime";

/// How often a connected agent reports its uptime.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Time allowed to write a WebSocket message.
pub const WS_WRITE_WAIT: Duration = Duration::from_secs(30);

/// Time to wait for a pong response (or any incoming message).
///
/// Acts as a read deadline: if *nothing* arrives within this window the
/// connection is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often the agent sends pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (50 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Outbound queue capacity, per session and per hub peer.
pub const SEND_BUFFER_SIZE: usize = 2048;

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Zero-argument state lookup on a named agent.
    State,
    /// Parametrized call on a named agent.
    Query,
    /// Reply to a correlated `state` or `query`.
    Ack,
    Join,
    Log,
    Stats,
    Event,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Returns `true` for message types that expect an [`MessageType::Ack`].
    pub fn is_request(&self) -> bool {
        matches!(self, MessageType::State | MessageType::Query)
    }
}
