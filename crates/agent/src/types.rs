//! Public configuration and state types for the agent session.

use std::time::Duration;

use cstate_protocol::constants::HEARTBEAT_INTERVAL;
use cstate_protocol::types::{hub_url, parse_hub_url};
use cstate_protocol::{AgentIdentity, LogBroadcast, RelayedEvent};
use url::Url;

use crate::SessionError;

/// Connection state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; either never opened, closed, or waiting to retry.
    Disconnected,
    /// WebSocket handshake in progress.
    Connecting,
    /// Link established; topic joins have been re-sent.
    Connected,
}

/// Observational signals emitted by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The link to the hub was established.
    Connected,
    /// The link to the hub was lost.
    Disconnected,
    /// A log record relayed to a group this agent joined.
    Log(LogBroadcast),
    /// An event relayed to a group this agent joined.
    Event(RelayedEvent),
}

/// Retry schedule used after the link to the hub drops.
///
/// Delays grow geometrically from `initial_delay` up to `max_delay`, and each
/// one is spread by up to a quarter in either direction so that agents
/// restarted together do not redial in lockstep.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Undithered delay before retry number `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1).min(63) as i32;
        let grown = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(steps);
        Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before retry number `attempt` (1-based), jittered by ±25%.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        // Maps the clock's sub-second part onto [-1.0, 1.0).
        let spread = f64::from(nanos) / 500_000_000.0 - 1.0;
        Duration::from_secs_f64((base * (1.0 + 0.25 * spread)).max(0.05))
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub identity: AgentIdentity,
    /// Hub address without identity parameters.
    pub hub: Url,
    /// Uptime report period while connected.
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectConfig,
}

impl SessionConfig {
    pub fn new(identity: AgentIdentity, hub: Url) -> Self {
        Self {
            identity,
            hub,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Targets a hub on the loopback interface.
    pub fn local(identity: AgentIdentity, port: u16) -> Result<Self, SessionError> {
        Ok(Self::new(identity, hub_url("127.0.0.1", port)?))
    }

    /// Builds a configuration from a full address such as
    /// `ws://host:9200/?name=hi`; the identity comes from the query string.
    pub fn from_url(raw: &str) -> Result<Self, SessionError> {
        let url = parse_hub_url(raw)?;
        let identity = AgentIdentity::from_query(url.query());
        Ok(Self::new(identity, url))
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Address dialled by the session, identity included.
    pub fn connect_url(&self) -> Url {
        self.identity.connect_url(&self.hub)
    }
}
