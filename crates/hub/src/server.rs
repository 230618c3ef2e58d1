//! Hub WebSocket server.
//!
//! Listens on a TCP port and upgrades every connection to WebSocket. The
//! agent identity is read from the handshake query string; connections with
//! an empty or already-registered name are kept open but never admitted.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cstate_agent::AgentSession;
use cstate_protocol::AgentIdentity;
use cstate_protocol::constants::{DEFAULT_PORT, WS_MAX_MESSAGE_SIZE};

use crate::HubError;
use crate::peer::{self, Peer};
use crate::registry::Registry;
use crate::relay::dispatch;
use crate::state_agent;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
        }
    }
}

/// What every connection task needs.
#[derive(Clone)]
struct HubContext {
    registry: Arc<Registry>,
    state_agent: AgentSession,
    cancel: CancellationToken,
}

/// A running hub.
///
/// Dropping the hub shuts it down.
pub struct Hub {
    ctx: HubContext,
    local_addr: SocketAddr,
}

impl Hub {
    /// Binds the listener, starts accepting agents and opens the bootstrap
    /// `state` agent over loopback.
    pub async fn start(config: ServerConfig) -> Result<Self, HubError> {
        let listener = TcpListener::bind((config.bind, config.port)).await?;
        let local_addr = listener.local_addr()?;
        info!("hub listening on {local_addr}");

        let registry = Arc::new(Registry::new());
        let state_agent = state_agent::build(Arc::clone(&registry), local_addr)?;
        let ctx = HubContext {
            registry,
            state_agent,
            cancel: CancellationToken::new(),
        };

        tokio::spawn(accept_loop(ctx.clone(), listener));
        ctx.state_agent.open();

        Ok(Self { ctx, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.ctx.registry
    }

    /// The bootstrap `state` agent.
    pub fn state_agent(&self) -> &AgentSession {
        &self.ctx.state_agent
    }

    /// Stops the bootstrap agent and the accept loop and closes every
    /// connection. Idempotent.
    pub fn shutdown(&self) {
        if self.ctx.cancel.is_cancelled() {
            return;
        }
        info!("hub shutting down");
        self.ctx.state_agent.close();
        self.ctx.cancel.cancel();
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been called.
    pub async fn stopped(&self) {
        self.ctx.cancel.cancelled().await;
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(ctx: HubContext, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,

            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(ctx, stream, peer_addr).await {
                                debug!(%peer_addr, "connection error: {e}");
                            }
                        });
                    }
                    Err(e) => error!("accept error: {e}"),
                }
            }
        }
    }
    debug!("accept loop stopped");
}

/// Upgrades one TCP connection and serves it until it closes.
async fn handle_connection(
    ctx: HubContext,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<(), HubError> {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

    let mut query: Option<String> = None;
    let capture_query = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        query = req.uri().query().map(str::to_owned);
        Ok(resp)
    };
    let ws_stream = accept_hdr_async_with_config(stream, capture_query, Some(ws_config)).await?;

    let identity = AgentIdentity::from_query(query.as_deref());
    let (peer, rx) = Peer::new(identity, ctx.cancel.child_token());

    let admitted = match ctx.registry.admit(&peer) {
        Ok(()) => {
            info!(agent = %peer.name(), group = %peer.identity().group, %peer_addr, "agent admitted");
            state_agent::lifecycle(&ctx.state_agent, "connected", peer.name());
            true
        }
        Err(e) => {
            warn!(%peer_addr, "connection not admitted: {e}");
            false
        }
    };

    let (sink, frames) = ws_stream.split();
    let write_handle = tokio::spawn(peer::write_pump(sink, rx, peer.cancel_token()));

    peer::read_pump(frames, &peer, |text| {
        if admitted {
            dispatch(&ctx.registry, &peer, text);
        }
    })
    .await;

    peer.close();
    let _ = write_handle.await;

    if admitted {
        ctx.registry.remove(&peer);
        let failed = peer.fail_pending();
        info!(agent = %peer.name(), failed_requests = failed, "agent disconnected");
        state_agent::lifecycle(&ctx.state_agent, "disconnect", peer.name());
    }

    Ok(())
}
