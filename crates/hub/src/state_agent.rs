//! The bootstrap agent named `state`, which exposes the registry.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use serde_json::{Map, Value};
use url::Url;

use cstate_agent::{AgentSession, QueryTable, SessionConfig, StateTable};
use cstate_protocol::AgentIdentity;
use cstate_protocol::constants::STATE_AGENT_NAME;

use crate::HubError;
use crate::registry::Registry;

/// Address the bootstrap agent dials to reach a hub listening on `local`.
fn dial_addr(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => (Ipv4Addr::LOCALHOST, local.port()).into(),
        IpAddr::V6(ip) if ip.is_unspecified() => (Ipv6Addr::LOCALHOST, local.port()).into(),
        _ => local,
    }
}

/// Builds the `state` agent with its routes. The caller opens it.
///
/// State routes: `clients` lists live agent names and `stats` maps each name
/// to its statistics. Query route: `stats(name)` returns one agent's
/// statistics.
pub(crate) fn build(registry: Arc<Registry>, local: SocketAddr) -> Result<AgentSession, HubError> {
    let hub = Url::parse(&format!("ws://{}/", dial_addr(local)))?;
    let session = AgentSession::new(SessionConfig::new(AgentIdentity::new(STATE_AGENT_NAME), hub));

    let clients = Arc::clone(&registry);
    let stats = Arc::clone(&registry);
    session.state_route(
        StateTable::new()
            .route("clients", move || {
                let names = clients.names();
                async move { Some(Value::from(names)) }
            })
            .route("stats", move || {
                let all = stats.stats_all();
                async move { Some(Value::Object(all)) }
            }),
    );

    session.query_route(QueryTable::new().route("stats", move |params: Vec<Value>| {
        let one = params
            .first()
            .and_then(Value::as_str)
            .and_then(|name| registry.stats(name));
        async move { one }
    }));

    Ok(session)
}

/// Emits a lifecycle log record (`connected`, `disconnect`) for `agent`.
pub(crate) fn lifecycle(session: &AgentSession, raw: &str, agent: &str) {
    let mut extra = Map::new();
    extra.insert("name".into(), Value::from(agent));
    if let Err(e) = session.log_with(raw, extra) {
        tracing::debug!(agent, "lifecycle log dropped: {e}");
    }
}
