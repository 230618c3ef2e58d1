//! Per-message dispatch for admitted agents.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use cstate_protocol::constants::{GROUP_ALL, GROUP_LOG, MessageType};
use cstate_protocol::envelope::Message;
use cstate_protocol::messages::{
    EventEnvelope, ForwardedQuery, LogBroadcast, QueryRequest, RelayedEvent, StateRequest,
};
use cstate_protocol::Stats;

use crate::peer::Peer;
use crate::registry::Registry;

/// Handles one text frame from the admitted agent `from`.
pub(crate) fn dispatch(registry: &Arc<Registry>, from: &Peer, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(agent = %from.name(), "invalid message JSON: {e}");
            return;
        }
    };
    trace!(agent = %from.name(), msg_type = ?msg.msg_type, id = %msg.id, "dispatch");

    match msg.msg_type {
        MessageType::Log => {
            let data = msg.value().unwrap_or(Value::Null);
            let wrapped = LogBroadcast {
                name: from.name().to_string(),
                data,
            };
            multicast(registry, &[GROUP_ALL, GROUP_LOG, from.name()], MessageType::Log, &wrapped);
        }
        MessageType::Join => match msg.parse_payload::<String>() {
            Ok(Some(room)) => {
                debug!(agent = %from.name(), topic = %room, "join");
                registry.join(&room, from);
            }
            _ => warn!(agent = %from.name(), "malformed join payload"),
        },
        MessageType::State => {
            if !msg.wants_ack() {
                return;
            }
            match msg.parse_payload::<StateRequest>() {
                Ok(Some(req)) => forward(registry, from, msg.id, &req.target_name, MessageType::State, &req.key),
                _ => answer(from, &msg.id, None),
            }
        }
        MessageType::Query => {
            if !msg.wants_ack() {
                return;
            }
            match msg.parse_payload::<QueryRequest>() {
                Ok(Some(req)) => {
                    let target = req.target_name.clone();
                    let fwd = ForwardedQuery::from(req);
                    forward(registry, from, msg.id, &target, MessageType::Query, &fwd);
                }
                _ => answer(from, &msg.id, None),
            }
        }
        MessageType::Stats => match msg.parse_payload::<Stats>() {
            Ok(Some(report)) => registry.merge_stats(from.name(), report),
            _ => warn!(agent = %from.name(), "malformed stats payload"),
        },
        MessageType::Event => match msg.parse_payload::<EventEnvelope>() {
            Ok(Some(envelope)) => {
                let relayed = RelayedEvent::from_envelope(from.name(), envelope);
                multicast(registry, &[from.name()], MessageType::Event, &relayed);
            }
            _ => warn!(agent = %from.name(), "malformed event payload"),
        },
        MessageType::Ack => {
            if !from.resolve(&msg.id, msg.value()) {
                trace!(agent = %from.name(), id = %msg.id, "late or unknown ack");
            }
        }
        MessageType::Unknown => trace!(agent = %from.name(), "ignoring unknown message type"),
    }
}

fn multicast<T: Serialize>(registry: &Registry, rooms: &[&str], msg_type: MessageType, payload: &T) {
    match Message::notify(msg_type, payload) {
        Ok(out) => {
            let n = registry.broadcast(rooms, &out);
            trace!(?rooms, delivered = n, "multicast");
        }
        Err(e) => warn!("failed to encode multicast: {e}"),
    }
}

/// Forwards a request to `target` and answers `caller` with its reply.
///
/// An unknown target, a failed send, or a target that disconnects before
/// replying all answer with the absent value.
fn forward<T: Serialize>(
    registry: &Registry,
    caller: &Peer,
    caller_id: String,
    target: &str,
    msg_type: MessageType,
    payload: &T,
) {
    let Some(target_peer) = registry.peer(target) else {
        debug!(agent = %caller.name(), target, "request for unknown agent");
        answer(caller, &caller_id, None);
        return;
    };

    let reply = match target_peer.request(msg_type, payload) {
        Ok(rx) => rx,
        Err(e) => {
            debug!(target, "forward failed: {e}");
            answer(caller, &caller_id, None);
            return;
        }
    };

    let caller = caller.clone();
    tokio::spawn(async move {
        let value = reply.await.ok().flatten();
        answer(&caller, &caller_id, value.as_ref());
    });
}

fn answer(caller: &Peer, id: &str, value: Option<&Value>) {
    match Message::ack(id, value) {
        Ok(ack) => {
            if let Err(e) = caller.send_msg(&ack) {
                debug!(agent = %caller.name(), id, "reply dropped: {e}");
            }
        }
        Err(e) => warn!(id, "failed to encode reply: {e}"),
    }
}
