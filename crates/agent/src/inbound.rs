//! Dispatch of frames received from the hub.

use std::sync::Arc;

use serde_json::Value;
use tracing::{trace, warn};

use cstate_protocol::constants::MessageType;
use cstate_protocol::envelope::Message;
use cstate_protocol::messages::{ForwardedQuery, LogBroadcast, RelayedEvent};

use crate::handlers::HandlerFuture;
use crate::session::SessionShared;
use crate::topics::TopicEvent;
use crate::types::SessionEvent;

/// Handles one text frame.
pub(crate) fn handle_text(shared: &Arc<SessionShared>, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };
    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");

    match msg.msg_type {
        MessageType::Ack => {
            if !shared.pending.resolve(&msg.id, msg.value()) {
                trace!(id = %msg.id, "ack for a request nobody awaits");
            }
        }
        MessageType::State if msg.wants_ack() => match msg.parse_payload::<String>() {
            Ok(Some(key)) => {
                let fut = shared.resolve_state(&key);
                spawn_reply(shared, msg.id, fut);
            }
            _ => reply_absent(shared, &msg),
        },
        MessageType::Query if msg.wants_ack() => match msg.parse_payload::<ForwardedQuery>() {
            Ok(Some(q)) => {
                let fut = shared.resolve_query(&q.key, q.params);
                spawn_reply(shared, msg.id, fut);
            }
            _ => reply_absent(shared, &msg),
        },
        MessageType::Event => match msg.parse_payload::<RelayedEvent>() {
            Ok(Some(ev)) => {
                if let Some(topic) = shared.topic(&ev.source) {
                    topic.emit(TopicEvent {
                        event: ev.event.clone(),
                        args: ev.args.clone(),
                    });
                }
                let _ = shared.events_tx.send(SessionEvent::Event(ev));
            }
            _ => warn!("malformed event payload"),
        },
        MessageType::Log => match msg.parse_payload::<LogBroadcast>() {
            Ok(Some(log)) => {
                let _ = shared.events_tx.send(SessionEvent::Log(log));
            }
            _ => warn!("malformed log payload"),
        },
        other => trace!(msg_type = ?other, "ignoring message"),
    }
}

fn reply_absent(shared: &SessionShared, msg: &Message) {
    warn!(msg_type = ?msg.msg_type, id = %msg.id, "malformed request, replying absent");
    send_ack(shared, &msg.id, None);
}

/// Runs a handler and acks `id` with its result.
///
/// A panicking handler is answered with the absent value.
fn spawn_reply(shared: &Arc<SessionShared>, id: String, fut: HandlerFuture) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let value = match tokio::spawn(fut).await {
            Ok(v) => v,
            Err(e) => {
                warn!(id = %id, "handler failed: {e}");
                None
            }
        };
        send_ack(&shared, &id, value.as_ref());
    });
}

fn send_ack(shared: &SessionShared, id: &str, value: Option<&Value>) {
    let sent = Message::ack(id, value)
        .map_err(crate::SessionError::from)
        .and_then(|ack| shared.outbox.send_msg(&ack));
    if let Err(e) = sent {
        warn!(id, "ack not sent: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cstate_protocol::AgentIdentity;
    use serde_json::json;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    use crate::handlers::{QueryTable, StateTable};
    use crate::topics::Topic;
    use crate::types::SessionConfig;

    fn shared() -> Arc<SessionShared> {
        SessionShared::new(SessionConfig::local(AgentIdentity::new("answer"), 1).unwrap())
    }

    fn text(msg: &Message) -> String {
        serde_json::to_string(msg).unwrap()
    }

    async fn next_ack(shared: &SessionShared) -> Message {
        match shared.outbound_rx.lock().await.recv().await.unwrap().frame {
            WsMessage::Text(t) => {
                let msg: Message = serde_json::from_str(t.as_str()).unwrap();
                assert_eq!(msg.msg_type, MessageType::Ack);
                msg
            }
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ack_resolves_pending_request() {
        let s = shared();
        let (_guard, rx) = s.pending.register("r1");
        handle_text(&s, &text(&Message::ack("r1", Some(&json!(233))).unwrap()));
        assert_eq!(rx.await.unwrap(), Some(json!(233)));
    }

    #[tokio::test]
    async fn state_request_runs_handler() {
        let s = shared();
        s.merge_state(StateTable::new().route("testQ", || async { Some(json!(233)) }));
        handle_text(&s, &text(&Message::new("r1", MessageType::State, Some(&"testQ")).unwrap()));

        let ack = next_ack(&s).await;
        assert_eq!(ack.id, "r1");
        assert_eq!(ack.value(), Some(json!(233)));
    }

    #[tokio::test]
    async fn unknown_state_key_replies_absent() {
        let s = shared();
        handle_text(&s, &text(&Message::new("r2", MessageType::State, Some(&"nope")).unwrap()));
        let ack = next_ack(&s).await;
        assert_eq!(ack.id, "r2");
        assert!(ack.payload.is_none());
    }

    #[tokio::test]
    async fn query_request_passes_params() {
        let s = shared();
        s.merge_query(QueryTable::new().route("plus", |p: Vec<Value>| async move {
            p.first().and_then(Value::as_i64).map(|n| json!(n + 1))
        }));
        let fwd = ForwardedQuery {
            key: "plus".into(),
            params: vec![json!(233)],
        };
        handle_text(&s, &text(&Message::new("q1", MessageType::Query, Some(&fwd)).unwrap()));
        assert_eq!(next_ack(&s).await.value(), Some(json!(234)));
    }

    #[tokio::test]
    async fn panicking_handler_replies_absent() {
        let s = shared();
        s.merge_state(StateTable::new().route("boom", || async {
            let value: Option<Value> = None;
            assert!(value.is_some(), "handler exploded");
            value
        }));
        handle_text(&s, &text(&Message::new("r3", MessageType::State, Some(&"boom")).unwrap()));
        let ack = next_ack(&s).await;
        assert_eq!(ack.id, "r3");
        assert!(ack.value().is_none());
    }

    #[tokio::test]
    async fn event_reaches_topic_and_session_events() {
        let s = shared();
        let topic = Topic::new("pub");
        s.insert_topic(topic.clone());
        let mut listener = topic.listen();
        let mut events = s.events_tx.subscribe();

        let ev = RelayedEvent {
            source: "pub".into(),
            event: "a".into(),
            args: vec![json!(233)],
        };
        handle_text(&s, &text(&Message::notify(MessageType::Event, &ev).unwrap()));

        assert_eq!(listener.recv_event("a").await, Some(vec![json!(233)]));
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Event(ev));
    }

    #[tokio::test]
    async fn log_becomes_session_event() {
        let s = shared();
        let mut events = s.events_tx.subscribe();
        let log = LogBroadcast {
            name: "tester".into(),
            data: json!({"raw": "nice"}),
        };
        handle_text(&s, &text(&Message::notify(MessageType::Log, &log).unwrap()));
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Log(log));
    }

    #[tokio::test]
    async fn malformed_json_is_ignored() {
        let s = shared();
        handle_text(&s, "not valid json {{{");
        assert!(s.outbound_rx.lock().await.try_recv().is_err());
    }
}
