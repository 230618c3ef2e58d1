//! The agent session: public API plus the state shared with its tasks.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use cstate_protocol::constants::MessageType;
use cstate_protocol::envelope::Message;
use cstate_protocol::messages::{EventEnvelope, LogRecord, QueryRequest, StateRequest};
use cstate_protocol::{AgentIdentity, Stats};

use crate::SessionError;
use crate::handlers::{HandlerFuture, QueryTable, StateTable};
use crate::heartbeat::{heartbeat_loop, process_uptime};
use crate::link::{Outbox, OutboundRx, Pending, lock};
use crate::reconnection::supervise;
use crate::topics::Topic;
use crate::types::{ConnectionState, ReconnectConfig, SessionConfig, SessionEvent};

/// Buffered session signals before a slow listener starts lagging.
const EVENT_CAPACITY: usize = 256;

/// State shared between the session handle and its background tasks.
pub(crate) struct SessionShared {
    pub(crate) identity: AgentIdentity,
    pub(crate) url: Url,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) reconnect: ReconnectConfig,
    pub(crate) outbox: Outbox,
    pub(crate) outbound_rx: OutboundRx,
    pub(crate) pending: Pending,
    state_table: RwLock<StateTable>,
    query_table: RwLock<QueryTable>,
    topics: Mutex<HashMap<String, Topic>>,
    joins: Mutex<BTreeSet<String>>,
    state_tx: watch::Sender<ConnectionState>,
    pub(crate) events_tx: broadcast::Sender<SessionEvent>,
    /// Cancels the supervisor and heartbeat; `Some` while open.
    lifecycle: Mutex<Option<CancellationToken>>,
    /// The most recent supervisor, possibly still winding down.
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionShared {
    pub(crate) fn new(config: SessionConfig) -> Arc<Self> {
        // Pin the uptime origin no later than the first session.
        let _ = process_uptime();

        let (outbox, outbound_rx) = Outbox::new();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            url: config.connect_url(),
            identity: config.identity,
            heartbeat_interval: config.heartbeat_interval,
            reconnect: config.reconnect,
            outbox,
            outbound_rx,
            pending: Pending::default(),
            state_table: RwLock::new(StateTable::new()),
            query_table: RwLock::new(QueryTable::new()),
            topics: Mutex::new(HashMap::new()),
            joins: Mutex::new(BTreeSet::new()),
            state_tx,
            events_tx,
            lifecycle: Mutex::new(None),
            supervisor: Mutex::new(None),
        })
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub(crate) fn set_state(&self, new_state: ConnectionState) {
        let old = self.state_tx.send_replace(new_state.clone());
        if old != new_state {
            debug!(agent = %self.identity.name, from = ?old, to = ?new_state, "session state changed");
        }
    }

    /// Transition into `Connected`: announce it and replay every tracked join.
    pub(crate) fn on_connected(&self) {
        self.set_state(ConnectionState::Connected);
        let _ = self.events_tx.send(SessionEvent::Connected);

        let joins: Vec<String> = lock(&self.joins).iter().cloned().collect();
        for topic in &joins {
            self.send_join(topic);
        }
        info!(agent = %self.identity.name, rejoined = joins.len(), "connected to hub");
    }

    /// Transition out of `Connected`: in-flight requests fail.
    pub(crate) fn on_disconnected(&self) {
        let failed = self.pending.fail_all();
        self.set_state(ConnectionState::Disconnected);
        let _ = self.events_tx.send(SessionEvent::Disconnected);
        info!(agent = %self.identity.name, failed_requests = failed, "disconnected from hub");
    }

    pub(crate) fn resolve_state(&self, key: &str) -> HandlerFuture {
        match self.state_table.read() {
            Ok(table) => table.resolve(key),
            Err(poisoned) => poisoned.into_inner().resolve(key),
        }
    }

    pub(crate) fn resolve_query(&self, key: &str, params: Vec<Value>) -> HandlerFuture {
        match self.query_table.read() {
            Ok(table) => table.resolve(key, params),
            Err(poisoned) => poisoned.into_inner().resolve(key, params),
        }
    }

    pub(crate) fn merge_state(&self, table: StateTable) {
        debug!(agent = %self.identity.name, keys = ?table.keys(), "state routes registered");
        match self.state_table.write() {
            Ok(mut t) => t.merge(table),
            Err(poisoned) => poisoned.into_inner().merge(table),
        }
    }

    pub(crate) fn merge_query(&self, table: QueryTable) {
        debug!(agent = %self.identity.name, keys = ?table.keys(), "query routes registered");
        match self.query_table.write() {
            Ok(mut t) => t.merge(table),
            Err(poisoned) => poisoned.into_inner().merge(table),
        }
    }

    pub(crate) fn topic(&self, name: &str) -> Option<Topic> {
        lock(&self.topics).get(name).cloned()
    }

    /// Returns the existing multiplexer for `name`, or registers `topic`.
    /// The flag is `true` when `topic` was registered.
    pub(crate) fn insert_topic(&self, topic: Topic) -> (Topic, bool) {
        let mut topics = lock(&self.topics);
        match topics.get(topic.name()) {
            Some(existing) => (existing.clone(), false),
            None => {
                topics.insert(topic.name().to_string(), topic.clone());
                (topic, true)
            }
        }
    }

    /// Queues an uncorrelated message.
    pub(crate) fn notify<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<(), SessionError> {
        let msg = Message::notify(msg_type, payload)?;
        self.outbox.send_msg(&msg)
    }

    /// Queues a correlated request and waits for its `ack`.
    ///
    /// A request issued while disconnected is queued and answered after the
    /// next connect. There is no timeout.
    pub(crate) async fn request<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Option<Value>, SessionError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, Some(payload))?;

        let (_guard, rx) = self.pending.register(&id);
        self.outbox.send_request(&msg)?;

        rx.await.map_err(|_| SessionError::Disconnected)
    }

    fn send_join(&self, topic: &str) {
        if let Err(e) = self.notify(MessageType::Join, &topic) {
            tracing::warn!(agent = %self.identity.name, topic, "join not sent: {e}");
        }
    }

    fn start(self: &Arc<Self>) {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.is_some() {
            return;
        }
        let cancel = CancellationToken::new();

        // A supervisor from before the last close may still be tearing its
        // link down; the new one starts after it has finished.
        let previous = lock(&self.supervisor).take();
        let shared = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            supervise(shared, token).await;
        });
        *lock(&self.supervisor) = Some(handle);

        tokio::spawn(heartbeat_loop(Arc::clone(self), cancel.clone()));
        *lifecycle = Some(cancel);
    }

    fn stop(&self) {
        if let Some(cancel) = lock(&self.lifecycle).take() {
            cancel.cancel();
        }
    }
}

/// One agent's session with the hub.
///
/// Cheap to clone; all clones share the connection. The session closes when
/// the last clone is dropped.
#[derive(Clone)]
pub struct AgentSession {
    handle: Arc<SessionHandle>,
}

struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl AgentSession {
    /// Creates a session. Nothing is dialled until [`open`](Self::open).
    pub fn new(config: SessionConfig) -> Self {
        Self {
            handle: Arc::new(SessionHandle {
                shared: SessionShared::new(config),
            }),
        }
    }

    fn shared(&self) -> &Arc<SessionShared> {
        &self.handle.shared
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.shared().identity
    }

    /// Connects to the hub and keeps reconnecting until [`close`](Self::close).
    ///
    /// Starts the heartbeat. Calling `open` on an open session does nothing.
    /// Must be called from within a tokio runtime.
    pub fn open(&self) {
        self.shared().start();
    }

    /// Stops the heartbeat and drops the connection. Idempotent.
    pub fn close(&self) {
        self.shared().stop();
    }

    /// Returns `true` between [`open`](Self::open) and [`close`](Self::close).
    pub fn is_open(&self) -> bool {
        lock(&self.shared().lifecycle).is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared().state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared().state_tx.subscribe()
    }

    /// Waits until the session is connected.
    pub async fn wait_connected(&self) {
        let mut rx = self.watch_state();
        // The sender lives as long as `self`, so this only returns once connected.
        let _ = rx.wait_for(|s| *s == ConnectionState::Connected).await;
    }

    /// Subscribes to connect/disconnect, log and event signals.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared().events_tx.subscribe()
    }

    /// Merges state handlers into this session's table.
    pub fn state_route(&self, table: StateTable) {
        self.shared().merge_state(table);
    }

    /// Merges query handlers into this session's table.
    pub fn query_route(&self, table: QueryTable) {
        self.shared().merge_query(table);
    }

    /// Returns an asker bound to the agent named `target`.
    pub fn ask(&self, target: impl Into<String>) -> Asker {
        Asker {
            session: self.clone(),
            target: target.into(),
        }
    }

    /// Returns a querier bound to the agent named `target`.
    pub fn query(&self, target: impl Into<String>) -> Querier {
        Querier {
            session: self.clone(),
            target: target.into(),
        }
    }

    /// Sends a log record.
    pub fn log(&self, raw: impl Into<String>) -> Result<(), SessionError> {
        self.log_with(raw, Map::new())
    }

    /// Sends a log record merged with extra fields.
    pub fn log_with(
        &self,
        raw: impl Into<String>,
        extra: Map<String, Value>,
    ) -> Result<(), SessionError> {
        self.shared()
            .notify(MessageType::Log, &LogRecord::new(raw, extra))
    }

    /// Reports statistics; the hub shallow-merges them into this agent's entry.
    pub fn update(&self, stats: Stats) -> Result<(), SessionError> {
        self.shared().notify(MessageType::Stats, &stats)
    }

    /// Joins `topic` now and again after every reconnect.
    pub fn join(&self, topic: impl Into<String>) {
        let topic = topic.into();
        lock(&self.shared().joins).insert(topic.clone());
        self.shared().send_join(&topic);
    }

    /// Topics this session rejoins on connect.
    pub fn joined(&self) -> Vec<String> {
        lock(&self.shared().joins).iter().cloned().collect()
    }

    /// Returns a publisher for events named `event`.
    pub fn publish(&self, event: impl Into<String>) -> Publisher {
        Publisher {
            session: self.clone(),
            event: event.into(),
        }
    }

    /// Returns the multiplexer for `topic`, creating it and joining the topic
    /// on first use.
    pub fn subscribe(&self, topic: impl Into<String>) -> Topic {
        let topic = topic.into();
        let (handle, created) = self.shared().insert_topic(Topic::new(topic.clone()));
        if created {
            self.join(topic);
        }
        handle
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared().pending.len()
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("identity", self.identity())
            .field("state", &self.state())
            .finish()
    }
}

/// Issues `state` requests to one agent. See [`AgentSession::ask`].
#[derive(Clone, Debug)]
pub struct Asker {
    session: AgentSession,
    target: String,
}

impl Asker {
    /// Asks the target for `key`.
    ///
    /// `Ok(None)` means the target is unknown, has no handler for `key`, or
    /// its handler returned nothing.
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<Value>, SessionError> {
        let req = StateRequest {
            target_name: self.target.clone(),
            key: key.into(),
        };
        self.session.shared().request(MessageType::State, &req).await
    }
}

/// Issues `query` requests to one agent. See [`AgentSession::query`].
#[derive(Clone, Debug)]
pub struct Querier {
    session: AgentSession,
    target: String,
}

impl Querier {
    /// Calls the target's `key` handler with positional `params`.
    ///
    /// Absent results are ambiguous in the same way as [`Asker::get`].
    pub async fn call(
        &self,
        key: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<Option<Value>, SessionError> {
        let req = QueryRequest {
            target_name: self.target.clone(),
            key: key.into(),
            params,
        };
        self.session.shared().request(MessageType::Query, &req).await
    }
}

/// Publishes one event name. See [`AgentSession::publish`].
#[derive(Clone, Debug)]
pub struct Publisher {
    session: AgentSession,
    event: String,
}

impl Publisher {
    /// Publishes the event with `args` to every subscriber of this agent.
    pub fn emit(&self, args: Vec<Value>) -> Result<(), SessionError> {
        let envelope = EventEnvelope {
            event: self.event.clone(),
            args,
        };
        self.session.shared().notify(MessageType::Event, &envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    fn session(name: &str) -> AgentSession {
        AgentSession::new(SessionConfig::local(AgentIdentity::new(name), 1).unwrap())
    }

    async fn next_message(s: &AgentSession) -> Message {
        let frame = s.shared().outbound_rx.lock().await.recv().await.unwrap().frame;
        match frame {
            WsMessage::Text(t) => serde_json::from_str(t.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn new_session_is_closed_and_disconnected() {
        let s = session("a");
        assert!(!s.is_open());
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert_eq!(s.identity().name, "a");
    }

    #[tokio::test]
    async fn subscribe_is_memoized_and_joins_once() {
        let s = session("sub");
        let t1 = s.subscribe("pub");
        let t2 = s.subscribe("pub");
        assert_eq!(t1, t2);
        assert_eq!(s.joined(), vec!["pub".to_string()]);

        let msg = next_message(&s).await;
        assert_eq!(msg.msg_type, MessageType::Join);
        assert_eq!(msg.parse_payload::<String>().unwrap().as_deref(), Some("pub"));
        assert!(s.shared().outbound_rx.lock().await.try_recv().is_err());
    }

    #[tokio::test]
    async fn reconnect_replays_joins() {
        let s = session("sub");
        s.join("a");
        s.join("b");
        let _ = next_message(&s).await;
        let _ = next_message(&s).await;

        s.shared().on_connected();
        let mut replayed = vec![
            next_message(&s).await.parse_payload::<String>().unwrap().unwrap(),
            next_message(&s).await.parse_payload::<String>().unwrap().unwrap(),
        ];
        replayed.sort();
        assert_eq!(replayed, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(s.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn log_merges_extra_fields() {
        let s = session("tester");
        let mut extra = Map::new();
        extra.insert("name".into(), json!("x"));
        s.log_with("nice", extra).unwrap();

        let msg = next_message(&s).await;
        assert_eq!(msg.msg_type, MessageType::Log);
        assert!(msg.id.is_empty());
        assert_eq!(msg.value(), Some(json!({"raw": "nice", "name": "x"})));
    }

    #[tokio::test]
    async fn publish_sends_event_envelope() {
        let s = session("pub");
        s.publish("a").emit(vec![json!(233)]).unwrap();
        let msg = next_message(&s).await;
        assert_eq!(msg.msg_type, MessageType::Event);
        assert_eq!(msg.value(), Some(json!({"event": "a", "args": [233]})));
    }

    #[tokio::test]
    async fn ask_is_correlated_and_resolved_by_ack() {
        let s = session("runner");
        let asker = s.ask("state");
        let call = tokio::spawn(async move { asker.get("clients").await });

        let msg = next_message(&s).await;
        assert_eq!(msg.msg_type, MessageType::State);
        assert!(msg.wants_ack());
        assert_eq!(
            msg.value(),
            Some(json!({"targetName": "state", "key": "clients"}))
        );

        assert!(s.shared().pending.resolve(&msg.id, Some(json!(["runner"]))));
        assert_eq!(call.await.unwrap().unwrap(), Some(json!(["runner"])));
        assert_eq!(s.pending_requests(), 0);
    }

    #[tokio::test]
    async fn disconnect_fails_in_flight_requests() {
        let s = session("runner");
        let querier = s.query("answer");
        let call = tokio::spawn(async move { querier.call("plus", vec![json!(1)]).await });

        let msg = next_message(&s).await;
        assert_eq!(msg.msg_type, MessageType::Query);
        s.shared().on_disconnected();

        assert!(matches!(call.await.unwrap(), Err(SessionError::Disconnected)));
    }

    async fn wait_pending(s: &AgentSession, n: usize) {
        while s.pending_requests() != n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn failed_requests_are_not_sent_on_the_next_link() {
        let s = session("runner");
        let querier = s.query("answer");
        let charge = tokio::spawn(async move { querier.call("charge", vec![json!(100)]).await });
        wait_pending(&s, 1).await;

        s.shared().on_disconnected();
        assert!(matches!(charge.await.unwrap(), Err(SessionError::Disconnected)));

        let querier = s.query("answer");
        let later = tokio::spawn(async move { querier.call("later", vec![]).await });
        wait_pending(&s, 1).await;

        let (sink_tx, mut sink_rx) = tokio::sync::mpsc::channel::<WsMessage>(16);
        let sink = Box::pin(futures_util::sink::unfold(sink_tx, |tx, msg: WsMessage| async move {
            let _ = tx.send(msg).await;
            Ok::<_, tokio_tungstenite::tungstenite::Error>(tx)
        }));
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(crate::pumps::write::write_pump(
            sink,
            Arc::clone(&s.shared().outbound_rx),
            s.shared().pending.clone(),
            cancel.clone(),
        ));

        let sent: Message = match sink_rx.recv().await {
            Some(WsMessage::Text(t)) => serde_json::from_str(t.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        };
        assert_eq!(
            sent.value(),
            Some(json!({"targetName": "answer", "key": "later", "params": []}))
        );

        cancel.cancel();
        pump.await.unwrap();
        assert!(matches!(sink_rx.recv().await, Some(WsMessage::Close(_))));
        later.abort();
    }

    #[tokio::test]
    async fn state_route_merges() {
        let s = session("answer");
        s.state_route(StateTable::new().route("a", || async { Some(json!(1)) }));
        s.state_route(StateTable::new().route("b", || async { Some(json!(2)) }));
        assert_eq!(s.shared().resolve_state("a").await, Some(json!(1)));
        assert_eq!(s.shared().resolve_state("b").await, Some(json!(2)));
        assert_eq!(s.shared().resolve_state("c").await, None);
    }

    #[tokio::test]
    async fn connect_signals_are_broadcast() {
        let s = session("a");
        let mut events = s.events();
        s.shared().on_connected();
        s.shared().on_disconnected();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Disconnected);
    }
}
