//! One agent connection seen from the hub: send queue, pending relayed
//! requests and the read/write pumps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use cstate_protocol::AgentIdentity;
use cstate_protocol::constants::{MessageType, SEND_BUFFER_SIZE, WS_PONG_WAIT, WS_WRITE_WAIT};
use cstate_protocol::envelope::Message;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Handle to one agent connection.
///
/// Cloneable and cheap; clones refer to the same connection.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    conn_id: u64,
    identity: AgentIdentity,
    tx: mpsc::Sender<WsMessage>,
    pending: Mutex<HashMap<String, oneshot::Sender<Option<Value>>>>,
    cancel: CancellationToken,
}

impl Peer {
    /// Creates a peer and the receiving end of its send queue.
    pub fn new(identity: AgentIdentity, cancel: CancellationToken) -> (Self, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let peer = Self {
            inner: Arc::new(PeerInner {
                conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
                identity,
                tx,
                pending: Mutex::new(HashMap::new()),
                cancel,
            }),
        };
        (peer, rx)
    }

    /// Process-unique id of this connection.
    pub fn conn_id(&self) -> u64 {
        self.inner.conn_id
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.inner.identity
    }

    pub fn name(&self) -> &str {
        &self.inner.identity.name
    }

    /// Sends a protocol [`Message`] as JSON text.
    pub fn send_msg(&self, msg: &Message) -> Result<(), SendError> {
        let json = serde_json::to_string(msg).map_err(|_| SendError)?;
        self.send_raw(WsMessage::Text(json.into()))
    }

    fn send_raw(&self, frame: WsMessage) -> Result<(), SendError> {
        self.inner.tx.try_send(frame).map_err(|_| {
            tracing::warn!(agent = %self.name(), "send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends a correlated request to this agent.
    ///
    /// The receiver yields the agent's reply, or errors if the connection
    /// drops first.
    pub fn request<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<oneshot::Receiver<Option<Value>>, SendError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, Some(payload)).map_err(|_| SendError)?;

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id.clone(), tx);
        if let Err(e) = self.send_msg(&msg) {
            lock(&self.inner.pending).remove(&id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Delivers this agent's reply to a request the hub sent it.
    pub fn resolve(&self, id: &str, value: Option<Value>) -> bool {
        match lock(&self.inner.pending).remove(id) {
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    /// Drops every request still waiting on this agent.
    pub fn fail_pending(&self) -> usize {
        let mut pending = lock(&self.inner.pending);
        let n = pending.len();
        pending.clear();
        n
    }

    /// Signals the pumps to stop.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("conn_id", &self.inner.conn_id)
            .field("identity", &self.inner.identity)
            .finish()
    }
}

/// Write pump: drains the send queue into the socket.
pub(crate) async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        match tokio::time::timeout(WS_WRITE_WAIT, sink.send(ws_msg)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                tracing::debug!("write pump send error: {e}");
                                break;
                            }
                            Err(_) => {
                                tracing::warn!("write pump timed out");
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// Read pump: hands text frames to `on_text` until the socket ends, closes
/// or stays silent past [`WS_PONG_WAIT`].
pub(crate) async fn read_pump<S, F>(mut stream: S, peer: &Peer, mut on_text: F)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    F: FnMut(&str),
{
    let cancel = peer.cancel_token();
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                tracing::warn!(agent = %peer.name(), "read deadline passed, closing connection");
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);
                        match ws_msg {
                            WsMessage::Text(text) => on_text(text.as_str()),
                            WsMessage::Ping(data) => {
                                let _ = peer.send_raw(WsMessage::Pong(data));
                            }
                            WsMessage::Close(_) => {
                                tracing::debug!(agent = %peer.name(), "received close frame");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(agent = %peer.name(), "read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}
