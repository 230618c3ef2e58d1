//! Outbound queue, pending-reply table and WebSocket dialing.
//!
//! The outbound queue belongs to the session, not to a single connection:
//! messages sent while the link is down are written by the next
//! connection's write pump.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use cstate_protocol::constants::{SEND_BUFFER_SIZE, WS_MAX_MESSAGE_SIZE};
use cstate_protocol::envelope::Message;

use crate::SessionError;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Receiving half of the outbound queue, held by the live write pump.
pub(crate) type OutboundRx = Arc<tokio::sync::Mutex<mpsc::Receiver<Outbound>>>;

/// One queued frame.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub(crate) frame: WsMessage,
    /// Correlation id of a request frame. The write pump skips the frame
    /// once the id is no longer pending.
    pub(crate) awaiting: Option<String>,
}

/// Locks a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sending half of the outbound queue.
///
/// Cloneable and cheap; wraps an `mpsc::Sender`.
#[derive(Clone)]
pub(crate) struct Outbox {
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    pub(crate) fn new() -> (Self, OutboundRx) {
        let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
        (Self { tx }, Arc::new(tokio::sync::Mutex::new(rx)))
    }

    /// Queues a protocol [`Message`] as JSON text.
    pub(crate) fn send_msg(&self, msg: &Message) -> Result<(), SessionError> {
        let json = serde_json::to_string(msg)?;
        self.push(WsMessage::Text(json.into()), None)
    }

    /// Queues a request that is only worth writing while `msg.id` is pending.
    pub(crate) fn send_request(&self, msg: &Message) -> Result<(), SessionError> {
        let json = serde_json::to_string(msg)?;
        self.push(WsMessage::Text(json.into()), Some(msg.id.clone()))
    }

    /// Queues a raw frame.
    pub(crate) fn send_raw(&self, frame: WsMessage) -> Result<(), SessionError> {
        self.push(frame, None)
    }

    fn push(&self, frame: WsMessage, awaiting: Option<String>) -> Result<(), SessionError> {
        self.tx.try_send(Outbound { frame, awaiting }).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!("send queue full, dropping message");
                SessionError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => SessionError::Disconnected,
        })
    }
}

/// Requests awaiting an `ack`, keyed by correlation id.
#[derive(Clone, Default)]
pub(crate) struct Pending {
    map: Arc<Mutex<HashMap<String, oneshot::Sender<Option<Value>>>>>,
}

impl Pending {
    /// Registers `id`. The entry is removed when the guard drops, so a caller
    /// that stops waiting does not leak it.
    pub(crate) fn register(&self, id: &str) -> (PendingGuard, oneshot::Receiver<Option<Value>>) {
        let (tx, rx) = oneshot::channel();
        lock(&self.map).insert(id.to_string(), tx);
        let guard = PendingGuard {
            pending: self.clone(),
            id: id.to_string(),
        };
        (guard, rx)
    }

    /// Delivers a reply. Returns `false` if nobody is waiting for `id`.
    pub(crate) fn resolve(&self, id: &str, value: Option<Value>) -> bool {
        match lock(&self.map).remove(id) {
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    /// Fails every waiting request; their receivers observe a closed channel.
    pub(crate) fn fail_all(&self) -> usize {
        let mut map = lock(&self.map);
        let n = map.len();
        map.clear();
        n
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        lock(&self.map).contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.map).len()
    }
}

pub(crate) struct PendingGuard {
    pending: Pending,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending.map).remove(&self.id);
    }
}

/// Dials the hub.
pub(crate) async fn connect(url: &Url) -> Result<WsStream, SessionError> {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    let (ws_stream, _) =
        tokio_tungstenite::connect_async_with_config(url.as_str(), Some(ws_config), false).await?;
    Ok(ws_stream)
}
