//! Per-topic local event multiplexers.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

/// Buffered events per topic listener before the slowest one starts lagging.
const TOPIC_CAPACITY: usize = 256;

/// One event re-emitted on a [`Topic`].
#[derive(Debug, Clone, PartialEq)]
pub struct TopicEvent {
    pub event: String,
    pub args: Vec<Value>,
}

/// Local multiplexer for the events relayed under one topic.
///
/// Cloning yields a handle to the same multiplexer; `==` compares identity.
#[derive(Clone)]
pub struct Topic {
    inner: Arc<TopicInner>,
}

struct TopicInner {
    name: String,
    tx: broadcast::Sender<TopicEvent>,
}

impl Topic {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(TOPIC_CAPACITY);
        Self {
            inner: Arc::new(TopicInner {
                name: name.into(),
                tx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Starts listening. Only events emitted after this call are seen.
    pub fn listen(&self) -> TopicReceiver {
        TopicReceiver {
            rx: self.inner.tx.subscribe(),
        }
    }

    /// Number of live listeners.
    pub fn listeners(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    pub(crate) fn emit(&self, event: TopicEvent) {
        // No listeners is not an error: the event is simply unobserved.
        let _ = self.inner.tx.send(event);
    }
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Topic {}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.inner.name)
            .field("listeners", &self.listeners())
            .finish()
    }
}

/// Listener handle returned by [`Topic::listen`].
pub struct TopicReceiver {
    rx: broadcast::Receiver<TopicEvent>,
}

impl TopicReceiver {
    /// Waits for the next event. Returns `None` once the topic is gone.
    ///
    /// A listener that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<TopicEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "topic listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Waits for the next event named `event` and returns its arguments.
    pub async fn recv_event(&mut self, event: &str) -> Option<Vec<Value>> {
        while let Some(ev) = self.recv().await {
            if ev.event == event {
                return Some(ev.args);
            }
        }
        None
    }
}
