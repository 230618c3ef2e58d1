//! Drains the session's outbound queue into the socket.

use futures_util::SinkExt;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use cstate_protocol::constants::WS_WRITE_WAIT;

use crate::link::{OutboundRx, Pending};

/// Writes queued messages to the WebSocket until cancelled or the sink fails.
///
/// Holds the queue's receiver for its whole lifetime, so at most one
/// connection drains the queue at a time. Requests whose caller has already
/// been failed or has stopped waiting are discarded unsent.
pub(crate) async fn write_pump<S>(
    mut write: S,
    outbound: OutboundRx,
    pending: Pending,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let mut rx = outbound.lock().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => {
                match msg {
                    Some(out) => {
                        if let Some(id) = &out.awaiting
                            && !pending.contains(id)
                        {
                            debug!(id = %id, "dropping request nobody awaits");
                            continue;
                        }
                        match tokio::time::timeout(WS_WRITE_WAIT, write.send(out.frame)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                error!("WebSocket write error: {e}");
                                break;
                            }
                            Err(_) => {
                                error!("WebSocket write timed out");
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}
