//! WebSocket read pump. Dispatches incoming frames.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use cstate_protocol::constants::WS_PONG_WAIT;

use crate::inbound::handle_text;
use crate::session::SessionShared;

/// Reads frames until the stream ends, fails, closes or goes silent.
///
/// Any incoming frame resets the [`WS_PONG_WAIT`] deadline.
pub(crate) async fn read_pump<S>(mut read: S, shared: Arc<SessionShared>, cancel: CancellationToken)
where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!(agent = %shared.identity.name, "hub silent past pong deadline, closing");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => handle_text(&shared, text.as_str()),
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = shared.outbox.send_raw(tungstenite::Message::Pong(data));
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }
}
