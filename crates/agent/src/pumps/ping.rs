//! Keepalive pings on a fixed period.

use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use cstate_protocol::constants::WS_PING_PERIOD;

use crate::link::Outbox;

/// Queues periodic pings to keep the connection alive.
pub(crate) async fn ping_pump(outbox: Outbox, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let ping = tungstenite::Message::Ping(vec![].into());
                if let Err(e) = outbox.send_raw(ping) {
                    tracing::debug!("ping not queued: {e}");
                }
            }
        }
    }
}
