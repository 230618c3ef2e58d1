//! Connection supervisor: dial, run the pumps, back off, repeat.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::link::{WsStream, connect};
use crate::pumps::{ping::ping_pump, read::read_pump, write::write_pump};
use crate::session::SessionShared;
use crate::types::ConnectionState;

/// Keeps the session connected until `cancel` fires.
///
/// Every drop, whether the dial failed or a live link was lost, is followed
/// by a backoff delay; the attempt counter resets after a successful connect.
pub(crate) async fn supervise(shared: Arc<SessionShared>, cancel: CancellationToken) {
    let mut attempt: u32 = 0;

    loop {
        shared.set_state(ConnectionState::Connecting);

        let dialled = tokio::select! {
            _ = cancel.cancelled() => break,
            r = connect(&shared.url) => r,
        };

        match dialled {
            Ok(ws) => {
                if attempt > 0 {
                    info!(agent = %shared.identity.name, attempt, "reconnected");
                }
                attempt = 0;
                run_connection(&shared, ws, &cancel).await;
            }
            Err(e) => {
                warn!(agent = %shared.identity.name, attempt, error = %e, "hub unreachable");
                shared.set_state(ConnectionState::Disconnected);
            }
        }

        if cancel.is_cancelled() {
            break;
        }

        attempt = attempt.saturating_add(1);
        let delay = shared.reconnect.delay_for_attempt(attempt);
        debug!(
            agent = %shared.identity.name,
            attempt,
            delay_secs = format_args!("{:.2}", delay.as_secs_f64()),
            "retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_state(ConnectionState::Disconnected);
    debug!(agent = %shared.identity.name, "supervisor stopped");
}

/// Runs one live link to completion.
async fn run_connection(shared: &Arc<SessionShared>, ws: WsStream, cancel: &CancellationToken) {
    let link_cancel = cancel.child_token();
    let (write, read) = ws.split();

    let write_handle = tokio::spawn(write_pump(
        write,
        Arc::clone(&shared.outbound_rx),
        shared.pending.clone(),
        link_cancel.clone(),
    ));
    let ping_handle = tokio::spawn(ping_pump(shared.outbox.clone(), link_cancel.clone()));

    shared.on_connected();
    read_pump(read, Arc::clone(shared), link_cancel.clone()).await;

    link_cancel.cancel();
    let _ = write_handle.await;
    let _ = ping_handle.await;

    shared.on_disconnected();
}
