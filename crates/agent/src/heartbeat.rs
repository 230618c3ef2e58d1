//! Periodic uptime reports.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use cstate_protocol::Stats;
use cstate_protocol::constants::{MessageType, STATS_UPTIME};

use crate::session::SessionShared;
use crate::types::ConnectionState;

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Time since the uptime origin was pinned.
///
/// The origin is the first call to this function. Creating a session calls
/// it, so without an earlier call uptime counts from the first session rather
/// than from process start. Binaries call it first thing in `main` to report
/// true process uptime.
pub fn process_uptime() -> Duration {
    PROCESS_START.get_or_init(Instant::now).elapsed()
}

fn uptime_report() -> Stats {
    let mut stats = Map::new();
    stats.insert(STATS_UPTIME.into(), Value::from(process_uptime().as_secs_f64()));
    stats
}

/// Reports `{"uptime": seconds}` every interval while connected.
pub(crate) async fn heartbeat_loop(shared: Arc<SessionShared>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(shared.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if shared.state() != ConnectionState::Connected {
                    continue;
                }
                if let Err(e) = shared.notify(MessageType::Stats, &uptime_report()) {
                    trace!(agent = %shared.identity.name, "heartbeat not sent: {e}");
                }
            }
        }
    }
}
