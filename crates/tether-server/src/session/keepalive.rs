//! Keepalive probing and liveness.

use std::sync::Arc;
use std::time::Duration;

use tether_core::Frame;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::connection::Connection;

/// Outcome of the keepalive loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepaliveResult {
    /// The peer sent nothing for longer than the max lifetime.
    Expired,
    /// The loop was cancelled externally.
    Cancelled,
}

/// Send `KeepAlive{respond: true}` every `interval` and watch for silence.
///
/// Any inbound frame counts as activity (see [`Connection::touch`]), so a
/// busy peer never has to answer probes. A probe that cannot be queued because
/// the outbound buffer is full is skipped rather than awaited.
pub async fn run_keepalive(
    connection: Arc<Connection>,
    outbound: mpsc::Sender<Frame>,
    interval: Duration,
    max_lifetime: Duration,
    cancel: CancellationToken,
) -> KeepaliveResult {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return KeepaliveResult::Cancelled,
            _ = ticker.tick() => {
                if connection.idle_for() >= max_lifetime {
                    return KeepaliveResult::Expired;
                }
                if outbound.try_send(Frame::KeepAlive { respond: true }).is_err() {
                    tracing::trace!(connection_id = %connection.id, "keepalive probe skipped");
                }
            }
        }
    }
}
