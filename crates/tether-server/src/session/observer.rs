//! Connection event hooks.

use tether_core::{ConnectionId, HandlerError, InteractionKind, StreamId};

use super::CloseReason;
use super::connection::Connection;

/// A request that ended in failure.
#[derive(Debug)]
pub struct RequestFailure<'a> {
    /// Connection the request arrived on.
    pub connection_id: &'a ConnectionId,
    /// Correlation id.
    pub stream_id: StreamId,
    /// Route name.
    pub route: &'a str,
    /// Interaction kind.
    pub kind: InteractionKind,
    /// What went wrong.
    pub error: &'a HandlerError,
}

/// Receives connection lifecycle events. All methods default to no-ops.
///
/// Fire-and-forget failures have no peer to report to; this is where they
/// surface.
pub trait ConnectionObserver: Send + Sync {
    /// A connection was accepted and its session started.
    fn on_connect(&self, _connection: &Connection) {}

    /// A request failed. Called after the `Error` frame (if any) was queued.
    fn on_request_error(&self, _failure: &RequestFailure<'_>) {}

    /// The session ended.
    fn on_close(&self, _connection: &Connection, _reason: &CloseReason) {}
}

/// Observer that writes every event to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingObserver;

impl ConnectionObserver for LoggingObserver {
    fn on_connect(&self, connection: &Connection) {
        tracing::info!(
            connection_id = %connection.id,
            transport = %connection.transport,
            remote = %connection.remote_address,
            "client connected"
        );
    }

    fn on_request_error(&self, failure: &RequestFailure<'_>) {
        tracing::warn!(
            connection_id = %failure.connection_id,
            stream_id = failure.stream_id,
            route = failure.route,
            kind = %failure.kind,
            error = %failure.error,
            "request failed"
        );
    }

    fn on_close(&self, connection: &Connection, reason: &CloseReason) {
        tracing::info!(
            connection_id = %connection.id,
            transport = %connection.transport,
            reason = %reason,
            age_ms = u64::try_from(connection.age().as_millis()).unwrap_or(u64::MAX),
            "client disconnected"
        );
    }
}
