//! Connection sessions.
//!
//! A [`Session`] is the task serving one accepted connection: it decodes
//! inbound frames, feeds them to the connection's
//! [`Multiplexer`](crate::multiplexer::Multiplexer), runs keepalive, and
//! drains on shutdown. Encoded outbound frames are written by a separate
//! writer task so a slow peer never stalls the read side.

pub mod connection;
pub mod keepalive;
pub mod observer;
pub mod registry;

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt};
use metrics::{counter, gauge};
use tether_core::Frame;
use tether_settings::SessionSettings;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::multiplexer::Multiplexer;
use crate::router::Router;

use self::connection::{Connection, ConnectionState};
use self::keepalive::{KeepaliveResult, run_keepalive};
use self::observer::ConnectionObserver;

/// Inbound transport messages, one encoded frame each.
pub type FrameStream = BoxStream<'static, io::Result<Bytes>>;

/// Outbound transport, one encoded frame per item.
pub type FrameSink = Pin<Box<dyn Sink<Bytes, Error = io::Error> + Send>>;

/// How long the writer gets to flush queued frames after the session ends.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the transport.
    PeerClosed,
    /// Reading from the transport failed.
    TransportError(String),
    /// Writing to the transport failed.
    WriteFailed(String),
    /// The peer stopped reading while its requests kept producing replies.
    OutboundStalled,
    /// No inbound traffic within the keepalive max lifetime.
    KeepaliveExpired,
    /// Shutdown requested and every in-flight request finished.
    Drained,
    /// Shutdown requested and the drain timeout elapsed first.
    DrainTimeout {
        /// Requests cancelled when the timeout hit.
        cancelled: usize,
    },
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
            Self::WriteFailed(e) => write!(f, "write failed: {e}"),
            Self::OutboundStalled => f.write_str("outbound queue stalled"),
            Self::KeepaliveExpired => f.write_str("keepalive expired"),
            Self::Drained => f.write_str("drained"),
            Self::DrainTimeout { cancelled } => {
                write!(f, "drain timeout ({cancelled} requests cancelled)")
            }
        }
    }
}

/// Per-connection tuning, resolved from [`SessionSettings`].
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Outbound frame queue capacity.
    pub outbound_buffer: usize,
    /// Per-channel inbound item queue capacity.
    pub inbound_buffer: usize,
    /// Time allowed for in-flight requests once shutdown begins.
    pub drain_timeout: Duration,
    /// Keepalive probe interval.
    pub keepalive_interval: Duration,
    /// Silence tolerated before the connection is dropped.
    pub keepalive_max_lifetime: Duration,
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            outbound_buffer: settings.outbound_buffer.max(1),
            inbound_buffer: settings.inbound_buffer.max(1),
            drain_timeout: settings.drain_timeout(),
            keepalive_interval: settings.keepalive_interval().max(Duration::from_millis(1)),
            keepalive_max_lifetime: settings.keepalive_max_lifetime(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

/// Serves one connection until it closes.
pub struct Session {
    connection: Arc<Connection>,
    router: Arc<Router>,
    observer: Arc<dyn ConnectionObserver>,
    config: SessionConfig,
    tracker: TaskTracker,
}

impl Session {
    /// Create a session. Request tasks are spawned on `tracker`.
    pub fn new(
        connection: Arc<Connection>,
        router: Arc<Router>,
        observer: Arc<dyn ConnectionObserver>,
        config: SessionConfig,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            connection,
            router,
            observer,
            config,
            tracker,
        }
    }

    /// Run until the peer leaves, the transport fails, keepalive expires, or
    /// `shutdown` fires and draining finishes.
    #[tracing::instrument(skip_all, fields(connection_id = %self.connection.id, transport = %self.connection.transport))]
    pub async fn run(
        self,
        mut inbound: FrameStream,
        sink: FrameSink,
        shutdown: CancellationToken,
    ) -> CloseReason {
        let connection = self.connection.clone();
        let transport = connection.transport.to_string();
        counter!("tether_connections_total", "transport" => transport.clone()).increment(1);
        gauge!("tether_connections_active", "transport" => transport.clone()).increment(1.0);
        self.observer.on_connect(&connection);

        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_buffer);
        let write_failed = CancellationToken::new();
        let writer = self.tracker.spawn(write_frames(
            sink,
            out_rx,
            write_failed.clone(),
            connection.clone(),
        ));

        let (mut mux, mut done_rx) = Multiplexer::new(
            connection.clone(),
            self.router.clone(),
            self.observer.clone(),
            out_tx.clone(),
            self.tracker.clone(),
            self.config.inbound_buffer,
        );

        let keepalive_cancel = CancellationToken::new();
        let mut keepalive = Box::pin(run_keepalive(
            connection.clone(),
            out_tx.clone(),
            self.config.keepalive_interval,
            self.config.keepalive_max_lifetime,
            keepalive_cancel.clone(),
        ));

        // Armed when shutdown begins.
        let drain = tokio::time::sleep(self.config.drain_timeout);
        tokio::pin!(drain);
        let mut draining = false;

        let reason = loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled(), if !draining => {
                    draining = true;
                    let _ = connection.advance(ConnectionState::Closing);
                    mux.stop_accepting();
                    if mux.is_idle() {
                        break CloseReason::Drained;
                    }
                    info!(
                        connection_id = %connection.id,
                        in_flight = mux.in_flight_count(),
                        "draining connection"
                    );
                    drain.as_mut().reset(Instant::now() + self.config.drain_timeout);
                }
                () = &mut drain, if draining => {
                    let cancelled = mux.cancel_all();
                    warn!(connection_id = %connection.id, cancelled, "drain timeout, cancelling remaining requests");
                    break CloseReason::DrainTimeout { cancelled };
                }
                () = write_failed.cancelled() => {
                    break CloseReason::WriteFailed("writer stopped".into());
                }
                Some(done) = done_rx.recv() => {
                    let _ = mux.on_task_done(done);
                    if draining && mux.is_idle() {
                        break CloseReason::Drained;
                    }
                }
                item = inbound.next() => match item {
                    None => break CloseReason::PeerClosed,
                    Some(Err(e)) => break CloseReason::TransportError(e.to_string()),
                    Some(Ok(bytes)) => {
                        connection.touch();
                        match Frame::decode(bytes) {
                            Ok(Frame::KeepAlive { respond }) => {
                                if respond {
                                    let _ = out_tx.try_send(Frame::KeepAlive { respond: false });
                                }
                            }
                            Ok(frame) => mux.handle_frame(frame),
                            Err(err) => mux.on_decode_error(&err),
                        }
                        if mux.is_stalled() {
                            break CloseReason::OutboundStalled;
                        }
                        if draining && mux.is_idle() {
                            break CloseReason::Drained;
                        }
                    }
                },
                result = &mut keepalive => {
                    if result == KeepaliveResult::Expired {
                        warn!(connection_id = %connection.id, "keepalive expired");
                    }
                    break CloseReason::KeepaliveExpired;
                }
            }
        };

        let _ = connection.advance(ConnectionState::Closing);
        keepalive_cancel.cancel();
        let cancelled = mux.cancel_all();
        if cancelled > 0 {
            debug!(connection_id = %connection.id, cancelled, "cancelled requests on close");
        }
        drop(keepalive);
        drop(mux);
        drop(out_tx);

        // The writer exits once every request task has dropped its sender.
        let abort = writer.abort_handle();
        if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
            warn!(connection_id = %connection.id, "writer did not flush in time");
            abort.abort();
        }

        let _ = connection.advance(ConnectionState::Closed);
        gauge!("tether_connections_active", "transport" => transport).decrement(1.0);
        self.observer.on_close(&connection, &reason);
        reason
    }
}

/// Encode queued frames onto the transport. Closes the sink when the queue
/// is closed and empty.
async fn write_frames(
    mut sink: FrameSink,
    mut frames: mpsc::Receiver<Frame>,
    failed: CancellationToken,
    connection: Arc<Connection>,
) {
    while let Some(frame) = frames.recv().await {
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(connection_id = %connection.id, stream_id = frame.stream_id(), error = %err, "frame encode failed");
                continue;
            }
        };
        if let Err(err) = sink.send(bytes).await {
            debug!(connection_id = %connection.id, error = %err, "transport write failed");
            failed.cancel();
            return;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tether_core::{HandlerError, InteractionKind, Payload};

    use crate::handler::{Handler, RequestContext, RequestResponseHandler};
    use crate::session::connection::TransportKind;
    use crate::session::observer::LoggingObserver;

    struct Slow(Duration);

    #[async_trait]
    impl RequestResponseHandler for Slow {
        async fn handle(&self, payload: Payload, _ctx: RequestContext) -> Result<Payload, HandlerError> {
            tokio::time::sleep(self.0).await;
            Ok(payload)
        }
    }

    struct Peer {
        to_server: mpsc::Sender<io::Result<Bytes>>,
        from_server: mpsc::Receiver<Bytes>,
    }

    impl Peer {
        async fn send(&self, frame: Frame) {
            self.to_server.send(Ok(frame.encode().unwrap())).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Frame> {
            let bytes = self.from_server.recv().await?;
            Some(Frame::decode(bytes).unwrap())
        }

        async fn recv_skipping_keepalive(&mut self) -> Option<Frame> {
            loop {
                match self.recv().await? {
                    Frame::KeepAlive { .. } => {}
                    frame => return Some(frame),
                }
            }
        }
    }

    fn spawn_session(
        config: SessionConfig,
        shutdown: CancellationToken,
    ) -> (Peer, tokio::task::JoinHandle<CloseReason>) {
        let mut router = Router::new();
        router
            .register("slow", Handler::request_response(Slow(Duration::from_millis(200))))
            .unwrap();
        router
            .register("hang", Handler::request_response(Slow(Duration::from_secs(3600))))
            .unwrap();

        let (to_server, in_rx) = mpsc::channel::<io::Result<Bytes>>(16);
        let (out_tx, from_server) = mpsc::channel::<Bytes>(16);
        let inbound = tokio_stream::wrappers::ReceiverStream::new(in_rx).boxed();
        let sink: FrameSink = Box::pin(
            futures::sink::unfold(out_tx, |tx, bytes: Bytes| async move {
                tx.send(bytes).await.map_err(io::Error::other)?;
                Ok::<_, io::Error>(tx)
            }),
        );

        let session = Session::new(
            Arc::new(Connection::new(TransportKind::Raw, "test")),
            Arc::new(router),
            Arc::new(LoggingObserver),
            config,
            TaskTracker::new(),
        );
        let handle = tokio::spawn(session.run(inbound, sink, shutdown));
        (
            Peer {
                to_server,
                from_server,
            },
            handle,
        )
    }

    fn request(stream_id: u32, route: &str) -> Frame {
        Frame::Request {
            stream_id,
            kind: InteractionKind::RequestResponse,
            route: route.into(),
            payload: Payload::from(b"p".to_vec()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_ends_session() {
        let (peer, handle) = spawn_session(SessionConfig::default(), CancellationToken::new());
        drop(peer);
        assert_eq!(handle.await.unwrap(), CloseReason::PeerClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_probe_answered() {
        let (mut peer, _handle) = spawn_session(SessionConfig::default(), CancellationToken::new());
        peer.send(Frame::KeepAlive { respond: true }).await;
        assert_eq!(peer.recv().await, Some(Frame::KeepAlive { respond: false }));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_dropped_after_max_lifetime() {
        let config = SessionConfig {
            keepalive_interval: Duration::from_secs(1),
            keepalive_max_lifetime: Duration::from_secs(3),
            ..SessionConfig::default()
        };
        let (mut peer, handle) = spawn_session(config, CancellationToken::new());
        assert_eq!(peer.recv().await, Some(Frame::KeepAlive { respond: true }));
        assert_eq!(handle.await.unwrap(), CloseReason::KeepaliveExpired);
        // Sink closed after the session ends.
        while peer.recv().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_in_flight_and_refuses_new() {
        let shutdown = CancellationToken::new();
        let (mut peer, handle) = spawn_session(SessionConfig::default(), shutdown.clone());
        peer.send(request(1, "slow")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        shutdown.cancel();
        peer.send(request(3, "slow")).await;

        let mut frames = Vec::new();
        for _ in 0..2 {
            frames.push(peer.recv_skipping_keepalive().await.unwrap());
        }
        assert!(frames.contains(&Frame::error(3, "server is shutting down")));
        assert!(
            frames
                .iter()
                .any(|f| matches!(f, Frame::NextComplete { stream_id: 1, .. }))
        );
        assert_eq!(handle.await.unwrap(), CloseReason::Drained);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_cancels_stragglers() {
        let config = SessionConfig {
            drain_timeout: Duration::from_secs(1),
            ..SessionConfig::default()
        };
        let shutdown = CancellationToken::new();
        let (peer, handle) = spawn_session(config, shutdown.clone());
        peer.send(request(1, "hang")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();
        assert_eq!(
            handle.await.unwrap(),
            CloseReason::DrainTimeout { cancelled: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_closes_immediately_on_shutdown() {
        let shutdown = CancellationToken::new();
        let (_peer, handle) = spawn_session(SessionConfig::default(), shutdown.clone());
        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), CloseReason::Drained);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_bytes_do_not_close_connection() {
        let (mut peer, _handle) = spawn_session(SessionConfig::default(), CancellationToken::new());
        peer.to_server.send(Ok(Bytes::from_static(&[0, 0]))).await.unwrap();
        peer.send(request(5, "slow")).await;
        assert!(matches!(
            peer.recv_skipping_keepalive().await,
            Some(Frame::NextComplete { stream_id: 5, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn peer_that_never_reads_is_disconnected() {
        let config = SessionConfig {
            outbound_buffer: 1,
            ..SessionConfig::default()
        };
        let (peer, handle) = spawn_session(config, CancellationToken::new());
        for stream_id in 1..=5_000 {
            if peer.to_server.send(Ok(request(stream_id, "missing").encode().unwrap())).await.is_err() {
                break;
            }
        }
        assert_eq!(handle.await.unwrap(), CloseReason::OutboundStalled);
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_request_answered_on_its_stream() {
        let (mut peer, _handle) = spawn_session(SessionConfig::default(), CancellationToken::new());
        // Route length says 9, one byte follows.
        peer.to_server
            .send(Ok(Bytes::from_static(&[0, 0, 0, 4, 1, 1, 0, 9, b'a'])))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(30), peer.recv_skipping_keepalive())
            .await
            .unwrap();
        assert!(matches!(frame, Some(Frame::Error { stream_id: 4, .. })));

        peer.send(request(4, "slow")).await;
        assert!(matches!(
            peer.recv_skipping_keepalive().await,
            Some(Frame::NextComplete { stream_id: 4, .. })
        ));
    }

    #[test]
    fn close_reason_display() {
        assert_eq!(
            CloseReason::DrainTimeout { cancelled: 2 }.to_string(),
            "drain timeout (2 requests cancelled)"
        );
        assert_eq!(CloseReason::PeerClosed.to_string(), "peer closed");
    }
}
