//! Per-connection request multiplexer.
//!
//! Owns the table of in-flight requests keyed by correlation id and routes
//! every peer frame to the request it belongs to. Each request body runs in
//! its own task; tasks report back through a [`TaskDone`] channel that the
//! session loop feeds into [`Multiplexer::on_task_done`]. The table itself is
//! only touched from the session task, so it needs no locking.
//!
//! Outbound frames go through one bounded queue drained by the session's
//! writer. A producer that fills the queue waits, which is how slow readers
//! push back on fast streams. Frames the multiplexer itself originates
//! (rejections, decode errors) cannot wait on the read path; at most
//! [`MAX_DEFERRED_FRAMES`] of them are parked, and past that the
//! multiplexer reports itself [stalled](Multiplexer::is_stalled).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use metrics::counter;
use tether_core::{
    CONNECTION_STREAM_ID, ConnectionId, DecodeError, Frame, HandlerError, InteractionKind, Payload,
    StreamId,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::handler::{Handler, PayloadStream, RequestContext};
use crate::router::Router;
use crate::session::connection::Connection;
use crate::session::observer::{ConnectionObserver, RequestFailure};

/// Message sent to peers that open requests while the server drains.
pub const SHUTTING_DOWN_MESSAGE: &str = "server is shutting down";

/// Session-originated frames allowed to wait for outbound capacity at once.
pub const MAX_DEFERRED_FRAMES: usize = 64;

/// Where a request is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// Dispatched, waiting for its single response.
    Pending,
    /// Producing (and for channels, consuming) items.
    Streaming,
    /// Finished normally or with an error.
    Completed,
    /// Cancelled by the peer, by overflow, or by connection close.
    Cancelled,
}

/// How a request task ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Terminal frame sent.
    Completed,
    /// `Error` frame sent.
    Failed(HandlerError),
    /// Stopped before a terminal frame.
    Cancelled,
}

/// Completion notice from a request task.
#[derive(Debug)]
pub struct TaskDone {
    /// Request correlation id.
    pub stream_id: StreamId,
    /// Sequence number the entry was created with.
    pub seq: u64,
    /// How the task ended.
    pub outcome: TaskOutcome,
}

struct InFlight {
    seq: u64,
    route: Arc<str>,
    kind: InteractionKind,
    state: RequestState,
    cancel: CancellationToken,
    /// Channel requests only, while the peer's half is open.
    inbound: Option<mpsc::Sender<Result<Payload, HandlerError>>>,
    outbound_done: bool,
}

/// In-flight request table for one connection.
pub struct Multiplexer {
    connection: Arc<Connection>,
    router: Arc<Router>,
    observer: Arc<dyn ConnectionObserver>,
    outbound: mpsc::Sender<Frame>,
    done_tx: mpsc::UnboundedSender<TaskDone>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    in_flight: HashMap<StreamId, InFlight>,
    next_seq: u64,
    inbound_buffer: usize,
    accepting: bool,
    deferred: Arc<AtomicUsize>,
    stalled: bool,
}

impl Multiplexer {
    /// Create a multiplexer. The returned receiver must be polled by the
    /// owner and each message passed to [`Multiplexer::on_task_done`].
    pub fn new(
        connection: Arc<Connection>,
        router: Arc<Router>,
        observer: Arc<dyn ConnectionObserver>,
        outbound: mpsc::Sender<Frame>,
        tracker: TaskTracker,
        inbound_buffer: usize,
    ) -> (Self, mpsc::UnboundedReceiver<TaskDone>) {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let mux = Self {
            connection,
            router,
            observer,
            outbound,
            done_tx,
            cancel: CancellationToken::new(),
            tracker,
            in_flight: HashMap::new(),
            next_seq: 0,
            inbound_buffer: inbound_buffer.max(1),
            accepting: true,
            deferred: Arc::new(AtomicUsize::new(0)),
            stalled: false,
        };
        (mux, done_rx)
    }

    /// Route one decoded peer frame.
    pub fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Request {
                stream_id,
                kind,
                route,
                payload,
            } => self.on_request(stream_id, kind, &route, payload),
            Frame::Next { stream_id, payload } => self.on_peer_item(stream_id, payload, false),
            Frame::NextComplete { stream_id, payload } => {
                self.on_peer_item(stream_id, payload, true);
            }
            Frame::Complete { stream_id } => self.on_peer_complete(stream_id),
            Frame::Error { stream_id, message } => self.on_peer_error(stream_id, message),
            Frame::Cancel { stream_id } => {
                if self.cancel_request(stream_id) {
                    debug!(connection_id = %self.connection.id, stream_id, "request cancelled by peer");
                }
            }
            Frame::KeepAlive { .. } => {}
        }
    }

    /// Report a frame that could not be decoded.
    ///
    /// When the correlation id was readable the peer gets an `Error` frame on
    /// it, and any request already using that id is cancelled.
    pub fn on_decode_error(&mut self, err: &DecodeError) {
        match err.stream_id() {
            Some(stream_id) if stream_id != CONNECTION_STREAM_ID => {
                warn!(connection_id = %self.connection.id, stream_id, error = %err, "undecodable frame");
                let _ = self.cancel_request(stream_id);
                self.emit(Frame::error(stream_id, err.to_string()));
            }
            _ => {
                warn!(connection_id = %self.connection.id, error = %err, "undecodable frame dropped");
            }
        }
    }

    /// Apply a task completion notice. Returns the request's final state if
    /// the notice removed it from the table.
    pub fn on_task_done(&mut self, done: TaskDone) -> Option<RequestState> {
        let entry = self.in_flight.get_mut(&done.stream_id)?;
        if entry.seq != done.seq {
            return None;
        }
        entry.outbound_done = true;

        match done.outcome {
            TaskOutcome::Completed if entry.inbound.is_some() => {
                // Channel outbound finished first; wait for the peer's half.
                None
            }
            TaskOutcome::Completed => self.finish(done.stream_id, RequestState::Completed),
            TaskOutcome::Failed(error) => {
                let route = entry.route.clone();
                let kind = entry.kind;
                self.report_failure(done.stream_id, &route, kind, &error);
                self.finish(done.stream_id, RequestState::Completed)
            }
            TaskOutcome::Cancelled => self.finish(done.stream_id, RequestState::Cancelled),
        }
    }

    /// Stop accepting new requests. Ones already in flight continue.
    pub fn stop_accepting(&mut self) {
        self.accepting = false;
    }

    /// Cancel every in-flight request and every detached fire-and-forget
    /// task. Returns how many table entries were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        self.cancel.cancel();
        let count = self.in_flight.len();
        for (_, mut entry) in self.in_flight.drain() {
            entry.cancel.cancel();
            entry.state = RequestState::Cancelled;
        }
        count
    }

    /// Number of requests awaiting a terminal frame.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether no requests are in flight.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Whether the peer stopped reading while more session-originated frames
    /// piled up than [`MAX_DEFERRED_FRAMES`]. The owner should close the
    /// connection.
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// State of an in-flight request.
    pub fn state(&self, stream_id: StreamId) -> Option<RequestState> {
        self.in_flight.get(&stream_id).map(|e| e.state)
    }

    fn on_request(&mut self, stream_id: StreamId, kind: InteractionKind, route: &str, payload: Payload) {
        if stream_id == CONNECTION_STREAM_ID {
            warn!(connection_id = %self.connection.id, route, "request on reserved stream id 0 rejected");
            self.emit(Frame::error(CONNECTION_STREAM_ID, "stream id 0 is reserved"));
            return;
        }
        if !self.accepting {
            if kind.has_response() {
                self.emit(Frame::error(stream_id, SHUTTING_DOWN_MESSAGE));
            }
            return;
        }
        if self.in_flight.contains_key(&stream_id) {
            warn!(connection_id = %self.connection.id, stream_id, "correlation id already in flight");
            self.emit(Frame::error(stream_id, format!("stream {stream_id} is already in use")));
            return;
        }

        let resolved = self.router.resolve(route, kind).cloned();
        let route = match resolved {
            Ok(route) => route,
            Err(err) => {
                let error = HandlerError::failed(err.to_string());
                if kind.has_response() {
                    self.emit(Frame::error(stream_id, error.to_string()));
                }
                self.report_failure(stream_id, route, kind, &error);
                return;
            }
        };

        counter!("tether_requests_total", "route" => route.name().to_string(), "kind" => kind.as_str())
            .increment(1);

        let cancel = self.cancel.child_token();
        let ctx = RequestContext::new(
            self.connection.id.clone(),
            stream_id,
            route.name().clone(),
            cancel.clone(),
        );

        match route.handler().clone() {
            Handler::FireAndForget(handler) => {
                let observer = self.observer.clone();
                let connection_id = self.connection.id.clone();
                let name = route.name().clone();
                let _ = self.tracker.spawn(async move {
                    if let Err(error) = handler.handle(payload, ctx).await {
                        observer.on_request_error(&RequestFailure {
                            connection_id: &connection_id,
                            stream_id,
                            route: &name,
                            kind: InteractionKind::FireAndForget,
                            error: &error,
                        });
                    }
                });
            }
            Handler::RequestResponse(handler) => {
                let seq = self.insert(stream_id, route.name(), kind, RequestState::Pending, cancel.clone(), None);
                let outbound = self.outbound.clone();
                self.spawn_request(stream_id, seq, async move {
                    let result = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return TaskOutcome::Cancelled,
                        result = handler.handle(payload, ctx) => result,
                    };
                    let (frame, outcome) = match result {
                        Ok(payload) => (Frame::NextComplete { stream_id, payload }, TaskOutcome::Completed),
                        Err(err) => (Frame::error(stream_id, err.to_string()), TaskOutcome::Failed(err)),
                    };
                    if send_unless_cancelled(&outbound, &cancel, frame).await {
                        outcome
                    } else {
                        TaskOutcome::Cancelled
                    }
                });
            }
            Handler::RequestStream(handler) => {
                let items = limit(handler.handle(payload, ctx), route.item_limit());
                let seq = self.insert(stream_id, route.name(), kind, RequestState::Streaming, cancel.clone(), None);
                let outbound = self.outbound.clone();
                self.spawn_request(stream_id, seq, pump(stream_id, items, outbound, cancel));
            }
            Handler::Channel(handler) => {
                let (tx, rx) = mpsc::channel(self.inbound_buffer);
                if !payload.is_empty() {
                    let _ = tx.try_send(Ok(payload));
                }
                let inbound = ReceiverStream::new(rx).boxed();
                let items = limit(handler.handle(inbound, ctx), route.item_limit());
                let seq = self.insert(stream_id, route.name(), kind, RequestState::Streaming, cancel.clone(), Some(tx));
                let outbound = self.outbound.clone();
                self.spawn_request(stream_id, seq, pump(stream_id, items, outbound, cancel));
            }
        }
    }

    fn on_peer_item(&mut self, stream_id: StreamId, payload: Payload, complete: bool) {
        let Some(entry) = self.in_flight.get_mut(&stream_id) else {
            debug!(connection_id = %self.connection.id, stream_id, "item for unknown stream dropped");
            return;
        };
        let Some(inbound) = entry.inbound.as_ref() else {
            debug!(connection_id = %self.connection.id, stream_id, "item for closed inbound dropped");
            return;
        };

        match inbound.try_send(Ok(payload)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let route = entry.route.clone();
                let kind = entry.kind;
                let _ = self.cancel_request(stream_id);
                let error = HandlerError::failed("inbound buffer overflow");
                self.emit(Frame::error(stream_id, error.to_string()));
                self.report_failure(stream_id, &route, kind, &error);
                return;
            }
            Err(TrySendError::Closed(_)) => {
                // Handler stopped reading; later items have nowhere to go.
                entry.inbound = None;
            }
        }

        if complete {
            entry.inbound = None;
        }
        let _ = self.finish_if_done(stream_id);
    }

    fn on_peer_complete(&mut self, stream_id: StreamId) {
        if let Some(entry) = self.in_flight.get_mut(&stream_id) {
            entry.inbound = None;
            let _ = self.finish_if_done(stream_id);
        }
    }

    fn on_peer_error(&mut self, stream_id: StreamId, message: String) {
        let Some(entry) = self.in_flight.get_mut(&stream_id) else {
            return;
        };
        match entry.inbound.take() {
            Some(inbound) => {
                // A full buffer still ends the stream when the sender drops.
                let _ = inbound.try_send(Err(HandlerError::Peer { message }));
                let _ = self.finish_if_done(stream_id);
            }
            None => {
                debug!(connection_id = %self.connection.id, stream_id, "peer error treated as cancel");
                let _ = self.cancel_request(stream_id);
            }
        }
    }

    fn cancel_request(&mut self, stream_id: StreamId) -> bool {
        match self.in_flight.remove(&stream_id) {
            Some(mut entry) => {
                entry.cancel.cancel();
                entry.state = RequestState::Cancelled;
                true
            }
            None => false,
        }
    }

    fn finish_if_done(&mut self, stream_id: StreamId) -> Option<RequestState> {
        let entry = self.in_flight.get(&stream_id)?;
        if entry.outbound_done && entry.inbound.is_none() {
            self.finish(stream_id, RequestState::Completed)
        } else {
            None
        }
    }

    fn finish(&mut self, stream_id: StreamId, state: RequestState) -> Option<RequestState> {
        let mut entry = self.in_flight.remove(&stream_id)?;
        entry.state = state;
        // Release anything still waiting on this request's token.
        entry.cancel.cancel();
        Some(entry.state)
    }

    fn insert(
        &mut self,
        stream_id: StreamId,
        route: &Arc<str>,
        kind: InteractionKind,
        state: RequestState,
        cancel: CancellationToken,
        inbound: Option<mpsc::Sender<Result<Payload, HandlerError>>>,
    ) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        let _ = self.in_flight.insert(
            stream_id,
            InFlight {
                seq,
                route: route.clone(),
                kind,
                state,
                cancel,
                inbound,
                outbound_done: false,
            },
        );
        seq
    }

    fn spawn_request<F>(&self, stream_id: StreamId, seq: u64, body: F)
    where
        F: Future<Output = TaskOutcome> + Send + 'static,
    {
        let done_tx = self.done_tx.clone();
        let _ = self.tracker.spawn(async move {
            let outcome = body.await;
            let _ = done_tx.send(TaskDone {
                stream_id,
                seq,
                outcome,
            });
        });
    }

    /// Queue a frame produced by the session itself.
    ///
    /// Never awaits: a full queue hands the frame to a task so the read side
    /// keeps moving, up to [`MAX_DEFERRED_FRAMES`] such tasks. Beyond that the
    /// frame is dropped and the multiplexer is marked stalled.
    fn emit(&mut self, frame: Frame) {
        let frame = match self.outbound.try_send(frame) {
            Ok(()) | Err(TrySendError::Closed(_)) => return,
            Err(TrySendError::Full(frame)) => frame,
        };
        if self.deferred.load(Ordering::Acquire) >= MAX_DEFERRED_FRAMES {
            if !self.stalled {
                warn!(
                    connection_id = %self.connection.id,
                    stream_id = frame.stream_id(),
                    "outbound queue stalled, peer is not reading"
                );
            }
            self.stalled = true;
            counter!("tether_frames_dropped_total").increment(1);
            return;
        }

        let _ = self.deferred.fetch_add(1, Ordering::AcqRel);
        let deferred = self.deferred.clone();
        let outbound = self.outbound.clone();
        let _ = self.tracker.spawn(async move {
            let _ = outbound.send(frame).await;
            let _ = deferred.fetch_sub(1, Ordering::AcqRel);
        });
    }

    fn report_failure(&self, stream_id: StreamId, route: &str, kind: InteractionKind, error: &HandlerError) {
        counter!("tether_request_errors_total", "route" => route.to_owned()).increment(1);
        self.observer.on_request_error(&RequestFailure {
            connection_id: &self.connection.id,
            stream_id,
            route,
            kind,
            error,
        });
    }
}

fn limit(items: PayloadStream, item_limit: Option<usize>) -> PayloadStream {
    match item_limit {
        Some(n) => items.take(n).boxed(),
        None => items,
    }
}

/// Forward stream items as `Next` frames, then one terminal frame.
async fn pump(
    stream_id: StreamId,
    mut items: PayloadStream,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) -> TaskOutcome {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return TaskOutcome::Cancelled,
            next = items.next() => next,
        };
        let (frame, terminal) = match next {
            Some(Ok(payload)) => (Frame::Next { stream_id, payload }, None),
            Some(Err(err)) => (Frame::error(stream_id, err.to_string()), Some(TaskOutcome::Failed(err))),
            None => (Frame::Complete { stream_id }, Some(TaskOutcome::Completed)),
        };
        if !send_unless_cancelled(&outbound, &cancel, frame).await {
            return TaskOutcome::Cancelled;
        }
        if let Some(outcome) = terminal {
            return outcome;
        }
    }
}

async fn send_unless_cancelled(
    outbound: &mpsc::Sender<Frame>,
    cancel: &CancellationToken,
    frame: Frame,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = outbound.send(frame) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::handler::{
        ChannelHandler, FireAndForgetHandler, RequestResponseHandler, RequestStreamHandler,
    };
    use crate::router::Route;
    use crate::session::connection::TransportKind;

    struct Echo;

    #[async_trait]
    impl RequestResponseHandler for Echo {
        async fn handle(&self, payload: Payload, _ctx: RequestContext) -> Result<Payload, HandlerError> {
            Ok(payload)
        }
    }

    struct Fails;

    #[async_trait]
    impl RequestResponseHandler for Fails {
        async fn handle(&self, _payload: Payload, _ctx: RequestContext) -> Result<Payload, HandlerError> {
            Err(HandlerError::failed("boom"))
        }
    }

    struct Hangs;

    #[async_trait]
    impl RequestResponseHandler for Hangs {
        async fn handle(&self, _payload: Payload, _ctx: RequestContext) -> Result<Payload, HandlerError> {
            futures::future::pending().await
        }
    }

    struct Counts(Arc<AtomicUsize>);

    #[async_trait]
    impl FireAndForgetHandler for Counts {
        async fn handle(&self, _payload: Payload, _ctx: RequestContext) -> Result<(), HandlerError> {
            let _ = self.0.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::failed("ignored"))
        }
    }

    struct Numbers;

    impl RequestStreamHandler for Numbers {
        fn handle(&self, _payload: Payload, _ctx: RequestContext) -> PayloadStream {
            futures::stream::iter(0..100u8)
                .map(|n| Ok(Payload::from(vec![n])))
                .boxed()
        }
    }

    /// Never finishes.
    struct Stalls;

    #[async_trait]
    impl FireAndForgetHandler for Stalls {
        async fn handle(&self, _payload: Payload, _ctx: RequestContext) -> Result<(), HandlerError> {
            futures::future::pending().await
        }
    }

    /// Sends one greeting and ignores whatever the peer sends.
    struct Greets;

    impl ChannelHandler for Greets {
        fn handle(&self, _inbound: PayloadStream, _ctx: RequestContext) -> PayloadStream {
            futures::stream::iter([Ok(Payload::from(b"hello".to_vec()))]).boxed()
        }
    }

    struct Mirror;

    impl ChannelHandler for Mirror {
        fn handle(&self, inbound: PayloadStream, _ctx: RequestContext) -> PayloadStream {
            inbound
        }
    }

    #[derive(Default)]
    struct Recorder {
        failures: Mutex<Vec<(StreamId, String)>>,
    }

    impl ConnectionObserver for Recorder {
        fn on_request_error(&self, failure: &RequestFailure<'_>) {
            self.failures
                .lock()
                .push((failure.stream_id, failure.error.to_string()));
        }
    }

    struct Harness {
        mux: Multiplexer,
        done: mpsc::UnboundedReceiver<TaskDone>,
        out: mpsc::Receiver<Frame>,
        recorder: Arc<Recorder>,
        fnf_calls: Arc<AtomicUsize>,
        tracker: TaskTracker,
    }

    impl Harness {
        fn new(outbound: usize, inbound: usize) -> Self {
            let fnf_calls = Arc::new(AtomicUsize::new(0));
            let mut router = Router::new();
            router.register("echo", Handler::request_response(Echo)).unwrap();
            router.register("fails", Handler::request_response(Fails)).unwrap();
            router.register("hangs", Handler::request_response(Hangs)).unwrap();
            router
                .register("log", Handler::fire_and_forget(Counts(fnf_calls.clone())))
                .unwrap();
            router
                .register_route(Route::new("numbers", Handler::request_stream(Numbers)).with_item_limit(10))
                .unwrap();
            router.register("mirror", Handler::channel(Mirror)).unwrap();
            router.register("greets", Handler::channel(Greets)).unwrap();
            router.register("stalls", Handler::fire_and_forget(Stalls)).unwrap();

            let recorder = Arc::new(Recorder::default());
            let (out_tx, out) = mpsc::channel(outbound);
            let tracker = TaskTracker::new();
            let (mux, done) = Multiplexer::new(
                Arc::new(Connection::new(TransportKind::Raw, "test")),
                Arc::new(router),
                recorder.clone(),
                out_tx,
                tracker.clone(),
                inbound,
            );
            Self {
                mux,
                done,
                out,
                recorder,
                fnf_calls,
                tracker,
            }
        }

        fn request(&mut self, stream_id: StreamId, kind: InteractionKind, route: &str, payload: &[u8]) {
            self.mux.handle_frame(Frame::Request {
                stream_id,
                kind,
                route: route.into(),
                payload: Payload::from(payload.to_vec()),
            });
        }

        async fn next_frame(&mut self) -> Frame {
            tokio::time::timeout(Duration::from_secs(5), self.out.recv())
                .await
                .unwrap()
                .unwrap()
        }

        async fn settle(&mut self) -> Option<RequestState> {
            let done = tokio::time::timeout(Duration::from_secs(5), self.done.recv())
                .await
                .unwrap()
                .unwrap();
            self.mux.on_task_done(done)
        }
    }

    fn bytes(frame: &Frame) -> Vec<u8> {
        match frame {
            Frame::Next { payload, .. } | Frame::NextComplete { payload, .. } => payload.as_bytes().to_vec(),
            other => panic!("expected item frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_response_gets_exactly_one_next_complete() {
        let mut h = Harness::new(16, 4);
        h.request(1, InteractionKind::RequestResponse, "echo", b"hi");
        assert_eq!(h.mux.state(1), Some(RequestState::Pending));

        let frame = h.next_frame().await;
        assert_eq!(
            frame,
            Frame::NextComplete {
                stream_id: 1,
                payload: Payload::from(b"hi".to_vec())
            }
        );
        assert_eq!(h.settle().await, Some(RequestState::Completed));
        assert!(h.mux.is_idle());
        assert!(h.out.try_recv().is_err());
    }

    #[tokio::test]
    async fn handler_error_becomes_error_frame() {
        let mut h = Harness::new(16, 4);
        h.request(3, InteractionKind::RequestResponse, "fails", b"");
        assert_eq!(h.next_frame().await, Frame::error(3, "boom"));
        let _ = h.settle().await;
        assert_eq!(h.recorder.failures.lock().as_slice(), &[(3, "boom".to_owned())]);
    }

    #[tokio::test]
    async fn unknown_route_rejected_on_same_stream() {
        let mut h = Harness::new(16, 4);
        h.request(5, InteractionKind::RequestResponse, "missing", b"");
        match h.next_frame().await {
            Frame::Error { stream_id, message } => {
                assert_eq!(stream_id, 5);
                assert!(message.contains("missing"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.mux.is_idle());
    }

    #[tokio::test]
    async fn kind_mismatch_rejected() {
        let mut h = Harness::new(16, 4);
        h.request(7, InteractionKind::RequestStream, "echo", b"");
        assert!(matches!(h.next_frame().await, Frame::Error { stream_id: 7, .. }));
    }

    #[tokio::test]
    async fn fire_and_forget_never_answers() {
        let mut h = Harness::new(16, 4);
        h.request(9, InteractionKind::FireAndForget, "log", b"x");
        assert!(h.mux.is_idle());

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.recorder.failures.lock().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.fnf_calls.load(Ordering::SeqCst), 1);
        assert!(h.out.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_fire_and_forget_does_not_block_later_requests() {
        let mut h = Harness::new(16, 4);
        h.request(37, InteractionKind::FireAndForget, "stalls", b"");
        assert!(h.mux.is_idle());
        assert_eq!(h.tracker.len(), 1);

        h.request(39, InteractionKind::RequestResponse, "echo", b"next");
        assert_eq!(
            h.next_frame().await,
            Frame::NextComplete {
                stream_id: 39,
                payload: Payload::from(b"next".to_vec())
            }
        );
        assert_eq!(h.settle().await, Some(RequestState::Completed));
        assert!(h.mux.is_idle());
        assert!(h.out.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_fire_and_forget_route_is_silent() {
        let mut h = Harness::new(16, 4);
        h.request(11, InteractionKind::FireAndForget, "missing", b"");
        assert!(h.out.try_recv().is_err());
        assert_eq!(h.recorder.failures.lock().len(), 1);
    }

    #[tokio::test]
    async fn stream_obeys_item_limit_then_completes() {
        let mut h = Harness::new(64, 4);
        h.request(13, InteractionKind::RequestStream, "numbers", b"");
        for n in 0..10u8 {
            let frame = h.next_frame().await;
            assert_eq!(frame.stream_id(), 13);
            assert_eq!(bytes(&frame), vec![n]);
        }
        assert_eq!(h.next_frame().await, Frame::Complete { stream_id: 13 });
        assert_eq!(h.settle().await, Some(RequestState::Completed));
    }

    #[tokio::test]
    async fn cancel_stops_stream_without_terminal_frame() {
        let mut h = Harness::new(1, 4);
        h.request(15, InteractionKind::RequestStream, "numbers", b"");
        let first = h.next_frame().await;
        assert_eq!(bytes(&first), vec![0]);

        h.mux.handle_frame(Frame::Cancel { stream_id: 15 });
        assert!(h.mux.is_idle());

        // Drain anything queued before the cancel landed.
        while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_millis(50), h.out.recv()).await {
            assert!(matches!(frame, Frame::Next { .. }), "unexpected {frame:?}");
        }
        let done = h.done.recv().await.unwrap();
        assert_eq!(done.outcome, TaskOutcome::Cancelled);
        assert_eq!(h.mux.on_task_done(done), None);
    }

    #[tokio::test]
    async fn cancel_of_unknown_stream_is_noop() {
        let mut h = Harness::new(4, 4);
        h.mux.handle_frame(Frame::Cancel { stream_id: 99 });
        assert!(h.mux.is_idle());
        assert!(h.out.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_rejected() {
        let mut h = Harness::new(16, 4);
        h.request(17, InteractionKind::RequestResponse, "hangs", b"");
        h.request(17, InteractionKind::RequestResponse, "echo", b"");
        match h.next_frame().await {
            Frame::Error { stream_id: 17, message } => assert!(message.contains("already in use")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.mux.state(17), Some(RequestState::Pending));
    }

    #[tokio::test]
    async fn reserved_stream_id_rejected() {
        let mut h = Harness::new(4, 4);
        h.request(0, InteractionKind::RequestResponse, "echo", b"");
        assert!(matches!(h.next_frame().await, Frame::Error { stream_id: 0, .. }));
        assert!(h.mux.is_idle());
    }

    #[tokio::test]
    async fn channel_echoes_until_peer_completes() {
        let mut h = Harness::new(16, 4);
        h.request(19, InteractionKind::Channel, "mirror", b"a");
        assert_eq!(bytes(&h.next_frame().await), b"a");

        h.mux.handle_frame(Frame::Next {
            stream_id: 19,
            payload: Payload::from(b"b".to_vec()),
        });
        assert_eq!(bytes(&h.next_frame().await), b"b");

        h.mux.handle_frame(Frame::Complete { stream_id: 19 });
        assert_eq!(h.next_frame().await, Frame::Complete { stream_id: 19 });
        assert_eq!(h.settle().await, Some(RequestState::Completed));
        assert!(h.mux.is_idle());
    }

    #[tokio::test]
    async fn channel_outbound_done_first_waits_for_peer_complete() {
        let mut h = Harness::new(16, 4);
        h.request(43, InteractionKind::Channel, "greets", b"");
        assert_eq!(bytes(&h.next_frame().await), b"hello");
        assert_eq!(h.next_frame().await, Frame::Complete { stream_id: 43 });

        // Outbound is finished but the peer's half is still open.
        assert_eq!(h.settle().await, None);
        assert_eq!(h.mux.state(43), Some(RequestState::Streaming));
        assert!(!h.mux.is_idle());

        h.mux.handle_frame(Frame::Complete { stream_id: 43 });
        assert_eq!(h.mux.state(43), None);
        assert!(h.mux.is_idle());
        assert!(h.out.try_recv().is_err());
    }

    #[tokio::test]
    async fn channel_with_empty_first_payload_waits_for_items() {
        let mut h = Harness::new(16, 4);
        h.request(21, InteractionKind::Channel, "mirror", b"");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), h.out.recv())
                .await
                .is_err()
        );
        h.mux.handle_frame(Frame::NextComplete {
            stream_id: 21,
            payload: Payload::from(b"z".to_vec()),
        });
        assert_eq!(bytes(&h.next_frame().await), b"z");
        assert_eq!(h.next_frame().await, Frame::Complete { stream_id: 21 });
    }

    #[tokio::test]
    async fn channel_peer_error_terminates_outbound_with_error() {
        let mut h = Harness::new(16, 4);
        h.request(23, InteractionKind::Channel, "mirror", b"");
        h.mux.handle_frame(Frame::error(23, "client gave up"));
        match h.next_frame().await {
            Frame::Error { stream_id: 23, message } => assert!(message.contains("client gave up")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.settle().await, Some(RequestState::Completed));
    }

    #[tokio::test]
    async fn inbound_overflow_cancels_with_error() {
        // Outbound capacity 1 and no reader: the handler parks on its first
        // send and stops draining inbound.
        let mut h = Harness::new(1, 2);
        h.request(25, InteractionKind::Channel, "mirror", b"");
        for _ in 0..8 {
            h.mux.handle_frame(Frame::Next {
                stream_id: 25,
                payload: Payload::from(b"x".to_vec()),
            });
            if h.mux.is_idle() {
                break;
            }
        }
        assert!(h.mux.is_idle());
        assert!(
            h.recorder
                .failures
                .lock()
                .iter()
                .any(|(id, msg)| *id == 25 && msg.contains("overflow"))
        );
    }

    #[tokio::test]
    async fn draining_refuses_new_requests() {
        let mut h = Harness::new(16, 4);
        h.mux.stop_accepting();
        h.request(27, InteractionKind::RequestResponse, "echo", b"");
        assert_eq!(h.next_frame().await, Frame::error(27, SHUTTING_DOWN_MESSAGE));
        h.request(29, InteractionKind::FireAndForget, "log", b"");
        assert!(h.out.try_recv().is_err());
        assert_eq!(h.fnf_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_all_clears_table() {
        let mut h = Harness::new(16, 4);
        h.request(31, InteractionKind::RequestResponse, "hangs", b"");
        h.request(33, InteractionKind::RequestResponse, "hangs", b"");
        assert_eq!(h.mux.in_flight_count(), 2);
        assert_eq!(h.mux.cancel_all(), 2);
        assert!(h.mux.is_idle());
        for _ in 0..2 {
            let done = h.done.recv().await.unwrap();
            assert_eq!(done.outcome, TaskOutcome::Cancelled);
        }
    }

    #[tokio::test]
    async fn stale_completion_ignored_after_id_reuse() {
        let mut h = Harness::new(16, 4);
        h.request(35, InteractionKind::RequestResponse, "hangs", b"");
        h.mux.handle_frame(Frame::Cancel { stream_id: 35 });
        h.request(35, InteractionKind::RequestResponse, "hangs", b"");

        let stale = h.done.recv().await.unwrap();
        assert_eq!(stale.outcome, TaskOutcome::Cancelled);
        assert_eq!(h.mux.on_task_done(stale), None);
        assert_eq!(h.mux.state(35), Some(RequestState::Pending));
    }

    #[tokio::test]
    async fn replies_to_a_peer_that_never_reads_are_bounded() {
        let mut h = Harness::new(1, 4);
        for stream_id in 1..=5_000 {
            h.request(stream_id, InteractionKind::RequestResponse, "missing", b"");
        }
        assert!(h.mux.is_stalled());
        assert!(h.tracker.len() <= MAX_DEFERRED_FRAMES);
        assert!(h.mux.is_idle());
    }

    #[tokio::test]
    async fn brief_backlog_is_delivered_without_stalling() {
        let mut h = Harness::new(1, 4);
        for stream_id in 1..=4 {
            h.request(stream_id, InteractionKind::RequestResponse, "missing", b"");
        }
        assert!(!h.mux.is_stalled());
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(h.next_frame().await.stream_id());
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn truncated_frame_with_readable_id_answers_on_that_id() {
        let mut h = Harness::new(4, 4);
        let err = Frame::decode(bytes::Bytes::from_static(&[0, 0, 0, 4, 1, 1, 0, 9, b'a'])).unwrap_err();
        h.mux.on_decode_error(&err);
        assert!(matches!(h.next_frame().await, Frame::Error { stream_id: 4, .. }));
    }

    #[tokio::test]
    async fn decode_error_with_readable_id_answers_on_that_id() {
        let mut h = Harness::new(4, 4);
        h.mux.on_decode_error(&DecodeError::UnknownFrameType {
            stream_id: 41,
            frame_type: 0x7f,
        });
        assert!(matches!(h.next_frame().await, Frame::Error { stream_id: 41, .. }));

        h.mux.on_decode_error(&DecodeError::Truncated {
            stream_id: None,
            needed: 5,
            remaining: 1,
        });
        assert!(h.out.try_recv().is_err());
    }
}
