//! Handler traits, one per interaction kind.
//!
//! A route's [`Handler`] is a closed union over the four kinds, so dispatch
//! is a `match` rather than open-ended lookup. Stream-producing handlers
//! return lazy streams; the multiplexer pulls one item at a time and stops
//! pulling as soon as the request is cancelled.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tether_core::{ConnectionId, HandlerError, InteractionKind, Payload, StreamId};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Lazily produced sequence of payloads.
pub type PayloadStream = BoxStream<'static, Result<Payload, HandlerError>>;

/// Per-request information handed to every handler invocation.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// Connection the request arrived on.
    pub connection_id: ConnectionId,
    /// Correlation id of the request.
    pub stream_id: StreamId,
    /// Route name the request was dispatched to.
    pub route: Arc<str>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Create a context bound to a cancellation token.
    pub fn new(
        connection_id: ConnectionId,
        stream_id: StreamId,
        route: Arc<str>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            stream_id,
            route,
            cancel,
        }
    }

    /// Context with a fresh token, for calling handlers outside a connection.
    pub fn detached(route: &str) -> Self {
        Self::new(
            ConnectionId::from_string("local".into()),
            0,
            Arc::from(route),
            CancellationToken::new(),
        )
    }

    /// Whether the peer cancelled, the connection closed, or shutdown gave up
    /// waiting.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the request is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Clone of the underlying token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// One request in, exactly one response out.
#[async_trait]
pub trait RequestResponseHandler: Send + Sync {
    /// Produce the single response payload.
    async fn handle(&self, payload: Payload, ctx: RequestContext) -> Result<Payload, HandlerError>;
}

/// One request in, nothing out.
#[async_trait]
pub trait FireAndForgetHandler: Send + Sync {
    /// Process the payload. The result never reaches the peer.
    async fn handle(&self, payload: Payload, ctx: RequestContext) -> Result<(), HandlerError>;
}

/// One request in, a lazy stream out.
pub trait RequestStreamHandler: Send + Sync {
    /// Build the response stream. Nothing is produced until it is polled.
    fn handle(&self, payload: Payload, ctx: RequestContext) -> PayloadStream;
}

/// A stream in, an independent stream out.
pub trait ChannelHandler: Send + Sync {
    /// Map the inbound stream to an outbound stream.
    fn handle(&self, inbound: PayloadStream, ctx: RequestContext) -> PayloadStream;
}

/// A handler tagged with its interaction kind.
#[derive(Clone)]
pub enum Handler {
    /// Request/response.
    RequestResponse(Arc<dyn RequestResponseHandler>),
    /// Fire-and-forget.
    FireAndForget(Arc<dyn FireAndForgetHandler>),
    /// Request/stream.
    RequestStream(Arc<dyn RequestStreamHandler>),
    /// Bidirectional channel.
    Channel(Arc<dyn ChannelHandler>),
}

impl Handler {
    /// Wrap a request/response handler.
    pub fn request_response(handler: impl RequestResponseHandler + 'static) -> Self {
        Self::RequestResponse(Arc::new(handler))
    }

    /// Wrap a fire-and-forget handler.
    pub fn fire_and_forget(handler: impl FireAndForgetHandler + 'static) -> Self {
        Self::FireAndForget(Arc::new(handler))
    }

    /// Wrap a request/stream handler.
    pub fn request_stream(handler: impl RequestStreamHandler + 'static) -> Self {
        Self::RequestStream(Arc::new(handler))
    }

    /// Wrap a channel handler.
    pub fn channel(handler: impl ChannelHandler + 'static) -> Self {
        Self::Channel(Arc::new(handler))
    }

    /// Interaction kind this handler implements.
    pub fn kind(&self) -> InteractionKind {
        match self {
            Self::RequestResponse(_) => InteractionKind::RequestResponse,
            Self::FireAndForget(_) => InteractionKind::FireAndForget,
            Self::RequestStream(_) => InteractionKind::RequestStream,
            Self::Channel(_) => InteractionKind::Channel,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}
