//! The four interaction-pattern routes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, future};
use tether_core::{HandlerError, JsonCodec, Payload, PayloadCodec};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{ChatMessage, ChatRequest, ChatResponse};
use crate::handler::{
    ChannelHandler, FireAndForgetHandler, PayloadStream, RequestContext, RequestResponseHandler,
    RequestStreamHandler,
};

/// `serverInfo` of request/response replies.
pub const REQUEST_RESPONSE_SERVER_INFO: &str = "TCP/WebSocket Server - Request-Response";
/// `sender` of request/stream items.
pub const STREAM_SENDER: &str = "Server Stream";
/// `serverInfo` of channel replies.
pub const CHANNEL_SERVER_INFO: &str = "Bidirectional Channel";

/// Echoes `message` back as `"Echo: <message>"` after a fixed delay.
#[derive(Clone, Debug)]
pub struct EchoHandler {
    delay: Duration,
}

impl EchoHandler {
    /// Create with a processing delay. Zero disables it.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl RequestResponseHandler for EchoHandler {
    async fn handle(&self, payload: Payload, ctx: RequestContext) -> Result<Payload, HandlerError> {
        let request: ChatRequest = JsonCodec.decode(&payload)?;
        info!(connection_id = %ctx.connection_id, user = %request.user, "received request-response");

        if !self.delay.is_zero() {
            tokio::select! {
                () = ctx.cancelled() => return Err(HandlerError::Cancelled),
                () = tokio::time::sleep(self.delay) => {}
            }
        }
        let response = ChatResponse::new(format!("Echo: {}", request.message), REQUEST_RESPONSE_SERVER_INFO);
        Ok(JsonCodec.encode(&response)?)
    }
}

/// Logs each message. Never fails; undecodable payloads are logged and
/// dropped.
#[derive(Clone, Debug, Default)]
pub struct LogMessageHandler {
    processed: Arc<AtomicU64>,
}

impl LogMessageHandler {
    /// Create a handler with a zeroed counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages handled so far, including malformed ones.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FireAndForgetHandler for LogMessageHandler {
    async fn handle(&self, payload: Payload, ctx: RequestContext) -> Result<(), HandlerError> {
        match JsonCodec.decode::<ChatMessage>(&payload) {
            Ok(message) => info!(
                connection_id = %ctx.connection_id,
                sender = %message.sender,
                content = %message.content,
                "received fire-and-forget"
            ),
            Err(err) => warn!(connection_id = %ctx.connection_id, error = %err, "discarding malformed fire-and-forget payload"),
        }
        let _ = self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Emits `items` numbered messages derived from the request, one per
/// `interval`, each with a fresh UUID.
#[derive(Clone, Debug)]
pub struct NumberedStreamHandler {
    items: usize,
    interval: Duration,
}

impl NumberedStreamHandler {
    /// Create with an item count and spacing.
    pub fn new(items: usize, interval: Duration) -> Self {
        Self { items, interval }
    }
}

impl RequestStreamHandler for NumberedStreamHandler {
    fn handle(&self, payload: Payload, ctx: RequestContext) -> PayloadStream {
        let request: ChatRequest = match JsonCodec.decode(&payload) {
            Ok(request) => request,
            Err(err) => {
                return futures::stream::once(future::ready(Err::<Payload, _>(HandlerError::from(err)))).boxed();
            }
        };
        info!(connection_id = %ctx.connection_id, user = %request.user, "received request-stream");

        let items = self.items;
        let interval = self.interval;
        Box::pin(async_stream::stream! {
            for n in 1..=items {
                tokio::select! {
                    () = ctx.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                let message = ChatMessage::new(format!("{} - Stream item {n}", request.message), STREAM_SENDER)
                    .with_id(Uuid::new_v4().to_string());
                yield JsonCodec.encode(&message).map_err(HandlerError::from);
            }
        })
    }
}

/// Answers each inbound request with `"Channel response to: <message> [n]"`.
///
/// `n` comes from a counter shared by every channel this handler serves, so
/// it strictly increases within any single channel.
#[derive(Clone, Debug, Default)]
pub struct ChannelEchoHandler {
    counter: Arc<AtomicU64>,
}

impl ChannelEchoHandler {
    /// Create a handler with the counter at zero.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelHandler for ChannelEchoHandler {
    fn handle(&self, inbound: PayloadStream, ctx: RequestContext) -> PayloadStream {
        info!(connection_id = %ctx.connection_id, stream_id = ctx.stream_id, "starting bidirectional channel");
        let counter = self.counter.clone();
        inbound
            .map(move |item| -> Result<Payload, HandlerError> {
                let request: ChatRequest = JsonCodec.decode(&item?)?;
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(user = %request.user, n, "channel received");
                let response = ChatResponse::new(
                    format!("Channel response to: {} [{n}]", request.message),
                    CHANNEL_SERVER_INFO,
                )
                .with_sequence(n);
                Ok(JsonCodec.encode(&response)?)
            })
            .boxed()
    }
}
