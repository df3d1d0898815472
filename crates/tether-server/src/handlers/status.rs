//! Static liveness routes.

use async_trait::async_trait;
use tether_core::{HandlerError, JsonCodec, Payload, PayloadCodec};

use crate::handler::{RequestContext, RequestResponseHandler};

/// Body of the `health` route.
pub const HEALTH_TEXT: &str = "Tether server is healthy";
/// Body of the `connection-info` route.
pub const CONNECTION_INFO_TEXT: &str = "Connected to Tether server - supports TCP and WebSocket";

/// Answers every request with the same JSON string. The request payload is
/// ignored.
#[derive(Clone, Copy, Debug)]
pub struct StaticTextHandler {
    text: &'static str,
}

impl StaticTextHandler {
    /// Create a handler answering with `text`.
    pub const fn new(text: &'static str) -> Self {
        Self { text }
    }
}

#[async_trait]
impl RequestResponseHandler for StaticTextHandler {
    async fn handle(&self, _payload: Payload, _ctx: RequestContext) -> Result<Payload, HandlerError> {
        Ok(JsonCodec.encode(self.text)?)
    }
}
