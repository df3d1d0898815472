//! Reference route set.
//!
//! | Route              | Kind             |
//! |--------------------|------------------|
//! | `request-response` | request/response |
//! | `fire-and-forget`  | fire-and-forget  |
//! | `request-stream`   | request/stream   |
//! | `channel`          | channel          |
//! | `health`           | request/response |
//! | `connection-info`  | request/response |

pub mod chat;
pub mod status;
pub mod types;

use tether_settings::HandlerSettings;

use crate::handler::Handler;
use crate::router::{Route, RouteError, Router};

pub use chat::{ChannelEchoHandler, EchoHandler, LogMessageHandler, NumberedStreamHandler};
pub use status::StaticTextHandler;
pub use types::{ChatMessage, ChatRequest, ChatResponse};

/// Route name of the echo handler.
pub const REQUEST_RESPONSE_ROUTE: &str = "request-response";
/// Route name of the logging handler.
pub const FIRE_AND_FORGET_ROUTE: &str = "fire-and-forget";
/// Route name of the numbered stream.
pub const REQUEST_STREAM_ROUTE: &str = "request-stream";
/// Route name of the channel echo.
pub const CHANNEL_ROUTE: &str = "channel";
/// Route name of the health probe.
pub const HEALTH_ROUTE: &str = "health";
/// Route name of the connection-info probe.
pub const CONNECTION_INFO_ROUTE: &str = "connection-info";

/// Register every reference route.
///
/// The request-stream route is capped at `stream_items`.
pub fn register_all(router: &mut Router, settings: &HandlerSettings) -> Result<(), RouteError> {
    router.register(
        REQUEST_RESPONSE_ROUTE,
        Handler::request_response(EchoHandler::new(settings.response_delay())),
    )?;
    router.register(
        FIRE_AND_FORGET_ROUTE,
        Handler::fire_and_forget(LogMessageHandler::new()),
    )?;
    router.register_route(
        Route::new(
            REQUEST_STREAM_ROUTE,
            Handler::request_stream(NumberedStreamHandler::new(
                settings.stream_items,
                settings.stream_interval(),
            )),
        )
        .with_item_limit(settings.stream_items),
    )?;
    router.register(CHANNEL_ROUTE, Handler::channel(ChannelEchoHandler::new()))?;
    router.register(
        HEALTH_ROUTE,
        Handler::request_response(StaticTextHandler::new(status::HEALTH_TEXT)),
    )?;
    router.register(
        CONNECTION_INFO_ROUTE,
        Handler::request_response(StaticTextHandler::new(status::CONNECTION_INFO_TEXT)),
    )?;
    Ok(())
}
