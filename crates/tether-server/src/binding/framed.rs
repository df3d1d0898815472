//! WebSocket binding: one frame per binary message.
//!
//! Served by axum. Besides the upgrade path the binding answers
//! `GET /health` with live counters.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router as HttpRouter;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use bytes::Bytes;
use futures::{SinkExt, StreamExt, future};
use tether_settings::BindingSettings;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{BindError, BindingCore, BindingId, StopOutcome, TransportBinding};
use crate::health::{self, HealthResponse};
use crate::router::Router;
use crate::session::observer::ConnectionObserver;
use crate::session::{FrameSink, FrameStream, SessionConfig};
use crate::shutdown::ShutdownCoordinator;

/// Path of the HTTP health endpoint.
pub const HEALTH_PATH: &str = "/health";

/// WebSocket listener carrying frames as binary messages.
pub struct FramedBinding {
    core: Arc<BindingCore>,
}

/// Shared state accessible from axum handlers.
#[derive(Clone)]
struct AppState {
    core: Arc<BindingCore>,
    coordinator: ShutdownCoordinator,
    started_at: Instant,
}

impl FramedBinding {
    /// Create a stopped binding.
    pub fn new(
        settings: BindingSettings,
        session: SessionConfig,
        router: Arc<Router>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        Self {
            core: Arc::new(BindingCore::new(
                BindingId::WebSocket,
                settings,
                session,
                router,
                observer,
            )),
        }
    }
}

#[async_trait]
impl TransportBinding for FramedBinding {
    fn id(&self) -> BindingId {
        BindingId::WebSocket
    }

    fn settings(&self) -> &BindingSettings {
        self.core.settings()
    }

    async fn start(&self) -> Result<SocketAddr, BindError> {
        let path = self.core.settings().path_or_default().to_owned();
        if path == HEALTH_PATH {
            return Err(BindError::InvalidConfig {
                binding: BindingId::WebSocket,
                reason: format!("path '{path}' is reserved"),
            });
        }

        let core = self.core.clone();
        self.core
            .start(move |listener, coordinator| {
                coordinator.spawn(serve(core, listener, coordinator.clone(), path))
            })
            .await
    }

    async fn stop(&self) -> StopOutcome {
        self.core.stop().await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }

    fn connection_count(&self) -> usize {
        self.core.registry().connection_count()
    }
}

fn build_router(state: AppState, path: &str) -> HttpRouter {
    HttpRouter::new()
        .route(path, get(ws_handler))
        .route(HEALTH_PATH, get(health_handler))
        .with_state(state)
}

async fn serve(core: Arc<BindingCore>, listener: TcpListener, coordinator: ShutdownCoordinator, path: String) {
    let state = AppState {
        core,
        coordinator: coordinator.clone(),
        started_at: Instant::now(),
    };
    let app = build_router(state, &path);
    let token = coordinator.token();
    if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
    {
        warn!(error = %e, "websocket server exited with error");
    }
    debug!("websocket accept loop stopped");
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let max = state.core.settings().max_payload_size;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| {
            let tracker = state.coordinator.tracker();
            tracker.track_future(handle_socket(socket, peer, state))
        })
}

/// Bridge a WebSocket to a session.
async fn handle_socket(socket: WebSocket, peer: SocketAddr, state: AppState) {
    debug!(%peer, "websocket connection accepted");
    let (ws_tx, ws_rx) = socket.split();

    let inbound: FrameStream = ws_rx
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(move |msg| {
            future::ready(match msg {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(Message::Text(_)) => {
                    warn!(%peer, "text message ignored, frames must be binary");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(io::Error::other(e))),
            })
        })
        .boxed();

    let sink: FrameSink = Box::pin(
        ws_tx
            .with(|bytes: Bytes| future::ready(Ok::<_, axum::Error>(Message::Binary(bytes))))
            .sink_map_err(io::Error::other),
    );

    let AppState {
        core, coordinator, ..
    } = state;
    core.serve_connection(peer, inbound, sink, coordinator).await;
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.started_at,
        state.core.registry().connection_count(),
        state.core.router().len(),
    ))
}
