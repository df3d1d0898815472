//! Raw TCP binding: frames are length-prefixed on the byte stream.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{StreamExt, TryStreamExt};
use tether_settings::BindingSettings;
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use super::{BindError, BindingCore, BindingId, StopOutcome, TransportBinding, accept_next};
use crate::router::Router;
use crate::session::observer::ConnectionObserver;
use crate::session::{FrameSink, FrameStream, SessionConfig};
use crate::shutdown::ShutdownCoordinator;

/// TCP listener speaking 4-byte big-endian length-prefixed frames.
pub struct RawBinding {
    core: Arc<BindingCore>,
}

impl RawBinding {
    /// Create a stopped binding.
    pub fn new(
        settings: BindingSettings,
        session: SessionConfig,
        router: Arc<Router>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        Self {
            core: Arc::new(BindingCore::new(
                BindingId::Tcp,
                settings,
                session,
                router,
                observer,
            )),
        }
    }
}

/// Codec for one connection. Frames above `max_payload_size` fail the read.
pub fn frame_codec(max_payload_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_payload_size)
        .new_codec()
}

#[async_trait]
impl TransportBinding for RawBinding {
    fn id(&self) -> BindingId {
        BindingId::Tcp
    }

    fn settings(&self) -> &BindingSettings {
        self.core.settings()
    }

    async fn start(&self) -> Result<SocketAddr, BindError> {
        let core = self.core.clone();
        self.core
            .start(move |listener, coordinator| {
                coordinator.spawn(accept_loop(core, listener, coordinator.clone()))
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

async fn accept_loop(core: Arc<BindingCore>, listener: TcpListener, coordinator: ShutdownCoordinator) {
    let token = coordinator.token();
    let max_payload_size = core.settings().max_payload_size;

    while let Some((stream, peer)) = accept_next(&listener, &token, BindingId::Tcp).await {
        debug!(%peer, "tcp connection accepted");
        let (sink, stream) = Framed::new(stream, frame_codec(max_payload_size)).split();
        let inbound: FrameStream = stream.map_ok(BytesMut::freeze).boxed();
        let sink: FrameSink = Box::pin(sink);
        let _ = coordinator.spawn(core.clone().serve_connection(peer, inbound, sink, coordinator.clone()));
    }
    debug!("tcp accept loop stopped");
}
