//! Transport bindings.
//!
//! A binding owns one listen socket and the sessions accepted on it. Both
//! bindings share [`BindingCore`]: settings, the route table, the session
//! registry, and the running/stopped state that makes `stop` idempotent.

pub mod framed;
pub mod raw;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tether_settings::BindingSettings;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::router::Router;
use crate::session::connection::{Connection, TransportKind};
use crate::session::observer::ConnectionObserver;
use crate::session::registry::SessionRegistry;
use crate::session::{FrameSink, FrameStream, Session, SessionConfig};
use crate::shutdown::ShutdownCoordinator;

pub use framed::FramedBinding;
pub use raw::RawBinding;

/// Extra time granted to tasks after the session drain timeout.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Which binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingId {
    /// Raw TCP.
    Tcp,
    /// WebSocket.
    WebSocket,
}

impl BindingId {
    /// Transport kind recorded on connections accepted by this binding.
    pub fn transport(self) -> TransportKind {
        match self {
            Self::Tcp => TransportKind::Raw,
            Self::WebSocket => TransportKind::Framed,
        }
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::WebSocket => f.write_str("websocket"),
        }
    }
}

/// A binding could not start.
#[derive(Debug, Error)]
pub enum BindError {
    /// Settings failed validation.
    #[error("{binding} binding has invalid configuration: {reason}")]
    InvalidConfig {
        /// Binding.
        binding: BindingId,
        /// What is wrong.
        reason: String,
    },

    /// The listen socket could not be opened.
    #[error("{binding} binding could not listen on {address}: {source}")]
    Bind {
        /// Binding.
        binding: BindingId,
        /// Requested `host:port`.
        address: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Start did not finish within the setup timeout.
    #[error("{binding} binding did not start within {timeout:?}")]
    StartupTimeout {
        /// Binding.
        binding: BindingId,
        /// Configured timeout.
        timeout: Duration,
    },

    /// Start was called on a running binding.
    #[error("{binding} binding is already running")]
    AlreadyRunning {
        /// Binding.
        binding: BindingId,
    },
}

impl BindError {
    /// Binding the error belongs to.
    pub fn binding(&self) -> BindingId {
        match self {
            Self::InvalidConfig { binding, .. }
            | Self::Bind { binding, .. }
            | Self::StartupTimeout { binding, .. }
            | Self::AlreadyRunning { binding } => *binding,
        }
    }
}

/// Result of [`TransportBinding::stop`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// The binding was running and has stopped.
    Stopped {
        /// Whether every task finished before the grace period ran out.
        drained: bool,
    },
    /// Nothing to stop.
    NotRunning,
}

/// A listen endpoint for one transport.
#[async_trait]
pub trait TransportBinding: Send + Sync {
    /// Which binding this is.
    fn id(&self) -> BindingId;

    /// Configuration the binding was built with.
    fn settings(&self) -> &BindingSettings;

    /// Open the listen socket and begin accepting connections.
    async fn start(&self) -> Result<SocketAddr, BindError>;

    /// Stop accepting, drain sessions, and release the socket.
    ///
    /// Safe to call any number of times, including concurrently and on a
    /// binding that never started.
    async fn stop(&self) -> StopOutcome;

    /// Bound address while running.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Whether the binding is accepting connections.
    fn is_running(&self) -> bool {
        self.local_addr().is_some()
    }

    /// Live connections on this binding.
    fn connection_count(&self) -> usize;
}

struct Running {
    coordinator: ShutdownCoordinator,
    accept_task: JoinHandle<()>,
}

/// State shared by both binding implementations.
pub(crate) struct BindingCore {
    id: BindingId,
    settings: BindingSettings,
    session: SessionConfig,
    router: Arc<Router>,
    observer: Arc<dyn ConnectionObserver>,
    registry: Arc<SessionRegistry>,
    running: tokio::sync::Mutex<Option<Running>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl BindingCore {
    pub(crate) fn new(
        id: BindingId,
        settings: BindingSettings,
        session: SessionConfig,
        router: Arc<Router>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        Self {
            id,
            settings,
            session,
            router,
            observer,
            registry: Arc::new(SessionRegistry::new()),
            running: tokio::sync::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
        }
    }

    pub(crate) fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub(crate) fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub(crate) fn settings(&self) -> &BindingSettings {
        &self.settings
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Validate settings, bind the listener, and hand it to `serve`, which
    /// returns the accept task.
    pub(crate) async fn start<F>(&self, serve: F) -> Result<SocketAddr, BindError>
    where
        F: FnOnce(TcpListener, ShutdownCoordinator) -> JoinHandle<()>,
    {
        self.settings
            .validate()
            .map_err(|e| BindError::InvalidConfig {
                binding: self.id,
                reason: e.to_string(),
            })?;

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(BindError::AlreadyRunning { binding: self.id });
        }

        let address = format!("{}:{}", self.settings.host, self.settings.port);
        let bind_err = |source| BindError::Bind {
            binding: self.id,
            address: address.clone(),
            source,
        };
        let listener = TcpListener::bind((self.settings.host.as_str(), self.settings.port))
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let coordinator = ShutdownCoordinator::new();
        let accept_task = serve(listener, coordinator.clone());
        *running = Some(Running {
            coordinator,
            accept_task,
        });
        *self.local_addr.lock() = Some(local_addr);

        info!(binding = %self.id, %local_addr, "binding started");
        Ok(local_addr)
    }

    pub(crate) async fn stop(&self) -> StopOutcome {
        let mut running = self.running.lock().await;
        let Some(Running {
            coordinator,
            accept_task,
        }) = running.take()
        else {
            warn!(binding = %self.id, "stop requested but binding is not running");
            return StopOutcome::NotRunning;
        };

        info!(
            binding = %self.id,
            connections = self.registry.connection_count(),
            "stopping binding"
        );
        let drained = coordinator
            .graceful_shutdown(self.session.drain_timeout + STOP_GRACE)
            .await;
        if !accept_task.is_finished() {
            accept_task.abort();
        }
        *self.local_addr.lock() = None;

        info!(binding = %self.id, drained, "binding stopped");
        StopOutcome::Stopped { drained }
    }

    /// Run one session to completion, keeping the registry in step.
    pub(crate) async fn serve_connection(
        self: Arc<Self>,
        remote: SocketAddr,
        inbound: FrameStream,
        sink: FrameSink,
        coordinator: ShutdownCoordinator,
    ) {
        let connection = Arc::new(Connection::new(self.id.transport(), remote.to_string()));
        self.registry.add(connection.clone());

        let session = Session::new(
            connection.clone(),
            self.router.clone(),
            self.observer.clone(),
            self.session.clone(),
            coordinator.tracker(),
        );
        let _reason = session.run(inbound, sink, coordinator.token().child_token()).await;

        let _ = self.registry.remove(&connection.id);
    }
}

/// Wait for the shutdown token or an accepted TCP connection.
pub(crate) async fn accept_next(
    listener: &TcpListener,
    token: &CancellationToken,
    binding: BindingId,
) -> Option<(tokio::net::TcpStream, SocketAddr)> {
    loop {
        tokio::select! {
            () = token.cancelled() => return None,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(%binding, error = %e, "failed to set TCP_NODELAY");
                    }
                    return Some((stream, peer));
                }
                Err(e) => {
                    warn!(%binding, error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
}
