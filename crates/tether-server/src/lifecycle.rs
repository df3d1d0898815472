//! Start and stop every binding as a unit.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use tether_core::{HandlerError, JsonCodec, Payload, PayloadCodec};
use tether_settings::TetherSettings;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::binding::{BindError, BindingId, FramedBinding, RawBinding, StopOutcome, TransportBinding};
use crate::handler::{Handler, RequestContext};
use crate::handlers::HEALTH_ROUTE;
use crate::router::Router;
use crate::session::SessionConfig;
use crate::session::observer::{ConnectionObserver, LoggingObserver};

/// Per-binding result of [`LifecycleManager::start_all`].
#[derive(Debug)]
pub enum BindingStatus {
    /// Listening on this address.
    Started(SocketAddr),
    /// Disabled in configuration. Never listened.
    Disabled,
    /// Could not start.
    Failed(BindError),
}

/// Outcome of starting every binding.
#[derive(Debug, Default)]
pub struct StartReport {
    /// One entry per binding, in registration order.
    pub bindings: Vec<(BindingId, BindingStatus)>,
}

impl StartReport {
    /// Address of a started binding.
    pub fn addr(&self, id: BindingId) -> Option<SocketAddr> {
        self.bindings.iter().find_map(|(bid, status)| match status {
            BindingStatus::Started(addr) if *bid == id => Some(*addr),
            _ => None,
        })
    }

    /// Number of bindings now listening.
    pub fn started(&self) -> usize {
        self.bindings
            .iter()
            .filter(|(_, s)| matches!(s, BindingStatus::Started(_)))
            .count()
    }

    /// Bindings that failed, with their errors.
    pub fn failures(&self) -> impl Iterator<Item = &BindError> {
        self.bindings.iter().filter_map(|(_, s)| match s {
            BindingStatus::Failed(err) => Some(err),
            _ => None,
        })
    }

    /// Whether every enabled binding started.
    pub fn is_ready(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Some enabled binding failed to start.
///
/// Bindings that did start are left running; the report says which.
#[derive(Debug, Error)]
#[error("{} of {} bindings failed to start", .report.failures().count(), .report.bindings.len())]
pub struct StartupError {
    /// Full per-binding outcome.
    pub report: StartReport,
}

/// Outcome of stopping every binding.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// One entry per binding, in registration order.
    pub bindings: Vec<(BindingId, StopOutcome)>,
}

impl ShutdownReport {
    /// Whether nothing was running.
    pub fn nothing_running(&self) -> bool {
        self.bindings
            .iter()
            .all(|(_, outcome)| *outcome == StopOutcome::NotRunning)
    }
}

/// Owns the route table and every binding.
pub struct LifecycleManager {
    router: Arc<Router>,
    bindings: Vec<Arc<dyn TransportBinding>>,
}

impl LifecycleManager {
    /// Build the raw TCP and WebSocket bindings from settings.
    pub fn new(settings: &TetherSettings, router: Router) -> Self {
        Self::with_observer(settings, router, Arc::new(LoggingObserver))
    }

    /// Like [`new`](Self::new) with a custom observer.
    pub fn with_observer(
        settings: &TetherSettings,
        router: Router,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        let router = Arc::new(router);
        let session = SessionConfig::from(&settings.session);
        let bindings: Vec<Arc<dyn TransportBinding>> = vec![
            Arc::new(RawBinding::new(
                settings.tcp.clone(),
                session.clone(),
                router.clone(),
                observer.clone(),
            )),
            Arc::new(FramedBinding::new(
                settings.websocket.clone(),
                session,
                router.clone(),
                observer,
            )),
        ];
        Self { router, bindings }
    }

    /// Manage an explicit set of bindings.
    pub fn with_bindings(router: Arc<Router>, bindings: Vec<Arc<dyn TransportBinding>>) -> Self {
        Self { router, bindings }
    }

    /// Shared route table.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Look up a binding.
    pub fn binding(&self, id: BindingId) -> Option<&Arc<dyn TransportBinding>> {
        self.bindings.iter().find(|b| b.id() == id)
    }

    /// Start every enabled binding in registration order, each bounded by
    /// its setup timeout.
    ///
    /// A failure in one binding never prevents the next from starting.
    pub async fn start_all(&self) -> Result<StartReport, StartupError> {
        let mut report = StartReport::default();
        for binding in &self.bindings {
            let status = start_one(binding.as_ref()).await;
            report.bindings.push((binding.id(), status));
        }
        if report.is_ready() {
            Ok(report)
        } else {
            Err(StartupError { report })
        }
    }

    /// Stop every binding. Always succeeds; bindings that were not running
    /// are reported as such.
    pub async fn shutdown_all(&self) -> ShutdownReport {
        let stops = self.bindings.iter().map(|binding| async move {
            let outcome = binding.stop().await;
            if outcome == StopOutcome::NotRunning {
                warn!(binding = %binding.id(), "server was not running");
            }
            (binding.id(), outcome)
        });
        let report = ShutdownReport {
            bindings: join_all(stops).await,
        };
        info!(nothing_running = report.nothing_running(), "shutdown complete");
        report
    }

    /// Call the health route in-process.
    pub async fn probe_health(&self) -> Result<String, HandlerError> {
        let route = self
            .router
            .resolve(HEALTH_ROUTE, tether_core::InteractionKind::RequestResponse)
            .map_err(|e| HandlerError::failed(e.to_string()))?;
        let Handler::RequestResponse(handler) = route.handler() else {
            return Err(HandlerError::failed("health route is not request-response"));
        };
        let payload = handler
            .handle(Payload::empty(), RequestContext::detached(HEALTH_ROUTE))
            .await?;
        Ok(JsonCodec.decode::<String>(&payload)?)
    }
}

async fn start_one(binding: &dyn TransportBinding) -> BindingStatus {
    let id = binding.id();
    let settings = binding.settings();
    if !settings.enabled {
        info!(binding = %id, "binding disabled");
        return BindingStatus::Disabled;
    }
    let timeout = settings.setup_timeout();
    match tokio::time::timeout(timeout, binding.start()).await {
        Ok(Ok(addr)) => {
            info!(binding = %id, %addr, "server started");
            BindingStatus::Started(addr)
        }
        Ok(Err(err)) => {
            error!(binding = %id, error = %err, "failed to start");
            BindingStatus::Failed(err)
        }
        Err(_elapsed) => {
            error!(binding = %id, ?timeout, "start timed out");
            BindingStatus::Failed(BindError::StartupTimeout { binding: id, timeout })
        }
    }
}
