//! Route table mapping names to handlers.
//!
//! Built once at startup, then shared read-only (`Arc<Router>`) by every
//! connection.

use std::collections::HashMap;
use std::sync::Arc;

use tether_core::InteractionKind;
use thiserror::Error;

use crate::handler::Handler;

/// Registration or dispatch failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// No route with this name.
    #[error("route '{0}' not found")]
    NotFound(String),

    /// A route with this name already exists.
    #[error("route '{0}' is already registered")]
    Duplicate(String),

    /// The route exists but serves a different interaction kind.
    #[error("route '{route}' handles {registered}, not {requested}")]
    KindMismatch {
        /// Route name.
        route: String,
        /// Kind the route was registered with.
        registered: InteractionKind,
        /// Kind the request asked for.
        requested: InteractionKind,
    },
}

/// A named handler plus optional per-route limits.
#[derive(Clone, Debug)]
pub struct Route {
    name: Arc<str>,
    handler: Handler,
    item_limit: Option<usize>,
}

impl Route {
    /// Create a route with no item limit.
    pub fn new(name: &str, handler: Handler) -> Self {
        Self {
            name: Arc::from(name),
            handler,
            item_limit: None,
        }
    }

    /// Cap the number of items a stream or channel route may emit.
    ///
    /// Ignored for request/response and fire-and-forget.
    #[must_use]
    pub fn with_item_limit(mut self, limit: usize) -> Self {
        self.item_limit = Some(limit);
        self
    }

    /// Route name.
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Interaction kind served by this route.
    pub fn kind(&self) -> InteractionKind {
        self.handler.kind()
    }

    /// Handler bound to this route.
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Item cap, if any.
    pub fn item_limit(&self) -> Option<usize> {
        self.item_limit
    }
}

/// Registry of routes, keyed by name.
#[derive(Debug, Default)]
pub struct Router {
    routes: HashMap<Arc<str>, Route>,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    pub fn register(&mut self, name: &str, handler: Handler) -> Result<(), RouteError> {
        self.register_route(Route::new(name, handler))
    }

    /// Register a fully built [`Route`].
    pub fn register_route(&mut self, route: Route) -> Result<(), RouteError> {
        if self.routes.contains_key(route.name()) {
            return Err(RouteError::Duplicate(route.name().to_string()));
        }
        tracing::debug!(route = %route.name(), kind = %route.kind(), "route registered");
        let _ = self.routes.insert(route.name().clone(), route);
        Ok(())
    }

    /// Look up a route by name.
    pub fn dispatch(&self, name: &str) -> Result<&Route, RouteError> {
        self.routes
            .get(name)
            .ok_or_else(|| RouteError::NotFound(name.to_owned()))
    }

    /// Look up a route and check it serves `kind`.
    pub fn resolve(&self, name: &str, kind: InteractionKind) -> Result<&Route, RouteError> {
        let route = self.dispatch(name)?;
        if route.kind() != kind {
            return Err(RouteError::KindMismatch {
                route: name.to_owned(),
                registered: route.kind(),
                requested: kind,
            });
        }
        Ok(route)
    }

    /// Whether a route with this name exists.
    pub fn has_route(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// All registered route names, sorted.
    pub fn route_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().map(ToString::to_string).collect();
        names.sort();
        names
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
