//! # tether-server
//!
//! Multiplexed, bidirectional messaging server.
//!
//! - [`binding`]: raw TCP and WebSocket listen endpoints
//! - [`session`]: one task per accepted connection, keepalive, observers
//! - [`multiplexer`]: per-connection table of in-flight requests keyed by
//!   correlation id
//! - [`router`] and [`handler`]: route registration and the four
//!   interaction-kind handler traits
//! - [`handlers`]: the reference route set
//! - [`lifecycle`]: conditional start and idempotent shutdown of bindings

#![deny(unsafe_code)]

pub mod binding;
pub mod handler;
pub mod handlers;
pub mod health;
pub mod lifecycle;
pub mod multiplexer;
pub mod router;
pub mod session;
pub mod shutdown;

pub use binding::{BindError, BindingId, StopOutcome, TransportBinding};
pub use handler::{Handler, PayloadStream, RequestContext};
pub use lifecycle::{LifecycleManager, ShutdownReport, StartReport, StartupError};
pub use router::{Route, RouteError, Router};
