//! # tether-core
//!
//! Shared building blocks for the Tether messaging server.
//!
//! - [`frame`]: the wire frame exchanged on every connection, tagged with a
//!   per-connection correlation id
//! - [`payload`]: opaque payload bytes plus the [`PayloadCodec`] contract and
//!   its JSON implementation
//! - [`interaction`]: the four request/response cardinality patterns
//! - [`errors`]: decode, codec, and handler error types
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod errors;
pub mod frame;
pub mod ids;
pub mod interaction;
pub mod logging;
pub mod payload;

pub use errors::{CodecError, DecodeError, HandlerError};
pub use frame::Frame;
pub use ids::{CONNECTION_STREAM_ID, ConnectionId, StreamId};
pub use interaction::InteractionKind;
pub use payload::{JsonCodec, Payload, PayloadCodec};
