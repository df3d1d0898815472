//! Decode, codec, and handler error types.

use thiserror::Error;

use crate::ids::StreamId;

/// An inbound frame or payload could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The buffer ended before the frame did.
    #[error("frame truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Correlation id, when the header was read before the body ran out.
        stream_id: Option<StreamId>,
        /// Bytes required by the next field.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// The frame type byte is not one we know.
    #[error("unknown frame type {frame_type:#04x} on stream {stream_id}")]
    UnknownFrameType {
        /// Correlation id read from the header.
        stream_id: StreamId,
        /// Offending type byte.
        frame_type: u8,
    },

    /// A `Request` frame named an interaction kind we do not know.
    #[error("unknown interaction kind {value} on stream {stream_id}")]
    UnknownInteraction {
        /// Correlation id read from the header.
        stream_id: StreamId,
        /// Offending kind byte.
        value: u8,
    },

    /// A text field was not valid UTF-8.
    #[error("invalid UTF-8 in {field} on stream {stream_id}")]
    InvalidUtf8 {
        /// Correlation id read from the header.
        stream_id: StreamId,
        /// Which field failed.
        field: &'static str,
    },

    /// The payload bytes did not match the expected shape.
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl DecodeError {
    /// Correlation id of the frame that failed, when the header was readable.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Self::UnknownFrameType { stream_id, .. }
            | Self::UnknownInteraction { stream_id, .. }
            | Self::InvalidUtf8 { stream_id, .. } => Some(*stream_id),
            Self::Truncated { stream_id, .. } => *stream_id,
            Self::Payload(_) => None,
        }
    }
}

/// A value or frame could not be encoded.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization of a payload value failed.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// A route name does not fit the `u16` length prefix.
    #[error("route name is {len} bytes, limit is {max}")]
    RouteTooLong {
        /// Actual length in bytes.
        len: usize,
        /// Maximum encodable length.
        max: usize,
    },
}

/// Failure produced while serving one request.
///
/// Reported to the peer as an `Error` frame for every interaction kind except
/// fire-and-forget. Never closes the connection.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The handler failed.
    #[error("{message}")]
    Failed {
        /// Human-readable description.
        message: String,
    },

    /// The request payload could not be decoded.
    #[error("invalid payload: {message}")]
    InvalidPayload {
        /// Decoder message.
        message: String,
    },

    /// The peer terminated its side of a channel with an error.
    #[error("peer error: {message}")]
    Peer {
        /// Message carried by the peer's `Error` frame.
        message: String,
    },

    /// The request was cancelled before it finished.
    #[error("request cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

impl From<DecodeError> for HandlerError {
    fn from(err: DecodeError) -> Self {
        Self::InvalidPayload {
            message: err.to_string(),
        }
    }
}

impl From<CodecError> for HandlerError {
    fn from(err: CodecError) -> Self {
        Self::Failed {
            message: err.to_string(),
        }
    }
}
