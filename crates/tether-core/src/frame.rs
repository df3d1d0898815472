//! Wire frames.
//!
//! Every frame starts with a 5-byte header: the correlation id (`u32` BE)
//! followed by a type byte. The body depends on the type:
//!
//! | type | body |
//! |---|---|
//! | `Request` | kind `u8`, route length `u16` BE, route UTF-8, payload |
//! | `Next` / `NextComplete` | payload |
//! | `Complete` / `Cancel` | empty |
//! | `Error` | UTF-8 message |
//! | `KeepAlive` | respond flag `u8` (stream id is always 0) |
//!
//! Payloads run to the end of the frame; the transport supplies the frame
//! boundary.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::{CodecError, DecodeError};
use crate::ids::{CONNECTION_STREAM_ID, StreamId};
use crate::interaction::InteractionKind;
use crate::payload::Payload;

const HEADER_LEN: usize = 5;

/// Longest route name that fits the length prefix.
pub const MAX_ROUTE_LEN: usize = u16::MAX as usize;

const TYPE_REQUEST: u8 = 0x01;
const TYPE_NEXT: u8 = 0x02;
const TYPE_NEXT_COMPLETE: u8 = 0x03;
const TYPE_COMPLETE: u8 = 0x04;
const TYPE_ERROR: u8 = 0x05;
const TYPE_CANCEL: u8 = 0x06;
const TYPE_KEEPALIVE: u8 = 0x07;

/// A single logical message on a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// First frame of a new request.
    Request {
        /// Correlation id chosen by the peer.
        stream_id: StreamId,
        /// Interaction pattern requested.
        kind: InteractionKind,
        /// Route name.
        route: String,
        /// Request payload (first inbound item for channels).
        payload: Payload,
    },
    /// One item of a stream.
    Next {
        /// Correlation id.
        stream_id: StreamId,
        /// Item payload.
        payload: Payload,
    },
    /// The last item of a stream, or the single reply to a request-response.
    NextComplete {
        /// Correlation id.
        stream_id: StreamId,
        /// Item payload.
        payload: Payload,
    },
    /// The sender's side of the stream finished normally.
    Complete {
        /// Correlation id.
        stream_id: StreamId,
    },
    /// The sender's side of the stream terminated with an error.
    Error {
        /// Correlation id.
        stream_id: StreamId,
        /// Human-readable reason.
        message: String,
    },
    /// The peer no longer wants this request.
    Cancel {
        /// Correlation id.
        stream_id: StreamId,
    },
    /// Connection liveness probe.
    KeepAlive {
        /// Whether the receiver should answer with its own keepalive.
        respond: bool,
    },
}

impl Frame {
    /// Build an `Error` frame.
    pub fn error(stream_id: StreamId, message: impl Into<String>) -> Self {
        Self::Error {
            stream_id,
            message: message.into(),
        }
    }

    /// Correlation id this frame belongs to.
    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::Request { stream_id, .. }
            | Self::Next { stream_id, .. }
            | Self::NextComplete { stream_id, .. }
            | Self::Complete { stream_id }
            | Self::Error { stream_id, .. }
            | Self::Cancel { stream_id } => *stream_id,
            Self::KeepAlive { .. } => CONNECTION_STREAM_ID,
        }
    }

    /// Short name for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Next { .. } => "next",
            Self::NextComplete { .. } => "next-complete",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Cancel { .. } => "cancel",
            Self::KeepAlive { .. } => "keepalive",
        }
    }

    /// Whether this frame ends the sender's side of its stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NextComplete { .. } | Self::Complete { .. } | Self::Error { .. } | Self::Cancel { .. }
        )
    }

    /// Encode into a contiguous buffer.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body_hint());
        buf.put_u32(self.stream_id());
        match self {
            Self::Request {
                kind,
                route,
                payload,
                ..
            } => {
                let len = u16::try_from(route.len()).map_err(|_| CodecError::RouteTooLong {
                    len: route.len(),
                    max: MAX_ROUTE_LEN,
                })?;
                buf.put_u8(TYPE_REQUEST);
                buf.put_u8(kind.as_u8());
                buf.put_u16(len);
                buf.put_slice(route.as_bytes());
                buf.put_slice(payload.as_bytes());
            }
            Self::Next { payload, .. } => {
                buf.put_u8(TYPE_NEXT);
                buf.put_slice(payload.as_bytes());
            }
            Self::NextComplete { payload, .. } => {
                buf.put_u8(TYPE_NEXT_COMPLETE);
                buf.put_slice(payload.as_bytes());
            }
            Self::Complete { .. } => buf.put_u8(TYPE_COMPLETE),
            Self::Error { message, .. } => {
                buf.put_u8(TYPE_ERROR);
                buf.put_slice(message.as_bytes());
            }
            Self::Cancel { .. } => buf.put_u8(TYPE_CANCEL),
            Self::KeepAlive { respond } => {
                buf.put_u8(TYPE_KEEPALIVE);
                buf.put_u8(u8::from(*respond));
            }
        }
        Ok(buf.freeze())
    }

    /// Decode one frame from a buffer holding exactly that frame.
    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        ensure(&buf, None, HEADER_LEN)?;
        let stream_id = buf.get_u32();
        let frame_type = buf.get_u8();

        let frame = match frame_type {
            TYPE_REQUEST => {
                ensure(&buf, Some(stream_id), 3)?;
                let raw_kind = buf.get_u8();
                let kind = InteractionKind::from_u8(raw_kind).ok_or(
                    DecodeError::UnknownInteraction {
                        stream_id,
                        value: raw_kind,
                    },
                )?;
                let route_len = usize::from(buf.get_u16());
                ensure(&buf, Some(stream_id), route_len)?;
                let route = utf8(buf.split_to(route_len), stream_id, "route")?;
                Self::Request {
                    stream_id,
                    kind,
                    route,
                    payload: Payload::from(buf),
                }
            }
            TYPE_NEXT => Self::Next {
                stream_id,
                payload: Payload::from(buf),
            },
            TYPE_NEXT_COMPLETE => Self::NextComplete {
                stream_id,
                payload: Payload::from(buf),
            },
            TYPE_COMPLETE => Self::Complete { stream_id },
            TYPE_ERROR => Self::Error {
                stream_id,
                message: utf8(buf, stream_id, "error message")?,
            },
            TYPE_CANCEL => Self::Cancel { stream_id },
            TYPE_KEEPALIVE => {
                ensure(&buf, Some(stream_id), 1)?;
                Self::KeepAlive {
                    respond: buf.get_u8() != 0,
                }
            }
            other => {
                return Err(DecodeError::UnknownFrameType {
                    stream_id,
                    frame_type: other,
                });
            }
        };
        Ok(frame)
    }

    fn body_hint(&self) -> usize {
        match self {
            Self::Request { route, payload, .. } => 3 + route.len() + payload.len(),
            Self::Next { payload, .. } | Self::NextComplete { payload, .. } => payload.len(),
            Self::Error { message, .. } => message.len(),
            Self::Complete { .. } | Self::Cancel { .. } | Self::KeepAlive { .. } => 1,
        }
    }
}

fn ensure(buf: &Bytes, stream_id: Option<StreamId>, needed: usize) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated {
            stream_id,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn utf8(bytes: Bytes, stream_id: StreamId, field: &'static str) -> Result<String, DecodeError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { stream_id, field })
}
