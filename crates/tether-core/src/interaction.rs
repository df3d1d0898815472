//! Interaction kinds: the request/response cardinality of a route.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the four interaction patterns a route can implement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InteractionKind {
    /// One request, exactly one response.
    RequestResponse,
    /// One request, no response ever.
    FireAndForget,
    /// One request, a bounded sequence of responses.
    RequestStream,
    /// A stream of requests and an independent stream of responses.
    Channel,
}

impl InteractionKind {
    /// Wire tag used in `Request` frames.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::RequestResponse => 1,
            Self::FireAndForget => 2,
            Self::RequestStream => 3,
            Self::Channel => 4,
        }
    }

    /// Parse a wire tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::RequestResponse),
            2 => Some(Self::FireAndForget),
            3 => Some(Self::RequestStream),
            4 => Some(Self::Channel),
            _ => None,
        }
    }

    /// Stable lowercase name, used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestResponse => "request-response",
            Self::FireAndForget => "fire-and-forget",
            Self::RequestStream => "request-stream",
            Self::Channel => "channel",
        }
    }

    /// Whether the peer ever receives frames for this kind.
    pub fn has_response(self) -> bool {
        !matches!(self, Self::FireAndForget)
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
