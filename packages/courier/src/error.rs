//! Error types and the stable codes they carry onto the `error` event stream.

use std::time::Duration;

/// Codes attached to locally generated `error` envelopes.
pub mod codes {
    /// The raw socket reported an error.
    pub const WS_ERROR: &str = "WS_ERROR";
    /// Reconnection budget exhausted.
    pub const MAX_RETRIES: &str = "MAX_RETRIES";
    /// The peer stopped answering heartbeats.
    pub const HEARTBEAT_TIMEOUT: &str = "HEARTBEAT_TIMEOUT";
    /// The peer rejected our credentials.
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    /// No `auth_response` arrived in time.
    pub const AUTH_TIMEOUT: &str = "AUTH_TIMEOUT";
}

/// Close codes the transport uses when it closes the socket itself.
pub mod close_codes {
    /// Caller-initiated disconnect.
    pub const NORMAL: u16 = 1000;
    /// Liveness failure or auth timeout; the connection is recycled.
    pub const LIVENESS: u16 = 4000;
    /// Authentication rejected by the peer.
    pub const AUTH_REJECTED: u16 = 4001;
}

/// An inbound frame could not be turned into an envelope.
///
/// The offending frame is dropped; the connection stays up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed JSON frame: {0}")]
    MalformedJson(String),

    #[error("frame has no `type` field")]
    MissingType,

    #[error("invalid `{kind}` payload: {reason}")]
    InvalidData { kind: String, reason: String },

    #[error("batch contains a nested batch")]
    NestedBatch,

    #[error("malformed auth response: {0}")]
    MalformedAuthResponse(String),

    #[error("unrecognized message type `{0}`")]
    UnrecognizedType(String),
}

impl ProtocolError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::MalformedJson(_) => "PARSE_ERROR",
            Self::MissingType | Self::InvalidData { .. } | Self::NestedBatch => "PROTOCOL_ERROR",
            Self::MalformedAuthResponse(_) => "MALFORMED_AUTH_RESPONSE",
            Self::UnrecognizedType(_) => "UNRECOGNIZED_TYPE",
        }
    }
}

/// Terminal outcome of a queued message that was not delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("message expired after {ttl:?}")]
    Expired { ttl: Duration },

    #[error("send failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("no acknowledgment within {after:?}")]
    AckTimeout { after: Duration },

    #[error("transport closed before delivery")]
    TransportClosed,
}

impl DeliveryError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Expired { .. } => "EXPIRED",
            Self::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Self::AckTimeout { .. } => "ACK_TIMEOUT",
            Self::TransportClosed => "TRANSPORT_CLOSED",
        }
    }
}

/// Failures of the raw socket primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SocketError {
    #[error("WebSocket is not connected")]
    NotConnected,

    #[error("failed to open socket: {0}")]
    Open(String),

    #[error("socket error: {0}")]
    Io(String),
}

impl SocketError {
    /// Map a tungstenite error onto the socket taxonomy.
    pub fn from_tungstenite(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::NotConnected,
            WsError::Io(e) => Self::Io(e.to_string()),
            other => Self::Open(other.to_string()),
        }
    }
}

/// Errors returned by the [`Transport`](crate::Transport) handle itself.
///
/// Connection and delivery failures never surface here; they arrive as
/// `error` events or through delivery callbacks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport task has stopped")]
    Stopped,
}

/// Invalid or unloadable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_map_to_wire_codes() {
        assert_eq!(
            ProtocolError::MalformedJson("eof".into()).error_code(),
            "PARSE_ERROR"
        );
        assert_eq!(ProtocolError::NestedBatch.error_code(), "PROTOCOL_ERROR");
        assert_eq!(
            ProtocolError::UnrecognizedType("presence".into()).error_code(),
            "UNRECOGNIZED_TYPE"
        );
    }

    #[test]
    fn retries_exhausted_reports_attempts() {
        let err = DeliveryError::RetriesExhausted { attempts: 4 };
        assert_eq!(err.to_string(), "send failed after 4 attempts");
        assert_eq!(err.error_code(), "RETRIES_EXHAUSTED");
    }
}
