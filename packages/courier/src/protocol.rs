//! Wire envelope: a JSON object `{ "type": ..., "data": { ... } }`.
//!
//! The `type` string selects the shape of `data`. Every payload carries a
//! human-readable `content` and an epoch-millisecond `timestamp`; both default
//! when the peer omits them. Unknown types are kept as [`Envelope::Unrecognized`]
//! instead of failing the frame.

use serde::de::{self, Deserializer};
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fields shared by every payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl Meta {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            timestamp: now_millis(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    #[serde(flatten)]
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthData {
    pub token: String,
    pub user_id: String,
    #[serde(flatten)]
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponseData {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub message: String,
    #[serde(flatten)]
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemData {
    pub event: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(flatten)]
    pub meta: Meta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatData {
    pub message_id: String,
    pub conversation_id: String,
    #[serde(flatten)]
    pub meta: Meta,
}

/// A coalesced group of envelopes. Inner messages are never batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchData {
    pub messages: Vec<Envelope>,
    pub count: usize,
    #[serde(flatten)]
    pub meta: Meta,
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Heartbeat(HeartbeatData),
    Auth(AuthData),
    AuthResponse(AuthResponseData),
    Error(ErrorData),
    System(SystemData),
    Chat(ChatData),
    ChatResponse(ChatData),
    Batch(BatchData),
    /// A `type` this client does not know. Forwarded to generic subscribers only.
    Unrecognized { kind: String, data: Value },
}

impl Envelope {
    /// The wire `type` discriminator.
    pub fn kind(&self) -> &str {
        match self {
            Self::Heartbeat(_) => "heartbeat",
            Self::Auth(_) => "auth",
            Self::AuthResponse(_) => "auth_response",
            Self::Error(_) => "error",
            Self::System(_) => "system",
            Self::Chat(_) => "chat",
            Self::ChatResponse(_) => "chat_response",
            Self::Batch(_) => "batch",
            Self::Unrecognized { kind, .. } => kind,
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_))
    }

    pub fn heartbeat() -> Self {
        Self::Heartbeat(HeartbeatData {
            meta: Meta::new("heartbeat"),
        })
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Error(ErrorData {
            code: code.into(),
            meta: Meta::new(message.clone()),
            message,
        })
    }

    pub fn system(event: impl Into<String>, payload: Map<String, Value>) -> Self {
        let event = event.into();
        Self::System(SystemData {
            meta: Meta::new(format!("system: {event}")),
            event,
            payload,
        })
    }

    pub fn chat(
        message_id: impl Into<String>,
        conversation_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::Chat(ChatData {
            message_id: message_id.into(),
            conversation_id: conversation_id.into(),
            meta: Meta::new(content),
        })
    }

    /// Wrap already-built envelopes into one `batch` envelope.
    pub fn batch(messages: Vec<Envelope>) -> Self {
        Self::Batch(BatchData {
            count: messages.len(),
            messages,
            meta: Meta::new("Batch message"),
        })
    }

    /// Build an envelope from its wire parts.
    pub fn from_parts(kind: &str, data: Value) -> Result<Self, ProtocolError> {
        fn payload<T: serde::de::DeserializeOwned>(
            kind: &str,
            data: Value,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(data).map_err(|e| ProtocolError::InvalidData {
                kind: kind.to_string(),
                reason: e.to_string(),
            })
        }

        // Peers sometimes omit `data` entirely on heartbeats.
        let data = if data.is_null() {
            Value::Object(Map::new())
        } else {
            data
        };

        let envelope = match kind {
            "heartbeat" => Self::Heartbeat(payload(kind, data)?),
            "auth" => Self::Auth(payload(kind, data)?),
            "auth_response" => Self::AuthResponse(payload(kind, data)?),
            "error" => Self::Error(payload(kind, data)?),
            "system" => Self::System(payload(kind, data)?),
            "chat" => Self::Chat(payload(kind, data)?),
            "chat_response" => Self::ChatResponse(payload(kind, data)?),
            "batch" => {
                let batch: BatchData = payload(kind, data)?;
                if batch.messages.iter().any(Envelope::is_batch) {
                    return Err(ProtocolError::NestedBatch);
                }
                Self::Batch(batch)
            }
            other => Self::Unrecognized {
                kind: other.to_string(),
                data,
            },
        };
        Ok(envelope)
    }

    /// Parse one inbound text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
        let kind = raw.kind.ok_or(ProtocolError::MissingType)?;
        Self::from_parts(&kind, raw.data)
    }

    /// Serialize for the wire. `message_id` is added at the top level when
    /// the peer is expected to acknowledge the frame.
    pub fn encode(&self, message_id: Option<&str>) -> Result<String, serde_json::Error> {
        match message_id {
            None => serde_json::to_string(self),
            Some(id) => {
                let mut value = serde_json::to_value(self)?;
                if let Value::Object(map) = &mut value {
                    map.insert("messageId".to_string(), Value::String(id.to_string()));
                }
                serde_json::to_string(&value)
            }
        }
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Value,
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Envelope", 2)?;
        state.serialize_field("type", self.kind())?;
        match self {
            Self::Heartbeat(data) => state.serialize_field("data", data)?,
            Self::Auth(data) => state.serialize_field("data", data)?,
            Self::AuthResponse(data) => state.serialize_field("data", data)?,
            Self::Error(data) => state.serialize_field("data", data)?,
            Self::System(data) => state.serialize_field("data", data)?,
            Self::Chat(data) | Self::ChatResponse(data) => state.serialize_field("data", data)?,
            Self::Batch(data) => state.serialize_field("data", data)?,
            Self::Unrecognized { data, .. } => state.serialize_field("data", data)?,
        }
        state.end()
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawEnvelope::deserialize(deserializer)?;
        let kind = raw
            .kind
            .ok_or_else(|| <D::Error as de::Error>::missing_field("type"))?;
        Self::from_parts(&kind, raw.data).map_err(<D::Error as de::Error>::custom)
    }
}
