use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The wire discriminant. Unknown values are never silently ignored by a
/// decoder — see [`MessageType::from_u8`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    MethodInvocation = 1,
    MethodResult = 2,
    HealthReport = 3,
    Shutdown = 4,
    Ping = 5,
    Pong = 6,
}

impl MessageType {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::MethodInvocation),
            2 => Some(Self::MethodResult),
            3 => Some(Self::HealthReport),
            4 => Some(Self::Shutdown),
            5 => Some(Self::Ping),
            6 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// A method invocation request sent from the pool to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub correlation_id: Uuid,
    pub method: String,
    pub parameter_type_tags: Vec<String>,
    #[serde(with = "serde_payload_vec")]
    pub parameter_payloads: Vec<Vec<u8>>,
    pub timeout_ms: u64,
}

/// Outcome carried by a `MethodResult` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MethodOutcome {
    Success {
        #[serde(with = "serde_optional_payload")]
        payload: Option<Vec<u8>>,
        return_type_tag: Option<String>,
    },
    Failure {
        kind: String,
        message: String,
        stack: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodResultMessage {
    pub correlation_id: Uuid,
    pub outcome: MethodOutcome,
}

/// Reserved for a future polling health-report exchange; not on the
/// critical path today, decoded but never required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub worker_pid: u32,
    pub working_set_mb: u64,
    pub handle_count: u64,
}

/// Logical value produced by [`crate::wire::decode_message`] and consumed by
/// [`crate::wire::encode_message`].
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    MethodInvocation(Invocation),
    MethodResult(MethodResultMessage),
    HealthReport(HealthReport),
    Shutdown,
    Ping,
    Pong,
}

impl WireMessage {
    pub const fn message_type(&self) -> MessageType {
        match self {
            WireMessage::MethodInvocation(_) => MessageType::MethodInvocation,
            WireMessage::MethodResult(_) => MessageType::MethodResult,
            WireMessage::HealthReport(_) => MessageType::HealthReport,
            WireMessage::Shutdown => MessageType::Shutdown,
            WireMessage::Ping => MessageType::Ping,
            WireMessage::Pong => MessageType::Pong,
        }
    }
}

/// Top-level wire envelope: `{message_type: u8, payload: bytes, timestamp: u64}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireEnvelope {
    pub message_type: u8,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub timestamp: u64,
}

mod serde_payload_vec {
    use serde::{Deserializer, Serializer};
    use serde::{de::Deserialize, ser::SerializeSeq};

    pub fn serialize<S>(value: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(value.len()))?;
        for item in value {
            seq.serialize_element(&serde_bytes::Bytes::new(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wrapped: Vec<serde_bytes::ByteBuf> = Deserialize::deserialize(deserializer)?;
        Ok(wrapped.into_iter().map(|b| b.into_vec()).collect())
    }
}

mod serde_optional_payload {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&serde_bytes::Bytes::new(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wrapped: Option<serde_bytes::ByteBuf> = serde::Deserialize::deserialize(deserializer)?;
        Ok(wrapped.map(|b| b.into_vec()))
    }
}
