use sandbox_protocol::ErrorKind;
use thiserror::Error;

/// IPC-layer failures: channel lifecycle, connection setup, and the
/// single-flight request/response contract.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("channel {channel_id} is disconnected: {reason}")]
    Disconnected {
        channel_id: String,
        reason: String,
    },
    #[error("timed out connecting to endpoint {endpoint} after {timeout_ms}ms")]
    ConnectTimeout { endpoint: String, timeout_ms: u64 },
    #[error("method {method} timed out after {timeout_ms}ms")]
    MethodTimeout { method: String, timeout_ms: u64 },
    #[error(
        "a request is already in flight on this channel; only one outstanding \
         request is allowed per single-flight invariant"
    )]
    ConcurrencyViolation,
    #[error(transparent)]
    Framing(#[from] sandbox_protocol::FramingError),
    #[error(transparent)]
    WireCodec(#[from] sandbox_protocol::WireCodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IpcError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            IpcError::MethodTimeout { .. } => ErrorKind::MethodTimeout,
            IpcError::ConcurrencyViolation => ErrorKind::ConcurrencyViolation,
            _ => ErrorKind::IpcError,
        }
    }
}
