use thiserror::Error;

/// Stable error-kind tags shared across every crate in the workspace.
///
/// These mirror the "stable string error code" convention the pool and the
/// worker-host binary rely on to report failures to a host application
/// without forcing it to match on each crate's concrete error enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    WorkerStartup,
    WorkerCrashed,
    IpcError,
    MethodTimeout,
    RemoteInvocation,
    PoolExhausted,
    MethodNotFound,
    ConcurrencyViolation,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "Configuration",
            ErrorKind::WorkerStartup => "WorkerStartup",
            ErrorKind::WorkerCrashed => "WorkerCrashed",
            ErrorKind::IpcError => "IpcError",
            ErrorKind::MethodTimeout => "MethodTimeout",
            ErrorKind::RemoteInvocation => "RemoteInvocation",
            ErrorKind::PoolExhausted => "PoolExhausted",
            ErrorKind::MethodNotFound => "MethodNotFound",
            ErrorKind::ConcurrencyViolation => "ConcurrencyViolation",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame Codec failures.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("stream ended mid-frame")]
    UnexpectedEof,
    #[error("frame length {len} exceeds configured cap {max}")]
    OversizeFrame { len: u32, max: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FramingError {
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::IpcError
    }
}

/// Wire Codec failures.
#[derive(Debug, Error)]
pub enum WireCodecError {
    #[error("failed to encode wire message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode wire message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("unknown wire message discriminant: {0}")]
    UnknownDiscriminant(u8),
    #[error(transparent)]
    Framing(#[from] FramingError),
}

impl WireCodecError {
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::IpcError
    }
}
