use sandbox_protocol::ErrorKind;

/// Errors raised while spawning, supervising, or recycling worker processes.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    Configuration(String),

    #[error("worker failed to start: {0}")]
    WorkerStartup(String),

    #[error("worker process crashed: {0}")]
    WorkerCrashed(String),

    #[error("pool exhausted: no worker became available within the configured attempts")]
    PoolExhausted,

    #[error(transparent)]
    Ipc(#[from] sandbox_ipc::IpcError),

    #[error("worker process io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Configuration(_) => ErrorKind::Configuration,
            PoolError::WorkerStartup(_) => ErrorKind::WorkerStartup,
            PoolError::WorkerCrashed(_) => ErrorKind::WorkerCrashed,
            PoolError::PoolExhausted => ErrorKind::PoolExhausted,
            PoolError::Ipc(err) => err.kind(),
            PoolError::Io(_) => ErrorKind::WorkerStartup,
        }
    }
}

/// Errors raised while building, dispatching, or decoding a single
/// invocation through the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("remote invocation failed: {kind}: {message}")]
    RemoteInvocation { kind: String, message: String },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Ipc(#[from] sandbox_ipc::IpcError),
}

impl InvocationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InvocationError::RemoteInvocation { kind, .. } if kind == "MethodNotFound" => {
                ErrorKind::MethodNotFound
            }
            InvocationError::RemoteInvocation { .. } => ErrorKind::RemoteInvocation,
            InvocationError::Pool(err) => err.kind(),
            InvocationError::Ipc(err) => err.kind(),
        }
    }
}
