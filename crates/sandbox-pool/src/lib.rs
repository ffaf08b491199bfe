//! Worker process supervision, pool management, and the invocation
//! pipeline.
//!
//! Builds on `sandbox-ipc`'s Duplex and Request/Response channels, adding
//! process lifecycle (spawn, readiness handshake, recycle, drain) and the
//! pool-level dispatch policy that decides which worker services which
//! call.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod probe;
pub mod worker;

pub use config::{WorkerConfig, WorkerPoolConfig};
pub use error::{InvocationError, PoolError};
pub use pipeline::{InvocationPipeline, MethodDescriptor, MethodResult};
pub use pool::{PoolStats, WorkerEvent, WorkerPool};
pub use probe::{DefaultResourceProbe, ResourceProbe, ResourceUsage};
pub use worker::{decode_worker_config, Worker, WorkerId, WorkerState};
