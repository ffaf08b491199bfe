//! Duplex Channel and Request/Response Channel.
//!
//! This crate owns the transport: a named pipe / Unix domain socket
//! connection to exactly one worker process, framed and encoded via
//! `sandbox-protocol`, with single-flight request/response semantics layered
//! on top. It has no notion of a worker pool, a recycle policy, or a method
//! descriptor — those live in `sandbox-pool`.

pub mod cancel;
pub mod duplex;
pub mod error;
pub mod request_response;

pub use cancel::CancelSignal;
pub use duplex::{BoundListener, DisconnectEvent, DisconnectReason, DuplexChannel};
pub use error::IpcError;
pub use request_response::RequestResponseChannel;
