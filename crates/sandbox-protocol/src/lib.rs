//! Frame Codec and Wire Codec for the worker pool IPC substrate.
//!
//! This crate has no notion of a worker, a pool, or a process — it only
//! knows how to turn a byte stream into length-prefixed frames and how to
//! turn those frames into typed [`message::WireMessage`] values. Everything
//! here is pure and side-effect free apart from the framing functions,
//! which take an `AsyncRead`/`AsyncWrite` but perform no process or
//! transport management of their own.

pub mod error;
pub mod frame;
pub mod message;
pub mod wire;

pub use error::{ErrorKind, FramingError, WireCodecError};
pub use frame::{read_frame, write_frame, DEFAULT_MAX_FRAME_LEN};
pub use message::{
    HealthReport, Invocation, MessageType, MethodOutcome, MethodResultMessage, WireMessage,
};
pub use wire::{decode_message, encode_message};
