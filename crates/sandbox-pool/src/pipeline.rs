use sandbox_ipc::CancelSignal;
use sandbox_protocol::{Invocation, MethodOutcome};
use uuid::Uuid;

use crate::error::InvocationError;
use crate::pool::WorkerPool;

/// One method descriptor the pipeline knows how to route.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub parameter_type_tags: Vec<String>,
    pub timeout_ms: u64,
}

/// Result of a successful dispatched call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResult {
    pub payload: Option<Vec<u8>>,
    pub return_type_tag: Option<String>,
}

/// `Dispose` is intercepted here and never forwarded to a worker: a
/// pool-backed proxy's disposal is a local resource-release concern, not a
/// remote call.
const DISPOSE_METHOD: &str = "Dispose";

/// Builds an [`Invocation`] from a method descriptor and argument payloads,
/// dispatches it through a [`WorkerPool`], and decodes the
/// [`sandbox_protocol::MethodResultMessage`] back into a [`MethodResult`] or
/// an [`InvocationError`].
pub struct InvocationPipeline<'a> {
    pool: &'a WorkerPool,
}

impl<'a> InvocationPipeline<'a> {
    pub fn new(pool: &'a WorkerPool) -> Self {
        Self { pool }
    }

    pub async fn invoke(
        &self,
        descriptor: &MethodDescriptor,
        parameter_payloads: Vec<Vec<u8>>,
        cancel: &CancelSignal,
    ) -> Result<MethodResult, InvocationError> {
        if descriptor.name == DISPOSE_METHOD {
            return Ok(MethodResult {
                payload: None,
                return_type_tag: None,
            });
        }

        let invocation = Invocation {
            correlation_id: Uuid::new_v4(),
            method: descriptor.name.clone(),
            parameter_type_tags: descriptor.parameter_type_tags.clone(),
            parameter_payloads,
            timeout_ms: descriptor.timeout_ms,
        };

        let result_message = self.pool.call(invocation, cancel).await?;

        match result_message.outcome {
            MethodOutcome::Success {
                payload,
                return_type_tag,
            } => Ok(MethodResult {
                payload,
                return_type_tag,
            }),
            MethodOutcome::Failure {
                kind,
                message,
                stack: _,
            } => Err(InvocationError::RemoteInvocation { kind, message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispose_descriptor_is_recognized() {
        let descriptor = MethodDescriptor {
            name: "Dispose".to_owned(),
            parameter_type_tags: vec![],
            timeout_ms: 1_000,
        };
        assert_eq!(descriptor.name, DISPOSE_METHOD);
    }
}
