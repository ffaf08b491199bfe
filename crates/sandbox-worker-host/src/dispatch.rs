use std::sync::Mutex;

use async_trait::async_trait;
use sandbox_protocol::MethodOutcome;

/// What a worker process actually runs once a `MethodInvocation` arrives:
/// invoking the configured implementation.
///
/// A real embedding resolves `implementation_locator` /
/// `implementation_type_name` to a concrete handler (a plugin, a loaded
/// assembly, a registered closure); this crate ships only the lookup and a
/// test-harness implementation exercising a handful of canned scenarios.
#[async_trait]
pub trait WorkerImplementation: Send + Sync {
    async fn invoke(
        &self,
        method: &str,
        parameter_type_tags: &[String],
        parameter_payloads: Vec<Vec<u8>>,
    ) -> MethodOutcome;
}

/// Resolves `(implementation_locator, implementation_type_name)` to a
/// handler. Exit code 3 (implementation-load failure) is raised by the
/// caller when this returns `None`.
pub fn resolve_implementation(
    locator: &str,
    type_name: &str,
) -> Option<Box<dyn WorkerImplementation>> {
    match (locator, type_name) {
        ("builtin", "TestHarness") => Some(Box::new(TestHarnessImplementation::default())),
        _ => None,
    }
}

/// A small in-process implementation for end-to-end testing: `echo` returns
/// its first argument unchanged, `leak` accumulates memory in-process,
/// `slow` sleeps long enough to trigger `MethodCallTimeout`, and `crash`
/// aborts the process to simulate an unrecoverable worker failure.
#[derive(Default)]
pub struct TestHarnessImplementation {
    leaked: Mutex<Vec<u8>>,
}

#[async_trait]
impl WorkerImplementation for TestHarnessImplementation {
    async fn invoke(
        &self,
        method: &str,
        _parameter_type_tags: &[String],
        parameter_payloads: Vec<Vec<u8>>,
    ) -> MethodOutcome {
        match method {
            "echo" => MethodOutcome::Success {
                payload: parameter_payloads.into_iter().next(),
                return_type_tag: Some("System.String".to_owned()),
            },
            "leak" => {
                let megabytes: usize = parameter_payloads
                    .first()
                    .and_then(|bytes| std::str::from_utf8(bytes).ok())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10);
                self.leaked
                    .lock()
                    .unwrap()
                    .extend(std::iter::repeat(0u8).take(megabytes * 1024 * 1024));
                MethodOutcome::Success {
                    payload: None,
                    return_type_tag: None,
                }
            }
            "slow" => {
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                MethodOutcome::Success {
                    payload: None,
                    return_type_tag: None,
                }
            }
            "crash" => {
                std::process::abort();
            }
            "fail" => MethodOutcome::Failure {
                kind: "InvalidOperationException".to_owned(),
                message: "the test harness implementation was asked to fail".to_owned(),
                stack: None,
            },
            other => MethodOutcome::Failure {
                kind: "MethodNotFound".to_owned(),
                message: format!("no such method: {other}"),
                stack: None,
            },
        }
    }
}
