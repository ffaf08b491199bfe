use std::sync::Arc;
use std::time::Duration;

use sandbox_ipc::{CancelSignal, DuplexChannel, RequestResponseChannel};
use sandbox_protocol::{Invocation, MethodOutcome, MethodResultMessage, WireMessage};
use uuid::Uuid;

fn endpoint_name(test_name: &str) -> String {
    format!("sandbox-ipc-test-{test_name}-{}", Uuid::new_v4())
}

#[tokio::test]
async fn echoes_a_single_request() {
    let endpoint = endpoint_name("echo");
    let server_endpoint = endpoint.clone();

    let server_task = tokio::spawn(async move {
        let duplex = DuplexChannel::serve_one(&server_endpoint, Duration::from_secs(5))
            .await
            .expect("server accepts a connection");
        let invocation = match duplex.receive().await.expect("receive invocation") {
            Some(WireMessage::MethodInvocation(inv)) => inv,
            other => panic!("expected MethodInvocation, got {other:?}"),
        };
        let result = MethodResultMessage {
            correlation_id: invocation.correlation_id,
            outcome: MethodOutcome::Success {
                payload: invocation.parameter_payloads.first().cloned(),
                return_type_tag: Some("System.String".to_owned()),
            },
        };
        duplex
            .send(&WireMessage::MethodResult(result))
            .await
            .expect("send result");
    });

    // Give the listener a moment to bind before the client dials in.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client_duplex = Arc::new(
        DuplexChannel::connect(&endpoint, Duration::from_secs(5))
            .await
            .expect("client connects"),
    );
    let request_response = RequestResponseChannel::new(client_duplex);

    let invocation = Invocation {
        correlation_id: Uuid::new_v4(),
        method: "echo".to_owned(),
        parameter_type_tags: vec!["System.String".to_owned()],
        parameter_payloads: vec![b"hello".to_vec()],
        timeout_ms: 5_000,
    };

    let result = request_response
        .send_request(invocation, &CancelSignal::new())
        .await
        .expect("request succeeds");

    match result.outcome {
        MethodOutcome::Success { payload, .. } => {
            assert_eq!(payload.as_deref(), Some(&b"hello"[..]));
        }
        MethodOutcome::Failure { kind, message, .. } => {
            panic!("unexpected failure: {kind}: {message}")
        }
    }

    server_task.await.expect("server task completes");
}

#[tokio::test]
async fn second_concurrent_request_is_rejected() {
    let endpoint = endpoint_name("concurrency");
    let server_endpoint = endpoint.clone();

    let server_task = tokio::spawn(async move {
        let duplex = DuplexChannel::serve_one(&server_endpoint, Duration::from_secs(5))
            .await
            .expect("server accepts a connection");
        // Receive but never respond, to keep the slot occupied.
        let _ = duplex.receive().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let client_duplex = Arc::new(
        DuplexChannel::connect(&endpoint, Duration::from_secs(5))
            .await
            .expect("client connects"),
    );
    let request_response = Arc::new(RequestResponseChannel::new(client_duplex));

    let first_invocation = Invocation {
        correlation_id: Uuid::new_v4(),
        method: "slow".to_owned(),
        parameter_type_tags: vec![],
        parameter_payloads: vec![],
        timeout_ms: 1_000,
    };

    let rr_clone = Arc::clone(&request_response);
    let first = tokio::spawn(async move {
        rr_clone
            .send_request(first_invocation, &CancelSignal::new())
            .await
    });

    // Give the first request time to occupy the single-flight slot.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second_invocation = Invocation {
        correlation_id: Uuid::new_v4(),
        method: "slow".to_owned(),
        parameter_type_tags: vec![],
        parameter_payloads: vec![],
        timeout_ms: 1_000,
    };
    let second = request_response
        .send_request(second_invocation, &CancelSignal::new())
        .await;

    assert!(matches!(
        second,
        Err(sandbox_ipc::IpcError::ConcurrencyViolation)
    ));

    first.abort();
    server_task.abort();
}
