use bytes::Bytes;

use crate::error::WireCodecError;
use crate::message::{
    HealthReport, Invocation, MessageType, MethodResultMessage, WireEnvelope, WireMessage,
};

/// Encodes a [`WireMessage`] into the self-describing envelope
/// `{message_type, payload, timestamp}`. `timestamp_ms` is caller-supplied so
/// this module stays free of a wall-clock dependency (matches the reference
/// framework's practice of threading time through rather than calling
/// `SystemTime::now()` deep in a codec).
pub fn encode_message(message: &WireMessage, timestamp_ms: u64) -> Result<Bytes, WireCodecError> {
    let payload = match message {
        WireMessage::MethodInvocation(inv) => rmp_serde::to_vec_named(inv)?,
        WireMessage::MethodResult(res) => rmp_serde::to_vec_named(res)?,
        WireMessage::HealthReport(report) => rmp_serde::to_vec_named(report)?,
        WireMessage::Shutdown | WireMessage::Ping | WireMessage::Pong => Vec::new(),
    };
    let envelope = WireEnvelope {
        message_type: message.message_type() as u8,
        payload,
        timestamp: timestamp_ms,
    };
    Ok(Bytes::from(rmp_serde::to_vec_named(&envelope)?))
}

/// Decodes one envelope into a [`WireMessage`]. An unknown discriminant is
/// always a hard error, never a silent drop.
pub fn decode_message(bytes: &[u8]) -> Result<WireMessage, WireCodecError> {
    let envelope: WireEnvelope = rmp_serde::from_slice(bytes)?;
    let message_type = MessageType::from_u8(envelope.message_type)
        .ok_or(WireCodecError::UnknownDiscriminant(envelope.message_type))?;
    Ok(match message_type {
        MessageType::MethodInvocation => {
            WireMessage::MethodInvocation(rmp_serde::from_slice::<Invocation>(&envelope.payload)?)
        }
        MessageType::MethodResult => WireMessage::MethodResult(rmp_serde::from_slice::<
            MethodResultMessage,
        >(&envelope.payload)?),
        MessageType::HealthReport => {
            WireMessage::HealthReport(rmp_serde::from_slice::<HealthReport>(&envelope.payload)?)
        }
        MessageType::Shutdown => WireMessage::Shutdown,
        MessageType::Ping => WireMessage::Ping,
        MessageType::Pong => WireMessage::Pong,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MethodOutcome, MethodResultMessage};
    use proptest::prelude::*;
    use uuid::Uuid;

    #[test]
    fn method_invocation_round_trips() {
        let invocation = Invocation {
            correlation_id: Uuid::new_v4(),
            method: "echo".to_owned(),
            parameter_type_tags: vec!["System.String".to_owned()],
            parameter_payloads: vec![b"hello".to_vec()],
            timeout_ms: 30_000,
        };
        let encoded =
            encode_message(&WireMessage::MethodInvocation(invocation.clone()), 42).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, WireMessage::MethodInvocation(invocation));
    }

    #[test]
    fn method_result_failure_round_trips() {
        let result = MethodResultMessage {
            correlation_id: Uuid::new_v4(),
            outcome: MethodOutcome::Failure {
                kind: "MethodNotFound".to_owned(),
                message: "no such method".to_owned(),
                stack: None,
            },
        };
        let encoded = encode_message(&WireMessage::MethodResult(result.clone()), 0).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, WireMessage::MethodResult(result));
    }

    #[test]
    fn control_messages_round_trip() {
        for msg in [WireMessage::Shutdown, WireMessage::Ping, WireMessage::Pong] {
            let encoded = encode_message(&msg, 7).unwrap();
            let decoded = decode_message(&encoded).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn unknown_discriminant_is_a_hard_error() {
        let envelope = WireEnvelope {
            message_type: 200,
            payload: Vec::new(),
            timestamp: 0,
        };
        let encoded = rmp_serde::to_vec_named(&envelope).unwrap();
        let result = decode_message(&encoded);
        assert!(matches!(
            result,
            Err(WireCodecError::UnknownDiscriminant(200))
        ));
    }

    proptest! {
        #[test]
        fn invocation_round_trip_arbitrary(
            method in "[a-zA-Z_][a-zA-Z0-9_]{0,32}",
            tags in proptest::collection::vec("[a-zA-Z.]{1,16}", 0..4),
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..32), 0..4),
            timeout_ms in 0u64..1_000_000,
        ) {
            let invocation = Invocation {
                correlation_id: Uuid::new_v4(),
                method,
                parameter_type_tags: tags,
                parameter_payloads: payloads,
                timeout_ms,
            };
            let encoded = encode_message(&WireMessage::MethodInvocation(invocation.clone()), 1).unwrap();
            let decoded = decode_message(&encoded).unwrap();
            prop_assert_eq!(decoded, WireMessage::MethodInvocation(invocation));
        }
    }
}
