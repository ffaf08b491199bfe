use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sandbox_protocol::{Invocation, MethodResultMessage, WireMessage};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::duplex::DuplexChannel;
use crate::error::IpcError;

struct PendingSlot {
    correlation_id: Uuid,
    responder: oneshot::Sender<Result<MethodResultMessage, IpcError>>,
}

/// Single-flight request/response wrapper over a [`DuplexChannel`].
///
/// At most one `send_request` may be outstanding at a time; a second
/// concurrent attempt fails immediately with
/// [`IpcError::ConcurrencyViolation`] rather than queuing, matching the
/// worker-process contract of servicing exactly one call at a time.
pub struct RequestResponseChannel {
    duplex: Arc<DuplexChannel>,
    slot: Arc<Mutex<Option<PendingSlot>>>,
    unusable: Arc<AtomicBool>,
    dispatch_task: JoinHandle<()>,
}

impl RequestResponseChannel {
    pub fn new(duplex: Arc<DuplexChannel>) -> Self {
        let slot: Arc<Mutex<Option<PendingSlot>>> = Arc::new(Mutex::new(None));
        let unusable = Arc::new(AtomicBool::new(false));
        let dispatch_task = tokio::spawn(Self::dispatch_loop(
            Arc::clone(&duplex),
            Arc::clone(&slot),
            Arc::clone(&unusable),
        ));
        Self {
            duplex,
            slot,
            unusable,
            dispatch_task,
        }
    }

    async fn dispatch_loop(
        duplex: Arc<DuplexChannel>,
        slot: Arc<Mutex<Option<PendingSlot>>>,
        unusable: Arc<AtomicBool>,
    ) {
        loop {
            match duplex.receive().await {
                Ok(Some(WireMessage::MethodResult(result))) => {
                    let pending = {
                        let mut guard = slot.lock();
                        match guard.take() {
                            Some(pending) if pending.correlation_id == result.correlation_id => {
                                Some(pending)
                            }
                            Some(other) => {
                                warn!(
                                    expected = %other.correlation_id,
                                    got = %result.correlation_id,
                                    "MethodResult correlation id mismatch; discarding and restoring slot"
                                );
                                *guard = Some(other);
                                None
                            }
                            None => None,
                        }
                    };
                    match pending {
                        Some(pending) => {
                            let _ = pending.responder.send(Ok(result));
                        }
                        None => debug!("MethodResult with no matching pending request; discarding"),
                    }
                }
                Ok(Some(WireMessage::Shutdown)) => {
                    debug!(channel = duplex.channel_id(), "peer requested shutdown");
                    fail_pending(&slot, &duplex, "peer requested shutdown");
                    duplex.close().await;
                    unusable.store(true, Ordering::Release);
                    break;
                }
                Ok(Some(_other)) => {
                    debug!("ignoring non-MethodResult message on request/response channel");
                }
                Ok(None) => {
                    fail_pending(&slot, &duplex, "peer closed duplex channel");
                    unusable.store(true, Ordering::Release);
                    break;
                }
                Err(err) => {
                    let mut guard = slot.lock();
                    if let Some(pending) = guard.take() {
                        let _ = pending.responder.send(Err(err));
                    }
                    drop(guard);
                    unusable.store(true, Ordering::Release);
                    break;
                }
            }
        }
    }

    /// Sends one invocation and awaits its result, enforcing single-flight.
    ///
    /// # Why
    /// The worker process services exactly one call at a time, so allowing
    /// two concurrent `send_request`s on the same channel would either
    /// silently interleave two unrelated responses or deadlock waiting for
    /// a slot that's already taken. Rejecting the second caller outright
    /// with [`IpcError::ConcurrencyViolation`] makes the violation visible
    /// immediately instead of producing a wrong answer somewhere downstream.
    ///
    /// # Contract
    /// - Cancellation before send is a no-op (the call still proceeds);
    ///   cancellation observed while awaiting the response fails the request
    ///   locally without affecting the worker, which the [`crate`] caller is
    ///   expected to discard rather than return to the pool.
    /// - `timeout_ms` on the invocation arms a local timer; on expiry the
    ///   pending slot is cleared and the call fails with
    ///   [`IpcError::MethodTimeout`] even though the worker may still be
    ///   executing.
    pub async fn send_request(
        &self,
        invocation: Invocation,
        cancel: &CancelSignal,
    ) -> Result<MethodResultMessage, IpcError> {
        if self.unusable.load(Ordering::Acquire) || !self.duplex.is_connected() {
            return Err(IpcError::Disconnected {
                channel_id: self.duplex.channel_id().to_owned(),
                reason: "channel is no longer usable".to_owned(),
            });
        }

        let correlation_id = invocation.correlation_id;
        let method = invocation.method.clone();
        let timeout_ms = invocation.timeout_ms;
        let (responder, response_rx) = oneshot::channel();

        {
            let mut guard = self.slot.lock();
            if guard.is_some() {
                return Err(IpcError::ConcurrencyViolation);
            }
            *guard = Some(PendingSlot {
                correlation_id,
                responder,
            });
        }

        if let Err(err) = self
            .duplex
            .send(&WireMessage::MethodInvocation(invocation))
            .await
        {
            self.clear_slot_if_matches(correlation_id);
            return Err(err);
        }

        let sleep = tokio::time::sleep(Duration::from_millis(timeout_ms));
        tokio::pin!(sleep);

        tokio::select! {
            result = response_rx => match result {
                Ok(inner) => inner,
                Err(_) => Err(IpcError::Disconnected {
                    channel_id: self.duplex.channel_id().to_owned(),
                    reason: "response slot dropped without a result".to_owned(),
                }),
            },
            () = &mut sleep => {
                self.clear_slot_if_matches(correlation_id);
                Err(IpcError::MethodTimeout { method, timeout_ms })
            }
            () = cancel.cancelled() => {
                self.clear_slot_if_matches(correlation_id);
                Err(IpcError::Disconnected {
                    channel_id: self.duplex.channel_id().to_owned(),
                    reason: "request cancelled locally".to_owned(),
                })
            }
        }
    }

    fn clear_slot_if_matches(&self, correlation_id: Uuid) {
        let mut guard = self.slot.lock();
        if matches!(&*guard, Some(pending) if pending.correlation_id == correlation_id) {
            *guard = None;
        }
    }

    pub fn duplex(&self) -> &Arc<DuplexChannel> {
        &self.duplex
    }

    pub async fn close(&self) {
        self.duplex.close().await;
        self.dispatch_task.abort();
    }
}

impl Drop for RequestResponseChannel {
    fn drop(&mut self) {
        self.dispatch_task.abort();
    }
}

fn fail_pending(slot: &Mutex<Option<PendingSlot>>, duplex: &DuplexChannel, reason: &str) {
    let mut guard = slot.lock();
    if let Some(pending) = guard.take() {
        let _ = pending.responder.send(Err(IpcError::Disconnected {
            channel_id: duplex.channel_id().to_owned(),
            reason: reason.to_owned(),
        }));
    }
}
