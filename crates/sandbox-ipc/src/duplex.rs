use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use interprocess::local_socket::tokio::{Listener, Stream};
use interprocess::local_socket::{GenericNamespaced, ListenerOptions, ToNsName};
use sandbox_protocol::{decode_message, encode_message, frame, WireMessage};
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::IpcError;

/// Why a [`DuplexChannel`] stopped serving traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close()` was called locally.
    LocalClose,
    /// The peer closed its write half (clean EOF).
    PeerClosed,
    /// A read or write failed.
    IoError(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::LocalClose => write!(f, "closed locally"),
            DisconnectReason::PeerClosed => write!(f, "peer closed"),
            DisconnectReason::IoError(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Disconnect notification payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub reason: DisconnectReason,
    pub expected: bool,
}

/// One duplex, message-oriented byte stream linking the host to one worker.
///
/// # Why
/// The pool and the worker process need a connection-oriented, ordered
/// byte stream that survives being torn down by either side without
/// wedging the other — a raw OS pipe handle gives none of that for free,
/// so this type layers a background reader, a disconnect notification, and
/// idempotent close on top.
///
/// # Architecture
/// Both realizations — server-side (awaits one client) and client-side
/// (connects with a bounded timeout) — are constructed
/// through [`DuplexChannel::serve_one`] and [`DuplexChannel::connect`]
/// respectively; both return the same type because past the handshake they
/// behave identically. A background task owns the read half and decodes
/// frames into an `mpsc` channel; the write half is wrapped in its own
/// async lock so concurrent senders serialize rather than interleave bytes.
///
/// # Contract
/// - Writes are serialized behind a single async lock (one at a time);
///   `receive` is single-consumer by contract — the
///   [`crate::request_response`] layer is the only caller that should ever
///   call it.
/// - Any I/O failure transitions the channel to disconnected exactly once
///   and fires the `disconnected` watch exactly once, regardless of how
///   many operations observe the failure.
/// - `close` is idempotent: calling it after the channel is already
///   disconnected is a no-op, not an error.
pub struct DuplexChannel {
    id: String,
    writer: AsyncMutex<WriteHalf<Stream>>,
    inbound: AsyncMutex<mpsc::Receiver<Result<WireMessage, IpcError>>>,
    connected: Arc<AtomicBool>,
    disconnect_tx: watch::Sender<Option<DisconnectEvent>>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl DuplexChannel {
    /// Server-side realization: binds `endpoint_name` and waits for exactly
    /// one client connection within `connect_timeout`.
    pub async fn serve_one(
        endpoint_name: &str,
        connect_timeout: Duration,
    ) -> Result<Self, IpcError> {
        let listener = BoundListener::bind(endpoint_name)?;
        listener.accept_one(connect_timeout).await
    }

    /// Client-side realization: connects to `endpoint_name` within `timeout`.
    pub async fn connect(endpoint_name: &str, connect_timeout: Duration) -> Result<Self, IpcError> {
        let name = endpoint_name
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| IpcError::Io(err))?;
        let stream = timeout(connect_timeout, Stream::connect(name))
            .await
            .map_err(|_| IpcError::ConnectTimeout {
                endpoint: endpoint_name.to_owned(),
                timeout_ms: connect_timeout.as_millis() as u64,
            })?
            .map_err(IpcError::Io)?;
        Ok(Self::from_stream(format!("client:{endpoint_name}"), stream))
    }

    fn from_stream(id: String, stream: Stream) -> Self {
        let (read_half, write_half) = split(stream);
        let (inbound_tx, inbound_rx) = mpsc::channel(1);
        let connected = Arc::new(AtomicBool::new(true));
        let (disconnect_tx, _) = watch::channel(None);

        let reader_task = tokio::spawn(Self::reader_loop(
            id.clone(),
            read_half,
            inbound_tx,
            Arc::clone(&connected),
            disconnect_tx.clone(),
        ));

        Self {
            id,
            writer: AsyncMutex::new(write_half),
            inbound: AsyncMutex::new(inbound_rx),
            connected,
            disconnect_tx,
            reader_task,
        }
    }

    async fn reader_loop(
        id: String,
        mut read_half: ReadHalf<Stream>,
        inbound_tx: mpsc::Sender<Result<WireMessage, IpcError>>,
        connected: Arc<AtomicBool>,
        disconnect_tx: watch::Sender<Option<DisconnectEvent>>,
    ) {
        loop {
            match frame::read_frame(&mut read_half, frame::DEFAULT_MAX_FRAME_LEN).await {
                Ok(None) => {
                    debug!(channel = %id, "peer closed duplex channel");
                    mark_disconnected(&connected, &disconnect_tx, DisconnectReason::PeerClosed, true);
                    break;
                }
                Ok(Some(bytes)) => match decode_message(&bytes) {
                    Ok(message) => {
                        if inbound_tx.send(Ok(message)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(channel = %id, error = %err, "wire codec decode failure");
                        let _ = inbound_tx.send(Err(err.into())).await;
                        mark_disconnected(
                            &connected,
                            &disconnect_tx,
                            DisconnectReason::IoError(err.to_string()),
                            false,
                        );
                        break;
                    }
                },
                Err(err) => {
                    warn!(channel = %id, error = %err, "duplex channel read failure");
                    let reason = DisconnectReason::IoError(err.to_string());
                    let _ = inbound_tx.send(Err(IpcError::from(err))).await;
                    mark_disconnected(&connected, &disconnect_tx, reason, false);
                    break;
                }
            }
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Subscribe to the disconnect notification. Fires at most once.
    pub fn subscribe_disconnect(&self) -> watch::Receiver<Option<DisconnectEvent>> {
        self.disconnect_tx.subscribe()
    }

    /// Sends one message. Writes are serialized behind an internal lock.
    pub async fn send(&self, message: &WireMessage) -> Result<(), IpcError> {
        if !self.is_connected() {
            return Err(IpcError::Disconnected {
                channel_id: self.id.clone(),
                reason: "send on disconnected channel".to_owned(),
            });
        }
        let encoded = encode_message(message, now_millis())?;
        let mut guard = self.writer.lock().await;
        frame::write_frame(&mut *guard, &encoded).await?;
        Ok(())
    }

    /// Receives the next message. Single-consumer by contract. Returns
    /// `Ok(None)` once the peer has closed cleanly and no further
    /// messages remain.
    pub async fn receive(&self) -> Result<Option<WireMessage>, IpcError> {
        let mut guard = self.inbound.lock().await;
        match guard.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    /// Graceful close: best-effort `Shutdown` send, then disconnect.
    /// Idempotent — repeated calls are no-ops once already disconnected.
    /// Errors during close are swallowed: a shutdown notification is a
    /// courtesy to the peer, not a guarantee.
    pub async fn close(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let encoded = match encode_message(&WireMessage::Shutdown, now_millis()) {
            Ok(bytes) => Some(bytes),
            Err(_) => None,
        };
        if let Some(encoded) = encoded {
            let mut guard = self.writer.lock().await;
            let _ = frame::write_frame(&mut *guard, &encoded).await;
            let _ = guard.shutdown().await;
        }
        let _ = self.disconnect_tx.send(Some(DisconnectEvent {
            reason: DisconnectReason::LocalClose,
            expected: true,
        }));
        self.reader_task.abort();
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn mark_disconnected(
    connected: &AtomicBool,
    disconnect_tx: &watch::Sender<Option<DisconnectEvent>>,
    reason: DisconnectReason,
    expected: bool,
) {
    if connected.swap(false, Ordering::AcqRel) {
        let _ = disconnect_tx.send(Some(DisconnectEvent { reason, expected }));
    }
}

/// A listener bound to an endpoint but not yet accepting, so a caller can
/// signal readiness (e.g. print a sentinel line) between bind and accept
/// without racing a peer that connects the instant the bind completes.
pub struct BoundListener {
    listener: Listener,
    endpoint_name: String,
}

impl BoundListener {
    pub fn bind(endpoint_name: &str) -> Result<Self, IpcError> {
        let name = endpoint_name
            .to_ns_name::<GenericNamespaced>()
            .map_err(IpcError::Io)?;
        let listener = ListenerOptions::new()
            .name(name)
            .create_tokio()
            .map_err(IpcError::Io)?;
        Ok(Self {
            listener,
            endpoint_name: endpoint_name.to_owned(),
        })
    }

    pub async fn accept_one(&self, connect_timeout: Duration) -> Result<DuplexChannel, IpcError> {
        let stream = timeout(connect_timeout, self.listener.accept())
            .await
            .map_err(|_| IpcError::ConnectTimeout {
                endpoint: self.endpoint_name.clone(),
                timeout_ms: connect_timeout.as_millis() as u64,
            })?
            .map_err(IpcError::Io)?;
        Ok(DuplexChannel::from_stream(
            format!("server:{}", self.endpoint_name),
            stream,
        ))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
