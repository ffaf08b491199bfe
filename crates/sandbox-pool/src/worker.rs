use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use sandbox_ipc::{CancelSignal, DuplexChannel, IpcError, RequestResponseChannel};
use sandbox_protocol::{Invocation, MethodResultMessage, WireMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{WorkerConfig, WorkerPoolConfig};
use crate::error::PoolError;
use crate::probe::{ResourceProbe, ResourceUsage};

const READINESS_SENTINEL: &str = "PROCESS_SANDBOX_WORKER_READY";

/// Worker state machine:
/// `Spawning → Ready → Busy ⇄ Ready → (Draining | Failed) → Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Ready,
    Busy,
    Draining,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A single supervised worker process plus its channel.
///
/// # Why
/// The pool needs one object that owns both the OS process and the IPC
/// channel to it, so that a failure on either side (unexpected exit,
/// channel disconnect) can be observed and acted on uniformly rather than
/// tracked as two loosely related pieces of state.
///
/// # Architecture
/// Built on the request/response + readiness handshake pattern already
/// established in `sandbox-ipc`; this module adds process lifecycle
/// (spawn, readiness wait, forced termination) on top. `state` is advanced
/// by `Worker` itself as calls complete or fail; the pool only reads it
/// through [`Worker::state`] and [`Worker::is_healthy`].
///
/// # Contract
/// - `id` is stable for the worker's lifetime and never reused.
/// - Exactly one [`Worker::invoke`] may be in flight at a time; this is
///   enforced by the single-flight guarantee of the underlying
///   [`RequestResponseChannel`], not by `Worker` itself.
pub struct Worker {
    pub id: WorkerId,
    state: WorkerState,
    child: Child,
    request_response: Option<Arc<RequestResponseChannel>>,
    spawned_at: Instant,
    call_count: u64,
    pid: u32,
}

impl Worker {
    /// Spawns a fresh child process and drives it through `Spawning -> Ready`.
    ///
    /// # How
    /// 1. Encode a [`WorkerConfig`] as a single base64/JSON command-line
    ///    token (the worker can't be handed a richer argv without pinning
    ///    down a shell-quoting contract, so one opaque token keeps the
    ///    worker-side parsing trivial).
    /// 2. Launch the executable with stdout/stderr piped; stderr is drained
    ///    to the log in the background for the life of the process.
    /// 3. Wait for the readiness sentinel line on stdout, or child exit, or
    ///    `process_start_timeout`, whichever comes first.
    /// 4. Connect the duplex channel with whatever timeout budget remains.
    ///
    /// # Contract
    /// - Returns `Err` and leaves no running process behind on any failure
    ///   path up to and including the sentinel wait; `kill_on_drop` on the
    ///   spawned [`Command`] guarantees the child is reaped even if this
    ///   future is cancelled mid-wait.
    /// - On success the returned `Worker` is already `Ready` and has a live,
    ///   connected channel.
    pub async fn spawn(config: &WorkerPoolConfig) -> Result<Self, PoolError> {
        let endpoint_name = format!("sandbox-worker-{}", Uuid::new_v4());
        let worker_config = WorkerConfig {
            implementation_locator: config.implementation_locator.clone(),
            implementation_type_name: config.implementation_type_name.clone(),
            endpoint_name: endpoint_name.clone(),
            verbose_logging: config.verbose_worker_logging,
            parent_pid: std::process::id(),
        };
        let encoded = encode_worker_config(&worker_config)?;

        let mut command = Command::new(&config.worker_executable);
        command
            .arg(encoded)
            .args(&config.worker_extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| PoolError::WorkerStartup(format!("failed to spawn worker: {err}")))?;
        let pid = child.id().ok_or_else(|| {
            PoolError::WorkerStartup("worker exited before its pid could be read".to_owned())
        })?;

        let mut worker = Self {
            id: WorkerId::next(),
            state: WorkerState::Spawning,
            child,
            request_response: None,
            spawned_at: Instant::now(),
            call_count: 0,
            pid,
        };

        worker.drain_stderr_in_background();
        worker
            .await_readiness_and_connect(&endpoint_name, config.process_start_timeout)
            .await?;
        worker.state = WorkerState::Ready;
        info!(worker = %worker.id, pid, "worker ready");
        Ok(worker)
    }

    async fn await_readiness_and_connect(
        &mut self,
        endpoint_name: &str,
        deadline: Duration,
    ) -> Result<(), PoolError> {
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| PoolError::WorkerStartup("worker stdout not captured".to_owned()))?;
        let mut lines = BufReader::new(stdout).lines();

        let started = Instant::now();
        let sentinel_seen = timeout(deadline, async {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim_end() == READINESS_SENTINEL => return Ok(()),
                    Ok(Some(other)) => debug!(worker = %self.id, line = %other, "worker stdout"),
                    Ok(None) => {
                        return Err(PoolError::WorkerStartup(
                            "worker exited before printing the readiness sentinel".to_owned(),
                        ))
                    }
                    Err(err) => {
                        return Err(PoolError::WorkerStartup(format!(
                            "failed reading worker stdout: {err}"
                        )))
                    }
                }
            }
        })
        .await;

        match sentinel_seen {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(PoolError::WorkerStartup(format!(
                    "worker did not become ready within {:?}",
                    deadline
                )))
            }
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        let duplex = DuplexChannel::connect(endpoint_name, remaining)
            .await
            .map_err(|err| {
                PoolError::WorkerStartup(format!("failed to connect to worker channel: {err}"))
            })?;
        self.request_response = Some(Arc::new(RequestResponseChannel::new(Arc::new(duplex))));
        Ok(())
    }

    fn drain_stderr_in_background(&mut self) {
        let Some(stderr) = self.child.stderr.take() else {
            return;
        };
        let worker_id = self.id;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(worker = %worker_id, "{line}");
            }
        });
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    pub fn age(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    /// Sends one invocation to the worker and awaits its result. The worker
    /// is `Busy` for exactly the one in-flight invocation; a concurrent
    /// second call against the same `Worker` would violate the
    /// single-flight contract of the underlying request/response channel.
    pub async fn invoke(
        &mut self,
        invocation: Invocation,
        cancel: &CancelSignal,
    ) -> Result<MethodResultMessage, PoolError> {
        let request_response = self.request_response.clone().ok_or_else(|| {
            PoolError::WorkerCrashed("worker has no open channel".to_owned())
        })?;
        self.state = WorkerState::Busy;
        let result = request_response.send_request(invocation, cancel).await;
        self.call_count += 1;
        self.state = match &result {
            Ok(_) => WorkerState::Ready,
            Err(_) => WorkerState::Failed,
        };
        result.map_err(PoolError::from)
    }

    /// Whether the underlying process has exited and the channel is usable.
    pub fn is_healthy(&mut self) -> bool {
        if self.state == WorkerState::Failed || self.state == WorkerState::Terminated {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(_status)) => {
                self.state = WorkerState::Failed;
                false
            }
            Ok(None) => self
                .request_response
                .as_ref()
                .is_some_and(|rr| rr.duplex().is_connected()),
            Err(_) => false,
        }
    }

    /// Samples this worker's resource usage via `probe`. `None` means the
    /// probe could not measure the process at all, which callers must treat
    /// as the worker being lost rather than idle.
    pub fn resource_usage(&self, probe: &dyn ResourceProbe) -> Option<ResourceUsage> {
        probe.sample(self.pid)
    }

    /// Requests a clean shutdown, then kills if the worker does not exit
    /// promptly.
    pub async fn stop(&mut self, grace_period: Duration) {
        self.state = WorkerState::Draining;
        if let Some(request_response) = &self.request_response {
            let _ = request_response
                .duplex()
                .send(&WireMessage::Shutdown)
                .await;
            request_response.close().await;
        }
        if timeout(grace_period, self.child.wait()).await.is_err() {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
        self.state = WorkerState::Terminated;
    }
}

fn encode_worker_config(config: &WorkerConfig) -> Result<String, PoolError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| PoolError::Configuration(format!("failed to encode WorkerConfig: {err}")))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(json))
}

/// Decodes a `WorkerConfig` from the single base64/JSON command-line token
/// produced by [`encode_worker_config`]. Used by the worker-host binary.
pub fn decode_worker_config(token: &str) -> Result<WorkerConfig, IpcError> {
    let json = base64::engine::general_purpose::STANDARD
        .decode(token)
        .map_err(|err| IpcError::Disconnected {
            channel_id: "worker-config".to_owned(),
            reason: format!("invalid base64 worker config: {err}"),
        })?;
    serde_json::from_slice(&json).map_err(|err| IpcError::Disconnected {
        channel_id: "worker-config".to_owned(),
        reason: format!("invalid worker config json: {err}"),
    })
}
