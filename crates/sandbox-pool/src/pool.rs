use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sandbox_ipc::CancelSignal;
use sandbox_protocol::{Invocation, MethodResultMessage};
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::{info, warn};

use crate::config::WorkerPoolConfig;
use crate::error::PoolError;
use crate::probe::{DefaultResourceProbe, ResourceProbe};
use crate::worker::{Worker, WorkerId, WorkerState};

/// Lifecycle events a pool fires as workers move through their state
/// machine. Subscribers (e.g. a host application's diagnostics page) see
/// these as they happen rather than polling [`WorkerPool::stats`].
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Spawned { worker_id: WorkerId },
    Ready { worker_id: WorkerId },
    Recycled { worker_id: WorkerId, reason: String },
    Failed { worker_id: WorkerId, reason: String },
    Terminated { worker_id: WorkerId },
}

/// Point-in-time snapshot of pool occupancy.
///
/// `total` is every worker the pool currently holds, healthy or not yet
/// proven so; `healthy` is the subset that is idle or actively servicing a
/// call; `busy` and `available` partition `healthy` by whether a call is
/// currently checked out against the worker. `total_calls` is the
/// cumulative count of invocations dispatched since the pool started, and
/// `average_working_set_mb` is the mean of the live probe readings taken
/// across the currently idle workers (`0.0` if none could be sampled).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolStats {
    pub total: usize,
    pub healthy: usize,
    pub busy: usize,
    pub available: usize,
    pub total_calls: u64,
    pub average_working_set_mb: f64,
}

/// Supervises a bounded set of [`Worker`] processes and dispatches
/// invocations to them.
///
/// # Why
/// - Spawning a fresh OS process per call is too slow for a request path;
///   reusing a small, bounded set of warm workers amortizes spawn and
///   readiness-handshake cost across many calls.
/// - Pool capacity doubles as a back-pressure mechanism: the request
///   throttle's permit count equals `max_pool_size`, so a caller that can't
///   get a worker within its own timeout budget fails fast with
///   [`PoolError::PoolExhausted`] instead of queuing unboundedly.
///
/// # Architecture
/// - `workers` holds every `Ready` worker not currently checked out;
///   `checked_out` and `call_counter` are atomics so [`Self::stats`] can be
///   read without contending the worker list lock.
/// - `request_throttle` bounds concurrent in-flight calls to `max_pool_size`;
///   `startup_throttle` separately bounds concurrent spawns to
///   `startup_concurrency`, so a burst of on-demand spawns can't itself
///   starve the host's process table.
/// - `probe` is behind a trait object so the recycle predicate's resource
///   check is swappable in tests without touching pool logic.
///
/// # Contract
/// - A worker is owned by exactly one of: the `workers` vec, or a single
///   in-flight [`Self::call_once`] invocation. It is never visible to two
///   callers at once.
/// - `shutdown` is the only way to stop accepting new acquisitions; once
///   `shutting_down` is set, `call` fails immediately rather than attempting
///   checkout.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    workers: Mutex<Vec<Worker>>,
    checked_out: AtomicU64,
    request_throttle: Semaphore,
    startup_throttle: Semaphore,
    probe: Arc<dyn ResourceProbe>,
    events_tx: broadcast::Sender<WorkerEvent>,
    call_counter: AtomicU64,
    shutting_down: std::sync::atomic::AtomicBool,
}

impl WorkerPool {
    /// Validates `config` and spawns `min_pool_size` workers up front, at
    /// most `startup_concurrency` at a time.
    pub async fn start(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let (events_tx, _) = broadcast::channel(256);
        let pool = Self {
            request_throttle: Semaphore::new(config.max_pool_size),
            startup_throttle: Semaphore::new(config.startup_concurrency),
            probe: Arc::new(DefaultResourceProbe),
            workers: Mutex::new(Vec::with_capacity(config.max_pool_size)),
            checked_out: AtomicU64::new(0),
            call_counter: AtomicU64::new(0),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
            config,
            events_tx,
        };

        let mut handles = Vec::new();
        for _ in 0..pool.config.min_pool_size {
            handles.push(pool.spawn_worker());
        }
        for result in futures::future::join_all(handles).await {
            result?;
        }
        Ok(pool)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events_tx.subscribe()
    }

    pub async fn stats(&self) -> PoolStats {
        let workers = self.workers.lock().await;
        let ready: Vec<&Worker> = workers
            .iter()
            .filter(|w| w.state() == WorkerState::Ready)
            .collect();
        let busy = self.checked_out.load(Ordering::Acquire) as usize;
        let available = ready.len();
        let healthy = available + busy;

        let readings: Vec<u64> = ready
            .iter()
            .filter_map(|w| w.resource_usage(self.probe.as_ref()))
            .map(|usage| usage.working_set_mb)
            .collect();
        let average_working_set_mb = if readings.is_empty() {
            0.0
        } else {
            readings.iter().sum::<u64>() as f64 / readings.len() as f64
        };

        PoolStats {
            total: workers.len() + busy,
            healthy,
            busy,
            available,
            total_calls: self.call_counter.load(Ordering::Acquire),
            average_working_set_mb,
        }
    }

    async fn spawn_worker(&self) -> Result<(), PoolError> {
        let _permit = self
            .startup_throttle
            .acquire()
            .await
            .expect("startup semaphore is never closed");
        let worker = Worker::spawn(&self.config).await?;
        let worker_id = worker.id;
        self.workers.lock().await.push(worker);
        let _ = self.events_tx.send(WorkerEvent::Spawned { worker_id });
        let _ = self.events_tx.send(WorkerEvent::Ready { worker_id });
        Ok(())
    }

    /// Dispatches one invocation through a pooled worker.
    ///
    /// # Why
    /// A worker that has never completed a call can fail for reasons that
    /// have nothing to do with the invocation itself — a startup race where
    /// the readiness sentinel landed but the channel wasn't quite settled
    /// yet, for instance. Those failures are worth one transparent retry
    /// against a different worker. A worker that has already served at
    /// least one call is presumed healthy, so a failure there is either a
    /// genuine fault in the call or the method itself isn't safe to retry —
    /// either way it must surface immediately rather than risk re-running a
    /// non-idempotent method.
    ///
    /// # How
    /// `call_once` reports, alongside any error, whether the failing worker
    /// had a call count of zero *before* this attempt. `call` only loops
    /// when that flag is set, inserting `attempt * 10ms` of backoff between
    /// tries (no wait before the first retry attempt) and giving up after
    /// `max_retry_attempts`.
    ///
    /// # Contract
    /// - Acquiring a worker is bounded by `invocation.timeout_ms`: a caller
    ///   that can't get one within its own patience budget sees
    ///   [`PoolError::PoolExhausted`] rather than blocking indefinitely.
    /// - Remote invocation failures are not surfaced as a [`PoolError`] at
    ///   all (see [`crate::InvocationError::RemoteInvocation`] in the
    ///   pipeline layer above this one) and so never enter this retry loop;
    ///   everything `call` sees here is a transport- or process-level fault.
    pub async fn call(
        &self,
        invocation: Invocation,
        cancel: &CancelSignal,
    ) -> Result<MethodResultMessage, PoolError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(PoolError::PoolExhausted);
        }

        // The invocation's own timeout doubles as the acquire deadline: a
        // caller who cannot get a worker within its own patience budget sees
        // `PoolExhausted` rather than a separate, uncapped wait for pool
        // capacity.
        let _permit = match tokio::time::timeout(
            Duration::from_millis(invocation.timeout_ms),
            self.request_throttle.acquire(),
        )
        .await
        {
            Ok(permit) => permit.expect("request throttle is never closed"),
            Err(_) => return Err(PoolError::PoolExhausted),
        };

        let mut last_err = None;
        for attempt in 0..self.config.max_retry_attempts.max(1) {
            match self.call_once(invocation.clone(), cancel).await {
                Ok(result) => return Ok(result),
                Err((err, retryable)) => {
                    last_err = Some(err);
                    if !retryable {
                        break;
                    }
                    warn!(attempt, "worker's first call failed, retrying against a fresh worker");
                    if attempt > 0 {
                        tokio::time::sleep(Duration::from_millis(10 * attempt as u64)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(PoolError::PoolExhausted))
    }

    /// Runs one invocation against a checked-out worker. Returns, on
    /// failure, whether the call is eligible for the transparent retry in
    /// [`Self::call`] — true only if this was the worker's first call ever.
    async fn call_once(
        &self,
        invocation: Invocation,
        cancel: &CancelSignal,
    ) -> Result<MethodResultMessage, (PoolError, bool)> {
        let mut worker = self.checkout_worker().await.map_err(|err| (err, false))?;
        self.checked_out.fetch_add(1, Ordering::AcqRel);

        let was_first_call = worker.call_count() == 0;
        let result = worker.invoke(invocation, cancel).await;
        let call_index = self.call_counter.fetch_add(1, Ordering::AcqRel);
        self.checked_out.fetch_sub(1, Ordering::AcqRel);

        let should_recycle = result.is_err()
            || !worker.is_healthy()
            || self.should_recycle(&worker, call_index);

        if should_recycle {
            let worker_id = worker.id;
            let reason = if result.is_err() {
                "invocation failed".to_owned()
            } else {
                "recycle predicate matched".to_owned()
            };
            worker.stop(Duration::from_secs(5)).await;
            let _ = self.events_tx.send(WorkerEvent::Recycled {
                worker_id,
                reason: reason.clone(),
            });
            let _ = self.events_tx.send(WorkerEvent::Terminated { worker_id });
            if !self.shutting_down.load(Ordering::Acquire) {
                if let Err(err) = self.spawn_worker().await {
                    warn!(error = %err, "failed to replace recycled worker");
                }
            }
        } else {
            self.workers.lock().await.push(worker);
        }

        result.map_err(|err| (err, was_first_call))
    }

    /// 1-in-N sampling of the recycle predicate. A probe failure (the
    /// process could not be measured at all) is treated as the worker
    /// already being lost, forcing an unconditional recycle.
    fn should_recycle(&self, worker: &Worker, call_index: u64) -> bool {
        if self.config.process_recycle_threshold > 0
            && worker.call_count() >= self.config.process_recycle_threshold
        {
            return true;
        }
        if worker.age() >= self.config.max_process_lifetime {
            return true;
        }
        if call_index % self.config.recycle_check_calls != 0 {
            return false;
        }
        let Some(usage) = worker.resource_usage(self.probe.as_ref()) else {
            return true;
        };
        usage.working_set_mb > self.config.max_memory_mb
            || usage.gdi_handles > self.config.max_gdi_handles
            || usage.user_handles > self.config.max_user_handles
            || usage.total_handles > self.config.max_total_handles
    }

    async fn checkout_worker(&self) -> Result<Worker, PoolError> {
        {
            let mut workers = self.workers.lock().await;
            if let Some(index) = workers
                .iter_mut()
                .position(|w| w.state() == WorkerState::Ready && w.is_healthy())
            {
                return Ok(workers.swap_remove(index));
            }
        }

        let mut workers_len = self.workers.lock().await.len();
        for attempt in 0..self.config.max_acquire_attempts {
            if workers_len < self.config.max_pool_size {
                match Worker::spawn(&self.config).await {
                    Ok(worker) => {
                        let worker_id = worker.id;
                        let _ = self.events_tx.send(WorkerEvent::Spawned { worker_id });
                        let _ = self.events_tx.send(WorkerEvent::Ready { worker_id });
                        return Ok(worker);
                    }
                    Err(err) => {
                        warn!(attempt, error = %err, "failed to spawn worker on demand");
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
            workers_len = self.workers.lock().await.len();
        }
        Err(PoolError::PoolExhausted)
    }

    /// Stops every worker, waiting up to `deadline` for graceful exit before
    /// killing stragglers.
    pub async fn shutdown(&self, deadline: Duration) {
        self.shutting_down.store(true, Ordering::Release);
        let mut workers = self.workers.lock().await;
        for mut worker in workers.drain(..) {
            let worker_id = worker.id;
            worker.stop(deadline).await;
            let _ = self.events_tx.send(WorkerEvent::Terminated { worker_id });
        }
        info!("worker pool shut down");
    }
}
