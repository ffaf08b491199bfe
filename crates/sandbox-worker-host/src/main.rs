//! Worker-side entry point.
//!
//! Invoked by `sandbox_pool::worker::Worker::spawn` with a single
//! command-line argument: a base64-encoded JSON `WorkerConfig`. Listens on
//! the named endpoint, prints the readiness sentinel, accepts exactly one
//! connection, and services invocations until told to shut down or until
//! its parent process disappears.

mod dispatch;

use std::time::Duration;

use sandbox_ipc::BoundListener;
use sandbox_protocol::{MethodResultMessage, WireMessage};
use sandbox_pool::decode_worker_config;
use tracing::{error, info, warn};

const EXIT_OK: i32 = 0;
const EXIT_CONFIGURATION: i32 = 2;
const EXIT_IMPLEMENTATION_LOAD: i32 = 3;
const EXIT_OTHER: i32 = 99;

const READINESS_SENTINEL: &str = "PROCESS_SANDBOX_WORKER_READY";

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build worker tokio runtime");
    let exit_code = runtime.block_on(run());
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    let token = match std::env::args().nth(1) {
        Some(token) => token,
        None => {
            eprintln!("usage: sandbox-worker-host <base64-worker-config>");
            return EXIT_CONFIGURATION;
        }
    };

    let config = match decode_worker_config(&token) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid worker config: {err}");
            return EXIT_CONFIGURATION;
        }
    };

    init_tracing(config.verbose_logging);

    let implementation = match dispatch::resolve_implementation(
        &config.implementation_locator,
        &config.implementation_type_name,
    ) {
        Some(implementation) => implementation,
        None => {
            error!(
                locator = %config.implementation_locator,
                type_name = %config.implementation_type_name,
                "failed to resolve worker implementation"
            );
            return EXIT_IMPLEMENTATION_LOAD;
        }
    };

    let listener = match BoundListener::bind(&config.endpoint_name) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, "failed to bind worker endpoint");
            return EXIT_OTHER;
        }
    };

    println!("{READINESS_SENTINEL}");

    let duplex = match listener.accept_one(Duration::from_secs(300)).await {
        Ok(duplex) => duplex,
        Err(err) => {
            error!(error = %err, "failed to accept pool connection");
            return EXIT_OTHER;
        }
    };

    let parent_watch = watch_parent(config.parent_pid);

    info!(pid = std::process::id(), "worker ready, entering dispatch loop");
    let exit_code = loop {
        tokio::select! {
            message = duplex.receive() => match message {
                Ok(Some(WireMessage::MethodInvocation(invocation))) => {
                    let outcome = implementation
                        .invoke(
                            &invocation.method,
                            &invocation.parameter_type_tags,
                            invocation.parameter_payloads,
                        )
                        .await;
                    let result = MethodResultMessage {
                        correlation_id: invocation.correlation_id,
                        outcome,
                    };
                    if let Err(err) = duplex.send(&WireMessage::MethodResult(result)).await {
                        warn!(error = %err, "failed to send method result");
                        break EXIT_OTHER;
                    }
                }
                Ok(Some(WireMessage::Shutdown)) => {
                    info!("received shutdown, exiting");
                    break EXIT_OK;
                }
                Ok(Some(_other)) => {
                    warn!("ignoring unexpected message type in worker dispatch loop");
                }
                Ok(None) => {
                    info!("pool closed the channel, exiting");
                    break EXIT_OK;
                }
                Err(err) => {
                    error!(error = %err, "duplex channel error in worker dispatch loop");
                    break EXIT_OTHER;
                }
            },
            () = parent_watch.died() => {
                warn!("parent process is gone, exiting");
                break EXIT_OTHER;
            }
        }
    };

    duplex.close().await;
    exit_code
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .try_init();
}

struct ParentWatch {
    notify: tokio::sync::Notify,
}

impl ParentWatch {
    async fn died(&self) {
        self.notify.notified().await;
    }
}

/// Polls for parent liveness every second; `kill(pid, 0)` returns `ESRCH`
/// once the parent has exited.
fn watch_parent(parent_pid: u32) -> std::sync::Arc<ParentWatch> {
    let watch = std::sync::Arc::new(ParentWatch {
        notify: tokio::sync::Notify::new(),
    });
    let watch_clone = std::sync::Arc::clone(&watch);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if !parent_is_alive(parent_pid) {
                watch_clone.notify.notify_waiters();
                break;
            }
        }
    });
    watch
}

#[cfg(unix)]
fn parent_is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs no action beyond existence/permission checks.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn parent_is_alive(_pid: u32) -> bool {
    true
}
