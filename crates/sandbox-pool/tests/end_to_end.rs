use std::time::Duration;

use sandbox_ipc::CancelSignal;
use sandbox_pool::{MethodDescriptor, PoolError, WorkerPoolConfig};

fn test_config() -> WorkerPoolConfig {
    let executable = env!("CARGO_BIN_EXE_sandbox-worker-host");
    let mut config = WorkerPoolConfig::new("builtin", "TestHarness", executable);
    config.min_pool_size = 1;
    config.max_pool_size = 1;
    config.process_start_timeout = Duration::from_secs(10);
    config
}

fn echo_descriptor() -> MethodDescriptor {
    MethodDescriptor {
        name: "echo".to_owned(),
        parameter_type_tags: vec!["System.String".to_owned()],
        timeout_ms: 5_000,
    }
}

#[tokio::test]
async fn echo_one_hundred_times_on_a_single_worker() {
    let config = test_config();
    let pool = sandbox_pool::WorkerPool::start(config)
        .await
        .expect("pool starts");
    let pipeline = sandbox_pool::InvocationPipeline::new(&pool);
    let descriptor = echo_descriptor();
    let cancel = CancelSignal::new();

    for _ in 0..100 {
        let result = pipeline
            .invoke(&descriptor, vec![b"hello".to_vec()], &cancel)
            .await
            .expect("echo succeeds");
        assert_eq!(result.payload.as_deref(), Some(&b"hello"[..]));
    }

    let stats = pool.stats().await;
    assert_eq!(stats.total, 1);

    pool.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn crashed_worker_is_replaced_by_a_fresh_one() {
    let config = test_config();
    let pool = sandbox_pool::WorkerPool::start(config)
        .await
        .expect("pool starts");
    let pipeline = sandbox_pool::InvocationPipeline::new(&pool);
    let cancel = CancelSignal::new();

    let crash_descriptor = MethodDescriptor {
        name: "crash".to_owned(),
        parameter_type_tags: vec![],
        timeout_ms: 5_000,
    };
    let crash_result = pipeline.invoke(&crash_descriptor, vec![], &cancel).await;
    assert!(crash_result.is_err());

    let echo_result = pipeline
        .invoke(&echo_descriptor(), vec![b"alive".to_vec()], &cancel)
        .await
        .expect("a fresh worker services the next call");
    assert_eq!(echo_result.payload.as_deref(), Some(&b"alive"[..]));

    pool.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn slow_call_times_out_and_next_call_succeeds() {
    let mut config = test_config();
    config.method_call_timeout = Duration::from_millis(500);
    let pool = sandbox_pool::WorkerPool::start(config)
        .await
        .expect("pool starts");
    let pipeline = sandbox_pool::InvocationPipeline::new(&pool);
    let cancel = CancelSignal::new();

    let slow_descriptor = MethodDescriptor {
        name: "slow".to_owned(),
        parameter_type_tags: vec![],
        timeout_ms: 500,
    };

    let start = std::time::Instant::now();
    let slow_result = pipeline.invoke(&slow_descriptor, vec![], &cancel).await;
    assert!(slow_result.is_err());
    assert!(start.elapsed() < Duration::from_millis(1500));

    let echo_result = pipeline
        .invoke(&echo_descriptor(), vec![b"next".to_vec()], &cancel)
        .await
        .expect("next call succeeds on a new worker");
    assert_eq!(echo_result.payload.as_deref(), Some(&b"next"[..]));

    pool.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn pool_exhaustion_surfaces_when_the_single_worker_is_busy() {
    let mut config = test_config();
    config.method_call_timeout = Duration::from_secs(10);
    config.max_acquire_attempts = 2;
    let pool = std::sync::Arc::new(
        sandbox_pool::WorkerPool::start(config)
            .await
            .expect("pool starts"),
    );

    let slow_descriptor = MethodDescriptor {
        name: "slow".to_owned(),
        parameter_type_tags: vec![],
        timeout_ms: 10_000,
    };

    let pool_clone = std::sync::Arc::clone(&pool);
    let first = tokio::spawn(async move {
        let pipeline = sandbox_pool::InvocationPipeline::new(&pool_clone);
        pipeline
            .invoke(&slow_descriptor, vec![], &CancelSignal::new())
            .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;

    let second_descriptor = MethodDescriptor {
        name: "echo".to_owned(),
        parameter_type_tags: vec![],
        timeout_ms: 200,
    };
    let pipeline = sandbox_pool::InvocationPipeline::new(&pool);
    let second = pipeline
        .invoke(&second_descriptor, vec![], &CancelSignal::new())
        .await;
    assert!(matches!(
        second,
        Err(sandbox_pool::InvocationError::Pool(PoolError::PoolExhausted))
    ));

    let first_result = first.await.expect("first call task completes");
    assert!(first_result.is_ok());

    pool.shutdown(Duration::from_secs(5)).await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn repeated_leaks_eventually_recycle_the_worker() {
    let mut config = test_config();
    config.max_memory_mb = 50;
    config.recycle_check_calls = 1;
    let pool = sandbox_pool::WorkerPool::start(config)
        .await
        .expect("pool starts");
    let pipeline = sandbox_pool::InvocationPipeline::new(&pool);
    let cancel = CancelSignal::new();

    let leak_descriptor = MethodDescriptor {
        name: "leak".to_owned(),
        parameter_type_tags: vec![],
        timeout_ms: 5_000,
    };

    let mut events = pool.subscribe_events();
    for _ in 0..6 {
        pipeline
            .invoke(&leak_descriptor, vec![b"10".to_vec()], &cancel)
            .await
            .expect("leak call succeeds");
    }

    let mut recycled = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, sandbox_pool::WorkerEvent::Recycled { .. }) {
            recycled = true;
        }
    }
    assert!(recycled, "worker should have been recycled within 6 calls");

    pool.shutdown(Duration::from_secs(5)).await;
}
