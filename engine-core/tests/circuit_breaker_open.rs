//! Drives jobs through a `ProtectedQueue` with a real consumer thread
//! (rather than calling `CircuitBreaker::record` directly) so the breaker's
//! state machine is exercised end-to-end: enqueue -> dequeue -> execute ->
//! on_complete -> record.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use engine_core::{
    BasicQueue, CircuitBreaker, CircuitBreakerConfig, EngineError, Job, JobQueue, ProtectedQueue,
};

fn config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        window_size: 20,
        min_calls: 3,
        failure_threshold: 0.5,
        open_duration: Duration::from_millis(30),
        half_open_probe_count: 1,
        success_threshold: 1,
    }
}

/// Spawns a consumer thread that dequeues and executes jobs (running their
/// `on_complete` hooks) until told to stop.
fn spawn_consumer(queue: Arc<dyn JobQueue>) -> (std::thread::JoinHandle<()>, Arc<std::sync::atomic::AtomicBool>) {
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let stop_for_thread = Arc::clone(&stop);
    let handle = std::thread::spawn(move || loop {
        match queue.try_dequeue() {
            Ok(job) => {
                let _ = job.execute();
            }
            Err(_) => {
                if stop_for_thread.load(Ordering::Acquire) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    });
    (handle, stop)
}

#[test]
fn breaker_opens_under_sustained_failures_and_rejects_new_work() {
    let queue: Arc<dyn JobQueue> = Arc::new(BasicQueue::new());
    let breaker = Arc::new(CircuitBreaker::new(config()));
    let protected = ProtectedQueue::new(Arc::clone(&queue), Arc::clone(&breaker));
    let (consumer, stop) = spawn_consumer(queue);

    for i in 0..3 {
        protected
            .enqueue_protected(Job::new(format!("fails-{i}"), || {
                Err(EngineError::InvalidArgument("boom".into()))
            }))
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(1);
    while breaker.state_label() != "open" && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(breaker.state_label(), "open");
    assert_eq!(breaker.trip_count(), 1);

    match protected.enqueue_protected(Job::new("rejected", || Ok(()))) {
        Err(EngineError::CircuitOpen) => {}
        other => panic!("expected CircuitOpen, got {other:?}"),
    }

    stop.store(true, Ordering::Release);
    consumer.join().unwrap();
}

#[test]
fn breaker_recovers_through_half_open_once_probes_succeed() {
    let queue: Arc<dyn JobQueue> = Arc::new(BasicQueue::new());
    let breaker = Arc::new(CircuitBreaker::new(config()));
    let protected = ProtectedQueue::new(Arc::clone(&queue), Arc::clone(&breaker));
    let (consumer, stop) = spawn_consumer(queue);

    for i in 0..3 {
        protected
            .enqueue_protected(Job::new(format!("fails-{i}"), || {
                Err(EngineError::InvalidArgument("boom".into()))
            }))
            .unwrap();
    }
    let deadline = Instant::now() + Duration::from_secs(1);
    while breaker.state_label() != "open" && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(breaker.state_label(), "open");

    // Wait out open_duration, then the next admitted call is a half-open probe.
    std::thread::sleep(Duration::from_millis(50));

    let succeeded = Arc::new(AtomicUsize::new(0));
    let succeeded_for_job = Arc::clone(&succeeded);
    protected
        .enqueue_protected(Job::new("probe", move || {
            succeeded_for_job.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(1);
    while breaker.state_label() != "closed" && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(breaker.state_label(), "closed");
    assert_eq!(succeeded.load(Ordering::SeqCst), 1);

    stop.store(true, Ordering::Release);
    consumer.join().unwrap();
}
