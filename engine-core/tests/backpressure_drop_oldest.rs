//! Exercises `BackpressureQueue` with `DropOldest` directly (as a queue, not
//! wired through a pool) and then through a pool using a custom queue.

use std::time::Duration;

use engine_core::{
    BackpressureConfig, BackpressurePolicy, BackpressureQueue, Job, JobQueue, PressureLevel,
};

fn job(name: &str) -> Job {
    Job::new(name, || Ok(()))
}

#[test]
fn drop_oldest_keeps_queue_at_capacity_under_sustained_overflow() {
    let q = BackpressureQueue::new(BackpressureConfig {
        max_size: 4,
        policy: BackpressurePolicy::DropOldest,
        ..Default::default()
    });

    for i in 0..20 {
        q.enqueue(job(&format!("job-{i}"))).unwrap();
    }

    assert_eq!(q.size(), 4);
    assert_eq!(q.stats().jobs_dropped, 16);
    assert_eq!(q.stats().jobs_accepted, 20);

    // The 4 survivors must be the most recently submitted ones, in order.
    let mut names = Vec::new();
    while let Ok(j) = q.try_dequeue() {
        names.push(j.name().unwrap().to_string());
    }
    assert_eq!(names, vec!["job-16", "job-17", "job-18", "job-19"]);
}

#[test]
fn pressure_level_reaches_critical_once_full_and_drops_on_drain() {
    let q = BackpressureQueue::new(BackpressureConfig {
        max_size: 4,
        high_watermark: 0.75,
        low_watermark: 0.25,
        policy: BackpressurePolicy::DropOldest,
        ..Default::default()
    });

    for i in 0..4 {
        q.enqueue(job(&format!("job-{i}"))).unwrap();
    }
    assert_eq!(q.pressure_level(), PressureLevel::Critical);

    // Overflowing further keeps it full (and at Critical), never erroring.
    q.enqueue(job("overflow")).unwrap();
    assert_eq!(q.size(), 4);
    assert_eq!(q.pressure_level(), PressureLevel::Critical);

    q.try_dequeue().unwrap();
    q.try_dequeue().unwrap();
    q.try_dequeue().unwrap();
    assert!(q.pressure_level() < PressureLevel::Critical);
}

#[test]
fn stop_prevents_further_enqueue_but_drains_remaining_jobs() {
    let q = BackpressureQueue::new(BackpressureConfig {
        max_size: 4,
        policy: BackpressurePolicy::DropOldest,
        ..Default::default()
    });
    q.enqueue(job("a")).unwrap();
    q.enqueue(job("b")).unwrap();
    q.stop();

    assert!(q.enqueue(job("c")).is_err());
    assert_eq!(q.try_dequeue().unwrap().name(), Some("a"));
    assert_eq!(q.try_dequeue().unwrap().name(), Some("b"));

    // block_timeout default is short enough that a blocking dequeue on an
    // empty, stopped queue resolves promptly rather than hanging forever.
    std::thread::sleep(Duration::from_millis(1));
    assert!(q.try_dequeue().is_err());
}
