//! Drives sustained load through a small pool with `ScalingMode::Automatic`
//! and confirms the autoscaler grows the worker count on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use engine_core::{
    Autoscaler, AutoscalingPolicy, Job, Pool, PoolBuilder, ScaleDownConfig, ScaleUpConfig,
    ScalingMode,
};

fn policy() -> AutoscalingPolicy {
    AutoscalingPolicy {
        min_workers: 2,
        max_workers: 8,
        scale_up: ScaleUpConfig {
            utilization_threshold: 0.5,
            ..Default::default()
        },
        scale_down: ScaleDownConfig {
            utilization_threshold: 0.1,
            ..Default::default()
        },
        scale_up_increment: 2,
        sample_interval: Duration::from_millis(20),
        samples_for_decision: 2,
        scaling_mode: ScalingMode::Automatic,
        ..Default::default()
    }
}

#[test]
fn autoscaler_grows_worker_count_under_sustained_busy_load() {
    let pool = Arc::new(PoolBuilder::new().num_threads(2).build().unwrap());
    let scaler = Autoscaler::new(Arc::clone(&pool), policy()).unwrap();
    scaler.start();

    // Keep every worker continuously busy so utilization samples stay at 1.0
    // for long enough for the monitor loop to decide to scale up.
    let keep_busy = Arc::new(AtomicBool::new(true));
    for _ in 0..16 {
        let keep_busy = Arc::clone(&keep_busy);
        let _ = pool.submit(Job::new("busy", move || {
            while keep_busy.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }));
    }

    let deadline = Instant::now() + Duration::from_secs(3);
    while pool.worker_count() <= 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    assert!(
        pool.worker_count() > 2,
        "expected autoscaler to grow past the initial 2 workers, got {}",
        pool.worker_count()
    );
    assert!(scaler.get_stats().scale_up_count >= 1);

    keep_busy.store(false, Ordering::Relaxed);
    scaler.stop();
    pool.stop(false);
}

#[test]
fn manual_scale_to_is_independent_of_automatic_monitor() {
    let pool = Arc::new(PoolBuilder::new().num_threads(2).build().unwrap());
    let mut p = policy();
    p.scaling_mode = ScalingMode::Manual;
    let scaler = Autoscaler::new(Arc::clone(&pool), p).unwrap();

    scaler.scale_to(5).unwrap();
    assert_eq!(pool.worker_count(), 5);

    // The monitor thread is never started, so worker count only moves when
    // `scale_to`/`scale_up`/`scale_down` is called directly.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.worker_count(), 5);

    pool.stop(false);
}

#[test]
fn callback_observes_scale_up_direction_and_counts() {
    let pool = Arc::new(PoolBuilder::new().num_threads(1).build().unwrap());
    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let events_for_cb = Arc::clone(&events);
    let scaler = Autoscaler::with_callback(
        Arc::clone(&pool),
        AutoscalingPolicy {
            min_workers: 1,
            max_workers: 4,
            scaling_mode: ScalingMode::Manual,
            ..Default::default()
        },
        Some(Arc::new(move |direction, reason, from, to| {
            events_for_cb.lock().unwrap().push((direction, reason, from, to));
        })),
    )
    .unwrap();

    scaler.scale_up().unwrap();
    let log = events.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].2, 1);
    assert_eq!(log[0].3, 2);

    drop(log);
    pool.stop(false);
    let _: &Pool = &pool;
}
