//! A long-running job checks its token cooperatively and stops promptly once
//! cancelled from outside, instead of running to completion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use engine_core::{CancellationReason, CancellationToken, EngineError, Job, PoolBuilder};

#[test]
fn job_observes_cancellation_and_stops_early() {
    let pool = PoolBuilder::new().num_threads(2).build().unwrap();
    let token = CancellationToken::create();
    let token_for_job = token.clone();

    let iterations = Arc::new(AtomicUsize::new(0));
    let iterations_for_job = Arc::clone(&iterations);
    let started = Arc::new(std::sync::Barrier::new(2));
    let started_for_job = Arc::clone(&started);

    pool.submit(
        Job::new("cooperative", move || {
            started_for_job.wait();
            loop {
                token_for_job.throw_if_cancelled()?;
                iterations_for_job.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(2));
            }
        })
        .with_cancellation(token.clone()),
    )
    .unwrap();

    started.wait();
    // Let the job run for a short while before pulling the plug.
    std::thread::sleep(Duration::from_millis(20));
    token.cancel();

    assert!(token.wait_for(Duration::from_secs(1)));
    assert_eq!(token.get_reason(), Some(CancellationReason::UserRequested));

    let seen_before_stop = iterations.load(Ordering::SeqCst);
    assert!(seen_before_stop > 0);

    // The loop should not keep incrementing forever once cancelled: give it
    // a little time to notice and exit, then confirm it has actually stopped.
    std::thread::sleep(Duration::from_millis(50));
    let settled = iterations.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(settled, iterations.load(Ordering::SeqCst));

    pool.stop(false);
}

#[test]
fn linked_child_token_cancels_job_when_parent_cancels() {
    let pool = PoolBuilder::new().num_threads(1).build().unwrap();
    let parent = CancellationToken::create();
    let child = CancellationToken::create_linked(&[parent.clone()]);
    let child_for_job = child.clone();

    let result_seen = Arc::new(std::sync::Mutex::new(None));
    let result_for_job = Arc::clone(&result_seen);

    pool.submit(Job::new("linked", move || {
        child_for_job.wait_for(Duration::from_secs(1));
        let outcome = child_for_job.throw_if_cancelled();
        *result_for_job.lock().unwrap() = Some(outcome.is_err());
        Ok(())
    }))
    .unwrap();

    parent.cancel();

    let deadline = Instant::now() + Duration::from_secs(1);
    while result_seen.lock().unwrap().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(*result_seen.lock().unwrap(), Some(true));
    match child.get_reason() {
        Some(CancellationReason::ParentCancelled) => {}
        other => panic!("expected ParentCancelled, got {other:?}"),
    }

    pool.stop(false);
}

#[test]
fn cancelled_job_body_error_is_reported_via_on_error() {
    let pool = PoolBuilder::new().num_threads(1).build().unwrap();
    let token = CancellationToken::create();
    token.cancel();

    let observed = Arc::new(std::sync::Mutex::new(None));
    let observed_for_cb = Arc::clone(&observed);
    let token_for_job = token.clone();

    pool.submit(
        Job::new("precancelled", move || token_for_job.throw_if_cancelled())
            .with_on_error(move |err| {
                *observed_for_cb.lock().unwrap() = Some(matches!(err, EngineError::Cancelled(_)));
            }),
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(1);
    while observed.lock().unwrap().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*observed.lock().unwrap(), Some(true));

    pool.stop(false);
}
