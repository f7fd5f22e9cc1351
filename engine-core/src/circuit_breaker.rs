//! Circuit breaker: Closed/Open/HalfOpen admission gate in front of a queue.
//! SPEC_FULL.md §4.7. No direct source file in the original implementation;
//! built from the spec's state table using the same mutex-for-transitions,
//! atomic-for-fast-path-reads shape as `queue::adaptive`'s mode switch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{EngineError, EngineResult};
use crate::job::Job;
use crate::log::{self, Event};
use crate::queue::JobQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl State {
    fn label(self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half_open",
        }
    }

    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Closed,
            1 => State::Open,
            _ => State::HalfOpen,
        }
    }
}

/// Configuration for `CircuitBreaker`.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of most-recent outcomes considered when computing failure rate.
    pub window_size: usize,
    /// Minimum outcomes recorded before a trip is even considered.
    pub min_calls: usize,
    /// Failure-rate threshold (0.0-1.0) that trips Closed -> Open.
    pub failure_threshold: f64,
    /// How long the breaker stays Open before probing.
    pub open_duration: Duration,
    /// Concurrent probes allowed while HalfOpen.
    pub half_open_probe_count: usize,
    /// Consecutive successful probes required to close again.
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            window_size: 100,
            min_calls: 10,
            failure_threshold: 0.5,
            open_duration: Duration::from_secs(30),
            half_open_probe_count: 1,
            success_threshold: 1,
        }
    }
}

struct Window {
    outcomes: VecDeque<bool>,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Window {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn record(&mut self, success: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    fn clear(&mut self) {
        self.outcomes.clear();
    }

    /// `(total, failure_rate)`.
    fn stats(&self) -> (usize, f64) {
        let total = self.outcomes.len();
        if total == 0 {
            return (0, 0.0);
        }
        let failures = self.outcomes.iter().filter(|s| !**s).count();
        (total, failures as f64 / total as f64)
    }
}

/// Wraps a queue (or any admission point) with a Closed/Open/HalfOpen gate,
/// per SPEC_FULL.md §4.7's table. Fast-path admission is a single atomic
/// load; state transitions and outcome recording take the mutex.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    opened_at: Mutex<Option<Instant>>,
    window: Mutex<Window>,
    half_open_inflight: AtomicUsize,
    half_open_successes: AtomicUsize,
    trip_count: AtomicUsize,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let window = Window::new(config.window_size.max(1));
        CircuitBreaker {
            config,
            state: AtomicU8::new(State::Closed as u8),
            opened_at: Mutex::new(None),
            window: Mutex::new(window),
            half_open_inflight: AtomicUsize::new(0),
            half_open_successes: AtomicUsize::new(0),
            trip_count: AtomicUsize::new(0),
        }
    }

    pub fn state_label(&self) -> &'static str {
        self.state().label()
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: State, to: State) {
        self.state.store(to as u8, Ordering::Release);
        log::debug(|| Event::CircuitTransition {
            from: from.label(),
            to: to.label(),
        });
    }

    /// Decides whether a call may proceed right now. `Open` calls are
    /// rejected unless `open_duration` has elapsed, in which case the
    /// breaker flips to `HalfOpen` and admits this call as a probe.
    pub fn try_acquire(&self) -> EngineResult<()> {
        match self.state() {
            State::Closed => Ok(()),
            State::Open => {
                let mut opened_at = self.opened_at.lock().unwrap();
                match *opened_at {
                    Some(since) if since.elapsed() >= self.config.open_duration => {
                        self.transition(State::Open, State::HalfOpen);
                        self.half_open_successes.store(0, Ordering::Relaxed);
                        self.half_open_inflight.store(0, Ordering::Relaxed);
                        *opened_at = None;
                        drop(opened_at);
                        self.try_acquire_half_open()
                    }
                    _ => Err(EngineError::CircuitOpen),
                }
            }
            State::HalfOpen => self.try_acquire_half_open(),
        }
    }

    fn try_acquire_half_open(&self) -> EngineResult<()> {
        let mut inflight = self.half_open_inflight.load(Ordering::Acquire);
        loop {
            if inflight >= self.config.half_open_probe_count {
                return Err(EngineError::CircuitOpen);
            }
            match self.half_open_inflight.compare_exchange_weak(
                inflight,
                inflight + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => inflight = actual,
            }
        }
    }

    /// Records the outcome of a previously admitted call.
    pub fn record(&self, success: bool) {
        match self.state() {
            State::HalfOpen => {
                self.half_open_inflight.fetch_sub(1, Ordering::AcqRel);
                if success {
                    let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                    if successes >= self.config.success_threshold {
                        self.window.lock().unwrap().clear();
                        self.transition(State::HalfOpen, State::Closed);
                    }
                } else {
                    self.trip(State::HalfOpen);
                }
            }
            State::Closed => {
                let mut window = self.window.lock().unwrap();
                window.record(success);
                let (total, failure_rate) = window.stats();
                drop(window);
                if total >= self.config.min_calls && failure_rate >= self.config.failure_threshold
                {
                    self.trip(State::Closed);
                }
            }
            State::Open => {}
        }
    }

    fn trip(&self, from: State) {
        *self.opened_at.lock().unwrap() = Some(Instant::now());
        self.trip_count.fetch_add(1, Ordering::Relaxed);
        self.transition(from, State::Open);
    }

    pub fn trip_count(&self) -> usize {
        self.trip_count.load(Ordering::Relaxed)
    }
}

/// Wraps a queue with a `CircuitBreaker`: jobs are rejected with
/// `CircuitOpen` instead of enqueued while the breaker is open, and the
/// breaker observes each job's outcome via a completion callback.
pub struct ProtectedQueue {
    inner: std::sync::Arc<dyn JobQueue>,
    breaker: std::sync::Arc<CircuitBreaker>,
}

impl ProtectedQueue {
    pub fn new(inner: std::sync::Arc<dyn JobQueue>, breaker: std::sync::Arc<CircuitBreaker>) -> Self {
        ProtectedQueue { inner, breaker }
    }

    /// Admits `job` through the breaker, wrapping its completion callback so
    /// the outcome is recorded once the job finishes, then enqueues it.
    pub fn enqueue_protected(&self, job: Job) -> EngineResult<()> {
        self.breaker.try_acquire()?;
        let breaker = std::sync::Arc::clone(&self.breaker);
        let wrapped = job.with_on_complete(move |result| breaker.record(result.is_ok()));
        self.inner.enqueue(wrapped)
    }

    pub fn breaker(&self) -> &std::sync::Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BasicQueue;
    use std::sync::Arc;

    fn config(min_calls: usize, threshold: f64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            window_size: 20,
            min_calls,
            failure_threshold: threshold,
            open_duration: Duration::from_millis(20),
            half_open_probe_count: 1,
            success_threshold: 1,
        }
    }

    #[test]
    fn trips_open_after_failure_threshold() {
        let cb = CircuitBreaker::new(config(4, 0.5));
        for _ in 0..4 {
            cb.try_acquire().unwrap();
            cb.record(false);
        }
        assert_eq!(cb.state_label(), "open");
        match cb.try_acquire() {
            Err(EngineError::CircuitOpen) => {}
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn half_opens_after_duration_and_closes_on_success() {
        let cb = CircuitBreaker::new(config(2, 0.5));
        cb.try_acquire().unwrap();
        cb.record(false);
        cb.try_acquire().unwrap();
        cb.record(false);
        assert_eq!(cb.state_label(), "open");

        std::thread::sleep(Duration::from_millis(30));
        cb.try_acquire().unwrap();
        assert_eq!(cb.state_label(), "half_open");
        cb.record(true);
        assert_eq!(cb.state_label(), "closed");
    }

    #[test]
    fn half_open_reopens_on_probe_failure() {
        let cb = CircuitBreaker::new(config(1, 0.5));
        cb.try_acquire().unwrap();
        cb.record(false);
        std::thread::sleep(Duration::from_millis(30));
        cb.try_acquire().unwrap();
        cb.record(false);
        assert_eq!(cb.state_label(), "open");
    }

    #[test]
    fn protected_queue_rejects_enqueue_when_open() {
        let cb = Arc::new(CircuitBreaker::new(config(1, 0.5)));
        cb.try_acquire().unwrap();
        cb.record(false);
        let queue: Arc<dyn JobQueue> = Arc::new(BasicQueue::new());
        let protected = ProtectedQueue::new(queue, cb);
        match protected.enqueue_protected(Job::new("x", || Ok(()))) {
            Err(EngineError::CircuitOpen) => {}
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }
}
