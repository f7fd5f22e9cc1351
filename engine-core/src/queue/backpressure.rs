//! Backpressure-aware queue: watermark-based pressure levels, optional token-bucket
//! rate limiting, and a pluggable overflow policy. SPEC_FULL.md §4.4.4, grounded on
//! `original_source/src/core/backpressure_job_queue.cpp`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::private::Sealed;
use super::{BasicQueue, JobQueue};
use crate::error::{EngineError, EngineResult};
use crate::job::Job;

/// Coarse pressure reading, derived from `size / max_size` against the
/// configured watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    None,
    Low,
    High,
    Critical,
}

/// What to do when an enqueue would exceed capacity.
pub enum BackpressurePolicy {
    /// Wait up to `block_timeout` for space to free up.
    Block,
    /// Evict the oldest queued job(s) to make room for the new one.
    DropOldest,
    /// Reject the incoming job.
    DropNewest,
    /// Ask a caller-supplied closure what to do.
    Callback(Box<dyn Fn(&Job) -> CallbackDecision + Send + Sync>),
    /// Accept probabilistically, with acceptance odds falling linearly from
    /// 1.0 at the high watermark to 0.0 at capacity.
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackDecision {
    Accept,
    Reject,
    DropOldestAndAccept,
    /// Wait briefly for pressure to ease, then ask the callback again.
    /// Rejected with `Timeout` once `block_timeout` has elapsed without
    /// the callback returning anything else.
    Delay,
}

pub struct BackpressureConfig {
    pub max_size: usize,
    pub high_watermark: f64,
    pub low_watermark: f64,
    pub policy: BackpressurePolicy,
    pub block_timeout: Duration,
    pub rate_limit: Option<RateLimit>,
    pub pressure_callback: Option<Box<dyn Fn(usize, f64) + Send + Sync>>,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub tokens_per_second: f64,
    pub burst_size: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        BackpressureConfig {
            max_size: 1024,
            high_watermark: 0.8,
            low_watermark: 0.5,
            policy: BackpressurePolicy::DropNewest,
            block_timeout: Duration::from_secs(1),
            rate_limit: None,
            pressure_callback: None,
        }
    }
}

/// A simple token bucket: `tokens` refills continuously at `tokens_per_second`,
/// capped at `burst_size`, and `try_acquire` withdraws `n` if available.
struct TokenBucket {
    tokens_per_second: f64,
    burst_size: u64,
    state: Mutex<TokenBucketState>,
}

struct TokenBucketState {
    available: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(tokens_per_second: f64, burst_size: u64) -> Self {
        TokenBucket {
            tokens_per_second,
            burst_size,
            state: Mutex::new(TokenBucketState {
                available: burst_size as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill_locked(&self, state: &mut TokenBucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.available = (state.available + elapsed * self.tokens_per_second)
            .min(self.burst_size as f64);
        state.last_refill = now;
    }

    fn try_acquire(&self, n: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill_locked(&mut state);
        if state.available >= n as f64 {
            state.available -= n as f64;
            true
        } else {
            false
        }
    }

    fn available(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        self.refill_locked(&mut state);
        state.available as u64
    }
}

#[derive(Default)]
pub struct BackpressureStats {
    pub jobs_accepted: AtomicU64,
    pub jobs_rejected: AtomicU64,
    pub jobs_dropped: AtomicU64,
    pub pressure_events: AtomicU64,
    pub rate_limit_waits: AtomicU64,
    pub total_block_time_nanos: AtomicU64,
}

impl BackpressureStats {
    fn snapshot(&self) -> BackpressureStatsSnapshot {
        BackpressureStatsSnapshot {
            jobs_accepted: self.jobs_accepted.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            jobs_dropped: self.jobs_dropped.load(Ordering::Relaxed),
            pressure_events: self.pressure_events.load(Ordering::Relaxed),
            rate_limit_waits: self.rate_limit_waits.load(Ordering::Relaxed),
            total_block_time: Duration::from_nanos(self.total_block_time_nanos.load(Ordering::Relaxed)),
        }
    }

    fn reset(&self) {
        self.jobs_accepted.store(0, Ordering::Relaxed);
        self.jobs_rejected.store(0, Ordering::Relaxed);
        self.jobs_dropped.store(0, Ordering::Relaxed);
        self.pressure_events.store(0, Ordering::Relaxed);
        self.rate_limit_waits.store(0, Ordering::Relaxed);
        self.total_block_time_nanos.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackpressureStatsSnapshot {
    pub jobs_accepted: u64,
    pub jobs_rejected: u64,
    pub jobs_dropped: u64,
    pub pressure_events: u64,
    pub rate_limit_waits: u64,
    pub total_block_time: Duration,
}

/// Wraps a `BasicQueue`, adding a watermark-based pressure gauge, an optional
/// token-bucket rate limiter, and one of five overflow policies.
pub struct BackpressureQueue {
    inner: BasicQueue,
    max_size: usize,
    high_watermark: f64,
    low_watermark: f64,
    policy: BackpressurePolicy,
    block_timeout: Duration,
    rate_limiter: Option<TokenBucket>,
    pressure_callback: Option<Box<dyn Fn(usize, f64) + Send + Sync>>,
    current_pressure: AtomicUsize,
    space_available: Condvar,
    space_mutex: Mutex<()>,
    stats: BackpressureStats,
    adaptive_counter: AtomicU64,
}

impl BackpressureQueue {
    pub fn new(config: BackpressureConfig) -> Self {
        let rate_limiter = config
            .rate_limit
            .map(|rl| TokenBucket::new(rl.tokens_per_second, rl.burst_size));
        BackpressureQueue {
            inner: BasicQueue::with_capacity(None),
            max_size: config.max_size,
            high_watermark: config.high_watermark,
            low_watermark: config.low_watermark,
            policy: config.policy,
            block_timeout: config.block_timeout,
            rate_limiter,
            pressure_callback: config.pressure_callback,
            current_pressure: AtomicUsize::new(PressureLevel::None as usize),
            space_available: Condvar::new(),
            space_mutex: Mutex::new(()),
            stats: BackpressureStats::default(),
            adaptive_counter: AtomicU64::new(0),
        }
    }

    pub fn pressure_level(&self) -> PressureLevel {
        match self.current_pressure.load(Ordering::Acquire) {
            0 => PressureLevel::None,
            1 => PressureLevel::Low,
            2 => PressureLevel::High,
            _ => PressureLevel::Critical,
        }
    }

    pub fn pressure_ratio(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        self.inner.len_raw() as f64 / self.max_size as f64
    }

    pub fn stats(&self) -> BackpressureStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    pub fn is_rate_limited(&self) -> bool {
        match &self.rate_limiter {
            Some(bucket) => bucket.available() < bucket.burst_size / 10,
            None => false,
        }
    }

    pub fn available_tokens(&self) -> Option<u64> {
        self.rate_limiter.as_ref().map(|b| b.available())
    }

    fn update_pressure_state(&self) {
        if self.max_size == 0 {
            self.current_pressure.store(0, Ordering::Relaxed);
            return;
        }
        let current = self.inner.len_raw();
        let ratio = current as f64 / self.max_size as f64;
        let new_level = if current >= self.max_size {
            PressureLevel::Critical
        } else if ratio >= self.high_watermark {
            PressureLevel::High
        } else if ratio >= self.low_watermark {
            PressureLevel::Low
        } else {
            PressureLevel::None
        };
        let old_level = self
            .current_pressure
            .swap(new_level as usize, Ordering::AcqRel);

        if new_level as usize >= PressureLevel::High as usize {
            self.stats.pressure_events.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(cb) = &self.pressure_callback {
            if new_level as usize != old_level || new_level >= PressureLevel::High {
                cb(current, ratio);
            }
        }
        if (new_level as usize) < old_level {
            self.space_available.notify_all();
        }
    }

    fn apply_rate_limiting(&self) -> bool {
        self.apply_rate_limiting_n(1)
    }

    fn apply_rate_limiting_n(&self, n: u64) -> bool {
        let Some(bucket) = &self.rate_limiter else {
            return true;
        };
        if bucket.try_acquire(n) {
            return true;
        }
        self.stats.rate_limit_waits.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let deadline = start + self.block_timeout;
        let mut acquired = false;
        while Instant::now() < deadline {
            if bucket.try_acquire(n) {
                acquired = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.stats
            .total_block_time_nanos
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        acquired
    }

    fn is_full(&self) -> bool {
        self.inner.len_raw() >= self.max_size
    }

    fn direct_enqueue(&self, job: Job) -> EngineResult<()> {
        self.inner.push_back_raw(job);
        Ok(())
    }

    fn apply_backpressure(&self, job: Job) -> EngineResult<()> {
        if !self.apply_rate_limiting() {
            self.stats.jobs_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::Timeout(self.block_timeout));
        }

        if !self.is_full() {
            self.direct_enqueue(job)?;
            self.stats.jobs_accepted.fetch_add(1, Ordering::Relaxed);
            self.update_pressure_state();
            return Ok(());
        }

        match &self.policy {
            BackpressurePolicy::Block => self.handle_block(job),
            BackpressurePolicy::DropOldest => self.handle_drop_oldest(job),
            BackpressurePolicy::DropNewest => {
                self.stats.jobs_rejected.fetch_add(1, Ordering::Relaxed);
                self.update_pressure_state();
                Err(EngineError::QueueFull)
            }
            BackpressurePolicy::Callback(decide) => self.handle_callback(job, decide.as_ref()),
            BackpressurePolicy::Adaptive => self.handle_adaptive(job),
        }
    }

    fn handle_block(&self, job: Job) -> EngineResult<()> {
        let start = Instant::now();
        let deadline = start + self.block_timeout;
        loop {
            if !self.is_full() {
                self.direct_enqueue(job)?;
                self.stats.jobs_accepted.fetch_add(1, Ordering::Relaxed);
                self.update_pressure_state();
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let guard = self.space_mutex.lock().unwrap();
            let _ = self.space_available.wait_timeout(guard, remaining).unwrap();
        }
        self.stats
            .total_block_time_nanos
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        self.stats.jobs_rejected.fetch_add(1, Ordering::Relaxed);
        Err(EngineError::Timeout(self.block_timeout))
    }

    fn handle_drop_oldest(&self, job: Job) -> EngineResult<()> {
        if let Some(_dropped) = self.inner.pop_front_raw() {
            self.stats.jobs_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.direct_enqueue(job)?;
        self.stats.jobs_accepted.fetch_add(1, Ordering::Relaxed);
        self.update_pressure_state();
        Ok(())
    }

    fn handle_callback(
        &self,
        job: Job,
        decide: &(dyn Fn(&Job) -> CallbackDecision + Send + Sync),
    ) -> EngineResult<()> {
        let deadline = Instant::now() + self.block_timeout;
        loop {
            match decide(&job) {
                CallbackDecision::Accept => {
                    self.direct_enqueue(job)?;
                    self.stats.jobs_accepted.fetch_add(1, Ordering::Relaxed);
                    self.update_pressure_state();
                    return Ok(());
                }
                CallbackDecision::Reject => {
                    self.stats.jobs_rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(EngineError::QueueFull);
                }
                CallbackDecision::DropOldestAndAccept => return self.handle_drop_oldest(job),
                CallbackDecision::Delay => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.stats.jobs_rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(EngineError::Timeout(self.block_timeout));
                    }
                    let guard = self.space_mutex.lock().unwrap();
                    let _ = self
                        .space_available
                        .wait_timeout(guard, remaining.min(Duration::from_millis(10)))
                        .unwrap();
                }
            }
        }
    }

    fn handle_adaptive(&self, job: Job) -> EngineResult<()> {
        let ratio = self.pressure_ratio();
        if ratio < self.high_watermark {
            self.direct_enqueue(job)?;
            self.stats.jobs_accepted.fetch_add(1, Ordering::Relaxed);
            self.update_pressure_state();
            return Ok(());
        }
        if ratio < 1.0 {
            let accept_prob = (1.0 - ratio) / (1.0 - self.high_watermark);
            let counter = self.adaptive_counter.fetch_add(1, Ordering::Relaxed);
            let should_accept = (counter % 100) < (accept_prob * 100.0) as u64;
            if should_accept {
                self.direct_enqueue(job)?;
                self.stats.jobs_accepted.fetch_add(1, Ordering::Relaxed);
                self.update_pressure_state();
                return Ok(());
            }
        }
        {
            let guard = self.space_mutex.lock().unwrap();
            let _ = self
                .space_available
                .wait_timeout(guard, Duration::from_millis(10))
                .unwrap();
        }
        if !self.is_full() {
            self.direct_enqueue(job)?;
            self.stats.jobs_accepted.fetch_add(1, Ordering::Relaxed);
            self.update_pressure_state();
            return Ok(());
        }
        self.stats.jobs_rejected.fetch_add(1, Ordering::Relaxed);
        self.update_pressure_state();
        Err(EngineError::QueueFull)
    }
}

impl Sealed for BackpressureQueue {}

impl JobQueue for BackpressureQueue {
    fn enqueue(&self, job: Job) -> EngineResult<()> {
        if self.inner.is_stopped() {
            return Err(EngineError::QueueStopped);
        }
        self.apply_backpressure(job)
    }

    /// Admits the whole batch under one lock acquisition if it fits within
    /// `max_size`, or rejects it wholesale with `QueueFull`. None of the
    /// single-job overflow policies apply here: evicting or blocking for an
    /// indeterminate number of slots to make room for a whole batch has no
    /// single well-defined behavior, so a batch either fits or it doesn't.
    fn enqueue_batch(&self, jobs: Vec<Job>) -> EngineResult<()> {
        if self.inner.is_stopped() {
            return Err(EngineError::QueueStopped);
        }
        if jobs.is_empty() {
            return Ok(());
        }
        let count = jobs.len() as u64;
        if !self.apply_rate_limiting_n(count) {
            self.stats.jobs_rejected.fetch_add(count, Ordering::Relaxed);
            return Err(EngineError::Timeout(self.block_timeout));
        }
        match self.inner.try_push_batch_within(jobs, self.max_size) {
            Ok(()) => {
                self.stats.jobs_accepted.fetch_add(count, Ordering::Relaxed);
                self.update_pressure_state();
                Ok(())
            }
            Err(_rejected) => {
                self.stats.jobs_rejected.fetch_add(count, Ordering::Relaxed);
                self.update_pressure_state();
                Err(EngineError::QueueFull)
            }
        }
    }

    fn dequeue(&self) -> EngineResult<Job> {
        let job = self.inner.dequeue()?;
        self.update_pressure_state();
        Ok(job)
    }

    fn try_dequeue(&self) -> EngineResult<Job> {
        let job = self.inner.try_dequeue()?;
        self.update_pressure_state();
        Ok(job)
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn clear(&self) {
        self.inner.clear();
        self.update_pressure_state();
    }

    fn stop(&self) {
        self.inner.stop();
        self.space_available.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str) -> Job {
        Job::new(name, || Ok(()))
    }

    #[test]
    fn drop_oldest_evicts_to_make_room() {
        let q = BackpressureQueue::new(BackpressureConfig {
            max_size: 2,
            policy: BackpressurePolicy::DropOldest,
            ..Default::default()
        });
        q.enqueue(job("a")).unwrap();
        q.enqueue(job("b")).unwrap();
        q.enqueue(job("c")).unwrap();
        assert_eq!(q.size(), 2);
        assert_eq!(q.stats().jobs_dropped, 1);
        let first = q.try_dequeue().unwrap();
        assert_eq!(first.name(), Some("b"));
    }

    #[test]
    fn drop_newest_rejects_when_full() {
        let q = BackpressureQueue::new(BackpressureConfig {
            max_size: 1,
            policy: BackpressurePolicy::DropNewest,
            ..Default::default()
        });
        q.enqueue(job("a")).unwrap();
        match q.enqueue(job("b")) {
            Err(EngineError::QueueFull) => {}
            other => panic!("expected QueueFull, got {other:?}"),
        }
        assert_eq!(q.stats().jobs_rejected, 1);
    }

    #[test]
    fn pressure_level_tracks_watermarks() {
        let q = BackpressureQueue::new(BackpressureConfig {
            max_size: 10,
            high_watermark: 0.8,
            low_watermark: 0.5,
            policy: BackpressurePolicy::DropNewest,
            ..Default::default()
        });
        assert_eq!(q.pressure_level(), PressureLevel::None);
        for i in 0..6 {
            q.enqueue(job(&i.to_string())).unwrap();
        }
        assert_eq!(q.pressure_level(), PressureLevel::Low);
        for i in 6..9 {
            q.enqueue(job(&i.to_string())).unwrap();
        }
        assert_eq!(q.pressure_level(), PressureLevel::High);
    }

    #[test]
    fn callback_policy_can_accept_over_capacity() {
        let q = BackpressureQueue::new(BackpressureConfig {
            max_size: 1,
            policy: BackpressurePolicy::Callback(Box::new(|_job| CallbackDecision::Accept)),
            ..Default::default()
        });
        q.enqueue(job("a")).unwrap();
        q.enqueue(job("b")).unwrap();
        assert_eq!(q.size(), 2);
    }

    #[test]
    fn callback_delay_waits_then_rejects_on_timeout() {
        let q = BackpressureQueue::new(BackpressureConfig {
            max_size: 1,
            policy: BackpressurePolicy::Callback(Box::new(|_job| CallbackDecision::Delay)),
            block_timeout: Duration::from_millis(30),
            ..Default::default()
        });
        q.enqueue(job("a")).unwrap();
        match q.enqueue(job("b")) {
            Err(EngineError::Timeout(_)) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn enqueue_batch_is_all_or_nothing() {
        let q = BackpressureQueue::new(BackpressureConfig {
            max_size: 2,
            policy: BackpressurePolicy::DropNewest,
            ..Default::default()
        });
        match q.enqueue_batch(vec![job("a"), job("b"), job("c")]) {
            Err(EngineError::QueueFull) => {}
            other => panic!("expected QueueFull, got {other:?}"),
        }
        assert_eq!(q.size(), 0, "an oversized batch must not partially land");

        q.enqueue_batch(vec![job("a"), job("b")]).unwrap();
        assert_eq!(q.size(), 2);
        assert_eq!(q.try_dequeue().unwrap().name(), Some("a"));
        assert_eq!(q.try_dequeue().unwrap().name(), Some("b"));
    }

    #[test]
    fn rate_limiter_rejects_once_burst_exhausted() {
        let q = BackpressureQueue::new(BackpressureConfig {
            max_size: 100,
            policy: BackpressurePolicy::DropNewest,
            block_timeout: Duration::from_millis(10),
            rate_limit: Some(RateLimit {
                tokens_per_second: 1.0,
                burst_size: 1,
            }),
            ..Default::default()
        });
        q.enqueue(job("a")).unwrap();
        match q.enqueue(job("b")) {
            Err(EngineError::Timeout(_)) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }
}
