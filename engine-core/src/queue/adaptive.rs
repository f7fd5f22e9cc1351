//! Adaptive queue: switches between `BasicQueue` and `LockFreeQueue`
//! depending on observed contention and latency. SPEC_FULL.md §4.4.3.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use super::private::Sealed;
use super::{BasicQueue, JobQueue, LockFreeQueue};
use crate::error::{EngineError, EngineResult};
use crate::job::Job;

const MIN_OPS_BEFORE_SWITCH: u64 = 1_000;
const CONTENTION_HIGH_PCT: u64 = 10;
const CONTENTION_LOW_PCT: u64 = 5;
const LATENCY_HIGH_NANOS: u64 = 1_000;
const LATENCY_LOW_NANOS: u64 = 500;

/// Which policy drives mode switching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptivePolicy {
    /// Never switch; always use the mutex-backed basic queue.
    AccuracyFirst,
    /// Switch to lock-free as soon as it would help, switch back eagerly.
    PerformanceFirst,
    /// The default hysteresis policy described in §4.4.3.
    Balanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Basic = 0,
    LockFree = 1,
}

impl Mode {
    fn from_u8(v: u8) -> Self {
        if v == 1 {
            Mode::LockFree
        } else {
            Mode::Basic
        }
    }
}

struct Contention {
    // Count of operations observed to contend (mutex: lock already held;
    // lock-free: a CAS retry was needed) vs. total, since the last reset.
    contended_ops: AtomicU64,
    total_ops: AtomicU64,
    latency_nanos_sum: AtomicU64,
}

impl Contention {
    fn new() -> Self {
        Contention {
            contended_ops: AtomicU64::new(0),
            total_ops: AtomicU64::new(0),
            latency_nanos_sum: AtomicU64::new(0),
        }
    }

    fn record(&self, contended: bool, latency_nanos: u64) {
        self.total_ops.fetch_add(1, Ordering::Relaxed);
        if contended {
            self.contended_ops.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_nanos_sum.fetch_add(latency_nanos, Ordering::Relaxed);
    }

    fn snapshot_and_reset(&self) -> (u64, u64, u64) {
        let total = self.total_ops.swap(0, Ordering::Relaxed);
        let contended = self.contended_ops.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_nanos_sum.swap(0, Ordering::Relaxed);
        (total, contended, latency_sum)
    }
}

/// Wraps a `BasicQueue` and a `LockFreeQueue`, migrating the live contents
/// between them as contention and latency cross the thresholds in §4.4.3.
pub struct AdaptiveQueue {
    policy: AdaptivePolicy,
    mode: AtomicU8,
    basic: BasicQueue,
    lockfree: LockFreeQueue,
    contention: Contention,
    switch_count: AtomicUsize,
    migration_lock: Mutex<()>,
}

impl AdaptiveQueue {
    pub fn new(policy: AdaptivePolicy) -> Self {
        AdaptiveQueue {
            policy,
            mode: AtomicU8::new(Mode::Basic as u8),
            basic: BasicQueue::new(),
            lockfree: LockFreeQueue::new(),
            contention: Contention::new(),
            switch_count: AtomicUsize::new(0),
            migration_lock: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> AdaptivePolicy {
        self.policy
    }

    pub fn switch_count(&self) -> usize {
        self.switch_count.load(Ordering::Relaxed)
    }

    fn mode(&self) -> Mode {
        Mode::from_u8(self.mode.load(Ordering::Acquire))
    }

    fn maybe_switch(&self, total: u64, contended: u64, latency_sum: u64) {
        if self.policy == AdaptivePolicy::AccuracyFirst || total <= MIN_OPS_BEFORE_SWITCH {
            return;
        }
        let contention_pct = contended.saturating_mul(100) / total.max(1);
        let avg_latency = latency_sum / total.max(1);
        let current = self.mode();

        let should_go_lockfree = match self.policy {
            AdaptivePolicy::PerformanceFirst => contention_pct > 0 || avg_latency > LATENCY_LOW_NANOS,
            _ => contention_pct > CONTENTION_HIGH_PCT && avg_latency > LATENCY_HIGH_NANOS,
        };
        let should_go_basic = match self.policy {
            AdaptivePolicy::PerformanceFirst => false,
            _ => contention_pct < CONTENTION_LOW_PCT && avg_latency < LATENCY_LOW_NANOS,
        };

        if current == Mode::Basic && should_go_lockfree {
            self.migrate_to(Mode::LockFree);
        } else if current == Mode::LockFree && should_go_basic {
            self.migrate_to(Mode::Basic);
        }
    }

    /// Drains the currently active queue and replays every job into the
    /// target queue under `migration_lock`, then flips `mode`. Concurrent
    /// enqueues/dequeues that race the drain simply land in whichever queue
    /// `mode` pointed to at the moment they ran; none are lost because the
    /// drain only removes what it observes present, and `mode` is flipped
    /// only after the replay completes.
    fn migrate_to(&self, target: Mode) {
        let _guard = match self.migration_lock.try_lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if self.mode() == target {
            return;
        }
        match target {
            Mode::LockFree => {
                while let Ok(job) = self.basic.try_dequeue() {
                    let _ = self.lockfree.enqueue(job);
                }
            }
            Mode::Basic => {
                while let Ok(job) = self.lockfree.try_dequeue() {
                    self.basic.push_back_raw(job);
                }
            }
        }
        self.mode.store(target as u8, Ordering::Release);
        self.switch_count.fetch_add(1, Ordering::Relaxed);
    }

    fn timed<R>(&self, f: impl FnOnce() -> (R, bool)) -> R {
        let start = Instant::now();
        let (result, contended) = f();
        let elapsed = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.contention.record(contended, elapsed);
        if self.contention.total_ops.load(Ordering::Relaxed) >= MIN_OPS_BEFORE_SWITCH {
            let (total, contended_count, latency_sum) = self.contention.snapshot_and_reset();
            if total > 0 {
                self.maybe_switch(total, contended_count, latency_sum);
            }
        }
        result
    }
}

impl Sealed for AdaptiveQueue {}

impl JobQueue for AdaptiveQueue {
    fn enqueue(&self, job: Job) -> EngineResult<()> {
        self.timed(|| match self.mode() {
            Mode::Basic => {
                let contended = self.basic.len_raw() > 0;
                (self.basic.enqueue(job), contended)
            }
            Mode::LockFree => (self.lockfree.enqueue(job), false),
        })
    }

    /// Delegates to whichever backing queue is currently live. Atomic with
    /// respect to capacity when `Mode::Basic` is live (the basic queue has
    /// no capacity bound here, so trivially so); the lock-free backing
    /// queue has no capacity to violate either.
    fn enqueue_batch(&self, jobs: Vec<Job>) -> EngineResult<()> {
        match self.mode() {
            Mode::Basic => self.basic.enqueue_batch(jobs),
            Mode::LockFree => self.lockfree.enqueue_batch(jobs),
        }
    }

    fn dequeue(&self) -> EngineResult<Job> {
        match self.mode() {
            Mode::Basic => self.basic.dequeue(),
            Mode::LockFree => self.lockfree.dequeue(),
        }
    }

    fn try_dequeue(&self) -> EngineResult<Job> {
        self.timed(|| match self.mode() {
            Mode::Basic => {
                let r = self.basic.try_dequeue();
                let contended = matches!(r, Err(EngineError::QueueEmpty));
                (r, contended)
            }
            Mode::LockFree => (self.lockfree.try_dequeue(), false),
        })
    }

    fn is_empty(&self) -> bool {
        match self.mode() {
            Mode::Basic => self.basic.is_empty(),
            Mode::LockFree => self.lockfree.is_empty(),
        }
    }

    fn size(&self) -> usize {
        match self.mode() {
            Mode::Basic => self.basic.size(),
            Mode::LockFree => self.lockfree.size(),
        }
    }

    fn clear(&self) {
        self.basic.clear();
        self.lockfree.clear();
    }

    fn stop(&self) {
        self.basic.stop();
        self.lockfree.stop();
    }

    fn is_stopped(&self) -> bool {
        match self.mode() {
            Mode::Basic => self.basic.is_stopped(),
            Mode::LockFree => self.lockfree.is_stopped(),
        }
    }
}
