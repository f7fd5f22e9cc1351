//! The job queue family: a sealed trait implemented by exactly the four
//! variants named in SPEC_FULL.md §4.4, plus the internal priority partition
//! used by the typed pool. See §9 "Dynamic dispatch" for why this is a
//! sealed trait rather than open-ended inheritance: there are exactly four
//! variants, and the adaptive queue's migration needs to pattern-match them.

pub mod adaptive;
pub mod backpressure;
pub mod basic;
pub mod lockfree;
pub mod typed;

use crate::error::EngineResult;
use crate::job::Job;

mod private {
    pub trait Sealed {}
}

/// Shared contract for all queue variants. `enqueue`/`dequeue` return
/// structured errors, never panic to signal an expected condition.
pub trait JobQueue: private::Sealed {
    /// Enqueues `job`. Fails with `QueueStopped` if stopped, `QueueFull` if
    /// a capacity bound is set and reached (unless a backpressure policy
    /// overrides this).
    fn enqueue(&self, job: Job) -> EngineResult<()>;

    /// Enqueues every job in `jobs`, or none, atomically with respect to
    /// capacity: either the whole batch fits or the batch is rejected
    /// wholesale (SPEC_FULL.md §4.4.4). The default implementation enqueues
    /// one at a time, which is only truly atomic for queue variants with no
    /// capacity bound to violate partway through; bounded variants override
    /// this with a single-lock check-then-insert.
    fn enqueue_batch(&self, jobs: Vec<Job>) -> EngineResult<()> {
        for job in jobs {
            self.enqueue(job)?;
        }
        Ok(())
    }

    /// Blocks until a job is available, the queue is stopped (returning
    /// `QueueStopped` once drained), or (for bounded waits) forever.
    fn dequeue(&self) -> EngineResult<Job>;

    /// Non-blocking dequeue; fails with `QueueEmpty` immediately.
    fn try_dequeue(&self) -> EngineResult<Job>;

    /// True if no jobs are currently queued.
    fn is_empty(&self) -> bool;

    /// Current (possibly approximate, for the lock-free variant) size.
    fn size(&self) -> usize;

    /// Discards all currently queued jobs.
    fn clear(&self);

    /// Marks the queue stopped: further enqueues fail, but dequeues keep
    /// succeeding until the queue is drained.
    fn stop(&self);

    fn is_stopped(&self) -> bool;
}

pub use adaptive::{AdaptivePolicy, AdaptiveQueue};
pub use backpressure::{
    BackpressureConfig, BackpressurePolicy, BackpressureQueue, BackpressureStats,
    BackpressureStatsSnapshot, CallbackDecision, PressureLevel, RateLimit,
};
pub use basic::BasicQueue;
pub use lockfree::LockFreeQueue;
pub use typed::TypedQueue;
