//! A pool variant whose workers each advertise a subset of priority levels
//! they accept, dequeuing from a single shared `TypedQueue`. SPEC_FULL.md
//! §4.6 "Typed pool". Grounded on `original_source/include/kcenon/thread/
//! impl/typed_pool/adaptive_typed_job_queue.h`: that header documents a
//! known TLS bug (TICKET-001) in its lock-free typed queue and defaults to
//! the plain mutex-based one, which is why `TypedQueue` here never grows a
//! lock-free mode — see DESIGN.md's Open Question decision. The worker loop
//! itself follows `worker.rs`'s shape (busy/idle bookkeeping, panic
//! containment) without the work-stealing deque, since every worker here
//! shares one queue instead of owning a local one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::error::{EngineError, EngineResult};
use crate::job::{Job, Priority, PRIORITY_LEVELS_DESCENDING};
use crate::log::{self, Event};
use crate::queue::TypedQueue;
use crate::unwind;

/// Default number of dequeue attempts between forced lowest-priority scans.
pub const DEFAULT_STARVATION_INTERVAL: u32 = 16;

/// Per-worker configuration: which priorities it will serve, in what order,
/// and how often it forces a lowest-first scan to avoid starving its lowest
/// accepted priority.
#[derive(Debug, Clone)]
pub struct TypedWorkerSpec {
    /// Accepted priorities, highest-preference first. Empty means "accept
    /// everything, highest-first" (the default full `PRIORITY_LEVELS_DESCENDING`).
    pub accepted: Vec<Priority>,
    pub starvation_interval: u32,
}

impl Default for TypedWorkerSpec {
    fn default() -> Self {
        TypedWorkerSpec {
            accepted: PRIORITY_LEVELS_DESCENDING.to_vec(),
            starvation_interval: DEFAULT_STARVATION_INTERVAL,
        }
    }
}

impl TypedWorkerSpec {
    pub fn accepting(priorities: impl IntoIterator<Item = Priority>) -> Self {
        TypedWorkerSpec {
            accepted: priorities.into_iter().collect(),
            ..Default::default()
        }
    }

    fn descending_order(&self) -> Vec<Priority> {
        let mut order = self.accepted.clone();
        order.sort_by(|a, b| b.cmp(a));
        order
    }

    fn ascending_order(&self) -> Vec<Priority> {
        let mut order = self.accepted.clone();
        order.sort();
        order
    }
}

/// A pool built on a shared `TypedQueue` instead of per-worker local deques.
/// Each worker's accepted-priority subset is fixed at spawn time.
pub struct TypedPool {
    queue: Arc<TypedQueue>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    running: AtomicBool,
    cancellation: CancellationToken,
}

struct TypedWorkerLoop {
    index: usize,
    queue: Arc<TypedQueue>,
    shutdown: Arc<AtomicBool>,
    cancellation: CancellationToken,
    descending: Vec<Priority>,
    ascending: Vec<Priority>,
    starvation_interval: u32,
    dequeue_count: AtomicU64,
}

impl TypedWorkerLoop {
    fn next_order(&self) -> &[Priority] {
        let count = self.dequeue_count.fetch_add(1, Ordering::Relaxed) + 1;
        if self.starvation_interval > 0 && count % self.starvation_interval as u64 == 0 {
            &self.ascending
        } else {
            &self.descending
        }
    }

    fn execute(&self, job: Job) {
        let worker = self.index;
        match unwind::halt_unwinding(|| job.execute()) {
            Ok(Err(EngineError::JobPanicked(message))) => {
                log::warn(|| Event::JobPanicked { worker, message });
            }
            Ok(_) => {}
            Err(_) => std::process::abort(),
        }
    }

    fn run(self) {
        log::debug(|| Event::ThreadStart { worker: self.index });
        let mut idle_spins: u32 = 0;
        loop {
            let order = self.next_order();
            match self.queue.try_dequeue_order(order) {
                Ok(job) => {
                    idle_spins = 0;
                    self.execute(job);
                    continue;
                }
                Err(EngineError::QueueStopped) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(_) => {}
            }

            if self.cancellation.is_cancelled() && self.shutdown.load(Ordering::Acquire) {
                break;
            }

            idle_spins += 1;
            if idle_spins > 64 {
                std::thread::sleep(Duration::from_micros(200));
            } else {
                std::thread::yield_now();
            }
        }
        log::debug(|| Event::ThreadStop { worker: self.index });
    }
}

impl TypedPool {
    /// Starts one worker per entry in `specs`, all sharing one `TypedQueue`.
    pub fn start(
        specs: Vec<TypedWorkerSpec>,
        thread_name_prefix: Option<String>,
    ) -> EngineResult<TypedPool> {
        if specs.is_empty() {
            return Err(EngineError::InvalidArgument(
                "a typed pool needs at least one worker spec".to_string(),
            ));
        }
        let queue = Arc::new(TypedQueue::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let cancellation = CancellationToken::create();

        let mut workers = Vec::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            let worker_loop = TypedWorkerLoop {
                index,
                queue: Arc::clone(&queue),
                shutdown: Arc::clone(&shutdown),
                cancellation: CancellationToken::create_linked(&[cancellation.clone()]),
                descending: spec.descending_order(),
                ascending: spec.ascending_order(),
                starvation_interval: spec.starvation_interval,
                dequeue_count: AtomicU64::new(0),
            };

            let mut builder = std::thread::Builder::new();
            if let Some(prefix) = &thread_name_prefix {
                builder = builder.name(format!("{prefix}-typed-{index}"));
            }
            let join = builder
                .spawn(move || worker_loop.run())
                .map_err(|e| EngineError::InvalidArgument(format!("failed to spawn typed worker: {e}")))?;
            workers.push(join);
        }

        Ok(TypedPool {
            queue,
            workers,
            shutdown,
            running: AtomicBool::new(true),
            cancellation,
        })
    }

    pub fn submit(&self, job: Job) -> EngineResult<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(EngineError::NotRunning);
        }
        self.queue.enqueue(job)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn size_for(&self, priority: Priority) -> usize {
        self.queue.size_for(priority)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn stop(&mut self, immediate: bool) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if immediate {
            self.queue.clear();
        }
        self.queue.stop();
        self.shutdown.store(true, Ordering::Release);
        self.cancellation.cancel();
        for join in self.workers.drain(..) {
            let _ = join.join();
        }
    }
}

impl Drop for TypedPool {
    fn drop(&mut self) {
        self.stop(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn worker_restricted_to_high_still_drains_high_jobs() {
        let mut pool = TypedPool::start(
            vec![TypedWorkerSpec::accepting([Priority::High])],
            None,
        )
        .unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = Arc::clone(&done);
        pool.submit(
            Job::new("x", move || {
                done2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .with_priority(Priority::High),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        while done.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
        pool.stop(false);
    }

    #[test]
    fn starvation_avoidance_eventually_serves_low_priority() {
        let mut pool = TypedPool::start(
            vec![TypedWorkerSpec {
                accepted: PRIORITY_LEVELS_DESCENDING.to_vec(),
                starvation_interval: 2,
            }],
            None,
        )
        .unwrap();

        pool.submit(Job::new("low", || Ok(())).with_priority(Priority::Low))
            .unwrap();
        let served = Arc::new(AtomicBool::new(false));
        let served2 = Arc::clone(&served);
        // Keep re-submitting High so a naive descending-only scan would
        // starve Low forever; the interval-2 ascending scan must break through.
        for _ in 0..8 {
            let served_inner = Arc::clone(&served2);
            pool.submit(
                Job::new("high", move || {
                    served_inner.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .with_priority(Priority::High),
            )
            .unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }

        let deadline = Instant::now() + Duration::from_secs(1);
        while pool.size_for(Priority::Low) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.size_for(Priority::Low), 0);
        pool.stop(false);
    }
}
