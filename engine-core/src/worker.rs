//! Worker thread loop: local deque (LIFO) → global queue (`try_dequeue`) →
//! steal from a sibling, in that order. SPEC_FULL.md §4.5. Grounded almost
//! directly on `registry.rs`'s `WorkerThread`/`main_loop`/`steal()`, including
//! the `XorShift64Star` victim-selection RNG and the thread-local "current
//! worker" handle that lets a running job push follow-up work onto its own
//! local deque instead of the global queue.

use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crossbeam_deque::{Steal, Stealer, Worker as Deque};

use crate::cancellation::CancellationToken;
use crate::context::ThreadContext;
use crate::error::EngineError;
use crate::job::Job;
use crate::log::{self, Event};
use crate::metrics::PoolMetrics;
use crate::queue::JobQueue;
use crate::unwind;

/// xorshift* RNG for picking a steal victim; tolerates weak seeding, never
/// produces zero.
pub(crate) struct XorShift64Star {
    state: Cell<u64>,
}

impl XorShift64Star {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicUsize = AtomicUsize::new(1);
        let mut seed = 0u64;
        while seed == 0 {
            let mut hasher = DefaultHasher::new();
            hasher.write_usize(COUNTER.fetch_add(1, Ordering::Relaxed));
            seed = hasher.finish();
        }
        XorShift64Star { state: Cell::new(seed) }
    }

    fn next(&self) -> u64 {
        let mut x = self.state.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state.set(x);
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn next_usize(&self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

/// Externally visible, atomically updated counters for one worker. Shared
/// between the running worker thread and whoever is inspecting the pool
/// (diagnostics, health checks).
pub struct WorkerStats {
    busy: AtomicBool,
    current_job_id: AtomicU64,
    jobs_executed: AtomicU64,
    jobs_stolen: AtomicU64,
}

impl WorkerStats {
    pub fn new() -> Self {
        WorkerStats {
            busy: AtomicBool::new(false),
            current_job_id: AtomicU64::new(0),
            jobs_executed: AtomicU64::new(0),
            jobs_stolen: AtomicU64::new(0),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// The id of the job currently executing on this worker, or `None` if idle.
    pub fn current_job_id(&self) -> Option<u64> {
        match self.current_job_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn jobs_executed(&self) -> u64 {
        self.jobs_executed.load(Ordering::Relaxed)
    }

    pub fn jobs_stolen(&self) -> u64 {
        self.jobs_stolen.load(Ordering::Relaxed)
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a worker thread's main loop needs: its own local deque, the
/// full set of sibling stealers (including its own, skipped by index), the
/// shared global queue, and the pool-wide shutdown flag.
pub struct WorkerContext {
    index: usize,
    local: Deque<Job>,
    stealers: Arc<RwLock<Vec<Stealer<Job>>>>,
    global: Arc<dyn JobQueue>,
    stats: Arc<WorkerStats>,
    metrics: Arc<PoolMetrics>,
    context: Arc<ThreadContext>,
    cancellation: CancellationToken,
    shutdown: Arc<AtomicBool>,
    /// Set only for this one worker, e.g. by the autoscaler removing it
    /// individually. Distinct from `shutdown`, which is pool-wide.
    local_shutdown: Arc<AtomicBool>,
    rng: XorShift64Star,
    panic_handler: Option<Arc<dyn Fn(usize, &EngineError) + Send + Sync>>,
}

thread_local! {
    static CURRENT: Cell<*const WorkerContext> = Cell::new(ptr::null());
}

impl WorkerContext {
    pub fn new(
        index: usize,
        local: Deque<Job>,
        stealers: Arc<RwLock<Vec<Stealer<Job>>>>,
        global: Arc<dyn JobQueue>,
        stats: Arc<WorkerStats>,
        metrics: Arc<PoolMetrics>,
        context: Arc<ThreadContext>,
        cancellation: CancellationToken,
        shutdown: Arc<AtomicBool>,
        local_shutdown: Arc<AtomicBool>,
    ) -> Self {
        WorkerContext {
            index,
            local,
            stealers,
            global,
            stats,
            metrics,
            context,
            cancellation,
            shutdown,
            local_shutdown,
            rng: XorShift64Star::new(),
            panic_handler: None,
        }
    }

    /// Attaches a handler invoked (on this worker thread) whenever a job it
    /// runs fails with `JobPanicked`.
    pub fn with_panic_handler(
        mut self,
        handler: Arc<dyn Fn(usize, &EngineError) + Send + Sync>,
    ) -> Self {
        self.panic_handler = Some(handler);
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    fn set_current(ctx: &WorkerContext) {
        CURRENT.with(|cell| cell.set(ctx as *const WorkerContext));
    }

    fn clear_current() {
        CURRENT.with(|cell| cell.set(ptr::null()));
    }

    /// True if the calling thread is itself a worker in some pool.
    pub fn is_worker_thread() -> bool {
        CURRENT.with(|cell| !cell.get().is_null())
    }

    /// Tries to push `job` onto the calling thread's own local deque,
    /// giving it LIFO affinity instead of routing it through the global
    /// queue. Returns the job back if the calling thread is not a worker.
    pub fn spawn_local(job: Job) -> Result<(), Job> {
        let ptr = CURRENT.with(|cell| cell.get());
        if ptr.is_null() {
            return Err(job);
        }
        // Safety: `ptr` was set by `set_current` to the address of the
        // `WorkerContext` that is currently executing on this very thread,
        // and cleared before that context is dropped.
        let ctx = unsafe { &*ptr };
        ctx.local.push(job);
        log::trace(|| Event::JobPushed { worker: ctx.index });
        Ok(())
    }

    fn steal(&self) -> Option<Job> {
        let stealers = self.stealers.read().unwrap();
        let num = stealers.len();
        if num <= 1 {
            return None;
        }
        loop {
            let mut retry = false;
            let start = self.rng.next_usize(num);
            let job = (start..num)
                .chain(0..start)
                .filter(|&i| i != self.index)
                .find_map(|victim| match stealers[victim].steal() {
                    Steal::Success(job) => {
                        log::trace(|| Event::JobStolen {
                            worker: self.index,
                            victim,
                        });
                        self.stats.jobs_stolen.fetch_add(1, Ordering::Relaxed);
                        Some(job)
                    }
                    Steal::Empty => None,
                    Steal::Retry => {
                        retry = true;
                        None
                    }
                });
            if job.is_some() || !retry {
                return job;
            }
        }
    }

    fn execute(&self, job: Job) {
        self.stats.current_job_id.store(job.id(), Ordering::Release);
        self.stats.busy.store(true, Ordering::Release);

        let worker = self.index;
        let started = Instant::now();
        let outcome = unwind::halt_unwinding(|| job.execute());
        let elapsed = started.elapsed();

        match &outcome {
            Ok(Err(err @ EngineError::JobPanicked(_))) => {
                if let EngineError::JobPanicked(ref message) = err {
                    log::warn(|| Event::JobPanicked {
                        worker,
                        message: message.clone(),
                    });
                }
                if let Some(handler) = &self.panic_handler {
                    handler(worker, err);
                }
                self.context.log(::log::Level::Warn, &err.to_string());
                self.metrics.record_failed();
            }
            Ok(Ok(())) => self.metrics.record_completed(elapsed),
            Ok(Err(_)) => self.metrics.record_failed(),
            Err(_) => {
                // `Job::execute` already catches panics in its own body and
                // callbacks; a panic escaping here would mean a bug in this
                // crate's own code, not user code. Abort rather than leave
                // the pool in an inconsistent state.
                std::process::abort();
            }
        }

        self.stats.jobs_executed.fetch_add(1, Ordering::Relaxed);
        self.stats.busy.store(false, Ordering::Release);
        self.stats.current_job_id.store(0, Ordering::Release);
    }

    /// Runs the worker main loop until `shutdown` is set and both the local
    /// deque and the global queue have been drained. Intended to be the body
    /// of a dedicated `std::thread`.
    pub fn run(self) {
        log::debug(|| Event::ThreadStart { worker: self.index });
        self.context
            .log(::log::Level::Debug, &format!("worker {} started", self.index));
        WorkerContext::set_current(&self);

        let mut idle_spins: u32 = 0;
        loop {
            if let Some(job) = self.local.pop() {
                idle_spins = 0;
                log::trace(|| Event::JobPopped { worker: self.index });
                self.execute(job);
                continue;
            }

            if self.local_shutdown.load(Ordering::Acquire) {
                // Being individually retired (e.g. by the autoscaler): stop
                // pulling new work and let other workers pick up the rest.
                break;
            }

            match self.global.try_dequeue() {
                Ok(job) => {
                    idle_spins = 0;
                    self.execute(job);
                    continue;
                }
                Err(EngineError::QueueStopped) => {
                    if self.shutdown.load(Ordering::Acquire) && self.local.is_empty() {
                        break;
                    }
                }
                Err(_) => {}
            }

            if let Some(job) = self.steal() {
                idle_spins = 0;
                self.execute(job);
                continue;
            }

            if self.shutdown.load(Ordering::Acquire) && self.global.is_stopped() {
                break;
            }

            idle_spins += 1;
            if idle_spins > 64 {
                std::thread::sleep(Duration::from_micros(200));
            } else {
                std::thread::yield_now();
            }
        }

        WorkerContext::clear_current();
        log::debug(|| Event::ThreadStop { worker: self.index });
        self.context
            .log(::log::Level::Debug, &format!("worker {} stopped", self.index));
    }

    /// Token this worker observes; a job may also carry its own token (see
    /// `Job::with_cancellation`), in which case both are checked.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BasicQueue;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::thread;

    #[test]
    fn drains_local_then_global_then_stops() {
        let local = Deque::new_fifo();
        let global: Arc<dyn JobQueue> = Arc::new(BasicQueue::new());
        let executed = Arc::new(StdAtomicUsize::new(0));

        for i in 0..3 {
            let executed = Arc::clone(&executed);
            global
                .enqueue(Job::new(format!("g{i}"), move || {
                    executed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .unwrap();
        }
        for i in 0..2 {
            let executed = Arc::clone(&executed);
            local.push(Job::new(format!("l{i}"), move || {
                executed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        let stealers = Arc::new(RwLock::new(vec![local.stealer()]));
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = WorkerContext::new(
            0,
            local,
            stealers,
            Arc::clone(&global),
            Arc::new(WorkerStats::new()),
            Arc::new(PoolMetrics::new("test", false)),
            Arc::new(ThreadContext::new()),
            CancellationToken::create(),
            Arc::clone(&shutdown),
            Arc::new(AtomicBool::new(false)),
        );

        global.stop();
        let handle = thread::spawn(move || ctx.run());
        shutdown.store(true, Ordering::Release);
        handle.join().unwrap();

        assert_eq!(executed.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn spawn_local_outside_worker_returns_job() {
        let job = Job::new("x", || Ok(()));
        assert!(WorkerContext::spawn_local(job).is_err());
    }

    // Randomized victim-selection fuzz test: a variable number of workers
    // each get a randomly sized batch of local work and spend the rest of
    // their time stealing from siblings. Regardless of the random shape,
    // every job must run exactly once.
    #[test]
    fn random_work_distribution_runs_every_job_exactly_once() {
        use rand::{Rng, SeedableRng};
        use rand_xorshift::XorShiftRng;

        let mut seed_rng = XorShiftRng::seed_from_u64(0xC0FF_EE00_D15E_A5E5);
        let num_workers = seed_rng.gen_range(2..6);

        let deques: Vec<Deque<Job>> = (0..num_workers).map(|_| Deque::new_lifo()).collect();
        let stealers: Vec<Stealer<Job>> = deques.iter().map(|d| d.stealer()).collect();
        let stealers = Arc::new(RwLock::new(stealers));
        let global: Arc<dyn JobQueue> = Arc::new(BasicQueue::new());
        let executed = Arc::new(StdAtomicUsize::new(0));

        let mut total_jobs = 0usize;
        let mut next_id = 0usize;
        for deque in &deques {
            let batch = seed_rng.gen_range(0..50);
            for _ in 0..batch {
                let executed = Arc::clone(&executed);
                let id = next_id;
                next_id += 1;
                deque.push(Job::new(format!("job{id}"), move || {
                    executed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }));
                total_jobs += 1;
            }
        }
        global.stop();

        let shutdown = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = deques
            .into_iter()
            .enumerate()
            .map(|(index, deque)| {
                let ctx = WorkerContext::new(
                    index,
                    deque,
                    Arc::clone(&stealers),
                    Arc::clone(&global),
                    Arc::new(WorkerStats::new()),
                    Arc::new(PoolMetrics::new("fuzz", false)),
                    Arc::new(ThreadContext::new()),
                    CancellationToken::create(),
                    Arc::clone(&shutdown),
                    Arc::new(AtomicBool::new(false)),
                );
                thread::spawn(move || ctx.run())
            })
            .collect();

        shutdown.store(true, Ordering::Release);
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(executed.load(Ordering::SeqCst), total_jobs);
    }
}
