//! The pool: owns the global queue, the worker threads, and their local
//! deques/stealers. SPEC_FULL.md §4.5, §6. Grounded on `registry.rs`'s
//! `Registry::new` (build workers+stealers, spawn threads, `Terminator`
//! drop-guard) and its `terminate()`/lifecycle dance, generalized from a
//! single global `Registry` to an explicitly constructed, stoppable `Pool`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crossbeam_deque::{Stealer, Worker as Deque};

use crate::cancellation::CancellationToken;
use crate::context::ThreadContext;
use crate::error::{EngineError, EngineResult};
use crate::future::{self, JobFuture};
use crate::job::Job;
use crate::log::{self, Event};
use crate::metrics::{MetricsSnapshot, PoolMetrics};
use crate::queue::JobQueue;
use crate::worker::{WorkerContext, WorkerStats};

type PanicHandler = dyn Fn(usize, &EngineError) + Send + Sync;
type StartHandler = dyn Fn(usize) + Send + Sync;
type ExitHandler = dyn Fn(usize) + Send + Sync;

struct WorkerHandle {
    stats: Arc<WorkerStats>,
    local_shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

/// Snapshot of one worker's health, used by `Pool::check_worker_health`.
#[derive(Debug, Clone)]
pub struct WorkerHealth {
    pub index: usize,
    pub busy: bool,
    pub current_job_id: Option<u64>,
    pub jobs_executed: u64,
    pub jobs_stolen: u64,
    pub thread_alive: bool,
}

/// Guarantees `terminate()` runs even if `Pool::start` returns early via `?`,
/// mirroring `registry.rs`'s `Terminator` drop guard.
struct ShutdownGuard<'a>(&'a Pool, bool);

impl<'a> Drop for ShutdownGuard<'a> {
    fn drop(&mut self) {
        if !self.1 {
            self.0.stop(true);
        }
    }
}

/// A running (or stopped) set of worker threads sharing one global queue.
pub struct Pool {
    global: Arc<dyn JobQueue>,
    stealers: Arc<RwLock<Vec<Stealer<Job>>>>,
    workers: Mutex<Vec<WorkerHandle>>,
    shutdown: Arc<AtomicBool>,
    running: AtomicBool,
    cancellation: CancellationToken,
    exit_handler: Option<Arc<ExitHandler>>,
    panic_handler: Option<Arc<PanicHandler>>,
    start_handler: Option<Arc<StartHandler>>,
    thread_name_prefix: Option<String>,
    metrics: Arc<PoolMetrics>,
    context: Arc<ThreadContext>,
}

impl Pool {
    pub(crate) fn start(
        num_threads: usize,
        global: Arc<dyn JobQueue>,
        thread_name_prefix: Option<String>,
        panic_handler: Option<Box<PanicHandler>>,
        start_handler: Option<Box<StartHandler>>,
        exit_handler: Option<Box<ExitHandler>>,
        enhanced_metrics: bool,
        context: ThreadContext,
    ) -> EngineResult<Pool> {
        let (deques, stealers): (Vec<_>, Vec<_>) = (0..num_threads)
            .map(|_| {
                let deque = Deque::new_lifo();
                let stealer = deque.stealer();
                (deque, stealer)
            })
            .unzip();

        let pool_name = thread_name_prefix.clone().unwrap_or_else(|| "pool".to_string());
        let pool = Pool {
            global,
            stealers: Arc::new(RwLock::new(stealers)),
            workers: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(true),
            cancellation: CancellationToken::create(),
            exit_handler: exit_handler.map(Arc::from),
            panic_handler: panic_handler.map(Arc::from),
            start_handler: start_handler.map(Arc::from),
            thread_name_prefix,
            metrics: Arc::new(PoolMetrics::new(pool_name, enhanced_metrics)),
            context: Arc::new(context),
        };

        let mut guard = ShutdownGuard(&pool, false);
        for (index, deque) in deques.into_iter().enumerate() {
            let handle = pool.spawn_worker(index, deque)?;
            pool.workers.lock().unwrap().push(handle);
        }
        guard.1 = true;
        drop(guard);

        Ok(pool)
    }

    fn spawn_worker(&self, index: usize, deque: Deque<Job>) -> EngineResult<WorkerHandle> {
        let stats = Arc::new(WorkerStats::new());
        let local_shutdown = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::create_linked(&[self.cancellation.clone()]);
        let mut ctx = WorkerContext::new(
            index,
            deque,
            Arc::clone(&self.stealers),
            Arc::clone(&self.global),
            Arc::clone(&stats),
            Arc::clone(&self.metrics),
            Arc::clone(&self.context),
            token,
            Arc::clone(&self.shutdown),
            Arc::clone(&local_shutdown),
        );
        if let Some(handler) = &self.panic_handler {
            ctx = ctx.with_panic_handler(Arc::clone(handler));
        }

        let start_handler = self.start_handler.clone();
        let exit_handler = self.exit_handler.clone();
        let mut builder = std::thread::Builder::new();
        if let Some(prefix) = &self.thread_name_prefix {
            builder = builder.name(format!("{prefix}-{index}"));
        }

        let join = builder
            .spawn(move || {
                if let Some(handler) = &start_handler {
                    handler(index);
                }
                ctx.run();
                if let Some(handler) = &exit_handler {
                    handler(index);
                }
            })
            .map_err(|e| EngineError::InvalidArgument(format!("failed to spawn worker: {e}")))?;

        Ok(WorkerHandle {
            stats,
            local_shutdown,
            join: Some(join),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Adds one worker at the end of the index space. Used by the autoscaler
    /// (and available for manual scaling) on a running pool.
    pub fn add_worker(&self) -> EngineResult<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(EngineError::NotRunning);
        }
        let mut workers = self.workers.lock().unwrap();
        let index = workers.len();
        let deque = Deque::new_lifo();
        self.stealers.write().unwrap().push(deque.stealer());
        let handle = self.spawn_worker(index, deque)?;
        workers.push(handle);
        Ok(())
    }

    /// Removes the most recently added worker. It stops pulling new work
    /// immediately and exits once its own local deque drains; any work still
    /// queued globally or stealable is left for the remaining workers.
    pub fn remove_worker(&self) -> EngineResult<()> {
        let mut workers = self.workers.lock().unwrap();
        if workers.len() <= 1 {
            return Err(EngineError::InvalidArgument(
                "cannot remove the last worker".to_string(),
            ));
        }
        let mut handle = workers.pop().unwrap();
        self.stealers.write().unwrap().pop();
        drop(workers);

        handle.local_shutdown.store(true, Ordering::Release);
        if let Some(join) = handle.join.take() {
            let _ = join.join();
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Submits a job to the global queue.
    pub fn submit(&self, job: Job) -> EngineResult<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(EngineError::NotRunning);
        }
        match self.global.enqueue(job) {
            Ok(()) => {
                self.metrics.record_submitted();
                Ok(())
            }
            Err(err) => {
                self.metrics.record_rejected();
                Err(err)
            }
        }
    }

    /// Submits `jobs` as a single atomic batch: either every job is enqueued
    /// or none are, per the underlying queue variant's own `enqueue_batch`.
    pub fn submit_batch(&self, jobs: Vec<Job>) -> EngineResult<()> {
        if !self.running.load(Ordering::Acquire) {
            return Err(EngineError::NotRunning);
        }
        let count = jobs.len() as u64;
        match self.global.enqueue_batch(jobs) {
            Ok(()) => {
                for _ in 0..count {
                    self.metrics.record_submitted();
                }
                Ok(())
            }
            Err(err) => {
                self.metrics.record_rejected();
                Err(err)
            }
        }
    }

    /// Submits a job and returns a future resolving to its result. The
    /// future and the job's own returned `EngineResult<()>` carry the same
    /// value, so a caught panic still reaches `worker.rs::execute`'s
    /// `JobPanicked` handling exactly as it would for a plain `submit`.
    pub fn submit_async(&self, job: Job) -> EngineResult<JobFuture<EngineResult<()>>> {
        let (promise, future) = future::channel();
        let wrapped = Job::new(job_name(&job), move || {
            let result = run_and_capture(job);
            promise.fulfill(result.clone());
            result
        });
        self.submit(wrapped)?;
        Ok(future)
    }

    /// Submits every job in `jobs` as one atomic batch (see `submit_batch`),
    /// returning one future per job in the same order.
    pub fn submit_batch_async(
        &self,
        jobs: Vec<Job>,
    ) -> EngineResult<Vec<JobFuture<EngineResult<()>>>> {
        if !self.running.load(Ordering::Acquire) {
            return Err(EngineError::NotRunning);
        }
        let count = jobs.len() as u64;
        let mut wrapped = Vec::with_capacity(jobs.len());
        let mut futures = Vec::with_capacity(jobs.len());
        for job in jobs {
            let (promise, future) = future::channel();
            let name = job_name(&job);
            wrapped.push(Job::new(name, move || {
                let result = run_and_capture(job);
                promise.fulfill(result.clone());
                result
            }));
            futures.push(future);
        }
        match self.global.enqueue_batch(wrapped) {
            Ok(()) => {
                for _ in 0..count {
                    self.metrics.record_submitted();
                }
                Ok(futures)
            }
            Err(err) => {
                self.metrics.record_rejected();
                Err(err)
            }
        }
    }

    /// Submits every job in `jobs`, blocks until all complete, and returns
    /// their results in submission order.
    pub fn submit_all(&self, jobs: Vec<Job>) -> EngineResult<Vec<EngineResult<()>>> {
        let futures = self.submit_batch_async(jobs)?;
        Ok(futures.into_iter().map(JobFuture::wait).collect())
    }

    /// Submits every job in `jobs`; returns whichever completes first and
    /// cancels the rest via their own `CancellationToken`. Cancellation is
    /// cooperative (see `cancellation.rs`): a job body that never checks its
    /// token keeps running to completion regardless, it just loses the race.
    pub fn submit_any(&self, jobs: Vec<Job>) -> EngineResult<EngineResult<()>> {
        if jobs.is_empty() {
            return Err(EngineError::InvalidArgument(
                "submit_any requires at least one job".to_string(),
            ));
        }
        if !self.running.load(Ordering::Acquire) {
            return Err(EngineError::NotRunning);
        }

        let (promise, future) = future::channel();
        let promise = Arc::new(Mutex::new(Some(promise)));
        let count = jobs.len() as u64;
        let mut tokens = Vec::with_capacity(jobs.len());
        let mut wrapped = Vec::with_capacity(jobs.len());
        for job in jobs {
            let token = CancellationToken::create();
            tokens.push(token.clone());
            let name = job_name(&job);
            let job = job.with_cancellation(token);
            let promise = Arc::clone(&promise);
            wrapped.push(Job::new(name, move || {
                let result = run_and_capture(job);
                if let Some(promise) = promise.lock().unwrap().take() {
                    promise.fulfill(result.clone());
                }
                result
            }));
        }

        if let Err(err) = self.global.enqueue_batch(wrapped) {
            self.metrics.record_rejected();
            return Err(err);
        }
        for _ in 0..count {
            self.metrics.record_submitted();
        }

        let result = future.wait();
        for token in &tokens {
            token.cancel();
        }
        Ok(result)
    }

    /// Returns a liveness/throughput snapshot for every worker.
    pub fn check_worker_health(&self) -> Vec<WorkerHealth> {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .map(|(index, handle)| WorkerHealth {
                index,
                busy: handle.stats.is_busy(),
                current_job_id: handle.stats.current_job_id(),
                jobs_executed: handle.stats.jobs_executed(),
                jobs_stolen: handle.stats.jobs_stolen(),
                thread_alive: handle
                    .join
                    .as_ref()
                    .map(|j| !j.is_finished())
                    .unwrap_or(false),
            })
            .collect()
    }

    /// Returns a point-in-time snapshot of this pool's metrics counters,
    /// also forwarding it to the `ThreadContext`'s `metrics_sink` hook (if
    /// one was supplied at construction) before returning it to the caller.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let health = self.check_worker_health();
        let active = health.iter().filter(|h| h.busy).count();
        let snapshot = self.metrics.snapshot(health.len(), active, self.global.size());
        self.context.metrics_sink(&snapshot);
        snapshot
    }

    /// Stops the pool. If `immediate`, the global queue is stopped and
    /// workers drain only what they already hold locally before exiting,
    /// dropping anything still queued globally. If not immediate, the
    /// global queue drains fully before workers exit.
    pub fn stop(&self, immediate: bool) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if immediate {
            self.global.clear();
        }
        self.global.stop();
        self.shutdown.store(true, Ordering::Release);
        self.cancellation.cancel();

        let mut workers = self.workers.lock().unwrap();
        for handle in workers.iter_mut() {
            if let Some(join) = handle.join.take() {
                let _ = join.join();
            }
        }
        log::debug(|| Event::ThreadStop { worker: usize::MAX });
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.stop(true);
    }
}

fn job_name(job: &Job) -> String {
    job.name().unwrap_or("async").to_string()
}

fn run_and_capture(job: Job) -> EngineResult<()> {
    job.execute()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PoolBuilder;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration;

    #[test]
    fn runs_submitted_jobs() {
        let pool = PoolBuilder::new().num_threads(2).build().unwrap();
        let counter = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.submit(Job::new("x", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 50 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        pool.stop(false);
    }

    #[test]
    fn submit_after_stop_is_rejected() {
        let pool = PoolBuilder::new().num_threads(1).build().unwrap();
        pool.stop(true);
        match pool.submit(Job::new("x", || Ok(()))) {
            Err(EngineError::NotRunning) => {}
            other => panic!("expected NotRunning, got {other:?}"),
        }
    }

    #[test]
    fn submit_async_resolves_future() {
        let pool = PoolBuilder::new().num_threads(2).build().unwrap();
        let future = pool
            .submit_async(Job::new("x", || Ok(())))
            .unwrap();
        assert!(future.wait_timeout(Duration::from_secs(1)).unwrap().is_ok());
        pool.stop(false);
    }
}
