//! `PoolBuilder`: the engine's configuration surface, in the shape of the
//! teacher's `ThreadPoolBuilder` (construction deferred to `.build()`,
//! fallible, everything optional with a sane default). SPEC_FULL.md §6C.

use std::sync::Arc;

use crate::context::ThreadContext;
use crate::error::{EngineError, EngineResult};
use crate::pool::Pool;
use crate::queue::{AdaptiveQueue, AdaptivePolicy, BasicQueue, JobQueue, LockFreeQueue};

/// Which queue implementation backs a pool's global queue.
pub enum QueueKind {
    Basic,
    LockFree,
    Adaptive(AdaptivePolicy),
}

impl Default for QueueKind {
    fn default() -> Self {
        QueueKind::Adaptive(AdaptivePolicy::Balanced)
    }
}

type PanicHandler = dyn Fn(usize, &EngineError) + Send + Sync;
type StartHandler = dyn Fn(usize) + Send + Sync;
type ExitHandler = dyn Fn(usize) + Send + Sync;

/// Builds a `Pool`. Mirrors the teacher's `ThreadPoolBuilder`: every setting
/// has a default, setters take `self` by value for chaining, and
/// `ENGINE_NUM_THREADS` overrides `num_threads` the way rayon honors
/// `RAYON_NUM_THREADS`.
#[derive(Default)]
pub struct PoolBuilder {
    num_threads: Option<usize>,
    thread_name_prefix: Option<String>,
    queue_kind: QueueKind,
    panic_handler: Option<Box<PanicHandler>>,
    start_handler: Option<Box<StartHandler>>,
    exit_handler: Option<Box<ExitHandler>>,
    enhanced_metrics: bool,
    context: ThreadContext,
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker count. If unset, `build()` uses `ENGINE_NUM_THREADS`
    /// when present and parseable, else `num_cpus::get()`.
    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = Some(n);
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = Some(prefix.into());
        self
    }

    pub fn queue_kind(mut self, kind: QueueKind) -> Self {
        self.queue_kind = kind;
        self
    }

    pub fn panic_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(usize, &EngineError) + Send + Sync + 'static,
    {
        self.panic_handler = Some(Box::new(handler));
        self
    }

    pub fn start_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.start_handler = Some(Box::new(handler));
        self
    }

    pub fn exit_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.exit_handler = Some(Box::new(handler));
        self
    }

    /// Enables the latency histogram and sliding-window throughput counter
    /// in `Pool::metrics_snapshot`. Off by default since the histogram adds
    /// a per-completion atomic bucket update.
    pub fn enhanced_metrics(mut self, enabled: bool) -> Self {
        self.enhanced_metrics = enabled;
        self
    }

    /// Supplies the optional host-facing `log`/`metrics_sink` hook pair
    /// (SPEC_FULL.md §6 "Context interface").
    pub fn thread_context(mut self, context: ThreadContext) -> Self {
        self.context = context;
        self
    }

    fn resolve_num_threads(&self) -> usize {
        if let Some(n) = self.num_threads {
            return n.max(1);
        }
        if let Ok(value) = std::env::var("ENGINE_NUM_THREADS") {
            if let Ok(n) = value.parse::<usize>() {
                if n > 0 {
                    return n;
                }
            }
        }
        num_cpus::get().max(1)
    }

    fn build_queue(&self) -> Arc<dyn JobQueue> {
        match &self.queue_kind {
            QueueKind::Basic => Arc::new(BasicQueue::new()),
            QueueKind::LockFree => Arc::new(LockFreeQueue::new()),
            QueueKind::Adaptive(policy) => Arc::new(AdaptiveQueue::new(*policy)),
        }
    }

    /// Builds and starts the pool: spawns `num_threads` worker threads.
    pub fn build(self) -> EngineResult<Pool> {
        let num_threads = self.resolve_num_threads();
        let global = self.build_queue();
        Pool::start(
            num_threads,
            global,
            self.thread_name_prefix,
            self.panic_handler,
            self.start_handler,
            self.exit_handler,
            self.enhanced_metrics,
            self.context,
        )
    }
}
