//! The job unit and its lazily allocated composition block. See SPEC_FULL.md §3.1, §4.3.

use std::panic::{AssertUnwindSafe, RefUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::cancellation::CancellationToken;
use crate::error::{EngineError, EngineResult};
use crate::unwind;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

fn allocate_job_id() -> u64 {
    NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed)
}

/// Priority level used by typed queues and typed pools. Tested in descending
/// order: `High` before `Normal` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// All priority levels, ordered highest-first, for iterating a typed queue.
pub const PRIORITY_LEVELS_DESCENDING: [Priority; 3] =
    [Priority::High, Priority::Normal, Priority::Low];

/// How many times, and with what backoff, a failed job should be retried.
/// Retrying is the caller's/worker policy's responsibility; the job itself
/// only carries the declared policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 1,
            backoff: Duration::from_millis(0),
        }
    }
}

type OnComplete = Box<dyn FnOnce(&EngineResult<()>) + Send>;
type OnError = Box<dyn FnOnce(&EngineError) + Send>;

/// Lazily allocated extras. Most jobs need none of these, so a `Job` without
/// any `with_*` call carries no heap allocation beyond the boxed closure.
#[derive(Default)]
struct JobComponents {
    on_complete: Option<OnComplete>,
    on_error: Option<OnError>,
    priority: Option<Priority>,
    cancellation: Option<CancellationToken>,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

/// A unit of work. Constructed with a name (and optionally a binary payload),
/// assigned an id immediately, and exposing one operation: `execute`.
pub struct Job {
    id: u64,
    name: Option<String>,
    payload: Option<Vec<u8>>,
    created_at: Instant,
    body: Box<dyn FnOnce() -> EngineResult<()> + Send>,
    components: Option<Box<JobComponents>>,
}

impl Job {
    /// Creates a job with just a name.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce() -> EngineResult<()> + Send + 'static,
    {
        Job {
            id: allocate_job_id(),
            name: Some(name.into()),
            payload: None,
            created_at: Instant::now(),
            body: Box::new(body),
            components: None,
        }
    }

    /// Creates a job with a name and a binary payload.
    pub fn with_payload<F>(name: impl Into<String>, payload: Vec<u8>, body: F) -> Self
    where
        F: FnOnce() -> EngineResult<()> + Send + 'static,
    {
        let mut job = Self::new(name, body);
        job.payload = Some(payload);
        job
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn priority(&self) -> Priority {
        self.components
            .as_ref()
            .and_then(|c| c.priority)
            .unwrap_or_default()
    }

    pub fn cancellation_token(&self) -> Option<&CancellationToken> {
        self.components.as_ref().and_then(|c| c.cancellation.as_ref())
    }

    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.components.as_ref().and_then(|c| c.retry)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.components.as_ref().and_then(|c| c.timeout)
    }

    fn components_mut(&mut self) -> &mut JobComponents {
        self.components.get_or_insert_with(|| Box::new(JobComponents::default()))
    }

    /// Attaches an on-complete callback, allocating the components block on
    /// first use. Returns `self` for chaining.
    pub fn with_on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&EngineResult<()>) + Send + 'static,
    {
        self.components_mut().on_complete = Some(Box::new(callback));
        self
    }

    /// Attaches an on-error callback. Returns `self` for chaining.
    pub fn with_on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&EngineError) + Send + 'static,
    {
        self.components_mut().on_error = Some(Box::new(callback));
        self
    }

    /// Declares this job's priority for typed queues/pools. Returns `self`.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.components_mut().priority = Some(priority);
        self
    }

    /// Attaches a retry policy. Returns `self`.
    ///
    /// Not yet enforced: `worker.rs` reads neither this nor `timeout()`. A
    /// job body is a `FnOnce`, consumed by its one call to `execute`, so
    /// retrying it would require the caller to hand over a re-runnable
    /// factory instead of a single closure — a larger change than this
    /// accessor. Stored now so that change doesn't need a public API break
    /// later.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.components_mut().retry = Some(policy);
        self
    }

    /// Attaches an execution timeout. Returns `self`.
    ///
    /// Not yet enforced: a worker runs a job's body synchronously on its own
    /// thread, so stopping it mid-execution would need a second thread per
    /// job to preempt against, with no safe way to actually kill the
    /// original if it doesn't return — worse than not enforcing it. Accepted
    /// here as forward-compatible configuration; `timeout()` lets a future
    /// worker implementation (or a caller wrapping its own job body in a
    /// deadline check) read it back.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.components_mut().timeout = Some(timeout);
        self
    }

    /// Attaches an explicit cancellation token (in addition to whatever the
    /// worker links in at dequeue time). Returns `self`.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.components_mut().cancellation = Some(token);
        self
    }

    /// Runs the job body, catching any panic and converting it to
    /// `EngineError::JobPanicked`, then invokes `on_error`/`on_complete` in
    /// that order. The panic-catching wraps the *whole* hook sequence so a
    /// panicking callback is treated the same as a panicking body: it is
    /// counted as a failure and does not propagate out of `execute`.
    pub fn execute(self) -> EngineResult<()> {
        let Job {
            body, components, ..
        } = self;

        let result: EngineResult<()> = match unwind::halt_unwinding(AssertUnwindSafe(body)) {
            Ok(r) => r,
            Err(payload) => Err(EngineError::from_panic_payload(payload)),
        };

        if let Some(mut components) = components {
            if let Err(ref err) = result {
                if let Some(on_error) = components.on_error.take() {
                    let _ = unwind::halt_unwinding(AssertUnwindSafe(|| on_error(err)));
                }
            }
            if let Some(on_complete) = components.on_complete.take() {
                let _ = unwind::halt_unwinding(AssertUnwindSafe(|| on_complete(&result)));
            }
        }

        result
    }
}

// The job body and callbacks are only ever invoked once, inside
// `halt_unwinding`, from a single worker thread; treating them as unwind-safe
// mirrors the teacher's `StackJob` which does the same for its closure.
impl RefUnwindSafe for Job {}
