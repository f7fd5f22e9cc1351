//! Structured error taxonomy for the engine. Every fallible public operation
//! returns `Result<T, EngineError>`; nothing in this crate's own code panics
//! or throws to signal an expected failure. See SPEC_FULL.md §7.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::cancellation::CancellationReason;

/// The single error type returned by every fallible operation in the engine.
/// `Clone` so a result can be handed both to a `JobFuture` and back as the
/// wrapping job's own return value (see `Pool::submit_async`) without
/// collapsing it to a string first.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A null job, malformed policy, or otherwise invalid argument was supplied.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The queue's capacity bound was reached and no policy resolved it.
    #[error("queue is full")]
    QueueFull,

    /// A non-blocking dequeue found the queue empty.
    #[error("queue is empty")]
    QueueEmpty,

    /// The operation was attempted after the queue (or pool) was stopped.
    #[error("queue has been stopped")]
    QueueStopped,

    /// A blocking operation (backpressure wait, rate-limit wait) exceeded its timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The circuit breaker denied admission.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The job's cancellation token fired during execution.
    #[error("operation cancelled: {0:?}")]
    Cancelled(CancellationReason),

    /// `start()` was called on a pool that is already running.
    #[error("pool is already running")]
    AlreadyRunning,

    /// An operation that requires a running pool was attempted while stopped.
    #[error("pool is not running")]
    NotRunning,

    /// The base `Job::execute` was invoked without being overridden.
    #[error("execute() is not implemented for this job")]
    NotImplemented,

    /// A job's `execute` or one of its composition callbacks unwound via `panic!`.
    #[error("job panicked: {0}")]
    JobPanicked(String),
}

impl EngineError {
    /// Renders a caught panic payload as a `JobPanicked` error.
    pub(crate) fn from_panic_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        EngineError::JobPanicked(message)
    }
}

/// A lightweight, `Clone`-able summary of an `EngineError`, used where the
/// full error needs to be stored (e.g. in diagnostics or completion hooks)
/// without requiring `EngineError` itself to be `Clone`.
#[derive(Debug, Clone)]
pub struct ErrorSummary {
    pub message: String,
}

impl fmt::Display for ErrorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<&EngineError> for ErrorSummary {
    fn from(err: &EngineError) -> Self {
        ErrorSummary {
            message: err.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
