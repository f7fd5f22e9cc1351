//! Core job-execution engine: a work-stealing thread pool with pluggable
//! queue strategies, cooperative cancellation, a circuit breaker, and an
//! autoscaler. See `SPEC_FULL.md` for the full design; `DESIGN.md` for how
//! each module is grounded.
//!
//! The crate has no async runtime dependency (§9): futures returned by
//! `Pool::submit_async` are a hand-rolled oneshot (`future` module) usable
//! either with `.wait()`/`.wait_timeout()` or polled by any executor.

pub mod autoscaler;
pub mod builder;
pub mod cancellation;
pub mod circuit_breaker;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod future;
pub mod job;
pub mod log;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod reclaim;
pub mod typed_pool;
mod unwind;
pub mod worker;

pub use autoscaler::{
    Autoscaler, AutoscalingPolicy, AutoscalingStats, ScaleDownConfig, ScaleUpConfig,
    ScalingDecision, ScalingDirection, ScalingMetricsSample, ScalingMode, ScalingReason,
};
pub use builder::{PoolBuilder, QueueKind};
pub use cancellation::{CancellationReason, CancellationToken};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, ProtectedQueue};
pub use context::ThreadContext;
pub use diagnostics::{BottleneckReport, BottleneckType, DiagnosticsConfig, EventTracer, ThreadInfo, TraceEvent};
pub use error::{EngineError, EngineResult};
pub use executor::Executor;
pub use future::{JobFuture, JobPromise};
pub use job::{Job, Priority, RetryPolicy};
pub use metrics::{LatencyHistogram, LatencyPercentiles, MetricsSnapshot, PoolMetrics, ThroughputWindow};
pub use pool::{Pool, WorkerHealth};
pub use queue::{
    AdaptivePolicy, AdaptiveQueue, BackpressureConfig, BackpressurePolicy, BackpressureQueue,
    BasicQueue, CallbackDecision, JobQueue, LockFreeQueue, PressureLevel, RateLimit, TypedQueue,
};
pub use typed_pool::{TypedPool, TypedWorkerSpec};
