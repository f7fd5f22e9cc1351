//! `concur-engine`: a concurrent job execution engine with work-stealing,
//! backpressure, circuit breaking and autoscaling.
//!
//! This crate is a thin facade over `engine-core`; see that crate's docs
//! (and this repository's `SPEC_FULL.md`/`DESIGN.md`) for the full design.
//! It exists so host applications depend on a single, stably-named crate
//! while the engine's internals stay free to reorganize within `engine-core`.

pub use engine_core::{
    AdaptivePolicy, AdaptiveQueue, Autoscaler, AutoscalingPolicy, AutoscalingStats,
    BackpressureConfig, BackpressurePolicy, BackpressureQueue, BasicQueue, BottleneckReport,
    BottleneckType, CallbackDecision, CancellationReason, CancellationToken, CircuitBreaker,
    CircuitBreakerConfig, DiagnosticsConfig, EngineError, EngineResult, EventTracer, Executor, Job,
    JobFuture, JobPromise, JobQueue, LatencyHistogram, LatencyPercentiles, LockFreeQueue,
    MetricsSnapshot, Pool, PoolBuilder, PoolMetrics, PressureLevel, Priority, ProtectedQueue,
    QueueKind, RateLimit, RetryPolicy, ScaleDownConfig, ScaleUpConfig, ScalingDecision,
    ScalingDirection, ScalingMetricsSample, ScalingMode, ScalingReason, ThreadContext, ThreadInfo,
    ThroughputWindow, TraceEvent, TypedPool, TypedQueue, TypedWorkerSpec, WorkerHealth,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn facade_reexports_are_usable_end_to_end() {
        let pool = PoolBuilder::new().num_threads(2).build().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::clone(&counter);
        pool.submit(Job::new("x", move || {
            counter2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        while counter.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.stop(false);
    }
}
