//! `ThreadContext`: the optional host-supplied hook pair named in
//! SPEC_FULL.md §6 "Context interface" — `log(level, message)` and
//! `metrics_sink(snapshot)`, both fire-and-forget. Distinct from the crate's
//! own `log` module (§6A): that facade is for crate-maintainer diagnostics
//! routed through the global `log` crate, this is a pool-scoped channel for
//! a host application's own telemetry, supplied at `PoolBuilder` time.

use std::sync::Arc;

use crate::metrics::MetricsSnapshot;

type LogHook = dyn Fn(log::Level, &str) + Send + Sync;
type MetricsHook = dyn Fn(&MetricsSnapshot) + Send + Sync;

/// Optional host hooks for a single pool instance. Neither hook is assumed
/// to exist; calling `log`/`metrics_sink` with neither set is a no-op.
#[derive(Clone, Default)]
pub struct ThreadContext {
    log: Option<Arc<LogHook>>,
    metrics_sink: Option<Arc<MetricsHook>>,
}

impl ThreadContext {
    pub fn new() -> Self {
        ThreadContext::default()
    }

    /// Attaches a hook called (fire-and-forget, on whichever thread observed
    /// the event) for application-facing job lifecycle events.
    pub fn with_log<F>(mut self, hook: F) -> Self
    where
        F: Fn(log::Level, &str) + Send + Sync + 'static,
    {
        self.log = Some(Arc::new(hook));
        self
    }

    /// Attaches a hook called whenever `Pool::metrics_snapshot` computes a
    /// fresh snapshot, in addition to returning it to the caller.
    pub fn with_metrics_sink<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MetricsSnapshot) + Send + Sync + 'static,
    {
        self.metrics_sink = Some(Arc::new(hook));
        self
    }

    pub(crate) fn log(&self, level: log::Level, message: &str) {
        if let Some(hook) = &self.log {
            hook(level, message);
        }
    }

    pub(crate) fn metrics_sink(&self, snapshot: &MetricsSnapshot) {
        if let Some(hook) = &self.metrics_sink {
            hook(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn missing_hooks_are_a_silent_no_op() {
        let ctx = ThreadContext::new();
        ctx.log(log::Level::Info, "hello");
        ctx.metrics_sink(&crate::metrics::PoolMetrics::new("p", false).snapshot(1, 0, 0));
    }

    #[test]
    fn log_hook_observes_level_and_message() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let ctx = ThreadContext::new().with_log(move |level, _message| {
            if level == log::Level::Warn {
                seen2.fetch_add(1, Ordering::SeqCst);
            }
        });
        ctx.log(log::Level::Warn, "worker panicked");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn metrics_sink_receives_snapshot() {
        let received = Arc::new(AtomicUsize::new(0));
        let received2 = Arc::clone(&received);
        let ctx = ThreadContext::new().with_metrics_sink(move |snapshot| {
            received2.store(snapshot.worker_count, Ordering::SeqCst);
        });
        let metrics = crate::metrics::PoolMetrics::new("p", false);
        ctx.metrics_sink(&metrics.snapshot(3, 1, 0));
        assert_eq!(received.load(Ordering::SeqCst), 3);
    }
}
