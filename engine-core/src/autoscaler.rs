//! Background monitor that scales a pool's worker count to its load.
//! SPEC_FULL.md §4.8. Grounded on `original_source/include/kcenon/thread/
//! scaling/autoscaler.h`, `autoscaling_policy.h` and `scaling_metrics.h`
//! (the C++ struct fields and manual-trigger surface), re-expressed over
//! `Pool::add_worker`/`remove_worker` with the background loop built the way
//! `worker.rs`'s own thread loop is: a dedicated `std::thread` parked on a
//! condvar, woken by `stop`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{EngineError, EngineResult};
use crate::log::{self, Event};
use crate::pool::Pool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    Disabled,
    Manual,
    Automatic,
}

#[derive(Debug, Clone, Copy)]
pub struct ScaleUpConfig {
    pub queue_depth_threshold: f64,
    pub utilization_threshold: f64,
    pub latency_threshold_ms: f64,
    pub pending_jobs_threshold: usize,
}

impl Default for ScaleUpConfig {
    fn default() -> Self {
        ScaleUpConfig {
            queue_depth_threshold: 100.0,
            utilization_threshold: 0.8,
            latency_threshold_ms: 50.0,
            pending_jobs_threshold: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScaleDownConfig {
    pub utilization_threshold: f64,
    pub queue_depth_threshold: f64,
    pub idle_duration: Duration,
}

impl Default for ScaleDownConfig {
    fn default() -> Self {
        ScaleDownConfig {
            utilization_threshold: 0.3,
            queue_depth_threshold: 10.0,
            idle_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoscalingPolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up: ScaleUpConfig,
    pub scale_down: ScaleDownConfig,
    pub scale_up_increment: usize,
    pub scale_down_increment: usize,
    pub scale_up_factor: f64,
    pub use_multiplicative_scaling: bool,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    pub sample_interval: Duration,
    pub samples_for_decision: usize,
    pub scaling_mode: ScalingMode,
}

impl Default for AutoscalingPolicy {
    fn default() -> Self {
        AutoscalingPolicy {
            min_workers: 1,
            max_workers: num_cpus::get().max(1),
            scale_up: ScaleUpConfig::default(),
            scale_down: ScaleDownConfig::default(),
            scale_up_increment: 1,
            scale_down_increment: 1,
            scale_up_factor: 1.5,
            use_multiplicative_scaling: false,
            scale_up_cooldown: Duration::from_secs(30),
            scale_down_cooldown: Duration::from_secs(60),
            sample_interval: Duration::from_secs(1),
            samples_for_decision: 5,
            scaling_mode: ScalingMode::Disabled,
        }
    }
}

impl AutoscalingPolicy {
    /// Rejects configurations that would oscillate or are self-contradictory.
    pub fn is_valid(&self) -> bool {
        if self.min_workers == 0 || self.min_workers > self.max_workers {
            return false;
        }
        if self.scale_up_increment == 0 || self.scale_down_increment == 0 {
            return false;
        }
        if self.scale_down.utilization_threshold >= self.scale_up.utilization_threshold {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDirection {
    None,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingReason {
    QueueDepth,
    WorkerUtilization,
    Latency,
    Manual,
    Scheduled,
}

#[derive(Debug, Clone)]
pub struct ScalingDecision {
    pub direction: ScalingDirection,
    pub reason: ScalingReason,
    pub target_workers: usize,
    pub explanation: String,
}

impl ScalingDecision {
    fn none(workers: usize) -> Self {
        ScalingDecision {
            direction: ScalingDirection::None,
            reason: ScalingReason::QueueDepth,
            target_workers: workers,
            explanation: "no threshold crossed".to_string(),
        }
    }

    pub fn should_scale(&self) -> bool {
        self.direction != ScalingDirection::None
    }
}

/// One aggregated look at pool load, pushed into the bounded history every
/// `sample_interval`.
#[derive(Debug, Clone, Copy)]
pub struct ScalingMetricsSample {
    pub worker_count: usize,
    pub active_workers: usize,
    pub queue_depth: usize,
    pub utilization: f64,
    pub queue_depth_per_worker: f64,
    pub jobs_completed: u64,
    /// p95 job execution latency, in milliseconds, from the pool's latency
    /// histogram. `0.0` if the pool wasn't built with enhanced metrics.
    pub p95_latency_ms: f64,
    /// Jobs currently queued and not yet picked up by a worker. Distinct
    /// from `queue_depth_per_worker` in that it isn't normalized, so a
    /// policy can set an absolute backlog ceiling regardless of fleet size.
    pub pending_jobs: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AutoscalingStats {
    pub scale_up_count: usize,
    pub scale_down_count: usize,
    pub decisions_evaluated: usize,
    pub peak_workers: usize,
    pub min_workers_observed: usize,
}

struct StatsInner {
    scale_up_count: AtomicUsize,
    scale_down_count: AtomicUsize,
    decisions_evaluated: AtomicUsize,
    peak_workers: AtomicUsize,
    min_workers_observed: AtomicUsize,
}

impl StatsInner {
    fn new(initial_workers: usize) -> Self {
        StatsInner {
            scale_up_count: AtomicUsize::new(0),
            scale_down_count: AtomicUsize::new(0),
            decisions_evaluated: AtomicUsize::new(0),
            peak_workers: AtomicUsize::new(initial_workers),
            min_workers_observed: AtomicUsize::new(initial_workers),
        }
    }

    fn observe_worker_count(&self, n: usize) {
        self.peak_workers.fetch_max(n, Ordering::Relaxed);
        self.min_workers_observed.fetch_min(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> AutoscalingStats {
        AutoscalingStats {
            scale_up_count: self.scale_up_count.load(Ordering::Relaxed),
            scale_down_count: self.scale_down_count.load(Ordering::Relaxed),
            decisions_evaluated: self.decisions_evaluated.load(Ordering::Relaxed),
            peak_workers: self.peak_workers.load(Ordering::Relaxed),
            min_workers_observed: self.min_workers_observed.load(Ordering::Relaxed),
        }
    }
}

type ScalingCallback = dyn Fn(ScalingDirection, ScalingReason, usize, usize) + Send + Sync;

/// Samples a `Pool`'s load on a background thread and grows/shrinks its
/// worker count to match, per the configured `AutoscalingPolicy`.
pub struct Autoscaler {
    pool: Arc<Pool>,
    policy: Mutex<AutoscalingPolicy>,
    running: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
    wake: Condvar,
    wake_mutex: Mutex<()>,
    history: Mutex<VecDeque<ScalingMetricsSample>>,
    history_capacity: usize,
    last_scale_up: Mutex<Option<Instant>>,
    last_scale_down: Mutex<Option<Instant>>,
    stats: StatsInner,
    callback: Option<Arc<ScalingCallback>>,
}

const HISTORY_CAPACITY: usize = 3600;

impl Autoscaler {
    pub fn new(pool: Arc<Pool>, policy: AutoscalingPolicy) -> EngineResult<Arc<Self>> {
        Self::with_callback(pool, policy, None)
    }

    /// Like `new`, but also registers `scaling_callback`, invoked (direction,
    /// reason, from-count, to-count) on every scaling event, automatic or manual.
    pub fn with_callback(
        pool: Arc<Pool>,
        policy: AutoscalingPolicy,
        callback: Option<Arc<ScalingCallback>>,
    ) -> EngineResult<Arc<Self>> {
        if !policy.is_valid() {
            return Err(EngineError::InvalidArgument(
                "invalid autoscaling policy".to_string(),
            ));
        }
        let initial = pool.worker_count();
        Ok(Arc::new(Autoscaler {
            pool,
            policy: Mutex::new(policy),
            running: AtomicBool::new(false),
            monitor: Mutex::new(None),
            wake: Condvar::new(),
            wake_mutex: Mutex::new(()),
            history: Mutex::new(VecDeque::with_capacity(16)),
            history_capacity: HISTORY_CAPACITY,
            last_scale_up: Mutex::new(None),
            last_scale_down: Mutex::new(None),
            stats: StatsInner::new(initial),
            callback,
        }))
    }

    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn get_policy(&self) -> AutoscalingPolicy {
        self.policy.lock().unwrap().clone()
    }

    pub fn set_policy(&self, policy: AutoscalingPolicy) {
        *self.policy.lock().unwrap() = policy;
    }

    pub fn get_stats(&self) -> AutoscalingStats {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        let workers = self.pool.worker_count();
        self.stats.scale_up_count.store(0, Ordering::Relaxed);
        self.stats.scale_down_count.store(0, Ordering::Relaxed);
        self.stats.decisions_evaluated.store(0, Ordering::Relaxed);
        self.stats.peak_workers.store(workers, Ordering::Relaxed);
        self.stats.min_workers_observed.store(workers, Ordering::Relaxed);
    }

    pub fn get_metrics_history(&self, count: usize) -> Vec<ScalingMetricsSample> {
        let history = self.history.lock().unwrap();
        history.iter().rev().take(count).rev().copied().collect()
    }

    fn collect_metrics(&self) -> ScalingMetricsSample {
        let snapshot = self.pool.metrics_snapshot();
        let worker_count = snapshot.worker_count;
        let active_workers = snapshot.active_worker_count;
        let queue_depth = snapshot.queue_depth;
        let utilization = if worker_count == 0 {
            0.0
        } else {
            active_workers as f64 / worker_count as f64
        };
        let queue_depth_per_worker = if worker_count == 0 {
            0.0
        } else {
            queue_depth as f64 / worker_count as f64
        };
        let p95_latency_ms = snapshot
            .latency_histogram
            .map(|h| h.p95.as_secs_f64() * 1_000.0)
            .unwrap_or(0.0);
        ScalingMetricsSample {
            worker_count,
            active_workers,
            queue_depth,
            utilization,
            queue_depth_per_worker,
            jobs_completed: snapshot.jobs_completed,
            p95_latency_ms,
            pending_jobs: queue_depth,
        }
    }

    fn push_sample(&self, sample: ScalingMetricsSample) {
        let mut history = self.history.lock().unwrap();
        if history.len() == self.history_capacity {
            history.pop_front();
        }
        history.push_back(sample);
    }

    fn average(samples: &[ScalingMetricsSample]) -> ScalingMetricsSample {
        let n = samples.len().max(1) as f64;
        ScalingMetricsSample {
            worker_count: samples.last().map(|s| s.worker_count).unwrap_or(0),
            active_workers: samples.last().map(|s| s.active_workers).unwrap_or(0),
            queue_depth: samples.last().map(|s| s.queue_depth).unwrap_or(0),
            utilization: samples.iter().map(|s| s.utilization).sum::<f64>() / n,
            queue_depth_per_worker: samples.iter().map(|s| s.queue_depth_per_worker).sum::<f64>()
                / n,
            jobs_completed: samples.last().map(|s| s.jobs_completed).unwrap_or(0),
            p95_latency_ms: samples.iter().map(|s| s.p95_latency_ms).sum::<f64>() / n,
            pending_jobs: samples.last().map(|s| s.pending_jobs).unwrap_or(0),
        }
    }

    fn can_scale_up(&self, policy: &AutoscalingPolicy) -> bool {
        match *self.last_scale_up.lock().unwrap() {
            Some(since) => since.elapsed() >= policy.scale_up_cooldown,
            None => true,
        }
    }

    fn can_scale_down(&self, policy: &AutoscalingPolicy) -> bool {
        match *self.last_scale_down.lock().unwrap() {
            Some(since) => since.elapsed() >= policy.scale_down_cooldown,
            None => true,
        }
    }

    fn make_decision(
        &self,
        policy: &AutoscalingPolicy,
        samples: &[ScalingMetricsSample],
    ) -> ScalingDecision {
        if samples.is_empty() {
            return ScalingDecision::none(self.pool.worker_count());
        }
        let agg = Self::average(samples);
        let current = self.pool.worker_count();

        let (scale_up, reason) = if agg.utilization > policy.scale_up.utilization_threshold {
            (true, ScalingReason::WorkerUtilization)
        } else if agg.queue_depth_per_worker > policy.scale_up.queue_depth_threshold {
            (true, ScalingReason::QueueDepth)
        } else if agg.p95_latency_ms > policy.scale_up.latency_threshold_ms {
            (true, ScalingReason::Latency)
        } else if agg.pending_jobs > policy.scale_up.pending_jobs_threshold {
            (true, ScalingReason::QueueDepth)
        } else {
            (false, ScalingReason::QueueDepth)
        };

        if scale_up {
            if !self.can_scale_up(policy) {
                return ScalingDecision::none(current);
            }
            let target = if policy.use_multiplicative_scaling {
                ((current as f64) * policy.scale_up_factor).ceil() as usize
            } else {
                current + policy.scale_up_increment
            }
            .min(policy.max_workers)
            .max(current);
            return ScalingDecision {
                direction: ScalingDirection::Up,
                reason,
                target_workers: target,
                explanation: format!(
                    "utilization {:.2}, queue/worker {:.1}, p95 {:.1}ms, pending {}",
                    agg.utilization, agg.queue_depth_per_worker, agg.p95_latency_ms, agg.pending_jobs
                ),
            };
        }

        let scale_down = agg.utilization < policy.scale_down.utilization_threshold
            && agg.queue_depth_per_worker < policy.scale_down.queue_depth_threshold;

        if scale_down && self.can_scale_down(policy) {
            let target = current
                .saturating_sub(policy.scale_down_increment)
                .max(policy.min_workers);
            if target < current {
                return ScalingDecision {
                    direction: ScalingDirection::Down,
                    reason: ScalingReason::WorkerUtilization,
                    target_workers: target,
                    explanation: format!("utilization {:.2} below threshold", agg.utilization),
                };
            }
        }

        ScalingDecision::none(current)
    }

    fn execute_scaling(&self, decision: &ScalingDecision) {
        let current = self.pool.worker_count();
        match decision.direction {
            ScalingDirection::None => {}
            ScalingDirection::Up => {
                let to_add = decision.target_workers.saturating_sub(current);
                for _ in 0..to_add {
                    if self.pool.add_worker().is_err() {
                        break;
                    }
                }
                *self.last_scale_up.lock().unwrap() = Some(Instant::now());
                self.stats.scale_up_count.fetch_add(1, Ordering::Relaxed);
            }
            ScalingDirection::Down => {
                let to_remove = current.saturating_sub(decision.target_workers);
                for _ in 0..to_remove {
                    if self.pool.remove_worker().is_err() {
                        break;
                    }
                }
                *self.last_scale_down.lock().unwrap() = Some(Instant::now());
                self.stats.scale_down_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        let after = self.pool.worker_count();
        self.stats.observe_worker_count(after);
        if decision.should_scale() {
            log::debug(|| Event::ScalingDecision {
                from: current,
                to: after,
                reason: match decision.reason {
                    ScalingReason::QueueDepth => "queue_depth",
                    ScalingReason::WorkerUtilization => "worker_utilization",
                    ScalingReason::Latency => "latency",
                    ScalingReason::Manual => "manual",
                    ScalingReason::Scheduled => "scheduled",
                },
            });
            if let Some(callback) = &self.callback {
                callback(decision.direction, decision.reason, current, after);
            }
        }
    }

    /// Runs one aggregate-and-decide pass without executing it.
    pub fn evaluate_now(&self) -> ScalingDecision {
        let policy = self.get_policy();
        let recent: Vec<_> = self
            .get_metrics_history(policy.samples_for_decision)
            .into_iter()
            .chain(std::iter::once(self.collect_metrics()))
            .collect();
        self.stats.decisions_evaluated.fetch_add(1, Ordering::Relaxed);
        self.make_decision(&policy, &recent)
    }

    /// Clamps `target` to policy bounds and scales immediately.
    pub fn scale_to(&self, target_workers: usize) -> EngineResult<()> {
        let policy = self.get_policy();
        let clamped = target_workers.clamp(policy.min_workers, policy.max_workers);
        let current = self.pool.worker_count();
        if clamped > current {
            for _ in 0..(clamped - current) {
                self.pool.add_worker()?;
            }
        } else if clamped < current {
            for _ in 0..(current - clamped) {
                self.pool.remove_worker()?;
            }
        }
        let after = self.pool.worker_count();
        self.stats.observe_worker_count(after);
        log::debug(|| Event::ScalingDecision {
            from: current,
            to: after,
            reason: "manual",
        });
        if let Some(callback) = &self.callback {
            let direction = if after > current {
                ScalingDirection::Up
            } else if after < current {
                ScalingDirection::Down
            } else {
                ScalingDirection::None
            };
            callback(direction, ScalingReason::Manual, current, after);
        }
        Ok(())
    }

    pub fn scale_up(&self) -> EngineResult<()> {
        let policy = self.get_policy();
        let current = self.pool.worker_count();
        self.scale_to(current + policy.scale_up_increment)
    }

    pub fn scale_down(&self) -> EngineResult<()> {
        let policy = self.get_policy();
        let current = self.pool.worker_count();
        self.scale_to(current.saturating_sub(policy.scale_down_increment))
    }

    fn monitor_loop(self: &Arc<Self>) {
        log::debug(|| Event::ThreadStart { worker: usize::MAX });
        while self.running.load(Ordering::Acquire) {
            let policy = self.get_policy();
            self.push_sample(self.collect_metrics());

            if policy.scaling_mode == ScalingMode::Automatic {
                let samples = self.get_metrics_history(policy.samples_for_decision);
                if samples.len() >= policy.samples_for_decision {
                    let decision = self.make_decision(&policy, &samples);
                    self.stats.decisions_evaluated.fetch_add(1, Ordering::Relaxed);
                    self.execute_scaling(&decision);
                }
            }

            let guard = self.wake_mutex.lock().unwrap();
            let _ = self.wake.wait_timeout(guard, policy.sample_interval).unwrap();
        }
        log::debug(|| Event::ThreadStop { worker: usize::MAX });
    }

    /// Starts the background monitor thread. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let this = Arc::clone(self);
        let join = std::thread::Builder::new()
            .name("autoscaler".to_string())
            .spawn(move || this.monitor_loop())
            .expect("failed to spawn autoscaler monitor thread");
        *self.monitor.lock().unwrap() = Some(join);
    }

    /// Stops the monitor thread and waits for it to exit.
    pub fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.wake.notify_all();
        if let Some(join) = self.monitor.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

impl Drop for Autoscaler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PoolBuilder;

    fn pool(n: usize) -> Arc<Pool> {
        Arc::new(PoolBuilder::new().num_threads(n).build().unwrap())
    }

    #[test]
    fn rejects_invalid_policy() {
        let policy = AutoscalingPolicy {
            min_workers: 4,
            max_workers: 2,
            ..Default::default()
        };
        assert!(Autoscaler::new(pool(1), policy).is_err());
    }

    #[test]
    fn scale_to_respects_bounds() {
        let p = pool(2);
        let policy = AutoscalingPolicy {
            min_workers: 1,
            max_workers: 4,
            ..Default::default()
        };
        let scaler = Autoscaler::new(Arc::clone(&p), policy).unwrap();
        scaler.scale_to(10).unwrap();
        assert_eq!(p.worker_count(), 4);
        scaler.scale_to(0).unwrap();
        assert_eq!(p.worker_count(), 1);
    }

    #[test]
    fn evaluate_now_returns_decision_without_scaling() {
        let p = pool(2);
        let scaler = Autoscaler::new(Arc::clone(&p), AutoscalingPolicy::default()).unwrap();
        let decision = scaler.evaluate_now();
        assert_eq!(p.worker_count(), 2);
        let _ = decision.should_scale();
    }

    #[test]
    fn manual_scale_up_increments_stats() {
        let p = pool(2);
        let scaler = Autoscaler::new(Arc::clone(&p), AutoscalingPolicy::default()).unwrap();
        scaler.scale_up().unwrap();
        assert_eq!(p.worker_count(), 3);
        assert_eq!(scaler.get_stats().peak_workers, 3);
    }
}
