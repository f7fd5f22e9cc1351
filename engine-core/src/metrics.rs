//! Structured metrics snapshot. SPEC_FULL.md §6 "Metrics snapshot". Grounded
//! on `original_source/src/diagnostics/thread_pool_diagnostics.cpp`'s use of
//! `pool_.metrics().snapshot()` (tasks_executed/failed, busy/idle time) plus
//! the p50/p95/p99 latency histogram and sliding-window throughput the spec
//! calls for under "enhanced metrics".

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A structured, point-in-time view of one pool's counters.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub pool_name: String,
    pub instance_id: u64,
    pub worker_count: usize,
    pub active_worker_count: usize,
    pub queue_depth: usize,
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_rejected: u64,
    pub total_busy_time: Duration,
    pub total_idle_time: Duration,
    pub latency_histogram: Option<LatencyPercentiles>,
    pub throughput_per_second: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct LatencyPercentiles {
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

/// Power-of-two-width nanosecond buckets, one `AtomicU64` counter each, so
/// recording a sample never takes a lock.
const BUCKET_COUNT: usize = 48;

fn bucket_for(nanos: u64) -> usize {
    if nanos == 0 {
        return 0;
    }
    (64 - nanos.leading_zeros() as usize).min(BUCKET_COUNT - 1)
}

fn bucket_upper_bound(bucket: usize) -> u64 {
    if bucket == 0 {
        1
    } else {
        1u64 << bucket
    }
}

/// Lock-free latency histogram recording job execution durations, with
/// percentile estimation from bucket boundaries.
pub struct LatencyHistogram {
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        LatencyHistogram {
            buckets: (0..BUCKET_COUNT).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
        }
    }

    pub fn record(&self, elapsed: Duration) {
        let nanos = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        self.buckets[bucket_for(nanos)].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Estimates the `p`th percentile (0.0-1.0) from bucket boundaries.
    fn percentile(&self, p: f64) -> Duration {
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return Duration::ZERO;
        }
        let target = ((total as f64) * p).ceil() as u64;
        let mut seen = 0u64;
        for (bucket, counter) in self.buckets.iter().enumerate() {
            seen += counter.load(Ordering::Relaxed);
            if seen >= target {
                return Duration::from_nanos(bucket_upper_bound(bucket));
            }
        }
        Duration::from_nanos(bucket_upper_bound(BUCKET_COUNT - 1))
    }

    pub fn snapshot(&self) -> Option<LatencyPercentiles> {
        if self.count.load(Ordering::Relaxed) == 0 {
            return None;
        }
        Some(LatencyPercentiles {
            p50: self.percentile(0.50),
            p95: self.percentile(0.95),
            p99: self.percentile(0.99),
        })
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding-window throughput: completions are timestamped and expired after
/// `window`, giving a moving jobs/sec figure instead of a lifetime average.
pub struct ThroughputWindow {
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl ThroughputWindow {
    pub fn new(window: Duration) -> Self {
        ThroughputWindow {
            window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_completion(&self) {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().unwrap();
        timestamps.push_back(now);
        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn rate_per_second(&self) -> f64 {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().unwrap();
        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        timestamps.len() as f64 / self.window.as_secs_f64()
    }
}

/// Every counter a pool maintains for `MetricsSnapshot`. Cheap relaxed
/// atomics on the hot path; the histogram and throughput window are
/// optional so pools that don't ask for "enhanced metrics" skip their cost.
pub struct PoolMetrics {
    pool_name: String,
    instance_id: u64,
    jobs_submitted: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_rejected: AtomicU64,
    total_busy_time_nanos: AtomicU64,
    total_idle_time_nanos: AtomicU64,
    histogram: Option<LatencyHistogram>,
    throughput: Option<ThroughputWindow>,
}

static NEXT_INSTANCE_ID: AtomicUsize = AtomicUsize::new(1);

impl PoolMetrics {
    pub fn new(pool_name: impl Into<String>, enhanced: bool) -> Self {
        PoolMetrics {
            pool_name: pool_name.into(),
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed) as u64,
            jobs_submitted: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_rejected: AtomicU64::new(0),
            total_busy_time_nanos: AtomicU64::new(0),
            total_idle_time_nanos: AtomicU64::new(0),
            histogram: if enhanced { Some(LatencyHistogram::new()) } else { None },
            throughput: if enhanced {
                Some(ThroughputWindow::new(Duration::from_secs(10)))
            } else {
                None
            },
        }
    }

    pub fn record_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, exec_time: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.total_busy_time_nanos
            .fetch_add(exec_time.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
        if let Some(hist) = &self.histogram {
            hist.record(exec_time);
        }
        if let Some(throughput) = &self.throughput {
            throughput.record_completion();
        }
    }

    pub fn record_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle_time(&self, idle_time: Duration) {
        self.total_idle_time_nanos
            .fetch_add(idle_time.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, worker_count: usize, active_worker_count: usize, queue_depth: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            pool_name: self.pool_name.clone(),
            instance_id: self.instance_id,
            worker_count,
            active_worker_count,
            queue_depth,
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            total_busy_time: Duration::from_nanos(self.total_busy_time_nanos.load(Ordering::Relaxed)),
            total_idle_time: Duration::from_nanos(self.total_idle_time_nanos.load(Ordering::Relaxed)),
            latency_histogram: self.histogram.as_ref().and_then(|h| h.snapshot()),
            throughput_per_second: self.throughput.as_ref().map(|t| t.rate_per_second()),
        }
    }
}
