//! Thread dump, bottleneck detection, and event tracing. SPEC_FULL.md §6
//! "Diagnostics export". Grounded on `original_source/src/diagnostics/
//! thread_pool_diagnostics.cpp`: `dump_thread_states`/`format_thread_dump`,
//! `detect_bottlenecks` (the six tagged reasons, checked in the same
//! severity order) and `generate_recommendations`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::metrics::MetricsSnapshot;
use crate::pool::{Pool, WorkerHealth};

/// One worker's state for a thread dump.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub worker_id: usize,
    pub busy: bool,
    pub current_job_id: Option<u64>,
    pub jobs_executed: u64,
    pub jobs_stolen: u64,
    pub thread_alive: bool,
}

impl From<WorkerHealth> for ThreadInfo {
    fn from(h: WorkerHealth) -> Self {
        ThreadInfo {
            worker_id: h.index,
            busy: h.busy,
            current_job_id: h.current_job_id,
            jobs_executed: h.jobs_executed,
            jobs_stolen: h.jobs_stolen,
            thread_alive: h.thread_alive,
        }
    }
}

/// Returns a structured snapshot of every worker's state.
pub fn dump_thread_states(pool: &Pool) -> Vec<ThreadInfo> {
    pool.check_worker_health().into_iter().map(ThreadInfo::from).collect()
}

/// Renders `dump_thread_states` as a human-readable report, in the same
/// shape as the teacher's `format_thread_dump`.
pub fn format_thread_dump(pool: &Pool) -> String {
    let threads = dump_thread_states(pool);
    let active = threads.iter().filter(|t| t.busy).count();
    let idle = threads.len() - active;

    let mut out = format!(
        "=== Thread Pool Dump ===\nWorkers: {}, Active: {}, Idle: {}\n\n",
        threads.len(),
        active,
        idle
    );
    for t in &threads {
        out.push_str(&format!(
            "worker-{} {} (alive: {})\n",
            t.worker_id,
            if t.busy { "BUSY" } else { "IDLE" },
            t.thread_alive
        ));
        if let Some(job_id) = t.current_job_id {
            out.push_str(&format!("  Current Job: #{job_id}\n"));
        }
        out.push_str(&format!("  Jobs executed: {}, stolen: {}\n\n", t.jobs_executed, t.jobs_stolen));
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BottleneckType {
    QueueFull,
    SlowConsumer,
    WorkerStarvation,
    UnevenDistribution,
    LockContention,
    MemoryPressure,
    None,
}

#[derive(Debug, Clone)]
pub struct BottleneckReport {
    pub has_bottleneck: bool,
    pub kind: BottleneckType,
    pub description: String,
    pub recommendations: Vec<&'static str>,
    pub queue_depth: usize,
    pub worker_utilization: f64,
    pub utilization_variance: f64,
}

impl BottleneckReport {
    fn none(queue_depth: usize, worker_utilization: f64) -> Self {
        BottleneckReport {
            has_bottleneck: false,
            kind: BottleneckType::None,
            description: String::new(),
            recommendations: Vec::new(),
            queue_depth,
            worker_utilization,
            utilization_variance: 0.0,
        }
    }
}

/// Thresholds used by `detect_bottlenecks`, mirroring `diagnostics_config`.
#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsConfig {
    pub wait_time_threshold_ms: f64,
    pub utilization_high_threshold: f64,
    pub queue_saturation_threshold: f64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        DiagnosticsConfig {
            wait_time_threshold_ms: 100.0,
            utilization_high_threshold: 0.8,
            queue_saturation_threshold: 0.95,
        }
    }
}

fn recommendations_for(kind: BottleneckType) -> Vec<&'static str> {
    match kind {
        BottleneckType::QueueFull => vec![
            "Consider increasing queue capacity",
            "Enable backpressure with an adaptive policy",
            "Add more worker threads if CPU permits",
        ],
        BottleneckType::SlowConsumer => vec![
            "Add more worker threads",
            "Optimize job execution time",
            "Consider batching small jobs",
        ],
        BottleneckType::WorkerStarvation => vec![
            "Increase worker thread count",
            "Scale workers to hardware core count",
            "Enable autoscaling for dynamic adjustment",
        ],
        BottleneckType::UnevenDistribution => vec![
            "Confirm work stealing is enabled",
            "Review job distribution patterns",
            "Consider priority-based scheduling",
        ],
        BottleneckType::LockContention => vec![
            "Review shared resource access patterns",
            "Consider a lock-free queue variant",
            "Reduce critical section scope",
        ],
        BottleneckType::MemoryPressure => vec![
            "Reduce queue capacity or enable backpressure",
            "Add more workers to process the backlog faster",
        ],
        BottleneckType::None => Vec::new(),
    }
}

/// Examines a metrics snapshot and worker states, tagging the most likely
/// single bottleneck, checked in severity order: queue_full, worker
/// starvation, slow consumer, uneven distribution, lock contention, memory
/// pressure, else none.
pub fn detect_bottlenecks(
    config: &DiagnosticsConfig,
    snapshot: &MetricsSnapshot,
    threads: &[ThreadInfo],
    queue_max_size: Option<usize>,
) -> BottleneckReport {
    let worker_count = snapshot.worker_count.max(1);
    let worker_utilization = snapshot.active_worker_count as f64 / worker_count as f64;
    let queue_depth = snapshot.queue_depth;

    let queue_saturation = match queue_max_size {
        Some(max) if max > 0 => queue_depth as f64 / max as f64,
        _ if queue_depth > 0 => (queue_depth as f64 / (worker_count as f64 * 10.0)).min(1.0),
        _ => 0.0,
    };

    let utilization_variance = if threads.len() > 1 {
        let per_worker: Vec<f64> = threads
            .iter()
            .map(|t| if t.busy { 1.0 } else { 0.0 })
            .collect();
        let mean = per_worker.iter().sum::<f64>() / per_worker.len() as f64;
        per_worker.iter().map(|u| (u - mean).powi(2)).sum::<f64>() / per_worker.len() as f64
    } else {
        0.0
    };

    let total_jobs = snapshot.jobs_completed + snapshot.jobs_failed;
    let avg_wait_time_ms = if total_jobs > 0 {
        snapshot.total_idle_time.as_secs_f64() * 1000.0 / total_jobs as f64
    } else {
        0.0
    };

    let mut report = BottleneckReport::none(queue_depth, worker_utilization);
    report.utilization_variance = utilization_variance;

    if queue_saturation > config.queue_saturation_threshold || snapshot.jobs_rejected > 0 {
        report.kind = BottleneckType::QueueFull;
        report.description = "Queue is at or near capacity; jobs may be rejected".to_string();
    } else if worker_utilization > 0.95 && queue_depth > worker_count * 2 {
        report.kind = BottleneckType::WorkerStarvation;
        report.description = "Not enough workers to handle the workload".to_string();
    } else if avg_wait_time_ms > config.wait_time_threshold_ms
        && worker_utilization > config.utilization_high_threshold
    {
        report.kind = BottleneckType::SlowConsumer;
        report.description = "Workers cannot keep up with the submission rate".to_string();
    } else if utilization_variance > 0.1 && worker_count > 1 {
        report.kind = BottleneckType::UnevenDistribution;
        report.description = "Work is not evenly distributed across workers".to_string();
    } else if avg_wait_time_ms > config.wait_time_threshold_ms * 2.0 && worker_utilization < 0.5 {
        report.kind = BottleneckType::LockContention;
        report.description = "High wait times with low utilization suggests lock contention".to_string();
    }

    report.has_bottleneck = report.kind != BottleneckType::None;
    if report.has_bottleneck {
        report.recommendations = recommendations_for(report.kind);
    }
    report
}

/// One entry in the event-tracing ring buffer.
#[derive(Debug, Clone)]
pub enum TraceEvent {
    Submitted { job_id: u64, name: Option<String> },
    Started { job_id: u64, worker: usize },
    Completed { job_id: u64, worker: usize, success: bool },
}

/// A fixed-capacity ring buffer of recent job lifecycle events, for
/// after-the-fact inspection without holding unbounded history.
pub struct EventTracer {
    capacity: usize,
    events: Mutex<VecDeque<(Instant, TraceEvent)>>,
}

impl EventTracer {
    pub fn new(capacity: usize) -> Self {
        EventTracer {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, event: TraceEvent) {
        let mut events = self.events.lock().unwrap();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back((Instant::now(), event));
    }

    /// Most recent `count` events, newest last.
    pub fn recent(&self, count: usize) -> Vec<(Instant, TraceEvent)> {
        let events = self.events.lock().unwrap();
        events
            .iter()
            .rev()
            .take(count)
            .rev()
            .map(|(at, ev)| (*at, ev.clone()))
            .collect()
    }
}

impl Clone for TraceEvent {
    fn clone(&self) -> Self {
        match self {
            TraceEvent::Submitted { job_id, name } => TraceEvent::Submitted {
                job_id: *job_id,
                name: name.clone(),
            },
            TraceEvent::Started { job_id, worker } => TraceEvent::Started {
                job_id: *job_id,
                worker: *worker,
            },
            TraceEvent::Completed { job_id, worker, success } => TraceEvent::Completed {
                job_id: *job_id,
                worker: *worker,
                success: *success,
            },
        }
    }
}
