//! Priority-partitioned queue: one `BasicQueue` per priority level, drained
//! highest-priority-first. SPEC_FULL.md §4.4 / §4.6 "Typed pool".

use std::collections::HashSet;
use std::sync::Mutex;

use super::private::Sealed;
use super::{BasicQueue, JobQueue};
use crate::error::{EngineError, EngineResult};
use crate::job::{Priority, PRIORITY_LEVELS_DESCENDING};

/// A queue that partitions jobs by `Priority` and always serves the
/// highest-priority non-empty partition first. Optionally restricted to a
/// caller-supplied set of acceptable priorities.
pub struct TypedQueue {
    lanes: [BasicQueue; 3],
    acceptable: Option<HashSet<Priority>>,
    stopped_marker: Mutex<bool>,
}

fn lane_index(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::Normal => 1,
        Priority::Low => 2,
    }
}

impl TypedQueue {
    pub fn new() -> Self {
        TypedQueue {
            lanes: [BasicQueue::new(), BasicQueue::new(), BasicQueue::new()],
            acceptable: None,
            stopped_marker: Mutex::new(false),
        }
    }

    /// Restricts this queue to only the given priorities; jobs of any other
    /// priority are rejected with `InvalidArgument`.
    pub fn with_acceptable_priorities(priorities: impl IntoIterator<Item = Priority>) -> Self {
        let mut q = Self::new();
        q.acceptable = Some(priorities.into_iter().collect());
        q
    }

    fn lane(&self, priority: Priority) -> &BasicQueue {
        &self.lanes[lane_index(priority)]
    }

    pub fn size_for(&self, priority: Priority) -> usize {
        self.lane(priority).size()
    }

    /// Tries each priority in `order`, in that exact sequence, returning the
    /// first available job. Used directly by the typed pool's workers so
    /// each worker can supply its own accepted-priority scan order
    /// (normally highest-first, occasionally lowest-first to avoid
    /// starving a low-priority lane — see `typed_pool`).
    pub fn try_dequeue_order(&self, order: &[Priority]) -> EngineResult<crate::job::Job> {
        for &priority in order {
            match self.lane(priority).try_dequeue() {
                Ok(job) => return Ok(job),
                Err(EngineError::QueueEmpty) => continue,
                Err(other) => return Err(other),
            }
        }
        if *self.stopped_marker.lock().unwrap() {
            return Err(EngineError::QueueStopped);
        }
        Err(EngineError::QueueEmpty)
    }
}

impl Default for TypedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Sealed for TypedQueue {}

impl JobQueue for TypedQueue {
    fn enqueue(&self, job: crate::job::Job) -> EngineResult<()> {
        if *self.stopped_marker.lock().unwrap() {
            return Err(EngineError::QueueStopped);
        }
        let priority = job.priority();
        if let Some(acceptable) = &self.acceptable {
            if !acceptable.contains(&priority) {
                return Err(EngineError::InvalidArgument(format!(
                    "priority {priority:?} not accepted by this typed queue"
                )));
            }
        }
        self.lane(priority).enqueue(job)
    }

    /// Validates every job up front (stopped / accepted-priority), then
    /// pushes all of them straight into their lanes. Lanes carry no
    /// capacity bound, so once validation passes the batch cannot fail
    /// partway through.
    fn enqueue_batch(&self, jobs: Vec<crate::job::Job>) -> EngineResult<()> {
        if *self.stopped_marker.lock().unwrap() {
            return Err(EngineError::QueueStopped);
        }
        if let Some(acceptable) = &self.acceptable {
            if let Some(job) = jobs.iter().find(|j| !acceptable.contains(&j.priority())) {
                return Err(EngineError::InvalidArgument(format!(
                    "priority {:?} not accepted by this typed queue",
                    job.priority()
                )));
            }
        }
        for job in jobs {
            self.lane(job.priority()).push_back_raw(job);
        }
        Ok(())
    }

    fn dequeue(&self) -> EngineResult<crate::job::Job> {
        // Each lane is its own condvar-backed queue, so there is no single
        // condvar to wait on across lanes; poll with a short backoff instead.
        loop {
            for priority in PRIORITY_LEVELS_DESCENDING {
                if let Ok(job) = self.lane(priority).try_dequeue() {
                    return Ok(job);
                }
            }
            if *self.stopped_marker.lock().unwrap() {
                return Err(EngineError::QueueStopped);
            }
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
    }

    fn try_dequeue(&self) -> EngineResult<crate::job::Job> {
        self.try_dequeue_order(&PRIORITY_LEVELS_DESCENDING)
    }

    fn is_empty(&self) -> bool {
        self.lanes.iter().all(|l| l.is_empty())
    }

    fn size(&self) -> usize {
        self.lanes.iter().map(|l| l.size()).sum()
    }

    fn clear(&self) {
        for lane in &self.lanes {
            lane.clear();
        }
    }

    fn stop(&self) {
        *self.stopped_marker.lock().unwrap() = true;
        for lane in &self.lanes {
            lane.stop();
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stopped_marker.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    #[test]
    fn dequeues_highest_priority_first() {
        let q = TypedQueue::new();
        q.enqueue(Job::new("low", || Ok(())).with_priority(Priority::Low)).unwrap();
        q.enqueue(Job::new("high", || Ok(())).with_priority(Priority::High)).unwrap();
        q.enqueue(Job::new("normal", || Ok(())).with_priority(Priority::Normal)).unwrap();

        assert_eq!(q.try_dequeue().unwrap().name(), Some("high"));
        assert_eq!(q.try_dequeue().unwrap().name(), Some("normal"));
        assert_eq!(q.try_dequeue().unwrap().name(), Some("low"));
    }

    #[test]
    fn fifo_within_a_priority_level() {
        let q = TypedQueue::new();
        q.enqueue(Job::new("a", || Ok(()))).unwrap();
        q.enqueue(Job::new("b", || Ok(()))).unwrap();
        assert_eq!(q.try_dequeue().unwrap().name(), Some("a"));
        assert_eq!(q.try_dequeue().unwrap().name(), Some("b"));
    }

    #[test]
    fn restricted_priorities_reject_others() {
        let q = TypedQueue::with_acceptable_priorities([Priority::High]);
        match q.enqueue(Job::new("low", || Ok(())).with_priority(Priority::Low)) {
            Err(EngineError::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
        assert!(q
            .enqueue(Job::new("high", || Ok(())).with_priority(Priority::High))
            .is_ok());
    }

    #[test]
    fn stop_then_drain_then_stopped() {
        let q = TypedQueue::new();
        q.enqueue(Job::new("a", || Ok(()))).unwrap();
        q.stop();
        assert!(q.try_dequeue().is_ok());
        match q.try_dequeue() {
            Err(EngineError::QueueStopped) => {}
            other => panic!("expected QueueStopped, got {other:?}"),
        }
    }
}
