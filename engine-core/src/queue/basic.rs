//! The basic queue: a mutex-protected deque plus a condition variable.
//! SPEC_FULL.md §4.4.1.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use super::private::Sealed;
use super::JobQueue;
use crate::error::{EngineError, EngineResult};
use crate::job::Job;

struct State {
    items: VecDeque<Job>,
    stopped: bool,
}

/// A mutex-protected FIFO with an optional capacity bound. Exact size,
/// supports batch enqueue/dequeue.
pub struct BasicQueue {
    capacity: Option<usize>,
    state: Mutex<State>,
    not_empty: Condvar,
}

impl BasicQueue {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        BasicQueue {
            capacity,
            state: Mutex::new(State {
                items: VecDeque::new(),
                stopped: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Enqueues every job in `jobs`, or none, atomically with respect to
    /// capacity: either all fit or the batch is rejected wholesale.
    pub fn enqueue_batch(&self, jobs: Vec<Job>) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return Err(EngineError::QueueStopped);
        }
        if let Some(cap) = self.capacity {
            if state.items.len() + jobs.len() > cap {
                return Err(EngineError::QueueFull);
            }
        }
        let woke_any = state.items.is_empty() && !jobs.is_empty();
        state.items.extend(jobs);
        drop(state);
        if woke_any {
            self.not_empty.notify_all();
        }
        Ok(())
    }

    /// Dequeues up to `max` jobs without blocking. Returns an empty vec if
    /// nothing is available (this is not an error, unlike `try_dequeue`).
    pub fn dequeue_batch(&self, max: usize) -> Vec<Job> {
        let mut state = self.state.lock().unwrap();
        let n = max.min(state.items.len());
        state.items.drain(..n).collect()
    }

    /// Removes and returns the oldest job without making it visible as a
    /// normal dequeue (used by backpressure's `drop_oldest` policy).
    pub(crate) fn pop_front_raw(&self) -> Option<Job> {
        self.state.lock().unwrap().items.pop_front()
    }

    pub(crate) fn push_back_raw(&self, job: Job) {
        let mut state = self.state.lock().unwrap();
        let was_empty = state.items.is_empty();
        state.items.push_back(job);
        drop(state);
        if was_empty {
            self.not_empty.notify_one();
        }
    }

    pub(crate) fn len_raw(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    /// Atomically enqueues `jobs` if the queue's current length plus
    /// `jobs.len()` does not exceed `max_size`; otherwise returns `jobs`
    /// unchanged. Lets a caller enforce its own capacity bound (distinct
    /// from `self.capacity`) under a single lock acquisition, as
    /// `BackpressureQueue::enqueue_batch` does.
    pub(crate) fn try_push_batch_within(&self, jobs: Vec<Job>, max_size: usize) -> Result<(), Vec<Job>> {
        let mut state = self.state.lock().unwrap();
        if state.items.len() + jobs.len() > max_size {
            return Err(jobs);
        }
        let woke_any = state.items.is_empty() && !jobs.is_empty();
        state.items.extend(jobs);
        drop(state);
        if woke_any {
            self.not_empty.notify_all();
        }
        Ok(())
    }
}

impl Default for BasicQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Sealed for BasicQueue {}

impl JobQueue for BasicQueue {
    fn enqueue(&self, job: Job) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return Err(EngineError::QueueStopped);
        }
        if let Some(cap) = self.capacity {
            if state.items.len() >= cap {
                return Err(EngineError::QueueFull);
            }
        }
        let was_empty = state.items.is_empty();
        state.items.push_back(job);
        drop(state);
        if was_empty {
            self.not_empty.notify_one();
        }
        Ok(())
    }

    fn enqueue_batch(&self, jobs: Vec<Job>) -> EngineResult<()> {
        BasicQueue::enqueue_batch(self, jobs)
    }

    fn dequeue(&self) -> EngineResult<Job> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(job) = state.items.pop_front() {
                return Ok(job);
            }
            if state.stopped {
                return Err(EngineError::QueueStopped);
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    fn try_dequeue(&self) -> EngineResult<Job> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.items.pop_front() {
            return Ok(job);
        }
        if state.stopped {
            return Err(EngineError::QueueStopped);
        }
        Err(EngineError::QueueEmpty)
    }

    fn is_empty(&self) -> bool {
        self.state.lock().unwrap().items.is_empty()
    }

    fn size(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    fn clear(&self) {
        self.state.lock().unwrap().items.clear();
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        drop(state);
        self.not_empty.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let q = BasicQueue::new();
        for i in 0..10 {
            q.enqueue(Job::new(format!("{i}"), || Ok(()))).unwrap();
        }
        for i in 0..10 {
            let job = q.try_dequeue().unwrap();
            assert_eq!(job.name(), Some(i.to_string().as_str()));
        }
    }

    #[test]
    fn capacity_bound_rejects_overflow() {
        let q = BasicQueue::with_capacity(Some(2));
        q.enqueue(Job::new("a", || Ok(()))).unwrap();
        q.enqueue(Job::new("b", || Ok(()))).unwrap();
        match q.enqueue(Job::new("c", || Ok(()))) {
            Err(EngineError::QueueFull) => {}
            other => panic!("expected QueueFull, got {other:?}"),
        }
    }

    #[test]
    fn try_dequeue_on_empty_queue_is_queue_empty() {
        let q = BasicQueue::new();
        match q.try_dequeue() {
            Err(EngineError::QueueEmpty) => {}
            other => panic!("expected QueueEmpty, got {other:?}"),
        }
    }

    #[test]
    fn stop_then_drain_then_stopped_error() {
        let q = BasicQueue::new();
        q.enqueue(Job::new("a", || Ok(()))).unwrap();
        q.stop();
        assert!(q.try_dequeue().is_ok(), "remaining item still dequeues after stop");
        match q.try_dequeue() {
            Err(EngineError::QueueStopped) => {}
            other => panic!("expected QueueStopped, got {other:?}"),
        }
    }

    #[test]
    fn enqueue_after_stop_is_rejected() {
        let q = BasicQueue::new();
        q.stop();
        match q.enqueue(Job::new("a", || Ok(()))) {
            Err(EngineError::QueueStopped) => {}
            other => panic!("expected QueueStopped, got {other:?}"),
        }
    }

    #[test]
    fn clear_on_stopped_queue_stays_stopped_and_empty() {
        let q = BasicQueue::new();
        q.enqueue(Job::new("a", || Ok(()))).unwrap();
        q.stop();
        q.clear();
        assert!(q.is_empty());
        assert!(q.is_stopped());
    }

    #[test]
    fn blocking_dequeue_wakes_on_enqueue() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let q = Arc::new(BasicQueue::new());
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.dequeue());
        thread::sleep(Duration::from_millis(20));
        q.enqueue(Job::new("late", || Ok(()))).unwrap();
        let job = handle.join().unwrap().unwrap();
        assert_eq!(job.name(), Some("late"));
    }

    #[test]
    fn blocking_dequeue_wakes_on_stop() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let q = Arc::new(BasicQueue::new());
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.dequeue());
        thread::sleep(Duration::from_millis(20));
        q.stop();
        match handle.join().unwrap() {
            Err(EngineError::QueueStopped) => {}
            other => panic!("expected QueueStopped, got {other:?}"),
        }
    }
}
