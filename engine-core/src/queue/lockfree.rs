//! Michael-Scott lock-free queue, reclaimed with hazard pointers. SPEC_FULL.md §4.4.2.
//!
//! A singly linked list with a sentinel dummy node and separate atomic head
//! and tail. `enqueue` CASes a new node onto `tail.next`, then advances
//! `tail` (helping a stalled enqueuer if necessary). `dequeue` detects the
//! empty case (`head == tail` with null `next`), helps a lagging tail
//! (`head == tail` with non-null `next`), or otherwise moves the value out of
//! `head.next` and CASes `head` forward, retiring the old head through
//! `reclaim::hazard`.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::thread;

use crossbeam_utils::CachePadded;

use super::private::Sealed;
use super::JobQueue;
use crate::error::{EngineError, EngineResult};
use crate::job::Job;
use crate::reclaim::hazard::{registry, HazardGuard};

const MAX_CAS_SPINS: u32 = 64;

struct Node {
    value: std::cell::UnsafeCell<Option<Job>>,
    next: AtomicPtr<Node>,
}

impl Node {
    fn sentinel() -> *mut Node {
        Box::into_raw(Box::new(Node {
            value: std::cell::UnsafeCell::new(None),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    fn with_value(job: Job) -> *mut Node {
        Box::into_raw(Box::new(Node {
            value: std::cell::UnsafeCell::new(Some(job)),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

fn retire_node(ptr: *mut Node) {
    registry().retire(ptr as *mut (), Box::new(|raw| unsafe {
        drop(Box::from_raw(raw as *mut Node));
    }));
}

/// Backs off after a bounded run of failed CAS attempts, to avoid
/// priority-inversion livelock under contention.
fn backoff(spins: &mut u32) {
    *spins += 1;
    if *spins > MAX_CAS_SPINS {
        thread::yield_now();
        *spins = 0;
    }
}

pub struct LockFreeQueue {
    // `head` and `tail` are each CAS'd on every enqueue/dequeue from any
    // thread; padding them to separate cache lines keeps one cursor's
    // contention from bouncing the other's line.
    head: CachePadded<AtomicPtr<Node>>,
    tail: CachePadded<AtomicPtr<Node>>,
    approx_size: AtomicUsize,
    stopped: AtomicBool,
}

impl LockFreeQueue {
    pub fn new() -> Self {
        let sentinel = Node::sentinel();
        LockFreeQueue {
            head: CachePadded::new(AtomicPtr::new(sentinel)),
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
            approx_size: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    fn enqueue_node(&self, new_node: *mut Node) {
        let guard = HazardGuard::acquire();
        let mut spins = 0;
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            guard.protect(0, tail);
            if tail != self.tail.load(Ordering::Acquire) {
                backoff(&mut spins);
                continue;
            }
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if tail != self.tail.load(Ordering::Acquire) {
                backoff(&mut spins);
                continue;
            }
            if next.is_null() {
                let cas = unsafe {
                    (*tail).next.compare_exchange(
                        ptr::null_mut(),
                        new_node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    )
                };
                if cas.is_ok() {
                    // Try to advance tail; if this fails, another thread
                    // already helped us.
                    let _ = self.tail.compare_exchange(
                        tail,
                        new_node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    return;
                }
            } else {
                // Tail is lagging behind; help advance it before retrying.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
            }
            backoff(&mut spins);
        }
    }

    fn dequeue_node(&self) -> Result<Job, bool> {
        // Err(true) means "stopped and empty"; Err(false) means "empty, not stopped".
        let guard = HazardGuard::acquire();
        let mut spins = 0;
        loop {
            let head = self.head.load(Ordering::Acquire);
            guard.protect(0, head);
            if head != self.head.load(Ordering::Acquire) {
                backoff(&mut spins);
                continue;
            }
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            guard.protect(1, next);
            if head != self.head.load(Ordering::Acquire) {
                backoff(&mut spins);
                continue;
            }
            if head == tail {
                if next.is_null() {
                    return Err(self.stopped.load(Ordering::Acquire));
                }
                // Tail lagging; help it along, then retry.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
                backoff(&mut spins);
                continue;
            }
            if next.is_null() {
                // Lost a race: another thread already consumed this slot.
                backoff(&mut spins);
                continue;
            }
            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                let value = unsafe { (*next).value.get().as_mut().unwrap().take() };
                self.approx_size.fetch_sub(1, Ordering::Relaxed);
                retire_node(head);
                return Ok(value.expect("non-sentinel node must carry a value"));
            }
            backoff(&mut spins);
        }
    }
}

impl Default for LockFreeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockFreeQueue {
    fn drop(&mut self) {
        // Drain any remaining nodes directly; no other thread can be
        // observing this queue once it's being dropped.
        let mut current = self.head.load(Ordering::Relaxed);
        while !current.is_null() {
            let next = unsafe { (*current).next.load(Ordering::Relaxed) };
            unsafe { drop(Box::from_raw(current)) };
            current = next;
        }
    }
}

impl Sealed for LockFreeQueue {}

impl JobQueue for LockFreeQueue {
    fn enqueue(&self, job: Job) -> EngineResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::QueueStopped);
        }
        let node = Node::with_value(job);
        self.enqueue_node(node);
        self.approx_size.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn dequeue(&self) -> EngineResult<Job> {
        let mut spins = 0u32;
        loop {
            match self.dequeue_node() {
                Ok(job) => return Ok(job),
                Err(true) => return Err(EngineError::QueueStopped),
                Err(false) => {
                    spins += 1;
                    if spins > MAX_CAS_SPINS {
                        thread::yield_now();
                        spins = 0;
                    }
                }
            }
        }
    }

    fn try_dequeue(&self) -> EngineResult<Job> {
        match self.dequeue_node() {
            Ok(job) => Ok(job),
            Err(true) => Err(EngineError::QueueStopped),
            Err(false) => Err(EngineError::QueueEmpty),
        }
    }

    fn is_empty(&self) -> bool {
        let guard = HazardGuard::acquire();
        let mut spins = 0;
        loop {
            let head = self.head.load(Ordering::Acquire);
            guard.protect(0, head);
            if head != self.head.load(Ordering::Acquire) {
                backoff(&mut spins);
                continue;
            }
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            return next.is_null();
        }
    }

    fn size(&self) -> usize {
        self.approx_size.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        while self.try_dequeue().is_ok() {}
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

// Safety: all mutable access to `Node` contents goes through atomics or is
// gated by winning a CAS on `head`/`tail`, which establishes exclusive
// access to the fields touched afterward.
unsafe impl Send for LockFreeQueue {}
unsafe impl Sync for LockFreeQueue {}
