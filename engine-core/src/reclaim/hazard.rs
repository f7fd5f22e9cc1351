//! Hazard pointers: the safe-memory-reclamation substrate for the lock-free
//! queue. Grounded on `original_source/include/kcenon/thread/core/hazard_pointer.h`'s
//! "central registry with atomic-slot scans and address-dedup on retire" model
//! (SPEC_FULL.md §4.1, §9 Open Questions — this is the strategy that survives).
//!
//! A process-global registry holds a lock-free singly linked list of
//! per-thread hazard records. Each record offers two slots (enough for
//! Michael-Scott enqueue/dequeue to protect `head` and `head->next`
//! simultaneously). Retirement defers deletion until a scan of every slot in
//! every record (including inactive ones, to tolerate concurrent
//! reactivation) shows the address unprotected.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

const SLOTS_PER_RECORD: usize = 2;
const BASE_THRESHOLD: usize = 64;
const PER_THREAD_THRESHOLD: usize = 16;
const MAX_THRESHOLD: usize = 512;

struct HazardRecord {
    slots: [AtomicPtr<()>; SLOTS_PER_RECORD],
    active: AtomicBool,
    next: AtomicPtr<HazardRecord>,
}

impl HazardRecord {
    fn new() -> Self {
        HazardRecord {
            slots: [AtomicPtr::new(ptr::null_mut()), AtomicPtr::new(ptr::null_mut())],
            active: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

struct RetiredNode {
    ptr: *mut (),
    deleter: Box<dyn Fn(*mut ()) + Send>,
}

// Safety: the pointer is never dereferenced by the registry itself, only
// compared for address equality during a scan, or handed to its deleter
// after the scan proves no hazard slot protects it.
unsafe impl Send for RetiredNode {}

/// Process-global hazard-pointer registry. There is exactly one of these per
/// process (SPEC_FULL.md §9 "Global mutable state"); it initializes lazily
/// and is never torn down before process exit.
pub struct HazardRegistry {
    head: AtomicPtr<HazardRecord>,
    active_threads: AtomicUsize,
    retired: Mutex<Vec<RetiredNode>>,
}

impl HazardRegistry {
    const fn new() -> Self {
        HazardRegistry {
            head: AtomicPtr::new(ptr::null_mut()),
            active_threads: AtomicUsize::new(0),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Acquires a hazard record for the calling thread, reusing an inactive
    /// one if possible, otherwise allocating a fresh record and CAS-prepending
    /// it to the registry's list.
    fn acquire_record(&self) -> &'static HazardRecord {
        // Try to reuse an inactive record.
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            let record = unsafe { &*current };
            if record
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.active_threads.fetch_add(1, Ordering::Relaxed);
                return record;
            }
            current = record.next.load(Ordering::Acquire);
        }

        // None free: allocate and CAS-prepend.
        let new_record = Box::into_raw(Box::new(HazardRecord::new()));
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe { (*new_record).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange(head, new_record, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.active_threads.fetch_add(1, Ordering::Relaxed);
                return unsafe { &*new_record };
            }
        }
    }

    fn release_record(&self, record: &HazardRecord) {
        for slot in &record.slots {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
        record.active.store(false, Ordering::Release);
        self.active_threads.fetch_sub(1, Ordering::Relaxed);
    }

    /// Scans every slot in every record, active or not, and returns the
    /// sorted set of currently protected addresses.
    fn scan(&self) -> Vec<*mut ()> {
        let mut protected = Vec::new();
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            let record = unsafe { &*current };
            for slot in &record.slots {
                let p = slot.load(Ordering::Acquire);
                if !p.is_null() {
                    protected.push(p);
                }
            }
            current = record.next.load(Ordering::Acquire);
        }
        protected.sort_unstable_by_key(|p| *p as usize);
        protected
    }

    fn threshold(&self) -> usize {
        let active = self.active_threads.load(Ordering::Relaxed);
        (BASE_THRESHOLD + PER_THREAD_THRESHOLD * active).min(MAX_THRESHOLD)
    }

    /// Retires `ptr`, deleting it with `deleter` once a scan proves it
    /// unprotected. Duplicate retirement of the same address removes the
    /// prior entry first, since the allocator may have recycled the address
    /// before the previous retirement was collected.
    pub fn retire(&self, ptr: *mut (), deleter: Box<dyn Fn(*mut ()) + Send>) {
        let should_scan = {
            let mut retired = self.retired.lock().unwrap();
            retired.retain(|node| node.ptr != ptr);
            retired.push(RetiredNode { ptr, deleter });
            retired.len() >= self.threshold()
        };
        // The scan itself runs after the lock is released, so retirement
        // from inside a destructor (which may hold other locks) can never
        // deadlock against the collector.
        if should_scan {
            self.collect();
        }
    }

    /// Runs a full collection pass: scan every hazard slot, then delete every
    /// retired pointer not present in the protected set.
    pub fn collect(&self) {
        let protected = self.scan();
        let mut retired = self.retired.lock().unwrap();
        let mut i = 0;
        while i < retired.len() {
            let addr = retired[i].ptr;
            if protected.binary_search_by_key(&(addr as usize), |p| *p as usize).is_ok() {
                i += 1;
            } else {
                let node = retired.swap_remove(i);
                (node.deleter)(node.ptr);
            }
        }
    }

    /// Number of pointers currently awaiting reclamation.
    pub fn retired_count(&self) -> usize {
        self.retired.lock().unwrap().len()
    }
}

static REGISTRY: HazardRegistry = HazardRegistry::new();

/// Returns the process-wide hazard registry.
pub fn registry() -> &'static HazardRegistry {
    &REGISTRY
}

/// RAII handle to a thread's two hazard slots, acquired from the global
/// registry. Dropping the guard releases both slots and marks the record
/// inactive for reuse by another thread.
pub struct HazardGuard {
    record: &'static HazardRecord,
}

impl HazardGuard {
    pub fn acquire() -> Self {
        HazardGuard {
            record: REGISTRY.acquire_record(),
        }
    }

    /// Protects `ptr` in slot `slot` (0 or 1) with release ordering. Callers
    /// must re-read the source atomic after protecting and before
    /// dereferencing ("protect, re-check source, then use" — SPEC_FULL.md §4.1).
    pub fn protect<T>(&self, slot: usize, ptr: *mut T) {
        self.record.slots[slot].store(ptr as *mut (), Ordering::Release);
    }

    /// Clears slot `slot`, allowing anything it protected to be reclaimed.
    pub fn clear(&self, slot: usize) {
        self.record.slots[slot].store(ptr::null_mut(), Ordering::Release);
    }
}

impl Drop for HazardGuard {
    fn drop(&mut self) {
        REGISTRY.release_record(self.record);
    }
}
