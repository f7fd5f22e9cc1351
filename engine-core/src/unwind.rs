//! Panic containment at the worker boundary, mirroring `rayon_core::unwind`:
//! user job code may panic, but that panic must never unwind across the
//! scheduler. `halt_unwinding` converts a caught panic into a `Result`;
//! `AbortIfPanic` aborts the process if engine-internal code (not user code)
//! panics while the guard is live, since at that point the pool's invariants
//! can no longer be trusted.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::process;

/// Runs `f`, catching any panic and returning it as an `Err` instead of
/// letting it unwind further. This is the only place user job code is
/// invoked from within a worker thread.
pub fn halt_unwinding<F, R>(f: F) -> Result<R, Box<dyn Any + Send>>
where
    F: FnOnce() -> R,
{
    panic::catch_unwind(AssertUnwindSafe(f))
}

/// A guard that aborts the process if dropped while a panic is unwinding.
/// Held across engine-internal sections (the main worker loop outside of
/// `halt_unwinding`) where a panic would indicate a broken invariant rather
/// than a user mistake, so continuing would risk corrupting shared state.
pub struct AbortIfPanic;

impl Drop for AbortIfPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            eprintln!("concur-engine: internal invariant violated, aborting process");
            process::abort();
        }
    }
}
