//! A hand-rolled oneshot future, used by `Pool::submit_async` and friends.
//! SPEC_FULL.md §9 "Coroutines / async" rules out depending on an async
//! runtime; this is a `Mutex<Option<T>> + Waker` shared cell plus a blocking
//! `wait`/`wait_timeout` pair for callers not on an async executor.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

struct Shared<T> {
    value: Mutex<Option<T>>,
    waker: Mutex<Option<Waker>>,
    condvar: Condvar,
}

/// The producer half, held by whoever runs the job.
pub struct JobPromise<T> {
    shared: Arc<Shared<T>>,
}

/// The consumer half, returned to whoever submitted the job.
pub struct JobFuture<T> {
    shared: Arc<Shared<T>>,
}

/// Creates a linked promise/future pair.
pub fn channel<T>() -> (JobPromise<T>, JobFuture<T>) {
    let shared = Arc::new(Shared {
        value: Mutex::new(None),
        waker: Mutex::new(None),
        condvar: Condvar::new(),
    });
    (
        JobPromise { shared: Arc::clone(&shared) },
        JobFuture { shared },
    )
}

impl<T> JobPromise<T> {
    /// Fulfills the promise, waking the async waiter (if any polled first)
    /// and any blocking waiter.
    pub fn fulfill(self, value: T) {
        *self.shared.value.lock().unwrap() = Some(value);
        if let Some(waker) = self.shared.waker.lock().unwrap().take() {
            waker.wake();
        }
        self.shared.condvar.notify_all();
    }
}

impl<T> JobFuture<T> {
    /// Blocks the calling thread until the job completes.
    pub fn wait(self) -> T {
        let mut value = self.shared.value.lock().unwrap();
        loop {
            if let Some(v) = value.take() {
                return v;
            }
            value = self.shared.condvar.wait(value).unwrap();
        }
    }

    /// Blocks with a timeout; `Err(Timeout)` if the job hasn't completed in time.
    pub fn wait_timeout(self, timeout: Duration) -> EngineResult<T> {
        let mut value = self.shared.value.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(v) = value.take() {
                return Ok(v);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(EngineError::Timeout(timeout));
            }
            let (guard, result) = self
                .shared
                .condvar
                .wait_timeout(value, deadline - now)
                .unwrap();
            value = guard;
            if result.timed_out() && value.is_none() {
                return Err(EngineError::Timeout(timeout));
            }
        }
    }
}

impl<T> Future for JobFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut value = self.shared.value.lock().unwrap();
        if let Some(v) = value.take() {
            return Poll::Ready(v);
        }
        *self.shared.waker.lock().unwrap() = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn blocking_wait_observes_fulfillment() {
        let (promise, future) = channel::<u32>();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            promise.fulfill(42);
        });
        assert_eq!(future.wait(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_fires_when_unfulfilled() {
        let (_promise, future) = channel::<u32>();
        match future.wait_timeout(Duration::from_millis(10)) {
            Err(EngineError::Timeout(_)) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn poll_then_fulfill_wakes_waker() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::task::{RawWaker, RawWakerVTable};

        fn noop_clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        fn noop(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(noop_clone, noop, noop, noop);
        let raw = RawWaker::new(std::ptr::null(), &VTABLE);
        let waker = unsafe { Waker::from_raw(raw) };
        let mut cx = Context::from_waker(&waker);

        let (promise, mut future) = channel::<u32>();
        let woken = AtomicBool::new(false);
        match Pin::new(&mut future).poll(&mut cx) {
            Poll::Pending => {}
            Poll::Ready(_) => panic!("should not be ready yet"),
        }
        promise.fulfill(7);
        woken.store(true, Ordering::SeqCst);
        match Pin::new(&mut future).poll(&mut cx) {
            Poll::Ready(v) => assert_eq!(v, 7),
            Poll::Pending => panic!("should be ready after fulfill"),
        }
    }
}
