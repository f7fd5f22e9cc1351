//! Hierarchical, optionally timed cancellation tokens. See SPEC_FULL.md §4.2.
//!
//! A `CancellationToken` is a handle to reference-counted shared state
//! (`Arc<Inner>`); every clone observes the same underlying flag. Once
//! cancelled, a token never returns to an uncancelled state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{EngineError, EngineResult};

/// Why a token was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancellationReason {
    /// A caller explicitly requested cancellation.
    UserRequested,
    /// A caller explicitly requested cancellation with a message.
    UserRequestedWithMessage(String),
    /// The token's deadline elapsed.
    Timeout,
    /// A parent in a `create_linked` hierarchy was cancelled.
    ParentCancelled,
}

struct CancelState {
    reason: CancellationReason,
    at: Instant,
}

type CallbackHandle = u64;

struct Inner {
    cancelled: AtomicBool,
    state: Mutex<Option<CancelState>>,
    condvar: Condvar,
    callbacks: Mutex<HashMap<CallbackHandle, Box<dyn FnOnce() + Send>>>,
    next_handle: AtomicU64,
    /// Set by a deadline timer thread so it can be told to stop early if the
    /// token is cancelled for another reason or every other reference drops.
    timer_should_stop: Arc<AtomicBool>,
}

/// A cheaply cloneable handle to shared cancellation state.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Creates a fresh, uncancelled token.
    pub fn create() -> Self {
        CancellationToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                state: Mutex::new(None),
                condvar: Condvar::new(),
                callbacks: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                timer_should_stop: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Creates a token that cancels itself with `Timeout` after `duration`.
    pub fn create_with_timeout(duration: Duration) -> Self {
        Self::create_with_deadline(Instant::now() + duration)
    }

    /// Creates a token that cancels itself with `Timeout` at `deadline`.
    pub fn create_with_deadline(deadline: Instant) -> Self {
        let token = Self::create();
        let weak_inner = Arc::downgrade(&token.inner);
        let should_stop = Arc::clone(&token.inner.timer_should_stop);
        thread::spawn(move || loop {
            let now = Instant::now();
            if now >= deadline {
                if let Some(inner) = weak_inner.upgrade() {
                    CancellationToken { inner }.cancel_with_reason(CancellationReason::Timeout);
                }
                return;
            }
            if should_stop.load(Ordering::Acquire) {
                return;
            }
            if weak_inner.upgrade().is_none() {
                return;
            }
            thread::sleep(Duration::from_millis(5).min(deadline - now));
        });
        token
    }

    /// Creates a child token cancelled with `ParentCancelled` when any parent
    /// cancels. Cancellation propagates exactly one level: the child installs
    /// one callback on each parent, never the reverse.
    pub fn create_linked(parents: &[CancellationToken]) -> Self {
        let child = Self::create();
        for parent in parents {
            let weak_child = child.inner.clone();
            parent.register_callback(move || {
                let child = CancellationToken { inner: weak_child };
                child.cancel_with_reason(CancellationReason::ParentCancelled);
            });
        }
        child
    }

    /// Cancels with `UserRequested`. No-op if already cancelled.
    pub fn cancel(&self) {
        self.cancel_with_reason(CancellationReason::UserRequested);
    }

    /// Cancels with a user-supplied message. No-op if already cancelled.
    pub fn cancel_with_message(&self, message: impl Into<String>) {
        self.cancel_with_reason(CancellationReason::UserRequestedWithMessage(message.into()));
    }

    fn cancel_with_reason(&self, reason: CancellationReason) {
        // Flip the flag first; only the thread that wins the flip runs the
        // callbacks, so callbacks fire exactly once even under concurrent
        // callers.
        if self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            *state = Some(CancelState {
                reason,
                at: Instant::now(),
            });
        }
        self.inner.timer_should_stop.store(true, Ordering::Release);

        // Snapshot and clear the callback map under lock, then release the
        // lock before invoking callbacks, so a callback that re-enters the
        // token (e.g. registers another callback, or is itself cancelling a
        // linked child) can't deadlock.
        let callbacks: Vec<Box<dyn FnOnce() + Send>> = {
            let mut map = self.inner.callbacks.lock().unwrap();
            map.drain().map(|(_, cb)| cb).collect()
        };
        for cb in callbacks {
            cb();
        }

        self.inner.condvar.notify_all();
    }

    /// True once cancellation has occurred for any reason.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// The recorded reason, if cancelled.
    pub fn get_reason(&self) -> Option<CancellationReason> {
        self.inner.state.lock().unwrap().as_ref().map(|s| s.reason.clone())
    }

    /// The instant cancellation occurred, if cancelled.
    pub fn cancelled_at(&self) -> Option<Instant> {
        self.inner.state.lock().unwrap().as_ref().map(|s| s.at)
    }

    /// Returns `Err(EngineError::Cancelled(reason))` if cancelled, else `Ok(())`.
    pub fn throw_if_cancelled(&self) -> EngineResult<()> {
        match self.get_reason() {
            Some(reason) => Err(EngineError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Registers `callback` to run exactly once, the first time this token
    /// is cancelled. If already cancelled, runs `callback` immediately and
    /// returns handle `0` ("already delivered"); `unregister_callback` with
    /// `0` is a harmless no-op.
    pub fn register_callback<F>(&self, callback: F) -> CallbackHandle
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_cancelled() {
            callback();
            return 0;
        }
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut map = self.inner.callbacks.lock().unwrap();
        // Re-check under lock: cancellation may have raced us between the
        // `is_cancelled()` probe above and taking the lock.
        if self.inner.cancelled.load(Ordering::Acquire) {
            drop(map);
            callback();
            return 0;
        }
        map.insert(handle, Box::new(callback));
        handle
    }

    /// Idempotently removes a previously registered callback. A no-op for
    /// handle `0` or an already-fired/unregistered handle.
    pub fn unregister_callback(&self, handle: CallbackHandle) {
        if handle == 0 {
            return;
        }
        self.inner.callbacks.lock().unwrap().remove(&handle);
    }

    /// Blocks until cancelled.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.is_none() {
            state = self.inner.condvar.wait(state).unwrap();
        }
    }

    /// Blocks until cancelled or `timeout` elapses. Returns `true` if
    /// cancelled, `false` on timeout.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// Blocks until cancelled or `deadline` is reached. Returns `true` if
    /// cancelled, `false` on timeout.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.is_some() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .inner
                .condvar
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
            if result.timed_out() && state.is_none() {
                return false;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::create()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_is_idempotent_and_sticky() {
        let token = CancellationToken::create();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.cancel(); // no-op, must not panic or change the reason
        assert_eq!(token.get_reason(), Some(CancellationReason::UserRequested));
    }

    #[test]
    fn callbacks_fire_exactly_once() {
        let token = CancellationToken::create();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let count = Arc::clone(&count);
            token.register_callback(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        token.cancel();
        token.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn register_after_cancellation_runs_immediately() {
        let token = CancellationToken::create();
        token.cancel();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let handle = token.register_callback(move || ran2.store(true, Ordering::SeqCst));
        assert_eq!(handle, 0);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn linked_child_cancels_with_parent() {
        let parent = CancellationToken::create();
        let child = CancellationToken::create_linked(&[parent.clone()]);
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        assert_eq!(child.get_reason(), Some(CancellationReason::ParentCancelled));
    }

    #[test]
    fn wait_for_times_out_without_cancellation() {
        let token = CancellationToken::create();
        assert!(!token.wait_for(Duration::from_millis(10)));
    }

    #[test]
    fn wait_for_returns_true_on_cancel() {
        let token = CancellationToken::create();
        let t2 = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            t2.cancel();
        });
        assert!(token.wait_for(Duration::from_secs(1)));
    }

    #[test]
    fn deadline_token_times_out() {
        let token = CancellationToken::create_with_timeout(Duration::from_millis(20));
        assert!(token.wait_for(Duration::from_secs(1)));
        assert_eq!(token.get_reason(), Some(CancellationReason::Timeout));
    }
}
