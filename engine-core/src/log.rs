//! Thin logging shim over the `log` facade, in the spirit of `rayon_core::log`:
//! the engine never chooses a backend, it only ever calls `log::*!` macros at
//! well-known event points (thread start/stop, steal, panics, state
//! transitions). Kept as its own module so the call sites read like
//! `self.log(|| Event::JobStolen { .. })` rather than scattering macro calls,
//! and so a future structured-logging backend only has one place to change.

use std::fmt;

/// One engine-internal lifecycle event worth logging. Closures that build an
/// `Event` are only invoked when logging at the appropriate level is enabled,
/// so event construction is not on the hot path when logging is off.
pub enum Event {
    ThreadStart { worker: usize },
    ThreadStop { worker: usize },
    JobPushed { worker: usize },
    JobPopped { worker: usize },
    JobStolen { worker: usize, victim: usize },
    JobInjected { count: usize },
    JobPanicked { worker: usize, message: String },
    QueueModeSwitched { from: &'static str, to: &'static str },
    CircuitTransition { from: &'static str, to: &'static str },
    ScalingDecision { from: usize, to: usize, reason: &'static str },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::ThreadStart { worker } => write!(f, "worker {worker} started"),
            Event::ThreadStop { worker } => write!(f, "worker {worker} stopped"),
            Event::JobPushed { worker } => write!(f, "worker {worker} pushed a job locally"),
            Event::JobPopped { worker } => write!(f, "worker {worker} popped a job locally"),
            Event::JobStolen { worker, victim } => {
                write!(f, "worker {worker} stole a job from worker {victim}")
            }
            Event::JobInjected { count } => write!(f, "{count} job(s) injected"),
            Event::JobPanicked { worker, message } => {
                write!(f, "worker {worker} caught a panic: {message}")
            }
            Event::QueueModeSwitched { from, to } => write!(f, "queue mode {from} -> {to}"),
            Event::CircuitTransition { from, to } => write!(f, "circuit breaker {from} -> {to}"),
            Event::ScalingDecision { from, to, reason } => {
                write!(f, "scaled {from} -> {to} workers ({reason})")
            }
        }
    }
}

/// Logs `event()` at `trace` level, lazily, the way `registry.rs` calls
/// `self.logger.log(|| JobsInjected { .. })`.
#[inline]
pub fn trace(event: impl FnOnce() -> Event) {
    if log::log_enabled!(log::Level::Trace) {
        log::trace!("{}", event());
    }
}

/// Logs `event()` at `debug` level; used for state transitions that are
/// useful outside of deep tracing (queue mode switches, circuit breaker
/// transitions, scaling decisions).
#[inline]
pub fn debug(event: impl FnOnce() -> Event) {
    if log::log_enabled!(log::Level::Debug) {
        log::debug!("{}", event());
    }
}

/// Logs `event()` at `warn` level; used for recoverable anomalies (a caught
/// job panic, a swallowed autoscaler/circuit-breaker internal error).
#[inline]
pub fn warn(event: impl FnOnce() -> Event) {
    if log::log_enabled!(log::Level::Warn) {
        log::warn!("{}", event());
    }
}
