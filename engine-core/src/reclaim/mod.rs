//! Safe memory reclamation layer: hazard pointers and the atomic-shared-pointer
//! alternative. See SPEC_FULL.md §4.1.

pub mod atomic_shared;
pub mod hazard;

pub use atomic_shared::AtomicSharedPtr;
pub use hazard::{registry, HazardGuard};
