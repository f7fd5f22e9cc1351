//! A minimal `Executor` trait so host applications with their own
//! service-locator/DI traits can blanket-impl against something that
//! doesn't depend on this crate's concrete `Pool` type. SPEC_FULL.md §6
//! "Service-registration hook". Grounded on `original_source/include/
//! kcenon/thread/interfaces/executor_interface.h` (itself marked deprecated
//! upstream in favor of a unified `IExecutor`; we keep only the
//! submit/worker_count/shutdown surface it still has independent value for).

use crate::error::EngineResult;
use crate::job::Job;
use crate::pool::Pool;

/// Narrow adapter over a job executor: submit work, inspect capacity, shut
/// down. Exists so a host's own service container can depend on this trait
/// instead of the concrete `Pool`.
pub trait Executor {
    fn submit(&self, job: Job) -> EngineResult<()>;
    fn worker_count(&self) -> usize;
    fn shutdown(&self);
}

impl Executor for Pool {
    fn submit(&self, job: Job) -> EngineResult<()> {
        Pool::submit(self, job)
    }

    fn worker_count(&self) -> usize {
        Pool::worker_count(self)
    }

    fn shutdown(&self) {
        self.stop(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PoolBuilder;

    #[test]
    fn pool_implements_executor() {
        let pool = PoolBuilder::new().num_threads(1).build().unwrap();
        fn takes_executor(e: &dyn Executor) -> usize {
            e.worker_count()
        }
        assert_eq!(takes_executor(&pool), 1);
        pool.shutdown();
    }
}
