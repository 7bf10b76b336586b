//! A minimal task-scheduling seam shared by EM's restart fan-out and
//! the HMM core's block-parallel passes.
//!
//! Everything in this crate that could run its independent units of
//! work in parallel does so through an [`Executor`] rather than
//! calling `rayon` directly, so a caller that wants strictly
//! sequential, deterministic execution — for debugging, or to bound
//! resource usage in a constrained environment — can swap in
//! [`SequentialExecutor`] without touching the algorithm code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

/// Runs a batch of independent, `Send` closures and collects their
/// outputs in input order.
pub trait Executor: Send + Sync {
    fn execute<T, F>(&self, tasks: Vec<F>) -> Vec<T>
    where
        T: Send,
        F: FnOnce() -> T + Send;

    /// Whether a cooperative cancellation has been requested. Polled
    /// by `em::fit_em` and `hmm::baum_welch::train` between
    /// iterations; the default executor is never cancelled.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Runs tasks across the global rayon thread pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct RayonExecutor;

impl Executor for RayonExecutor {
    fn execute<T, F>(&self, tasks: Vec<F>) -> Vec<T>
    where
        T: Send,
        F: FnOnce() -> T + Send,
    {
        tasks.into_par_iter().map(|f| f()).collect()
    }
}

/// Runs tasks one at a time on the calling thread, in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialExecutor;

impl Executor for SequentialExecutor {
    fn execute<T, F>(&self, tasks: Vec<F>) -> Vec<T>
    where
        T: Send,
        F: FnOnce() -> T + Send,
    {
        tasks.into_iter().map(|f| f()).collect()
    }
}

/// A cooperative cancellation flag: cloning shares the same
/// underlying signal, so a caller can hold one end and cancel a
/// running fit from another thread or an async handler.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wraps another `Executor`, reporting cancellation through a shared
/// [`CancellationToken`] instead of the default "never cancelled".
pub struct CancellableExecutor<E> {
    inner: E,
    token: CancellationToken,
}

impl<E> CancellableExecutor<E> {
    pub fn new(inner: E, token: CancellationToken) -> Self {
        Self { inner, token }
    }
}

impl<E: Executor> Executor for CancellableExecutor<E> {
    fn execute<T, F>(&self, tasks: Vec<F>) -> Vec<T>
    where
        T: Send,
        F: FnOnce() -> T + Send,
    {
        self.inner.execute(tasks)
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn rayon_executor_preserves_input_order() {
        let exec = RayonExecutor;
        let tasks: Vec<_> = (0..20).map(|i| move || i * i).collect();
        let results = exec.execute(tasks);
        let expected: Vec<i32> = (0..20).map(|i| i * i).collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn sequential_executor_runs_every_task_exactly_once() {
        let exec = SequentialExecutor;
        let counter = AtomicUsize::new(0);
        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let counter = &counter;
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    1
                }
            })
            .collect();
        let results = exec.execute(tasks);
        assert_eq!(results.len(), 5);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn cancellation_token_is_shared_across_clones() {
        let token = CancellationToken::new();
        let cloned = token.clone();
        assert!(!cloned.is_cancelled());
        token.cancel();
        assert!(cloned.is_cancelled());
    }

    #[test]
    fn cancellable_executor_reports_inner_executor_as_cancelled() {
        let token = CancellationToken::new();
        let exec = CancellableExecutor::new(SequentialExecutor, token.clone());
        assert!(!exec.is_cancelled());
        token.cancel();
        assert!(exec.is_cancelled());
        let tasks: Vec<_> = (0..3).map(|i| move || i + 1).collect();
        assert_eq!(exec.execute(tasks), vec![1, 2, 3]);
    }
}
