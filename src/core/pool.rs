//! Bounded-concurrency fan-out over independent work items.

use crate::types::InsarResult;

#[cfg(feature = "parallel")]
use crate::types::InsarError;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
#[cfg(feature = "parallel")]
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Runs a list of independent work items with at most `max_concurrency`
/// in flight at once.
///
/// Best effort: an item's failure is its own result and never cancels
/// siblings, so `run_all` over N items always yields exactly N results.
/// Used both for the small per-unit fan-out and the large per-pair one.
/// Without the `parallel` feature the items run sequentially, which
/// keeps every orchestration guarantee except the wall-clock win.
pub struct WorkerPool {
    #[cfg(feature = "parallel")]
    pool: ThreadPool,
    #[cfg(not(feature = "parallel"))]
    _max_concurrency: usize,
}

impl WorkerPool {
    #[cfg(feature = "parallel")]
    pub fn new(max_concurrency: usize) -> InsarResult<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(max_concurrency.max(1))
            .build()
            .map_err(|e| InsarError::Pool(e.to_string()))?;
        Ok(WorkerPool { pool })
    }

    #[cfg(not(feature = "parallel"))]
    pub fn new(max_concurrency: usize) -> InsarResult<Self> {
        Ok(WorkerPool {
            _max_concurrency: max_concurrency.max(1),
        })
    }

    /// Attempts every item exactly once; results come back in item order,
    /// but callers must not depend on completion order.
    #[cfg(feature = "parallel")]
    pub fn run_all<I, R, F>(&self, items: Vec<I>, work: F) -> Vec<R>
    where
        I: Send,
        R: Send,
        F: Fn(I) -> R + Send + Sync,
    {
        self.pool
            .install(|| items.into_par_iter().map(|item| work(item)).collect())
    }

    #[cfg(not(feature = "parallel"))]
    pub fn run_all<I, R, F>(&self, items: Vec<I>, work: F) -> Vec<R>
    where
        I: Send,
        R: Send,
        F: Fn(I) -> R + Send + Sync,
    {
        items.into_iter().map(work).collect()
    }
}
