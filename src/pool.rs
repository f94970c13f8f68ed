//! Caller-owned worker pools.
//!
//! Builds and merges take a [`BuildPools`] instead of reaching for a global
//! pool. Vector-distance work (graph insertion, PQ training and encoding) runs
//! on `compute`; merge drivers run on `orchestration` and submit into `compute`,
//! so a nested submission never waits on a worker of its own pool.

use crate::error::{IndexError, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;

/// Pair of thread pools used by flush and merge.
#[derive(Clone)]
pub struct BuildPools {
    compute: Arc<ThreadPool>,
    orchestration: Arc<ThreadPool>,
}

impl BuildPools {
    /// Build both pools. Zero threads means one per available core for the
    /// compute pool and a single thread for orchestration.
    pub fn new(compute_threads: usize, orchestration_threads: usize) -> Result<Self> {
        let compute = ThreadPoolBuilder::new()
            .num_threads(compute_threads)
            .thread_name(|i| format!("segann-compute-{i}"))
            .build()
            .map_err(|e| IndexError::config(format!("compute pool: {e}")))?;
        let orchestration = ThreadPoolBuilder::new()
            .num_threads(orchestration_threads.max(1))
            .thread_name(|i| format!("segann-orchestration-{i}"))
            .build()
            .map_err(|e| IndexError::config(format!("orchestration pool: {e}")))?;
        Ok(Self::from_pools(Arc::new(compute), Arc::new(orchestration)))
    }

    /// Wrap pools the caller already owns.
    pub fn from_pools(compute: Arc<ThreadPool>, orchestration: Arc<ThreadPool>) -> Self {
        Self {
            compute,
            orchestration,
        }
    }

    pub fn compute(&self) -> &ThreadPool {
        &self.compute
    }

    pub fn orchestration(&self) -> &ThreadPool {
        &self.orchestration
    }
}

impl std::fmt::Debug for BuildPools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildPools")
            .field("compute_threads", &self.compute.current_num_threads())
            .field(
                "orchestration_threads",
                &self.orchestration.current_num_threads(),
            )
            .finish()
    }
}
