//! Configuration for the worker pool.

use taskring::{RegionConfig, MAX_WORKERS};

/// Configuration for [`crate::WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes to fork at start. `0 <= workers <=
    /// MAX_WORKERS`; zero is valid for transport-only setups where
    /// consumers run in-process.
    pub workers: usize,

    /// Run id used to derive isolated OS object names. `None` uses the
    /// production names; tests and a second host on the same machine set
    /// this to avoid colliding.
    pub run_id: Option<String>,

    /// Extra argv tokens appended after `--worker` for every child. The
    /// shipped binary understands `--slow` (delayed mock kernel).
    pub extra_worker_args: Vec<String>,
}

impl PoolConfig {
    /// Configuration with `workers` children and default names.
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            run_id: None,
            extra_worker_args: Vec::new(),
        }
    }

    /// Sets the run id for isolated OS object names.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Appends an extra worker argv token.
    pub fn with_worker_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_worker_args.push(arg.into());
        self
    }

    /// Region names derived from the run id.
    pub fn region_config(&self) -> RegionConfig {
        match &self.run_id {
            Some(id) => RegionConfig::for_run(id),
            None => RegionConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(MAX_WORKERS / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_changes_region_names() {
        let plain = PoolConfig::new(2);
        let suffixed = PoolConfig::new(2).with_run_id("abc");
        assert_ne!(
            plain.region_config().shm_name,
            suffixed.region_config().shm_name
        );
        assert!(suffixed.region_config().shm_name.ends_with(".abc"));
    }
}
