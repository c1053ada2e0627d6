//! Per-heap configuration.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use crate::params;

// ============================================================================
// Defaults
// ============================================================================

/// Number of free-list shards, and the factor segments are partitioned by.
pub const DEFAULT_THREAD_NUM: usize = 3;

/// Unit that new segments are rounded up to.
pub const DEFAULT_GRANULARITY: usize = 16 * 1024;

/// Requests of at least this size get their own mapping.
pub const DEFAULT_MMAP_THRESHOLD: usize = 256 * 1024;

/// Top chunk size past which `free` tries to give memory back.
pub const DEFAULT_TRIM_THRESHOLD: usize = 2 * 1024 * 1024;

/// Soft limit on a teardown finalizer pass.
pub const DEFAULT_FINALIZER_BUDGET: Duration = Duration::from_secs(3);

/// Tuning for one heap and its collector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeapConfig {
    /// Number of free-list shards used while sweeping. Default: 3.
    pub thread_num: usize,
    /// Number of pool threads. When this differs from `thread_num` the
    /// collecting thread also runs sweep tasks. Default: `thread_num - 1`.
    pub worker_threads: usize,
    /// Segment size granularity; a power of two no smaller than a page.
    /// Default: 16 KiB.
    pub granularity: usize,
    /// Default: 256 KiB.
    pub mmap_threshold: usize,
    /// Default: 2 MiB.
    pub trim_threshold: usize,
    /// Carve small segments from a 1 MiB slab. Default: on.
    pub mmap_cache: bool,
    /// Return the pages of large free chunks to the OS while sweeping.
    /// Default: off.
    pub madvise: bool,
    /// Upper bound on the heap footprint; 0 means unlimited.
    pub footprint_limit: usize,
    /// Default: 3 s.
    pub finalizer_budget: Duration,
    /// Used in logs and worker thread names.
    pub name: &'static str,
    /// Skip logging from the heap's own paths. Default: off, but on for
    /// [`Heap::new`](../allocators/struct.Heap.html#method.new).
    pub quiet: bool,
}

impl HeapConfig {
    pub const fn new() -> Self {
        HeapConfig {
            thread_num: DEFAULT_THREAD_NUM,
            worker_threads: DEFAULT_THREAD_NUM - 1,
            granularity: DEFAULT_GRANULARITY,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
            trim_threshold: DEFAULT_TRIM_THRESHOLD,
            mmap_cache: true,
            madvise: false,
            footprint_limit: 0,
            finalizer_budget: DEFAULT_FINALIZER_BUDGET,
            name: "gc_heap",
            quiet: false,
        }
    }

    /// Set the shard count, and size the pool to match.
    pub fn with_thread_num(mut self, thread_num: usize) -> Self {
        self.thread_num = thread_num;
        self.worker_threads = thread_num.saturating_sub(1);
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_mmap_threshold(mut self, threshold: usize) -> Self {
        self.mmap_threshold = threshold;
        self
    }

    pub fn with_trim_threshold(mut self, threshold: usize) -> Self {
        self.trim_threshold = threshold;
        self
    }

    pub fn with_mmap_cache(mut self, enabled: bool) -> Self {
        self.mmap_cache = enabled;
        self
    }

    pub fn with_madvise(mut self, enabled: bool) -> Self {
        self.madvise = enabled;
        self
    }

    pub fn with_footprint_limit(mut self, limit: usize) -> Self {
        self.footprint_limit = limit;
        self
    }

    pub fn with_finalizer_budget(mut self, budget: Duration) -> Self {
        self.finalizer_budget = budget;
        self
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_num == 0 {
            return Err(ConfigError::ZeroThreadNum);
        }
        if !self.granularity.is_power_of_two() {
            return Err(ConfigError::GranularityNotPowerOfTwo(self.granularity));
        }
        let page_size = params::page_size();
        if self.granularity < page_size {
            return Err(ConfigError::GranularityBelowPage {
                granularity: self.granularity,
                page_size,
            });
        }
        Ok(())
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    ZeroThreadNum,
    GranularityNotPowerOfTwo(usize),
    GranularityBelowPage { granularity: usize, page_size: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ConfigError::ZeroThreadNum => write!(f, "thread_num must be at least 1"),
            ConfigError::GranularityNotPowerOfTwo(g) => {
                write!(f, "granularity {} is not a power of two", g)
            }
            ConfigError::GranularityBelowPage {
                granularity,
                page_size,
            } => write!(
                f,
                "granularity {} is smaller than the page size {}",
                granularity, page_size
            ),
        }
    }
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn defaults_are_valid() {
        let config = HeapConfig::default();
        assert_eq!(config.thread_num, 3);
        assert_eq!(config.worker_threads, 2);
        assert!(!config.madvise);
        assert_eq!(config.finalizer_budget, Duration::from_secs(3));
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn bad_values_are_rejected() {
        let zero = HeapConfig::new().with_thread_num(0);
        assert_eq!(zero.validate(), Err(ConfigError::ZeroThreadNum));

        let odd = HeapConfig::new().with_granularity(3 * 4096);
        assert_eq!(
            odd.validate(),
            Err(ConfigError::GranularityNotPowerOfTwo(3 * 4096))
        );

        let tiny = HeapConfig::new().with_granularity(16);
        assert!(matches!(
            tiny.validate(),
            Err(ConfigError::GranularityBelowPage { .. })
        ));
    }

    #[test]
    fn thread_num_sizes_the_pool() {
        let config = HeapConfig::new().with_thread_num(6);
        assert_eq!(config.worker_threads, 5);
        let config = config.with_worker_threads(6);
        assert_eq!(config.thread_num, 6);
        assert_eq!(config.worker_threads, 6);
    }
}
