//! Runtime counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::arena::ArenaStats;

/// Snapshot of runtime activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Metadata records allocated by the generic and tuple caches.
    pub metadata_instantiations: u64,
    /// Requests that found an existing cache entry.
    pub cache_hits: u64,
    /// Completion steps run.
    pub completion_steps: u64,
    /// Dependencies returned by completion steps.
    pub dependencies_raised: u64,
    /// Records resumed from a completion queue.
    pub queue_resumptions: u64,
    /// Witness tables built by the general path.
    pub witness_tables_instantiated: u64,
    /// Witness requests answered by the template itself.
    pub witness_fast_paths: u64,
    /// Foreign names registered.
    pub foreign_types_registered: u64,
    /// Times a foreign registrant waited for an initializer.
    pub foreign_waits: u64,
    /// Arena counters.
    pub arena: ArenaStats,
}

/// Live counters behind [`RuntimeStats`].
#[derive(Debug, Default)]
pub(crate) struct RuntimeCounters {
    pub(crate) metadata_instantiations: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) completion_steps: AtomicU64,
    pub(crate) dependencies_raised: AtomicU64,
    pub(crate) queue_resumptions: AtomicU64,
    pub(crate) witness_tables_instantiated: AtomicU64,
    pub(crate) witness_fast_paths: AtomicU64,
    pub(crate) foreign_types_registered: AtomicU64,
    pub(crate) foreign_waits: AtomicU64,
}

impl RuntimeCounters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, arena: ArenaStats) -> RuntimeStats {
        RuntimeStats {
            metadata_instantiations: self.metadata_instantiations.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            completion_steps: self.completion_steps.load(Ordering::Relaxed),
            dependencies_raised: self.dependencies_raised.load(Ordering::Relaxed),
            queue_resumptions: self.queue_resumptions.load(Ordering::Relaxed),
            witness_tables_instantiated: self.witness_tables_instantiated.load(Ordering::Relaxed),
            witness_fast_paths: self.witness_fast_paths.load(Ordering::Relaxed),
            foreign_types_registered: self.foreign_types_registered.load(Ordering::Relaxed),
            foreign_waits: self.foreign_waits.load(Ordering::Relaxed),
            arena,
        }
    }
}
