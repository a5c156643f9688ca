//! The metadata runtime service.
//!
//! [`MetadataRuntime`] owns the arena and every cache. The process normally
//! uses one lazily constructed global instance; tests and embedders can build
//! independent ones with [`MetadataRuntime::new`].

use std::sync::{Arc, OnceLock};

use crate::arena::MetadataArena;
use crate::builtins;
use crate::cache::{CacheEntry, MetadataCache, QueuedCompletion, Resumable};
use crate::config::RuntimeConfig;
use crate::dependency::{DependencyCycle, check_dependency_cycle};
use crate::error::RuntimeError;
use crate::fatal::fatal_error;
use crate::foreign::{ForeignTypeMap, ForeignTypeMetadata};
use crate::generic::GenericMetadataKind;
use crate::metadata::{MetadataRef, MetadataSource, TypeDescriptor};
use crate::state::{MetadataDependency, MetadataRequest, MetadataResponse, MetadataState};
use crate::stats::{RuntimeCounters, RuntimeStats};
use crate::tuple::TupleMetadataKind;
use crate::witness::{GenericWitnessTable, WitnessTableCache, WitnessTableRef};

/// The process-wide runtime.
static GLOBAL_RUNTIME: OnceLock<MetadataRuntime> = OnceLock::new();

/// The cache entry that tracks a record, if any.
enum CachedEntry {
    Generic(Arc<CacheEntry<GenericMetadataKind>>),
    Tuple(Arc<CacheEntry<TupleMetadataKind>>),
    /// Static records, and records whose entry could not be found.
    Uncached,
}

/// Metadata instantiation, caching and completion.
pub struct MetadataRuntime {
    config: RuntimeConfig,
    arena: MetadataArena,
    generic: MetadataCache<GenericMetadataKind>,
    tuples: MetadataCache<TupleMetadataKind>,
    witnesses: WitnessTableCache,
    foreign: ForeignTypeMap,
    counters: RuntimeCounters,
}

impl MetadataRuntime {
    /// Create an independent runtime.
    pub fn new(config: RuntimeConfig) -> Self {
        let arena = MetadataArena::new(&config.arena);
        tracing::debug!(
            page_size = arena.page_size(),
            max_pool_allocation = arena.max_pool_allocation(),
            fatal_policy = config.diagnostics.fatal_policy.as_str(),
            "metadata runtime created"
        );
        Self {
            config,
            arena,
            generic: MetadataCache::new(),
            tuples: MetadataCache::new(),
            witnesses: WitnessTableCache::new(),
            foreign: ForeignTypeMap::new(),
            counters: RuntimeCounters::default(),
        }
    }

    /// The global runtime, configured from the environment on first use
    /// unless [`install`](Self::install) ran earlier.
    pub fn global() -> &'static MetadataRuntime {
        GLOBAL_RUNTIME.get_or_init(|| MetadataRuntime::new(RuntimeConfig::from_env()))
    }

    /// The global runtime, if it was already created.
    pub fn try_global() -> Option<&'static MetadataRuntime> {
        GLOBAL_RUNTIME.get()
    }

    /// Install the global runtime with `config`.
    ///
    /// Returns the installed runtime, or `Err` with the existing one if the
    /// global runtime was already created.
    pub fn install(
        config: RuntimeConfig,
    ) -> Result<&'static MetadataRuntime, &'static MetadataRuntime> {
        let mut installed = false;
        let runtime = GLOBAL_RUNTIME.get_or_init(|| {
            installed = true;
            MetadataRuntime::new(config)
        });
        if installed { Ok(runtime) } else { Err(runtime) }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The allocation arena.
    pub fn arena(&self) -> &MetadataArena {
        &self.arena
    }

    /// Snapshot of runtime counters.
    pub fn stats(&self) -> RuntimeStats {
        self.counters.snapshot(self.arena.stats())
    }

    /// Number of records held by the generic and tuple caches.
    pub fn cached_metadata_count(&self) -> usize {
        self.generic.len() + self.tuples.len()
    }

    /// Number of foreign names registered.
    pub fn foreign_type_count(&self) -> usize {
        self.foreign.len()
    }

    pub(crate) fn counters(&self) -> &RuntimeCounters {
        &self.counters
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Metadata for `descriptor` applied to `arguments`.
    ///
    /// Repeated requests with the same descriptor and arguments return the
    /// same record. The returned state satisfies `request` unless it is
    /// non-blocking.
    pub fn get_or_create_type_metadata(
        &self,
        request: MetadataRequest,
        descriptor: &'static TypeDescriptor,
        arguments: &[MetadataRef],
    ) -> MetadataResponse {
        if descriptor.generic_params != arguments.len() {
            self.fatal(RuntimeError::ArgumentCountMismatch {
                descriptor: descriptor.name,
                expected: descriptor.generic_params,
                actual: arguments.len(),
            });
        }
        self.generic.get_or_insert(self, request, descriptor, arguments)
    }

    /// Metadata for the tuple of `elements`.
    pub fn get_tuple_metadata(
        &self,
        request: MetadataRequest,
        elements: &[MetadataRef],
    ) -> MetadataResponse {
        if elements.is_empty() {
            return MetadataResponse::complete(builtins::empty_tuple());
        }
        self.tuples.get_or_insert(self, request, (), elements)
    }

    /// Current state of `metadata`, waiting for `request.state` if blocking.
    ///
    /// Successive non-blocking polls never observe a lower state.
    pub fn check_metadata_state(
        &self,
        request: MetadataRequest,
        metadata: MetadataRef,
    ) -> MetadataResponse {
        match self.lookup_entry(metadata) {
            CachedEntry::Generic(entry) => entry.await_request(self, request),
            CachedEntry::Tuple(entry) => entry.await_request(self, request),
            CachedEntry::Uncached => MetadataResponse::complete(metadata),
        }
    }

    /// Witness table for `conforming_type`'s conformance described by `template`.
    pub fn get_or_create_witness_table(
        &self,
        template: &'static GenericWitnessTable,
        conforming_type: MetadataRef,
        arguments: &[WitnessTableRef],
    ) -> WitnessTableRef {
        self.witnesses
            .get_or_insert(self, template, conforming_type, arguments)
    }

    /// Canonical metadata for a foreign type candidate.
    pub fn unique_foreign_type(&self, candidate: &'static ForeignTypeMetadata) -> MetadataRef {
        self.foreign.unique(&self.counters, candidate)
    }

    /// Check whether `start` waiting on `first` closes a cycle.
    pub fn check_dependency_cycle(
        &self,
        start: MetadataRef,
        first: MetadataDependency,
    ) -> Result<(), DependencyCycle> {
        check_dependency_cycle(self, start, first)
    }

    // ========================================================================
    // Internals shared by the caches
    // ========================================================================

    fn lookup_entry(&self, metadata: MetadataRef) -> CachedEntry {
        let entry = match metadata.source() {
            MetadataSource::Static => return CachedEntry::Uncached,
            MetadataSource::Generic => self.generic.entry_for(metadata).map(CachedEntry::Generic),
            MetadataSource::Tuple => self.tuples.entry_for(metadata).map(CachedEntry::Tuple),
        };
        entry.unwrap_or_else(|| {
            tracing::warn!(%metadata, "metadata is not owned by this runtime");
            CachedEntry::Uncached
        })
    }

    /// Published state of `metadata`, without waiting.
    pub(crate) fn current_state(&self, metadata: MetadataRef) -> MetadataState {
        let state = match self.lookup_entry(metadata) {
            CachedEntry::Generic(entry) => entry.state(),
            CachedEntry::Tuple(entry) => entry.state(),
            CachedEntry::Uncached => Some(MetadataState::Complete),
        };
        state.unwrap_or(MetadataState::Abstract)
    }

    /// What `dependency.target` is itself blocked on, if it has not reached
    /// `dependency.required`.
    pub(crate) fn blocking_dependency(
        &self,
        dependency: MetadataDependency,
    ) -> Option<MetadataDependency> {
        match self.lookup_entry(dependency.target) {
            CachedEntry::Generic(entry) => entry.blocked_on(dependency.required),
            CachedEntry::Tuple(entry) => entry.blocked_on(dependency.required),
            CachedEntry::Uncached => None,
        }
    }

    /// Record that `metadata` waits on `dependency`; a cycle is fatal.
    pub(crate) fn note_dependency(&self, metadata: MetadataRef, dependency: MetadataDependency) {
        RuntimeCounters::bump(&self.counters.dependencies_raised);
        tracing::trace!(%metadata, on = %dependency, "dependency raised");

        if let Err(cycle) = check_dependency_cycle(self, metadata, dependency) {
            self.fatal(RuntimeError::DependencyCycle(cycle));
        }
    }

    /// Park `completion` on `target`'s queue. Fails if `target` already
    /// satisfies it.
    pub(crate) fn enqueue(
        &self,
        target: MetadataRef,
        completion: QueuedCompletion,
    ) -> Result<(), QueuedCompletion> {
        match self.lookup_entry(target) {
            CachedEntry::Generic(entry) => entry.try_enqueue(completion),
            CachedEntry::Tuple(entry) => entry.try_enqueue(completion),
            CachedEntry::Uncached => Err(completion),
        }
    }

    /// Continue a parked entry on this thread.
    pub(crate) fn resume(&self, waiter: Arc<dyn Resumable>) {
        RuntimeCounters::bump(&self.counters.queue_resumptions);
        waiter.resume(self);
    }

    /// Report `error` according to the configured fatal policy.
    pub(crate) fn fatal(&self, error: RuntimeError) -> ! {
        let diagnostics = &self.config.diagnostics;
        fatal_error(diagnostics.fatal_policy, &error, diagnostics.max_diagnostic_bytes)
    }
}

impl Default for MetadataRuntime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl std::fmt::Debug for MetadataRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataRuntime")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        FieldDescriptor, FieldType, InstantiationPattern, MetadataKind, TypeLayout,
    };
    use crate::generic::initialize_struct_layout;

    static WRAPPER_FIELDS: [FieldDescriptor; 1] = [FieldDescriptor {
        name: "value",
        ty: FieldType::Argument(0),
    }];

    static WRAPPER: TypeDescriptor = TypeDescriptor::new("Wrapper", MetadataKind::Struct, 1)
        .with_fields(&WRAPPER_FIELDS)
        .with_pattern(InstantiationPattern {
            complete: Some(initialize_struct_layout),
            ..InstantiationPattern::EMPTY
        });

    #[test]
    fn test_static_metadata_is_complete() {
        let rt = MetadataRuntime::default();
        let response = rt.check_metadata_state(MetadataRequest::complete(), builtins::int32());
        assert!(response.is_complete());
        assert_eq!(rt.cached_metadata_count(), 0);
    }

    #[test]
    fn test_empty_tuple_bypasses_cache() {
        let rt = MetadataRuntime::default();
        let response = rt.get_tuple_metadata(MetadataRequest::complete(), &[]);
        assert_eq!(response.metadata, builtins::empty_tuple());
        assert_eq!(rt.stats().metadata_instantiations, 0);
    }

    #[test]
    fn test_same_key_same_record() {
        let rt = MetadataRuntime::default();
        let complete = MetadataRequest::complete();
        let a = rt.get_or_create_type_metadata(complete, &WRAPPER, &[builtins::int64()]);
        let b = rt.get_or_create_type_metadata(complete, &WRAPPER, &[builtins::int64()]);
        let c = rt.get_or_create_type_metadata(complete, &WRAPPER, &[builtins::int8()]);

        assert_eq!(a.metadata, b.metadata);
        assert_ne!(a.metadata, c.metadata);
        assert_eq!(a.metadata.layout(), Some(TypeLayout::scalar(8)));
        assert_eq!(rt.stats().metadata_instantiations, 2);
        assert_eq!(rt.stats().cache_hits, 1);
    }

    #[test]
    fn test_tuple_of_generic_instances() {
        let rt = MetadataRuntime::default();
        let complete = MetadataRequest::complete();
        let wrapped = rt
            .get_or_create_type_metadata(complete, &WRAPPER, &[builtins::int32()])
            .metadata;
        let tuple = rt.get_tuple_metadata(complete, &[builtins::int8(), wrapped]);

        assert!(tuple.is_complete());
        assert_eq!(tuple.metadata.field_offset(0), Some(0));
        assert_eq!(tuple.metadata.field_offset(1), Some(4));
        assert_eq!(tuple.metadata.layout().map(|layout| layout.size), Some(8));
        assert_eq!(tuple.metadata.to_string(), "(Int8, Wrapper<Int32>)");
    }

    #[test]
    fn test_install_only_once() {
        let first = MetadataRuntime::install(RuntimeConfig::default());
        let second = MetadataRuntime::install(RuntimeConfig::default());
        assert!(second.is_err());
        if let Ok(first) = first {
            assert!(std::ptr::eq(first, MetadataRuntime::global()));
        }
    }
}
