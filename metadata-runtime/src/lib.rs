//! # Metadata Runtime Library
//!
//! Runtime support for generic type metadata:
//!
//! - **Metadata Cache**: one record per (descriptor, arguments), created once
//!   under concurrency
//! - **Completion**: records advance through `Abstract`, `LayoutComplete`,
//!   `NonTransitiveComplete` and `Complete`, never backwards
//! - **Dependencies**: blocked completions name what they wait for; cycles
//!   are detected and reported as fatal errors
//! - **Witness Tables**: per-(conformance, type) protocol witness tables
//! - **Arena**: lock-free bump allocation for immortal records
//! - **Foreign Types**: one canonical record per foreign type name
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      METADATA RUNTIME                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Generic    │  │    Tuple     │  │   Witness    │          │
//! │  │ (generic.rs) │  │  (tuple.rs)  │  │ (witness.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │  ┌──────────────┐  ┌──────────────┐         │                   │
//! │  │    Cache     │──│  Dependency  │         │                   │
//! │  │  (cache.rs)  │  │ (dependency) │         │                   │
//! │  └──────────────┘  └──────────────┘         │                   │
//! │         │                                   │                   │
//! │         └─────────────────┬─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Arena     │  │   Foreign    │  │    Fatal     │          │
//! │  │  (arena.rs)  │  │ (foreign.rs) │  │  (fatal.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use metadata_runtime::{MetadataRequest, builtins, get_or_create_type_metadata};
//!
//! let response = get_or_create_type_metadata(
//!     MetadataRequest::complete(),
//!     &PAIR_DESCRIPTOR,
//!     &[builtins::int32(), builtins::double()],
//! );
//! assert!(response.is_complete());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod arena;
pub mod builtins;
mod cache;
pub mod config;
pub mod dependency;
pub mod error;
pub mod fatal;
pub mod foreign;
pub mod generic;
pub mod log;
pub mod metadata;
pub mod runtime;
pub mod state;
pub mod stats;
mod tuple;
pub mod witness;

// Re-exports
pub use arena::{ArenaStats, MetadataArena};
pub use cache::TypeKey;
pub use config::{ConfigError, FatalPolicy, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use dependency::DependencyCycle;
pub use error::RuntimeError;
pub use fatal::{FatalReport, add_fatal_hook, fatal_count};
pub use foreign::{ForeignInitializer, ForeignTypeMetadata};
pub use generic::initialize_struct_layout;
pub use metadata::{
    CompletionFn, FieldDescriptor, FieldType, InstantiationPattern, Metadata, MetadataInit,
    MetadataKind, MetadataRef, MetadataSource, TypeDescriptor, TypeLayout,
};
pub use runtime::MetadataRuntime;
pub use state::{
    CompletionContext, MetadataDependency, MetadataRequest, MetadataResponse, MetadataState,
};
pub use stats::RuntimeStats;
pub use witness::{
    GenericWitnessTable, ProtocolDescriptor, ProtocolRequirement, RequirementKind,
    ResilientWitness, WitnessEntry, WitnessTable, WitnessTableInit, WitnessTableRef,
};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the global runtime with `config` and install logging.
///
/// Only the first initialization takes effect; later calls return the
/// runtime that already exists.
///
/// # Example
///
/// ```rust,ignore
/// use metadata_runtime::{FatalPolicy, RuntimeConfig, init_with_runtime_config};
///
/// let config = RuntimeConfig::builder()
///     .page_size(64 * 1024)
///     .fatal_policy(FatalPolicy::Panic)
///     .build()
///     .unwrap();
///
/// let runtime = init_with_runtime_config(config);
/// ```
pub fn init_with_runtime_config(config: RuntimeConfig) -> &'static MetadataRuntime {
    log::init(&config.log);
    match MetadataRuntime::install(config) {
        Ok(runtime) => runtime,
        Err(existing) => {
            tracing::warn!("metadata runtime already initialized; keeping existing configuration");
            existing
        }
    }
}

/// Initialize the global runtime from environment variables.
///
/// Reads configuration from `METADATA_*` environment variables.
/// See `RuntimeConfig::from_env()` for the full list of supported variables.
pub fn init_from_env() -> &'static MetadataRuntime {
    init_with_runtime_config(RuntimeConfig::from_env())
}

/// Configuration of the global runtime.
///
/// Returns `None` if the global runtime has not been created yet.
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    MetadataRuntime::try_global().map(MetadataRuntime::config)
}

/// [`MetadataRuntime::get_or_create_type_metadata`] on the global runtime.
pub fn get_or_create_type_metadata(
    request: MetadataRequest,
    descriptor: &'static TypeDescriptor,
    arguments: &[MetadataRef],
) -> MetadataResponse {
    MetadataRuntime::global().get_or_create_type_metadata(request, descriptor, arguments)
}

/// [`MetadataRuntime::get_tuple_metadata`] on the global runtime.
pub fn get_tuple_metadata(request: MetadataRequest, elements: &[MetadataRef]) -> MetadataResponse {
    MetadataRuntime::global().get_tuple_metadata(request, elements)
}

/// [`MetadataRuntime::check_metadata_state`] on the global runtime.
pub fn check_metadata_state(request: MetadataRequest, metadata: MetadataRef) -> MetadataResponse {
    MetadataRuntime::global().check_metadata_state(request, metadata)
}

/// [`MetadataRuntime::get_or_create_witness_table`] on the global runtime.
pub fn get_or_create_witness_table(
    template: &'static GenericWitnessTable,
    conforming_type: MetadataRef,
    arguments: &[WitnessTableRef],
) -> WitnessTableRef {
    MetadataRuntime::global().get_or_create_witness_table(template, conforming_type, arguments)
}

/// [`MetadataRuntime::unique_foreign_type`] on the global runtime.
pub fn unique_foreign_type(candidate: &'static ForeignTypeMetadata) -> MetadataRef {
    MetadataRuntime::global().unique_foreign_type(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    static PAIR: TypeDescriptor = TypeDescriptor::new("Pair", MetadataKind::Struct, 2);

    #[test]
    fn test_global_entry_points() {
        let runtime = init_with_runtime_config(RuntimeConfig::default());
        assert!(runtime_config().is_some());
        assert!(std::ptr::eq(runtime, MetadataRuntime::global()));

        let args = [builtins::int32(), builtins::double()];
        let first = get_or_create_type_metadata(MetadataRequest::complete(), &PAIR, &args);
        let second = get_or_create_type_metadata(MetadataRequest::complete(), &PAIR, &args);
        assert_eq!(first.metadata, second.metadata);
        assert!(first.is_complete());
        assert_eq!(first.metadata.to_string(), "Pair<Int32, Double>");

        let polled = check_metadata_state(
            MetadataRequest::non_blocking(MetadataState::Complete),
            first.metadata,
        );
        assert_eq!(polled.state, MetadataState::Complete);
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
