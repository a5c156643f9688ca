//! Fatal error taxonomy.
//!
//! Metadata requests have no recoverable error channel: a request either
//! yields metadata in some state or the process is terminated through
//! [`crate::fatal`]. These values describe why.

use crate::dependency::DependencyCycle;

/// An unrecoverable runtime condition.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// Two or more metadata records wait on each other's completion.
    #[error(transparent)]
    DependencyCycle(#[from] DependencyCycle),

    /// A blocking request for metadata was issued by the thread that is
    /// currently initializing that same metadata.
    #[error(
        "runtime error: unresolvable type metadata dependency cycle detected\n  \
         {metadata} was requested while its own initialization was in progress\nAborting!"
    )]
    ReentrantInitialization {
        /// Name of the metadata.
        metadata: String,
    },

    /// An instantiated witness table still has an empty requirement slot.
    #[error(
        "runtime error: witness table for {type_name}: {protocol} has no witness for requirement '{requirement}'"
    )]
    MissingWitness {
        /// Protocol name.
        protocol: &'static str,
        /// Requirement name.
        requirement: &'static str,
        /// Name of the conforming type.
        type_name: String,
    },

    /// A descriptor was instantiated with the wrong number of arguments.
    #[error("runtime error: {descriptor} expects {expected} generic arguments but {actual} were supplied")]
    ArgumentCountMismatch {
        /// Descriptor name.
        descriptor: &'static str,
        /// Declared generic parameter count.
        expected: usize,
        /// Supplied argument count.
        actual: usize,
    },
}

impl RuntimeError {
    /// Render the full diagnostic, truncating cycle chains to `max_bytes`.
    pub fn diagnostic(&self, max_bytes: usize) -> String {
        match self {
            RuntimeError::DependencyCycle(cycle) => cycle.diagnostic(max_bytes),
            other => other.to_string(),
        }
    }
}
