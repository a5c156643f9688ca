//! Completion states, requests and responses.

use std::fmt;

use crate::metadata::MetadataRef;

/// How far a metadata record has progressed through completion.
///
/// States are ordered and a record's state never decreases. Some kinds skip
/// `LayoutComplete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum MetadataState {
    /// Allocated; only identity and generic arguments are usable.
    #[default]
    Abstract = 0,
    /// Size, alignment and stride are known.
    LayoutComplete = 1,
    /// The record itself is complete; referenced types may not be.
    NonTransitiveComplete = 2,
    /// The record and everything it structurally references are complete.
    Complete = 3,
}

impl MetadataState {
    /// Decode a state stored as its discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MetadataState::Abstract),
            1 => Some(MetadataState::LayoutComplete),
            2 => Some(MetadataState::NonTransitiveComplete),
            3 => Some(MetadataState::Complete),
            _ => None,
        }
    }

    /// Whether this state meets `required`.
    #[inline]
    pub fn satisfies(self, required: MetadataState) -> bool {
        self >= required
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataState::Abstract => "abstract",
            MetadataState::LayoutComplete => "layout-complete",
            MetadataState::NonTransitiveComplete => "non-transitive-complete",
            MetadataState::Complete => "complete",
        }
    }

    /// Wording used in dependency diagnostics.
    pub(crate) fn requirement_phrase(&self) -> &'static str {
        match self {
            MetadataState::Complete => "transitive completion",
            MetadataState::NonTransitiveComplete => "completion",
            MetadataState::LayoutComplete => "layout",
            MetadataState::Abstract => "<corruption>",
        }
    }
}

impl fmt::Display for MetadataState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for metadata in at least some state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataRequest {
    /// The state the caller needs.
    pub state: MetadataState,
    /// Return immediately with whatever state is current instead of waiting.
    pub non_blocking: bool,
}

impl MetadataRequest {
    /// Wait until `state` has been reached.
    pub const fn blocking(state: MetadataState) -> Self {
        Self {
            state,
            non_blocking: false,
        }
    }

    /// Poll for `state` without waiting.
    pub const fn non_blocking(state: MetadataState) -> Self {
        Self {
            state,
            non_blocking: true,
        }
    }

    /// A blocking request for complete metadata.
    pub const fn complete() -> Self {
        Self::blocking(MetadataState::Complete)
    }

    /// Whether the request may wait.
    pub fn is_blocking(&self) -> bool {
        !self.non_blocking
    }

    /// Whether `state` satisfies the request.
    pub fn is_satisfied_by(&self, state: MetadataState) -> bool {
        state.satisfies(self.state)
    }
}

impl Default for MetadataRequest {
    fn default() -> Self {
        Self::complete()
    }
}

/// Metadata together with the state it was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataResponse {
    /// The metadata record.
    pub metadata: MetadataRef,
    /// Its state when the request returned. It may have advanced since.
    pub state: MetadataState,
}

impl MetadataResponse {
    /// A response for metadata that needs no completion.
    pub fn complete(metadata: MetadataRef) -> Self {
        Self {
            metadata,
            state: MetadataState::Complete,
        }
    }

    /// Whether the metadata was complete.
    pub fn is_complete(&self) -> bool {
        self.state == MetadataState::Complete
    }
}

/// "Cannot continue until `target` reaches `required`."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataDependency {
    /// The metadata being waited on.
    pub target: MetadataRef,
    /// The state it must reach.
    pub required: MetadataState,
}

impl MetadataDependency {
    /// Create a dependency.
    pub fn new(target: MetadataRef, required: MetadataState) -> Self {
        Self { target, required }
    }
}

impl fmt::Display for MetadataDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}", self.required.requirement_phrase(), self.target)
    }
}

/// Scratch space carried between completion steps of one record.
///
/// Completion functions own its meaning; the runtime only stores it while the
/// record is parked on a dependency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionContext {
    /// Opaque words.
    pub data: [usize; 4],
}

/// Outcome of one completion step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStep {
    /// State reached by the step.
    pub new_state: MetadataState,
    /// What the step is waiting on, if it stopped early.
    pub dependency: Option<MetadataDependency>,
}

impl CompletionStep {
    /// The record reached `Complete`.
    pub fn complete() -> Self {
        Self {
            new_state: MetadataState::Complete,
            dependency: None,
        }
    }

    /// The record reached `state` and is blocked on `dependency`.
    pub fn blocked(state: MetadataState, dependency: MetadataDependency) -> Self {
        Self {
            new_state: state,
            dependency: Some(dependency),
        }
    }
}
