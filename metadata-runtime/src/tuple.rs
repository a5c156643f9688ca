//! Tuple metadata.
//!
//! Tuples are keyed by their element list alone. They skip `LayoutComplete`:
//! a tuple can be laid out as soon as every element is, and is then at least
//! non-transitively complete.

use std::sync::atomic::Ordering;

use crate::cache::CacheEntryKind;
use crate::dependency::check_transitive_completeness;
use crate::metadata::{Metadata, MetadataRef, TypeLayout, perform_basic_layout};
use crate::runtime::MetadataRuntime;
use crate::state::{
    CompletionContext, CompletionStep, MetadataDependency, MetadataRequest, MetadataState,
};

/// Cache entry kind for non-empty tuples.
pub(crate) struct TupleMetadataKind;

impl CacheEntryKind for TupleMetadataKind {
    type Template = ();

    const NAME: &'static str = "tuple";

    fn template_id(_: ()) -> usize {
        0
    }

    fn template_id_of(_: MetadataRef) -> usize {
        0
    }

    fn allocate(
        rt: &MetadataRuntime,
        _: (),
        elements: &[MetadataRef],
    ) -> (MetadataRef, MetadataState) {
        (Metadata::tuple(rt.arena(), elements), MetadataState::Abstract)
    }

    fn try_initialize(
        rt: &MetadataRuntime,
        metadata: MetadataRef,
        _state: MetadataState,
        _context: &mut CompletionContext,
    ) -> CompletionStep {
        let elements = metadata.generic_arguments();
        let mut states = Vec::with_capacity(elements.len());

        for &element in elements {
            let response = rt.check_metadata_state(
                MetadataRequest::non_blocking(MetadataState::LayoutComplete),
                element,
            );
            if !response.state.satisfies(MetadataState::LayoutComplete) {
                return CompletionStep::blocked(
                    MetadataState::Abstract,
                    MetadataDependency::new(element, MetadataState::LayoutComplete),
                );
            }
            states.push(response.state);
        }

        if !metadata.has_layout() {
            let layouts: Vec<TypeLayout> = elements
                .iter()
                .map(|element| element.layout().unwrap_or(TypeLayout::EMPTY))
                .collect();
            let basic = perform_basic_layout(&layouts);
            for (word, &offset) in metadata.field_offsets().iter().zip(&basic.offsets) {
                word.store(offset, Ordering::Release);
            }
            metadata.publish_layout(basic.layout);
        }

        if states.iter().all(|&state| state == MetadataState::Complete) {
            return CompletionStep::complete();
        }

        let incomplete = states
            .iter()
            .position(|&state| state < MetadataState::NonTransitiveComplete);
        if let Some(index) = incomplete {
            return CompletionStep::blocked(
                MetadataState::NonTransitiveComplete,
                MetadataDependency::new(elements[index], MetadataState::NonTransitiveComplete),
            );
        }

        match check_transitive_completeness(rt, metadata) {
            Some(dependency) => {
                CompletionStep::blocked(MetadataState::NonTransitiveComplete, dependency)
            }
            None => CompletionStep::complete(),
        }
    }
}
