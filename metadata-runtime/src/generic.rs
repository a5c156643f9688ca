//! Generic nominal type metadata.
//!
//! Records for structs, enums and classes are instantiated from a
//! [`TypeDescriptor`] and its arguments. A descriptor without a completion
//! function is done as soon as its referents are; otherwise the completion
//! function is run until it stops reporting dependencies.

use std::sync::atomic::Ordering;

use crate::cache::CacheEntryKind;
use crate::dependency::{check_transitive_completeness, is_cheaply_transitively_complete};
use crate::metadata::{
    Metadata, MetadataKind, MetadataRef, TypeDescriptor, TypeLayout, perform_basic_layout,
};
use crate::runtime::MetadataRuntime;
use crate::state::{
    CompletionContext, CompletionStep, MetadataDependency, MetadataRequest, MetadataState,
};

fn descriptor_id(descriptor: &'static TypeDescriptor) -> usize {
    descriptor as *const TypeDescriptor as usize
}

/// State implied by what a record already has, before completion finishes.
fn inferred_state(metadata: MetadataRef) -> MetadataState {
    if metadata.has_layout() {
        MetadataState::LayoutComplete
    } else {
        MetadataState::Abstract
    }
}

/// Cache entry kind for records instantiated from a descriptor.
pub(crate) struct GenericMetadataKind;

impl CacheEntryKind for GenericMetadataKind {
    type Template = &'static TypeDescriptor;

    const NAME: &'static str = "generic";

    fn template_id(template: Self::Template) -> usize {
        descriptor_id(template)
    }

    fn template_id_of(metadata: MetadataRef) -> usize {
        metadata.description().map_or(0, descriptor_id)
    }

    fn allocate(
        rt: &MetadataRuntime,
        descriptor: &'static TypeDescriptor,
        arguments: &[MetadataRef],
    ) -> (MetadataRef, MetadataState) {
        let metadata = Metadata::instantiate(rt.arena(), descriptor, arguments);

        if descriptor.pattern.complete.is_some() {
            return (metadata, inferred_state(metadata));
        }

        // Without a completion function the layout must be known now.
        if !metadata.has_layout() {
            metadata.publish_layout(match descriptor.kind {
                MetadataKind::Class => TypeLayout::REFERENCE,
                _ => TypeLayout::EMPTY,
            });
        }
        let state = if is_cheaply_transitively_complete(metadata) {
            MetadataState::Complete
        } else {
            MetadataState::NonTransitiveComplete
        };
        (metadata, state)
    }

    fn try_initialize(
        rt: &MetadataRuntime,
        metadata: MetadataRef,
        state: MetadataState,
        context: &mut CompletionContext,
    ) -> CompletionStep {
        if state < MetadataState::NonTransitiveComplete {
            let complete = metadata
                .description()
                .and_then(|descriptor| descriptor.pattern.complete);
            if let Some(complete) = complete {
                if let Some(dependency) = complete(rt, metadata, context) {
                    return CompletionStep::blocked(inferred_state(metadata), dependency);
                }
            }
        }

        match check_transitive_completeness(rt, metadata) {
            Some(dependency) => {
                CompletionStep::blocked(MetadataState::NonTransitiveComplete, dependency)
            }
            None => CompletionStep::complete(),
        }
    }
}

/// Completion function for types laid out as their fields in declaration order.
///
/// Each field type is requested at `LayoutComplete` without blocking. The
/// first one that is not there yet becomes the dependency; `context.data[0]`
/// remembers how many fields were already confirmed. Once every field has a
/// layout, offsets are written to the record's field offset words and the
/// aggregate layout is published. Class records are laid out as references.
pub fn initialize_struct_layout(
    rt: &MetadataRuntime,
    metadata: MetadataRef,
    context: &mut CompletionContext,
) -> Option<MetadataDependency> {
    let descriptor = metadata.description()?;
    let confirmed = context.data[0];
    let mut layouts = Vec::with_capacity(descriptor.fields.len());

    for (index, field) in descriptor.fields.iter().enumerate() {
        let response = field.ty.resolve(
            rt,
            MetadataRequest::non_blocking(MetadataState::LayoutComplete),
            metadata,
        );
        if index >= confirmed && !response.state.satisfies(MetadataState::LayoutComplete) {
            context.data[0] = index;
            return Some(MetadataDependency::new(
                response.metadata,
                MetadataState::LayoutComplete,
            ));
        }

        let layout = response.metadata.layout().unwrap_or_else(|| {
            tracing::warn!(
                field = field.name,
                ty = %response.metadata,
                "field type reached layout-complete without a layout"
            );
            TypeLayout::EMPTY
        });
        layouts.push(layout);
    }
    context.data[0] = descriptor.fields.len();

    let basic = perform_basic_layout(&layouts);
    for (word, &offset) in metadata.field_offsets().iter().zip(&basic.offsets) {
        word.store(offset, Ordering::Release);
    }
    metadata.publish_layout(match descriptor.kind {
        MetadataKind::Class => TypeLayout::REFERENCE,
        _ => basic.layout,
    });
    None
}
