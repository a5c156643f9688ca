//! Property-based tests for the metadata runtime.
//!
//! Uses proptest to generate random inputs and verify invariants hold.

use metadata_runtime::arena::MetadataArena;
use metadata_runtime::builtins;
use metadata_runtime::config::ArenaConfig;
use metadata_runtime::metadata::perform_basic_layout;
use metadata_runtime::{MetadataRef, MetadataRequest, MetadataRuntime, TypeKey, TypeLayout};
use proptest::prelude::*;

/// Strategy for generating builtin metadata
fn builtin() -> impl Strategy<Value = MetadataRef> {
    prop_oneof![
        Just(builtins::int8()),
        Just(builtins::int16()),
        Just(builtins::int32()),
        Just(builtins::int64()),
        Just(builtins::double()),
        Just(builtins::bool()),
        Just(builtins::native_object()),
    ]
}

/// Strategy for generating field layouts with power-of-two alignment
fn field_layout() -> impl Strategy<Value = TypeLayout> {
    (0usize..64, 0u32..5, any::<bool>())
        .prop_map(|(size, align_log2, is_pod)| TypeLayout::new(size, 1 << align_log2, is_pod))
}

/// Strategy for generating allocation requests (size, align)
fn allocation() -> impl Strategy<Value = (usize, usize)> {
    (1usize..3000, 0u32..7).prop_map(|(size, align_log2)| (size, 1 << align_log2))
}

proptest! {
    /// Basic layout: fields are aligned, in order and non-overlapping
    #[test]
    fn basic_layout_fields_are_ordered_and_aligned(
        fields in prop::collection::vec(field_layout(), 0..16),
    ) {
        let basic = perform_basic_layout(&fields);
        prop_assert_eq!(basic.offsets.len(), fields.len());

        let mut end = 0;
        for (field, &offset) in fields.iter().zip(&basic.offsets) {
            prop_assert_eq!(offset % field.align, 0);
            prop_assert!(offset >= end);
            end = offset + field.size;
        }
        prop_assert_eq!(basic.layout.size, end);
    }

    /// Basic layout: alignment is the maximum, stride covers size
    #[test]
    fn basic_layout_aggregate_properties(fields in prop::collection::vec(field_layout(), 0..16)) {
        let basic = perform_basic_layout(&fields);
        let max_align = fields.iter().map(|f| f.align).max().unwrap_or(1);
        prop_assert_eq!(basic.layout.align, max_align);
        prop_assert!(basic.layout.stride >= basic.layout.size.max(1));
        if basic.layout.size > 0 {
            prop_assert_eq!(basic.layout.stride % basic.layout.align, 0);
        }
        prop_assert_eq!(basic.layout.is_pod, fields.iter().all(|f| f.is_pod));
    }

    /// Arena: blocks are aligned and never overlap
    #[test]
    fn arena_blocks_are_disjoint(requests in prop::collection::vec(allocation(), 1..200)) {
        let arena = MetadataArena::new(&ArenaConfig {
            page_size: 4096,
            max_pool_allocation: 2048,
        });

        let mut blocks: Vec<(usize, usize)> = requests
            .iter()
            .map(|&(size, align)| {
                let ptr = arena.allocate(size, align);
                (ptr.addr().get(), size)
            })
            .collect();

        for (&(addr, _), &(_, align)) in blocks.iter().zip(&requests) {
            prop_assert_eq!(addr % align, 0);
        }

        blocks.sort_unstable();
        for pair in blocks.windows(2) {
            prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
        prop_assert_eq!(arena.stats().total_allocations(), requests.len() as u64);
    }

    /// TypeKey ordering agrees with (template, arguments) ordering
    #[test]
    fn type_key_ordering_is_lexicographic(
        t1 in 0usize..4,
        a1 in prop::collection::vec(builtin(), 0..4),
        t2 in 0usize..4,
        a2 in prop::collection::vec(builtin(), 0..4),
    ) {
        let k1 = TypeKey::new(t1, &a1);
        let k2 = TypeKey::new(t2, &a2);
        prop_assert_eq!(k1.cmp(&k2), (t1, &a1).cmp(&(t2, &a2)));
        prop_assert_eq!(k1 == k2, t1 == t2 && a1 == a2);
    }

    /// Tuples: identical element lists yield identical records
    #[test]
    fn tuple_identity_follows_elements(
        a in prop::collection::vec(builtin(), 1..5),
        b in prop::collection::vec(builtin(), 1..5),
    ) {
        let rt = MetadataRuntime::default();
        let ta = rt.get_tuple_metadata(MetadataRequest::complete(), &a);
        let tb = rt.get_tuple_metadata(MetadataRequest::complete(), &b);

        prop_assert!(ta.is_complete());
        prop_assert_eq!(ta.metadata == tb.metadata, a == b);
        prop_assert_eq!(ta.metadata.generic_arguments(), a.as_slice());
    }
}
