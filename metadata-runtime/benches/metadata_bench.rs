//! Metadata runtime benchmarks using criterion.
//!
//! Run with: cargo bench --bench metadata_bench

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use metadata_runtime::arena::MetadataArena;
use metadata_runtime::builtins;
use metadata_runtime::{
    FieldDescriptor, FieldType, ForeignTypeMetadata, GenericWitnessTable, InstantiationPattern,
    MetadataKind, MetadataRequest, MetadataRuntime, MetadataState, ProtocolDescriptor,
    ProtocolRequirement, RequirementKind, TypeDescriptor, TypeLayout, WitnessEntry, WitnessTable,
    initialize_struct_layout,
};
use std::sync::Arc;
use std::thread;

static PAIR_FIELDS: [FieldDescriptor; 2] = [
    FieldDescriptor {
        name: "first",
        ty: FieldType::Argument(0),
    },
    FieldDescriptor {
        name: "second",
        ty: FieldType::Argument(1),
    },
];

static PAIR: TypeDescriptor = TypeDescriptor::new("Pair", MetadataKind::Struct, 2)
    .with_fields(&PAIR_FIELDS)
    .with_pattern(InstantiationPattern {
        complete: Some(initialize_struct_layout),
        ..InstantiationPattern::EMPTY
    });

fn bench_arena(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena");
    group.throughput(Throughput::Elements(1));

    for size in [16usize, 64, 256] {
        group.bench_with_input(BenchmarkId::new("allocate", size), &size, |b, &size| {
            let arena = MetadataArena::default();
            b.iter(|| black_box(arena.allocate(size, 8)));
        });
    }

    group.bench_function("allocate_then_reclaim", |b| {
        let arena = MetadataArena::default();
        b.iter(|| {
            let block = arena.allocate(64, 8);
            // SAFETY: the block is the most recent allocation and is not used again.
            unsafe { arena.deallocate(black_box(block), 64) };
        });
    });

    group.finish();
}

fn bench_metadata_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("metadata_cache");

    group.bench_function("hit", |b| {
        let rt = MetadataRuntime::default();
        let args = [builtins::int32(), builtins::double()];
        rt.get_or_create_type_metadata(MetadataRequest::complete(), &PAIR, &args);
        b.iter(|| {
            black_box(rt.get_or_create_type_metadata(
                MetadataRequest::complete(),
                &PAIR,
                black_box(&args),
            ))
        });
    });

    group.bench_function("poll_non_blocking", |b| {
        let rt = MetadataRuntime::default();
        let pair = rt
            .get_or_create_type_metadata(
                MetadataRequest::complete(),
                &PAIR,
                &[builtins::int8(), builtins::int64()],
            )
            .metadata;
        let request = MetadataRequest::non_blocking(MetadataState::Complete);
        b.iter(|| black_box(rt.check_metadata_state(request, pair)));
    });

    group.bench_function("tuple_hit", |b| {
        let rt = MetadataRuntime::default();
        let elements = [builtins::int8(), builtins::int32(), builtins::bool()];
        rt.get_tuple_metadata(MetadataRequest::complete(), &elements);
        b.iter(|| black_box(rt.get_tuple_metadata(MetadataRequest::complete(), &elements)));
    });

    for threads in [2usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("contended_hit", threads),
            &threads,
            |b, &threads| {
                let rt = Arc::new(MetadataRuntime::default());
                let args = [builtins::int16(), builtins::float()];
                rt.get_or_create_type_metadata(MetadataRequest::complete(), &PAIR, &args);
                b.iter(|| {
                    let handles: Vec<_> = (0..threads)
                        .map(|_| {
                            let rt = Arc::clone(&rt);
                            thread::spawn(move || {
                                for _ in 0..1000 {
                                    black_box(rt.get_or_create_type_metadata(
                                        MetadataRequest::complete(),
                                        &PAIR,
                                        &args,
                                    ));
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

static EQUATABLE_REQUIREMENTS: [ProtocolRequirement; 1] = [ProtocolRequirement {
    name: "==",
    kind: RequirementKind::Method,
    default_implementation: None,
}];

static EQUATABLE: ProtocolDescriptor = ProtocolDescriptor {
    name: "Equatable",
    requirements: &EQUATABLE_REQUIREMENTS,
};

fn always_equal(_ty: metadata_runtime::MetadataRef) -> usize {
    1
}

static EQUATABLE_PATTERN: [WitnessEntry; 1] = [WitnessEntry::Function(always_equal)];

static EQUATABLE_TRIVIAL: GenericWitnessTable =
    GenericWitnessTable::new(WitnessTable::new(&EQUATABLE, &EQUATABLE_PATTERN));

static EQUATABLE_PRIVATE: GenericWitnessTable =
    GenericWitnessTable::new(WitnessTable::new(&EQUATABLE, &EQUATABLE_PATTERN))
        .with_private_words(1);

static NS_OBJECT: ForeignTypeMetadata =
    ForeignTypeMetadata::new("NSObject", Some(TypeLayout::REFERENCE), None);

fn bench_witness_and_foreign(c: &mut Criterion) {
    let mut group = c.benchmark_group("witness_and_foreign");
    let rt = MetadataRuntime::default();

    group.bench_function("witness_trivial", |b| {
        b.iter(|| {
            black_box(rt.get_or_create_witness_table(
                &EQUATABLE_TRIVIAL,
                builtins::int32(),
                &[],
            ))
        });
    });

    group.bench_function("witness_cached", |b| {
        rt.get_or_create_witness_table(&EQUATABLE_PRIVATE, builtins::int32(), &[]);
        b.iter(|| {
            black_box(rt.get_or_create_witness_table(
                &EQUATABLE_PRIVATE,
                builtins::int32(),
                &[],
            ))
        });
    });

    group.bench_function("foreign_cached_unique", |b| {
        rt.unique_foreign_type(&NS_OBJECT);
        b.iter(|| black_box(rt.unique_foreign_type(&NS_OBJECT)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_arena,
    bench_metadata_cache,
    bench_witness_and_foreign,
);
criterion_main!(benches);
