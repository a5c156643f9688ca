//! Type Metadata Records
//!
//! A metadata record is a fixed header followed by two trailing arrays:
//!
//! ```text
//! ┌──────────────────────┐
//! │ Metadata header      │  kind, name, descriptor, superclass, layout
//! ├──────────────────────┤
//! │ [MetadataRef; args]  │  generic arguments (tuple elements for tuples)
//! ├──────────────────────┤
//! │ [AtomicUsize; extra] │  field offsets, then the descriptor's extra-data pattern
//! └──────────────────────┘
//! ```
//!
//! Instantiated records live in the [`MetadataArena`] and are never freed.
//! Builtin and foreign records are ordinary statics with no trailing data.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::arena::MetadataArena;
use crate::error::RuntimeError;
use crate::runtime::MetadataRuntime;
use crate::state::{CompletionContext, MetadataDependency, MetadataRequest, MetadataResponse};

const WORD: usize = size_of::<usize>();

const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Structural category of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MetadataKind {
    /// Value type with stored fields.
    Struct,
    /// Value type with cases.
    Enum,
    /// Reference type, possibly with a superclass.
    Class,
    /// Structural product of element types.
    Tuple,
    /// Type whose canonical definition lives in another module.
    Foreign,
    /// Scalar provided by the runtime.
    Builtin,
}

/// Where a metadata record came from. Decides which cache tracks its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MetadataSource {
    /// A static record. Always complete.
    Static,
    /// Instantiated by the generic metadata cache.
    Generic,
    /// Instantiated by the tuple cache.
    Tuple,
}

// ============================================================================
// Layout
// ============================================================================

/// Size, alignment, stride and POD-ness of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeLayout {
    /// Size in bytes.
    pub size: usize,
    /// Alignment in bytes (power of two).
    pub align: usize,
    /// Distance between array elements.
    pub stride: usize,
    /// Plain data: copyable bit-for-bit with no ownership semantics.
    pub is_pod: bool,
}

impl TypeLayout {
    /// Layout of a type with no storage.
    pub const EMPTY: TypeLayout = TypeLayout::new(0, 1, true);

    /// Layout of a strong object reference.
    pub const REFERENCE: TypeLayout = TypeLayout::new(WORD, WORD, false);

    /// A layout with stride derived from size and alignment.
    pub const fn new(size: usize, align: usize, is_pod: bool) -> Self {
        let stride = round_up(size, align);
        Self {
            size,
            align,
            stride: if stride == 0 { 1 } else { stride },
            is_pod,
        }
    }

    /// A naturally aligned POD scalar.
    pub const fn scalar(size: usize) -> Self {
        Self::new(size, size, true)
    }
}

/// Layout storage published once, readable without locks.
///
/// `align == 0` means no layout yet; it is written last with release ordering.
struct LayoutCell {
    size: AtomicUsize,
    align: AtomicUsize,
    stride: AtomicUsize,
    is_pod: AtomicBool,
}

impl LayoutCell {
    const fn new(layout: Option<TypeLayout>) -> Self {
        match layout {
            Some(layout) => Self {
                size: AtomicUsize::new(layout.size),
                align: AtomicUsize::new(layout.align),
                stride: AtomicUsize::new(layout.stride),
                is_pod: AtomicBool::new(layout.is_pod),
            },
            None => Self {
                size: AtomicUsize::new(0),
                align: AtomicUsize::new(0),
                stride: AtomicUsize::new(0),
                is_pod: AtomicBool::new(false),
            },
        }
    }

    fn load(&self) -> Option<TypeLayout> {
        let align = self.align.load(Ordering::Acquire);
        if align == 0 {
            return None;
        }
        Some(TypeLayout {
            size: self.size.load(Ordering::Relaxed),
            align,
            stride: self.stride.load(Ordering::Relaxed),
            is_pod: self.is_pod.load(Ordering::Relaxed),
        })
    }

    fn store(&self, layout: TypeLayout) {
        self.size.store(layout.size, Ordering::Relaxed);
        self.stride.store(layout.stride, Ordering::Relaxed);
        self.is_pod.store(layout.is_pod, Ordering::Relaxed);
        self.align.store(layout.align.max(1), Ordering::Release);
    }
}

/// Result of [`perform_basic_layout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicLayout {
    /// Aggregate layout.
    pub layout: TypeLayout,
    /// Offset of each field, in input order.
    pub offsets: Vec<usize>,
}

/// Lay fields out sequentially, each at the next offset aligned for it.
pub fn perform_basic_layout(fields: &[TypeLayout]) -> BasicLayout {
    let mut size = 0;
    let mut align = 1;
    let mut is_pod = true;
    let mut offsets = Vec::with_capacity(fields.len());

    for field in fields {
        let field_align = field.align.max(1);
        size = round_up(size, field_align);
        offsets.push(size);
        size += field.size;
        align = align.max(field_align);
        is_pod &= field.is_pod;
    }

    BasicLayout {
        layout: TypeLayout::new(size, align, is_pod),
        offsets,
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Runs once, right after a record is allocated and before anyone sees it.
pub type InstantiateFn = fn(&MetadataInit);

/// One completion step. Returns the dependency that stopped it, if any.
pub type CompletionFn =
    fn(&MetadataRuntime, MetadataRef, &mut CompletionContext) -> Option<MetadataDependency>;

/// Produces the metadata of a field whose type is built from generic arguments.
pub type FieldTypeAccessor =
    fn(&MetadataRuntime, MetadataRequest, &[MetadataRef]) -> MetadataResponse;

/// How a generic type is turned into concrete metadata.
#[derive(Debug, Clone, Copy)]
pub struct InstantiationPattern {
    /// Called once on the fresh record.
    pub instantiate: Option<InstantiateFn>,
    /// Drives the record towards `NonTransitiveComplete`.
    pub complete: Option<CompletionFn>,
    /// Layout known without completion, published at allocation.
    pub layout: Option<TypeLayout>,
    /// Words copied into every instance's extra data after the field offsets.
    pub extra_data: &'static [usize],
}

impl InstantiationPattern {
    /// No callbacks, no layout, no extra data.
    pub const EMPTY: InstantiationPattern = InstantiationPattern {
        instantiate: None,
        complete: None,
        layout: None,
        extra_data: &[],
    };
}

/// The type of a stored field.
#[derive(Debug, Clone, Copy)]
pub enum FieldType {
    /// The n-th generic argument.
    Argument(usize),
    /// A fixed type.
    Static(&'static Metadata),
    /// A type computed from the generic arguments.
    Resolved(FieldTypeAccessor),
}

impl FieldType {
    /// Look up the field's metadata for a record of the owning type.
    pub fn resolve(
        &self,
        rt: &MetadataRuntime,
        request: MetadataRequest,
        owner: MetadataRef,
    ) -> MetadataResponse {
        let arguments = owner.generic_arguments();
        match *self {
            FieldType::Argument(index) => match arguments.get(index) {
                Some(&argument) => rt.check_metadata_state(request, argument),
                None => rt.fatal(RuntimeError::ArgumentCountMismatch {
                    descriptor: owner.name(),
                    expected: index + 1,
                    actual: arguments.len(),
                }),
            },
            FieldType::Static(metadata) => {
                rt.check_metadata_state(request, MetadataRef::from_static(metadata))
            }
            FieldType::Resolved(accessor) => accessor(rt, request, arguments),
        }
    }
}

/// A stored field.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    /// Field name.
    pub name: &'static str,
    /// Field type.
    pub ty: FieldType,
}

/// Compile-time description of a (possibly generic) nominal type.
#[derive(Debug)]
pub struct TypeDescriptor {
    /// Type name without arguments.
    pub name: &'static str,
    /// Kind of instances.
    pub kind: MetadataKind,
    /// Number of generic parameters.
    pub generic_params: usize,
    /// Stored fields, in declaration order.
    pub fields: &'static [FieldDescriptor],
    /// Instantiation callbacks and data.
    pub pattern: InstantiationPattern,
}

impl TypeDescriptor {
    /// A descriptor with no fields and an empty pattern.
    pub const fn new(name: &'static str, kind: MetadataKind, generic_params: usize) -> Self {
        Self {
            name,
            kind,
            generic_params,
            fields: &[],
            pattern: InstantiationPattern::EMPTY,
        }
    }

    /// Set the stored fields.
    pub const fn with_fields(mut self, fields: &'static [FieldDescriptor]) -> Self {
        self.fields = fields;
        self
    }

    /// Set the instantiation pattern.
    pub const fn with_pattern(mut self, pattern: InstantiationPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Words of extra data each instance carries.
    pub fn extra_data_words(&self) -> usize {
        self.fields.len() + self.pattern.extra_data.len()
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Header of a metadata record.
#[repr(C)]
pub struct Metadata {
    kind: MetadataKind,
    source: MetadataSource,
    name: &'static str,
    description: Option<&'static TypeDescriptor>,
    superclass: AtomicPtr<Metadata>,
    layout: LayoutCell,
    num_arguments: usize,
    num_field_offsets: usize,
    num_extra_words: usize,
}

impl Metadata {
    /// A static scalar record.
    pub const fn builtin(name: &'static str, layout: TypeLayout) -> Self {
        Self::fixed(MetadataKind::Builtin, name, Some(layout))
    }

    /// A static record for a foreign type. Its layout may be published later.
    pub const fn foreign(name: &'static str, layout: Option<TypeLayout>) -> Self {
        Self::fixed(MetadataKind::Foreign, name, layout)
    }

    /// The empty tuple, which is never cached.
    pub const fn empty_tuple() -> Self {
        Self::fixed(MetadataKind::Tuple, "()", Some(TypeLayout::EMPTY))
    }

    const fn fixed(kind: MetadataKind, name: &'static str, layout: Option<TypeLayout>) -> Self {
        Self {
            kind,
            source: MetadataSource::Static,
            name,
            description: None,
            superclass: AtomicPtr::new(ptr::null_mut()),
            layout: LayoutCell::new(layout),
            num_arguments: 0,
            num_field_offsets: 0,
            num_extra_words: 0,
        }
    }

    /// Kind of the type.
    pub fn kind(&self) -> MetadataKind {
        self.kind
    }

    /// Which cache owns this record.
    pub fn source(&self) -> MetadataSource {
        self.source
    }

    /// Base name, without generic arguments.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Descriptor the record was instantiated from.
    pub fn description(&self) -> Option<&'static TypeDescriptor> {
        self.description
    }

    /// Superclass of a class instance.
    pub fn superclass(&self) -> Option<MetadataRef> {
        NonNull::new(self.superclass.load(Ordering::Acquire)).map(MetadataRef)
    }

    /// Layout, once published.
    pub fn layout(&self) -> Option<TypeLayout> {
        self.layout.load()
    }

    /// Whether a layout has been published.
    pub fn has_layout(&self) -> bool {
        self.layout().is_some()
    }

    /// Publish the layout. Readers see all fields once they see any.
    pub fn publish_layout(&self, layout: TypeLayout) {
        self.layout.store(layout);
    }

    /// Number of generic arguments.
    pub fn num_generic_arguments(&self) -> usize {
        self.num_arguments
    }

    fn set_superclass(&self, superclass: MetadataRef) {
        self.superclass
            .store(superclass.0.as_ptr(), Ordering::Release);
    }

    /// Allocate and fill an instance of `descriptor`, then run its
    /// instantiation callback.
    pub(crate) fn instantiate(
        arena: &MetadataArena,
        descriptor: &'static TypeDescriptor,
        arguments: &[MetadataRef],
    ) -> MetadataRef {
        let header = Metadata {
            kind: descriptor.kind,
            source: MetadataSource::Generic,
            name: descriptor.name,
            description: Some(descriptor),
            superclass: AtomicPtr::new(ptr::null_mut()),
            layout: LayoutCell::new(descriptor.pattern.layout),
            num_arguments: arguments.len(),
            num_field_offsets: descriptor.fields.len(),
            num_extra_words: descriptor.extra_data_words(),
        };
        let metadata =
            Self::allocate_record(arena, header, arguments, descriptor.pattern.extra_data);

        if let Some(instantiate) = descriptor.pattern.instantiate {
            instantiate(&MetadataInit {
                metadata,
                descriptor,
            });
        }
        metadata
    }

    /// Allocate a tuple record. Element offsets occupy the extra data.
    pub(crate) fn tuple(arena: &MetadataArena, elements: &[MetadataRef]) -> MetadataRef {
        let header = Metadata {
            kind: MetadataKind::Tuple,
            source: MetadataSource::Tuple,
            name: "",
            description: None,
            superclass: AtomicPtr::new(ptr::null_mut()),
            layout: LayoutCell::new(None),
            num_arguments: elements.len(),
            num_field_offsets: elements.len(),
            num_extra_words: elements.len(),
        };
        Self::allocate_record(arena, header, elements, &[])
    }

    fn allocate_record(
        arena: &MetadataArena,
        header: Metadata,
        arguments: &[MetadataRef],
        pattern: &[usize],
    ) -> MetadataRef {
        debug_assert_eq!(header.num_arguments, arguments.len());
        debug_assert_eq!(header.num_extra_words, header.num_field_offsets + pattern.len());

        let size = size_of::<Metadata>()
            + arguments.len() * size_of::<MetadataRef>()
            + header.num_extra_words * size_of::<AtomicUsize>();
        let raw = arena.allocate(size, align_of::<Metadata>()).cast::<Metadata>();
        let num_field_offsets = header.num_field_offsets;

        // SAFETY: the block is large enough for the header and both trailing
        // arrays, every part is suitably aligned, and nothing else can see it
        // until it is returned.
        unsafe {
            raw.as_ptr().write(header);
            let args = raw.as_ptr().add(1).cast::<MetadataRef>();
            ptr::copy_nonoverlapping(arguments.as_ptr(), args, arguments.len());

            let extra = args.add(arguments.len()).cast::<AtomicUsize>();
            for i in 0..num_field_offsets {
                extra.add(i).write(AtomicUsize::new(0));
            }
            for (i, &word) in pattern.iter().enumerate() {
                extra.add(num_field_offsets + i).write(AtomicUsize::new(word));
            }
        }
        MetadataRef(raw)
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("name", &self.name)
            .field("num_arguments", &self.num_arguments)
            .field("layout", &self.layout())
            .finish()
    }
}

/// Access to a record during its instantiation callback.
pub struct MetadataInit {
    metadata: MetadataRef,
    descriptor: &'static TypeDescriptor,
}

impl MetadataInit {
    /// The record being instantiated.
    pub fn metadata(&self) -> MetadataRef {
        self.metadata
    }

    /// Its descriptor.
    pub fn descriptor(&self) -> &'static TypeDescriptor {
        self.descriptor
    }

    /// Its generic arguments.
    pub fn arguments(&self) -> &'static [MetadataRef] {
        self.metadata.generic_arguments()
    }

    /// Record the superclass of a class instance.
    pub fn set_superclass(&self, superclass: MetadataRef) {
        self.metadata.set_superclass(superclass);
    }

    /// Publish a layout that needs no completion step.
    pub fn publish_layout(&self, layout: TypeLayout) {
        self.metadata.publish_layout(layout);
    }

    /// Extra data copied from the pattern.
    pub fn pattern_data(&self) -> &'static [AtomicUsize] {
        self.metadata.pattern_data()
    }
}

// ============================================================================
// MetadataRef
// ============================================================================

/// Pointer to an immortal metadata record, compared by address.
#[derive(Clone, Copy)]
pub struct MetadataRef(NonNull<Metadata>);

// Thread-safe: records are immutable after publication apart from atomics.
unsafe impl Send for MetadataRef {}
unsafe impl Sync for MetadataRef {}

impl MetadataRef {
    /// Refer to a static record.
    pub const fn from_static(metadata: &'static Metadata) -> Self {
        // SAFETY: references are never null.
        Self(unsafe { NonNull::new_unchecked(metadata as *const Metadata as *mut Metadata) })
    }

    /// Refer to a record by raw pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a fully initialized record that is never freed,
    /// including its trailing arrays.
    pub unsafe fn from_raw(ptr: NonNull<Metadata>) -> Self {
        Self(ptr)
    }

    /// Raw pointer to the header.
    pub fn as_ptr(self) -> *const Metadata {
        self.0.as_ptr()
    }

    /// Address of the header.
    pub fn addr(self) -> usize {
        self.0.addr().get()
    }

    /// The header, for the rest of the process.
    pub fn get(self) -> &'static Metadata {
        // SAFETY: records are immortal.
        unsafe { self.0.as_ref() }
    }

    /// Generic arguments, or tuple elements.
    pub fn generic_arguments(self) -> &'static [MetadataRef] {
        let count = self.get().num_arguments;
        // SAFETY: the record was allocated with `count` trailing arguments, and
        // a pointer one past a header is aligned for MetadataRef.
        unsafe { slice::from_raw_parts(self.0.as_ptr().add(1).cast::<MetadataRef>(), count) }
    }

    /// All extra-data words.
    pub fn extra_data(self) -> &'static [AtomicUsize] {
        let header = self.get();
        // SAFETY: extra words directly follow the arguments.
        unsafe {
            let start = self
                .0
                .as_ptr()
                .add(1)
                .cast::<MetadataRef>()
                .add(header.num_arguments)
                .cast::<AtomicUsize>();
            slice::from_raw_parts(start, header.num_extra_words)
        }
    }

    /// Field offset words. Meaningful once the record is `LayoutComplete`.
    pub fn field_offsets(self) -> &'static [AtomicUsize] {
        &self.extra_data()[..self.get().num_field_offsets]
    }

    /// Offset of field `index`, once laid out.
    pub fn field_offset(self, index: usize) -> Option<usize> {
        self.field_offsets()
            .get(index)
            .map(|word| word.load(Ordering::Acquire))
    }

    /// Extra data copied from the instantiation pattern.
    pub fn pattern_data(self) -> &'static [AtomicUsize] {
        &self.extra_data()[self.get().num_field_offsets..]
    }
}

impl Deref for MetadataRef {
    type Target = Metadata;

    fn deref(&self) -> &Metadata {
        self.get()
    }
}

impl PartialEq for MetadataRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for MetadataRef {}

impl PartialOrd for MetadataRef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MetadataRef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.addr().cmp(&other.addr())
    }
}

impl Hash for MetadataRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for MetadataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MetadataRef({} @ {:p})", self, self.0)
    }
}

impl fmt::Display for MetadataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arguments = self.generic_arguments();
        if self.kind() == MetadataKind::Tuple {
            f.write_str("(")?;
            write_list(f, arguments)?;
            return f.write_str(")");
        }

        f.write_str(self.name())?;
        if !arguments.is_empty() {
            f.write_str("<")?;
            write_list(f, arguments)?;
            f.write_str(">")?;
        }
        Ok(())
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[MetadataRef]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins;

    #[test]
    fn test_basic_layout() {
        let basic = perform_basic_layout(&[
            TypeLayout::scalar(1),
            TypeLayout::scalar(4),
            TypeLayout::scalar(2),
        ]);
        assert_eq!(basic.offsets, vec![0, 4, 8]);
        assert_eq!(basic.layout.size, 10);
        assert_eq!(basic.layout.align, 4);
        assert_eq!(basic.layout.stride, 12);
        assert!(basic.layout.is_pod);
    }

    #[test]
    fn test_basic_layout_empty_and_non_pod() {
        let empty = perform_basic_layout(&[]);
        assert_eq!(empty.layout, TypeLayout::EMPTY);
        assert_eq!(empty.layout.stride, 1);

        let mixed = perform_basic_layout(&[TypeLayout::scalar(1), TypeLayout::REFERENCE]);
        assert_eq!(mixed.offsets, vec![0, WORD]);
        assert!(!mixed.layout.is_pod);
    }

    #[test]
    fn test_instantiate_record_layout() {
        static FIELDS: [FieldDescriptor; 2] = [
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
            .with_fields(&FIELDS)
            .with_pattern(InstantiationPattern {
                extra_data: &[7, 9],
                ..InstantiationPattern::EMPTY
            });

        let arena = MetadataArena::default();
        let args = [builtins::int8(), builtins::int64()];
        let metadata = Metadata::instantiate(&arena, &PAIR, &args);

        assert_eq!(metadata.source(), MetadataSource::Generic);
        assert_eq!(metadata.generic_arguments(), &args);
        assert_eq!(metadata.field_offsets().len(), 2);
        let pattern: Vec<usize> = metadata
            .pattern_data()
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect();
        assert_eq!(pattern, vec![7, 9]);
        assert!(metadata.layout().is_none());
        assert_eq!(metadata.to_string(), "Pair<Int8, Int64>");
    }

    #[test]
    fn test_instantiate_callback_sets_superclass() {
        fn inherit_from_argument(init: &MetadataInit) {
            init.set_superclass(init.arguments()[0]);
            init.publish_layout(TypeLayout::REFERENCE);
        }

        static BASE: TypeDescriptor = TypeDescriptor::new("Base", MetadataKind::Class, 0);
        static DERIVED: TypeDescriptor = TypeDescriptor::new("Derived", MetadataKind::Class, 1)
            .with_pattern(InstantiationPattern {
                instantiate: Some(inherit_from_argument),
                ..InstantiationPattern::EMPTY
            });

        let arena = MetadataArena::default();
        let base = Metadata::instantiate(&arena, &BASE, &[]);
        let derived = Metadata::instantiate(&arena, &DERIVED, &[base]);

        assert_eq!(derived.superclass(), Some(base));
        assert_eq!(derived.layout(), Some(TypeLayout::REFERENCE));
        assert_eq!(base.superclass(), None);
    }

    #[test]
    fn test_tuple_names() {
        let arena = MetadataArena::default();
        let tuple = Metadata::tuple(&arena, &[builtins::int32(), builtins::bool()]);
        assert_eq!(tuple.to_string(), "(Int32, Bool)");
        assert_eq!(builtins::empty_tuple().to_string(), "()");
    }

    #[test]
    fn test_metadata_ref_identity() {
        let a = builtins::int32();
        let b = builtins::int32();
        assert_eq!(a, b);
        assert_ne!(a, builtins::int64());
        assert_eq!(a.addr(), b.addr());
    }
}
