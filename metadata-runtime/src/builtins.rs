//! Builtin metadata.
//!
//! Scalars and the empty tuple are static records: they need no
//! instantiation, are never cached and are always `Complete`. The statics can
//! be named directly in field descriptors.

use crate::metadata::{Metadata, MetadataRef, TypeLayout};

/// `Int8`.
pub static INT8: Metadata = Metadata::builtin("Int8", TypeLayout::scalar(1));
/// `Int16`.
pub static INT16: Metadata = Metadata::builtin("Int16", TypeLayout::scalar(2));
/// `Int32`.
pub static INT32: Metadata = Metadata::builtin("Int32", TypeLayout::scalar(4));
/// `Int64`.
pub static INT64: Metadata = Metadata::builtin("Int64", TypeLayout::scalar(8));
/// `Float`.
pub static FLOAT: Metadata = Metadata::builtin("Float", TypeLayout::scalar(4));
/// `Double`.
pub static DOUBLE: Metadata = Metadata::builtin("Double", TypeLayout::scalar(8));
/// `Bool`.
pub static BOOL: Metadata = Metadata::builtin("Bool", TypeLayout::scalar(1));
/// An untyped machine pointer.
pub static RAW_POINTER: Metadata =
    Metadata::builtin("RawPointer", TypeLayout::scalar(size_of::<usize>()));
/// A strong reference to an object of unknown class.
pub static NATIVE_OBJECT: Metadata = Metadata::builtin("NativeObject", TypeLayout::REFERENCE);
/// `()`.
pub static EMPTY_TUPLE: Metadata = Metadata::empty_tuple();

/// `Int8`.
pub fn int8() -> MetadataRef {
    MetadataRef::from_static(&INT8)
}

/// `Int16`.
pub fn int16() -> MetadataRef {
    MetadataRef::from_static(&INT16)
}

/// `Int32`.
pub fn int32() -> MetadataRef {
    MetadataRef::from_static(&INT32)
}

/// `Int64`.
pub fn int64() -> MetadataRef {
    MetadataRef::from_static(&INT64)
}

/// `Float`.
pub fn float() -> MetadataRef {
    MetadataRef::from_static(&FLOAT)
}

/// `Double`.
pub fn double() -> MetadataRef {
    MetadataRef::from_static(&DOUBLE)
}

/// `Bool`.
pub fn bool() -> MetadataRef {
    MetadataRef::from_static(&BOOL)
}

/// An untyped machine pointer.
pub fn raw_pointer() -> MetadataRef {
    MetadataRef::from_static(&RAW_POINTER)
}

/// A strong reference to an object of unknown class.
pub fn native_object() -> MetadataRef {
    MetadataRef::from_static(&NATIVE_OBJECT)
}

/// `()`.
pub fn empty_tuple() -> MetadataRef {
    MetadataRef::from_static(&EMPTY_TUPLE)
}
