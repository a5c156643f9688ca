//! Witness Tables
//!
//! A witness table lists, for one conforming type, the implementation of every
//! requirement of a protocol. Conformances are described by a
//! [`GenericWitnessTable`] template:
//!
//! - a static prefix of witnesses, the pattern;
//! - resilient witnesses, keyed by requirement identity, for requirements
//!   added after the conformance was compiled;
//! - optional private storage words and an instantiation callback.
//!
//! A template with nothing to instantiate is its own table. Everything else is
//! built once per conforming type into the arena:
//!
//! ```text
//! ┌──────────────────────────┐
//! │ WitnessTable header      │
//! ├──────────────────────────┤
//! │ [AtomicUsize; private]   │  zero-initialized
//! ├──────────────────────────┤
//! │ [WitnessEntry; reqs]     │
//! └──────────────────────────┘
//! ```

use std::fmt;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, OnceLock};

use hashbrown::HashMap;
use parking_lot::RwLock;
use rustc_hash::FxBuildHasher;

use crate::error::RuntimeError;
use crate::metadata::MetadataRef;
use crate::runtime::MetadataRuntime;
use crate::stats::RuntimeCounters;

/// Uniform signature of function witnesses: receives the conforming type.
pub type WitnessFunction = fn(MetadataRef) -> usize;

/// Fills in type-dependent witnesses after the generic ones are in place.
pub type WitnessInstantiator = fn(&mut WitnessTableInit<'_>, MetadataRef, &[WitnessTableRef]);

// ============================================================================
// Protocols
// ============================================================================

/// What a protocol requirement is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequirementKind {
    /// Conformance to an inherited protocol.
    BaseProtocol,
    /// A method.
    Method,
    /// An initializer.
    Init,
    /// A property getter.
    Getter,
    /// A property setter.
    Setter,
    /// A read coroutine.
    ReadCoroutine,
    /// A modify coroutine.
    ModifyCoroutine,
    /// Metadata of an associated type.
    AssociatedTypeAccessFunction,
    /// Conformance of an associated type.
    AssociatedConformanceAccessFunction,
}

impl RequirementKind {
    /// Whether resilient witnesses and default implementations apply.
    pub fn is_function_like(self) -> bool {
        matches!(
            self,
            RequirementKind::Method
                | RequirementKind::Init
                | RequirementKind::Getter
                | RequirementKind::Setter
                | RequirementKind::ReadCoroutine
                | RequirementKind::ModifyCoroutine
        )
    }
}

/// One requirement of a protocol. Compared by address.
#[derive(Debug)]
pub struct ProtocolRequirement {
    /// Requirement name.
    pub name: &'static str,
    /// Requirement kind.
    pub kind: RequirementKind,
    /// Used when a conformance provides no witness.
    pub default_implementation: Option<WitnessFunction>,
}

/// A protocol: an ordered list of requirements.
#[derive(Debug)]
pub struct ProtocolDescriptor {
    /// Protocol name.
    pub name: &'static str,
    /// Requirements in table order.
    pub requirements: &'static [ProtocolRequirement],
}

// ============================================================================
// Tables
// ============================================================================

/// One slot of a witness table.
#[derive(Debug, Clone, Copy)]
pub enum WitnessEntry {
    /// Table for an inherited protocol.
    Base(WitnessTableRef),
    /// Implementation of a function-like requirement.
    Function(WitnessFunction),
    /// Metadata of an associated type.
    AssociatedType(MetadataRef),
    /// Conformance of an associated type.
    AssociatedConformance(WitnessTableRef),
}

impl WitnessEntry {
    /// The function, for function witnesses.
    pub fn as_function(&self) -> Option<WitnessFunction> {
        match *self {
            WitnessEntry::Function(function) => Some(function),
            _ => None,
        }
    }

    /// The metadata, for associated type witnesses.
    pub fn as_associated_type(&self) -> Option<MetadataRef> {
        match *self {
            WitnessEntry::AssociatedType(metadata) => Some(metadata),
            _ => None,
        }
    }
}

/// A witness table header.
#[repr(C)]
#[derive(Debug)]
pub struct WitnessTable {
    protocol: &'static ProtocolDescriptor,
    conforming_type: Option<MetadataRef>,
    witnesses: &'static [WitnessEntry],
    private: &'static [AtomicUsize],
}

impl WitnessTable {
    /// A static table with no private storage.
    pub const fn new(
        protocol: &'static ProtocolDescriptor,
        witnesses: &'static [WitnessEntry],
    ) -> Self {
        Self {
            protocol,
            conforming_type: None,
            witnesses,
            private: &[],
        }
    }

    /// The protocol.
    pub fn protocol(&self) -> &'static ProtocolDescriptor {
        self.protocol
    }

    /// Type the table was instantiated for. `None` for static tables.
    pub fn conforming_type(&self) -> Option<MetadataRef> {
        self.conforming_type
    }

    /// Witnesses in requirement order.
    pub fn witnesses(&self) -> &'static [WitnessEntry] {
        self.witnesses
    }

    /// Witness for requirement `index`.
    pub fn witness(&self, index: usize) -> Option<WitnessEntry> {
        self.witnesses.get(index).copied()
    }

    /// Witness for the requirement called `name`.
    pub fn witness_named(&self, name: &str) -> Option<WitnessEntry> {
        let index = self
            .protocol
            .requirements
            .iter()
            .position(|requirement| requirement.name == name)?;
        self.witness(index)
    }

    /// Private storage words.
    pub fn private_words(&self) -> &'static [AtomicUsize] {
        self.private
    }
}

/// Pointer to an immortal witness table, compared by address.
#[derive(Clone, Copy)]
pub struct WitnessTableRef(&'static WitnessTable);

impl WitnessTableRef {
    /// Refer to a static table.
    pub const fn from_static(table: &'static WitnessTable) -> Self {
        Self(table)
    }

    /// The table.
    pub fn get(self) -> &'static WitnessTable {
        self.0
    }
}

impl Deref for WitnessTableRef {
    type Target = WitnessTable;

    fn deref(&self) -> &WitnessTable {
        self.0
    }
}

impl PartialEq for WitnessTableRef {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.0, other.0)
    }
}

impl Eq for WitnessTableRef {}

impl fmt::Debug for WitnessTableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WitnessTableRef({} @ {:p})", self.0.protocol.name, self.0)
    }
}

// ============================================================================
// Templates
// ============================================================================

/// A resilient witness: an implementation for a requirement, found by identity.
#[derive(Debug)]
pub struct ResilientWitness {
    /// The requirement, by address.
    pub requirement: &'static ProtocolRequirement,
    /// Its implementation.
    pub implementation: WitnessFunction,
}

/// Template for a conformance's witness tables.
#[derive(Debug)]
pub struct GenericWitnessTable {
    /// Static witnesses for a prefix of the requirements.
    pub pattern: WitnessTable,
    /// Witnesses located by requirement identity.
    pub resilient_witnesses: &'static [ResilientWitness],
    /// Zeroed words reserved in front of the witnesses.
    pub private_words: usize,
    /// Run last, with the conforming type and instantiation arguments.
    pub instantiator: Option<WitnessInstantiator>,
}

impl GenericWitnessTable {
    /// A template with only a static pattern.
    pub const fn new(pattern: WitnessTable) -> Self {
        Self {
            pattern,
            resilient_witnesses: &[],
            private_words: 0,
            instantiator: None,
        }
    }

    /// Set the resilient witnesses.
    pub const fn with_resilient_witnesses(
        mut self,
        witnesses: &'static [ResilientWitness],
    ) -> Self {
        self.resilient_witnesses = witnesses;
        self
    }

    /// Set the private storage size.
    pub const fn with_private_words(mut self, words: usize) -> Self {
        self.private_words = words;
        self
    }

    /// Set the instantiation callback.
    pub const fn with_instantiator(mut self, instantiator: WitnessInstantiator) -> Self {
        self.instantiator = Some(instantiator);
        self
    }

    /// The protocol.
    pub fn protocol(&self) -> &'static ProtocolDescriptor {
        self.pattern.protocol
    }

    /// Whether the pattern can be used as the table directly.
    pub fn is_trivial(&self) -> bool {
        self.resilient_witnesses.is_empty()
            && self.private_words == 0
            && self.instantiator.is_none()
            && self.pattern.witnesses.len() >= self.protocol().requirements.len()
    }
}

/// A table under construction, handed to the instantiation callback.
pub struct WitnessTableInit<'a> {
    protocol: &'static ProtocolDescriptor,
    entries: Vec<Option<WitnessEntry>>,
    private: &'a [AtomicUsize],
}

impl WitnessTableInit<'_> {
    /// The protocol.
    pub fn protocol(&self) -> &'static ProtocolDescriptor {
        self.protocol
    }

    /// Current witness for requirement `index`.
    pub fn get(&self, index: usize) -> Option<WitnessEntry> {
        self.entries.get(index).copied().flatten()
    }

    /// Set the witness for requirement `index`. Returns false if out of range.
    pub fn set(&mut self, index: usize, entry: WitnessEntry) -> bool {
        match self.entries.get_mut(index) {
            Some(slot) => {
                *slot = Some(entry);
                true
            }
            None => false,
        }
    }

    /// Set the witness for the requirement called `name`.
    pub fn set_named(&mut self, name: &str, entry: WitnessEntry) -> bool {
        match self
            .protocol
            .requirements
            .iter()
            .position(|requirement| requirement.name == name)
        {
            Some(index) => self.set(index, entry),
            None => false,
        }
    }

    /// Private storage words.
    pub fn private_words(&self) -> &[AtomicUsize] {
        self.private
    }
}

// ============================================================================
// Cache
// ============================================================================

type TableKey = (usize, MetadataRef);

/// Per-(template, type) cache of instantiated witness tables.
pub(crate) struct WitnessTableCache {
    tables: RwLock<HashMap<TableKey, Arc<OnceLock<WitnessTableRef>>, FxBuildHasher>>,
}

impl WitnessTableCache {
    pub(crate) fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::with_hasher(FxBuildHasher)),
        }
    }

    pub(crate) fn get_or_insert(
        &self,
        rt: &MetadataRuntime,
        template: &'static GenericWitnessTable,
        conforming_type: MetadataRef,
        arguments: &[WitnessTableRef],
    ) -> WitnessTableRef {
        if template.is_trivial() {
            RuntimeCounters::bump(&rt.counters().witness_fast_paths);
            return WitnessTableRef(&template.pattern);
        }

        let key = (template as *const GenericWitnessTable as usize, conforming_type);
        let existing = self.tables.read().get(&key).cloned();
        let cell = match existing {
            Some(cell) => cell,
            None => Arc::clone(self.tables.write().entry(key).or_default()),
        };

        *cell.get_or_init(|| instantiate(rt, template, conforming_type, arguments))
    }
}

fn instantiate(
    rt: &MetadataRuntime,
    template: &'static GenericWitnessTable,
    conforming_type: MetadataRef,
    arguments: &[WitnessTableRef],
) -> WitnessTableRef {
    let protocol = template.protocol();
    let requirements = protocol.requirements;
    let count = requirements.len();
    let private_words = template.private_words;

    let private_offset = size_of::<WitnessTable>();
    let entries_offset = (private_offset + private_words * size_of::<AtomicUsize>())
        .next_multiple_of(align_of::<WitnessEntry>());
    let size = entries_offset + count * size_of::<WitnessEntry>();
    let align = align_of::<WitnessTable>().max(align_of::<WitnessEntry>());
    let block: NonNull<u8> = rt.arena().allocate(size, align);

    // SAFETY: the private words lie inside the block and are initialized here.
    let private: &'static [AtomicUsize] = unsafe {
        let words = block.as_ptr().add(private_offset).cast::<AtomicUsize>();
        for i in 0..private_words {
            words.add(i).write(AtomicUsize::new(0));
        }
        slice::from_raw_parts(words, private_words)
    };

    // Static prefix first, then resilient witnesses and defaults.
    let mut entries: Vec<Option<WitnessEntry>> = template
        .pattern
        .witnesses
        .iter()
        .take(count)
        .map(|&witness| Some(witness))
        .collect();
    entries.resize(count, None);

    for (slot, requirement) in entries.iter_mut().zip(requirements) {
        if slot.is_some() || !requirement.kind.is_function_like() {
            continue;
        }
        let implementation = template
            .resilient_witnesses
            .iter()
            .find(|witness| ptr::eq(witness.requirement, requirement))
            .map(|witness| witness.implementation)
            .or(requirement.default_implementation);
        *slot = implementation.map(WitnessEntry::Function);
    }

    let mut init = WitnessTableInit {
        protocol,
        entries,
        private,
    };
    if let Some(instantiator) = template.instantiator {
        instantiator(&mut init, conforming_type, arguments);
    }

    let mut witnesses = Vec::with_capacity(count);
    for (entry, requirement) in init.entries.iter().zip(requirements) {
        match entry {
            Some(entry) => witnesses.push(*entry),
            None => rt.fatal(RuntimeError::MissingWitness {
                protocol: protocol.name,
                requirement: requirement.name,
                type_name: conforming_type.to_string(),
            }),
        }
    }

    // SAFETY: header and entries occupy disjoint, suitably aligned parts of
    // the block, and the table is not visible until returned.
    let table = unsafe {
        let entries = block.as_ptr().add(entries_offset).cast::<WitnessEntry>();
        ptr::copy_nonoverlapping(witnesses.as_ptr(), entries, count);
        let header = block.cast::<WitnessTable>();
        header.as_ptr().write(WitnessTable {
            protocol,
            conforming_type: Some(conforming_type),
            witnesses: slice::from_raw_parts(entries, count),
            private,
        });
        WitnessTableRef(&*header.as_ptr())
    };

    RuntimeCounters::bump(&rt.counters().witness_tables_instantiated);
    tracing::debug!(
        protocol = protocol.name,
        ty = %conforming_type,
        private_words,
        "instantiated witness table"
    );
    table
}
