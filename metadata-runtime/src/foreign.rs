//! Foreign Type Identity
//!
//! Types defined outside the current module may be emitted by several
//! modules, each with its own copy of the metadata. The first copy registered
//! under a name becomes canonical and every later copy is mapped to it.
//!
//! A foreign type may need one-time initialization. Its first registrant
//! inserts a placeholder, runs the initializer with no lock held, then fills
//! the slot and wakes everyone who found the placeholder in the meantime.
//! Entries are never removed.
//!
//! Each candidate remembers the canonical record chosen by the first map that
//! saw it, tagged with that map's id. Other maps ignore the tag and always
//! resolve through their own table.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::metadata::{Metadata, MetadataRef, TypeLayout};
use crate::stats::RuntimeCounters;

/// One-time initializer for a foreign type.
pub type ForeignInitializer = fn(&ForeignTypeMetadata);

/// A module's copy of a foreign type's metadata.
pub struct ForeignTypeMetadata {
    metadata: Metadata,
    initializer: Option<ForeignInitializer>,
    /// Canonical metadata, once known, and the id of the map that chose it.
    unique: OnceLock<(u64, MetadataRef)>,
}

impl ForeignTypeMetadata {
    /// A candidate named `name`.
    pub const fn new(
        name: &'static str,
        layout: Option<TypeLayout>,
        initializer: Option<ForeignInitializer>,
    ) -> Self {
        Self {
            metadata: Metadata::foreign(name, layout),
            initializer,
            unique: OnceLock::new(),
        }
    }

    /// This candidate's own metadata.
    pub fn metadata(&'static self) -> MetadataRef {
        MetadataRef::from_static(&self.metadata)
    }

    /// The identifying name.
    pub fn name(&self) -> &'static str {
        self.metadata.name()
    }

    /// Whether registration runs an initializer.
    pub fn requires_initialization(&self) -> bool {
        self.initializer.is_some()
    }

    /// Publish the layout. Intended for initializers.
    pub fn publish_layout(&self, layout: TypeLayout) {
        self.metadata.publish_layout(layout);
    }

    /// The canonical metadata cached on this candidate by the first runtime
    /// that registered it.
    pub fn cached_unique(&self) -> Option<MetadataRef> {
        self.unique.get().map(|&(_, canonical)| canonical)
    }

    fn cached_unique_in(&self, map_id: u64) -> Option<MetadataRef> {
        match self.unique.get() {
            Some(&(owner, canonical)) if owner == map_id => Some(canonical),
            _ => None,
        }
    }
}

impl fmt::Debug for ForeignTypeMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignTypeMetadata")
            .field("name", &self.name())
            .field("requires_initialization", &self.requires_initialization())
            .field("unique", &self.cached_unique())
            .finish()
    }
}

struct ForeignSlot {
    /// `None` while the owner's initializer runs.
    canonical: Option<MetadataRef>,
}

#[derive(Default)]
struct ForeignTable {
    index: FxHashMap<&'static str, usize>,
    /// Append-only, so positions stay valid.
    slots: Vec<ForeignSlot>,
}

static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(1);

/// Name-keyed map from foreign candidates to canonical metadata.
pub(crate) struct ForeignTypeMap {
    id: u64,
    table: Mutex<ForeignTable>,
    initialized: Condvar,
}

impl ForeignTypeMap {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed),
            table: Mutex::new(ForeignTable::default()),
            initialized: Condvar::new(),
        }
    }

    /// Number of registered names.
    pub(crate) fn len(&self) -> usize {
        self.table.lock().slots.len()
    }

    pub(crate) fn unique(
        &self,
        counters: &RuntimeCounters,
        candidate: &'static ForeignTypeMetadata,
    ) -> MetadataRef {
        if let Some(unique) = candidate.cached_unique_in(self.id) {
            return unique;
        }

        let name = candidate.name();
        let mut table = self.table.lock();

        let existing = table.index.get(name).copied();
        let Some(mut position) = existing else {
            // First registrant: this candidate becomes canonical.
            RuntimeCounters::bump(&counters.foreign_types_registered);
            let own = candidate.metadata();
            let position = table.slots.len();
            table.index.insert(name, position);

            let Some(initializer) = candidate.initializer else {
                table.slots.push(ForeignSlot {
                    canonical: Some(own),
                });
                drop(table);
                return self.cache(candidate, own);
            };

            table.slots.push(ForeignSlot { canonical: None });
            drop(table);

            tracing::debug!(name, "initializing foreign type");
            initializer(candidate);

            let mut table = self.table.lock();
            table.slots[position].canonical = Some(own);
            self.initialized.notify_all();
            drop(table);
            return self.cache(candidate, own);
        };

        let mut observed_len = table.slots.len();
        loop {
            if table.slots.len() != observed_len {
                // Positions are stable; re-resolve only when the table grew.
                observed_len = table.slots.len();
                if let Some(&current) = table.index.get(name) {
                    position = current;
                }
            }
            if let Some(canonical) = table.slots[position].canonical {
                drop(table);
                return self.cache(candidate, canonical);
            }
            RuntimeCounters::bump(&counters.foreign_waits);
            self.initialized.wait(&mut table);
        }
    }

    fn cache(
        &self,
        candidate: &'static ForeignTypeMetadata,
        canonical: MetadataRef,
    ) -> MetadataRef {
        let _ = candidate.unique.set((self.id, canonical));
        canonical
    }
}
