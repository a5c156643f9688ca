//! Concurrent Metadata Cache
//!
//! Maps a [`TypeKey`] to one cache entry that owns a metadata record and
//! drives it through the completion states.
//!
//! # Protocol
//!
//! - Lookup takes the read lock. On a miss the write lock is taken and the
//!   lookup repeated, so exactly one racer inserts the entry.
//! - The inserting thread allocates the record and becomes its initializer.
//!   Everyone else waits for the allocation, then for the state they asked for
//!   (blocking) or returns the current state (non-blocking).
//! - The initializer runs completion steps with no lock held. After each step
//!   it publishes the new state, wakes blocked waiters and resumes queued
//!   entries whose requirement is now met.
//! - A step that stops on a dependency is checked for cycles. A blocking
//!   initializer then waits for the dependency itself; otherwise the entry is
//!   parked on the dependency's completion queue and the thread returns.

use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use hashbrown::{Equivalent, HashMap};
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxBuildHasher;

use crate::error::RuntimeError;
use crate::metadata::MetadataRef;
use crate::runtime::MetadataRuntime;
use crate::state::{
    CompletionContext, CompletionStep, MetadataDependency, MetadataRequest, MetadataResponse,
    MetadataState,
};
use crate::stats::RuntimeCounters;

// ============================================================================
// Keys
// ============================================================================

/// Structural identity of a cached record: a template and its arguments.
///
/// Equality and ordering compare the template address, then the arguments
/// element by element.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeKey {
    template: usize,
    arguments: Box<[MetadataRef]>,
}

impl TypeKey {
    /// Create a key.
    pub fn new(template: usize, arguments: &[MetadataRef]) -> Self {
        Self {
            template,
            arguments: arguments.into(),
        }
    }

    /// Template address, or zero for structural types.
    pub fn template(&self) -> usize {
        self.template
    }

    /// Generic arguments.
    pub fn arguments(&self) -> &[MetadataRef] {
        &self.arguments
    }
}

/// Borrowed [`TypeKey`] for lookups. Must hash exactly like the owned key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TypeKeyRef<'a> {
    template: usize,
    arguments: &'a [MetadataRef],
}

impl TypeKeyRef<'_> {
    fn into_owned(self) -> TypeKey {
        TypeKey::new(self.template, self.arguments)
    }
}

impl Equivalent<TypeKey> for TypeKeyRef<'_> {
    fn equivalent(&self, key: &TypeKey) -> bool {
        self.template == key.template && *self.arguments == *key.arguments
    }
}

// ============================================================================
// Entry kinds
// ============================================================================

/// How one family of records is allocated and completed.
pub(crate) trait CacheEntryKind: Sized + 'static {
    /// Per-request template data.
    type Template: Copy;

    /// Cache name for logs.
    const NAME: &'static str;

    /// Address identifying `template` in keys.
    fn template_id(template: Self::Template) -> usize;

    /// Template address of a record this kind allocated.
    fn template_id_of(metadata: MetadataRef) -> usize;

    /// Allocate a record and report its initial state.
    fn allocate(
        rt: &MetadataRuntime,
        template: Self::Template,
        arguments: &[MetadataRef],
    ) -> (MetadataRef, MetadataState);

    /// Run one completion step from `state`.
    fn try_initialize(
        rt: &MetadataRuntime,
        metadata: MetadataRef,
        state: MetadataState,
        context: &mut CompletionContext,
    ) -> CompletionStep;
}

/// An entry that can continue its initialization on another thread.
pub(crate) trait Resumable: Send + Sync {
    fn resume(self: Arc<Self>, rt: &MetadataRuntime);
}

/// An entry parked until the owner of the queue reaches `required`.
pub(crate) struct QueuedCompletion {
    pub(crate) required: MetadataState,
    pub(crate) waiter: Arc<dyn Resumable>,
}

// ============================================================================
// Entries
// ============================================================================

/// `published` value before the record exists.
const ALLOCATING: u8 = u8::MAX;

struct EntryInner {
    metadata: Option<MetadataRef>,
    state: MetadataState,
    blocked_on: Option<MetadataDependency>,
    /// Thread currently running completion steps, if any.
    initializer: Option<ThreadId>,
    /// Saved while the entry is parked on a queue.
    context: Option<CompletionContext>,
    queue: Vec<QueuedCompletion>,
}

/// One cached record and its completion state.
pub(crate) struct CacheEntry<K> {
    metadata: OnceLock<MetadataRef>,
    /// Last published state, readable without the lock.
    published: AtomicU8,
    inner: Mutex<EntryInner>,
    condvar: Condvar,
    _kind: PhantomData<fn() -> K>,
}

impl<K: CacheEntryKind> CacheEntry<K> {
    fn new() -> Self {
        Self {
            metadata: OnceLock::new(),
            published: AtomicU8::new(ALLOCATING),
            inner: Mutex::new(EntryInner {
                metadata: None,
                state: MetadataState::Abstract,
                blocked_on: None,
                initializer: None,
                context: None,
                queue: Vec::new(),
            }),
            condvar: Condvar::new(),
            _kind: PhantomData,
        }
    }

    /// Current response without locking, if the record exists.
    fn snapshot(&self) -> Option<MetadataResponse> {
        let metadata = *self.metadata.get()?;
        let state = MetadataState::from_u8(self.published.load(Ordering::Acquire))?;
        Some(MetadataResponse { metadata, state })
    }

    /// Published state, if the record exists.
    pub(crate) fn state(&self) -> Option<MetadataState> {
        self.snapshot().map(|response| response.state)
    }

    /// The dependency this entry is blocked on, if it has not reached `required`.
    pub(crate) fn blocked_on(&self, required: MetadataState) -> Option<MetadataDependency> {
        let inner = self.inner.lock();
        if inner.metadata.is_none() || inner.state.satisfies(required) {
            return None;
        }
        inner.blocked_on
    }

    fn finish_allocation(&self, metadata: MetadataRef, state: MetadataState) {
        let _ = self.metadata.set(metadata);
        let mut inner = self.inner.lock();
        inner.metadata = Some(metadata);
        inner.state = state;
        if state != MetadataState::Complete {
            inner.initializer = Some(thread::current().id());
        }
        self.published.store(state as u8, Ordering::Release);
        self.condvar.notify_all();
    }

    /// Wait for `request` to be satisfied, or return at once if non-blocking.
    ///
    /// Allocation is always waited for, since there is no record before it.
    pub(crate) fn await_request(
        &self,
        rt: &MetadataRuntime,
        request: MetadataRequest,
    ) -> MetadataResponse {
        if let Some(response) = self.snapshot() {
            if request.non_blocking || request.is_satisfied_by(response.state) {
                return response;
            }
        }

        let mut inner = self.inner.lock();
        loop {
            if let Some(metadata) = inner.metadata {
                let response = MetadataResponse {
                    metadata,
                    state: inner.state,
                };
                if request.non_blocking || request.is_satisfied_by(inner.state) {
                    return response;
                }
                if inner.initializer == Some(thread::current().id()) {
                    drop(inner);
                    rt.fatal(RuntimeError::ReentrantInitialization {
                        metadata: metadata.to_string(),
                    });
                }
            }
            self.condvar.wait(&mut inner);
        }
    }

    /// Queue `completion` unless this entry already satisfies it.
    pub(crate) fn try_enqueue(&self, completion: QueuedCompletion) -> Result<(), QueuedCompletion> {
        let mut inner = self.inner.lock();
        if inner.metadata.is_some() && inner.state.satisfies(completion.required) {
            return Err(completion);
        }
        inner.queue.push(completion);
        Ok(())
    }

    /// Publish a step's outcome. Returns the new state and the queued
    /// completions it released.
    fn publish(&self, step: CompletionStep) -> (MetadataState, Vec<QueuedCompletion>) {
        let mut inner = self.inner.lock();
        let state = inner.state.max(step.new_state);
        inner.state = state;
        inner.blocked_on = step.dependency;
        if state == MetadataState::Complete {
            inner.initializer = None;
        }
        self.published.store(state as u8, Ordering::Release);
        self.condvar.notify_all();

        let (ready, waiting): (Vec<_>, Vec<_>) = mem::take(&mut inner.queue)
            .into_iter()
            .partition(|queued| state.satisfies(queued.required));
        inner.queue = waiting;
        (state, ready)
    }

    /// Give up initialization ownership, keeping the context for a resumer.
    fn suspend(&self, context: CompletionContext) {
        let mut inner = self.inner.lock();
        inner.initializer = None;
        inner.context = Some(context);
    }

    /// Take initialization ownership back from a suspended entry.
    fn reclaim(&self) -> Option<CompletionContext> {
        let mut inner = self.inner.lock();
        let context = inner.context.take()?;
        inner.initializer = Some(thread::current().id());
        Some(context)
    }

    fn do_initialization(
        self: &Arc<Self>,
        rt: &MetadataRuntime,
        metadata: MetadataRef,
        request: MetadataRequest,
        mut state: MetadataState,
        mut context: CompletionContext,
    ) -> MetadataResponse {
        loop {
            RuntimeCounters::bump(&rt.counters().completion_steps);
            let step = K::try_initialize(rt, metadata, state, &mut context);
            tracing::trace!(
                cache = K::NAME,
                %metadata,
                from = %state,
                to = %step.new_state,
                blocked = step.dependency.is_some(),
                "completion step"
            );

            let (published, ready) = self.publish(step);
            state = published;
            for queued in ready {
                rt.resume(queued.waiter);
            }

            let Some(dependency) = step.dependency else {
                if state == MetadataState::Complete {
                    return MetadataResponse { metadata, state };
                }
                continue;
            };

            rt.note_dependency(metadata, dependency);

            if request.is_blocking() && !request.is_satisfied_by(state) {
                rt.check_metadata_state(
                    MetadataRequest::blocking(dependency.required),
                    dependency.target,
                );
                continue;
            }

            self.suspend(context);
            let completion = QueuedCompletion {
                required: dependency.required,
                waiter: Arc::clone(self) as Arc<dyn Resumable>,
            };
            match rt.enqueue(dependency.target, completion) {
                Ok(()) => {
                    tracing::trace!(cache = K::NAME, %metadata, on = %dependency, "parked");
                    return MetadataResponse { metadata, state };
                }
                // The target got there first; keep going on this thread.
                Err(_) => match self.reclaim() {
                    Some(saved) => context = saved,
                    None => return MetadataResponse { metadata, state },
                },
            }
        }
    }
}

impl<K: CacheEntryKind> Resumable for CacheEntry<K> {
    fn resume(self: Arc<Self>, rt: &MetadataRuntime) {
        let Some(&metadata) = self.metadata.get() else {
            return;
        };
        let Some(context) = self.reclaim() else {
            return;
        };
        let state = self.state().unwrap_or_default();
        self.do_initialization(
            rt,
            metadata,
            MetadataRequest::non_blocking(MetadataState::Complete),
            state,
            context,
        );
    }
}

// ============================================================================
// Cache
// ============================================================================

/// A concurrent map from [`TypeKey`] to cache entries of one kind.
pub(crate) struct MetadataCache<K: CacheEntryKind> {
    entries: RwLock<HashMap<TypeKey, Arc<CacheEntry<K>>, FxBuildHasher>>,
}

impl<K: CacheEntryKind> MetadataCache<K> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::with_hasher(FxBuildHasher)),
        }
    }

    /// Number of entries.
    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Find or create the record for `(template, arguments)` and wait as
    /// `request` asks.
    pub(crate) fn get_or_insert(
        &self,
        rt: &MetadataRuntime,
        request: MetadataRequest,
        template: K::Template,
        arguments: &[MetadataRef],
    ) -> MetadataResponse {
        let key = TypeKeyRef {
            template: K::template_id(template),
            arguments,
        };

        let existing = self.entries.read().get(&key).cloned();
        if let Some(entry) = existing {
            RuntimeCounters::bump(&rt.counters().cache_hits);
            return entry.await_request(rt, request);
        }

        let (entry, inserted) = {
            let mut entries = self.entries.write();
            match entries.get(&key) {
                Some(entry) => (Arc::clone(entry), false),
                None => {
                    let entry = Arc::new(CacheEntry::new());
                    entries.insert(key.into_owned(), Arc::clone(&entry));
                    (entry, true)
                }
            }
        };

        if !inserted {
            RuntimeCounters::bump(&rt.counters().cache_hits);
            return entry.await_request(rt, request);
        }

        let (metadata, state) = K::allocate(rt, template, arguments);
        RuntimeCounters::bump(&rt.counters().metadata_instantiations);
        tracing::debug!(cache = K::NAME, %metadata, %state, "instantiated metadata");

        entry.finish_allocation(metadata, state);
        if state == MetadataState::Complete {
            return MetadataResponse { metadata, state };
        }
        entry.do_initialization(rt, metadata, request, state, CompletionContext::default())
    }

    /// The entry owning `metadata`.
    pub(crate) fn entry_for(&self, metadata: MetadataRef) -> Option<Arc<CacheEntry<K>>> {
        let key = TypeKeyRef {
            template: K::template_id_of(metadata),
            arguments: metadata.generic_arguments(),
        };
        self.entries.read().get(&key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins;
    use std::hash::BuildHasher;

    #[test]
    fn test_borrowed_key_hashes_like_owned() {
        let args = [builtins::int32(), builtins::bool()];
        let owned = TypeKey::new(0x1000, &args);
        let borrowed = TypeKeyRef {
            template: 0x1000,
            arguments: &args,
        };

        let hasher = FxBuildHasher;
        assert_eq!(hasher.hash_one(&owned), hasher.hash_one(borrowed));
        assert!(borrowed.equivalent(&owned));
        assert_eq!(borrowed.into_owned(), owned);
    }

    #[test]
    fn test_key_ordering_is_fieldwise() {
        let low = TypeKey::new(1, &[builtins::int64()]);
        let high = TypeKey::new(2, &[]);
        assert!(low < high);

        let (a, b) = if builtins::int8() < builtins::int16() {
            (builtins::int8(), builtins::int16())
        } else {
            (builtins::int16(), builtins::int8())
        };
        assert!(TypeKey::new(1, &[a]) < TypeKey::new(1, &[b]));
        assert!(TypeKey::new(1, &[a]) < TypeKey::new(1, &[a, a]));
    }
}
