//! Metadata Allocation Arena
//!
//! A process-wide bump allocator for immortal runtime records. Metadata and
//! witness tables are never freed individually, so the arena hands out memory
//! from page-sized pools with a single lock-free compare-and-swap per request.
//!
//! # Pool encoding
//!
//! The `{pointer, remaining}` pair that describes the current pool is packed
//! into one `AtomicPtr<u8>`:
//!
//! - Pages are allocated with `align == page_size`, and the page size is a
//!   power of two, so the page an untagged cursor belongs to is
//!   `cursor & !(page - 1)` and `remaining = page - (cursor & (page - 1))`.
//! - Cursors are always word-aligned, which frees the low bit for a tag. An
//!   exhausted page is encoded as its end address with [`EXHAUSTED`] set, so
//!   `remaining = 0` and the block that filled the page can still be matched
//!   and handed back.
//! - Null means no page has been fetched yet.
//!
//! Requests larger than `max_pool_allocation` bypass the pool and go straight to
//! the global allocator.
//!
//! # Deallocation
//!
//! Only the most recent pool allocation can be handed back: if a block ends
//! exactly at the cursor, the cursor is moved back to the block's start.
//! Anything else is an intentional, permanent leak. Pages themselves are never
//! returned, which keeps every `&'static` record valid for the process lifetime.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::config::{ArenaConfig, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

const WORD: usize = size_of::<usize>();

/// Largest alignment the arena supports.
pub const MAX_ALIGNMENT: usize = 64;

/// Tag bit marking a cursor that sits at its page's end.
const EXHAUSTED: usize = 1;

/// Largest size a `Layout` accepts at `MAX_ALIGNMENT`.
const MAX_LAYOUT_SIZE: usize = isize::MAX as usize + 1 - MAX_ALIGNMENT;

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Request size rounded up to whole words.
#[inline]
fn word_size(size: usize) -> usize {
    match size.max(1).checked_next_multiple_of(WORD) {
        Some(size) => size,
        None => allocation_overflow(size),
    }
}

/// Layout used for allocations that bypass the pool.
fn large_layout(size: usize) -> Layout {
    match Layout::from_size_align(size, MAX_ALIGNMENT) {
        Ok(layout) => layout,
        Err(_) => allocation_overflow(size),
    }
}

/// Report a request no allocator could satisfy through the allocation error
/// handler, as for any other heap failure.
#[cold]
fn allocation_overflow(size: usize) -> ! {
    tracing::error!(size, "metadata allocation exceeds the address space");
    // SAFETY: MAX_LAYOUT_SIZE is a multiple of MAX_ALIGNMENT below isize::MAX.
    let layout = unsafe { Layout::from_size_align_unchecked(MAX_LAYOUT_SIZE, MAX_ALIGNMENT) };
    alloc::handle_alloc_error(layout)
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of arena activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Requests served from a pool page.
    pub pool_allocations: u64,
    /// Requests that bypassed the pool.
    pub large_allocations: u64,
    /// Pool pages installed as the current page.
    pub pages_acquired: u64,
    /// Pages fetched but discarded after losing a race.
    pub pages_released: u64,
    /// Bytes handed out, after rounding to whole words.
    pub bytes_allocated: u64,
    /// Deallocations that moved the cursor back.
    pub reclaimed_deallocations: u64,
    /// Deallocations that were left as leaks.
    pub leaked_deallocations: u64,
    /// Large allocations returned to the global allocator.
    pub large_deallocations: u64,
}

impl ArenaStats {
    /// Total allocation calls served.
    pub fn total_allocations(&self) -> u64 {
        self.pool_allocations + self.large_allocations
    }
}

#[derive(Default)]
struct ArenaCounters {
    pool_allocations: AtomicU64,
    large_allocations: AtomicU64,
    pages_acquired: AtomicU64,
    pages_released: AtomicU64,
    bytes_allocated: AtomicU64,
    reclaimed_deallocations: AtomicU64,
    leaked_deallocations: AtomicU64,
    large_deallocations: AtomicU64,
}

impl ArenaCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Arena
// ============================================================================

/// Lock-free bump allocator for metadata records.
pub struct MetadataArena {
    /// Next free byte of the current page, tagged when the page is full.
    cursor: AtomicPtr<u8>,
    page_layout: Layout,
    max_pool_allocation: usize,
    counters: ArenaCounters,
}

// Thread-safe: the cursor is only changed by CAS and pages are never freed.
unsafe impl Send for MetadataArena {}
unsafe impl Sync for MetadataArena {}

impl MetadataArena {
    /// Create an arena. No page is fetched until the first pool allocation.
    ///
    /// Page sizes outside the supported range, or not a power of two, are
    /// clamped and rounded up rather than rejected.
    pub fn new(config: &ArenaConfig) -> Self {
        let page_size = config
            .page_size
            .clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
            .next_power_of_two();
        // SAFETY: page_size is a non-zero power of two far below isize::MAX.
        let page_layout = unsafe { Layout::from_size_align_unchecked(page_size, page_size) };
        let max_pool_allocation = config.max_pool_allocation.clamp(WORD, page_size);

        Self {
            cursor: AtomicPtr::new(ptr::null_mut()),
            page_layout,
            max_pool_allocation,
            counters: ArenaCounters::default(),
        }
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_layout.size()
    }

    /// Largest request served from a pool page.
    pub fn max_pool_allocation(&self) -> usize {
        self.max_pool_allocation
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// Sizes are rounded up to whole words and alignment is at least one word.
    /// The memory is uninitialized and lives for the rest of the process unless
    /// handed back with [`deallocate`](Self::deallocate).
    pub fn allocate(&self, size: usize, align: usize) -> NonNull<u8> {
        debug_assert!(align.is_power_of_two() && align <= MAX_ALIGNMENT);
        let align = align.clamp(WORD, MAX_ALIGNMENT);
        let size = word_size(size);

        if size > self.max_pool_allocation {
            return self.allocate_large(size);
        }

        let page_size = self.page_size();
        let mut current = self.cursor.load(Ordering::Acquire);
        let mut spare_page: Option<NonNull<u8>> = None;

        loop {
            // Try to carve the request out of the current page.
            if let Some((address, page_end)) = self.decode(current) {
                let start = round_up(address, align);
                let end = start + size;

                if end <= page_end {
                    let next = Self::encode(current.with_addr(end), page_end);
                    match self.cursor.compare_exchange_weak(
                        current,
                        next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            if let Some(page) = spare_page {
                                self.release_page(page);
                            }
                            self.record_pool_allocation(size);
                            // SAFETY: start lies inside the current page, below its end.
                            return unsafe { NonNull::new_unchecked(current.with_addr(start)) };
                        }
                        Err(actual) => {
                            current = actual;
                            continue;
                        }
                    }
                }
            }

            // The current page is too small. Install a fresh one.
            let page = match spare_page.take() {
                Some(page) => page,
                None => self.acquire_page(),
            };
            let page_end = page.addr().get() + page_size;
            let next = Self::encode(page.as_ptr().with_addr(page.addr().get() + size), page_end);

            match self.cursor.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    ArenaCounters::bump(&self.counters.pages_acquired);
                    self.record_pool_allocation(size);
                    return page;
                }
                Err(actual) => {
                    spare_page = Some(page);
                    current = actual;
                }
            }
        }
    }

    /// Hand back memory obtained from [`allocate`](Self::allocate).
    ///
    /// Only the most recent pool allocation is reclaimed; any other block is
    /// leaked. Large allocations are returned to the global allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this arena with the same
    /// `size`, must not have been deallocated before, and must not be used
    /// afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let size = word_size(size);

        if size > self.max_pool_allocation {
            // SAFETY: large blocks were allocated with exactly this layout.
            unsafe { alloc::dealloc(ptr.as_ptr(), large_layout(size)) };
            ArenaCounters::bump(&self.counters.large_deallocations);
            return;
        }

        let end = ptr.addr().get() + size;
        let current = self.cursor.load(Ordering::Acquire);
        let reclaimed = self
            .decode(current)
            .is_some_and(|(address, _)| address == end)
            && self
                .cursor
                .compare_exchange(current, ptr.as_ptr(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok();

        if reclaimed {
            ArenaCounters::bump(&self.counters.reclaimed_deallocations);
        } else {
            ArenaCounters::bump(&self.counters.leaked_deallocations);
        }
    }

    /// Snapshot the arena counters.
    pub fn stats(&self) -> ArenaStats {
        let c = &self.counters;
        ArenaStats {
            pool_allocations: c.pool_allocations.load(Ordering::Relaxed),
            large_allocations: c.large_allocations.load(Ordering::Relaxed),
            pages_acquired: c.pages_acquired.load(Ordering::Relaxed),
            pages_released: c.pages_released.load(Ordering::Relaxed),
            bytes_allocated: c.bytes_allocated.load(Ordering::Relaxed),
            reclaimed_deallocations: c.reclaimed_deallocations.load(Ordering::Relaxed),
            leaked_deallocations: c.leaked_deallocations.load(Ordering::Relaxed),
            large_deallocations: c.large_deallocations.load(Ordering::Relaxed),
        }
    }

    /// Split a cursor into its address and the end of its page.
    fn decode(&self, cursor: *mut u8) -> Option<(usize, usize)> {
        if cursor.is_null() {
            return None;
        }
        let address = cursor.addr();
        if address & EXHAUSTED != 0 {
            let end = address & !EXHAUSTED;
            return Some((end, end));
        }
        let page_size = self.page_size();
        Some((address, (address & !(page_size - 1)) + page_size))
    }

    fn encode(cursor: *mut u8, page_end: usize) -> *mut u8 {
        if cursor.addr() == page_end {
            cursor.map_addr(|address| address | EXHAUSTED)
        } else {
            cursor
        }
    }

    fn allocate_large(&self, size: usize) -> NonNull<u8> {
        let layout = large_layout(size);
        // SAFETY: size is non-zero.
        let raw = unsafe { alloc::alloc(layout) };
        let Some(block) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout)
        };
        ArenaCounters::bump(&self.counters.large_allocations);
        self.counters
            .bytes_allocated
            .fetch_add(size as u64, Ordering::Relaxed);
        block
    }

    fn acquire_page(&self) -> NonNull<u8> {
        // SAFETY: the page layout has a non-zero size.
        let raw = unsafe { alloc::alloc(self.page_layout) };
        match NonNull::new(raw) {
            Some(page) => page,
            None => {
                tracing::error!(
                    page_size = self.page_size(),
                    "metadata arena could not acquire a page"
                );
                alloc::handle_alloc_error(self.page_layout)
            }
        }
    }

    fn release_page(&self, page: NonNull<u8>) {
        // SAFETY: the page was never published, so nothing else refers to it.
        unsafe { alloc::dealloc(page.as_ptr(), self.page_layout) };
        ArenaCounters::bump(&self.counters.pages_released);
    }

    fn record_pool_allocation(&self, size: usize) {
        ArenaCounters::bump(&self.counters.pool_allocations);
        self.counters
            .bytes_allocated
            .fetch_add(size as u64, Ordering::Relaxed);
    }
}

impl Default for MetadataArena {
    fn default() -> Self {
        Self::new(&ArenaConfig::default())
    }
}

impl fmt::Debug for MetadataArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataArena")
            .field("page_size", &self.page_size())
            .field("max_pool_allocation", &self.max_pool_allocation)
            .field("stats", &self.stats())
            .finish()
    }
}
