//! Epoch-based memory reclamation with typed chunk allocators.
//!
//! Provides safe deferred reuse for lock-free data structures. Threads
//! *pin* themselves to the current epoch before accessing shared pointers,
//! and *retire* chunks they unlink. A retired chunk is only handed out
//! again once every thread has been observed past two epoch boundaries,
//! so no reader can still hold a reference to it.
//!
//! Chunks come from typed allocators registered up front: each allocator
//! has a fixed cache-line-aligned layout, a per-thread free list, and an
//! optional pre-free hook that restores a chunk to its pristine state
//! right before it re-enters a free list.
//!
//! # Usage
//!
//! ```ignore
//! let collector = Collector::new();
//! let nodes = collector.add_allocator(layout, Some(reset_node));
//!
//! // Each thread registers once.
//! let handle = collector.register();
//!
//! // Pin before accessing shared pointers.
//! let guard = handle.pin();
//! let chunk = guard.alloc(nodes);
//! // ... link chunk, read / CAS shared links ...
//! guard.retire(nodes, unlinked);
//! // guard unpins on drop.
//! ```

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;

/// Ring size of the deferred-free lists: current, previous, two-back.
pub const NUM_EPOCHS: usize = 3;

/// Cache line size of the target, following the table the vendored
/// crossbeam sources use (the spatial prefetcher on recent x86_64 and
/// apple aarch64 parts pulls cache lines in pairs).
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub const CACHE_LINE_SIZE: usize = 128;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const CACHE_LINE_SIZE: usize = 64;

/// Slot value of a thread that is not inside a critical section.
const QUIESCENT: usize = usize::MAX;

/// Allocate a fresh zeroed chunk. Aborts on OOM; there is no recoverable
/// allocation failure anywhere in this crate.
pub fn alloc_chunk(layout: Layout) -> *mut u8 {
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        alloc::handle_alloc_error(layout);
    }
    ptr
}

/// Return a chunk to the system allocator.
///
/// # Safety
///
/// `ptr` must have come from [`alloc_chunk`] with the same `layout`, and
/// no thread may still reference it.
pub unsafe fn dealloc_chunk(ptr: *mut u8, layout: Layout) {
    unsafe { alloc::dealloc(ptr, layout) }
}

/// Runs on a chunk immediately before it re-enters a free list. Hooks
/// must not allocate from or retire into the collector.
pub type PreFreeHook = unsafe fn(*mut u8);

/// Identifier of a typed allocator registered with
/// [`Collector::add_allocator`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocatorId(usize);

#[derive(Copy, Clone)]
struct AllocatorDesc {
    layout: Layout,
    hook: Option<PreFreeHook>,
}

/// Owns all shared reclamation state: the global epoch, the thread
/// registry, the allocator table, and chunks orphaned by departed
/// threads. Create one per logical "domain" of shared pointers; dropping
/// the last `Arc` tears the domain down and releases the orphans.
pub struct Collector {
    epoch: CachePadded<AtomicUsize>,
    threads: Mutex<Vec<Arc<CachePadded<AtomicUsize>>>>,
    allocators: Mutex<Vec<AllocatorDesc>>,
    orphans: Mutex<Vec<(AllocatorId, *mut u8)>>,
}

// SAFETY: The raw pointers in `orphans` are unlinked chunks owned by the
// collector alone; they are only touched again in `Drop`.
unsafe impl Send for Collector {}
unsafe impl Sync for Collector {}

impl Collector {
    /// Create a new collector. The returned `Arc` is cheap to clone and
    /// should be shared with every thread that will participate.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: CachePadded::new(AtomicUsize::new(0)),
            threads: Mutex::new(Vec::new()),
            allocators: Mutex::new(Vec::new()),
            orphans: Mutex::new(Vec::new()),
        })
    }

    /// Register a typed allocator. Chunks are padded and aligned to the
    /// cache line so the hot link arrays of neighboring chunks never
    /// share a line, and so the low pointer bit is free for mark bits.
    pub fn add_allocator(&self, layout: Layout, hook: Option<PreFreeHook>) -> AllocatorId {
        let layout = layout.align_to(CACHE_LINE_SIZE).unwrap().pad_to_align();
        let mut table = self.allocators.lock().unwrap();
        table.push(AllocatorDesc { layout, hook });
        AllocatorId(table.len() - 1)
    }

    /// Register the current thread and obtain a [`LocalHandle`] for
    /// pinning. The registry lock is held only here and at deregistration.
    pub fn register(self: &Arc<Self>) -> LocalHandle {
        let slot = Arc::new(CachePadded::new(AtomicUsize::new(QUIESCENT)));
        self.threads.lock().unwrap().push(slot.clone());
        LocalHandle {
            collector: Arc::clone(self),
            slot,
            depth: Cell::new(0),
            seen: Cell::new(QUIESCENT),
            caches: RefCell::new(Caches {
                allocators: Vec::new(),
                free: Vec::new(),
                limbo: [const { Vec::new() }; NUM_EPOCHS],
            }),
        }
    }

    /// Try to advance the global epoch: every thread inside a critical
    /// section must have published the current epoch. Uses `try_lock` to
    /// avoid contention — if another thread is already scanning, we
    /// simply skip this attempt.
    fn try_advance(&self) -> bool {
        let current = self.epoch.load(Ordering::SeqCst);
        {
            let threads = match self.threads.try_lock() {
                Ok(t) => t,
                Err(_) => return false,
            };
            for slot in threads.iter() {
                let e = slot.load(Ordering::SeqCst);
                if e != QUIESCENT && e != current {
                    return false;
                }
            }
        }
        self.epoch
            .compare_exchange(
                current,
                current.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    fn current_epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        let table = self.allocators.get_mut().unwrap();
        for (id, ptr) in self.orphans.get_mut().unwrap().drain(..) {
            unsafe { dealloc_chunk(ptr, table[id.0].layout) };
        }
    }
}

/// Thread-local allocation state: a descriptor snapshot, one free list
/// per allocator, and the three-bucket limbo ring of retired chunks.
struct Caches {
    allocators: Vec<AllocatorDesc>,
    free: Vec<Vec<*mut u8>>,
    limbo: [Vec<(AllocatorId, *mut u8)>; NUM_EPOCHS],
}

/// Per-thread handle to a [`Collector`]. Provides [`pin`](LocalHandle::pin)
/// for entering a critical section. Dropping the handle deregisters the
/// thread and hands unexpired garbage back to the collector.
pub struct LocalHandle {
    collector: Arc<Collector>,
    slot: Arc<CachePadded<AtomicUsize>>,
    depth: Cell<usize>,
    seen: Cell<usize>,
    caches: RefCell<Caches>,
}

impl LocalHandle {
    /// Pin the current thread to the global epoch, returning an RAII
    /// [`Guard`]. While any guard is alive, no chunk retired *after* the
    /// published epoch can be reused. Pins nest; only the outermost one
    /// publishes the epoch and attempts an epoch advance.
    pub fn pin(&self) -> Guard<'_> {
        let depth = self.depth.get();
        self.depth.set(depth + 1);
        if depth == 0 {
            let epoch = self.collector.current_epoch();
            // The publication must be ordered before any structure load
            // in the critical section, and the advance scan must see it.
            self.slot.store(epoch, Ordering::SeqCst);
            if self.seen.get() != epoch {
                self.flush(epoch);
                self.seen.set(epoch);
            }
            self.collector.try_advance();
        }
        Guard { handle: self }
    }

    /// Move the two-back limbo bucket onto the free lists. Entries there
    /// were retired at least two epoch boundaries ago, so no thread can
    /// still hold a reference.
    fn flush(&self, epoch: usize) {
        let mut caches = self.caches.borrow_mut();
        let bucket = (epoch + 1) % NUM_EPOCHS;
        let expired = std::mem::take(&mut caches.limbo[bucket]);
        for (id, ptr) in expired {
            let desc = caches.allocators[id.0];
            if let Some(hook) = desc.hook {
                unsafe { hook(ptr) };
            }
            caches.free[id.0].push(ptr);
        }
    }

    fn alloc(&self, id: AllocatorId) -> *mut u8 {
        let mut caches = self.caches.borrow_mut();
        if caches.allocators.len() <= id.0 {
            self.refresh_allocators(&mut caches);
        }
        if let Some(ptr) = caches.free[id.0].pop() {
            return ptr;
        }
        let layout = caches.allocators[id.0].layout;
        drop(caches);
        alloc_chunk(layout)
    }

    fn retire(&self, id: AllocatorId, ptr: *mut u8) {
        debug_assert!(self.depth.get() > 0, "retire outside a critical section");
        // Stamp with the epoch as of now, not as of pin time: a reader
        // pinned one epoch behind may have picked up a reference right
        // before the chunk was unlinked.
        let epoch = self.collector.current_epoch();
        let mut caches = self.caches.borrow_mut();
        if caches.allocators.len() <= id.0 {
            self.refresh_allocators(&mut caches);
        }
        caches.limbo[epoch % NUM_EPOCHS].push((id, ptr));
    }

    /// Pull allocator descriptors registered since the last snapshot.
    fn refresh_allocators(&self, caches: &mut Caches) {
        let table = self.collector.allocators.lock().unwrap();
        caches.allocators = table.clone();
        caches.free.resize_with(caches.allocators.len(), Vec::new);
    }
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        // Mark as inactive and remove from the registry.
        self.slot.store(QUIESCENT, Ordering::Release);
        {
            let mut threads = self.collector.threads.lock().unwrap();
            threads.retain(|t| !Arc::ptr_eq(t, &self.slot));
        }
        let caches = self.caches.get_mut();
        // Free-listed chunks are past their grace period.
        for (idx, list) in caches.free.iter().enumerate() {
            let layout = caches.allocators[idx].layout;
            for &ptr in list {
                unsafe { dealloc_chunk(ptr, layout) };
            }
        }
        // Limbo chunks may still be referenced by other threads; the
        // collector releases them at teardown.
        let mut orphans = self.collector.orphans.lock().unwrap();
        for bucket in &mut caches.limbo {
            orphans.append(bucket);
        }
    }
}

/// RAII proof that the current thread is pinned. Provides
/// [`alloc`](Guard::alloc) and [`retire`](Guard::retire).
pub struct Guard<'a> {
    handle: &'a LocalHandle,
}

impl Guard<'_> {
    /// Hand out a chunk for `id`: from the thread-local free list if one
    /// is available, freshly allocated (zeroed) otherwise. Free-listed
    /// chunks come back in the state the allocator's hook left them.
    pub fn alloc(&self, id: AllocatorId) -> *mut u8 {
        self.handle.alloc(id)
    }

    /// Schedule an unlinked chunk for reuse once it is safe. The chunk
    /// joins the current epoch's limbo bucket and reaches a free list no
    /// earlier than two epoch boundaries from now, after the allocator's
    /// hook has run.
    pub fn retire(&self, id: AllocatorId, ptr: *mut u8) {
        self.handle.retire(id, ptr)
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        let depth = self.handle.depth.get() - 1;
        self.handle.depth.set(depth);
        if depth == 0 {
            // Outermost unpin: back to quiescent.
            self.handle.slot.store(QUIESCENT, Ordering::Release);
        }
    }
}
