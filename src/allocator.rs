//! The allocator front-end: dispatches a request size to
//! {small, medium, one-span, large-span, direct} and routes frees to the
//! owning arena via the span header. Also owns process/thread lifecycle:
//! `init`, `deinit`, `thread_init`, `thread_deinit`, and the arena
//! registry that recycles arenas across thread termination.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::arena::Arena;
use crate::config::{
    AlignedReallocFlags, AllocatorConfig, AllocatorError, LARGE_CLASS_COUNT, MEDIUM_MAX, SMALL_MAX,
    SPAN_MAX, SPAN_SIZE,
};
use crate::platform;
use crate::span::Span;
use crate::stats;
use crate::sync::SpinMutex;

/// One node of the process-wide free list of detached arenas. An arena becomes detached when its owning
/// thread calls `thread_deinit`; a later `thread_init` adopts one from
/// this list before resorting to allocating a brand new arena.
struct ArenaPool {
    free: SpinMutex<*mut ArenaNode>,
}

struct ArenaNode {
    arena: *mut Arena,
    next: *mut ArenaNode,
}

unsafe impl Send for ArenaPool {}
unsafe impl Sync for ArenaPool {}

impl ArenaPool {
    const fn new() -> Self {
        Self {
            free: SpinMutex::new(ptr::null_mut()),
        }
    }

    fn push(&self, arena: *mut Arena) {
        let node = alloc_node(ArenaNode {
            arena,
            next: ptr::null_mut(),
        });
        let mut head = self.free.lock();
        unsafe { (*node).next = *head };
        *head = node;
    }

    fn pop(&self) -> *mut Arena {
        let mut head = self.free.lock();
        let node = *head;
        if node.is_null() {
            return ptr::null_mut();
        }
        *head = unsafe { (*node).next };
        let arena = unsafe { (*node).arena };
        free_node(node);
        arena
    }
}

/// Place `value` in a fresh OS mapping sized and aligned to `T` and return
/// an owning pointer to it. Bookkeeping structures (arenas, pool nodes) are
/// obtained this way rather than through `alloc`/`Box`: this allocator may
/// itself be the process's `#[global_allocator]`, and routing its own
/// internal bookkeeping through that would recurse back into `allocate`
/// before the calling thread's arena even exists.
fn map_value<T>(value: T) -> *mut T {
    let base = unsafe {
        platform::map_aligned(core::mem::size_of::<T>(), core::mem::align_of::<T>())
    };
    if base.is_null() {
        return ptr::null_mut();
    }
    let typed = base as *mut T;
    unsafe { typed.write(value) };
    typed
}

/// Undo [`map_value`]. The value is dropped in place before the backing
/// mapping is released.
unsafe fn unmap_value<T>(value: *mut T) {
    unsafe {
        ptr::drop_in_place(value);
        platform::unmap(value as *mut u8, core::mem::size_of::<T>());
    }
}

fn alloc_node(node: ArenaNode) -> *mut ArenaNode {
    map_value(node)
}

fn free_node(node: *mut ArenaNode) {
    unsafe { unmap_value(node) };
}

fn new_arena(config: AllocatorConfig) -> *mut Arena {
    map_value(Arena::new(config))
}

static ARENA_POOL: ArenaPool = ArenaPool::new();
static CONFIG: SpinMutex<AllocatorConfig> = SpinMutex::new(AllocatorConfig::new_default());
static INITIALIZED: AtomicBool = AtomicBool::new(false);
/// The first thread to call `thread_init` claims this arena directly,
/// avoiding a pool round-trip for the overwhelmingly common single-arena
/// process.
static BASE_ARENA: AtomicPtr<Arena> = AtomicPtr::new(ptr::null_mut());
static BASE_ARENA_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Thread-local slot holding the calling thread's arena. Wrapped in a type
/// with a `Drop` impl (rather than a bare `Cell`) so that a thread which
/// exits without calling `thread_deinit` explicitly — the common case for
/// a `#[global_allocator]`-only consumer that never links the `preload`
/// feature's `pthread_create` shim — still returns its arena to the pool
/// via `std`'s thread-local destructor order.
struct ThreadArenaSlot {
    arena: core::cell::Cell<*mut Arena>,
}

impl Drop for ThreadArenaSlot {
    fn drop(&mut self) {
        let arena = self.arena.get();
        if !arena.is_null() {
            ARENA_POOL.push(arena);
        }
    }
}

std::thread_local! {
    static THREAD_ARENA: ThreadArenaSlot = const {
        ThreadArenaSlot { arena: core::cell::Cell::new(ptr::null_mut()) }
    };
}

/// Initialize the allocator with the default configuration. Must be
/// called at most once per process; a constructor does this automatically
/// under the `preload` feature.
pub fn init() -> Result<(), AllocatorError> {
    init_with_config(AllocatorConfig::default())
}

/// Initialize the allocator with an explicit configuration. The
/// configuration is immutable for the remainder of the process.
pub fn init_with_config(config: AllocatorConfig) -> Result<(), AllocatorError> {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return Err(AllocatorError::AlreadyInitialized);
    }
    let normalized = config.normalized();
    *CONFIG.lock() = normalized;
    log::debug!("spanmalloc: initialized ({normalized:?})");
    Ok(())
}

/// Tear down process-wide state. Does not attempt to reclaim per-thread
/// arenas still bound to live threads — callers are expected to have
/// already joined every allocating thread.
pub fn deinit() {
    INITIALIZED.store(false, Ordering::Release);
    BASE_ARENA_CLAIMED.store(false, Ordering::Release);
    BASE_ARENA.store(ptr::null_mut(), Ordering::Release);
    while !ARENA_POOL.pop().is_null() {}
}

/// Bind an arena to the calling thread: the base arena if unclaimed,
/// otherwise one adopted from the detached-arena pool, otherwise a freshly
/// allocated one.
pub fn thread_init() {
    THREAD_ARENA.with(|slot| {
        if !slot.arena.get().is_null() {
            return;
        }
        let config = *CONFIG.lock();
        let arena = if !BASE_ARENA_CLAIMED.swap(true, Ordering::AcqRel) {
            let base = new_arena(config);
            BASE_ARENA.store(base, Ordering::Release);
            base
        } else {
            let pooled = ARENA_POOL.pop();
            if pooled.is_null() {
                log::debug!("spanmalloc: arena pool empty, mapping a fresh arena");
                new_arena(config)
            } else {
                pooled
            }
        };
        slot.arena.set(arena);
    });
}

/// Detach the calling thread's arena, optionally releasing every cached
/// (idle) span back to the OS first, and return the arena to the pool for
/// a future thread to adopt.
pub fn thread_deinit(release_caches: bool) {
    THREAD_ARENA.with(|slot| {
        let arena = slot.arena.get();
        if arena.is_null() {
            return;
        }
        log::debug!("spanmalloc: thread releasing arena (release_caches={release_caches})");
        if release_caches {
            unsafe { (*arena).release_caches() };
        }
        ARENA_POOL.push(arena);
        slot.arena.set(ptr::null_mut());
    });
}

/// Drain every span's deferred free list for the calling thread's arena
/// without allocating.
pub fn thread_collect() {
    with_arena(|arena| unsafe { (*arena).collect_deferred() });
}

pub fn is_thread_initialized() -> bool {
    THREAD_ARENA.with(|slot| !slot.arena.get().is_null())
}

/// The configuration the allocator was initialized with, useful for
/// assertions in tests. Reflects the normalized values, not necessarily
/// what was passed to `init_with_config`.
pub fn config() -> AllocatorConfig {
    *CONFIG.lock()
}

#[inline]
fn with_arena<R>(f: impl FnOnce(*mut Arena) -> R) -> R {
    THREAD_ARENA.with(|slot| {
        if slot.arena.get().is_null() {
            thread_init();
        }
        f(slot.arena.get())
    })
}

/* -----------------------------------------------------------
  Front-end dispatch
----------------------------------------------------------- */

/// Allocate at least `size` bytes. Returns null on OS mapping failure.
pub fn allocate(size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }
    let ptr = with_arena(|arena_ptr| {
        let arena = unsafe { &mut *arena_ptr };
        if size <= SMALL_MAX {
            arena.allocate_to_span(crate::size_class::small_class(size))
        } else if size <= MEDIUM_MAX {
            arena.allocate_to_span(crate::size_class::medium_class(size))
        } else if size <= SPAN_MAX {
            arena.allocate_one_span()
        } else if size <= crate::config::LARGE_MAX {
            arena.allocate_to_large_span(size.div_ceil(SPAN_SIZE))
        } else {
            arena.allocate_direct(size.div_ceil(SPAN_SIZE))
        }
    });
    if !ptr.is_null() {
        stats::record_alloc();
    } else {
        log::warn!("spanmalloc: allocation of {size} bytes failed (OS mapping exhausted?)");
    }
    ptr
}

/// Free a block returned by [`allocate`] (or any of the other allocation
/// entry points). Null, or a pointer whose span has `span_count == 0`, is
/// silently ignored.
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let span_ptr = unsafe { Span::from_ptr(ptr) };
    let span_count = unsafe { (*span_ptr).span_count };
    if span_count == 0 {
        return;
    }

    let owner = unsafe { (*span_ptr).arena };
    let block_size = unsafe { (*span_ptr).block_size };

    if span_count == 1 && block_size <= MEDIUM_MAX {
        with_arena(|caller_ptr| {
            if owner == caller_ptr {
                unsafe { (*caller_ptr).free_local(span_ptr, ptr) };
            } else {
                unsafe { Arena::free_deferred(owner, span_ptr, ptr) };
            }
        });
    } else if span_count == 1 {
        with_arena(|caller_ptr| {
            debug_assert_eq!(owner, caller_ptr, "one-span frees are never cross-thread here");
            unsafe { (*caller_ptr).free_one_span(span_ptr) };
        });
    } else if span_count <= LARGE_CLASS_COUNT {
        with_arena(|caller_ptr| {
            debug_assert_eq!(owner, caller_ptr);
            unsafe { (*caller_ptr).free_large_span(span_ptr) };
        });
    } else {
        with_arena(|caller_ptr| {
            debug_assert_eq!(owner, caller_ptr);
            unsafe { (*caller_ptr).free_direct(span_ptr) };
        });
    }
    stats::record_dealloc();
}

/// Allocate `num * size` bytes, zeroed.
pub fn calloc(num: usize, size: usize) -> *mut u8 {
    let total = match num.checked_mul(size) {
        Some(t) => t,
        None => return ptr::null_mut(),
    };
    let ptr = allocate(total);
    if !ptr.is_null() {
        unsafe { ptr::write_bytes(ptr, 0, total) };
    }
    ptr
}

/// Reallocate `ptr` (previously `oldsize` bytes, unknown here, we derive
/// the real usable size from the span) to at least `size` bytes. Reallocation
/// always uses the *caller's* arena, followed by a
/// cross-arena free of the old pointer when it differed.
pub fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return allocate(size);
    }
    if size == 0 {
        free(ptr);
        return ptr::null_mut();
    }

    let old_usable = usable_size(ptr);
    if size <= old_usable {
        return ptr;
    }

    let new_ptr = allocate(size);
    if new_ptr.is_null() {
        return ptr::null_mut();
    }
    unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_usable) };
    free(ptr);
    new_ptr
}

/// Allocate `size` bytes aligned to `align` (a power of two, a multiple of
/// `size_of::<*const ()>()`, and strictly less than the span size).
pub fn aligned_alloc(align: usize, size: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two());
    debug_assert!(align < SPAN_SIZE);
    if align <= core::mem::size_of::<usize>() {
        return allocate(size);
    }
    // The caller's class must both hold `size` bytes and land naturally on
    // an `align` boundary; the simplest way to guarantee that from our
    // bump-pointer/free-list spans is to request a block whose size is
    // itself a multiple of `align` at least as big as `size`, which our
    // small/medium tables preserve power-of-two classes for.
    let padded = size.next_multiple_of(align).max(align);
    let ptr = allocate(padded);
    debug_assert!(ptr.is_null() || (ptr as usize) % align == 0);
    ptr
}

/// `aligned_alloc`, zeroed.
pub fn aligned_calloc(align: usize, num: usize, size: usize) -> *mut u8 {
    let total = match num.checked_mul(size) {
        Some(t) => t,
        None => return ptr::null_mut(),
    };
    let ptr = aligned_alloc(align, total);
    if !ptr.is_null() {
        unsafe { ptr::write_bytes(ptr, 0, total) };
    }
    ptr
}

/// POSIX `memalign`: alias of [`aligned_alloc`].
pub fn memalign(align: usize, size: usize) -> *mut u8 {
    aligned_alloc(align, size)
}

/// POSIX `posix_memalign`. Returns `0` and writes `*out` on success, or a
/// positive `errno`-style value (`EINVAL`/`ENOMEM`) on failure, leaving
/// `*out` untouched.
pub fn posix_memalign(out: &mut *mut u8, align: usize, size: usize) -> i32 {
    const EINVAL: i32 = 22;
    const ENOMEM: i32 = 12;
    if !align.is_power_of_two() || align % core::mem::size_of::<usize>() != 0 {
        return EINVAL;
    }
    let ptr = aligned_alloc(align, size);
    if ptr.is_null() && size != 0 {
        return ENOMEM;
    }
    *out = ptr;
    0
}

/// Reallocate `ptr` (of `oldsize` bytes, `align`-aligned) to `size` bytes
/// at the same (or a freshly chosen) alignment. With
/// `AlignedReallocFlags::NO_MOVE` set, returns null rather than relocating
/// when the request cannot be satisfied in place.
pub fn aligned_realloc(
    ptr: *mut u8,
    align: usize,
    size: usize,
    oldsize: usize,
    flags: AlignedReallocFlags,
) -> *mut u8 {
    if ptr.is_null() {
        return aligned_alloc(align, size);
    }
    if size == 0 {
        free(ptr);
        return ptr::null_mut();
    }

    let already_aligned = (ptr as usize) % align == 0;
    let old_usable = usable_size(ptr);
    if already_aligned && size <= old_usable {
        return ptr;
    }
    if flags.contains(AlignedReallocFlags::NO_MOVE) {
        return ptr::null_mut();
    }

    let new_ptr = aligned_alloc(align, size);
    if new_ptr.is_null() {
        return ptr::null_mut();
    }
    let copy_len = oldsize.min(old_usable).min(size);
    unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, copy_len) };
    free(ptr);
    new_ptr
}

/// The usable size of a live allocation: the block size of its span's
/// class for small/medium spans, or the full payload for one-span/large/
/// direct spans.
pub fn usable_size(ptr: *mut u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let span_ptr = unsafe { Span::from_ptr(ptr) };
    if unsafe { (*span_ptr).span_count } == 0 {
        return 0;
    }
    unsafe { (*span_ptr).block_size }
}

/* -----------------------------------------------------------
  GlobalAlloc
----------------------------------------------------------- */

/// Process-wide allocator, usable as `#[global_allocator]`.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: spanmalloc::SpanMalloc = spanmalloc::SpanMalloc;
/// ```
pub struct SpanMalloc;

unsafe impl GlobalAlloc for SpanMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= core::mem::size_of::<usize>() {
            allocate(layout.size())
        } else {
            aligned_alloc(layout.align(), layout.size())
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= core::mem::size_of::<usize>() {
            calloc(1, layout.size())
        } else {
            aligned_calloc(layout.align(), 1, layout.size())
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= core::mem::size_of::<usize>() {
            realloc(ptr, new_size)
        } else {
            aligned_realloc(ptr, layout.align(), new_size, layout.size(), AlignedReallocFlags::empty())
        }
    }
}
