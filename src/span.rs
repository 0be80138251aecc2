//! The span: a 64 KiB-aligned region with an embedded header, a block
//! allocator, and the intrusive lists that tie it into an arena.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::arena::Arena;
use crate::config::{HEADER_SIZE, SPAN_ALIGN_MASK, SPAN_SIZE};
use crate::size_class::SizeClass;
use crate::sync::RwSpinLock;

/// Sentinel `class_idx` for spans that don't belong to the small/medium
/// table (one-span, large, and direct allocations).
pub const NOT_SMALL_MEDIUM: usize = usize::MAX;

/// A span header, written in place at the span's 64 KiB-aligned base.
///
/// Everything here is `Send`; a span's non-atomic fields (`free_list`,
/// `block_count`, `alloc_ptr`, `next`/`prev`) are only ever touched by the
/// owning arena's thread. Foreign threads interact exclusively through
/// `deferred_free_list`/`deferred_frees` (behind `deferred_lock`) and
/// `full`.
#[repr(C)]
pub struct Span {
    pub arena: *mut Arena,
    pub class_idx: usize,
    pub block_size: usize,
    pub block_max: usize,

    /// Owner-thread-only LIFO of freed blocks, linked through each block's
    /// first machine word.
    pub free_list: *mut u8,
    pub deferred_free_list: AtomicPtr<u8>,
    pub deferred_frees: AtomicUsize,
    deferred_lock: RwSpinLock,

    /// Outstanding (allocated, not locally freed) block count.
    pub block_count: usize,
    pub alloc_ptr: *mut u8,
    bump_limit: *mut u8,
    pub initial_ptr: *mut u8,
    pub alloc_size: usize,
    pub span_count: usize,

    pub next: *mut Span,
    pub prev: *mut Span,
    pub full: AtomicBool,
}

unsafe impl Send for Span {}

impl Span {
    /// Recover the header of the span containing `ptr` by masking to span
    /// alignment. `ptr` must point somewhere inside a live span's
    /// payload or header.
    #[inline]
    pub unsafe fn from_ptr(ptr: *const u8) -> *mut Span {
        ((ptr as usize) & SPAN_ALIGN_MASK) as *mut Span
    }

    /// Write a fresh small/medium span header at `base`.
    ///
    /// # Safety
    /// `base` must be a span-aligned, exclusively-owned region of at least
    /// `span_count * SPAN_SIZE` bytes.
    pub unsafe fn init_small_medium(
        base: *mut u8,
        arena: *mut Arena,
        class: &SizeClass,
        span_count: usize,
        initial_ptr: *mut u8,
        alloc_size: usize,
    ) -> *mut Span {
        let span_ptr = base as *mut Span;
        let payload = unsafe { base.add(HEADER_SIZE) };
        let bump_limit = unsafe { payload.add(class.block_max * class.block_size) };
        unsafe {
            span_ptr.write(Span {
                arena,
                class_idx: class.class_idx,
                block_size: class.block_size,
                block_max: class.block_max,
                free_list: core::ptr::null_mut(),
                deferred_free_list: AtomicPtr::new(core::ptr::null_mut()),
                deferred_frees: AtomicUsize::new(0),
                deferred_lock: RwSpinLock::new(),
                block_count: 0,
                alloc_ptr: payload,
                bump_limit,
                initial_ptr,
                alloc_size,
                span_count,
                next: core::ptr::null_mut(),
                prev: core::ptr::null_mut(),
                full: AtomicBool::new(false),
            });
        }
        span_ptr
    }

    /// Write a fresh one-span/large/direct span header at `base`: a single
    /// block covering the whole payload.
    ///
    /// # Safety
    /// Same requirements as [`Span::init_small_medium`].
    pub unsafe fn init_large(
        base: *mut u8,
        arena: *mut Arena,
        span_count: usize,
        initial_ptr: *mut u8,
        alloc_size: usize,
    ) -> *mut Span {
        let span_ptr = base as *mut Span;
        let payload = unsafe { base.add(HEADER_SIZE) };
        let block_size = span_count * SPAN_SIZE - HEADER_SIZE;
        unsafe {
            span_ptr.write(Span {
                arena,
                class_idx: NOT_SMALL_MEDIUM,
                block_size,
                block_max: 1,
                free_list: core::ptr::null_mut(),
                deferred_free_list: AtomicPtr::new(core::ptr::null_mut()),
                deferred_frees: AtomicUsize::new(0),
                deferred_lock: RwSpinLock::new(),
                block_count: 0,
                alloc_ptr: payload,
                bump_limit: unsafe { payload.add(block_size) },
                initial_ptr,
                alloc_size,
                span_count,
                next: core::ptr::null_mut(),
                prev: core::ptr::null_mut(),
                full: AtomicBool::new(false),
            });
        }
        span_ptr
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.span_count * SPAN_SIZE - HEADER_SIZE
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        (self as *const Span as usize) as *mut u8
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.block_count == self.deferred_frees.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.block_count == self.block_max && self.deferred_frees.load(Ordering::Relaxed) == 0
    }

    /// Local allocation. Must only be called by the
    /// owning thread.
    pub fn alloc_local(&mut self) -> *mut u8 {
        if !self.free_list.is_null() {
            let block = self.free_list;
            self.free_list = unsafe { *(block as *mut *mut u8) };
            self.block_count += 1;
            return block;
        }
        if self.deferred_frees.load(Ordering::Relaxed) > 0 {
            self.drain_deferred();
            if !self.free_list.is_null() {
                let block = self.free_list;
                self.free_list = unsafe { *(block as *mut *mut u8) };
                self.block_count += 1;
                return block;
            }
        }
        debug_assert!((self.alloc_ptr as usize) < self.bump_limit as usize);
        let block = self.alloc_ptr;
        self.alloc_ptr = unsafe { self.alloc_ptr.add(self.block_size) };
        self.block_count += 1;
        block
    }

    /// Move the deferred free list into the local free list under the
    /// writer lock.
    fn drain_deferred(&mut self) {
        let _guard = self.deferred_lock.write();
        let head = self.deferred_free_list.swap(core::ptr::null_mut(), Ordering::Acquire);
        if head.is_null() {
            return;
        }
        let n = self.deferred_frees.swap(0, Ordering::Relaxed);
        debug_assert!(self.free_list.is_null());
        self.free_list = head;
        self.block_count -= n;
    }

    /// Manually drain the deferred free list without allocating, for
    /// `thread_collect()`.
    pub fn collect_deferred(&mut self) {
        if self.deferred_frees.load(Ordering::Relaxed) == 0 {
            return;
        }
        let _guard = self.deferred_lock.write();
        let head = self.deferred_free_list.swap(core::ptr::null_mut(), Ordering::Acquire);
        if head.is_null() {
            return;
        }
        let n = self.deferred_frees.swap(0, Ordering::Relaxed);
        // Splice the drained chain onto the front of the existing free list
        // rather than assuming it's empty (thread_collect can run with a
        // partially-used free list already present).
        let mut tail = head;
        loop {
            let next = unsafe { *(tail as *mut *mut u8) };
            if next.is_null() {
                break;
            }
            tail = next;
        }
        unsafe { *(tail as *mut *mut u8) = self.free_list };
        self.free_list = head;
        self.block_count -= n;
    }

    /// Owner-thread local free.
    pub fn free_local(&mut self, block: *mut u8) {
        unsafe { *(block as *mut *mut u8) = self.free_list };
        self.free_list = block;
        self.block_count -= 1;
    }

    /// Cross-thread deferred push under the reader lock. Many
    /// foreign threads may call this concurrently; only the owner drains.
    pub fn free_deferred(&self, block: *mut u8) {
        let _guard = self.deferred_lock.read();
        loop {
            let head = self.deferred_free_list.load(Ordering::Relaxed);
            unsafe { *(block as *mut *mut u8) = head };
            if self
                .deferred_free_list
                .compare_exchange_weak(head, block, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            core::hint::spin_loop();
        }
        self.deferred_frees.fetch_add(1, Ordering::Relaxed);
    }
}

/// Split a span of `span.span_count` units into a `k`-unit head (returned
/// first) and a `span_count - k`-unit tail, each independently mappable
///.
///
/// # Safety
/// `span_ptr` must be a live, cache-resident large or one-span span with
/// `span_count > k > 0`.
pub unsafe fn split(span_ptr: *mut Span, k: usize) -> (*mut Span, *mut Span) {
    let (arena, total, initial_ptr, alloc_size, base) = unsafe {
        let span = &*span_ptr;
        (span.arena, span.span_count, span.initial_ptr, span.alloc_size, span.base())
    };
    debug_assert!(k > 0 && k < total);

    let tail_base = unsafe { base.add(k * SPAN_SIZE) };
    let tail_count = total - k;
    let tail_alloc_size = tail_count * SPAN_SIZE;
    let head_alloc_size = alloc_size - tail_alloc_size;

    let tail_ptr = unsafe { Span::init_large(tail_base, arena, tail_count, tail_base, tail_alloc_size) };
    let head_ptr = unsafe { Span::init_large(base, arena, k, initial_ptr, head_alloc_size) };
    (head_ptr, tail_ptr)
}

/// A doubly-linked list of partially-used spans, owned by exactly one
/// arena/size-class pair and touched only by the owning thread.
pub struct SpanList {
    head: *mut Span,
    tail: *mut Span,
}

unsafe impl Send for SpanList {}

impl SpanList {
    pub const fn new() -> Self {
        Self {
            head: core::ptr::null_mut(),
            tail: core::ptr::null_mut(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Return the head without removing it.
    #[inline]
    pub fn try_read(&self) -> *mut Span {
        self.head
    }

    /// Pop the head span off the list.
    pub fn remove_head(&mut self) -> *mut Span {
        let head = self.head;
        if head.is_null() {
            return core::ptr::null_mut();
        }
        self.remove(head);
        head
    }

    /// Unlink an arbitrary span from the list.
    pub fn remove(&mut self, span_ptr: *mut Span) {
        let span = unsafe { &mut *span_ptr };
        let (prev, next) = (span.prev, span.next);
        if prev.is_null() {
            self.head = next;
        } else {
            unsafe { (*prev).next = next };
        }
        if next.is_null() {
            self.tail = prev;
        } else {
            unsafe { (*next).prev = prev };
        }
        span.next = core::ptr::null_mut();
        span.prev = core::ptr::null_mut();
    }

    /// Append a single span at the tail.
    pub fn write(&mut self, span_ptr: *mut Span) {
        let span = unsafe { &mut *span_ptr };
        span.next = core::ptr::null_mut();
        span.prev = self.tail;
        if self.tail.is_null() {
            self.head = span_ptr;
        } else {
            unsafe { (*self.tail).next = span_ptr };
        }
        self.tail = span_ptr;
    }

    /// Append a pre-linked chain of spans (head..tail, `next`-linked) in one
    /// shot, used to bulk-transfer a drained deferred-partials chain.
    pub fn write_linked(&mut self, chain_head: *mut Span) {
        if chain_head.is_null() {
            return;
        }
        unsafe { (*chain_head).prev = self.tail };
        let mut cursor = chain_head;
        loop {
            let next = unsafe { (*cursor).next };
            if next.is_null() {
                break;
            }
            unsafe { (*next).prev = cursor };
            cursor = next;
        }
        if self.tail.is_null() {
            self.head = chain_head;
        } else {
            unsafe { (*self.tail).next = chain_head };
        }
        self.tail = cursor;
    }

    /// Unlink every empty span in the list and return them linked together
    /// through `next`.
    pub fn get_empty_spans(&mut self) -> *mut Span {
        let mut reclaimed_head: *mut Span = core::ptr::null_mut();
        let mut reclaimed_tail: *mut Span = core::ptr::null_mut();
        let mut cursor = self.head;
        while !cursor.is_null() {
            let next = unsafe { (*cursor).next };
            if unsafe { (*cursor).is_empty() } {
                self.remove(cursor);
                unsafe { (*cursor).next = core::ptr::null_mut() };
                if reclaimed_tail.is_null() {
                    reclaimed_head = cursor;
                } else {
                    unsafe { (*reclaimed_tail).next = cursor };
                }
                reclaimed_tail = cursor;
            }
            cursor = next;
        }
        reclaimed_head
    }
}

/// A per-(arena, size-class) atomic LIFO of whole spans, used to hand
/// partial spans back to the owning arena from a foreign thread.
///
/// Pushes are lock-free CAS loops; the owner drains by swapping the head
/// with null, taking the entire chain in one step.
pub struct DeferredSpanList {
    head: AtomicPtr<Span>,
}

unsafe impl Send for DeferredSpanList {}
unsafe impl Sync for DeferredSpanList {}

impl DeferredSpanList {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Push a span onto the list. Callable from any thread.
    pub fn push(&self, span_ptr: *mut Span) {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            unsafe { (*span_ptr).next = head };
            if self
                .head
                .compare_exchange_weak(head, span_ptr, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            core::hint::spin_loop();
        }
    }

    /// Atomically take the whole chain, leaving the list empty. Only the
    /// owning arena's thread should call this.
    pub fn drain(&self) -> *mut Span {
        self.head.swap(core::ptr::null_mut(), Ordering::Acquire)
    }
}
