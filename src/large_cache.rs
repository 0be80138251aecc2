//! Per-arena large-span cache: one bounded Vyukov MPSC array queue per
//! large span-count. Index `i` holds spans of exactly `i + 2` units
//! — one queue per entry in `2..=LARGE_CLASS_COUNT`.
//!
//! Any thread may enqueue (freeing a large span whose arena isn't theirs);
//! only the owning arena's thread ever dequeues.

use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::config::MAX_LARGE_CACHE_CAPACITY;
use crate::span::Span;

struct Cell {
    seq: AtomicUsize,
    span: AtomicPtr<Span>,
}

/// A single bounded MPSC queue, sized to [`MAX_LARGE_CACHE_CAPACITY`] slots.
/// Only the first `mask + 1` slots (`mask` set from
/// [`crate::config::AllocatorConfig::large_cache_limit`]) are ever used;
/// the rest of the array is dead space kept so the struct can live in a
/// fixed-size per-arena array without per-arena heap allocation.
pub struct LargeSpanCache {
    buffer: [Cell; MAX_LARGE_CACHE_CAPACITY],
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

impl LargeSpanCache {
    /// `capacity` must be a power of two, `<= MAX_LARGE_CACHE_CAPACITY`.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two() && capacity <= MAX_LARGE_CACHE_CAPACITY);
        let buffer = core::array::from_fn(|i| Cell {
            seq: AtomicUsize::new(i),
            span: AtomicPtr::new(core::ptr::null_mut()),
        });
        Self {
            buffer,
            mask: capacity - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    /// Enqueue (any number of concurrent producers). Returns `false` if the
    /// queue is full.
    #[must_use]
    pub fn try_write(&self, span_ptr: *mut Span) -> bool {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        let cell = loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.seq.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                if self
                    .enqueue_pos
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    break cell;
                }
            } else if diff < 0 {
                return false;
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        };
        cell.span.store(span_ptr, Ordering::Relaxed);
        cell.seq.store(pos + 1, Ordering::Release);
        true
    }

    /// Dequeue. The caller must be the sole consumer (the owning arena's
    /// thread). Returns null if empty.
    pub fn try_read(&self) -> *mut Span {
        let dequeue_pos = self.dequeue_pos.load(Ordering::Relaxed);
        let cell = &self.buffer[dequeue_pos & self.mask];
        let seq = cell.seq.load(Ordering::Acquire);
        let diff = seq as isize - (dequeue_pos + 1) as isize;
        if diff != 0 {
            return core::ptr::null_mut();
        }
        let span_ptr = cell.span.load(Ordering::Relaxed);
        self.dequeue_pos.store(dequeue_pos + 1, Ordering::Relaxed);
        cell.seq.store(dequeue_pos + self.mask + 1, Ordering::Release);
        span_ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SPAN_SIZE;
    use crate::platform;

    unsafe fn large_span(units: usize) -> *mut Span {
        unsafe {
            let base = platform::map_aligned(SPAN_SIZE * units, SPAN_SIZE);
            Span::init_large(base, core::ptr::null_mut(), units, base, SPAN_SIZE * units)
        }
    }

    #[test]
    fn bounded_write_then_read_is_exhaustive() {
        let cache = LargeSpanCache::new(4);
        unsafe {
            let spans: alloc::vec::Vec<_> = (0..4).map(|_| large_span(2)).collect();
            for &s in &spans {
                assert!(cache.try_write(s));
            }
            assert!(!cache.try_write(large_span(2)));
            for &s in &spans {
                assert_eq!(cache.try_read(), s);
            }
            assert!(cache.try_read().is_null());
            for s in spans {
                platform::unmap((*s).base(), SPAN_SIZE * 2);
            }
        }
    }

    #[test]
    fn pop_then_push_reuses_freed_slot() {
        let cache = LargeSpanCache::new(2);
        unsafe {
            let s1 = large_span(3);
            let s2 = large_span(3);
            assert!(cache.try_write(s1));
            assert!(cache.try_write(s2));
            assert!(!cache.try_write(large_span(3)));
            assert_eq!(cache.try_read(), s1);
            let s3 = large_span(3);
            assert!(cache.try_write(s3));
            assert_eq!(cache.try_read(), s2);
            assert_eq!(cache.try_read(), s3);
            platform::unmap((*s1).base(), SPAN_SIZE * 3);
            platform::unmap((*s2).base(), SPAN_SIZE * 3);
            platform::unmap((*s3).base(), SPAN_SIZE * 3);
        }
    }
}
