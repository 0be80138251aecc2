//! Per-arena single-span cache: a bounded LIFO of one-unit spans awaiting
//! reuse. Touched only by the owning arena's thread — no locking.

use crate::config::MAX_CACHE_CAPACITY;
use crate::span::{self, Span};

/// A bounded stack of span pointers, backed by a fixed-size array sized to
/// [`MAX_CACHE_CAPACITY`]. The effective capacity is `limit`, set once from
/// [`crate::config::AllocatorConfig::cache_limit`] at arena construction.
pub struct SpanCache {
    buffer: [*mut Span; MAX_CACHE_CAPACITY],
    count: usize,
    limit: usize,
}

unsafe impl Send for SpanCache {}

impl SpanCache {
    pub const fn new(limit: usize) -> Self {
        Self {
            buffer: [core::ptr::null_mut(); MAX_CACHE_CAPACITY],
            count: 0,
            limit,
        }
    }

    /// Push a span onto the cache. Returns `false` (cache full) without
    /// touching the span if at capacity — the caller must unmap it.
    #[must_use]
    pub fn try_write(&mut self, span_ptr: *mut Span) -> bool {
        if self.count >= self.limit {
            return false;
        }
        self.buffer[self.count] = span_ptr;
        self.count += 1;
        true
    }

    /// Pop a span off the cache. If the popped span covers more than one
    /// unit (possible after a large-span split landed here), split off the
    /// first unit and push the remainder back before returning.
    pub fn try_read(&mut self) -> *mut Span {
        if self.count == 0 {
            return core::ptr::null_mut();
        }
        self.count -= 1;
        let span_ptr = self.buffer[self.count];
        let span_count = unsafe { (*span_ptr).span_count };
        if span_count > 1 {
            let (head, remaining) = unsafe { span::split(span_ptr, 1) };
            let wrote = self.try_write(remaining);
            debug_assert!(wrote, "span cache must have room after popping a slot");
            return head;
        }
        span_ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
