//! OS virtual memory abstraction.
//!
//! Every span the allocator owns is mapped through [`map_aligned`] with
//! `align` set to [`crate::config::SPAN_SIZE`], so a single mask on any
//! interior pointer recovers the span's base address. `mmap` and
//! `VirtualAlloc` only promise page granularity, so the Unix backend
//! over-allocates and trims; the Windows backend gets 64 KiB alignment for
//! free from its allocation granularity.

cfg_if::cfg_if! {
    if #[cfg(miri)] {
        mod miri;
        use miri as backend;
    } else if #[cfg(windows)] {
        mod windows;
        use windows as backend;
    } else if #[cfg(unix)] {
        mod unix;
        use unix as backend;
    }
}

/// Map `size` bytes of fresh, zeroed virtual memory aligned to `align`
/// (which must be a power of two). Returns null on failure.
///
/// # Safety
/// The caller must eventually pass the returned pointer to [`unmap`] with
/// the same `size`.
#[inline]
pub unsafe fn map_aligned(size: usize, align: usize) -> *mut u8 {
    unsafe { backend::map_aligned(size, align) }
}

/// Release virtual memory previously obtained from [`map_aligned`].
///
/// # Safety
/// `ptr`/`size` must match a still-live [`map_aligned`] call exactly.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    unsafe { backend::unmap(ptr, size) };
}

/// Advise the OS that `size` bytes at `ptr` can be discarded, keeping the
/// address range reserved. Used when a span is evicted from a cache rather
/// than fully unmapped.
///
/// # Safety
/// `ptr`/`size` must refer to a live range within a [`map_aligned`] mapping.
#[inline]
pub unsafe fn decommit(ptr: *mut u8, size: usize) {
    unsafe { backend::decommit(ptr, size) };
}

/// Recommit a range previously passed to [`decommit`].
///
/// # Safety
/// `ptr`/`size` must refer to a range previously decommitted and not since
/// unmapped.
#[inline]
pub unsafe fn recommit(ptr: *mut u8, size: usize) {
    cfg_if::cfg_if! {
        if #[cfg(windows)] {
            unsafe { backend::recommit(ptr, size) };
        } else {
            // madvise(MADV_DONTNEED) doesn't unmap; touching the range again
            // recommits it lazily. Nothing to do on unix/miri.
            let _ = (ptr, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SPAN_SIZE;

    #[test]
    fn alloc_is_span_aligned_and_zeroed() {
        unsafe {
            let ptr = map_aligned(SPAN_SIZE, SPAN_SIZE);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % SPAN_SIZE, 0);
            for i in 0..SPAN_SIZE {
                assert_eq!(*ptr.add(i), 0);
            }
            *ptr = 0xAA;
            *ptr.add(SPAN_SIZE - 1) = 0xBB;
            assert_eq!(*ptr, 0xAA);
            assert_eq!(*ptr.add(SPAN_SIZE - 1), 0xBB);
            unmap(ptr, SPAN_SIZE);
        }
    }

    #[test]
    fn alloc_multiple_spans_stays_aligned() {
        unsafe {
            let size = SPAN_SIZE * 8;
            let ptr = map_aligned(size, SPAN_SIZE);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % SPAN_SIZE, 0);
            unmap(ptr, size);
        }
    }
}
