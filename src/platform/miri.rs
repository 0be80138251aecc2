//! Miri-compatible backend using the system allocator as backing store.
//!
//! Miri cannot execute real `mmap`/`VirtualAlloc` syscalls, so this shim
//! uses `std::alloc` to provide aligned memory, which lets Miri check the
//! unsafe pointer logic everywhere else in the allocator.

extern crate alloc;

use core::alloc::Layout;

pub unsafe fn map_aligned(size: usize, align: usize) -> *mut u8 {
    let layout = Layout::from_size_align(size, align).unwrap();
    unsafe { alloc::alloc::alloc_zeroed(layout) }
}

pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    // align doesn't affect deallocation layout validity for our purposes;
    // the allocator always frees with the same size/align it mapped with.
    let layout = Layout::from_size_align(size, crate::config::SPAN_SIZE).unwrap();
    unsafe { alloc::alloc::dealloc(ptr, layout) };
}

pub unsafe fn decommit(_ptr: *mut u8, _size: usize) {}
