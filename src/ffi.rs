//! C-ABI exports for `LD_PRELOAD`/`cdylib` use.
//!
//! Gated behind `features = ["preload"]`. Built as part of a `cdylib` that
//! stands in for the platform's `libc` allocator symbols. A consumer that
//! only wants `#[global_allocator] = spanmalloc::SpanMalloc` in an ordinary
//! Rust binary does not need this module at all.
//!
//! With the `testing` feature, exports are renamed `spanmalloc_*` so a
//! preload build can be linked into a test binary alongside the system
//! allocator without symbol collisions; without it, exports plain libc
//! names for genuine `LD_PRELOAD` use.

use core::ffi::c_int;

use crate::allocator;
use crate::config::AlignedReallocFlags;

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(feature = "testing", unsafe(export_name = "spanmalloc_malloc"))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
    allocator::allocate(size)
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(feature = "testing", unsafe(export_name = "spanmalloc_free"))]
pub unsafe extern "C" fn free(ptr: *mut u8) {
    allocator::free(ptr)
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(feature = "testing", unsafe(export_name = "spanmalloc_calloc"))]
pub unsafe extern "C" fn calloc(num: usize, size: usize) -> *mut u8 {
    allocator::calloc(num, size)
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(feature = "testing", unsafe(export_name = "spanmalloc_realloc"))]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    allocator::realloc(ptr, size)
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(feature = "testing", unsafe(export_name = "spanmalloc_aligned_alloc"))]
pub unsafe extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut u8 {
    allocator::aligned_alloc(align, size)
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(feature = "testing", unsafe(export_name = "spanmalloc_memalign"))]
pub unsafe extern "C" fn memalign(align: usize, size: usize) -> *mut u8 {
    allocator::memalign(align, size)
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(feature = "testing", unsafe(export_name = "spanmalloc_posix_memalign"))]
pub unsafe extern "C" fn posix_memalign(out: *mut *mut u8, align: usize, size: usize) -> c_int {
    let out = unsafe { &mut *out };
    allocator::posix_memalign(out, align, size)
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(feature = "testing", unsafe(export_name = "spanmalloc_malloc_usable_size"))]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
    allocator::usable_size(ptr)
}

/// Not part of libc's surface; exported under the crate's own name so a
/// preload build can still service an `aligned_realloc`-style caller.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn spanmalloc_aligned_realloc(
    ptr: *mut u8,
    align: usize,
    size: usize,
    oldsize: usize,
    no_move: c_int,
) -> *mut u8 {
    let flags = if no_move != 0 {
        AlignedReallocFlags::NO_MOVE
    } else {
        AlignedReallocFlags::empty()
    };
    allocator::aligned_realloc(ptr, align, size, oldsize, flags)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spanmalloc_initialize() -> c_int {
    match allocator::init() {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spanmalloc_finalize() {
    allocator::deinit()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spanmalloc_thread_initialize() {
    allocator::thread_init()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spanmalloc_thread_finalize(release_caches: c_int) {
    allocator::thread_deinit(release_caches != 0)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spanmalloc_thread_collect() {
    allocator::thread_collect()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn spanmalloc_is_thread_initialized() -> c_int {
    allocator::is_thread_initialized() as c_int
}

/// Forces the linker to keep this translation unit's `#[no_mangle]` exports
/// when the crate is linked as a static archive rather than a `cdylib`.
#[used]
static LINKER_REFERENCE: unsafe extern "C" fn() -> c_int = spanmalloc_initialize;

/* -----------------------------------------------------------
  Process/thread integration
----------------------------------------------------------- */

#[cfg(unix)]
mod unix_integration {
    use super::*;
    use core::mem::MaybeUninit;
    use core::sync::atomic::{AtomicUsize, Ordering};

    type PthreadKeyT = libc::pthread_key_t;
    type StartRoutine = unsafe extern "C" fn(*mut core::ffi::c_void) -> *mut core::ffi::c_void;
    type PthreadCreateFn = unsafe extern "C" fn(
        *mut libc::pthread_t,
        *const libc::pthread_attr_t,
        StartRoutine,
        *mut core::ffi::c_void,
    ) -> c_int;

    static DESTRUCTOR_KEY: AtomicUsize = AtomicUsize::new(usize::MAX);
    static ORIG_PTHREAD_CREATE: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn thread_destructor(_value: *mut core::ffi::c_void) {
        allocator::thread_deinit(true);
    }

    /// Runs once at load time via `__attribute__((constructor))`: creates
    /// the thread-destructor key and calls `init()`.
    #[used]
    #[link_section = ".init_array"]
    static CONSTRUCTOR: unsafe extern "C" fn() = run_constructor;

    unsafe extern "C" fn run_constructor() {
        let mut key: MaybeUninit<PthreadKeyT> = MaybeUninit::uninit();
        let rc = unsafe { libc::pthread_key_create(key.as_mut_ptr(), Some(thread_destructor)) };
        if rc == 0 {
            let key = unsafe { key.assume_init() };
            DESTRUCTOR_KEY.store(key as usize, Ordering::Release);
        } else {
            log::warn!("spanmalloc: pthread_key_create failed (rc={rc}), thread-exit cleanup disabled");
        }

        if let Err(err) = allocator::init() {
            log::warn!("spanmalloc: init() at load time failed: {err}");
        }
    }

    /// Interposes `pthread_create`: every newly created thread gets
    /// `pthread_setspecific` called with a non-null sentinel so the
    /// destructor registered in `run_constructor` fires on thread exit,
    /// releasing that thread's arena back to the pool.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn pthread_create(
        thread: *mut libc::pthread_t,
        attr: *const libc::pthread_attr_t,
        start_routine: StartRoutine,
        arg: *mut core::ffi::c_void,
    ) -> c_int {
        let orig = unsafe { resolve_orig_pthread_create() };
        let key = DESTRUCTOR_KEY.load(Ordering::Acquire);
        if key != usize::MAX {
            unsafe {
                libc::pthread_setspecific(key as PthreadKeyT, 1usize as *const core::ffi::c_void)
            };
        }
        unsafe { orig(thread, attr, start_routine, arg) }
    }

    unsafe fn resolve_orig_pthread_create() -> PthreadCreateFn {
        let cached = ORIG_PTHREAD_CREATE.load(Ordering::Acquire);
        if cached != 0 {
            return unsafe { core::mem::transmute::<usize, PthreadCreateFn>(cached) };
        }
        let name = c"pthread_create";
        let resolved = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
        debug_assert!(!resolved.is_null(), "libc must export pthread_create");
        ORIG_PTHREAD_CREATE.store(resolved as usize, Ordering::Release);
        unsafe { core::mem::transmute::<*mut core::ffi::c_void, PthreadCreateFn>(resolved) }
    }
}
