//! Lightweight synchronization primitives for use in the allocator.
//!
//! We cannot use `std::sync::Mutex` because it allocates. Instead we provide
//! a simple test-and-set spinlock and a `SpinMutex<T>` wrapper.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A simple test-and-set spinlock.
pub struct SpinLock {
    locked: AtomicBool,
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            // Spin while locked (read-only, doesn't invalidate cache line)
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

unsafe impl Send for SpinLock {}
unsafe impl Sync for SpinLock {}

/// A mutex that uses a spinlock for synchronization.
/// Does not allocate and can be used in a `static`.
pub struct SpinMutex<T> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

impl<T> SpinMutex<T> {
    pub const fn new(val: T) -> Self {
        Self {
            lock: SpinLock::new(),
            data: UnsafeCell::new(val),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        self.lock.lock();
        SpinMutexGuard { mutex: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self.lock.try_lock() {
            Some(SpinMutexGuard { mutex: self })
        } else {
            None
        }
    }
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

/// RAII guard for `SpinMutex`. Unlocks on drop.
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

/// A reader/writer spinlock with no blocking: readers spin against the
/// writer bit, the writer spins until the reader count drops to zero.
///
/// Used to gate a span's deferred free list: many foreign threads
/// may hold the read side concurrently to push a deferred free, while the
/// owning thread takes the write side exclusively to drain the list. This
/// is not a fair lock — it is sized for very short critical sections (a
/// handful of instructions), never for anything that blocks.
pub struct RwSpinLock {
    /// High bit (`WRITER_BIT`) set while a writer holds the lock; the rest
    /// of the word counts concurrent readers.
    state: AtomicBool,
    readers: core::sync::atomic::AtomicUsize,
}

impl Default for RwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwSpinLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicBool::new(false),
            readers: core::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Acquire the read side. Many readers may hold it concurrently; it is
    /// only excluded by an in-progress writer.
    #[inline]
    pub fn read(&self) -> RwSpinReadGuard<'_> {
        loop {
            while self.state.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
            self.readers.fetch_add(1, Ordering::Acquire);
            if !self.state.load(Ordering::Relaxed) {
                return RwSpinReadGuard { lock: self };
            }
            // A writer snuck in between the check and the increment; back off.
            self.readers.fetch_sub(1, Ordering::Release);
        }
    }

    /// Acquire the write side exclusively: waits for the writer bit to be
    /// free, then for every outstanding reader to drop off.
    #[inline]
    pub fn write(&self) -> RwSpinWriteGuard<'_> {
        loop {
            if self
                .state
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            core::hint::spin_loop();
        }
        while self.readers.load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }
        RwSpinWriteGuard { lock: self }
    }
}

unsafe impl Send for RwSpinLock {}
unsafe impl Sync for RwSpinLock {}

pub struct RwSpinReadGuard<'a> {
    lock: &'a RwSpinLock,
}

impl Drop for RwSpinReadGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.readers.fetch_sub(1, Ordering::Release);
    }
}

pub struct RwSpinWriteGuard<'a> {
    lock: &'a RwSpinLock,
}

impl Drop for RwSpinWriteGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.state.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use std::sync::Arc;

    #[test]
    fn rwspinlock_readers_concurrent_writer_exclusive() {
        let lock = RwSpinLock::new();
        {
            let _r1 = lock.read();
            let _r2 = lock.read();
        }
        {
            let _w = lock.write();
        }
        let _r3 = lock.read();
    }

    #[test]
    fn test_spinlock_basic() {
        let lock = SpinLock::new();
        lock.lock();
        lock.unlock();
    }

    #[test]
    fn test_spinlock_try() {
        let lock = SpinLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn test_spinmutex_basic() {
        let mutex = SpinMutex::new(42u64);
        {
            let guard = mutex.lock();
            assert_eq!(*guard, 42);
        }
        {
            let mut guard = mutex.lock();
            *guard = 100;
        }
        {
            let guard = mutex.lock();
            assert_eq!(*guard, 100);
        }
    }

    #[test]
    fn test_spinmutex_concurrent() {
        let mutex = Arc::new(SpinMutex::new(0u64));
        let num_threads = 8;
        let iterations = 10_000;

        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let m = Arc::clone(&mutex);
                std::thread::spawn(move || {
                    for _ in 0..iterations {
                        let mut guard = m.lock();
                        *guard += 1;
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let guard = mutex.lock();
        assert_eq!(*guard, num_threads * iterations);
    }
}
