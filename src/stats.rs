//! Optional outstanding-allocation counter, gated behind the `leak-check`
//! feature. Telemetry beyond this is an explicit non-goal — this
//! module intentionally stays small.

#[cfg(feature = "leak-check")]
use core::sync::atomic::{AtomicI64, Ordering};

/// Net outstanding allocations: incremented on every successful allocation,
/// decremented on every free. A nonzero value at process exit indicates a
/// leak (or an allocation still in flight).
#[cfg(feature = "leak-check")]
static OUTSTANDING: AtomicI64 = AtomicI64::new(0);

#[cfg(feature = "leak-check")]
#[inline]
pub(crate) fn record_alloc() {
    OUTSTANDING.fetch_add(1, Ordering::Relaxed);
}

#[cfg(not(feature = "leak-check"))]
#[inline(always)]
pub(crate) fn record_alloc() {}

#[cfg(feature = "leak-check")]
#[inline]
pub(crate) fn record_dealloc() {
    OUTSTANDING.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(not(feature = "leak-check"))]
#[inline(always)]
pub(crate) fn record_dealloc() {}

/// Current count of live allocations made through this allocator.
///
/// Only present under the `leak-check` feature. A coarse leak signal, not a
/// precise live-object count: it tracks net alloc/dealloc calls, not bytes.
#[cfg(feature = "leak-check")]
pub fn outstanding_allocations() -> i64 {
    OUTSTANDING.load(Ordering::Relaxed)
}

#[cfg(all(test, feature = "leak-check"))]
mod tests {
    use super::*;

    #[test]
    fn balances_to_zero() {
        let base = outstanding_allocations();
        record_alloc();
        record_alloc();
        record_dealloc();
        record_dealloc();
        assert_eq!(outstanding_allocations(), base);
    }
}
