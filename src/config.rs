//! Compile-time layout constants and the runtime [`AllocatorConfig`] knobs.
//!
//! The layout constants (span size, header size, class granularities) are
//! baked into the size-class table the first time [`crate::size_class`] is
//! touched and can never change after that. The [`AllocatorConfig`] knobs
//! are read once by [`crate::allocator::init_with_config`] and are
//! immutable for the lifetime of the process.

/// The host OS's virtual memory page size, used only as the floor on a
/// mapping batch's span-unit count. Smaller than
/// [`SPAN_SIZE`] on every platform this allocator targets, so in practice
/// the floor never binds and every fresh mapping batch is exactly
/// `desired_span_count + 1` units.
pub const PAGE_SIZE: usize = 4096;

/// log2 of the span unit size (64 KiB).
pub const SPAN_SHIFT: usize = 16;
/// Size in bytes of one span unit. Every span's base address is a multiple
/// of this value, which is what makes header recovery from an interior
/// pointer an O(1) mask operation.
pub const SPAN_SIZE: usize = 1 << SPAN_SHIFT;
/// Mask that clears the low `SPAN_SHIFT` bits of an address.
pub const SPAN_ALIGN_MASK: usize = !(SPAN_SIZE - 1);

/// Bytes reserved at the base of every span for the [`crate::span::Span`] header.
pub const HEADER_SIZE: usize = 512;
/// Usable bytes per span unit after the header.
pub const PAYLOAD_SIZE: usize = SPAN_SIZE - HEADER_SIZE;

/// Granularity of the small size classes.
pub const SMALL_GRANULARITY: usize = 16;
/// Largest size served by a small class.
pub const SMALL_MAX: usize = 2048;
/// Number of small size classes.
pub const SMALL_COUNT: usize = SMALL_MAX / SMALL_GRANULARITY;

/// Granularity of the medium size classes.
pub const MEDIUM_GRANULARITY: usize = 256;
/// Largest size served by a medium class: half a span's payload, rounded
/// down to a granularity multiple.
pub const MEDIUM_MAX: usize = (PAYLOAD_SIZE / 2) / MEDIUM_GRANULARITY * MEDIUM_GRANULARITY;
/// Number of medium size classes.
pub const MEDIUM_COUNT: usize = (MEDIUM_MAX - SMALL_MAX) / MEDIUM_GRANULARITY;

/// Total number of small+medium size classes (the one-span class is not
/// counted here; it lives outside the table).
pub const NUM_SIZE_CLASSES: usize = SMALL_COUNT + MEDIUM_COUNT;

/// Largest request, in bytes, servable by the one-span class.
pub const SPAN_MAX: usize = PAYLOAD_SIZE;

/// Largest span count servable by a large-span cache entry.
pub const LARGE_CLASS_COUNT: usize = 128;
/// Largest request, in bytes, servable by a large-span allocation (as opposed
/// to a direct, uncached `mmap`).
pub const LARGE_MAX: usize = LARGE_CLASS_COUNT * SPAN_SIZE;

/// Default capacity of the per-arena single-span cache.
pub const DEFAULT_CACHE_LIMIT: usize = 64;
/// Upper bound on the single-span cache's backing array; `cache_limit` is
/// clamped to this so the cache can be a fixed-size array rather than a
/// heap allocation (the allocator cannot allocate to grow its own caches).
pub const MAX_CACHE_CAPACITY: usize = 256;
/// Default capacity of each per-arena large-span MPSC cache. Must be a
/// power of two (the Vyukov queue relies on masking, not modulo).
pub const DEFAULT_LARGE_CACHE_LIMIT: usize = 64;
/// Upper bound on each large-span MPSC cache's backing array. Must be a
/// power of two; `large_cache_limit` is clamped and rounded to it.
pub const MAX_LARGE_CACHE_CAPACITY: usize = 128;
/// Default batch size, in span units, requested from the OS when refilling
/// the single-span cache.
pub const DEFAULT_SPAN_ALLOC_COUNT: usize = 64;
/// Default batch size, in span units, requested from the OS for any mapping.
pub const DEFAULT_MAP_ALLOC_COUNT: usize = 64;

/// Default fractional over-search allowed when probing large caches on
/// allocation, expressed as a ratio (0.25 == search up to 25% above the
/// requested span count before giving up).
pub const DEFAULT_LARGE_SPAN_OVERHEAD_MUL: f32 = 0.25;

/// The allocator's runtime-configurable policy knobs.
///
/// All fields are set once at [`crate::allocator::init_with_config`] and are
/// treated as immutable afterwards — there is deliberately no setter.
#[derive(Clone, Copy, Debug)]
pub struct AllocatorConfig {
    /// Batch size in units for single-unit OS mappings.
    pub span_alloc_count: usize,
    /// Batch size in units for every OS mapping; remainder is cached.
    pub map_alloc_count: usize,
    /// Capacity of the per-arena single-span cache.
    pub cache_limit: usize,
    /// Capacity of each per-arena large-span MPSC cache. Rounded up to the
    /// next power of two if it isn't one already.
    pub large_cache_limit: usize,
    /// Fractional over-search when probing large caches on allocation.
    pub large_span_overhead_mul: f32,
    /// Fall back to the single-span cache when a large-span free can't fit
    /// the matching large cache.
    pub recycle_large_spans: bool,
    /// On a small/medium miss, split a larger cached span down to one unit.
    pub split_large_spans_to_one: bool,
    /// On a large-span miss, split a still-larger cached span down.
    pub split_large_spans_to_large: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::new_default()
    }
}

impl AllocatorConfig {
    /// `const fn` twin of [`Default::default`], usable to initialize
    /// statics before the allocator has run any code.
    pub const fn new_default() -> Self {
        Self {
            span_alloc_count: DEFAULT_SPAN_ALLOC_COUNT,
            map_alloc_count: DEFAULT_MAP_ALLOC_COUNT,
            cache_limit: DEFAULT_CACHE_LIMIT,
            large_cache_limit: DEFAULT_LARGE_CACHE_LIMIT,
            large_span_overhead_mul: DEFAULT_LARGE_SPAN_OVERHEAD_MUL,
            recycle_large_spans: true,
            split_large_spans_to_one: true,
            split_large_spans_to_large: true,
        }
    }

    /// Round `large_cache_limit` up to the next power of two, as required by
    /// the Vyukov queue's index masking, and clamp both cache limits to the
    /// fixed backing-array capacities.
    pub(crate) fn normalized(mut self) -> Self {
        self.cache_limit = self.cache_limit.min(MAX_CACHE_CAPACITY);
        self.large_cache_limit = self
            .large_cache_limit
            .max(2)
            .next_power_of_two()
            .min(MAX_LARGE_CACHE_CAPACITY);
        self
    }
}

bitflags::bitflags! {
    /// Flags accepted by `aligned_realloc`. Only the one flag its callers
    /// actually need is modeled here.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AlignedReallocFlags: u32 {
        /// Fail (return null) rather than relocate the allocation when it
        /// cannot be grown in place within its current span.
        const NO_MOVE = 0b01;
    }
}

/// Errors returned by the ambient (non-hot-path) entry points: process and
/// thread initialization. The hot path (`allocate`/`free`/...) never returns
/// a `Result`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocatorError {
    /// `init`/`init_with_config` was called more than once.
    AlreadyInitialized,
    /// The calling thread already has an arena bound to it.
    ThreadAlreadyInitialized,
    /// The initial OS mapping needed to bootstrap the base arena failed.
    MapFailed,
}

impl core::fmt::Display for AllocatorError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            AllocatorError::AlreadyInitialized => "allocator already initialized",
            AllocatorError::ThreadAlreadyInitialized => "thread already has an arena",
            AllocatorError::MapFailed => "failed to map memory from the operating system",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for AllocatorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_size_is_64kib() {
        assert_eq!(SPAN_SIZE, 65536);
        assert_eq!(HEADER_SIZE, 512);
    }

    #[test]
    fn medium_max_is_granularity_aligned() {
        assert_eq!(MEDIUM_MAX % MEDIUM_GRANULARITY, 0);
        assert!(MEDIUM_MAX > SMALL_MAX);
    }

    #[test]
    fn config_normalizes_large_cache_to_power_of_two() {
        let cfg = AllocatorConfig {
            large_cache_limit: 100,
            ..Default::default()
        }
        .normalized();
        assert_eq!(cfg.large_cache_limit, 128);
    }
}
