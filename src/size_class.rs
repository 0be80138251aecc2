//! Size-class table and lookup functions.
//!
//! Requests up to [`crate::config::SMALL_MAX`] bytes are served by the small
//! table (16-byte granularity); requests up to [`crate::config::MEDIUM_MAX`]
//! by the medium table (256-byte granularity). Both tables are built once,
//! at compile time, by [`build_table`] and then collapsed so that adjacent
//! classes whose block count is identical share a single block size —
//! except across a power-of-two boundary, which is kept as its own class so
//! that alignment queries against a power-of-two request still land exactly.

use crate::config::{
    MEDIUM_COUNT, MEDIUM_GRANULARITY, NUM_SIZE_CLASSES, PAYLOAD_SIZE, SMALL_COUNT,
    SMALL_GRANULARITY, SMALL_MAX,
};

/// A single size class: every block handed out by a span of this class is
/// exactly `block_size` bytes, and a span can hold at most `block_max` of
/// them. `class_idx` is the index other spans of this class are filed under
/// in the arena's per-class span lists — after collapsing, this can differ
/// from the class's position in the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClass {
    pub block_size: usize,
    pub block_max: usize,
    pub class_idx: usize,
}

impl SizeClass {
    const EMPTY: SizeClass = SizeClass {
        block_size: 0,
        block_max: 0,
        class_idx: 0,
    };
}

/// The well-known class for requests that consume an entire span's payload
/// as a single block. Lives outside the small/medium table.
pub const ONE_SPAN_CLASS: SizeClass = SizeClass {
    block_size: PAYLOAD_SIZE,
    block_max: 1,
    class_idx: NUM_SIZE_CLASSES,
};

const fn build_table() -> [SizeClass; NUM_SIZE_CLASSES] {
    let mut table = [SizeClass::EMPTY; NUM_SIZE_CLASSES];

    let mut i = 0;
    while i < SMALL_COUNT {
        let block_size = (i + 1) * SMALL_GRANULARITY;
        let block_max = PAYLOAD_SIZE / block_size;
        table[i] = SizeClass {
            block_size,
            block_max,
            class_idx: i,
        };
        i += 1;
    }

    let mut j = 0;
    while j < MEDIUM_COUNT {
        let block_size = SMALL_MAX + (j + 1) * MEDIUM_GRANULARITY;
        let block_max = PAYLOAD_SIZE / block_size;
        table[SMALL_COUNT + j] = SizeClass {
            block_size,
            block_max,
            class_idx: SMALL_COUNT + j,
        };
        j += 1;
    }

    // Collapse pass, scanning from the top down: if a class shares block_max
    // with its predecessor, the predecessor is rewritten to the successor's
    // block_size/class_idx — unless the successor's block_size is a power
    // of two, in which case the boundary is preserved.
    let mut k = NUM_SIZE_CLASSES - 1;
    while k > 0 {
        let upper = table[k];
        let lower = table[k - 1];
        if lower.block_max == upper.block_max && !upper.block_size.is_power_of_two() {
            table[k - 1] = SizeClass {
                block_size: upper.block_size,
                block_max: upper.block_max,
                class_idx: upper.class_idx,
            };
        }
        k -= 1;
    }

    table
}

static CLASSES: [SizeClass; NUM_SIZE_CLASSES] = build_table();

/// Look up the size class serving a small request (`1..=SMALL_MAX`).
///
/// # Panics
/// Debug-asserts `size` is within the small domain.
#[inline]
pub fn small_class(size: usize) -> &'static SizeClass {
    debug_assert!(size >= 1 && size <= SMALL_MAX);
    &CLASSES[(size - 1) >> 4]
}

/// Look up the size class serving a medium request (`SMALL_MAX+1..=MEDIUM_MAX`).
///
/// # Panics
/// Debug-asserts `size` is within the medium domain.
#[inline]
pub fn medium_class(size: usize) -> &'static SizeClass {
    debug_assert!(size > SMALL_MAX && size <= crate::config::MEDIUM_MAX);
    &CLASSES[SMALL_COUNT + ((size - SMALL_MAX - 1) >> 8)]
}

/// Fetch a class by its stored index (used when walking a span back to its
/// descriptor rather than looking one up from a request size).
#[inline]
pub fn class_by_idx(idx: usize) -> &'static SizeClass {
    &CLASSES[idx]
}

/// Total number of distinct class slots in the small+medium table (not all
/// are necessarily reachable post-collapse, but every index is valid).
#[inline]
pub fn num_classes() -> usize {
    NUM_SIZE_CLASSES
}
