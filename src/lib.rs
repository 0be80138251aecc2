#![no_std]

//! spanmalloc: an arena-per-thread, span-based general-purpose allocator.
//!
//! Each thread owns an arena; an arena carves 64 KiB-aligned spans
//! into small/medium size classes, a one-span class, and large multi-span
//! allocations, with bounded per-arena caches absorbing the churn of
//! repeated allocate/free cycles so the OS is touched only on genuine
//! working-set growth.
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: spanmalloc::SpanMalloc = spanmalloc::SpanMalloc;
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

#[cfg(feature = "std")]
pub mod allocator;
pub mod arena;
pub mod config;
#[cfg(feature = "preload")]
pub mod ffi;
pub mod large_cache;
pub mod platform;
pub mod size_class;
pub mod span;
pub mod span_cache;
pub mod stats;
pub mod sync;

#[cfg(feature = "std")]
pub use allocator::SpanMalloc;
