#![allow(clippy::missing_safety_doc)]
//! Segment and page management for a mimalloc-style allocator.
//!
//! Large OS regions ("segments") are carved into 64KiB slices. Runs of slices
//! either sit free in per-thread span queues or back one page handed to the
//! block-level allocator. Segments whose owning thread went away while pages
//! were still live are parked in a lock-free registry and reclaimed by other
//! threads.
//!
//! The crate is split the same way the data flows:
//! - [`commit_mask`]: which commit units of a segment are committed / pending purge.
//! - `slice` / `span`: the per-segment run index, size bins, and span queues.
//! - `segment` / `purge`: segment records, sizing, commit and delayed purge.
//! - `stack` / `abandoned`: the tagged-index lock-free stacks and the registry.
//! - [`SegmentPool`]: process-wide state shared by every thread.
//! - [`ThreadSegments`]: one thread's segments, heaps and page entry points.

mod abandoned;
pub mod commit_mask;
mod error;
mod options;
pub mod os;
mod page;
mod pool;
mod purge;
mod reclaim;
mod segment;
mod slice;
mod span;
mod stack;
mod thread;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod testing;

pub use commit_mask::CommitMask;
pub use error::SegmentError;
pub use options::Options;
pub use os::{ArenaId, Os, OsError, OsMemory, SystemOs};
pub use page::{AbandonedArea, DelayedFree, Page, PageAlloc, PageArea, PageId};
pub use pool::SegmentPool;
pub use reclaim::Reclaimed;
pub use segment::{
  Run, RunState, Segment, SegmentId, SegmentKind, SegmentLayout, calculate_slices,
};
pub use slice::{SEGMENT_BIN_MAX, bin_for};
pub use thread::{HeapId, ThreadSegments};

// =============================================================================
// Constants
// =============================================================================

pub const SLICE_SHIFT: usize = 16;
/// Bookkeeping granularity inside a segment (64KB).
pub const SLICE_SIZE: usize = 1 << SLICE_SHIFT;

pub const SEGMENT_SHIFT: usize = SLICE_SHIFT + 9;
/// Size of a normal segment (32MB).
pub const SEGMENT_SIZE: usize = 1 << SEGMENT_SHIFT;
/// Normal and huge segments are aligned to this.
pub const SEGMENT_ALIGN: usize = SEGMENT_SIZE;
pub const SLICES_PER_SEGMENT: usize = SEGMENT_SIZE / SLICE_SIZE;

/// Granularity of commit / purge decisions. Coarser than a slice to keep the
/// mask small and the syscall count low.
pub const COMMIT_SIZE: usize = 2 * SLICE_SIZE;
pub const COMMIT_MASK_BITS: usize = SEGMENT_SIZE / COMMIT_SIZE;

pub const SMALL_PAGE_SIZE: usize = SLICE_SIZE;
pub const MEDIUM_PAGE_SIZE: usize = 8 * SMALL_PAGE_SIZE;
pub const SMALL_OBJ_SIZE_MAX: usize = SMALL_PAGE_SIZE / 4; // 16KB
pub const MEDIUM_OBJ_SIZE_MAX: usize = MEDIUM_PAGE_SIZE / 4; // 128KB
pub const LARGE_OBJ_SIZE_MAX: usize = SEGMENT_SIZE / 2; // 16MB

/// Alignments above this get a dedicated huge segment.
pub const BLOCK_ALIGNMENT_MAX: usize = SEGMENT_SIZE >> 1;
/// Interior slices of a used run that carry a back-offset to their header.
pub const MAX_SLICE_OFFSET: usize = (BLOCK_ALIGNMENT_MAX / SLICE_SIZE) - 1;

/// Bound on the find / reclaim-or-allocate loop of a single page request.
const PAGE_ALLOC_RETRIES: usize = 3;
/// An abandoned segment passed over this many times is reclaimed regardless of fit.
const RECLAIM_MAX_VISITS: usize = 3;
const COLLECT_MAX_TRIES: usize = 1024;
const COLLECT_MAX_TRIES_FORCED: usize = 16 * 1024;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(SLICE_SIZE.is_power_of_two());
const _: () = assert!(SEGMENT_SIZE.is_power_of_two());
const _: () = assert!(SEGMENT_SIZE % COMMIT_SIZE == 0);
const _: () = assert!(COMMIT_SIZE % SLICE_SIZE == 0);
const _: () = assert!(COMMIT_MASK_BITS % 64 == 0);
const _: () = assert!(MEDIUM_PAGE_SIZE < LARGE_OBJ_SIZE_MAX);
const _: () = assert!(LARGE_OBJ_SIZE_MAX / SLICE_SIZE < SLICES_PER_SEGMENT);
const _: () = assert!(SLICES_PER_SEGMENT <= u32::MAX as usize);
const _: () = assert!(bin_for(SLICES_PER_SEGMENT) == SEGMENT_BIN_MAX);

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
pub(crate) const fn align_down(x: usize, align: usize) -> usize {
  x & !(align - 1)
}

/// Overflow-checked `align_up`, for sizes that come straight from callers.
#[inline]
pub(crate) const fn checked_align_up(x: usize, align: usize) -> Option<usize> {
  match x.checked_add(align - 1) {
    Some(v) => Some(v & !(align - 1)),
    None => None,
  }
}

#[inline(always)]
pub(crate) const fn divide_up(x: usize, divider: usize) -> usize {
  x.div_ceil(divider)
}
