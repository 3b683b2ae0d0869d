//! Slice entries and the size bins free runs are filed under.
//!
//! A segment keeps one [`Slice`] per 64KiB slice. A run of slices is described
//! by its first entry (the header, `Free` or `Used`) and its last entry (an
//! `Interior` back-offset to the header). Used runs additionally back-link up
//! to [`MAX_SLICE_OFFSET`](crate::MAX_SLICE_OFFSET) leading interior slices so
//! an interior address resolves to its page in one step. Any other interior
//! entry may be stale.

use crate::SLICES_PER_SEGMENT;
use crate::page::Page;
use crate::segment::SegmentId;

/// Position of a run header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct SpanRef {
  pub(crate) segment: SegmentId,
  pub(crate) index: u32,
}

impl SpanRef {
  pub(crate) fn new(segment: SegmentId, index: usize) -> Self {
    Self {
      segment,
      index: index as u32,
    }
  }
}

#[derive(Clone, Debug)]
pub(crate) enum Slice {
  /// Header of a free run, linked into the span queue of its bin.
  Free {
    count: u32,
    prev: Option<SpanRef>,
    next: Option<SpanRef>,
  },
  /// Header of a run backing a page.
  Used { count: u32, page: Page },
  /// Non-header slice; `offset` slices after its header.
  Interior { offset: u32 },
}

impl Slice {
  /// Run length for headers, 0 for interior slices.
  #[inline]
  pub(crate) fn count(&self) -> usize {
    match self {
      Slice::Free { count, .. } | Slice::Used { count, .. } => *count as usize,
      Slice::Interior { .. } => 0,
    }
  }

  pub(crate) fn set_count(&mut self, n: usize) {
    match self {
      Slice::Free { count, .. } | Slice::Used { count, .. } => *count = n as u32,
      Slice::Interior { .. } => debug_assert!(false, "set_count on an interior slice"),
    }
  }

  /// Run length if this is a free header.
  #[inline]
  pub(crate) fn free_count(&self) -> Option<usize> {
    match self {
      Slice::Free { count, .. } => Some(*count as usize),
      _ => None,
    }
  }

  #[inline]
  pub(crate) fn is_free(&self) -> bool {
    matches!(self, Slice::Free { .. })
  }

  pub(crate) fn page(&self) -> Option<&Page> {
    match self {
      Slice::Used { page, .. } => Some(page),
      _ => None,
    }
  }

  pub(crate) fn page_mut(&mut self) -> Option<&mut Page> {
    match self {
      Slice::Used { page, .. } => Some(page),
      _ => None,
    }
  }

  pub(crate) fn links(&self) -> (Option<SpanRef>, Option<SpanRef>) {
    match self {
      Slice::Free { prev, next, .. } => (*prev, *next),
      _ => (None, None),
    }
  }

  pub(crate) fn set_prev(&mut self, to: Option<SpanRef>) {
    if let Slice::Free { prev, .. } = self {
      *prev = to;
    }
  }

  pub(crate) fn set_next(&mut self, to: Option<SpanRef>) {
    if let Slice::Free { next, .. } = self {
      *next = to;
    }
  }
}

/// Size bin of a run of `slice_count` slices.
///
/// Exact for 0..=8 slices, then four bins per power of two, so larger runs
/// land in logarithmically wider bins. Monotone non-decreasing.
pub const fn bin_for(slice_count: usize) -> usize {
  if slice_count <= 1 {
    return slice_count;
  }
  let sc = slice_count - 1;
  let s = (usize::BITS - 1 - sc.leading_zeros()) as usize;
  if s <= 2 {
    return sc + 1;
  }
  ((s << 2) | ((sc >> (s - 2)) & 0x03)) - 4
}

/// Bin of a whole segment worth of slices; no free run is larger.
pub const SEGMENT_BIN_MAX: usize = bin_for(SLICES_PER_SEGMENT);
