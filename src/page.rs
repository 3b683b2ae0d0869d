//! The page record carried by a used run, and the handles callers hold.

use core::ptr::NonNull;

use crate::segment::SegmentId;
use crate::thread::HeapId;

/// A page is named by its segment and the index of its first slice.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct PageId {
  pub(crate) segment: SegmentId,
  pub(crate) index: u32,
}

impl PageId {
  pub(crate) fn new(segment: SegmentId, index: usize) -> Self {
    Self {
      segment,
      index: index as u32,
    }
  }

  pub fn segment(&self) -> SegmentId {
    self.segment
  }

  pub fn slice_index(&self) -> usize {
    self.index as usize
  }
}

/// How frees from other threads are announced to the owning heap.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum DelayedFree {
  UseDelayedFree = 0,
  NoDelayedFree = 1,
  /// Set on abandoned pages: nobody is listening.
  NeverDelayedFree = 2,
}

impl DelayedFree {
  pub(crate) fn from_u8(v: u8) -> Self {
    match v {
      0 => DelayedFree::UseDelayedFree,
      1 => DelayedFree::NoDelayedFree,
      _ => DelayedFree::NeverDelayedFree,
    }
  }
}

/// Block-level bookkeeping of one page. The block allocator owns the
/// blocks; this layer only needs the counts to decide when a page is free.
#[derive(Clone, Debug)]
pub struct Page {
  pub(crate) block_size: usize,
  /// Blocks that fit in the page.
  pub(crate) reserved: u32,
  /// Blocks handed out at least once.
  pub(crate) capacity: u32,
  pub(crate) used: u32,
  pub(crate) heap: Option<HeapId>,
  pub(crate) tag: u8,
  pub(crate) is_committed: bool,
}

impl Page {
  pub(crate) fn new(page_size: usize) -> Self {
    Self {
      block_size: page_size,
      reserved: 1,
      capacity: 0,
      used: 0,
      heap: None,
      tag: 0,
      is_committed: false,
    }
  }

  pub fn block_size(&self) -> usize {
    self.block_size
  }

  pub fn used(&self) -> usize {
    self.used as usize
  }

  pub fn reserved(&self) -> usize {
    self.reserved as usize
  }

  pub fn capacity(&self) -> usize {
    self.capacity as usize
  }

  pub fn tag(&self) -> u8 {
    self.tag
  }

  pub fn heap(&self) -> Option<HeapId> {
    self.heap
  }

  pub fn is_committed(&self) -> bool {
    self.is_committed
  }

  #[inline]
  pub fn all_free(&self) -> bool {
    self.used == 0
  }

  #[inline]
  pub fn has_available(&self) -> bool {
    self.used < self.reserved
  }

  /// Records one block handed out. Returns false if the page is full.
  pub fn note_alloc(&mut self) -> bool {
    if !self.has_available() {
      return false;
    }
    self.used += 1;
    self.capacity = self.capacity.max(self.used);
    true
  }

  /// Records one block returned by the owning thread. Returns true once the page is empty.
  pub fn note_free(&mut self) -> bool {
    debug_assert!(self.used > 0, "page free underflow");
    self.used = self.used.saturating_sub(1);
    self.used == 0
  }
}

/// Address range of a page.
#[derive(Clone, Copy, Debug)]
pub struct PageArea {
  pub id: PageId,
  pub start: NonNull<u8>,
  pub size: usize,
}

#[derive(Debug)]
pub enum PageAlloc {
  Page(PageArea),
  /// A reclaimed segment already gave the heap a page with a free block of
  /// the requested size; retry the heap's own queues.
  ReclaimedIntoHeap,
}

/// What a visitor of abandoned segments sees of each page.
#[derive(Clone, Copy, Debug)]
pub struct AbandonedArea {
  pub area: PageArea,
  pub block_size: usize,
  pub used: usize,
  pub capacity: usize,
  pub reserved: usize,
  pub tag: u8,
}
