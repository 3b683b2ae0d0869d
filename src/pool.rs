//! Process-wide state shared by every [`ThreadSegments`](crate::ThreadSegments).
//!
//! The pool owns a fixed table of slots, one per segment that can exist at a
//! time. A slot carries what other threads may touch while the segment is
//! owned elsewhere: the registry link, the parked segment record while nobody
//! owns it, and per-page counters for cross-thread frees.

use core::ptr::{NonNull, null_mut};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::SLICES_PER_SEGMENT;
use crate::abandoned::AbandonedPool;
use crate::error::SegmentError;
use crate::options::Options;
use crate::os::Os;
use crate::page::{AbandonedArea, DelayedFree, PageArea, PageId};
use crate::segment::{RunState, Segment, SegmentId};
use crate::stack::{Links, TaggedStack};

/// Cross-thread view of one page.
pub(crate) struct PageRemote {
  /// Blocks freed by other threads, not yet collected by the owner.
  pending: AtomicU32,
  /// Remote frees currently between their first and last touch of the page.
  in_flight: AtomicU32,
  delayed: AtomicU8,
}

impl PageRemote {
  fn new() -> Self {
    Self {
      pending: AtomicU32::new(0),
      in_flight: AtomicU32::new(0),
      delayed: AtomicU8::new(DelayedFree::UseDelayedFree as u8),
    }
  }

  pub(crate) fn reset(&self) {
    self.pending.store(0, Ordering::Relaxed);
    self.delayed.store(DelayedFree::UseDelayedFree as u8, Ordering::Release);
  }

  /// Takes all pending remote frees.
  pub(crate) fn collect(&self) -> u32 {
    self.pending.swap(0, Ordering::Acquire)
  }

  pub(crate) fn is_quiet(&self) -> bool {
    self.in_flight.load(Ordering::Acquire) == 0
  }

  pub(crate) fn delayed(&self) -> DelayedFree {
    DelayedFree::from_u8(self.delayed.load(Ordering::Acquire))
  }

  pub(crate) fn set_delayed(&self, mode: DelayedFree) {
    self.delayed.store(mode as u8, Ordering::Release);
  }
}

#[cfg(test)]
impl PageRemote {
  /// Holds the page as if a remote free were between its two touches.
  pub(crate) fn begin_remote_free_for_test(&self) {
    self.in_flight.fetch_add(1, Ordering::Acquire);
  }

  pub(crate) fn end_remote_free_for_test(&self) {
    self.in_flight.fetch_sub(1, Ordering::Release);
  }
}

pub(crate) struct Slot {
  /// Free-slot / abandoned / visited link, `index + 1` encoded.
  next: AtomicU32,
  /// The segment record while no thread owns it.
  parked: AtomicPtr<Segment>,
  /// Set while a huge segment is parked outside the registry.
  claimable: AtomicBool,
  owner: AtomicUsize,
  remote: OnceLock<Box<[PageRemote]>>,
}

impl Slot {
  fn new() -> Self {
    Self {
      next: AtomicU32::new(0),
      parked: AtomicPtr::new(null_mut()),
      claimable: AtomicBool::new(false),
      owner: AtomicUsize::new(0),
      remote: OnceLock::new(),
    }
  }

  pub(crate) fn remote(&self, index: usize) -> &PageRemote {
    &self
      .remote
      .get_or_init(|| (0..SLICES_PER_SEGMENT).map(|_| PageRemote::new()).collect())[index]
  }

  fn park(&self, segment: Box<Segment>) {
    let prev = self.parked.swap(Box::into_raw(segment), Ordering::AcqRel);
    debug_assert!(prev.is_null(), "slot already holds a parked segment");
  }

  fn unpark(&self) -> Option<Box<Segment>> {
    let ptr = NonNull::new(self.parked.swap(null_mut(), Ordering::AcqRel))?;
    // SAFETY: only `park` stores into `parked`, always from `Box::into_raw`,
    // and the swap above hands the pointer to exactly one caller.
    Some(unsafe { Box::from_raw(ptr.as_ptr()) })
  }
}

pub(crate) struct SlotTable(Box<[Slot]>);

impl Links for SlotTable {
  #[inline]
  fn link(&self, index: u32) -> &AtomicU32 {
    &self.0[index as usize].next
  }
}

pub struct SegmentPool<O: Os = crate::os::SystemOs> {
  os: O,
  options: Options,
  slots: SlotTable,
  free_slots: TaggedStack,
  pub(crate) abandoned: AbandonedPool,
  threads: AtomicUsize,
}

impl<O: Os> SegmentPool<O> {
  pub fn new(os: O, options: Options) -> Arc<Self> {
    let capacity = options.max_segments.clamp(1, u32::MAX as usize - 1);
    let slots = SlotTable((0..capacity).map(|_| Slot::new()).collect());
    let free_slots = TaggedStack::new();
    for index in (0..capacity as u32).rev() {
      free_slots.push(&slots, index);
    }
    log::debug!("segment pool: {capacity} slots, {options:?}");
    Arc::new(Self {
      os,
      options,
      slots,
      free_slots,
      abandoned: AbandonedPool::new(),
      threads: AtomicUsize::new(0),
    })
  }

  pub fn os(&self) -> &O {
    &self.os
  }

  pub fn options(&self) -> &Options {
    &self.options
  }

  pub fn capacity(&self) -> usize {
    self.slots.0.len()
  }

  pub fn thread_count(&self) -> usize {
    self.threads.load(Ordering::Relaxed)
  }

  pub(crate) fn thread_started(&self) {
    self.threads.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn thread_done(&self) {
    self.threads.fetch_sub(1, Ordering::Relaxed);
  }

  pub fn abandoned_count(&self) -> usize {
    self.abandoned.abandoned_count()
  }

  pub fn visited_count(&self) -> usize {
    self.abandoned.visited_count()
  }

  /// Blocks until no thread is reading the abandoned list.
  pub fn await_readers(&self) {
    self.abandoned.await_readers();
  }

  #[inline]
  pub(crate) fn slot(&self, id: SegmentId) -> &Slot {
    &self.slots.0[id.index()]
  }

  /// Thread currently owning a segment, 0 if nobody does.
  pub fn owner_of(&self, id: SegmentId) -> usize {
    self.slot(id).owner.load(Ordering::Acquire)
  }

  pub(crate) fn set_owner(&self, id: SegmentId, thread_id: usize) {
    self.slot(id).owner.store(thread_id, Ordering::Release);
  }

  pub(crate) fn acquire_slot(&self) -> Result<SegmentId, SegmentError> {
    match self.free_slots.pop(&self.slots) {
      Some(index) => Ok(SegmentId(index)),
      None => Err(SegmentError::SlotsExhausted {
        capacity: self.capacity(),
      }),
    }
  }

  pub(crate) fn release_slot(&self, id: SegmentId) {
    self.set_owner(id, 0);
    self.free_slots.push(&self.slots, id.0);
  }

  /// Returns a segment's memory to the OS and its slot to the table.
  pub(crate) fn release_segment(&self, segment: Box<Segment>) {
    let id = segment.id;
    if self.options.secure {
      let page_size = self.os.page_size();
      let info_guard = segment.info_size() - page_size;
      let end_guard = segment.size() - page_size;
      for offset in [info_guard, end_guard] {
        if let Err(e) = unsafe { self.os.unprotect(segment.ptr_at(offset), page_size) } {
          log::warn!("segment {id:?}: failed to unprotect guard page: {e}");
        }
      }
    }

    let committed = segment.commit_mask.committed_size(segment.size());
    // A pop may still be reading this slot's link; keep the memory until it is done.
    self.abandoned.await_readers();
    log::debug!("segment {id:?}: released ({:#x} bytes)", segment.size());
    unsafe { self.os.free(&segment.memory, committed) };
    self.release_slot(id);
  }

  // ===========================================================================
  // Abandoned registry
  // ===========================================================================

  pub(crate) fn abandon(&self, segment: Box<Segment>) {
    let id = segment.id;
    debug_assert!(segment.is_abandoned());
    self.set_owner(id, 0);
    self.slot(id).park(segment);
    self.abandoned.push(&self.slots, id);
    log::debug!("segment {id:?}: abandoned");
  }

  pub(crate) fn visited_push(&self, segment: Box<Segment>) {
    let id = segment.id;
    debug_assert!(segment.is_abandoned());
    self.slot(id).park(segment);
    self.abandoned.visited_push(&self.slots, id);
  }

  pub(crate) fn abandoned_pop(&self) -> Option<Box<Segment>> {
    let id = self.abandoned.pop(&self.slots)?;
    let segment = self.slot(id).unpark();
    debug_assert!(segment.is_some(), "registry entry {id:?} has no parked segment");
    segment
  }

  pub(crate) fn visited_revisit(&self) -> bool {
    self.abandoned.visited_revisit(&self.slots)
  }

  /// Parks a huge segment that any thread may later claim to free it.
  pub(crate) fn park_claimable(&self, segment: Box<Segment>) {
    let id = segment.id;
    self.set_owner(id, 0);
    let slot = self.slot(id);
    slot.park(segment);
    slot.claimable.store(true, Ordering::Release);
  }

  pub(crate) fn claim(&self, id: SegmentId) -> Option<Box<Segment>> {
    let slot = self.slots.0.get(id.index())?;
    slot
      .claimable
      .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
      .ok()?;
    slot.unpark()
  }

  // ===========================================================================
  // Cross-thread frees
  // ===========================================================================

  /// Records a block of `page` freed by a thread that does not own it.
  /// Returns true if the owning heap asked to be told about such frees.
  pub fn free_remote(&self, page: PageId) -> bool {
    let remote = self.slot(page.segment).remote(page.slice_index());
    remote.in_flight.fetch_add(1, Ordering::Acquire);
    remote.pending.fetch_add(1, Ordering::Release);
    let notify = remote.delayed() == DelayedFree::UseDelayedFree;
    remote.in_flight.fetch_sub(1, Ordering::Release);
    notify
  }

  /// Visits the pages of every abandoned segment, and with `visit_blocks`
  /// every block slot up to each page's capacity. Stops early, returning
  /// false, when the visitor does.
  ///
  /// # Safety
  /// No thread may reclaim or release abandoned segments while this runs.
  pub unsafe fn visit_abandoned_blocks<F>(
    &self,
    tag: Option<u8>,
    visit_blocks: bool,
    mut visitor: F,
  ) -> bool
  where
    F: FnMut(&AbandonedArea, Option<NonNull<u8>>) -> bool,
  {
    for first in [self.abandoned.first_abandoned(), self.abandoned.first_visited()] {
      let mut cursor = first;
      while let Some(id) = cursor {
        let slot = self.slot(id);
        // SAFETY: the caller guarantees parked segments stay put.
        if let Some(segment) = unsafe { slot.parked.load(Ordering::Acquire).as_ref() }
          && !visit_segment(segment, tag, visit_blocks, &mut visitor)
        {
          return false;
        }
        cursor = crate::stack::decode(slot.next.load(Ordering::Acquire)).map(SegmentId);
      }
    }
    true
  }
}

fn visit_segment<F>(segment: &Segment, tag: Option<u8>, visit_blocks: bool, visitor: &mut F) -> bool
where
  F: FnMut(&AbandonedArea, Option<NonNull<u8>>) -> bool,
{
  for run in segment.runs().skip(1).filter(|r| r.state == RunState::Used) {
    let Some(page) = segment.page(run.index) else { continue };
    if tag.is_some_and(|t| t != page.tag) {
      continue;
    }
    let (start, size) = segment.page_start(run.index);
    let area = AbandonedArea {
      area: PageArea {
        id: PageId::new(segment.id, run.index),
        start,
        size,
      },
      block_size: page.block_size,
      used: page.used(),
      capacity: page.capacity(),
      reserved: page.reserved(),
      tag: page.tag,
    };
    if !visitor(&area, None) {
      return false;
    }
    if visit_blocks {
      for i in 0..page.capacity() {
        // SAFETY: capacity blocks of block_size fit in the page.
        let block = unsafe { start.add(i * page.block_size) };
        if !visitor(&area, Some(block)) {
          return false;
        }
      }
    }
  }
  true
}

impl<O: Os> Drop for SegmentPool<O> {
  fn drop(&mut self) {
    // Whatever is still parked has no owner left to free it.
    for slot in self.slots.0.iter() {
      if let Some(segment) = slot.unpark() {
        let committed = segment.commit_mask.committed_size(segment.size());
        unsafe { self.os.free(&segment.memory, committed) };
      }
    }
  }
}
