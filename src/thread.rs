//! Per-thread segment state: heaps, owned segments, and the page entry points.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::commit_mask::CommitMask;
use crate::error::SegmentError;
use crate::os::{ArenaId, Os, SystemOs};
use crate::page::{DelayedFree, Page, PageAlloc, PageArea, PageId};
use crate::pool::SegmentPool;
use crate::segment::{RunState, Segment, SegmentId, SegmentKind, calculate_slices};
use crate::span::SpanIndex;
use crate::{
  BLOCK_ALIGNMENT_MAX, COMMIT_SIZE, LARGE_OBJ_SIZE_MAX, MEDIUM_OBJ_SIZE_MAX, MEDIUM_PAGE_SIZE,
  PAGE_ALLOC_RETRIES, SEGMENT_ALIGN, SLICE_SIZE, SMALL_OBJ_SIZE_MAX, SMALL_PAGE_SIZE, align_down,
  align_up, divide_up,
};

/// Heap handle, local to the [`ThreadSegments`] that created it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct HeapId(u32);

impl HeapId {
  #[inline]
  fn index(self) -> usize {
    self.0 as usize
  }
}

struct Heap {
  tag: u8,
  arena: Option<ArenaId>,
  pages: BTreeSet<PageId>,
}

/// Everything one thread owns. Dropping it hands live pages to the
/// abandoned registry and releases empty segments.
pub struct ThreadSegments<O: Os = SystemOs> {
  pub(crate) pool: Arc<SegmentPool<O>>,
  pub(crate) thread_id: usize,
  pub(crate) spans: SpanIndex,
  heaps: Vec<Heap>,
}

impl<O: Os> ThreadSegments<O> {
  pub fn new(pool: Arc<SegmentPool<O>>) -> Self {
    let thread_id = pool.os().thread_id();
    Self::with_thread_id(pool, thread_id)
  }

  /// For embedders that track thread identity themselves. `thread_id` must be nonzero.
  pub fn with_thread_id(pool: Arc<SegmentPool<O>>, thread_id: usize) -> Self {
    assert_ne!(thread_id, 0, "thread id 0 marks abandoned segments");
    pool.thread_started();
    Self {
      pool,
      thread_id,
      spans: SpanIndex::default(),
      heaps: Vec::new(),
    }
  }

  pub fn thread_id(&self) -> usize {
    self.thread_id
  }

  pub fn pool(&self) -> &Arc<SegmentPool<O>> {
    &self.pool
  }

  pub fn segment_count(&self) -> usize {
    self.spans.segments.len()
  }

  pub fn segment_ids(&self) -> Vec<SegmentId> {
    self.spans.segments.ids()
  }

  pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
    self.spans.segments.get(id)
  }

  // ===========================================================================
  // Heaps
  // ===========================================================================

  pub fn heap_new(&mut self, tag: u8, arena: Option<ArenaId>) -> HeapId {
    let id = HeapId(self.heaps.len() as u32);
    self.heaps.push(Heap {
      tag,
      arena,
      pages: BTreeSet::new(),
    });
    id
  }

  pub fn heap_pages(&self, heap: HeapId) -> impl Iterator<Item = PageId> + '_ {
    self.heaps[heap.index()].pages.iter().copied()
  }

  pub fn heap_tag(&self, heap: HeapId) -> u8 {
    self.heaps[heap.index()].tag
  }

  pub(crate) fn heap_arena(&self, heap: HeapId) -> Option<ArenaId> {
    self.heaps[heap.index()].arena
  }

  /// First heap of this thread carrying `tag`.
  pub(crate) fn heap_by_tag(&self, tag: u8) -> Option<HeapId> {
    self
      .heaps
      .iter()
      .position(|h| h.tag == tag)
      .map(|i| HeapId(i as u32))
  }

  pub(crate) fn heap_track(&mut self, heap: HeapId, page: PageId) {
    self.heaps[heap.index()].pages.insert(page);
  }

  /// Tears a heap down: empty pages are freed, the rest are abandoned.
  pub fn heap_abandon(&mut self, heap: HeapId) {
    let pages = std::mem::take(&mut self.heaps[heap.index()].pages);
    for page in pages {
      self.page_collect(page);
      let empty = self.page(page).is_some_and(Page::all_free);
      if !(empty && self.page_free(page, false)) {
        self.page_abandon(page);
      }
    }
  }

  // ===========================================================================
  // Pages
  // ===========================================================================

  pub fn page(&self, id: PageId) -> Option<&Page> {
    self.spans.segments.get(id.segment)?.page(id.slice_index())
  }

  pub fn page_mut(&mut self, id: PageId) -> Option<&mut Page> {
    self.spans.segments.get_mut(id.segment)?.page_mut(id.slice_index())
  }

  pub fn page_area(&self, id: PageId) -> Option<PageArea> {
    let segment = self.spans.segments.get(id.segment)?;
    segment.page(id.slice_index())?;
    let (start, size) = segment.page_start(id.slice_index());
    Some(PageArea { id, start, size })
  }

  pub fn delayed_free(&self, id: PageId) -> DelayedFree {
    self.pool.slot(id.segment).remote(id.slice_index()).delayed()
  }

  pub fn set_delayed_free(&self, id: PageId, mode: DelayedFree) {
    self.pool.slot(id.segment).remote(id.slice_index()).set_delayed(mode);
  }

  /// Folds frees made by other threads into the page's used count.
  /// Returns how many were collected.
  pub fn page_collect(&mut self, id: PageId) -> usize {
    let remote = self.pool.slot(id.segment).remote(id.slice_index());
    let Some(page) = self
      .spans
      .segments
      .get_mut(id.segment)
      .and_then(|s| s.page_mut(id.slice_index()))
    else {
      return 0;
    };
    let n = remote.collect();
    debug_assert!(n <= page.used, "more remote frees than used blocks");
    page.used = page.used.saturating_sub(n);
    n as usize
  }

  /// Empty and no cross-thread free in the middle of touching it.
  pub(crate) fn page_is_reclaimable(&self, id: PageId) -> bool {
    self.page(id).is_some_and(Page::all_free)
      && self.pool.slot(id.segment).remote(id.slice_index()).is_quiet()
  }

  /// Hands out a page for blocks of `block_size` bytes. Alignments above
  /// [`BLOCK_ALIGNMENT_MAX`] get a dedicated huge segment.
  pub fn page_alloc(
    &mut self,
    heap: HeapId,
    block_size: usize,
    alignment: usize,
  ) -> Result<PageAlloc, SegmentError> {
    if alignment != 0 && !alignment.is_power_of_two() {
      return Err(SegmentError::InvalidAlignment { alignment });
    }

    let result = if alignment > BLOCK_ALIGNMENT_MAX {
      self
        .huge_page_alloc(heap, block_size.max(1), alignment.max(SEGMENT_ALIGN))
        .map(PageAlloc::Page)
    } else if block_size <= SMALL_OBJ_SIZE_MAX {
      self.segments_page_alloc(heap, SMALL_PAGE_SIZE, block_size)
    } else if block_size <= MEDIUM_OBJ_SIZE_MAX {
      self.segments_page_alloc(heap, MEDIUM_PAGE_SIZE, block_size)
    } else if block_size <= LARGE_OBJ_SIZE_MAX {
      self.segments_page_alloc(heap, block_size, block_size)
    } else {
      self.huge_page_alloc(heap, block_size, 0).map(PageAlloc::Page)
    };

    if let Err(e) = &result {
      log::warn!("thread {}: page for {block_size}-byte blocks failed: {e}", self.thread_id);
    }
    self.expensive_check();
    result
  }

  fn segments_page_alloc(
    &mut self,
    heap: HeapId,
    required: usize,
    block_size: usize,
  ) -> Result<PageAlloc, SegmentError> {
    let page_size = align_up(
      required,
      if required > MEDIUM_PAGE_SIZE { MEDIUM_PAGE_SIZE } else { SLICE_SIZE },
    );
    let slices_needed = page_size / SLICE_SIZE;
    let arena = self.heap_arena(heap);

    for _ in 0..PAGE_ALLOC_RETRIES {
      let pool = &*self.pool;
      let found = self
        .spans
        .page_find_and_allocate(pool.os(), pool.options(), slices_needed, arena)?;
      if let Some(page) = found {
        self.spans.segments[page.segment].try_purge(pool.os(), pool.options(), false);
        return Ok(PageAlloc::Page(self.init_page(page, heap, block_size)));
      }
      if self.reclaim_or_alloc(heap, slices_needed, block_size)? {
        return Ok(PageAlloc::ReclaimedIntoHeap);
      }
    }
    Err(SegmentError::OutOfMemory { size: page_size })
  }

  fn huge_page_alloc(
    &mut self,
    heap: HeapId,
    size: usize,
    page_alignment: usize,
  ) -> Result<PageArea, SegmentError> {
    let arena = self.heap_arena(heap);
    let id = self.segment_alloc(size, page_alignment, arena)?;

    let pool = &*self.pool;
    let (os, options) = (pool.os(), pool.options());
    let segment = &self.spans.segments[id];
    let guard_slices = usize::from(options.secure);
    let (info, count) = (
      segment.info_slices,
      segment.segment_slices - segment.info_slices - guard_slices,
    );
    let page = match self.spans.span_allocate(os, options, id, info, count) {
      Ok(page) => page,
      Err(e) => {
        self.segment_free(id);
        return Err(e);
      }
    };
    let area = self.init_page(page, heap, count * SLICE_SIZE);

    let pool = &*self.pool;
    let segment = &mut self.spans.segments[id];
    if page_alignment > 0 && segment.allow_decommit {
      // Nothing before the aligned block is ever used; drop it, keeping the first OS page.
      let start = area.start.as_ptr() as usize;
      let keep = start + pool.os().page_size();
      let aligned = align_up(start, page_alignment);
      if aligned > keep {
        let ptr = segment.ptr_at(keep - segment.base().as_ptr() as usize);
        unsafe { pool.os().reset(ptr, align_down(aligned - keep, pool.os().page_size())) };
      }
    }

    if pool.options().huge_page_abandon {
      // Nobody tracks the page; whichever thread frees it claims the segment.
      if let Some(p) = segment.page_mut(info) {
        p.heap = None;
      }
      self.heaps[heap.index()].pages.remove(&page);
      segment.thread_id = 0;
      if let Some(segment) = self.spans.segments.remove(id) {
        pool.park_claimable(segment);
      }
    }
    log::debug!("thread {}: huge page of {:#x} bytes in segment {id:?}", self.thread_id, area.size);
    Ok(area)
  }

  fn init_page(&mut self, id: PageId, heap: HeapId, block_size: usize) -> PageArea {
    let tag = self.heaps[heap.index()].tag;
    let segment = &mut self.spans.segments[id.segment];
    let (start, size) = segment.page_start(id.slice_index());
    if let Some(page) = segment.page_mut(id.slice_index()) {
      let block_size = block_size.max(1);
      page.block_size = block_size;
      page.reserved = (size / block_size).clamp(1, u32::MAX as usize) as u32;
      page.capacity = 0;
      page.used = 0;
      page.tag = tag;
      page.heap = Some(heap);
    }
    self.pool.slot(id.segment).remote(id.slice_index()).reset();
    self.heap_track(heap, id);
    PageArea { id, start, size }
  }

  /// Returns an empty page to its segment. Unless `force`, a page with a
  /// cross-thread free still in flight is left alone and false is returned.
  pub fn page_free(&mut self, id: PageId, force: bool) -> bool {
    if self.spans.segments.get(id.segment).is_none() {
      return self.huge_page_free(id);
    }
    let Some(page) = self.page(id) else {
      debug_assert!(false, "page_free on {id:?}, which is not a page");
      return false;
    };
    debug_assert!(page.all_free() || force, "page_free on a page with live blocks");
    if !force && !self.pool.slot(id.segment).remote(id.slice_index()).is_quiet() {
      return false;
    }

    self.page_clear(id);
    let segment = &self.spans.segments[id.segment];
    if segment.used == 0 {
      self.segment_free(id.segment);
    } else if segment.used == segment.abandoned {
      self.segment_abandon(id.segment);
    }
    self.expensive_check();
    true
  }

  /// Frees a huge page whose segment was parked for any thread to claim.
  fn huge_page_free(&mut self, id: PageId) -> bool {
    let Some(mut segment) = self.pool.claim(id.segment) else {
      log::warn!(
        "thread {}: page {id:?} belongs to a segment this thread neither owns nor can claim",
        self.thread_id
      );
      return false;
    };
    segment.thread_id = self.thread_id;
    if let Some(page) = segment.page_mut(id.slice_index()) {
      // Its single block is the one being freed.
      page.used = 0;
    }
    self.spans.segments.insert(segment);
    self.pool.set_owner(id.segment, self.thread_id);
    self.page_free(id, true)
  }

  /// Unhooks a page from its heap and turns its run back into free space.
  /// Returns the header index of the resulting free run.
  pub(crate) fn page_clear(&mut self, id: PageId) -> usize {
    let index = id.slice_index();
    let heap = self.page(id).and_then(Page::heap);
    if let Some(heap) = heap {
      self.heaps[heap.index()].pages.remove(&id);
    }

    let pool = &*self.pool;
    pool.slot(id.segment).remote(index).reset();
    let start = self
      .spans
      .span_free_coalesce(pool.os(), pool.options(), id.segment, index);
    let segment = &mut self.spans.segments[id.segment];
    debug_assert!(segment.used > 0);
    segment.used -= 1;
    start
  }

  /// Gives up a page that still has live blocks, e.g. when its heap goes away.
  pub fn page_abandon(&mut self, id: PageId) {
    let Some(page) = self.page_mut(id) else {
      debug_assert!(false, "page_abandon on {id:?}, which is not a page");
      return;
    };
    let heap = page.heap.take();
    if let Some(heap) = heap {
      self.heaps[heap.index()].pages.remove(&id);
    }
    self.set_delayed_free(id, DelayedFree::NeverDelayedFree);

    let segment = &mut self.spans.segments[id.segment];
    segment.abandoned += 1;
    debug_assert!(segment.abandoned <= segment.used);
    if segment.used == segment.abandoned {
      self.segment_abandon(id.segment);
    }
  }

  // ===========================================================================
  // Segments
  // ===========================================================================

  /// Allocates a segment owned by this thread. `required == 0` asks for a
  /// normal segment whose slices start out as one free run; otherwise a huge
  /// segment sized for `required` bytes with its page still to be allocated.
  pub(crate) fn segment_alloc(
    &mut self,
    required: usize,
    page_alignment: usize,
    arena: Option<ArenaId>,
  ) -> Result<SegmentId, SegmentError> {
    let pool = &*self.pool;
    let (os, options) = (pool.os(), pool.options());
    let too_large = SegmentError::OutOfMemory { size: required };

    let mut layout = calculate_slices(required, os.page_size(), options.secure).ok_or(too_large)?;
    let (alignment, align_offset) = if page_alignment > 0 {
      debug_assert!(required > 0 && page_alignment >= SEGMENT_ALIGN);
      // Grow the segment so an aligned address lands inside the page.
      let info_size = layout.info_slices * SLICE_SIZE;
      let align_offset = align_up(info_size, page_alignment);
      let extra = align_offset - info_size;
      let required = required
        .checked_add(extra)
        .ok_or(SegmentError::OutOfMemory { size: required })?;
      layout = calculate_slices(required, os.page_size(), options.secure)
        .ok_or(SegmentError::OutOfMemory { size: required })?;
      (page_alignment, align_offset)
    } else {
      (SEGMENT_ALIGN, 0)
    };

    let eager_delay =
      pool.thread_count() > 1 && self.spans.segments.len() < options.eager_commit_delay;
    let eager = !eager_delay && options.eager_commit;
    let commit = eager || required > 0;
    let allow_large = !eager_delay && !options.secure;
    let segment_size = layout.slices * SLICE_SIZE;
    let info_size = layout.info_slices * SLICE_SIZE;

    let id = pool.acquire_slot()?;
    let alloc = os.alloc_aligned(segment_size, alignment, align_offset, commit, allow_large, arena);
    let memory = match alloc {
      Ok(memory) => memory,
      Err(e) => {
        pool.release_slot(id);
        return Err(e.into());
      }
    };

    let commit_mask = if memory.initially_committed {
      CommitMask::full()
    } else {
      // Huge segments are committed as a whole; normal ones start with the info area.
      let (bytes, mask) = if required > 0 {
        (segment_size, CommitMask::full())
      } else {
        let units = divide_up(info_size, COMMIT_SIZE);
        (units * COMMIT_SIZE, CommitMask::range(0, units))
      };
      if let Err(e) = unsafe { os.commit(memory.base, bytes) } {
        unsafe { os.free(&memory, 0) };
        pool.release_slot(id);
        return Err(e.into());
      }
      mask
    };

    let kind = if required == 0 { SegmentKind::Normal } else { SegmentKind::Huge };
    let mut segment = Box::new(Segment::new(id, memory, kind, layout, self.thread_id, commit_mask));
    segment.allow_purge = segment.allow_decommit && options.purge_allowed();

    if options.secure {
      let page_size = os.page_size();
      let end_guard = segment.size() - page_size;
      if let Err(e) = segment.ensure_committed(os, options, end_guard, page_size) {
        pool.release_segment(segment);
        return Err(e.into());
      }
      for offset in [info_size - page_size, end_guard] {
        if let Err(e) = unsafe { os.protect(segment.ptr_at(offset), page_size) } {
          log::warn!("segment {id:?}: failed to protect guard page at +{offset:#x}: {e}");
        }
      }
      if segment.slice_entries == segment.segment_slices {
        segment.slice_entries -= 1;
      }
    }

    let info_slices = segment.info_slices;
    let slice_entries = segment.slice_entries;
    self.spans.segments.insert(segment);
    pool.set_owner(id, self.thread_id);

    // The info area is a used run that is not a page.
    if let Err(e) = self.spans.span_allocate(os, options, id, 0, info_slices) {
      if let Some(segment) = self.spans.segments.remove(id) {
        pool.release_segment(segment);
      }
      return Err(e);
    }
    self.spans.segments[id].used = 0;

    if kind == SegmentKind::Normal {
      self
        .spans
        .span_free(os, options, id, info_slices, slice_entries - info_slices, false);
    }
    log::debug!(
      "thread {}: allocated {kind:?} segment {id:?} ({:#x} bytes, eager={eager})",
      self.thread_id,
      segment_size
    );
    Ok(id)
  }

  /// Releases a segment this thread owns.
  pub(crate) fn segment_free(&mut self, id: SegmentId) {
    if self.spans.segments[id].kind == SegmentKind::Normal {
      self.spans.remove_segment_runs(id);
    }
    if let Some(segment) = self.spans.segments.remove(id) {
      debug_assert_eq!(segment.used, 0);
      self.pool.release_segment(segment);
    }
  }

  /// Moves a segment whose remaining pages are all abandoned into the registry.
  pub(crate) fn segment_abandon(&mut self, id: SegmentId) {
    if self.spans.segments[id].kind == SegmentKind::Normal {
      self.spans.remove_segment_runs(id);
    }
    let pool = &*self.pool;
    let segment = &mut self.spans.segments[id];
    debug_assert_eq!(segment.used, segment.abandoned);
    segment.try_purge(pool.os(), pool.options(), pool.options().abandoned_page_purge);
    segment.thread_id = 0;
    segment.abandoned_visits = 1;
    if let Some(segment) = self.spans.segments.remove(id) {
      pool.abandon(segment);
    }
  }

  /// Purges a segment's pending ranges if due (or `force`).
  pub fn segment_try_purge(&mut self, id: SegmentId, force: bool) {
    let pool = &*self.pool;
    if let Some(segment) = self.spans.segments.get_mut(id) {
      segment.try_purge(pool.os(), pool.options(), force);
    }
  }

  /// Panics if a segment's slice index or its queue membership is inconsistent.
  pub fn validate(&self, id: SegmentId) {
    let segment = &self.spans.segments[id];
    segment.validate();
    if segment.kind == SegmentKind::Normal && !segment.is_abandoned() {
      for run in segment.runs().filter(|r| r.state == RunState::Free) {
        assert!(
          self.spans.queue_contains(segment.span(run.index)),
          "free run {} of segment {id:?} is not queued",
          run.index
        );
      }
    }
  }

  #[inline]
  fn expensive_check(&self) {
    #[cfg(feature = "expensive-checks")]
    for id in self.spans.segments.ids() {
      self.validate(id);
    }
  }
}

impl<O: Os> Drop for ThreadSegments<O> {
  fn drop(&mut self) {
    for heap in 0..self.heaps.len() {
      self.heap_abandon(HeapId(heap as u32));
    }
    for id in self.spans.segments.ids() {
      let segment = &mut self.spans.segments[id];
      if segment.used == 0 {
        self.segment_free(id);
      } else {
        // Pages no heap tracks have no one left to free them either.
        segment.abandoned = segment.used;
        self.segment_abandon(id);
      }
    }
    self.pool.thread_done();
    log::debug!("thread {}: segments retired", self.thread_id);
  }
}
