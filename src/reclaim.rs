//! Taking abandoned segments back.
//!
//! A popped segment is moved into the caller's [`SegmentMap`] while it is
//! inspected, still with `thread_id == 0`, so none of its free runs reach the
//! span queues until it is actually reclaimed. If it is passed over it goes
//! back to the pool's visited list.
//!
//! [`SegmentMap`]: crate::segment::SegmentMap

use crate::os::Os;
use crate::page::{DelayedFree, Page, PageId};
use crate::segment::{RunState, SegmentId};
use crate::thread::{HeapId, ThreadSegments};
use crate::{COLLECT_MAX_TRIES, COLLECT_MAX_TRIES_FORCED, RECLAIM_MAX_VISITS};

/// Outcome of a successful [`ThreadSegments::try_reclaim`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Reclaimed {
  /// A page with the requested block size and room left is now in the heap.
  RightPage,
  /// A segment with a large enough free run is now owned by this thread.
  Segment(SegmentId),
}

impl<O: Os> ThreadSegments<O> {
  /// Collects remote frees on every page of a segment being inspected and
  /// clears the pages that became empty. Returns true if the segment now has
  /// a free run of `needed` slices, or a page for `block_size` blocks with room
  /// left that belongs to a heap tagged `tag`.
  fn check_free(&mut self, id: SegmentId, needed: usize, block_size: usize, tag: u8) -> bool {
    let pages: Vec<usize> = self.spans.segments[id]
      .runs()
      .skip(1)
      .filter(|r| r.state == RunState::Used)
      .map(|r| r.index)
      .collect();

    let mut has_page = false;
    for index in pages {
      let page = PageId::new(id, index);
      self.page_collect(page);
      if self.page_is_reclaimable(page) {
        self.page_clear(page);
        let segment = &mut self.spans.segments[id];
        debug_assert!(segment.abandoned > 0);
        segment.abandoned -= 1;
      } else if self
        .page(page)
        .is_some_and(|p| {
          p.tag() == tag && p.block_size() == block_size && p.has_available()
        })
      {
        has_page = true;
      }
    }

    has_page || self.has_free_run(id, needed)
  }

  fn has_free_run(&self, id: SegmentId, needed: usize) -> bool {
    self.spans.segments.get(id).is_some_and(|segment| {
      segment
        .runs()
        .any(|r| r.state == RunState::Free && r.count >= needed)
    })
  }

  /// Makes this thread the owner of an inspected segment. Live pages go to
  /// the heap with their tag (`heap` if there is none), empty ones are
  /// cleared and free runs are queued. Returns whether a page matching
  /// `requested_block_size` landed in `heap`, and whether the segment is
  /// still alive (it is released once it has no pages).
  fn segment_reclaim(
    &mut self,
    id: SegmentId,
    heap: HeapId,
    requested_block_size: usize,
  ) -> (bool, bool) {
    let segment = &mut self.spans.segments[id];
    segment.thread_id = self.thread_id;
    segment.abandoned_visits = 0;
    let runs: Vec<_> = segment.runs().skip(1).collect();
    self.pool.set_owner(id, self.thread_id);

    let mut right_page = false;
    for run in runs {
      match run.state {
        RunState::Used => {
          let page = PageId::new(id, run.index);
          let segment = &mut self.spans.segments[id];
          debug_assert!(segment.abandoned > 0);
          segment.abandoned = segment.abandoned.saturating_sub(1);

          let tag = self.page(page).map_or(0, Page::tag);
          let target = self.heap_by_tag(tag).unwrap_or_else(|| {
            log::warn!(
              "thread {}: no heap with tag {tag} for reclaimed page {page:?}, using {heap:?}",
              self.thread_id
            );
            heap
          });
          self.set_delayed_free(page, DelayedFree::UseDelayedFree);
          self.page_collect(page);

          if self.page_is_reclaimable(page) {
            self.page_clear(page);
            continue;
          }
          if let Some(p) = self.page_mut(page) {
            p.heap = Some(target);
            if target == heap && p.block_size() == requested_block_size && p.has_available() {
              right_page = true;
            }
          }
          self.heap_track(target, page);
        }
        RunState::Free => {
          // An earlier page may already have merged this run.
          if self.spans.segments[id].slices[run.index].is_free() {
            let pool = &*self.pool;
            self
              .spans
              .span_free_coalesce(pool.os(), pool.options(), id, run.index);
          }
        }
      }
    }

    let segment = &self.spans.segments[id];
    debug_assert_eq!(segment.abandoned, 0);
    if segment.used == 0 {
      self.segment_free(id);
      return (false, false);
    }
    log::debug!("thread {}: reclaimed segment {id:?}", self.thread_id);
    (right_page, true)
  }

  /// Looks through the abandoned registry for a segment that can serve a
  /// page of `needed` slices (or `block_size` blocks) for `heap`.
  pub fn try_reclaim(
    &mut self,
    heap: HeapId,
    needed: usize,
    block_size: usize,
  ) -> Option<Reclaimed> {
    let arena = self.heap_arena(heap);
    let tag = self.heap_tag(heap);
    let max_tries = self.pool.options().max_segment_reclaim();

    for _ in 0..max_tries {
      let Some(mut segment) = self.pool.abandoned_pop() else {
        break;
      };
      let id = segment.id();
      segment.abandoned_visits += 1;
      let suitable = segment.memory().is_suitable(arena);
      self.spans.segments.insert(segment);

      let has_page = self.check_free(id, needed, block_size, tag);
      let segment = &self.spans.segments[id];
      if segment.used == 0 {
        // Emptied by remote frees; give it back.
        self.segment_reclaim(id, heap, 0);
      } else if has_page && suitable {
        match self.segment_reclaim(id, heap, block_size) {
          (true, _) => return Some(Reclaimed::RightPage),
          (false, true) if self.has_free_run(id, needed) => {
            return Some(Reclaimed::Segment(id));
          }
          // The matching page went to another heap with the same tag and
          // there is no room left; keep the segment and look further.
          _ => {}
        }
      } else if segment.abandoned_visits > RECLAIM_MAX_VISITS && suitable {
        // Passed over too often; take it even though it does not fit.
        self.segment_reclaim(id, heap, 0);
      } else {
        self.revisit_later(id, true);
      }
    }
    None
  }

  fn revisit_later(&mut self, id: SegmentId, force_purge: bool) {
    let pool = &*self.pool;
    if let Some(mut segment) = self.spans.segments.remove(id) {
      segment.try_purge(pool.os(), pool.options(), force_purge);
      pool.visited_push(segment);
    }
  }

  /// Returns true if a page for `block_size` was reclaimed straight into
  /// `heap`. Otherwise this thread now owns a segment with room for `needed`
  /// slices, reclaimed or fresh.
  pub(crate) fn reclaim_or_alloc(
    &mut self,
    heap: HeapId,
    needed: usize,
    block_size: usize,
  ) -> Result<bool, crate::SegmentError> {
    match self.try_reclaim(heap, needed, block_size) {
      Some(Reclaimed::RightPage) => return Ok(true),
      Some(Reclaimed::Segment(_)) => return Ok(false),
      None => {}
    }
    let arena = self.heap_arena(heap);
    self.segment_alloc(0, 0, arena)?;
    Ok(false)
  }

  /// Takes every abandoned segment into this thread.
  pub fn abandoned_reclaim_all(&mut self, heap: HeapId) {
    let mut count = 0;
    while let Some(segment) = self.pool.abandoned_pop() {
      let id = segment.id();
      self.spans.segments.insert(segment);
      self.segment_reclaim(id, heap, 0);
      count += 1;
    }
    if count > 0 {
      log::debug!("thread {}: reclaimed all {count} abandoned segments", self.thread_id);
    }
  }

  /// Maintenance sweep over the registry: releases segments that became
  /// empty and purges the rest. `force` revisits every segment and purges
  /// regardless of deadlines.
  pub fn abandoned_collect(&mut self, heap: HeapId, force: bool) {
    let max_tries = if force { COLLECT_MAX_TRIES_FORCED } else { COLLECT_MAX_TRIES };
    if force {
      self.pool.visited_revisit();
    }

    for _ in 0..max_tries {
      let Some(segment) = self.pool.abandoned_pop() else {
        break;
      };
      let id = segment.id();
      self.spans.segments.insert(segment);
      self.check_free(id, 0, 0, self.heap_tag(heap));
      if self.spans.segments[id].used == 0 {
        self.segment_reclaim(id, heap, 0);
      } else {
        self.revisit_later(id, force);
      }
    }
  }
}
