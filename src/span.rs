//! Span queues and the run operations that keep them in sync.
//!
//! A thread files every free run of its normal segments in the queue of the
//! run's bin. Queues are doubly linked through the free headers themselves, so
//! unlinking is O(1) given the run. Huge segments and segments with no owner
//! keep their free runs out of the queues.

use crate::error::SegmentError;
use crate::options::Options;
use crate::os::{ArenaId, Os};
use crate::page::{Page, PageId};
use crate::segment::{SegmentId, SegmentKind, SegmentMap};
use crate::slice::{SEGMENT_BIN_MAX, Slice, SpanRef, bin_for};
use crate::{MAX_SLICE_OFFSET, SLICE_SIZE};

#[derive(Clone, Copy, Default, Debug)]
struct SpanQueue {
  first: Option<SpanRef>,
  last: Option<SpanRef>,
}

/// A thread's owned segments together with the queues over their free runs.
#[derive(Default)]
pub(crate) struct SpanIndex {
  queues: [SpanQueue; SEGMENT_BIN_MAX + 1],
  pub(crate) segments: SegmentMap,
}

impl SpanIndex {
  // ===========================================================================
  // Queues
  // ===========================================================================

  fn queue_of(&mut self, span: SpanRef) -> &mut SpanQueue {
    let bin = bin_for(self.segments.slice(span).count());
    debug_assert!(bin <= SEGMENT_BIN_MAX);
    &mut self.queues[bin.min(SEGMENT_BIN_MAX)]
  }

  /// Links a free header at the front of its bin's queue.
  fn push(&mut self, span: SpanRef) {
    let first = self.queue_of(span).first;
    let slice = self.segments.slice_mut(span);
    slice.set_prev(None);
    slice.set_next(first);
    match first {
      Some(f) => self.segments.slice_mut(f).set_prev(Some(span)),
      None => self.queue_of(span).last = Some(span),
    }
    self.queue_of(span).first = Some(span);
  }

  /// Unlinks a free header. A run that was never linked (no links, not the
  /// queue's first or last) is left alone.
  pub(crate) fn remove(&mut self, span: SpanRef) {
    let (prev, next) = self.segments.slice(span).links();
    match prev {
      Some(p) => self.segments.slice_mut(p).set_next(next),
      None => {
        let queue = self.queue_of(span);
        if queue.first == Some(span) {
          queue.first = next;
        }
      }
    }
    match next {
      Some(n) => self.segments.slice_mut(n).set_prev(prev),
      None => {
        let queue = self.queue_of(span);
        if queue.last == Some(span) {
          queue.last = prev;
        }
      }
    }
    let slice = self.segments.slice_mut(span);
    slice.set_prev(None);
    slice.set_next(None);
  }

  pub(crate) fn queue_contains(&self, span: SpanRef) -> bool {
    let bin = bin_for(self.segments.slice(span).count()).min(SEGMENT_BIN_MAX);
    let mut cursor = self.queues[bin].first;
    while let Some(s) = cursor {
      if s == span {
        return true;
      }
      cursor = self.segments.slice(s).links().1;
    }
    false
  }

  #[cfg(test)]
  pub(crate) fn queues_are_empty(&self) -> bool {
    self.queues.iter().all(|q| q.first.is_none() && q.last.is_none())
  }

  /// Unlinks every free run of a segment, before it is abandoned or released.
  pub(crate) fn remove_segment_runs(&mut self, id: SegmentId) {
    let free: Vec<usize> = self.segments[id]
      .runs()
      .filter(|r| r.state == crate::segment::RunState::Free)
      .map(|r| r.index)
      .collect();
    for index in free {
      self.remove(SpanRef::new(id, index));
    }
  }

  // ===========================================================================
  // Runs
  // ===========================================================================

  /// Writes a free run of `count` slices at `index` and queues it if the
  /// segment is a normal, owned one.
  pub(crate) fn span_free<O: Os>(
    &mut self,
    os: &O,
    options: &Options,
    id: SegmentId,
    index: usize,
    count: usize,
    allow_purge: bool,
  ) {
    let count = count.max(1);
    let segment = &mut self.segments[id];
    debug_assert!(index + count <= segment.slice_entries || segment.kind == SegmentKind::Huge);

    segment.slices[index] = Slice::Free {
      count: count as u32,
      prev: None,
      next: None,
    };
    let last = index + count - 1;
    if last > index && last < segment.slice_entries {
      segment.slices[last] = Slice::Interior {
        offset: (count - 1) as u32,
      };
    }
    if allow_purge {
      segment.schedule_purge(os, options, index * SLICE_SIZE, count * SLICE_SIZE);
    }

    if segment.kind == SegmentKind::Normal && !segment.is_abandoned() {
      self.push(SpanRef::new(id, index));
    }
  }

  /// Frees the run at `index` and merges it with free neighbours.
  /// Returns the header index of the merged run.
  pub(crate) fn span_free_coalesce<O: Os>(
    &mut self,
    os: &O,
    options: &Options,
    id: SegmentId,
    index: usize,
  ) -> usize {
    let segment = &mut self.segments[id];
    let count = segment.slices[index].count();
    debug_assert!(count > 0);

    if segment.kind == SegmentKind::Huge {
      // Only the used flag changes; the segment goes away as a whole.
      segment.slices[index] = Slice::Free {
        count: count as u32,
        prev: None,
        next: None,
      };
      return index;
    }

    let queued = !segment.is_abandoned();
    let next = index + count;
    let next_count = if next < segment.slice_entries {
      segment.slices[next].free_count()
    } else {
      None
    };
    let prev = if index > 0 {
      let prev = segment.run_start(index - 1);
      segment.slices[prev].free_count().map(|n| (prev, n))
    } else {
      None
    };

    let mut start = index;
    let mut total = count;
    if let Some(n) = next_count {
      total += n;
      if queued {
        self.remove(SpanRef::new(id, next));
      }
    }
    if let Some((p, n)) = prev {
      total += n;
      if queued {
        self.remove(SpanRef::new(id, p));
      }
      start = p;
    }

    // Former headers are now interior slices of the merged run.
    let segment = &mut self.segments[id];
    if next_count.is_some() {
      segment.slices[next] = Slice::Interior {
        offset: (next - start) as u32,
      };
    }
    if start != index {
      segment.slices[index] = Slice::Interior {
        offset: (index - start) as u32,
      };
    }

    self.span_free(os, options, id, start, total, true);
    start
  }

  /// Turns the run at `index` into a used run backing a fresh page.
  pub(crate) fn span_allocate<O: Os>(
    &mut self,
    os: &O,
    options: &Options,
    id: SegmentId,
    index: usize,
    count: usize,
  ) -> Result<PageId, SegmentError> {
    let segment = &mut self.segments[id];
    segment.ensure_committed(os, options, index * SLICE_SIZE, count * SLICE_SIZE)?;

    let mut page = Page::new(count * SLICE_SIZE);
    page.is_committed = true;
    segment.slices[index] = Slice::Used {
      count: count as u32,
      page,
    };

    // Back-offsets for the leading interior slices, then the last slice.
    let entries = segment.slice_entries;
    let linked = (count - 1).min(MAX_SLICE_OFFSET).min(entries - index - 1);
    for i in 1..=linked {
      segment.slices[index + i] = Slice::Interior { offset: i as u32 };
    }
    let last = (index + count - 1).min(entries - 1);
    if last > index + linked {
      segment.slices[last] = Slice::Interior {
        offset: (last - index) as u32,
      };
    }

    segment.used += 1;
    Ok(PageId::new(id, index))
  }

  /// Shrinks a free run at `index` to `count` slices, freeing the tail unqueued-purge.
  pub(crate) fn slice_split<O: Os>(
    &mut self,
    os: &O,
    options: &Options,
    id: SegmentId,
    index: usize,
    count: usize,
  ) {
    let current = self.segments[id].slices[index].count();
    if current <= count {
      return;
    }
    debug_assert!(self.segments[id].kind == SegmentKind::Normal);
    self.span_free(os, options, id, index + count, current - count, false);
    self.segments[id].slices[index].set_count(count);
  }

  /// First-fit search for a free run of at least `slice_count` slices in a
  /// segment suitable for `arena`, starting at the smallest fitting bin.
  pub(crate) fn page_find_and_allocate<O: Os>(
    &mut self,
    os: &O,
    options: &Options,
    slice_count: usize,
    arena: Option<ArenaId>,
  ) -> Result<Option<PageId>, SegmentError> {
    let slice_count = slice_count.max(1);
    for bin in bin_for(slice_count)..=SEGMENT_BIN_MAX {
      let mut cursor = self.queues[bin].first;
      while let Some(span) = cursor {
        let segment = &self.segments[span.segment];
        let Slice::Free { count, next, .. } = segment.slices[span.index as usize] else {
          debug_assert!(false, "queued run {span:?} is not free");
          break;
        };
        cursor = next;
        if (count as usize) < slice_count || !segment.memory.is_suitable(arena) {
          continue;
        }

        let index = span.index as usize;
        self.remove(span);
        self.slice_split(os, options, span.segment, index, slice_count);
        return match self.span_allocate(os, options, span.segment, index, slice_count) {
          Ok(page) => Ok(Some(page)),
          Err(e) => {
            log::warn!(
              "segment {:?}: commit for a {slice_count}-slice page failed: {e}",
              span.segment
            );
            self.span_free_coalesce(os, options, span.segment, index);
            Err(e)
          }
        };
      }
    }
    Ok(None)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::commit_mask::CommitMask;
  use crate::segment::{RunState, Segment, calculate_slices};
  use crate::testing::TestOs;
  use crate::{SEGMENT_ALIGN, SLICES_PER_SEGMENT};

  struct Fixture {
    os: TestOs,
    options: Options,
    index: SpanIndex,
  }

  impl Fixture {
    fn new() -> Self {
      Self {
        os: TestOs::new(),
        options: Options::default(),
        index: SpanIndex::default(),
      }
    }

    /// A committed normal segment: info run, then one big free run.
    fn add_segment(&mut self, id: u32, thread_id: usize) -> SegmentId {
      let layout = calculate_slices(0, self.os.page_size(), false).unwrap();
      let memory = self
        .os
        .alloc_aligned(layout.slices * SLICE_SIZE, SEGMENT_ALIGN, 0, true, false, None)
        .unwrap();
      let id = SegmentId(id);
      let mut segment =
        Segment::new(id, memory, SegmentKind::Normal, layout, thread_id, CommitMask::full());
      segment.allow_purge = true;
      let info = segment.info_slices;
      self.index.segments.insert(Box::new(segment));
      self.index.span_allocate(&self.os, &self.options, id, 0, info).unwrap();
      self.index.segments[id].used = 0;
      self
        .index
        .span_free(&self.os, &self.options, id, info, SLICES_PER_SEGMENT - info, false);
      id
    }

    fn alloc(&mut self, slices: usize) -> PageId {
      self
        .index
        .page_find_and_allocate(&self.os, &self.options, slices, None)
        .unwrap()
        .unwrap()
    }

    fn free(&mut self, page: PageId) -> usize {
      self.index.segments[page.segment].used -= 1;
      self
        .index
        .span_free_coalesce(&self.os, &self.options, page.segment, page.slice_index())
    }

    fn runs(&self, id: SegmentId) -> Vec<(usize, usize, RunState)> {
      self.index.segments[id]
        .runs()
        .map(|r| (r.index, r.count, r.state))
        .collect()
    }
  }

  impl Drop for Fixture {
    fn drop(&mut self) {
      for id in self.index.segments.ids() {
        if let Some(s) = self.index.segments.remove(id) {
          unsafe { self.os.free(&s.memory, s.size()) };
        }
      }
    }
  }

  #[test]
  fn test_fresh_segment_has_one_queued_free_run() {
    let mut f = Fixture::new();
    let id = f.add_segment(0, 1);
    let info = f.index.segments[id].info_slices;
    assert_eq!(
      f.runs(id),
      vec![(0, info, RunState::Used), (info, SLICES_PER_SEGMENT - info, RunState::Free)]
    );
    assert!(f.index.queue_contains(SpanRef::new(id, info)));
    f.index.segments[id].validate();
  }

  #[test]
  fn test_allocate_splits_and_free_coalesces() {
    let mut f = Fixture::new();
    let id = f.add_segment(0, 1);
    let info = f.index.segments[id].info_slices;

    let a = f.alloc(1);
    let b = f.alloc(8);
    let c = f.alloc(4);
    assert_eq!(a.slice_index(), info);
    assert_eq!(b.slice_index(), info + 1);
    assert_eq!(c.slice_index(), info + 9);
    assert_eq!(f.index.segments[id].used, 3);
    f.index.segments[id].validate();

    // Free the middle: no neighbour is free.
    assert_eq!(f.free(b), info + 1);
    f.index.segments[id].validate();
    // Free the first: merges forward with b's run.
    assert_eq!(f.free(a), info);
    assert_eq!(f.runs(id)[1], (info, 9, RunState::Free));
    f.index.segments[id].validate();
    // Free the last: merges back with a+b and forward with the tail.
    assert_eq!(f.free(c), info);
    assert_eq!(
      f.runs(id),
      vec![(0, info, RunState::Used), (info, SLICES_PER_SEGMENT - info, RunState::Free)]
    );
    assert_eq!(f.index.segments[id].used, 0);
    f.index.segments[id].validate();
    assert!(f.index.queue_contains(SpanRef::new(id, info)));
  }

  #[test]
  fn test_large_run_interior_offsets() {
    let mut f = Fixture::new();
    let id = f.add_segment(0, 1);
    let page = f.alloc(300);
    let segment = &f.index.segments[id];
    let start = page.slice_index();
    // Every linked interior slice resolves to the header.
    for i in 1..=MAX_SLICE_OFFSET {
      assert_eq!(segment.run_start(start + i), start);
    }
    assert_eq!(segment.run_start(start + 299), start);
    segment.validate();
  }

  #[test]
  fn test_find_prefers_smallest_fitting_bin() {
    let mut f = Fixture::new();
    let id = f.add_segment(0, 1);
    let a = f.alloc(2);
    let _guard1 = f.alloc(1);
    let b = f.alloc(16);
    let _guard2 = f.alloc(1);
    f.free(a);
    f.free(b);

    // A 2-slice request reuses a's hole rather than carving the big tail.
    let again = f.alloc(2);
    assert_eq!(again, a);
    // A 10-slice request fits b's hole.
    let ten = f.alloc(10);
    assert_eq!(ten, b);
    f.index.segments[id].validate();
  }

  #[test]
  fn test_abandoned_segments_are_not_queued() {
    let mut f = Fixture::new();
    let id = f.add_segment(0, 1);
    let page = f.alloc(4);
    f.index.remove_segment_runs(id);
    assert!(f.index.queues_are_empty());

    f.index.segments[id].thread_id = 0;
    let start = f.free(page);
    assert!(f.index.queues_are_empty());
    assert!(!f.index.queue_contains(SpanRef::new(id, start)));
    // Unlinking a run that was never queued changes nothing.
    f.index.remove(SpanRef::new(id, start));
    assert!(f.index.queues_are_empty());
  }

  #[test]
  fn test_arena_mismatch_is_skipped() {
    let mut f = Fixture::new();
    f.add_segment(0, 1);
    let found = f
      .index
      .page_find_and_allocate(&f.os, &f.options, 1, Some(ArenaId(1)))
      .unwrap();
    assert!(found.is_none());
  }

  #[test]
  fn test_commit_failure_restores_free_run() {
    let mut f = Fixture::new();
    let id = f.add_segment(0, 1);
    let info = f.index.segments[id].info_slices;
    // Make the tail uncommitted so the next allocation has to commit.
    f.index.segments[id].commit_mask = CommitMask::range(0, 1);
    f.os.fail_commits(true);

    let err = f.index.page_find_and_allocate(&f.os, &f.options, 4, None);
    assert!(matches!(err, Err(SegmentError::Os(_))));
    assert_eq!(
      f.runs(id),
      vec![(0, info, RunState::Used), (info, SLICES_PER_SEGMENT - info, RunState::Free)]
    );
    assert!(f.index.queue_contains(SpanRef::new(id, info)));
    assert_eq!(f.index.segments[id].used, 0);

    f.os.fail_commits(false);
    let page = f.alloc(4);
    assert_eq!(page.slice_index(), info);
    f.index.segments[id].commit_mask = CommitMask::full();
  }

  #[test]
  fn test_queues_span_segments() {
    let mut f = Fixture::new();
    let a = f.add_segment(0, 1);
    let b = f.add_segment(1, 1);
    let info = f.index.segments[a].info_slices;
    // Both tails are in the same bin; the newest is found first.
    assert!(f.index.queue_contains(SpanRef::new(a, info)));
    assert!(f.index.queue_contains(SpanRef::new(b, info)));
    assert_eq!(f.alloc(1).segment(), b);

    f.index.remove_segment_runs(b);
    assert!(f.index.queue_contains(SpanRef::new(a, info)));
    assert_eq!(f.alloc(1).segment(), a);
  }
}
