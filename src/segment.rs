//! Segment records, sizing, and the per-thread table of owned segments.

use core::ops::{Index, IndexMut};
use core::ptr::NonNull;

use crate::commit_mask::CommitMask;
use crate::os::OsMemory;
use crate::page::Page;
use crate::slice::{Slice, SpanRef};
use crate::{
  MAX_SLICE_OFFSET, SEGMENT_SIZE, SLICE_SIZE, SLICES_PER_SEGMENT, align_up, checked_align_up,
};

/// Index of a segment in its pool's slot table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct SegmentId(pub(crate) u32);

impl SegmentId {
  #[inline]
  pub(crate) fn index(self) -> usize {
    self.0 as usize
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SegmentKind {
  /// 32MiB, many pages, free runs kept in span queues.
  Normal,
  /// Sized to one page; never queued.
  Huge,
}

/// Bookkeeping reserved at the front of every segment.
const SEGMENT_META_SIZE: usize =
  core::mem::size_of::<Segment>() + (SLICES_PER_SEGMENT + 1) * core::mem::size_of::<Slice>();

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SegmentLayout {
  /// Total slices of the segment.
  pub slices: usize,
  /// Slices taken by the info area (and its guard page in secure mode).
  pub info_slices: usize,
  /// Bytes before the first guard page.
  pub pre_size: usize,
}

/// Size a segment for `required` bytes (0 for a normal segment).
/// Returns `None` if the size overflows.
pub fn calculate_slices(required: usize, page_size: usize, secure: bool) -> Option<SegmentLayout> {
  let page_size = page_size.max(1);
  let pre_size = align_up(SEGMENT_META_SIZE, page_size);
  let mut guard_size = 0;
  let mut required = required;

  if secure {
    guard_size = page_size;
    if required > 0 {
      required = checked_align_up(required, SLICE_SIZE)?.checked_add(page_size)?;
    }
  }

  let info_size = align_up(pre_size + guard_size, SLICE_SIZE);
  let segment_size = if required == 0 {
    SEGMENT_SIZE
  } else {
    checked_align_up(required.checked_add(info_size)?.checked_add(guard_size)?, SLICE_SIZE)?
  };

  Some(SegmentLayout {
    slices: segment_size / SLICE_SIZE,
    info_slices: info_size / SLICE_SIZE,
    pre_size,
  })
}

pub struct Segment {
  pub(crate) id: SegmentId,
  pub(crate) memory: OsMemory,
  pub(crate) kind: SegmentKind,
  pub(crate) segment_slices: usize,
  pub(crate) info_slices: usize,
  /// Slices that carry runs; one less than `segment_slices` with a trailing guard page.
  pub(crate) slice_entries: usize,
  /// Live pages, not counting the info run.
  pub(crate) used: usize,
  /// Pages whose heap went away.
  pub(crate) abandoned: usize,
  pub(crate) abandoned_visits: usize,
  /// 0 while parked in the abandoned registry.
  pub(crate) thread_id: usize,
  pub(crate) allow_decommit: bool,
  pub(crate) allow_purge: bool,
  pub(crate) commit_mask: CommitMask,
  pub(crate) purge_mask: CommitMask,
  /// Deadline of the pending purge, 0 when none is armed.
  pub(crate) purge_expire: i64,
  pub(crate) slices: Box<[Slice]>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunState {
  Free,
  Used,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Run {
  pub index: usize,
  pub count: usize,
  pub state: RunState,
}

impl Segment {
  pub(crate) fn new(
    id: SegmentId,
    memory: OsMemory,
    kind: SegmentKind,
    layout: SegmentLayout,
    thread_id: usize,
    commit_mask: CommitMask,
  ) -> Self {
    let slice_entries = layout.slices.min(SLICES_PER_SEGMENT);
    let allow_decommit = !memory.is_pinned;
    Self {
      id,
      memory,
      kind,
      segment_slices: layout.slices,
      info_slices: layout.info_slices,
      slice_entries,
      used: 0,
      abandoned: 0,
      abandoned_visits: 0,
      thread_id,
      allow_decommit,
      allow_purge: false,
      commit_mask,
      purge_mask: CommitMask::empty(),
      purge_expire: 0,
      slices: (0..slice_entries).map(|_| Slice::Interior { offset: 0 }).collect(),
    }
  }

  pub fn id(&self) -> SegmentId {
    self.id
  }

  pub fn kind(&self) -> SegmentKind {
    self.kind
  }

  pub fn thread_id(&self) -> usize {
    self.thread_id
  }

  pub fn is_abandoned(&self) -> bool {
    self.thread_id == 0
  }

  pub fn used(&self) -> usize {
    self.used
  }

  pub fn abandoned(&self) -> usize {
    self.abandoned
  }

  pub fn abandoned_visits(&self) -> usize {
    self.abandoned_visits
  }

  pub fn slice_entries(&self) -> usize {
    self.slice_entries
  }

  pub fn info_slices(&self) -> usize {
    self.info_slices
  }

  pub fn commit_mask(&self) -> &CommitMask {
    &self.commit_mask
  }

  pub fn purge_mask(&self) -> &CommitMask {
    &self.purge_mask
  }

  pub fn purge_expire(&self) -> i64 {
    self.purge_expire
  }

  pub fn base(&self) -> NonNull<u8> {
    self.memory.base
  }

  pub fn memory(&self) -> &OsMemory {
    &self.memory
  }

  #[inline]
  pub fn size(&self) -> usize {
    self.segment_slices * SLICE_SIZE
  }

  #[inline]
  pub(crate) fn info_size(&self) -> usize {
    self.info_slices * SLICE_SIZE
  }

  /// Address `offset` bytes into the segment.
  #[inline]
  pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
    debug_assert!(offset <= self.size());
    // SAFETY: offset stays within the segment reservation.
    unsafe { self.memory.base.add(offset) }
  }

  #[inline]
  pub(crate) fn span(&self, index: usize) -> SpanRef {
    SpanRef::new(self.id, index)
  }

  /// Header index of the run containing slice `index`.
  #[inline]
  pub(crate) fn run_start(&self, index: usize) -> usize {
    match self.slices[index] {
      Slice::Interior { offset } => index - offset as usize,
      _ => index,
    }
  }

  pub fn page(&self, index: usize) -> Option<&Page> {
    self.slices.get(index)?.page()
  }

  pub(crate) fn page_mut(&mut self, index: usize) -> Option<&mut Page> {
    self.slices.get_mut(index)?.page_mut()
  }

  /// Start and size of the page whose run starts at `index`.
  pub(crate) fn page_start(&self, index: usize) -> (NonNull<u8>, usize) {
    let count = self.slices[index].count();
    (self.ptr_at(index * SLICE_SIZE), count * SLICE_SIZE)
  }

  /// Runs in address order, the info run first.
  pub fn runs(&self) -> impl Iterator<Item = Run> + '_ {
    let mut index = 0;
    core::iter::from_fn(move || {
      if index >= self.slice_entries {
        return None;
      }
      let slice = &self.slices[index];
      let count = slice.count();
      if count == 0 {
        return None;
      }
      let run = Run {
        index,
        count,
        state: if slice.is_free() { RunState::Free } else { RunState::Used },
      };
      index += count;
      Some(run)
    })
  }

  /// Panics if the slice index is inconsistent.
  pub fn validate(&self) {
    assert!(self.abandoned <= self.used, "more abandoned pages than used");
    assert!(
      self.commit_mask.all_set(&self.purge_mask),
      "purge mask {:?} not within commit mask {:?}",
      self.purge_mask,
      self.commit_mask
    );
    if self.purge_mask.is_empty() {
      assert_eq!(self.purge_expire, 0, "purge deadline armed with nothing to purge");
    }

    let mut index = 0;
    let mut used_runs = 0;
    let mut prev_free = false;
    while index < self.slice_entries {
      let slice = &self.slices[index];
      let count = slice.count();
      assert!(count > 0, "slice {index} should start a run");

      let last = index + count - 1;
      if last > index && last < self.slice_entries {
        match self.slices[last] {
          Slice::Interior { offset } => {
            assert_eq!(offset as usize, count - 1, "bad back-offset at slice {last}")
          }
          ref other => panic!("last slice {last} of run {index} is {other:?}"),
        }
      }

      match slice {
        Slice::Used { .. } => {
          used_runs += 1;
          prev_free = false;
          let linked = (count - 1).min(MAX_SLICE_OFFSET).min(self.slice_entries - index - 1);
          for i in 1..=linked {
            match self.slices[index + i] {
              Slice::Interior { offset } => {
                assert_eq!(offset as usize, i, "bad offset at slice {}", index + i)
              }
              ref other => panic!("slice {} inside used run {index} is {other:?}", index + i),
            }
          }
        }
        Slice::Free { .. } => {
          assert!(!prev_free || self.kind == SegmentKind::Huge, "adjacent free runs at {index}");
          prev_free = true;
        }
        Slice::Interior { .. } => unreachable!(),
      }
      index += count;
    }

    match self.kind {
      SegmentKind::Normal => assert_eq!(index, self.slice_entries, "runs do not cover the segment"),
      SegmentKind::Huge => assert!(index >= self.slice_entries),
    }
    assert_eq!(used_runs, self.used + 1, "used count does not match used runs");
  }
}

// =============================================================================
// Owned segments
// =============================================================================

/// Segments owned by one thread, addressed by id.
#[derive(Default)]
pub(crate) struct SegmentMap {
  entries: Vec<Option<Box<Segment>>>,
  len: usize,
}

impl SegmentMap {
  pub(crate) fn insert(&mut self, segment: Box<Segment>) {
    let index = segment.id.index();
    if index >= self.entries.len() {
      self.entries.resize_with(index + 1, || None);
    }
    debug_assert!(self.entries[index].is_none());
    self.entries[index] = Some(segment);
    self.len += 1;
  }

  pub(crate) fn remove(&mut self, id: SegmentId) -> Option<Box<Segment>> {
    let segment = self.entries.get_mut(id.index())?.take()?;
    self.len -= 1;
    Some(segment)
  }

  pub(crate) fn get(&self, id: SegmentId) -> Option<&Segment> {
    self.entries.get(id.index())?.as_deref()
  }

  pub(crate) fn get_mut(&mut self, id: SegmentId) -> Option<&mut Segment> {
    self.entries.get_mut(id.index())?.as_deref_mut()
  }

  pub(crate) fn len(&self) -> usize {
    self.len
  }

  pub(crate) fn ids(&self) -> Vec<SegmentId> {
    self.entries.iter().flatten().map(|s| s.id).collect()
  }

  #[inline]
  pub(crate) fn slice(&self, span: SpanRef) -> &Slice {
    &self[span.segment].slices[span.index as usize]
  }

  #[inline]
  pub(crate) fn slice_mut(&mut self, span: SpanRef) -> &mut Slice {
    &mut self[span.segment].slices[span.index as usize]
  }
}

impl Index<SegmentId> for SegmentMap {
  type Output = Segment;

  fn index(&self, id: SegmentId) -> &Segment {
    match self.get(id) {
      Some(segment) => segment,
      None => panic!("segment {id:?} is not owned by this thread"),
    }
  }
}

impl IndexMut<SegmentId> for SegmentMap {
  fn index_mut(&mut self, id: SegmentId) -> &mut Segment {
    match self.get_mut(id) {
      Some(segment) => segment,
      None => panic!("segment {id:?} is not owned by this thread"),
    }
  }
}
