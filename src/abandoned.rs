//! Registry of abandoned segments.
//!
//! Two stacks share the slots' link field: `abandoned` holds segments waiting
//! to be reclaimed, `visited` holds segments a reclaim attempt looked at and
//! passed over. Visited segments go back to `abandoned` in bulk once it runs
//! dry. Pops are bracketed by a reader count so a segment's memory is never
//! released while a pop may still be reading its link.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::segment::SegmentId;
use crate::stack::{Links, TaggedStack, decode};

pub(crate) struct AbandonedPool {
  abandoned: TaggedStack,
  visited: TaggedStack,
  // Approximate: updated around, not atomically with, the list operations.
  abandoned_count: AtomicUsize,
  visited_count: AtomicUsize,
  readers: AtomicUsize,
}

fn saturating_sub(counter: &AtomicUsize, n: usize) {
  let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(c.saturating_sub(n)));
}

impl AbandonedPool {
  pub(crate) const fn new() -> Self {
    Self {
      abandoned: TaggedStack::new(),
      visited: TaggedStack::new(),
      abandoned_count: AtomicUsize::new(0),
      visited_count: AtomicUsize::new(0),
      readers: AtomicUsize::new(0),
    }
  }

  pub(crate) fn abandoned_count(&self) -> usize {
    self.abandoned_count.load(Ordering::Relaxed)
  }

  pub(crate) fn visited_count(&self) -> usize {
    self.visited_count.load(Ordering::Relaxed)
  }

  pub(crate) fn push(&self, links: &impl Links, id: SegmentId) {
    self.abandoned_count.fetch_add(1, Ordering::Relaxed);
    self.abandoned.push(links, id.0);
  }

  pub(crate) fn visited_push(&self, links: &impl Links, id: SegmentId) {
    self.visited_count.fetch_add(1, Ordering::Relaxed);
    self.visited.push(links, id.0);
  }

  /// Moves the visited list back onto the abandoned list.
  /// Returns false if there was nothing to move.
  pub(crate) fn visited_revisit(&self, links: &impl Links) -> bool {
    let Some(first) = self.visited.take_all() else {
      return false;
    };

    // Usually the abandoned list is empty here and the chain goes in as is.
    let count = self.visited_count.load(Ordering::Relaxed);
    if !self.abandoned.try_install(first) {
      let mut last = first;
      while let Some(next) = decode(links.link(last).load(Ordering::Relaxed)) {
        last = next;
      }
      self.abandoned.push_chain(links, first, last);
    }
    saturating_sub(&self.visited_count, count);
    self.abandoned_count.fetch_add(count, Ordering::Relaxed);
    true
  }

  /// Pops an abandoned segment, refilling from the visited list when empty.
  pub(crate) fn pop(&self, links: &impl Links) -> Option<SegmentId> {
    if self.abandoned.is_empty() && !self.visited_revisit(links) {
      return None;
    }

    self.readers.fetch_add(1, Ordering::AcqRel);
    let popped = self.abandoned.pop(links);
    self.readers.fetch_sub(1, Ordering::AcqRel);

    let index = popped?;
    links.link(index).store(0, Ordering::Relaxed);
    saturating_sub(&self.abandoned_count, 1);
    Some(SegmentId(index))
  }

  /// Waits until no pop is in its read window.
  pub(crate) fn await_readers(&self) {
    while self.readers.load(Ordering::Acquire) != 0 {
      std::thread::yield_now();
    }
  }

  pub(crate) fn first_abandoned(&self) -> Option<SegmentId> {
    self.abandoned.first().map(SegmentId)
  }

  pub(crate) fn first_visited(&self) -> Option<SegmentId> {
    self.visited.first().map(SegmentId)
  }
}
