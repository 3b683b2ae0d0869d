//! Commit tracking and the delayed purge scheduler of a segment.
//!
//! Ranges are byte offsets into the segment. Commits round outward to whole
//! commit units, purges round inward, so a purge never touches a unit that
//! is partly in use.
//!
//! Purge state per segment: clean (`purge_mask` empty, no deadline), pending
//! (bits set, deadline in the future) or expired (deadline passed, the next
//! `try_purge` or schedule call acts on it).

use crate::commit_mask::CommitMask;
use crate::options::Options;
use crate::os::{Os, OsError};
use crate::segment::{Segment, SegmentKind};
use crate::{COMMIT_MASK_BITS, COMMIT_SIZE, SEGMENT_SIZE, align_down, align_up};

/// Commit units covered by a byte range, and the bytes an OS call should touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CommitRange {
  pub(crate) start: usize,
  pub(crate) len: usize,
  pub(crate) mask: CommitMask,
}

impl Segment {
  pub(crate) fn commit_range(
    &self,
    conservative: bool,
    offset: usize,
    size: usize,
  ) -> Option<CommitRange> {
    if size == 0 || size > SEGMENT_SIZE || self.kind == SegmentKind::Huge {
      return None;
    }
    let seg_size = self.size();
    if offset >= seg_size {
      return None;
    }

    let end = offset.checked_add(size)?;
    let (start, end) = if conservative {
      (align_up(offset, COMMIT_SIZE), align_down(end, COMMIT_SIZE))
    } else {
      (align_down(offset, COMMIT_SIZE), align_up(end, COMMIT_SIZE))
    };
    let end = end.min(seg_size);
    if end <= start {
      return None;
    }

    let bit_start = start / COMMIT_SIZE;
    let bit_count = (end - start) / COMMIT_SIZE;
    if bit_start + bit_count > COMMIT_MASK_BITS {
      log::warn!(
        "segment {:?}: commit range {start:#x}..{end:#x} exceeds the commit mask",
        self.id
      );
      debug_assert!(false, "commit range exceeds the commit mask");
      return None;
    }

    // Widening a commit must not reach back over the info area (or its guard page).
    let info_size = self.info_size();
    let os_start = if !conservative && offset >= info_size && start < info_size {
      info_size
    } else {
      start
    };

    Some(CommitRange {
      start: os_start,
      len: end - os_start,
      mask: CommitMask::range(bit_start, bit_count),
    })
  }

  pub(crate) fn commit<O: Os>(
    &mut self,
    os: &O,
    options: &Options,
    offset: usize,
    size: usize,
  ) -> Result<(), OsError> {
    let Some(range) = self.commit_range(false, offset, size) else {
      return Ok(());
    };

    if !self.commit_mask.all_set(&range.mask) {
      let is_zero = unsafe { os.commit(self.ptr_at(range.start), range.len)? };
      log::trace!(
        "segment {:?}: committed {:#x} bytes at +{:#x} (zero={is_zero})",
        self.id,
        range.len,
        range.start
      );
      self.commit_mask.set(&range.mask);
    }

    // Reusing part of a pending range pushes the rest of it back.
    if self.purge_mask.any_set(&range.mask) {
      self.purge_mask.clear(&range.mask);
      self.purge_expire = if self.purge_mask.is_empty() {
        0
      } else {
        os.clock_now().saturating_add(options.purge_delay)
      };
    }
    Ok(())
  }

  #[inline]
  pub(crate) fn ensure_committed<O: Os>(
    &mut self,
    os: &O,
    options: &Options,
    offset: usize,
    size: usize,
  ) -> Result<(), OsError> {
    if self.commit_mask.is_full() && self.purge_mask.is_empty() {
      return Ok(());
    }
    self.commit(os, options, offset, size)
  }

  /// Purges a range right away.
  pub(crate) fn purge<O: Os>(&mut self, os: &O, options: &Options, offset: usize, size: usize) {
    if !self.allow_purge {
      return;
    }
    let Some(range) = self.commit_range(true, offset, size) else {
      return;
    };

    if self.commit_mask.any_set(&range.mask) {
      let decommitted =
        unsafe { os.purge(self.ptr_at(range.start), range.len, options.purge_decommits) };
      log::trace!(
        "segment {:?}: purged {:#x} bytes at +{:#x} (decommitted={decommitted})",
        self.id,
        range.len,
        range.start
      );
      if decommitted {
        self.commit_mask.clear(&range.mask);
      }
    }
    self.purge_mask.clear(&range.mask);
    if self.purge_mask.is_empty() {
      self.purge_expire = 0;
    }
  }

  /// Marks a freed range for purging after the configured delay.
  pub(crate) fn schedule_purge<O: Os>(
    &mut self,
    os: &O,
    options: &Options,
    offset: usize,
    size: usize,
  ) {
    if !self.allow_purge {
      return;
    }
    if options.purge_delay == 0 {
      self.purge(os, options, offset, size);
      return;
    }
    let Some(range) = self.commit_range(true, offset, size) else {
      return;
    };

    // Only committed units are worth purging.
    let pending = self.commit_mask.intersect(&range.mask);
    if pending.is_empty() {
      return;
    }
    self.purge_mask.set(&pending);

    let now = os.clock_now();
    if self.purge_expire == 0 {
      self.purge_expire = now.saturating_add(options.purge_delay);
    } else if self.purge_expire <= now {
      if self.purge_expire.saturating_add(options.purge_extend_delay) <= now {
        self.try_purge(os, options, true);
      } else {
        self.purge_expire = now.saturating_add(options.purge_extend_delay);
      }
    } else {
      self.purge_expire = self.purge_expire.saturating_add(options.purge_extend_delay);
    }
  }

  /// Purges every pending range if the deadline passed (or `force`).
  pub(crate) fn try_purge<O: Os>(&mut self, os: &O, options: &Options, force: bool) {
    if !self.allow_purge || self.purge_expire == 0 || self.purge_mask.is_empty() {
      return;
    }
    if !force && os.clock_now() < self.purge_expire {
      return;
    }

    let mask = core::mem::take(&mut self.purge_mask);
    self.purge_expire = 0;
    for (start, count) in mask.runs() {
      self.purge(os, options, start * COMMIT_SIZE, count * COMMIT_SIZE);
    }
  }
}
