//! Fixed-width bitset over the commit units of a segment.
//!
//! One bit per [`COMMIT_SIZE`](crate::COMMIT_SIZE) unit of a normal segment.
//! Used twice per segment: which units are committed, and which committed units
//! are scheduled for purge.

use crate::COMMIT_MASK_BITS;

const FIELD_BITS: usize = u64::BITS as usize;
const FIELD_COUNT: usize = COMMIT_MASK_BITS / FIELD_BITS;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitMask {
  fields: [u64; FIELD_COUNT],
}

impl CommitMask {
  pub const fn empty() -> Self {
    Self {
      fields: [0; FIELD_COUNT],
    }
  }

  pub const fn full() -> Self {
    Self {
      fields: [u64::MAX; FIELD_COUNT],
    }
  }

  /// Mask with bits `[start, start + count)` set.
  pub fn range(start: usize, count: usize) -> Self {
    debug_assert!(start + count <= COMMIT_MASK_BITS);
    if count == COMMIT_MASK_BITS {
      return Self::full();
    }

    let mut mask = Self::empty();
    let mut remaining = count;
    let mut i = start / FIELD_BITS;
    let mut ofs = start % FIELD_BITS;
    while remaining > 0 && i < FIELD_COUNT {
      let n = remaining.min(FIELD_BITS - ofs);
      let bits = if n >= FIELD_BITS { u64::MAX } else { (1u64 << n) - 1 };
      mask.fields[i] = bits << ofs;
      remaining -= n;
      ofs = 0;
      i += 1;
    }
    mask
  }

  pub fn is_empty(&self) -> bool {
    self.fields.iter().all(|&f| f == 0)
  }

  pub fn is_full(&self) -> bool {
    self.fields.iter().all(|&f| f == u64::MAX)
  }

  /// True if every bit of `other` is set in `self`.
  pub fn all_set(&self, other: &CommitMask) -> bool {
    self
      .fields
      .iter()
      .zip(other.fields.iter())
      .all(|(&a, &b)| a & b == b)
  }

  /// True if any bit of `other` is set in `self`.
  pub fn any_set(&self, other: &CommitMask) -> bool {
    self
      .fields
      .iter()
      .zip(other.fields.iter())
      .any(|(&a, &b)| a & b != 0)
  }

  pub fn intersect(&self, other: &CommitMask) -> CommitMask {
    let mut res = *self;
    for (a, &b) in res.fields.iter_mut().zip(other.fields.iter()) {
      *a &= b;
    }
    res
  }

  /// `self |= other`
  pub fn set(&mut self, other: &CommitMask) {
    for (a, &b) in self.fields.iter_mut().zip(other.fields.iter()) {
      *a |= b;
    }
  }

  /// `self &= !other`
  pub fn clear(&mut self, other: &CommitMask) {
    for (a, &b) in self.fields.iter_mut().zip(other.fields.iter()) {
      *a &= !b;
    }
  }

  pub fn count(&self) -> usize {
    self.fields.iter().map(|f| f.count_ones() as usize).sum()
  }

  /// Bytes covered by the set bits when the whole mask spans `total` bytes.
  pub fn committed_size(&self, total: usize) -> usize {
    if self.is_full() {
      total
    } else {
      self.count() * (total / COMMIT_MASK_BITS)
    }
  }

  /// Next maximal run of set bits starting at or after `from`, as `(start, len)`.
  pub fn next_run(&self, from: usize) -> Option<(usize, usize)> {
    let mut idx = from;
    while idx < COMMIT_MASK_BITS {
      let field = self.fields[idx / FIELD_BITS] >> (idx % FIELD_BITS);
      if field != 0 {
        idx += field.trailing_zeros() as usize;
        break;
      }
      idx = (idx / FIELD_BITS + 1) * FIELD_BITS;
    }
    if idx >= COMMIT_MASK_BITS {
      return None;
    }

    let start = idx;
    loop {
      let ofs = idx % FIELD_BITS;
      let ones = (self.fields[idx / FIELD_BITS] >> ofs).trailing_ones() as usize;
      idx += ones;
      // Run continues into the next field only if it reached the top bit.
      if ones < FIELD_BITS - ofs || idx >= COMMIT_MASK_BITS {
        break;
      }
    }
    Some((start, idx - start))
  }

  /// All maximal runs of set bits, low to high.
  pub fn runs(&self) -> Runs<'_> {
    Runs { mask: self, next: 0 }
  }
}

impl core::fmt::Debug for CommitMask {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.write_str("CommitMask[")?;
    for (i, (start, len)) in self.runs().enumerate() {
      if i > 0 {
        f.write_str(",")?;
      }
      write!(f, "{}..{}", start, start + len)?;
    }
    f.write_str("]")
  }
}

pub struct Runs<'a> {
  mask: &'a CommitMask,
  next: usize,
}

impl Iterator for Runs<'_> {
  type Item = (usize, usize);

  fn next(&mut self) -> Option<Self::Item> {
    let (start, len) = self.mask.next_run(self.next)?;
    self.next = start + len;
    Some((start, len))
  }
}
