//! Lock-free stacks of slot indices with an ABA tag in the head word.
//!
//! Head layout: tag in the high 32 bits, `index + 1` in the low 32 bits
//! (0 = empty). Every successful CAS bumps the tag, so a head that was popped
//! and pushed back in between never compares equal. Links live in the slot
//! table (also `index + 1` encoded) and outlive any stack operation.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Where a stack finds the `next` link of an element.
pub(crate) trait Links {
  fn link(&self, index: u32) -> &AtomicU32;
}

#[inline(always)]
fn pack(tag: u32, raw: u32) -> u64 {
  ((tag as u64) << 32) | raw as u64
}

#[inline(always)]
fn unpack(head: u64) -> (u32, u32) {
  ((head >> 32) as u32, head as u32)
}

#[inline(always)]
pub(crate) fn encode(index: Option<u32>) -> u32 {
  index.map_or(0, |i| i + 1)
}

#[inline(always)]
pub(crate) fn decode(raw: u32) -> Option<u32> {
  raw.checked_sub(1)
}

pub(crate) struct TaggedStack {
  head: AtomicU64,
}

impl TaggedStack {
  pub(crate) const fn new() -> Self {
    Self {
      head: AtomicU64::new(0),
    }
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    unpack(self.head.load(Ordering::Relaxed)).1 == 0
  }

  pub(crate) fn first(&self) -> Option<u32> {
    decode(unpack(self.head.load(Ordering::Acquire)).1)
  }

  pub(crate) fn push(&self, links: &impl Links, index: u32) {
    self.push_chain(links, index, index);
  }

  /// Pushes an already linked chain `first ..= last`.
  pub(crate) fn push_chain(&self, links: &impl Links, first: u32, last: u32) {
    let mut head = self.head.load(Ordering::Relaxed);
    loop {
      let (tag, raw) = unpack(head);
      links.link(last).store(raw, Ordering::Relaxed);
      let new = pack(tag.wrapping_add(1), encode(Some(first)));
      match self
        .head
        .compare_exchange_weak(head, new, Ordering::Release, Ordering::Relaxed)
      {
        Ok(_) => return,
        Err(h) => head = h,
      }
    }
  }

  pub(crate) fn pop(&self, links: &impl Links) -> Option<u32> {
    let mut head = self.head.load(Ordering::Acquire);
    loop {
      let (tag, raw) = unpack(head);
      let first = decode(raw)?;
      // May read a link that is being rewritten; the tagged CAS then fails.
      let next = links.link(first).load(Ordering::Relaxed);
      let new = pack(tag.wrapping_add(1), next);
      match self
        .head
        .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => return Some(first),
        Err(h) => head = h,
      }
    }
  }

  /// Detaches the whole stack, returning its first element.
  pub(crate) fn take_all(&self) -> Option<u32> {
    let mut head = self.head.load(Ordering::Acquire);
    loop {
      let (tag, raw) = unpack(head);
      decode(raw)?;
      match self.head.compare_exchange_weak(
        head,
        pack(tag.wrapping_add(1), 0),
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return decode(raw),
        Err(h) => head = h,
      }
    }
  }

  /// Installs a chain only if the stack is empty right now.
  pub(crate) fn try_install(&self, first: u32) -> bool {
    let head = self.head.load(Ordering::Acquire);
    let (tag, raw) = unpack(head);
    if raw != 0 {
      return false;
    }
    self
      .head
      .compare_exchange(
        head,
        pack(tag.wrapping_add(1), encode(Some(first))),
        Ordering::AcqRel,
        Ordering::Relaxed,
      )
      .is_ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Table(Vec<AtomicU32>);

  impl Table {
    fn new(n: usize) -> Self {
      Self((0..n).map(|_| AtomicU32::new(0)).collect())
    }
  }

  impl Links for Table {
    fn link(&self, index: u32) -> &AtomicU32 {
      &self.0[index as usize]
    }
  }

  #[test]
  fn test_lifo_order() {
    let t = Table::new(4);
    let s = TaggedStack::new();
    assert!(s.is_empty());
    assert_eq!(s.pop(&t), None);

    s.push(&t, 0);
    s.push(&t, 3);
    s.push(&t, 1);
    assert_eq!(s.first(), Some(1));
    assert_eq!(s.pop(&t), Some(1));
    assert_eq!(s.pop(&t), Some(3));
    assert_eq!(s.pop(&t), Some(0));
    assert_eq!(s.pop(&t), None);
  }

  #[test]
  fn test_tag_changes_on_every_update() {
    let t = Table::new(2);
    let s = TaggedStack::new();
    s.push(&t, 0);
    let before = s.head.load(Ordering::Relaxed);
    s.pop(&t);
    s.push(&t, 0);
    let after = s.head.load(Ordering::Relaxed);
    assert_eq!(unpack(before).1, unpack(after).1);
    assert_ne!(before, after);
  }

  #[test]
  fn test_take_all_and_chain_push() {
    let t = Table::new(4);
    let a = TaggedStack::new();
    let b = TaggedStack::new();
    a.push(&t, 0);
    a.push(&t, 1);
    a.push(&t, 2);

    let first = a.take_all().unwrap();
    assert!(a.is_empty());
    assert_eq!(first, 2);

    // 2 -> 1 -> 0 is still linked; prepend it onto b.
    b.push(&t, 3);
    b.push_chain(&t, first, 0);
    let drained: Vec<_> = std::iter::from_fn(|| b.pop(&t)).collect();
    assert_eq!(drained, vec![2, 1, 0, 3]);
  }

  #[test]
  fn test_try_install_only_when_empty() {
    let t = Table::new(2);
    let s = TaggedStack::new();
    assert!(s.try_install(1));
    assert!(!s.try_install(0));
    assert_eq!(s.pop(&t), Some(1));
  }

  #[test]
  fn test_concurrent_push_pop_keeps_every_element() {
    const N: u32 = 64;
    const ROUNDS: usize = 2_000;
    let t = Table::new(N as usize);
    let s = TaggedStack::new();
    for i in 0..N {
      s.push(&t, i);
    }

    std::thread::scope(|scope| {
      for _ in 0..4 {
        scope.spawn(|| {
          for _ in 0..ROUNDS {
            if let Some(i) = s.pop(&t) {
              s.push(&t, i);
            }
          }
        });
      }
    });

    let mut seen: Vec<_> = std::iter::from_fn(|| s.pop(&t)).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..N).collect::<Vec<_>>());
  }
}
