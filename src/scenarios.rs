//! End-to-end behaviour across threads, heaps and the registry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::commit_mask::CommitMask;
use crate::page::{PageAlloc, PageArea, PageId};
use crate::testing::{TestOs, test_pool, test_pool_with};
use crate::thread::{HeapId, ThreadSegments};
use crate::{
  COMMIT_SIZE, MEDIUM_PAGE_SIZE, Options, Reclaimed, RunState, SLICE_SIZE, SegmentKind, SegmentPool,
};

fn alloc(t: &mut ThreadSegments<TestOs>, heap: HeapId, block_size: usize) -> PageArea {
  match t.page_alloc(heap, block_size, 0) {
    Ok(PageAlloc::Page(area)) => area,
    other => panic!("expected a page for {block_size}-byte blocks, got {other:?}"),
  }
}

fn release(t: &mut ThreadSegments<TestOs>, page: PageId) {
  t.page_mut(page).unwrap().used = 0;
  assert!(t.page_free(page, false));
}

/// Commit units lying fully inside a page.
fn inner_units(area: &PageArea, base: usize) -> CommitMask {
  let start = area.start.as_ptr() as usize - base;
  let first = start.div_ceil(COMMIT_SIZE);
  let end = (start + area.size) / COMMIT_SIZE;
  CommitMask::range(first, end - first)
}

fn check_all(t: &ThreadSegments<TestOs>) {
  for id in t.segment_ids() {
    t.validate(id);
    let segment = t.segment(id).unwrap();
    if segment.kind() == SegmentKind::Normal {
      let covered: usize = segment.runs().map(|r| r.count).sum();
      assert_eq!(covered, segment.slice_entries());
    }
  }
}

#[test]
fn test_freed_neighbours_serve_a_double_page() {
  let pool = test_pool();
  let mut t = ThreadSegments::with_thread_id(pool.clone(), 1);
  let heap = t.heap_new(0, None);

  let a = alloc(&mut t, heap, 32 * 1024);
  let b = alloc(&mut t, heap, 32 * 1024);
  let c = alloc(&mut t, heap, 32 * 1024);
  let count = MEDIUM_PAGE_SIZE / SLICE_SIZE;
  assert_eq!(b.id.slice_index(), a.id.slice_index() + count);
  assert_eq!(c.id.slice_index(), b.id.slice_index() + count);

  release(&mut t, b.id);
  release(&mut t, a.id);
  let segment = t.segment(a.id.segment()).unwrap();
  let merged = segment.runs().find(|r| r.index == a.id.slice_index()).unwrap();
  assert_eq!((merged.count, merged.state), (2 * count, RunState::Free));

  let (allocs, commits) = (pool.os().allocs(), pool.os().commits());
  let double = alloc(&mut t, heap, 2 * MEDIUM_PAGE_SIZE);
  assert_eq!(double.id, a.id);
  assert_eq!(double.size, 2 * MEDIUM_PAGE_SIZE);
  assert_eq!(pool.os().allocs(), allocs);
  assert_eq!(pool.os().commits(), commits);
  check_all(&t);
}

#[test]
fn test_exited_thread_page_reclaimed_by_another() {
  let pool = test_pool();
  let page = {
    let mut t = ThreadSegments::with_thread_id(pool.clone(), 1);
    let heap = t.heap_new(0, None);
    let area = alloc(&mut t, heap, 40 << 20);
    assert_eq!(t.segment(area.id.segment()).unwrap().kind(), SegmentKind::Huge);
    // The block layer split the huge page into 1MiB blocks, three of them live.
    let page = t.page_mut(area.id).unwrap();
    page.block_size = 1 << 20;
    page.reserved = (area.size >> 20) as u32;
    for _ in 0..3 {
      assert!(page.note_alloc());
    }
    area.id
  };
  assert_eq!(pool.abandoned_count(), 1);
  assert_eq!(pool.owner_of(page.segment()), 0);

  let mut t = ThreadSegments::with_thread_id(pool.clone(), 2);
  let heap = t.heap_new(0, None);
  assert_eq!(t.try_reclaim(heap, 1, 1 << 20), Some(Reclaimed::RightPage));
  let segment = t.segment(page.segment()).unwrap();
  assert_eq!(segment.thread_id(), 2);
  assert_eq!(segment.abandoned(), 0);
  assert_eq!(t.page(page).unwrap().heap(), Some(heap));

  release(&mut t, page);
  assert_eq!(t.segment_count(), 0);
  assert_eq!(pool.os().frees(), pool.os().allocs());
}

#[test]
fn test_zero_purge_delay_decommits_on_free() {
  let pool = test_pool_with(Options {
    purge_delay: 0,
    ..Options::default()
  });
  let mut t = ThreadSegments::with_thread_id(pool.clone(), 1);
  let heap = t.heap_new(0, None);
  let a = alloc(&mut t, heap, 32 * 1024);
  let _keep = alloc(&mut t, heap, 32 * 1024);
  let base = t.segment(a.id.segment()).unwrap().base().as_ptr() as usize;
  let units = inner_units(&a, base);
  assert!(t.segment(a.id.segment()).unwrap().commit_mask().all_set(&units));

  release(&mut t, a.id);
  let segment = t.segment(a.id.segment()).unwrap();
  assert!(!segment.commit_mask().any_set(&units));
  assert!(segment.purge_mask().is_empty());

  // Reusing the run commits it again.
  let commits = pool.os().commits();
  let again = alloc(&mut t, heap, 32 * 1024);
  assert_eq!(again.id, a.id);
  assert!(pool.os().commits() > commits);
  assert!(t.segment(a.id.segment()).unwrap().commit_mask().all_set(&units));
  check_all(&t);
}

#[test]
fn test_purge_waits_for_delay() {
  let pool = test_pool_with(Options {
    purge_delay: 100,
    ..Options::default()
  });
  let mut t = ThreadSegments::with_thread_id(pool.clone(), 1);
  let heap = t.heap_new(0, None);
  let a = alloc(&mut t, heap, 32 * 1024);
  let _keep = alloc(&mut t, heap, 32 * 1024);
  let id = a.id.segment();
  let units = inner_units(&a, t.segment(id).unwrap().base().as_ptr() as usize);

  release(&mut t, a.id);
  let segment = t.segment(id).unwrap();
  assert!(segment.commit_mask().all_set(&units));
  assert!(segment.purge_mask().all_set(&units));

  pool.os().advance(99);
  t.segment_try_purge(id, false);
  assert!(t.segment(id).unwrap().purge_mask().all_set(&units));

  pool.os().advance(1);
  t.segment_try_purge(id, false);
  let segment = t.segment(id).unwrap();
  assert!(!segment.commit_mask().any_set(&units));
  assert!(segment.purge_mask().is_empty());
  assert_eq!(segment.purge_expire(), 0);
  check_all(&t);
}

#[test]
fn test_forced_purge_twice_is_one_purge() {
  let pool = test_pool();
  let mut t = ThreadSegments::with_thread_id(pool.clone(), 1);
  let heap = t.heap_new(0, None);
  let a = alloc(&mut t, heap, 32 * 1024);
  let _keep = alloc(&mut t, heap, 32 * 1024);
  let id = a.id.segment();
  release(&mut t, a.id);

  t.segment_try_purge(id, true);
  let (commit, purges) = (*t.segment(id).unwrap().commit_mask(), pool.os().purges());
  t.segment_try_purge(id, true);
  assert_eq!(*t.segment(id).unwrap().commit_mask(), commit);
  assert_eq!(pool.os().purges(), purges);
  assert!(t.segment(id).unwrap().purge_mask().is_empty());
}

#[test]
fn test_random_alloc_free_keeps_index_consistent() {
  const SIZES: [usize; 7] = [64, 2048, 16 * 1024, 64 * 1024, 300 * 1024, 1_500_000, 6 << 20];
  let pool = test_pool_with(Options {
    purge_delay: 5,
    ..Options::default()
  });
  let mut t = ThreadSegments::with_thread_id(pool.clone(), 1);
  let heap = t.heap_new(0, None);
  let mut rng = StdRng::seed_from_u64(0x5e6_3e47);
  let mut live: Vec<PageId> = Vec::new();

  for _ in 0..1500 {
    if live.is_empty() || (live.len() < 64 && rng.random_bool(0.55)) {
      let size = SIZES[rng.random_range(0..SIZES.len())];
      live.push(alloc(&mut t, heap, size).id);
    } else {
      let page = live.swap_remove(rng.random_range(0..live.len()));
      release(&mut t, page);
    }
    if rng.random_bool(0.1) {
      pool.os().advance(rng.random_range(0..8));
      let ids = t.segment_ids();
      if !ids.is_empty() {
        t.segment_try_purge(ids[rng.random_range(0..ids.len())], rng.random_bool(0.3));
      }
    }
    check_all(&t);
  }

  for page in live.drain(..) {
    release(&mut t, page);
  }
  assert_eq!(t.segment_count(), 0);
  assert_eq!(pool.os().frees(), pool.os().allocs());
}

#[test]
fn test_pages_from_many_heaps_route_back_by_tag() {
  let pool = test_pool();
  let pages: Vec<PageId> = {
    let mut t = ThreadSegments::with_thread_id(pool.clone(), 1);
    (0..4u8)
      .map(|tag| {
        let heap = t.heap_new(tag, None);
        let page = alloc(&mut t, heap, 64 << tag).id;
        assert!(t.page_mut(page).unwrap().note_alloc());
        page
      })
      .collect()
  };
  assert_eq!(pool.abandoned_count(), 1);

  let mut t = ThreadSegments::with_thread_id(pool.clone(), 2);
  let heaps: Vec<HeapId> = (0..4u8).map(|tag| t.heap_new(tag, None)).collect();
  t.abandoned_reclaim_all(heaps[0]);
  for (page, heap) in pages.iter().zip(&heaps) {
    assert_eq!(t.page(*page).unwrap().heap(), Some(*heap));
    assert_eq!(t.heap_pages(*heap).collect::<Vec<_>>(), vec![*page]);
  }
  assert_eq!(t.segment(pages[0].segment()).unwrap().abandoned(), 0);
}

#[test]
fn test_huge_page_freed_by_any_thread() {
  let pool = test_pool_with(Options {
    huge_page_abandon: true,
    ..Options::default()
  });
  let mut owner = ThreadSegments::with_thread_id(pool.clone(), 1);
  let heap = owner.heap_new(0, None);
  let area = alloc(&mut owner, heap, 40 << 20);
  assert_eq!(owner.segment_count(), 0);
  assert_eq!(owner.heap_pages(heap).count(), 0);
  assert_eq!(pool.owner_of(area.id.segment()), 0);
  assert_eq!(pool.abandoned_count(), 0);
  unsafe { area.start.as_ptr().write_bytes(1, 4096) };

  let mut other = ThreadSegments::with_thread_id(pool.clone(), 2);
  assert!(other.page_free(area.id, false));
  assert_eq!(other.segment_count(), 0);
  assert_eq!(pool.os().frees(), 1);
  // Already gone.
  assert!(!other.page_free(area.id, false));
}

#[test]
fn test_concurrent_abandon_and_reclaim() {
  const PRODUCERS: usize = 8;
  const CONSUMERS: usize = 3;
  const PAGES: usize = 4;

  let pool: Arc<SegmentPool<TestOs>> = test_pool_with(Options {
    max_segments: 64,
    ..Options::default()
  });
  let barrier = Barrier::new(PRODUCERS + CONSUMERS);
  let exited = AtomicUsize::new(0);

  let reclaimed: Vec<Vec<PageId>> = std::thread::scope(|s| {
    for _ in 0..PRODUCERS {
      s.spawn(|| {
        let mut t = ThreadSegments::new(pool.clone());
        let heap = t.heap_new(0, None);
        for _ in 0..PAGES {
          let page = alloc(&mut t, heap, 64).id;
          assert!(t.page_mut(page).unwrap().note_alloc());
        }
        barrier.wait();
        drop(t);
        exited.fetch_add(1, Ordering::SeqCst);
      });
    }

    let mut consumers = Vec::new();
    for _ in 0..CONSUMERS {
      consumers.push(s.spawn(|| {
        let mut t = ThreadSegments::new(pool.clone());
        let heap = t.heap_new(0, None);
        barrier.wait();
        loop {
          if t.try_reclaim(heap, 1, 64).is_none()
            && exited.load(Ordering::SeqCst) == PRODUCERS
            && pool.abandoned_count() + pool.visited_count() == 0
          {
            break;
          }
          std::thread::yield_now();
        }
        let pages: Vec<PageId> = t.heap_pages(heap).collect();
        for &page in &pages {
          release(&mut t, page);
        }
        pages
      }));
    }
    consumers.into_iter().map(|h| h.join().unwrap()).collect()
  });

  // Anything a consumer gave up on is still in the registry.
  let mut t = ThreadSegments::with_thread_id(pool.clone(), usize::MAX);
  let heap = t.heap_new(0, None);
  t.abandoned_reclaim_all(heap);
  let leftover: Vec<PageId> = t.heap_pages(heap).collect();
  for &page in &leftover {
    release(&mut t, page);
  }

  let all: Vec<PageId> = reclaimed.into_iter().flatten().chain(leftover).collect();
  let unique: HashSet<PageId> = all.iter().copied().collect();
  assert_eq!(all.len(), PRODUCERS * PAGES);
  assert_eq!(unique.len(), all.len());
  drop(t);
  assert_eq!(pool.os().frees(), pool.os().allocs());
}
