//! An [`Os`] for tests: real memory from [`SystemOs`], a clock that only moves
//! when told to, call counters and failure injection.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::io;
use std::sync::Arc;

use crate::options::Options;
use crate::os::{ArenaId, Os, OsError, OsMemory, SystemOs};
use crate::pool::SegmentPool;

pub(crate) struct TestOs {
  inner: SystemOs,
  now: AtomicI64,
  allocs: AtomicUsize,
  frees: AtomicUsize,
  commits: AtomicUsize,
  purges: AtomicUsize,
  resets: AtomicUsize,
  protects: AtomicUsize,
  unprotects: AtomicUsize,
  fail_allocs: AtomicBool,
  fail_commits: AtomicBool,
}

impl TestOs {
  pub(crate) fn new() -> Self {
    Self {
      inner: SystemOs::new(),
      now: AtomicI64::new(1000),
      allocs: AtomicUsize::new(0),
      frees: AtomicUsize::new(0),
      commits: AtomicUsize::new(0),
      purges: AtomicUsize::new(0),
      resets: AtomicUsize::new(0),
      protects: AtomicUsize::new(0),
      unprotects: AtomicUsize::new(0),
      fail_allocs: AtomicBool::new(false),
      fail_commits: AtomicBool::new(false),
    }
  }

  pub(crate) fn advance(&self, ms: i64) {
    self.now.fetch_add(ms, Ordering::SeqCst);
  }

  pub(crate) fn fail_allocs(&self, fail: bool) {
    self.fail_allocs.store(fail, Ordering::SeqCst);
  }

  pub(crate) fn fail_commits(&self, fail: bool) {
    self.fail_commits.store(fail, Ordering::SeqCst);
  }

  pub(crate) fn allocs(&self) -> usize {
    self.allocs.load(Ordering::SeqCst)
  }

  pub(crate) fn frees(&self) -> usize {
    self.frees.load(Ordering::SeqCst)
  }

  pub(crate) fn commits(&self) -> usize {
    self.commits.load(Ordering::SeqCst)
  }

  pub(crate) fn purges(&self) -> usize {
    self.purges.load(Ordering::SeqCst)
  }

  pub(crate) fn resets(&self) -> usize {
    self.resets.load(Ordering::SeqCst)
  }

  pub(crate) fn protects(&self) -> usize {
    self.protects.load(Ordering::SeqCst)
  }

  pub(crate) fn unprotects(&self) -> usize {
    self.unprotects.load(Ordering::SeqCst)
  }
}

impl Os for TestOs {
  fn page_size(&self) -> usize {
    self.inner.page_size()
  }

  fn alloc_aligned(
    &self,
    size: usize,
    alignment: usize,
    align_offset: usize,
    commit: bool,
    allow_large: bool,
    arena: Option<ArenaId>,
  ) -> Result<OsMemory, OsError> {
    if self.fail_allocs.load(Ordering::SeqCst) {
      return Err(OsError::Exhausted { size });
    }
    // Arenas are plain OS memory tagged with the id.
    let mut memory = self
      .inner
      .alloc_aligned(size, alignment, align_offset, commit, allow_large, None)?;
    memory.arena = arena;
    self.allocs.fetch_add(1, Ordering::SeqCst);
    Ok(memory)
  }

  unsafe fn free(&self, memory: &OsMemory, committed_size: usize) {
    self.frees.fetch_add(1, Ordering::SeqCst);
    unsafe { self.inner.free(memory, committed_size) }
  }

  unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<bool, OsError> {
    if self.fail_commits.load(Ordering::SeqCst) {
      return Err(OsError::CommitFailed(io::Error::from(io::ErrorKind::OutOfMemory)));
    }
    self.commits.fetch_add(1, Ordering::SeqCst);
    unsafe { self.inner.commit(ptr, size) }
  }

  unsafe fn purge(&self, ptr: NonNull<u8>, size: usize, decommit: bool) -> bool {
    self.purges.fetch_add(1, Ordering::SeqCst);
    unsafe { self.inner.purge(ptr, size, decommit) }
  }

  unsafe fn reset(&self, ptr: NonNull<u8>, size: usize) {
    self.resets.fetch_add(1, Ordering::SeqCst);
    unsafe { self.inner.reset(ptr, size) }
  }

  unsafe fn protect(&self, ptr: NonNull<u8>, size: usize) -> Result<(), OsError> {
    self.protects.fetch_add(1, Ordering::SeqCst);
    unsafe { self.inner.protect(ptr, size) }
  }

  unsafe fn unprotect(&self, ptr: NonNull<u8>, size: usize) -> Result<(), OsError> {
    self.unprotects.fetch_add(1, Ordering::SeqCst);
    unsafe { self.inner.unprotect(ptr, size) }
  }

  fn clock_now(&self) -> i64 {
    self.now.load(Ordering::SeqCst)
  }
}

pub(crate) fn test_pool() -> Arc<SegmentPool<TestOs>> {
  test_pool_with(Options::default())
}

pub(crate) fn test_pool_with(options: Options) -> Arc<SegmentPool<TestOs>> {
  SegmentPool::new(TestOs::new(), options)
}
