//! OS memory layer: the trait segments talk to, and the libc implementation.

use core::ptr::{NonNull, null_mut};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use crate::align_up;

/// Identifies a pre-reserved arena a segment may be carved from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ArenaId(pub u16);

#[derive(Debug)]
pub enum OsError {
  ReserveFailed(io::Error),
  CommitFailed(io::Error),
  ProtectFailed(io::Error),
  /// The provider has no memory left for a request of this size.
  Exhausted { size: usize },
  UnknownArena(ArenaId),
}

impl fmt::Display for OsError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OsError::ReserveFailed(e) => write!(f, "OS reservation failed: {e}"),
      OsError::CommitFailed(e) => write!(f, "OS commit failed: {e}"),
      OsError::ProtectFailed(e) => write!(f, "OS protection change failed: {e}"),
      OsError::Exhausted { size } => write!(f, "OS memory exhausted for a request of {size} bytes"),
      OsError::UnknownArena(id) => write!(f, "no arena with id {}", id.0),
    }
  }
}

impl std::error::Error for OsError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      OsError::ReserveFailed(e) | OsError::CommitFailed(e) | OsError::ProtectFailed(e) => Some(e),
      OsError::Exhausted { .. } | OsError::UnknownArena(_) => None,
    }
  }
}

/// A region handed out by [`Os::alloc_aligned`], with its provenance.
#[derive(Debug)]
pub struct OsMemory {
  pub base: NonNull<u8>,
  pub size: usize,
  pub arena: Option<ArenaId>,
  pub initially_committed: bool,
  pub initially_zero: bool,
  /// Pinned memory can never be decommitted.
  pub is_pinned: bool,
  pub is_large: bool,
}

// The region is plain address space; whoever holds the record owns it.
unsafe impl Send for OsMemory {}

impl OsMemory {
  /// Memory from an arena only serves heaps bound to that arena, and
  /// unbound heaps only take non-arena memory.
  pub fn is_suitable(&self, arena: Option<ArenaId>) -> bool {
    self.arena == arena
  }
}

/// Everything the segment layer needs from the operating system.
///
/// Range arguments are always inside a region returned by `alloc_aligned`.
pub trait Os: Send + Sync {
  fn page_size(&self) -> usize;

  /// Reserves `size` bytes such that `base + align_offset` is a multiple of `alignment`.
  fn alloc_aligned(
    &self,
    size: usize,
    alignment: usize,
    align_offset: usize,
    commit: bool,
    allow_large: bool,
    arena: Option<ArenaId>,
  ) -> Result<OsMemory, OsError>;

  /// Releases a whole region. `committed_size` is how much of it was committed.
  unsafe fn free(&self, memory: &OsMemory, committed_size: usize);

  /// Makes a range accessible. Returns whether the range is known to be zeroed.
  unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<bool, OsError>;

  /// Returns physical memory. Returns true if the range was decommitted (and
  /// must be committed again before use), false if it was only reset.
  unsafe fn purge(&self, ptr: NonNull<u8>, size: usize, decommit: bool) -> bool;

  /// Drops contents but keeps the range accessible.
  unsafe fn reset(&self, ptr: NonNull<u8>, size: usize);

  unsafe fn protect(&self, ptr: NonNull<u8>, size: usize) -> Result<(), OsError>;
  unsafe fn unprotect(&self, ptr: NonNull<u8>, size: usize) -> Result<(), OsError>;

  /// Monotonic milliseconds.
  fn clock_now(&self) -> i64;

  /// Nonzero id of the calling thread.
  fn thread_id(&self) -> usize {
    thread_id()
  }
}

// =============================================================================
// Platform
// =============================================================================

const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

/// Anonymous `mmap` backed provider. Reservations start inaccessible unless a
/// commit is requested up front.
pub struct SystemOs {
  page_size: usize,
  epoch: Instant,
}

impl SystemOs {
  pub fn new() -> Self {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    Self {
      page_size: if page_size > 0 { page_size as usize } else { 4096 },
      epoch: Instant::now(),
    }
  }
}

impl Default for SystemOs {
  fn default() -> Self {
    Self::new()
  }
}

unsafe fn os_mmap(size: usize, prot: libc::c_int) -> Result<NonNull<u8>, OsError> {
  let ptr = unsafe { libc::mmap(null_mut(), size, prot, MAP_FLAGS, -1, 0) };
  if ptr == libc::MAP_FAILED {
    return Err(OsError::ReserveFailed(io::Error::last_os_error()));
  }
  NonNull::new(ptr.cast()).ok_or(OsError::Exhausted { size })
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  if size > 0 {
    unsafe { libc::munmap(ptr.cast(), size) };
  }
}

unsafe fn os_mprotect(ptr: NonNull<u8>, size: usize, prot: libc::c_int) -> io::Result<()> {
  if unsafe { libc::mprotect(ptr.as_ptr().cast(), size, prot) } == 0 {
    Ok(())
  } else {
    Err(io::Error::last_os_error())
  }
}

impl Os for SystemOs {
  fn page_size(&self) -> usize {
    self.page_size
  }

  fn alloc_aligned(
    &self,
    size: usize,
    alignment: usize,
    align_offset: usize,
    commit: bool,
    _allow_large: bool,
    arena: Option<ArenaId>,
  ) -> Result<OsMemory, OsError> {
    if let Some(id) = arena {
      return Err(OsError::UnknownArena(id));
    }
    debug_assert!(alignment.is_power_of_two());

    // Over-allocate, then trim the unaligned head and the tail.
    let total = size
      .checked_add(alignment)
      .ok_or(OsError::Exhausted { size })?;
    let prot = if commit { libc::PROT_READ | libc::PROT_WRITE } else { libc::PROT_NONE };
    let raw = unsafe { os_mmap(total, prot)? }.as_ptr() as usize;

    let base = align_up(raw + align_offset, alignment) - align_offset;
    unsafe {
      os_munmap(raw as *mut u8, base - raw);
      os_munmap((base + size) as *mut u8, raw + total - (base + size));
    }

    log::trace!("os: reserved {size:#x} bytes at {base:#x} (commit={commit})");
    Ok(OsMemory {
      base: NonNull::new(base as *mut u8).ok_or(OsError::Exhausted { size })?,
      size,
      arena: None,
      initially_committed: commit,
      initially_zero: true,
      is_pinned: false,
      is_large: false,
    })
  }

  unsafe fn free(&self, memory: &OsMemory, _committed_size: usize) {
    unsafe { os_munmap(memory.base.as_ptr(), memory.size) };
  }

  unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<bool, OsError> {
    unsafe { os_mprotect(ptr, size, libc::PROT_READ | libc::PROT_WRITE) }
      .map_err(OsError::CommitFailed)?;
    Ok(false)
  }

  unsafe fn purge(&self, ptr: NonNull<u8>, size: usize, decommit: bool) -> bool {
    if decommit {
      // Remapping drops the pages and makes the range inaccessible again.
      let p = unsafe {
        libc::mmap(
          ptr.as_ptr().cast(),
          size,
          libc::PROT_NONE,
          MAP_FLAGS | libc::MAP_FIXED,
          -1,
          0,
        )
      };
      if p != libc::MAP_FAILED {
        return true;
      }
      log::warn!(
        "os: decommit of {size:#x} bytes at {:p} failed: {}",
        ptr,
        io::Error::last_os_error()
      );
    }
    unsafe { self.reset(ptr, size) };
    false
  }

  unsafe fn reset(&self, ptr: NonNull<u8>, size: usize) {
    unsafe { libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED) };
  }

  unsafe fn protect(&self, ptr: NonNull<u8>, size: usize) -> Result<(), OsError> {
    unsafe { os_mprotect(ptr, size, libc::PROT_NONE) }.map_err(OsError::ProtectFailed)
  }

  unsafe fn unprotect(&self, ptr: NonNull<u8>, size: usize) -> Result<(), OsError> {
    unsafe { os_mprotect(ptr, size, libc::PROT_READ | libc::PROT_WRITE) }
      .map_err(OsError::ProtectFailed)
  }

  fn clock_now(&self) -> i64 {
    self.epoch.elapsed().as_millis() as i64
  }
}

// Each thread gets a different ID
pub(crate) fn thread_id() -> usize {
  thread_local! {
    static TID: usize = {
      static CTR: AtomicUsize = AtomicUsize::new(1); // Start at 1; 0 = abandoned
      CTR.fetch_add(1, Ordering::Relaxed) // We only need uniqueness, not synchronization
    };
  }
  TID.with(|&id| id)
}
