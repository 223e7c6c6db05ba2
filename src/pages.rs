//! Page Source: whole-page regions straight from the OS.
//!
//! Every Block, Big-Block and Huge allocation is backed by one region obtained
//! here. The trait is the seam tests use to count OS traffic.

use core::ptr::{NonNull, null_mut};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Provider of anonymous, zero-filled, read-write page regions.
///
/// Lengths passed in are always multiples of [`PageSource::page_size`].
pub trait PageSource: Send + Sync {
  fn page_size(&self) -> usize;

  /// Maps `len` bytes. `None` means the OS refused.
  fn map(&self, len: usize) -> Option<NonNull<u8>>;

  /// Returns a region obtained from [`PageSource::map`] or [`PageSource::remap`].
  ///
  /// # Safety
  /// `region`/`len` must describe exactly one live mapping of this source, and
  /// nothing may touch it afterwards.
  unsafe fn unmap(&self, region: NonNull<u8>, len: usize);

  /// Resizes a mapping, possibly moving it. Contents up to
  /// `min(old_len, new_len)` are preserved. The default is "unsupported".
  ///
  /// # Safety
  /// Same contract as [`PageSource::unmap`] for `region`/`old_len`. On success
  /// the old region is gone; on `None` it is untouched.
  unsafe fn remap(&self, region: NonNull<u8>, old_len: usize, new_len: usize) -> Option<NonNull<u8>> {
    let _ = (region, old_len, new_len);
    None
  }
}

// =============================================================================
// OS pages (libc)
// =============================================================================

/// `mmap`/`munmap`/`mremap` backed page source.
#[derive(Debug, Clone, Copy)]
pub struct OsPages {
  page_size: usize,
}

impl OsPages {
  pub fn new() -> Self {
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = if raw > 0 { raw as usize } else { 4096 };
    Self { page_size }
  }
}

impl Default for OsPages {
  fn default() -> Self {
    Self::new()
  }
}

impl PageSource for OsPages {
  #[inline]
  fn page_size(&self) -> usize {
    self.page_size
  }

  fn map(&self, len: usize) -> Option<NonNull<u8>> {
    let ptr = unsafe {
      libc::mmap(
        null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
      )
    };

    if ptr == libc::MAP_FAILED {
      None
    } else {
      NonNull::new(ptr.cast::<u8>())
    }
  }

  unsafe fn unmap(&self, region: NonNull<u8>, len: usize) {
    unsafe { libc::munmap(region.as_ptr().cast(), len) };
  }

  #[cfg(target_os = "linux")]
  unsafe fn remap(&self, region: NonNull<u8>, old_len: usize, new_len: usize) -> Option<NonNull<u8>> {
    let ptr = unsafe {
      libc::mremap(
        region.as_ptr().cast(),
        old_len,
        new_len,
        libc::MREMAP_MAYMOVE,
      )
    };

    if ptr == libc::MAP_FAILED {
      None
    } else {
      NonNull::new(ptr.cast::<u8>())
    }
  }
}

/// Online CPU count, without touching the heap (safe to call from inside a
/// global allocator).
pub(crate) fn hardware_concurrency() -> usize {
  let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
  if n > 0 { n as usize } else { 1 }
}

// =============================================================================
// Counting decorator
// =============================================================================

/// Wraps a page source and tallies every call that reaches it.
#[derive(Debug, Default)]
pub struct CountingPages<P = OsPages> {
  inner: P,
  maps: AtomicUsize,
  unmaps: AtomicUsize,
  remaps: AtomicUsize,
  mapped_bytes: AtomicUsize,
}

impl<P: PageSource> CountingPages<P> {
  pub fn new(inner: P) -> Self {
    Self {
      inner,
      maps: AtomicUsize::new(0),
      unmaps: AtomicUsize::new(0),
      remaps: AtomicUsize::new(0),
      mapped_bytes: AtomicUsize::new(0),
    }
  }

  /// Successful `map` calls.
  pub fn map_calls(&self) -> usize {
    self.maps.load(Ordering::Relaxed)
  }

  pub fn unmap_calls(&self) -> usize {
    self.unmaps.load(Ordering::Relaxed)
  }

  /// Successful `remap` calls.
  pub fn remap_calls(&self) -> usize {
    self.remaps.load(Ordering::Relaxed)
  }

  /// Bytes currently mapped through this source.
  pub fn mapped_bytes(&self) -> usize {
    self.mapped_bytes.load(Ordering::Relaxed)
  }
}

impl<P: PageSource> PageSource for CountingPages<P> {
  fn page_size(&self) -> usize {
    self.inner.page_size()
  }

  fn map(&self, len: usize) -> Option<NonNull<u8>> {
    let region = self.inner.map(len)?;
    self.maps.fetch_add(1, Ordering::Relaxed);
    self.mapped_bytes.fetch_add(len, Ordering::Relaxed);
    Some(region)
  }

  unsafe fn unmap(&self, region: NonNull<u8>, len: usize) {
    unsafe { self.inner.unmap(region, len) };
    self.unmaps.fetch_add(1, Ordering::Relaxed);
    self.mapped_bytes.fetch_sub(len, Ordering::Relaxed);
  }

  unsafe fn remap(&self, region: NonNull<u8>, old_len: usize, new_len: usize) -> Option<NonNull<u8>> {
    let moved = unsafe { self.inner.remap(region, old_len, new_len) }?;
    self.remaps.fetch_add(1, Ordering::Relaxed);
    self.mapped_bytes.fetch_sub(old_len, Ordering::Relaxed);
    self.mapped_bytes.fetch_add(new_len, Ordering::Relaxed);
    Some(moved)
  }
}
