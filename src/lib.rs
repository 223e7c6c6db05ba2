#![allow(clippy::missing_safety_doc)]

//! Arena-based slab allocator.
//!
//! Small and medium requests are carved out of page-backed Blocks and
//! Big-Blocks owned by a pool of lockable arenas; threads stick to the arena
//! that last served them and move on when it is contended. Fully-freed Blocks
//! are parked in a bounded cache before going back to the OS, and requests
//! above the Big-Block ceiling are mapped directly.
//!
//! [`Heap`] is an explicit allocator instance. [`Allocator`] wraps a lazily
//! initialized process-wide `Heap` as a [`GlobalAlloc`].

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr::{self, NonNull, null_mut},
};
use std::sync::OnceLock;

mod arena;
mod block;
mod cache;
mod config;
mod error;
mod heap;
mod pages;
mod size_class;

pub use arena::MAX_ARENAS;
pub use cache::ShelfStats;
pub use config::{CacheLimit, HeapConfig, MIN_SLOTS_PER_BLOCK};
pub use error::{AllocError, ConfigError};
pub use heap::{Heap, HeapStats};
pub use pages::{CountingPages, OsPages, PageSource};
pub use size_class::{MAX_CLASSES, MIN_ALIGN, SizeClass, SizeClasses};

// =============================================================================
// Process-wide heap
// =============================================================================

static GLOBAL_HEAP: OnceLock<Option<Heap>> = OnceLock::new();

/// The heap behind [`Allocator`] and the C API, built on first use with the
/// default config. Construction must not allocate.
pub fn global_heap() -> Option<&'static Heap> {
  GLOBAL_HEAP
    .get_or_init(|| Heap::new(HeapConfig::default()).ok())
    .as_ref()
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// `#[global_allocator]` front end for [`global_heap`].
pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    global_heap()
      .and_then(|heap| heap.allocate_aligned(layout.size(), layout.align()).ok())
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    if let Some(heap) = global_heap() {
      unsafe { heap.free(ptr, layout.size()) };
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let Some(heap) = global_heap() else {
      return null_mut();
    };

    if layout.align() <= MIN_ALIGN {
      return match unsafe { heap.reallocate(ptr, layout.size(), new_size) } {
        Ok(Some(p)) => p.as_ptr(),
        _ => null_mut(),
      };
    }

    // Over-aligned: the move has to keep the alignment.
    let Ok(fresh) = heap.allocate_aligned(new_size, layout.align()) else {
      return null_mut();
    };
    unsafe {
      ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), layout.size().min(new_size));
      heap.free(ptr, layout.size());
    }
    fresh.as_ptr()
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let Some(heap) = global_heap() else {
      return null_mut();
    };
    let result = if layout.align() <= MIN_ALIGN {
      heap.allocate_zeroed(layout.size())
    } else {
      // Over-aligned requests get a fresh, already zeroed mapping.
      heap.allocate_aligned(layout.size(), layout.align())
    };
    result.map_or(null_mut(), NonNull::as_ptr)
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  global_heap()
    .and_then(|heap| heap.allocate(size).ok())
    .map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  if let Some(heap) = global_heap() {
    unsafe { heap.free(ptr, 0) };
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  global_heap()
    .and_then(|heap| heap.allocate_zeroed(total).ok())
    .map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  let Some(heap) = global_heap() else {
    return null_mut();
  };
  // The header knows the old size; no conservative over-copy needed.
  match unsafe { heap.reallocate(ptr, 0, size) } {
    Ok(Some(p)) => p.as_ptr(),
    _ => null_mut(),
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
  memptr: *mut *mut u8,
  alignment: usize,
  size: usize,
) -> i32 {
  if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut u8>() {
    return libc::EINVAL;
  }

  let Some(ptr) = global_heap().and_then(|heap| heap.allocate_aligned(size, alignment).ok()) else {
    return libc::ENOMEM;
  };

  unsafe { *memptr = ptr.as_ptr() };
  0
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  global_heap().map_or(0, |heap| unsafe { heap.usable_size(ptr) })
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn align_up_rounds_to_power_of_two() {
    assert_eq!(align_up(0, 16), 0);
    assert_eq!(align_up(1, 16), 16);
    assert_eq!(align_up(16, 16), 16);
    assert_eq!(align_up(4097, 4096), 8192);
  }

  #[test]
  fn global_heap_is_shared() {
    let a = global_heap().unwrap() as *const Heap;
    let b = global_heap().unwrap() as *const Heap;
    assert_eq!(a, b);
  }

  #[test]
  fn allocator_respects_layouts() {
    let alloc = Allocator;
    for (size, align) in [(1, 1), (24, 8), (100, 16), (100, 64), (5000, 4096), (1 << 20, 16)] {
      let layout = Layout::from_size_align(size, align).unwrap();
      unsafe {
        let p = alloc.alloc_zeroed(layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % align, 0);
        assert!(core::slice::from_raw_parts(p, size).iter().all(|&b| b == 0));
        p.write_bytes(0xAB, size);

        let q = alloc.realloc(p, layout, size * 2);
        assert!(!q.is_null());
        assert_eq!(q as usize % align, 0);
        assert!(core::slice::from_raw_parts(q, size).iter().all(|&b| b == 0xAB));
        alloc.dealloc(q, Layout::from_size_align(size * 2, align).unwrap());
      }
    }
  }
}
