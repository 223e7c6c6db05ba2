//! Allocator facade.
//!
//! `Heap` ties the pieces together: classify the request, lock an arena,
//! carve from its active Block (replacing it from the cache or the page
//! source when needed), and on free hand the slot back to the Block named in
//! its header, reclaiming the Block when that was its last live slot.

use core::ptr::{self, NonNull};

use log::{debug, trace, warn};

use crate::align_up;
use crate::arena::ArenaPool;
use crate::block::{ALLOC_HEADER_SIZE, AllocHeader, Block, BlockKind, Origin};
use crate::cache::{FreeBlockCache, ShelfStats};
use crate::config::HeapConfig;
use crate::error::{AllocError, ConfigError};
use crate::pages::{OsPages, PageSource};
use crate::size_class::{MIN_ALIGN, SizeClass, SizeClasses};

/// Snapshot of what a heap is holding on to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub arenas: usize,
  /// Blocks and Big-Blocks currently installed in an arena.
  pub active_blocks: usize,
  pub active_bytes: usize,
  pub cached_blocks: ShelfStats,
  pub cached_big_blocks: ShelfStats,
}

impl HeapStats {
  /// Bytes held by active and cached Blocks.
  pub fn retained_bytes(&self) -> usize {
    self.active_bytes + self.cached_blocks.bytes + self.cached_big_blocks.bytes
  }
}

/// An allocator instance: arena pool, free-block cache and page source.
///
/// Every pointer is preceded by a header naming its Block, so frees from any
/// thread go straight to the owner without a lookup.
pub struct Heap<P: PageSource = OsPages> {
  pages: P,
  config: HeapConfig,
  classes: SizeClasses,
  pool: ArenaPool,
  cache: FreeBlockCache,
}

impl Heap<OsPages> {
  pub fn new(config: HeapConfig) -> Result<Self, ConfigError> {
    Self::with_pages(OsPages::new(), config)
  }
}

impl<P: PageSource> Heap<P> {
  /// Builds a heap over `pages`. Nothing is mapped until the first request.
  pub fn with_pages(pages: P, config: HeapConfig) -> Result<Self, ConfigError> {
    config.validate(pages.page_size())?;
    let classes = SizeClasses::new(config.small_max, config.big_max)?;
    let pool = ArenaPool::new(config.resolved_arenas(), config.contention_yields);
    let cache = FreeBlockCache::new(config.block_cache, config.big_block_cache);

    Ok(Self {
      pages,
      config,
      classes,
      pool,
      cache,
    })
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub fn pages(&self) -> &P {
    &self.pages
  }

  pub fn size_classes(&self) -> &SizeClasses {
    &self.classes
  }

  #[inline]
  pub fn classify(&self, size: usize) -> SizeClass {
    self.classes.classify(size)
  }

  // ===========================================================================
  // Allocate / free / reallocate
  // ===========================================================================

  /// Allocates at least `size` bytes, 16-byte aligned. `size == 0` yields a
  /// distinct pointer of the smallest class.
  #[inline]
  pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let result = match self.classes.classify(size) {
      SizeClass::Small(slot_size) => self.alloc_sliced(BlockKind::Small, slot_size),
      SizeClass::Big(slot_size) => self.alloc_sliced(BlockKind::Big, slot_size),
      SizeClass::Huge => self.alloc_huge(size, MIN_ALIGN),
    };
    result.inspect_err(|err| warn!("slabarena: allocate({size}) failed: {err}"))
  }

  /// Like [`Heap::allocate`] with an alignment above 16 served from a
  /// dedicated mapping. `align` must be a power of two.
  pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    debug_assert!(align.is_power_of_two());
    if align <= MIN_ALIGN {
      return self.allocate(size);
    }
    self
      .alloc_huge(size, align)
      .inspect_err(|err| warn!("slabarena: allocate_aligned({size}, {align}) failed: {err}"))
  }

  /// [`Heap::allocate`] with the first `size` bytes zeroed.
  pub fn allocate_zeroed(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let user = self.allocate(size)?;
    // Huge mappings come zeroed from the page source.
    if self.classes.classify(size) != SizeClass::Huge {
      unsafe { ptr::write_bytes(user.as_ptr(), 0, size) };
    }
    Ok(user)
  }

  /// Releases an allocation. Null is a no-op; `size_hint` is advisory.
  ///
  /// # Safety
  /// `ptr` is null or a live allocation of this heap.
  pub unsafe fn free(&self, ptr: *mut u8, _size_hint: usize) {
    let Some(user) = NonNull::new(ptr) else {
      return;
    };

    let header = unsafe { AllocHeader::of(user) };
    unsafe { AllocHeader::check_live(header) };

    match unsafe { AllocHeader::origin(header) } {
      Origin::Slot { block, .. } => unsafe {
        AllocHeader::poison(header);
        if block.release(user) {
          self.reclaim(block);
        }
      },
      Origin::Huge { base, len } => {
        unsafe { self.pages.unmap(base, len) };
        trace!("slabarena: unmapped huge {user:p} ({len} bytes)");
      }
    }
  }

  /// Resizes an allocation.
  ///
  /// Same slot size: `ptr` comes back unchanged. Huge to Huge: the mapping
  /// is remapped when the page source supports it. Otherwise the contents
  /// move to a fresh allocation. `ptr == null` allocates, `new_size == 0`
  /// frees and returns `None`.
  ///
  /// # Safety
  /// `ptr` is null or a live allocation of this heap. On success the old
  /// pointer must not be used again unless it was returned.
  pub unsafe fn reallocate(
    &self,
    ptr: *mut u8,
    old_size_hint: usize,
    new_size: usize,
  ) -> Result<Option<NonNull<u8>>, AllocError> {
    let Some(user) = NonNull::new(ptr) else {
      return self.allocate(new_size).map(Some);
    };

    if new_size == 0 {
      unsafe { self.free(ptr, old_size_hint) };
      return Ok(None);
    }

    let header = unsafe { AllocHeader::of(user) };
    unsafe { AllocHeader::check_live(header) };

    let usable = match unsafe { AllocHeader::origin(header) } {
      Origin::Slot { slot_size, .. } => {
        if self.classes.classify(new_size).slot_size() == Some(slot_size) {
          return Ok(Some(user));
        }
        slot_size
      }
      Origin::Huge { base, len } => {
        let offset = user.as_ptr() as usize - base.as_ptr() as usize;
        if new_size > self.classes.big_max() {
          let needed = self.huge_len(new_size, offset)?;
          if needed == len {
            return Ok(Some(user));
          }
          // Only naturally aligned mappings: a move keeps the page offset only.
          if offset == ALLOC_HEADER_SIZE
            && let Some(moved) = unsafe { self.pages.remap(base, len, needed) }
          {
            let user = unsafe { AllocHeader::write_huge(moved, needed, moved.byte_add(offset)) };
            trace!("slabarena: remapped huge {ptr:p} -> {user:p} ({len} -> {needed} bytes)");
            return Ok(Some(user));
          }
        }
        len - offset
      }
    };

    let fresh = self.allocate(new_size)?;
    unsafe {
      ptr::copy_nonoverlapping(user.as_ptr(), fresh.as_ptr(), usable.min(new_size));
      self.free(ptr, old_size_hint);
    }
    Ok(Some(fresh))
  }

  /// Bytes usable behind `ptr` (at least what was requested).
  ///
  /// # Safety
  /// `ptr` is null or a live allocation of this heap.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    let Some(user) = NonNull::new(ptr) else {
      return 0;
    };
    match unsafe { AllocHeader::origin(AllocHeader::of(user)) } {
      Origin::Slot { slot_size, .. } => slot_size,
      Origin::Huge { base, len } => len - (user.as_ptr() as usize - base.as_ptr() as usize),
    }
  }

  // ===========================================================================
  // Sliced path (Blocks and Big-Blocks)
  // ===========================================================================

  fn alloc_sliced(&self, kind: BlockKind, slot_size: usize) -> Result<NonNull<u8>, AllocError> {
    let mut arena = self.pool.acquire();

    if let Some(block) = arena.active(kind)
      && block.slot_size() == slot_size
      && let Some(user) = unsafe { block.take_slot() }
    {
      return Ok(user);
    }

    // Active Block is missing, exhausted or sliced for another class.
    let block = self.replacement_block(kind, slot_size)?;
    let user = unsafe { block.take_slot() };
    let superseded = arena.replace_active(kind, Some(block));
    drop(arena);

    if let Some(old) = superseded
      && unsafe { old.detach() }
    {
      self.reclaim(old);
    }

    user.ok_or(AllocError::OutOfMemory { size: slot_size })
  }

  /// Cache first (re-sliced for `slot_size`), else one fresh mapping.
  fn replacement_block(&self, kind: BlockKind, slot_size: usize) -> Result<Block, AllocError> {
    if let Some(block) = self.cache.take(kind, slot_size) {
      unsafe { block.reset(slot_size) };
      return Ok(block);
    }

    let len = self.region_len(kind);
    let region = self
      .pages
      .map(len)
      .ok_or(AllocError::OutOfMemory { size: len })?;
    Ok(unsafe { Block::format(region, len, kind, slot_size) })
  }

  #[inline]
  fn region_len(&self, kind: BlockKind) -> usize {
    match kind {
      BlockKind::Small => self.config.block_size,
      BlockKind::Big => self.config.big_block_size,
    }
  }

  /// Parks a fully-free, detached Block, or unmaps it when the cache is full.
  /// Only the single winner of the Block's reclamation calls this.
  fn reclaim(&self, block: Block) {
    debug_assert!(!block.is_attached());
    debug_assert_eq!(block.free_count(), block.capacity());

    if let Err(block) = self.cache.put(block) {
      self.unmap_block(block);
    }
  }

  fn unmap_block(&self, block: Block) -> usize {
    let (region, len, kind) = (block.region(), block.region_len(), block.kind());
    unsafe { self.pages.unmap(region, len) };
    trace!("slabarena: unmapped {kind:?} block {region:p} ({len} bytes)");
    len
  }

  // ===========================================================================
  // Huge path
  // ===========================================================================

  /// Mapping length for `size` bytes placed `lead` bytes into the mapping.
  fn huge_len(&self, size: usize, lead: usize) -> Result<usize, AllocError> {
    size
      .checked_add(lead)
      .and_then(|n| n.checked_next_multiple_of(self.pages.page_size()))
      .ok_or(AllocError::SizeOverflow { size })
  }

  fn alloc_huge(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    let align = align.max(MIN_ALIGN);
    let lead = if align == MIN_ALIGN {
      ALLOC_HEADER_SIZE
    } else {
      ALLOC_HEADER_SIZE + align
    };
    let len = self.huge_len(size, lead)?;
    let base = self
      .pages
      .map(len)
      .ok_or(AllocError::OutOfMemory { size: len })?;

    let addr = base.as_ptr() as usize;
    let offset = align_up(addr + ALLOC_HEADER_SIZE, align) - addr;
    let user = unsafe { AllocHeader::write_huge(base, len, base.byte_add(offset)) };
    trace!("slabarena: mapped huge {user:p} ({len} bytes for {size})");
    Ok(user)
  }

  // ===========================================================================
  // Maintenance
  // ===========================================================================

  /// Returns every cached Block and every idle active Block to the page
  /// source. Blocks with live slots are left alone. Returns bytes released.
  pub fn trim(&self) -> usize {
    let mut released = 0;

    for index in 0..self.pool.len() {
      let mut arena = self.pool.lock(index);
      let mut idle = [None; 2];
      for kind in BlockKind::ALL {
        if let Some(block) = arena.active(kind)
          && block.live() == 0
        {
          idle[kind.index()] = arena.replace_active(kind, None);
        }
      }
      drop(arena);

      for block in idle.into_iter().flatten() {
        if unsafe { block.detach() } {
          released += self.unmap_block(block);
        }
      }
    }

    for kind in BlockKind::ALL {
      for block in self.cache.drain(kind) {
        released += self.unmap_block(block);
      }
    }

    debug!("slabarena: trim released {released} bytes");
    released
  }

  pub fn stats(&self) -> HeapStats {
    let mut stats = HeapStats {
      arenas: self.pool.len(),
      cached_blocks: self.cache.stats(BlockKind::Small),
      cached_big_blocks: self.cache.stats(BlockKind::Big),
      ..HeapStats::default()
    };

    for index in 0..self.pool.len() {
      let arena = self.pool.lock(index);
      for kind in BlockKind::ALL {
        if let Some(block) = arena.active(kind) {
          stats.active_blocks += 1;
          stats.active_bytes += block.region_len();
        }
      }
    }

    stats
  }
}

impl<P: PageSource> Drop for Heap<P> {
  /// Best effort: Blocks that still have live slots stay mapped.
  fn drop(&mut self) {
    self.trim();
  }
}
