//! Blocks, Big-Blocks and the per-allocation header.
//!
//! A Block is one mapped region: a [`BlockHeader`] at offset 0 followed by
//! `capacity` slots of `ALLOC_HEADER_SIZE + slot_size` bytes. Every pointer
//! handed out is preceded by an [`AllocHeader`] naming its origin, so `free`
//! never has to search for the owner.
//!
//! The allocation side (`cursor`, `local_free`) belongs to whichever arena
//! holds the Block as active and is only touched under that arena's lock.
//! The release side (`free_list`, `state`) is lock-free and may be hit from
//! any thread.
//!
//! `state` packs the live-slot count (low 32 bits) with an `ATTACHED` bit set
//! while an arena holds the Block. Once detached the word only decreases, so
//! exactly one operation observes it reaching zero: either the last `release`
//! or the `detach` of an already-empty Block. That caller reclaims it.

use core::mem::{offset_of, size_of};
use core::ptr::{NonNull, null_mut};
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::size_class::MIN_ALIGN;

// =============================================================================
// Allocation header
// =============================================================================

/// Set in `AllocHeader::meta` for Huge allocations.
const HUGE_TAG: usize = 1;

#[cfg(feature = "debug-tripwire")]
const CANARY_LIVE: u64 = 0x534C_4142_4152_454E; // "SLABAREN"
#[cfg(feature = "debug-tripwire")]
const CANARY_FREED: u64 = 0xDEAD_F4EE_DEAD_F4EE;

/// Sits immediately before every user pointer.
#[repr(C, align(16))]
pub(crate) struct AllocHeader {
  /// Owning `BlockHeader`, or the mapping base for Huge allocations.
  origin: *mut u8,
  /// Slot size, or mapped length | `HUGE_TAG`.
  meta: usize,
  #[cfg(feature = "debug-tripwire")]
  canary: u64,
}

pub(crate) const ALLOC_HEADER_SIZE: usize = size_of::<AllocHeader>();

const _: () = assert!(ALLOC_HEADER_SIZE % MIN_ALIGN == 0);

/// Decoded `AllocHeader`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Origin {
  Slot { block: Block, slot_size: usize },
  Huge { base: NonNull<u8>, len: usize },
}

impl AllocHeader {
  /// Header of a pointer previously returned by this crate.
  #[inline(always)]
  pub(crate) unsafe fn of(user: NonNull<u8>) -> NonNull<AllocHeader> {
    unsafe { user.byte_sub(ALLOC_HEADER_SIZE).cast() }
  }

  /// Writes a header at `at` and returns the user pointer following it.
  #[inline(always)]
  unsafe fn write(at: NonNull<u8>, origin: *mut u8, meta: usize) -> NonNull<u8> {
    unsafe {
      at.cast::<AllocHeader>().write(AllocHeader {
        origin,
        meta,
        #[cfg(feature = "debug-tripwire")]
        canary: CANARY_LIVE,
      });
      at.byte_add(ALLOC_HEADER_SIZE)
    }
  }

  /// Header for a Huge mapping; `user` must leave room for the header.
  pub(crate) unsafe fn write_huge(base: NonNull<u8>, len: usize, user: NonNull<u8>) -> NonNull<u8> {
    debug_assert!(len % MIN_ALIGN == 0);
    debug_assert!(user.as_ptr() as usize >= base.as_ptr() as usize + ALLOC_HEADER_SIZE);
    unsafe {
      let at = user.byte_sub(ALLOC_HEADER_SIZE);
      Self::write(at, base.as_ptr(), len | HUGE_TAG)
    }
  }

  #[inline(always)]
  pub(crate) unsafe fn origin(header: NonNull<AllocHeader>) -> Origin {
    let AllocHeader { origin, meta, .. } = unsafe { header.read() };
    if meta & HUGE_TAG != 0 {
      Origin::Huge {
        base: unsafe { NonNull::new_unchecked(origin) },
        len: meta & !HUGE_TAG,
      }
    } else {
      Origin::Slot {
        block: Block(unsafe { NonNull::new_unchecked(origin.cast()) }),
        slot_size: meta,
      }
    }
  }

  /// Panics unless `header` belongs to a live allocation.
  #[inline(always)]
  pub(crate) unsafe fn check_live(header: NonNull<AllocHeader>) {
    #[cfg(feature = "debug-tripwire")]
    {
      let canary = unsafe { (*header.as_ptr()).canary };
      assert!(
        canary == CANARY_LIVE,
        "slabarena: {:p} is not a live allocation (canary {:#018x}): double free or foreign pointer",
        unsafe { header.byte_add(ALLOC_HEADER_SIZE) },
        canary
      );
    }
    #[cfg(not(feature = "debug-tripwire"))]
    let _ = header;
  }

  /// Marks the allocation as released.
  #[inline(always)]
  pub(crate) unsafe fn poison(header: NonNull<AllocHeader>) {
    #[cfg(feature = "debug-tripwire")]
    unsafe {
      (*header.as_ptr()).canary = CANARY_FREED;
    }
    #[cfg(not(feature = "debug-tripwire"))]
    let _ = header;
  }

  #[inline(always)]
  unsafe fn revive(header: NonNull<AllocHeader>) {
    #[cfg(feature = "debug-tripwire")]
    unsafe {
      (*header.as_ptr()).canary = CANARY_LIVE;
    }
    #[cfg(not(feature = "debug-tripwire"))]
    let _ = header;
  }
}

// =============================================================================
// Block
// =============================================================================

/// Which arena slot / cache partition a Block belongs to.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockKind {
  Small = 0,
  Big = 1,
}

impl BlockKind {
  pub(crate) const ALL: [BlockKind; 2] = [BlockKind::Small, BlockKind::Big];

  #[inline(always)]
  pub(crate) const fn index(self) -> usize {
    self as usize
  }
}

/// Freed slot; the link lives in the slot payload, the header stays intact.
#[repr(C)]
struct FreeSlot {
  next: *mut FreeSlot,
}

const ATTACHED: u64 = 1 << 32;
const LIVE_MASK: u64 = ATTACHED - 1;

/// Metadata at offset 0 of every Block region.
#[repr(C, align(64))]
pub(crate) struct BlockHeader {
  // === Cache line 0: owner-arena side ===
  /// Next never-used slot.
  cursor: u32,
  capacity: u32,
  slot_size: usize,
  /// Slots taken off `free_list` but not handed out yet.
  local_free: *mut FreeSlot,
  region_len: usize,
  /// Intrusive link while parked in the free-block cache.
  cache_next: *mut BlockHeader,
  kind: BlockKind,
  _pad0: [u8; 23],

  // === Cache line 1: cross-thread release side ===
  /// Slots freed by any thread (Treiber stack, drained whole by the owner).
  free_list: AtomicPtr<FreeSlot>,
  /// Live count | `ATTACHED`.
  state: AtomicU64,
}

pub(crate) const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();

const _: () = assert!(offset_of!(BlockHeader, free_list) >= 64);
const _: () = assert!(BLOCK_HEADER_SIZE == 128);
const _: () = assert!(BLOCK_HEADER_SIZE % MIN_ALIGN == 0);

/// Slots a region of `region_len` bytes holds at `slot_size`.
#[inline]
pub(crate) const fn capacity_for(region_len: usize, slot_size: usize) -> usize {
  if region_len <= BLOCK_HEADER_SIZE {
    return 0;
  }
  (region_len - BLOCK_HEADER_SIZE) / (ALLOC_HEADER_SIZE + slot_size)
}

/// Handle to a Block living in mapped memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Block(NonNull<BlockHeader>);

impl Block {
  /// Lays out a fresh (or recycled) region for `slot_size` slots. The Block
  /// starts attached and empty.
  ///
  /// # Safety
  /// The caller exclusively owns `region`, which is `region_len` bytes long
  /// and 16-byte aligned.
  pub(crate) unsafe fn format(
    region: NonNull<u8>,
    region_len: usize,
    kind: BlockKind,
    slot_size: usize,
  ) -> Block {
    let capacity = capacity_for(region_len, slot_size);
    debug_assert!(capacity > 0 && capacity <= u32::MAX as usize);
    debug_assert!(slot_size % MIN_ALIGN == 0 && slot_size >= size_of::<FreeSlot>());

    let header = region.cast::<BlockHeader>();
    unsafe {
      header.write(BlockHeader {
        cursor: 0,
        capacity: capacity as u32,
        slot_size,
        local_free: null_mut(),
        region_len,
        cache_next: null_mut(),
        kind,
        _pad0: [0; 23],
        free_list: AtomicPtr::new(null_mut()),
        state: AtomicU64::new(ATTACHED),
      });
    }
    Block(header)
  }

  /// Re-slices a reclaimed Block for `slot_size`.
  ///
  /// # Safety
  /// The Block must be reclaimed (no live slots) and exclusively owned.
  pub(crate) unsafe fn reset(self, slot_size: usize) {
    unsafe { Block::format(self.region(), self.region_len(), self.kind(), slot_size) };
  }

  #[inline(always)]
  fn header(self) -> *mut BlockHeader {
    self.0.as_ptr()
  }

  #[inline]
  pub(crate) fn region(self) -> NonNull<u8> {
    self.0.cast()
  }

  #[inline]
  pub(crate) fn region_len(self) -> usize {
    unsafe { (*self.header()).region_len }
  }

  #[inline]
  pub(crate) fn kind(self) -> BlockKind {
    unsafe { (*self.header()).kind }
  }

  #[inline]
  pub(crate) fn slot_size(self) -> usize {
    unsafe { (*self.header()).slot_size }
  }

  #[inline]
  pub(crate) fn capacity(self) -> usize {
    unsafe { (*self.header()).capacity as usize }
  }

  /// Slots currently handed out.
  #[inline]
  pub(crate) fn live(self) -> usize {
    (unsafe { &(*self.header()).state }.load(Ordering::Acquire) & LIVE_MASK) as usize
  }

  /// Slots not currently handed out.
  ///
  /// A slot being freed can be handed out again before its releaser has
  /// decremented the live count, so the raw difference may dip below zero
  /// for an instant; it is clamped.
  #[inline]
  pub(crate) fn free_count(self) -> usize {
    self.capacity().saturating_sub(self.live())
  }

  #[inline]
  pub(crate) fn is_attached(self) -> bool {
    unsafe { &(*self.header()).state }.load(Ordering::Acquire) & ATTACHED != 0
  }

  #[inline(always)]
  fn slot_at(self, index: usize) -> NonNull<u8> {
    let stride = ALLOC_HEADER_SIZE + self.slot_size();
    unsafe { self.region().byte_add(BLOCK_HEADER_SIZE + index * stride) }
  }

  /// Hands out one slot: recycled first, then fresh from the cursor.
  /// `None` once the Block is exhausted.
  ///
  /// # Safety
  /// Caller holds the lock of the arena this Block is attached to.
  #[inline]
  pub(crate) unsafe fn take_slot(self) -> Option<NonNull<u8>> {
    let header = self.header();
    unsafe {
      let mut slot = (*header).local_free;
      if slot.is_null() {
        slot = (*header).free_list.swap(null_mut(), Ordering::Acquire);
      }

      if let Some(user) = NonNull::new(slot) {
        (*header).local_free = (*slot).next;
        (*header).state.fetch_add(1, Ordering::Relaxed);
        let user = user.cast::<u8>();
        AllocHeader::revive(AllocHeader::of(user));
        return Some(user);
      }

      let cursor = (*header).cursor;
      if cursor == (*header).capacity {
        return None;
      }
      (*header).cursor = cursor + 1;
      (*header).state.fetch_add(1, Ordering::Relaxed);
      let slot = self.slot_at(cursor as usize);
      Some(AllocHeader::write(slot, header.cast(), (*header).slot_size))
    }
  }

  /// Returns a slot. `true` means the caller just made the Block fully free
  /// while detached and must reclaim it.
  ///
  /// # Safety
  /// `user` is a live slot of this Block; callable from any thread.
  #[inline]
  pub(crate) unsafe fn release(self, user: NonNull<u8>) -> bool {
    let header = self.header();
    let slot = user.as_ptr().cast::<FreeSlot>();
    unsafe {
      let free_list = &(*header).free_list;
      let mut head = free_list.load(Ordering::Relaxed);
      loop {
        (*slot).next = head;
        match free_list.compare_exchange_weak(head, slot, Ordering::Release, Ordering::Relaxed) {
          Ok(_) => break,
          Err(current) => head = current,
        }
      }

      let prev = (*header).state.fetch_sub(1, Ordering::AcqRel);
      debug_assert!(prev & LIVE_MASK != 0, "release: live count underflow");
      prev == 1
    }
  }

  /// Drops the arena's claim. `true` means the Block was already fully free
  /// and the caller must reclaim it.
  ///
  /// # Safety
  /// Caller held this Block as an arena's active Block and has removed it.
  #[inline]
  pub(crate) unsafe fn detach(self) -> bool {
    let prev = unsafe { &(*self.header()).state }.fetch_and(!ATTACHED, Ordering::AcqRel);
    debug_assert!(prev & ATTACHED != 0, "detach: block was not attached");
    prev == ATTACHED
  }

  #[inline]
  pub(crate) fn cache_next(self) -> Option<Block> {
    NonNull::new(unsafe { (*self.header()).cache_next }).map(Block)
  }

  #[inline]
  pub(crate) fn set_cache_next(self, next: Option<Block>) {
    let next = next.map_or(null_mut(), |b| b.header());
    unsafe { (*self.header()).cache_next = next };
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::alloc::{Layout, alloc_zeroed, dealloc};
  use std::collections::HashSet;
  use std::sync::atomic::AtomicUsize;

  const REGION: usize = 16 * 1024;

  struct Region(NonNull<u8>);

  impl Region {
    fn new() -> Self {
      let layout = Layout::from_size_align(REGION, 4096).unwrap();
      Self(NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap())
    }
  }

  impl Drop for Region {
    fn drop(&mut self) {
      let layout = Layout::from_size_align(REGION, 4096).unwrap();
      unsafe { dealloc(self.0.as_ptr(), layout) };
    }
  }

  fn drain(block: Block) -> Vec<NonNull<u8>> {
    core::iter::from_fn(|| unsafe { block.take_slot() }).collect()
  }

  #[test]
  fn header_sizes() {
    assert_eq!(BLOCK_HEADER_SIZE, 128);
    #[cfg(not(feature = "debug-tripwire"))]
    assert_eq!(ALLOC_HEADER_SIZE, 16);
    #[cfg(feature = "debug-tripwire")]
    assert_eq!(ALLOC_HEADER_SIZE, 32);
  }

  #[test]
  fn slices_whole_region_without_overlap() {
    let region = Region::new();
    let block = unsafe { Block::format(region.0, REGION, BlockKind::Small, 64) };
    let slots = drain(block);

    assert_eq!(slots.len(), capacity_for(REGION, 64));
    assert_eq!(block.live(), block.capacity());
    assert_eq!(block.free_count(), 0);

    let end = region.0.as_ptr() as usize + REGION;
    let mut seen = HashSet::new();
    for slot in &slots {
      let addr = slot.as_ptr() as usize;
      assert_eq!(addr % MIN_ALIGN, 0);
      assert!(addr + 64 <= end);
      assert!(seen.insert(addr));
      let origin = unsafe { AllocHeader::origin(AllocHeader::of(*slot)) };
      assert_eq!(origin, Origin::Slot { block, slot_size: 64 });
    }
  }

  #[test]
  fn freed_slots_are_reused_before_cursor() {
    let region = Region::new();
    let block = unsafe { Block::format(region.0, REGION, BlockKind::Small, 32) };
    let a = unsafe { block.take_slot() }.unwrap();
    let b = unsafe { block.take_slot() }.unwrap();
    assert!(!unsafe { block.release(a) });
    assert_eq!(block.live(), 1);

    assert_eq!(unsafe { block.take_slot() }, Some(a));
    let c = unsafe { block.take_slot() }.unwrap();
    assert_ne!(c, a);
    assert_ne!(c, b);
  }

  #[test]
  fn attached_block_is_never_reclaimed_by_release() {
    let region = Region::new();
    let block = unsafe { Block::format(region.0, REGION, BlockKind::Small, 48) };
    let a = unsafe { block.take_slot() }.unwrap();
    assert!(!unsafe { block.release(a) });
    assert_eq!(block.free_count(), block.capacity());
    assert!(block.is_attached());
    assert!(unsafe { block.detach() });
  }

  #[test]
  fn last_release_after_detach_reclaims() {
    let region = Region::new();
    let block = unsafe { Block::format(region.0, REGION, BlockKind::Small, 48) };
    let a = unsafe { block.take_slot() }.unwrap();
    let b = unsafe { block.take_slot() }.unwrap();
    assert!(!unsafe { block.detach() });
    assert!(!unsafe { block.release(a) });
    assert!(unsafe { block.release(b) });
  }

  #[test]
  fn reset_changes_slot_size() {
    let region = Region::new();
    let block = unsafe { Block::format(region.0, REGION, BlockKind::Big, 64) };
    drain(block);
    unsafe { block.reset(256) };
    assert_eq!(block.slot_size(), 256);
    assert_eq!(block.kind(), BlockKind::Big);
    assert_eq!(block.live(), 0);
    assert_eq!(drain(block).len(), capacity_for(REGION, 256));
  }

  #[test]
  fn huge_header_round_trips_origin() {
    let region = Region::new();
    let user = unsafe { region.0.byte_add(64) };
    let user = unsafe { AllocHeader::write_huge(region.0, REGION, user) };
    let origin = unsafe { AllocHeader::origin(AllocHeader::of(user)) };
    assert_eq!(
      origin,
      Origin::Huge {
        base: region.0,
        len: REGION
      }
    );
  }

  #[test]
  fn concurrent_release_reclaims_exactly_once() {
    for _ in 0..32 {
      let region = Region::new();
      let block = unsafe { Block::format(region.0, REGION, BlockKind::Small, 16) };
      let slots: Vec<usize> = drain(block).into_iter().map(|p| p.as_ptr() as usize).collect();
      let winners = AtomicUsize::new(0);
      let winners = &winners;
      let block_addr = block.region().as_ptr() as usize;
      let (left, right) = slots.split_at(slots.len() / 2);

      std::thread::scope(|s| {
        // The arena detaches while the other threads are freeing.
        s.spawn(move || {
          let block = Block(NonNull::new(block_addr as *mut BlockHeader).unwrap());
          if unsafe { block.detach() } {
            winners.fetch_add(1, Ordering::Relaxed);
          }
        });
        for half in [left, right] {
          s.spawn(move || {
            let block = Block(NonNull::new(block_addr as *mut BlockHeader).unwrap());
            for &addr in half {
              assert!(block.free_count() <= block.capacity());
              if unsafe { block.release(NonNull::new(addr as *mut u8).unwrap()) } {
                winners.fetch_add(1, Ordering::Relaxed);
              }
            }
          });
        }
      });

      assert_eq!(winners.load(Ordering::Relaxed), 1);
      assert_eq!(block.live(), 0);
    }
  }

  #[cfg(feature = "debug-tripwire")]
  #[test]
  #[should_panic(expected = "not a live allocation")]
  fn tripwire_catches_double_free() {
    let region = Region::new();
    let block = unsafe { Block::format(region.0, REGION, BlockKind::Small, 32) };
    let a = unsafe { block.take_slot() }.unwrap();
    let header = unsafe { AllocHeader::of(a) };
    unsafe {
      AllocHeader::check_live(header);
      AllocHeader::poison(header);
      AllocHeader::check_live(header);
    }
  }
}
