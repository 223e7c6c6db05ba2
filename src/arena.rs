//! Arenas and the arena pool.
//!
//! An arena is one contention domain: a spin lock plus the Block and Big-Block
//! it is currently carving. Threads remember the arena that last worked for
//! them in a hint table owned by the pool; the hint is only ever a starting
//! point for the probe in [`ArenaPool::acquire`].

use core::cell::UnsafeCell;
use core::hint;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::block::{Block, BlockKind};

/// Hard cap on arenas per heap.
pub const MAX_ARENAS: usize = 64;

/// Sticky-hint slots. Threads share a slot when their tokens collide.
const HINT_SLOTS: usize = 256;

const _: () = assert!(HINT_SLOTS.is_power_of_two());

// =============================================================================
// Spin lock
// =============================================================================

pub(crate) struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub(crate) const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn try_lock(&self) -> bool {
    !self.locked.load(Ordering::Relaxed)
      && self
        .locked
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
  }

  #[inline]
  pub(crate) fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  pub(crate) fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

// =============================================================================
// Arena
// =============================================================================

pub(crate) struct Arena {
  lock: SpinLock,
  /// Active Block per `BlockKind`. Only touched through an `ArenaGuard`.
  active: UnsafeCell<[Option<Block>; 2]>,
}

unsafe impl Sync for Arena {}
unsafe impl Send for Arena {}

impl Arena {
  const fn new() -> Self {
    Self {
      lock: SpinLock::new(),
      active: UnsafeCell::new([None, None]),
    }
  }
}

/// Exclusive access to one arena; dropping it releases the arena.
pub(crate) struct ArenaGuard<'a> {
  arena: &'a Arena,
  index: usize,
}

impl ArenaGuard<'_> {
  #[inline]
  pub(crate) fn index(&self) -> usize {
    self.index
  }

  #[inline]
  pub(crate) fn active(&self, kind: BlockKind) -> Option<Block> {
    unsafe { (*self.arena.active.get())[kind.index()] }
  }

  /// Installs `block` as the active Block of `kind`, returning the previous one.
  #[inline]
  pub(crate) fn replace_active(&mut self, kind: BlockKind, block: Option<Block>) -> Option<Block> {
    unsafe { core::mem::replace(&mut (*self.arena.active.get())[kind.index()], block) }
  }
}

impl Drop for ArenaGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    self.arena.lock.unlock();
  }
}

// =============================================================================
// Pool
// =============================================================================

/// Per-thread token used to pick a hint slot.
fn thread_token() -> usize {
  thread_local! {
    static TOKEN: usize = {
      static CTR: AtomicU32 = AtomicU32::new(0);
      CTR.fetch_add(1, Ordering::Relaxed) as usize // We only need uniqueness, not synchronization
    };
  }
  // TLS can be gone during thread teardown; any slot will do then.
  TOKEN.try_with(|&token| token).unwrap_or(0)
}

pub(crate) struct ArenaPool {
  arenas: [Arena; MAX_ARENAS],
  count: usize,
  /// Last arena that worked for the threads mapped to each slot.
  hints: [AtomicUsize; HINT_SLOTS],
  contention_yields: u32,
}

impl ArenaPool {
  pub(crate) fn new(count: usize, contention_yields: u32) -> Self {
    debug_assert!((1..=MAX_ARENAS).contains(&count));
    Self {
      arenas: [const { Arena::new() }; MAX_ARENAS],
      count,
      // Spread threads across arenas from the start.
      hints: core::array::from_fn(|slot| AtomicUsize::new(slot % count)),
      contention_yields,
    }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.count
  }

  #[inline]
  fn try_acquire(&self, index: usize) -> Option<ArenaGuard<'_>> {
    let arena = &self.arenas[index];
    // Lazy: a guard built for a failed try would unlock on drop.
    arena.lock.try_lock().then(|| ArenaGuard { arena, index })
  }

  /// Locks an arena for the calling thread.
  ///
  /// Sticky arena first, then every other arena once (first success becomes
  /// the new hint), then a bounded yield loop on the sticky arena before
  /// finally spinning on it.
  pub(crate) fn acquire(&self) -> ArenaGuard<'_> {
    let hint = &self.hints[thread_token() & (HINT_SLOTS - 1)];
    let sticky = hint.load(Ordering::Relaxed) % self.count;

    if let Some(guard) = self.try_acquire(sticky) {
      return guard;
    }

    for step in 1..self.count {
      let index = (sticky + step) % self.count;
      if let Some(guard) = self.try_acquire(index) {
        hint.store(index, Ordering::Relaxed);
        return guard;
      }
    }

    for _ in 0..self.contention_yields {
      std::thread::yield_now();
      if let Some(guard) = self.try_acquire(sticky) {
        return guard;
      }
    }

    self.lock(sticky)
  }

  /// Blocks until arena `index` is held. Used for maintenance walks.
  pub(crate) fn lock(&self, index: usize) -> ArenaGuard<'_> {
    let arena = &self.arenas[index];
    arena.lock.lock();
    ArenaGuard { arena, index }
  }
}
