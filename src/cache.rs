//! Free-Block Cache.
//!
//! Fully-free Blocks parked for reuse instead of going back to the OS. Small
//! Blocks and Big-Blocks live on separate shelves with separate bounds, so
//! Big-Block churn never evicts small Blocks. Shelves are intrusive lists
//! threaded through `BlockHeader::cache_next`.

use parking_lot::Mutex;

use crate::block::{Block, BlockKind};
use crate::config::CacheLimit;

struct Shelf {
  head: Option<Block>,
  blocks: usize,
  bytes: usize,
}

// Blocks on a shelf are owned by the shelf alone.
unsafe impl Send for Shelf {}

impl Shelf {
  const fn new() -> Self {
    Self {
      head: None,
      blocks: 0,
      bytes: 0,
    }
  }

  fn push(&mut self, block: Block) {
    block.set_cache_next(self.head);
    self.head = Some(block);
    self.blocks += 1;
    self.bytes += block.region_len();
  }

  /// Unlinks the first Block with `slot_size`, else the most recently parked.
  fn take(&mut self, slot_size: usize) -> Option<Block> {
    let head = self.head?;
    let mut prev: Option<Block> = None;
    let mut cursor = Some(head);
    while let Some(block) = cursor {
      if block.slot_size() == slot_size {
        match prev {
          Some(prev) => prev.set_cache_next(block.cache_next()),
          None => self.head = block.cache_next(),
        }
        return Some(self.unlinked(block));
      }
      prev = cursor;
      cursor = block.cache_next();
    }

    self.head = head.cache_next();
    Some(self.unlinked(head))
  }

  fn unlinked(&mut self, block: Block) -> Block {
    block.set_cache_next(None);
    self.blocks -= 1;
    self.bytes -= block.region_len();
    block
  }
}

/// Occupancy of one shelf.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShelfStats {
  pub blocks: usize,
  pub bytes: usize,
}

pub(crate) struct FreeBlockCache {
  shelves: [Mutex<Shelf>; 2],
  limits: [CacheLimit; 2],
}

impl FreeBlockCache {
  pub(crate) fn new(small: CacheLimit, big: CacheLimit) -> Self {
    Self {
      shelves: [Mutex::new(Shelf::new()), Mutex::new(Shelf::new())],
      limits: [small, big],
    }
  }

  /// A parked Block of `kind`, preferring one already sliced at `slot_size`.
  /// The caller must `reset` it before use.
  pub(crate) fn take(&self, kind: BlockKind, slot_size: usize) -> Option<Block> {
    self.shelves[kind.index()].lock().take(slot_size)
  }

  /// Parks a reclaimed Block. Hands it back when the shelf is full; the
  /// caller then returns it to the page source.
  pub(crate) fn put(&self, block: Block) -> Result<(), Block> {
    let kind = block.kind();
    let limit = self.limits[kind.index()];
    let mut shelf = self.shelves[kind.index()].lock();
    if shelf.blocks >= limit.blocks || shelf.bytes + block.region_len() > limit.bytes {
      return Err(block);
    }
    shelf.push(block);
    Ok(())
  }

  /// Empties the shelf of `kind`; the returned Blocks belong to the caller.
  pub(crate) fn drain(&self, kind: BlockKind) -> Drain {
    let mut shelf = self.shelves[kind.index()].lock();
    let head = shelf.head.take();
    shelf.blocks = 0;
    shelf.bytes = 0;
    Drain { next: head }
  }

  pub(crate) fn stats(&self, kind: BlockKind) -> ShelfStats {
    let shelf = self.shelves[kind.index()].lock();
    ShelfStats {
      blocks: shelf.blocks,
      bytes: shelf.bytes,
    }
  }
}

/// Blocks detached from a shelf by [`FreeBlockCache::drain`].
pub(crate) struct Drain {
  next: Option<Block>,
}

impl Iterator for Drain {
  type Item = Block;

  fn next(&mut self) -> Option<Block> {
    let block = self.next?;
    self.next = block.cache_next();
    block.set_cache_next(None);
    Some(block)
  }
}
