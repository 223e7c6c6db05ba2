//! Heap tuning knobs.

use crate::arena::MAX_ARENAS;
use crate::block::capacity_for;
use crate::error::ConfigError;
use crate::pages::hardware_concurrency;
use crate::size_class::MIN_ALIGN;

/// Fewest slots a Block or Big-Block may hold at its largest class.
pub const MIN_SLOTS_PER_BLOCK: usize = 4;

/// Bound of one free-block cache shelf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheLimit {
  pub blocks: usize,
  pub bytes: usize,
}

/// Construction parameters of a [`Heap`](crate::Heap).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
  /// Arena count; 0 means one per online CPU, capped at [`MAX_ARENAS`].
  pub arenas: usize,
  /// Largest request served from small Blocks.
  pub small_max: usize,
  /// Largest request served from Big-Blocks; anything larger is Huge.
  pub big_max: usize,
  /// Region size of a small Block.
  pub block_size: usize,
  /// Region size of a Big-Block.
  pub big_block_size: usize,
  pub block_cache: CacheLimit,
  pub big_block_cache: CacheLimit,
  /// Yield rounds on the sticky arena once every arena was found busy.
  pub contention_yields: u32,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      arenas: 0,
      small_max: 2048,
      big_max: 256 * 1024,
      block_size: 64 * 1024,
      big_block_size: 2 * 1024 * 1024,
      block_cache: CacheLimit {
        blocks: 16,
        bytes: 1024 * 1024,
      },
      big_block_cache: CacheLimit {
        blocks: 4,
        bytes: 8 * 1024 * 1024,
      },
      contention_yields: 16,
    }
  }
}

impl HeapConfig {
  pub fn with_arenas(mut self, arenas: usize) -> Self {
    self.arenas = arenas;
    self
  }

  pub fn with_size_ceilings(mut self, small_max: usize, big_max: usize) -> Self {
    self.small_max = small_max;
    self.big_max = big_max;
    self
  }

  pub fn with_block_sizes(mut self, block_size: usize, big_block_size: usize) -> Self {
    self.block_size = block_size;
    self.big_block_size = big_block_size;
    self
  }

  pub fn with_block_cache(mut self, limit: CacheLimit) -> Self {
    self.block_cache = limit;
    self
  }

  pub fn with_big_block_cache(mut self, limit: CacheLimit) -> Self {
    self.big_block_cache = limit;
    self
  }

  pub fn with_contention_yields(mut self, yields: u32) -> Self {
    self.contention_yields = yields;
    self
  }

  /// Arena count after resolving `arenas == 0`.
  pub fn resolved_arenas(&self) -> usize {
    match self.arenas {
      0 => hardware_concurrency().clamp(1, MAX_ARENAS),
      n => n,
    }
  }

  /// Checks the config against the page granularity of the page source.
  /// Size-class tables are checked separately when they are built.
  pub fn validate(&self, page_size: usize) -> Result<(), ConfigError> {
    if self.arenas > MAX_ARENAS {
      return Err(ConfigError::TooManyArenas {
        requested: self.arenas,
        max: MAX_ARENAS,
      });
    }

    for (field, value) in [
      ("block_size", self.block_size),
      ("big_block_size", self.big_block_size),
    ] {
      if !value.is_power_of_two() || value % page_size != 0 {
        return Err(ConfigError::BlockSize {
          field,
          value,
          page_size,
        });
      }
    }

    for (field, block_size, slot_size) in [
      ("block_size", self.block_size, self.small_max),
      ("big_block_size", self.big_block_size, self.big_max),
    ] {
      if capacity_for(block_size, slot_size) < MIN_SLOTS_PER_BLOCK
        || capacity_for(block_size, MIN_ALIGN) > u32::MAX as usize
      {
        return Err(ConfigError::BlockTooSmall {
          field,
          block_size,
          slot_size,
          min: MIN_SLOTS_PER_BLOCK,
        });
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    HeapConfig::default().validate(4096).unwrap();
    HeapConfig::default().validate(16 * 1024).unwrap();
    HeapConfig::default().validate(64 * 1024).unwrap();
  }

  #[test]
  fn resolved_arenas_is_capped() {
    let resolved = HeapConfig::default().resolved_arenas();
    assert!((1..=MAX_ARENAS).contains(&resolved));
    assert_eq!(HeapConfig::default().with_arenas(3).resolved_arenas(), 3);
  }

  #[test]
  fn rejects_too_many_arenas() {
    let err = HeapConfig::default()
      .with_arenas(MAX_ARENAS + 1)
      .validate(4096)
      .unwrap_err();
    assert_eq!(
      err,
      ConfigError::TooManyArenas {
        requested: MAX_ARENAS + 1,
        max: MAX_ARENAS
      }
    );
  }

  #[test]
  fn rejects_odd_block_sizes() {
    let err = HeapConfig::default()
      .with_block_sizes(48 * 1024, 2 * 1024 * 1024)
      .validate(4096)
      .unwrap_err();
    assert!(matches!(err, ConfigError::BlockSize { field: "block_size", .. }));

    let err = HeapConfig::default()
      .with_block_sizes(2048, 2 * 1024 * 1024)
      .validate(4096)
      .unwrap_err();
    assert!(matches!(err, ConfigError::BlockSize { field: "block_size", .. }));
  }

  #[test]
  fn rejects_blocks_too_small_for_ceiling() {
    let err = HeapConfig::default()
      .with_size_ceilings(2048, 1024 * 1024)
      .validate(4096)
      .unwrap_err();
    assert!(matches!(
      err,
      ConfigError::BlockTooSmall {
        field: "big_block_size",
        ..
      }
    ));
  }

  #[test]
  fn error_messages_name_the_field() {
    let err = HeapConfig::default()
      .with_block_sizes(64 * 1024, 3 * 1024 * 1024)
      .validate(4096)
      .unwrap_err();
    assert!(err.to_string().contains("big_block_size"));
  }
}
