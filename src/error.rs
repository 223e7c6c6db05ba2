use thiserror::Error;

/// Failure of a single allocate/reallocate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  /// The page source refused to map a region.
  #[error("out of memory: page source could not map {size} bytes")]
  OutOfMemory { size: usize },
  /// Adding the allocation header or rounding to pages overflowed `usize`.
  #[error("allocation of {size} bytes overflows the address space")]
  SizeOverflow { size: usize },
}

/// Rejected `HeapConfig`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
  #[error("{field} must be a power-of-two multiple of the page size ({page_size}), got {value}")]
  BlockSize {
    field: &'static str,
    value: usize,
    page_size: usize,
  },
  #[error(
    "size ceilings must be 16-byte multiples with 16 <= small_max < big_max \
     (small_max={small_max}, big_max={big_max})"
  )]
  Ceilings { small_max: usize, big_max: usize },
  #[error("{field} of {block_size} bytes holds fewer than {min} slots of {slot_size} bytes")]
  BlockTooSmall {
    field: &'static str,
    block_size: usize,
    slot_size: usize,
    min: usize,
  },
  #[error("arena count {requested} exceeds the maximum of {max}")]
  TooManyArenas { requested: usize, max: usize },
  #[error("{table} size-class table needs more than {max} classes")]
  TooManyClasses { table: &'static str, max: usize },
}
