//! Size-Class Mapper.
//!
//! Requests up to `small_max` are served from Blocks, requests up to
//! `big_max` from Big-Blocks, everything larger is mapped directly (Huge).
//! Small classes step linearly by 16 up to 128 bytes and then geometrically,
//! four classes per doubling. Big classes continue the geometric progression
//! from `small_max`.

use crate::align_up;
use crate::error::ConfigError;

/// Alignment of every pointer handed out (and granularity of every class).
pub const MIN_ALIGN: usize = 16;

/// Upper bound on classes per table.
pub const MAX_CLASSES: usize = 48;

/// Linear classes (16...128).
const CLASSES_LINEAR_STEP: usize = 16;
const CLASSES_LINEAR_MAX: usize = 128;

/// Sub-class multipliers for the geometric range (scaled by 16 for integer math).
/// 1.19, 1.44, 1.69, then the next doubling.
const GEO_MULTIPLIERS: [usize; 4] = [19, 23, 27, 32];

const _: () = assert!(CLASSES_LINEAR_MAX % CLASSES_LINEAR_STEP == 0);
const _: () = assert!(MIN_ALIGN.is_power_of_two());

/// Outcome of [`SizeClasses::classify`]. Payloads are slot sizes in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeClass {
  Small(usize),
  Big(usize),
  Huge,
}

impl SizeClass {
  /// Slot size for sliced classes, `None` for Huge.
  pub fn slot_size(self) -> Option<usize> {
    match self {
      SizeClass::Small(slot) | SizeClass::Big(slot) => Some(slot),
      SizeClass::Huge => None,
    }
  }
}

/// Ascending slot sizes of one block kind.
#[derive(Clone, Debug)]
struct ClassTable {
  name: &'static str,
  sizes: [usize; MAX_CLASSES],
  len: usize,
}

impl ClassTable {
  const fn empty(name: &'static str) -> Self {
    Self {
      name,
      sizes: [0; MAX_CLASSES],
      len: 0,
    }
  }

  /// Appends `size` unless it does not grow the table.
  fn push(&mut self, size: usize) -> Result<(), ConfigError> {
    if self.len > 0 && size <= self.sizes[self.len - 1] {
      return Ok(());
    }
    if self.len == MAX_CLASSES {
      return Err(ConfigError::TooManyClasses {
        table: self.name,
        max: MAX_CLASSES,
      });
    }
    self.sizes[self.len] = size;
    self.len += 1;
    Ok(())
  }

  /// Geometric classes strictly between `floor` and `ceiling`, then `ceiling`.
  fn extend_geometric(&mut self, floor: usize, ceiling: usize) -> Result<(), ConfigError> {
    let mut base = floor;
    while base < ceiling {
      for mult in GEO_MULTIPLIERS {
        let size = align_up((base * mult) / 16, MIN_ALIGN);
        if size >= ceiling {
          break;
        }
        self.push(size)?;
      }
      base *= 2;
    }
    self.push(ceiling)
  }

  #[inline]
  fn as_slice(&self) -> &[usize] {
    &self.sizes[..self.len]
  }

  /// Smallest class >= `n`. `n` must not exceed the last class.
  #[inline]
  fn round_up(&self, n: usize) -> usize {
    let classes = self.as_slice();
    classes[classes.partition_point(|&s| s < n)]
  }
}

/// Class tables for one heap. Built once from the configured ceilings.
#[derive(Clone, Debug)]
pub struct SizeClasses {
  small: ClassTable,
  big: ClassTable,
  small_max: usize,
  big_max: usize,
}

impl SizeClasses {
  pub fn new(small_max: usize, big_max: usize) -> Result<Self, ConfigError> {
    if small_max < MIN_ALIGN
      || small_max % MIN_ALIGN != 0
      || big_max % MIN_ALIGN != 0
      || big_max <= small_max
    {
      return Err(ConfigError::Ceilings { small_max, big_max });
    }

    let mut small = ClassTable::empty("small");
    let mut size = CLASSES_LINEAR_STEP;
    while size <= CLASSES_LINEAR_MAX && size < small_max {
      small.push(size)?;
      size += CLASSES_LINEAR_STEP;
    }
    small.extend_geometric(CLASSES_LINEAR_MAX, small_max)?;

    let mut big = ClassTable::empty("big");
    big.extend_geometric(small_max, big_max)?;

    Ok(Self {
      small,
      big,
      small_max,
      big_max,
    })
  }

  /// Maps a request to its class. Size 0 is served as size 1.
  #[inline]
  pub fn classify(&self, size: usize) -> SizeClass {
    let size = size.max(1);
    if size <= self.small_max {
      SizeClass::Small(self.small.round_up(size))
    } else if size <= self.big_max {
      SizeClass::Big(self.big.round_up(size))
    } else {
      SizeClass::Huge
    }
  }

  pub fn small_classes(&self) -> &[usize] {
    self.small.as_slice()
  }

  pub fn big_classes(&self) -> &[usize] {
    self.big.as_slice()
  }

  pub fn small_max(&self) -> usize {
    self.small_max
  }

  pub fn big_max(&self) -> usize {
    self.big_max
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn defaults() -> SizeClasses {
    SizeClasses::new(2048, 256 * 1024).unwrap()
  }

  #[test]
  fn small_table_shape() {
    let classes = defaults();
    let small = classes.small_classes();
    assert_eq!(&small[..10], &[16, 32, 48, 64, 80, 96, 112, 128, 160, 192]);
    assert_eq!(*small.last().unwrap(), 2048);
    assert!(small.windows(2).all(|w| w[0] < w[1]));
    assert!(small.iter().all(|s| s % MIN_ALIGN == 0));
  }

  #[test]
  fn big_table_continues_above_small() {
    let classes = defaults();
    let big = classes.big_classes();
    assert!(big[0] > 2048);
    assert_eq!(big[0], 2432);
    assert_eq!(*big.last().unwrap(), 256 * 1024);
    assert!(big.windows(2).all(|w| w[0] < w[1]));
  }

  #[test]
  fn zero_is_smallest_class() {
    assert_eq!(defaults().classify(0), SizeClass::Small(16));
    assert_eq!(defaults().classify(1), SizeClass::Small(16));
  }

  #[test]
  fn boundaries_route_to_named_class() {
    let classes = defaults();
    assert_eq!(classes.classify(2048), SizeClass::Small(2048));
    assert_eq!(classes.classify(2049), SizeClass::Big(2432));
    assert_eq!(classes.classify(256 * 1024), SizeClass::Big(256 * 1024));
    assert_eq!(classes.classify(256 * 1024 + 1), SizeClass::Huge);
  }

  #[test]
  fn every_size_fits_its_slot() {
    let classes = defaults();
    for size in 1..=(256 * 1024) {
      let slot = classes.classify(size).slot_size().unwrap();
      assert!(slot >= size, "size {size} got slot {slot}");
    }
  }

  #[test]
  fn fragmentation_is_bounded() {
    let classes = defaults();
    for size in 129..=(256 * 1024) {
      let slot = classes.classify(size).slot_size().unwrap();
      // One geometric step is at most ~1.25x plus alignment slack.
      assert!(slot * 4 <= size * 5 + 64, "size {size} got slot {slot}");
    }
  }

  #[test]
  fn tiny_small_ceiling() {
    let classes = SizeClasses::new(64, 4096).unwrap();
    assert_eq!(classes.small_classes(), &[16, 32, 48, 64]);
    assert_eq!(classes.classify(65), SizeClass::Big(80));
  }

  #[test]
  fn rejects_bad_ceilings() {
    assert!(matches!(
      SizeClasses::new(2048, 2048),
      Err(ConfigError::Ceilings { .. })
    ));
    assert!(matches!(
      SizeClasses::new(100, 4096),
      Err(ConfigError::Ceilings { .. })
    ));
  }

  #[test]
  fn rejects_oversized_tables() {
    assert!(matches!(
      SizeClasses::new(2048, 1 << 40),
      Err(ConfigError::TooManyClasses { table: "big", .. })
    ));
  }
}
