//! Size classes and run geometry.
//!
//! Classes: one tiny class (8), a linear range in 16-byte steps up to 128,
//! then four classes per doubling (160, 192, 224, 256, 320, ...) until the
//! configured small maximum is covered. Each class gets the page-multiple run
//! size that wastes the least tail space.

use crate::align_up;
use crate::error::ConfigError;

const TINY_MIN: usize = 8;

/// Number of linear size classes (16...128).
const CLASSES_LINEAR: usize = 8;
const CLASSES_LINEAR_STEP: usize = 16;

/// Classes per doubling in geometric progression
const CLASSES_PER_DOUBLING: usize = 4;

/// A run may waste at most 1/RUN_WASTE_DIV of its bytes.
const RUN_WASTE_DIV: usize = 64;
const RUN_MAX_PAGES: usize = 32;

const _: () = assert!(CLASSES_LINEAR * CLASSES_LINEAR_STEP == 128);
const _: () = assert!(CLASSES_PER_DOUBLING.is_power_of_two());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
  pub index: usize,
  /// Region size in bytes.
  pub size: usize,
  /// Guaranteed alignment of every region.
  pub align: usize,
  /// Bytes per run, a multiple of the page size.
  pub run_size: usize,
  pub regions: usize,
  /// 64-bit words in the run's occupancy bitmap.
  pub bitmap_words: usize,
}

impl SizeClass {
  pub fn bitmap_bytes(&self) -> usize {
    self.bitmap_words * 8
  }
}

/// Where a request is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeKind {
  /// A region of the given class.
  Small(usize),
  /// A dedicated page run inside a chunk.
  Large { pages: usize },
  /// Whole chunks; `size` is a chunk multiple, `align` at least a chunk.
  Huge { size: usize, align: usize },
}

#[derive(Debug)]
pub struct SizeClassTable {
  classes: Vec<SizeClass>,
  /// `(size - 1) >> 3` to class index, for sizes up to `max_small`.
  lookup: Vec<u8>,
  page_size: usize,
  chunk_size: usize,
}

impl SizeClassTable {
  pub fn new(page_size: usize, chunk_size: usize, max_small: usize) -> Result<Self, ConfigError> {
    if !page_size.is_power_of_two() || !chunk_size.is_power_of_two() || chunk_size < 4 * page_size {
      return Err(ConfigError::OutOfRange {
        key: "lg_chunk",
        reason: "chunk and page sizes must be powers of two, chunk >= 4 pages",
      });
    }
    if max_small < CLASSES_LINEAR_STEP || max_small * 4 > chunk_size {
      return Err(ConfigError::OutOfRange {
        key: "max_small",
        reason: "must be at least 16 and at most a quarter chunk",
      });
    }

    let max_run = (RUN_MAX_PAGES * page_size).min(chunk_size);
    let mut classes = Vec::new();
    for (index, size) in class_sizes(max_small).into_iter().enumerate() {
      let (run_size, regions) = run_geometry(size, page_size, max_run).ok_or(ConfigError::OutOfRange {
        key: "max_small",
        reason: "largest class does not fit two regions in a run",
      })?;
      classes.push(SizeClass {
        index,
        size,
        align: (1 << size.trailing_zeros()).min(page_size),
        run_size,
        regions,
        bitmap_words: regions.div_ceil(64),
      });
    }
    if classes.len() > usize::from(u8::MAX) {
      return Err(ConfigError::OutOfRange {
        key: "max_small",
        reason: "too many size classes",
      });
    }

    let max = classes.last().map_or(0, |c| c.size);
    let mut lookup = Vec::with_capacity(max / TINY_MIN);
    for class in &classes {
      while lookup.len() * TINY_MIN < class.size {
        lookup.push(class.index as u8);
      }
    }

    Ok(Self {
      classes,
      lookup,
      page_size,
      chunk_size,
    })
  }

  pub fn len(&self) -> usize {
    self.classes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.classes.is_empty()
  }

  pub fn get(&self, index: usize) -> &SizeClass {
    &self.classes[index]
  }

  pub fn iter(&self) -> impl Iterator<Item = &SizeClass> {
    self.classes.iter()
  }

  pub fn page_size(&self) -> usize {
    self.page_size
  }

  pub fn chunk_size(&self) -> usize {
    self.chunk_size
  }

  pub fn chunk_pages(&self) -> usize {
    self.chunk_size / self.page_size
  }

  /// Largest size served by a small class.
  pub fn max_small(&self) -> usize {
    self.classes.last().map_or(0, |c| c.size)
  }

  /// Largest size served by a large run.
  pub fn large_max(&self) -> usize {
    self.chunk_size - self.page_size
  }

  /// Smallest class holding `size` bytes, if `size` is small.
  #[inline]
  pub fn class_for(&self, size: usize) -> Option<&SizeClass> {
    let size = size.max(1);
    if size > self.max_small() {
      return None;
    }
    Some(&self.classes[usize::from(self.lookup[(size - 1) >> 3])])
  }

  /// Maps a request to the path that serves it. `None` when rounding overflows.
  ///
  /// `align` must be a power of two. Alignments up to the page size are met by
  /// picking a class whose size is a multiple of the alignment (runs start on
  /// page boundaries); larger ones escalate to the huge path.
  pub fn classify(&self, size: usize, align: usize) -> Option<SizeKind> {
    debug_assert!(align.is_power_of_two());
    let size = size.max(1);
    let align = align.max(1);

    if align <= self.page_size {
      let rounded = size.checked_add(align - 1)? & !(align - 1);
      if rounded <= self.max_small() {
        let start = usize::from(self.lookup[(rounded - 1) >> 3]);
        if let Some(class) = self.classes[start..].iter().find(|c| c.size % align == 0) {
          return Some(SizeKind::Small(class.index));
        }
      }
      let pages = rounded.checked_add(self.page_size - 1)? / self.page_size;
      if pages * self.page_size <= self.large_max() {
        return Some(SizeKind::Large { pages });
      }
    }

    let align = align.max(self.chunk_size);
    let size = size.checked_add(self.chunk_size - 1)? & !(self.chunk_size - 1);
    Some(SizeKind::Huge { size, align })
  }

  /// Bytes actually backing an allocation of this kind.
  pub fn usable_size(&self, kind: SizeKind) -> usize {
    match kind {
      SizeKind::Small(class) => self.classes[class].size,
      SizeKind::Large { pages } => pages * self.page_size,
      SizeKind::Huge { size, .. } => size,
    }
  }
}

/// Class sizes covering `[1, max_small]`.
fn class_sizes(max_small: usize) -> Vec<usize> {
  let mut sizes = vec![TINY_MIN];
  for i in 1..=CLASSES_LINEAR {
    let size = i * CLASSES_LINEAR_STEP;
    sizes.push(size);
    if size >= max_small {
      return sizes;
    }
  }

  let mut base = CLASSES_LINEAR * CLASSES_LINEAR_STEP;
  loop {
    let delta = base / CLASSES_PER_DOUBLING;
    for i in 1..=CLASSES_PER_DOUBLING {
      let size = base + i * delta;
      sizes.push(size);
      if size >= max_small {
        return sizes;
      }
    }
    base *= 2;
  }
}

/// Smallest run holding two or more regions with acceptable tail waste, else
/// the least wasteful run up to `max_run`.
fn run_geometry(size: usize, page_size: usize, max_run: usize) -> Option<(usize, usize)> {
  let mut run = align_up(2 * size, page_size);
  let mut best: Option<(usize, usize)> = None;
  while run <= max_run {
    let regions = run / size;
    let waste = run - regions * size;
    if waste * RUN_WASTE_DIV <= run {
      return Some((run, regions));
    }
    let better = match best {
      None => true,
      Some((best_run, best_regions)) => waste * best_run < (best_run - best_regions * size) * run,
    };
    if better {
      best = Some((run, regions));
    }
    run += page_size;
  }
  best
}
