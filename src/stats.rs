//! Counters and snapshots fed to external statistics consumers.
//!
//! The engine only counts; interpreting the numbers is left to the caller.

use core::sync::atomic::{AtomicU64, Ordering};

/// Heap-wide allocation events.
#[derive(Debug, Default)]
pub struct EventCounters {
  allocs: AtomicU64,
  frees: AtomicU64,
  reallocs: AtomicU64,
  misuses: AtomicU64,
}

impl EventCounters {
  #[inline]
  pub(crate) fn record_alloc(&self) {
    self.allocs.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn record_free(&self) {
    self.frees.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn record_realloc(&self) {
    self.reallocs.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_misuse(&self) {
    self.misuses.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> EventStats {
    EventStats {
      allocs: self.allocs.load(Ordering::Relaxed),
      frees: self.frees.load(Ordering::Relaxed),
      reallocs: self.reallocs.load(Ordering::Relaxed),
      misuses: self.misuses.load(Ordering::Relaxed),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
  pub allocs: u64,
  pub frees: u64,
  pub reallocs: u64,
  /// Frees rejected as unknown, double or interior pointers.
  pub misuses: u64,
}

/// One small-class bin of one arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinStats {
  pub class: usize,
  pub size: usize,
  /// Regions handed out, including batches moved into thread caches.
  pub nmalloc: u64,
  pub ndalloc: u64,
  /// Regions currently allocated (set bitmap bits).
  pub curregs: usize,
  /// Runs currently carved for this class.
  pub curruns: usize,
  /// Runs carved over the bin's lifetime.
  pub nruns: u64,
  pub nfills: u64,
  pub nflushes: u64,
}

/// Large or huge allocations of one arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentClassStats {
  pub nmalloc: u64,
  pub ndalloc: u64,
  pub current: usize,
  pub bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaStats {
  pub id: usize,
  /// Threads currently bound to the arena.
  pub nthreads: usize,
  pub bins: Vec<BinStats>,
  pub large: ExtentClassStats,
  pub huge: ExtentClassStats,
  /// Chunks owned (excluding huge allocations).
  pub chunks: usize,
  /// Owned chunks with no carved pages.
  pub empty_chunks: usize,
  /// Pages carved into runs across all chunks.
  pub active_pages: usize,
  /// Empty chunks whose pages were handed back with madvise.
  pub purges: u64,
}

impl ArenaStats {
  pub fn small_allocated(&self) -> usize {
    self.bins.iter().map(|b| b.curregs * b.size).sum()
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
  /// Extents requested from a backend (mmap or data segment).
  pub os_acquisitions: u64,
  /// Extents served from recycled data-segment memory.
  pub recycled: u64,
  pub releases: u64,
  /// Bytes currently mapped through mmap.
  pub mapped_bytes: usize,
  /// Bytes the data segment has grown by.
  pub dss_bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub arenas: Vec<ArenaStats>,
  pub chunks: ChunkStats,
  pub events: EventStats,
}

impl HeapStats {
  pub fn small_allocated(&self) -> usize {
    self.arenas.iter().map(ArenaStats::small_allocated).sum()
  }
}
