//! Thread cache.
//!
//! One bounded stack per small class, plus one per large page count up to
//! `tcache_max`. A hit touches nothing shared. Misses refill a batch from the
//! arena under a single bin lock; overflowing stacks flush their oldest
//! entries back the same way. An incremental GC walks the bins and trims the
//! part of each stack that went unused since its last visit.

use crate::arena::Arena;
use crate::config::Config;
use crate::error::{AllocError, Misuse};
use crate::heap::Shared;
use crate::size_class::SizeClassTable;

struct CacheBin {
  stack: Box<[usize]>,
  len: usize,
  /// Smallest `len` since the GC last visited this bin.
  low_water: usize,
}

impl CacheBin {
  fn new(capacity: usize) -> Self {
    Self {
      stack: vec![0; capacity].into_boxed_slice(),
      len: 0,
      low_water: 0,
    }
  }

  #[inline]
  fn pop(&mut self) -> Option<usize> {
    if self.len == 0 {
      self.low_water = 0;
      return None;
    }
    self.len -= 1;
    self.low_water = self.low_water.min(self.len);
    Some(self.stack[self.len])
  }

  #[inline]
  fn holds(&self, addr: usize) -> bool {
    self.stack[..self.len].contains(&addr)
  }
}

pub(crate) struct ThreadCache {
  bins: Box<[CacheBin]>,
  nsmall: usize,
  max_large_pages: usize,
  fill_div: usize,
  gc_interval: u32,
  gc_ticks: u32,
  gc_next: usize,
  /// Misuse found while flushing, waiting for the handle to report it.
  misuses: Vec<Misuse>,
}

impl ThreadCache {
  pub(crate) fn new(classes: &SizeClassTable, config: &Config) -> Self {
    let max_large_pages = config.tcache_max / classes.page_size();
    let mut bins: Vec<CacheBin> = classes
      .iter()
      .map(|c| CacheBin::new((2 * c.regions).min(config.tcache_slots_small)))
      .collect();
    bins.extend((0..max_large_pages).map(|_| CacheBin::new(config.tcache_slots_large)));

    let nbins = bins.len().max(1) as u32;
    Self {
      bins: bins.into_boxed_slice(),
      nsmall: classes.len(),
      max_large_pages,
      fill_div: config.tcache_fill_div.max(1),
      gc_interval: if config.tcache_gc_sweep == 0 {
        0
      } else {
        (config.tcache_gc_sweep / nbins).max(1)
      },
      gc_ticks: 0,
      gc_next: 0,
      misuses: Vec::new(),
    }
  }

  /// Cache bin serving a large run of `pages`, if such runs are cached.
  #[inline]
  pub(crate) fn large_bin(&self, pages: usize) -> Option<usize> {
    (pages >= 1 && pages <= self.max_large_pages).then(|| self.nsmall + pages - 1)
  }

  pub(crate) fn len(&self, bin: usize) -> usize {
    self.bins.get(bin).map_or(0, |b| b.len)
  }

  pub(crate) fn capacity(&self, bin: usize) -> usize {
    self.bins.get(bin).map_or(0, |b| b.stack.len())
  }

  /// Pops a region of `class`, refilling from `arena` on a miss.
  #[inline]
  pub(crate) fn alloc_small(&mut self, ctx: &Shared, arena: &Arena, class: usize) -> Result<usize, AllocError> {
    self.tick(ctx, arena);
    let bin = &mut self.bins[class];
    if let Some(addr) = bin.pop() {
      return Ok(addr);
    }
    let want = (bin.stack.len() / self.fill_div).max(1);
    let filled = arena.fill_small(ctx, class, &mut bin.stack[..want])?;
    bin.len = filled;
    bin.pop().ok_or(AllocError::OutOfMemory(ctx.classes.get(class).size))
  }

  /// Pops a cached large run. No refill: misses go to the arena directly.
  #[inline]
  pub(crate) fn alloc_large(&mut self, ctx: &Shared, arena: &Arena, bin: usize) -> Option<usize> {
    self.tick(ctx, arena);
    self.bins[bin].pop()
  }

  /// Caches `addr` in `bin`, flushing the oldest half when full.
  pub(crate) fn free(&mut self, ctx: &Shared, arena: &Arena, bin: usize, addr: usize) -> Result<(), Misuse> {
    if cfg!(debug_assertions) && self.bins[bin].holds(addr) {
      return Err(Misuse::DoubleFree(addr));
    }
    let high = self.bins[bin].stack.len();
    if self.bins[bin].len == high {
      // Count after the push lands on high / 2.
      self.flush_bin(ctx, arena, bin, (high / 2).saturating_sub(1));
    }
    let b = &mut self.bins[bin];
    b.stack[b.len] = addr;
    b.len += 1;
    self.tick(ctx, arena);
    Ok(())
  }

  /// Returns all but the newest `keep` entries of `bin` to the arena.
  fn flush_bin(&mut self, ctx: &Shared, arena: &Arena, bin: usize, keep: usize) {
    let b = &mut self.bins[bin];
    if b.len <= keep {
      return;
    }
    let n = b.len - keep;
    let misuses = if bin < self.nsmall {
      arena.flush_small(ctx, bin, &b.stack[..n])
    } else {
      arena.flush_large(ctx, &b.stack[..n])
    };
    self.misuses.extend(misuses);
    b.stack.copy_within(n..b.len, 0);
    b.len = keep;
    b.low_water = b.low_water.min(keep);
    log::trace!("tcache flushed {n} entries of bin {bin} to arena {}", arena.id());
  }

  pub(crate) fn flush_all(&mut self, ctx: &Shared, arena: &Arena) {
    for bin in 0..self.bins.len() {
      self.flush_bin(ctx, arena, bin, 0);
    }
  }

  /// Drains misuse detected by flushes since the last call.
  pub(crate) fn take_misuses(&mut self) -> Vec<Misuse> {
    std::mem::take(&mut self.misuses)
  }

  /// Advances the incremental GC by one event.
  fn tick(&mut self, ctx: &Shared, arena: &Arena) {
    if self.gc_interval == 0 {
      return;
    }
    self.gc_ticks += 1;
    if self.gc_ticks < self.gc_interval {
      return;
    }
    self.gc_ticks = 0;

    let bin = self.gc_next;
    self.gc_next = (bin + 1) % self.bins.len();
    let low = self.bins[bin].low_water;
    if low > 0 {
      // Entries below the low-water mark sat unused for a whole sweep.
      let len = self.bins[bin].len;
      self.flush_bin(ctx, arena, bin, len - (low - low / 4));
    }
    let b = &mut self.bins[bin];
    b.low_water = b.len;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{DssPrecedence, RetentionPolicy};

  fn setup(config: Config) -> (Shared, Arena) {
    let ctx = Shared::new(Config {
      dss: DssPrecedence::Disabled,
      retention: RetentionPolicy::Retain,
      ..config
    })
    .unwrap();
    let arena = Arena::new(0, &ctx.classes);
    (ctx, arena)
  }

  #[test]
  fn miss_fills_a_batch() {
    let (ctx, arena) = setup(Config::default());
    let mut cache = ThreadCache::new(&ctx.classes, &ctx.config);
    let class = ctx.classes.class_for(64).unwrap().index;
    let high = cache.capacity(class);
    assert_eq!(high, 128);

    let first = cache.alloc_small(&ctx, &arena, class).unwrap();
    assert_eq!(cache.len(class), high / 2 - 1);
    let second = cache.alloc_small(&ctx, &arena, class).unwrap();
    assert_eq!(second, first + 64);
    let stats = arena.stats();
    assert_eq!(stats.bins[class].curregs, high / 2);
    assert_eq!(stats.bins[class].nfills, 1);

    cache.flush_all(&ctx, &arena);
    // The two live regions stay allocated.
    assert_eq!(arena.stats().bins[class].curregs, 2);
  }

  #[test]
  fn overflow_flushes_oldest_half() {
    let (ctx, arena) = setup(Config {
      tcache_slots_small: 8,
      ..Config::default()
    });
    let mut cache = ThreadCache::new(&ctx.classes, &ctx.config);
    let class = ctx.classes.class_for(16).unwrap().index;
    assert_eq!(cache.capacity(class), 8);

    let addrs: Vec<usize> = (0..9).map(|_| arena.alloc_small(&ctx, class).unwrap()).collect();
    for &addr in &addrs[..8] {
      cache.free(&ctx, &arena, class, addr).unwrap();
    }
    assert_eq!(cache.len(class), 8);
    cache.free(&ctx, &arena, class, addrs[8]).unwrap();
    assert_eq!(cache.len(class), 4);
    assert_eq!(arena.stats().bins[class].curregs, 4);
    // Newest entries survive.
    assert_eq!(cache.alloc_small(&ctx, &arena, class).unwrap(), addrs[8]);
    assert_eq!(cache.alloc_small(&ctx, &arena, class).unwrap(), addrs[7]);
  }

  #[test]
  fn large_runs_are_cached_up_to_the_limit() {
    let (ctx, arena) = setup(Config::default());
    let mut cache = ThreadCache::new(&ctx.classes, &ctx.config);
    let page = ctx.classes.page_size();
    let max_pages = ctx.config.tcache_max / page;
    assert!(cache.large_bin(max_pages).is_some());
    assert!(cache.large_bin(max_pages + 1).is_none());

    let bin = cache.large_bin(2).unwrap();
    let addr = arena.alloc_large(&ctx, 2).unwrap();
    cache.free(&ctx, &arena, bin, addr).unwrap();
    assert_eq!(cache.alloc_large(&ctx, &arena, bin), Some(addr));
    assert_eq!(cache.alloc_large(&ctx, &arena, bin), None);
    cache.free(&ctx, &arena, bin, addr).unwrap();
    cache.flush_all(&ctx, &arena);
    assert_eq!(arena.stats().large.current, 0);
  }

  #[test]
  fn stale_entries_are_held_until_taken() {
    let (ctx, arena) = setup(Config::default());
    let mut cache = ThreadCache::new(&ctx.classes, &ctx.config);
    let class = ctx.classes.class_for(64).unwrap().index;
    let keep = arena.alloc_small(&ctx, class).unwrap();
    let addr = arena.alloc_small(&ctx, class).unwrap();
    cache.free(&ctx, &arena, class, addr).unwrap();
    assert!(arena.flush_small(&ctx, class, &[addr]).is_empty());
    assert!(cache.take_misuses().is_empty());

    cache.flush_all(&ctx, &arena);
    assert_eq!(cache.take_misuses(), vec![Misuse::DoubleFree(addr)]);
    assert!(cache.take_misuses().is_empty());
    assert_eq!(arena.stats().bins[class].curregs, 1);
    assert!(arena.flush_small(&ctx, class, &[keep]).is_empty());
  }

  #[cfg(debug_assertions)]
  #[test]
  fn cached_double_free_is_caught() {
    let (ctx, arena) = setup(Config::default());
    let mut cache = ThreadCache::new(&ctx.classes, &ctx.config);
    let class = ctx.classes.class_for(32).unwrap().index;
    let addr = cache.alloc_small(&ctx, &arena, class).unwrap();
    cache.free(&ctx, &arena, class, addr).unwrap();
    assert_eq!(cache.free(&ctx, &arena, class, addr), Err(Misuse::DoubleFree(addr)));
    cache.flush_all(&ctx, &arena);
  }

  #[test]
  fn gc_trims_idle_entries() {
    let (ctx, arena) = setup(Config {
      tcache_gc_sweep: 1,
      ..Config::default()
    });
    let mut cache = ThreadCache::new(&ctx.classes, &ctx.config);
    assert_eq!(cache.gc_interval, 1);
    let class = ctx.classes.class_for(48).unwrap().index;
    let addr = cache.alloc_small(&ctx, &arena, class).unwrap();
    cache.free(&ctx, &arena, class, addr).unwrap();
    let cached = cache.len(class);
    assert!(cached > 0);

    // Two full sweeps: the first records the low-water mark, the second
    // flushes three quarters of it.
    let sweeps = 2 * cache.bins.len();
    let other = ctx.classes.class_for(8).unwrap().index;
    let mut spare = Vec::new();
    for _ in 0..sweeps {
      spare.push(cache.alloc_small(&ctx, &arena, other).unwrap());
    }
    assert!(cache.len(class) < cached);
    for addr in spare {
      cache.free(&ctx, &arena, other, addr).unwrap();
    }
    cache.flush_all(&ctx, &arena);
    assert_eq!(arena.stats().small_allocated(), 0);
  }
}
