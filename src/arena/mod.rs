//! Arenas.
//!
//! An arena owns chunks and carves them into page runs. Small runs belong to
//! a size-class bin and hand out bitmap regions; large runs hold a single
//! allocation; huge allocations bypass chunks and are tracked by address.
//!
//! Locking: one mutex per bin and one for the arena state (chunks, free page
//! spans, large and huge indexes). A bin lock may be held while taking the
//! state lock, never the reverse. Chunks are requested from the OS with the
//! state lock released.

mod bin;
mod chunk_map;
mod huge;
mod table;

use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::{BTreeMap, BTreeSet};

use parking_lot::{Mutex, MutexGuard};

use crate::chunk::Extent;
use crate::config::RetentionPolicy;
use crate::error::{AllocError, Misuse};
use crate::extent::{ExtentKind, ExtentNode};
use crate::heap::Shared;
use crate::size_class::SizeClassTable;
use crate::stats::{ArenaStats, ExtentClassStats};

use bin::{Bin, Run};
use chunk_map::ChunkMap;
use huge::HugeAllocation;
use table::{ChunkId, IdTable, RunId};

pub struct Arena {
  id: u16,
  bins: Box<[Mutex<Bin>]>,
  state: Mutex<ArenaState>,
  nthreads: AtomicUsize,
}

struct ArenaState {
  chunks: IdTable<ChunkId, ChunkMap>,
  /// Free page spans across all chunks, smallest first, then lowest address.
  avail: BTreeSet<FreeSpan>,
  large: BTreeMap<usize, LargeRun>,
  huge: BTreeMap<usize, HugeAllocation>,
  empty_chunks: usize,
  large_stats: ExtentClassStats,
  huge_stats: ExtentClassStats,
  purges: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FreeSpan {
  pages: usize,
  addr: usize,
  chunk: ChunkId,
}

/// Pages carved out of a chunk.
#[derive(Debug, Clone, Copy)]
struct Span {
  chunk: ChunkId,
  first_page: usize,
  addr: usize,
}

#[derive(Debug, Clone, Copy)]
struct LargeRun {
  chunk: ChunkId,
  pages: usize,
}

impl Arena {
  pub(crate) fn new(id: u16, classes: &SizeClassTable) -> Self {
    Self {
      id,
      bins: classes.iter().map(|c| Mutex::new(Bin::new(*c))).collect(),
      state: Mutex::new(ArenaState {
        chunks: IdTable::new(),
        avail: BTreeSet::new(),
        large: BTreeMap::new(),
        huge: BTreeMap::new(),
        empty_chunks: 0,
        large_stats: ExtentClassStats::default(),
        huge_stats: ExtentClassStats::default(),
        purges: 0,
      }),
      nthreads: AtomicUsize::new(0),
    }
  }

  pub fn id(&self) -> usize {
    usize::from(self.id)
  }

  /// Threads currently bound to this arena.
  pub fn nthreads(&self) -> usize {
    self.nthreads.load(Ordering::Relaxed)
  }

  pub(crate) fn bind(&self) {
    self.nthreads.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn unbind(&self) {
    self.nthreads.fetch_sub(1, Ordering::Relaxed);
  }

  // ===========================================================================
  // Small
  // ===========================================================================

  pub(crate) fn alloc_small(&self, ctx: &Shared, class: usize) -> Result<usize, AllocError> {
    let mut bin = self.bins[class].lock();
    if let Some(addr) = bin.alloc() {
      return Ok(addr);
    }
    self.new_run(ctx, &mut bin)?;
    bin.alloc().ok_or(AllocError::OutOfMemory(bin.class().run_size))
  }

  /// Fills `out` with up to `out.len()` regions under one bin lock, lowest
  /// address last. Returns how many were written.
  pub(crate) fn fill_small(&self, ctx: &Shared, class: usize, out: &mut [usize]) -> Result<usize, AllocError> {
    let mut bin = self.bins[class].lock();
    let mut n = 0;
    while n < out.len() {
      if let Some(addr) = bin.alloc() {
        n += 1;
        out[out.len() - n] = addr;
        continue;
      }
      if let Err(err) = self.new_run(ctx, &mut bin) {
        if n == 0 {
          return Err(err);
        }
        break;
      }
    }
    bin.record_fill();
    // Shift down when short so entries stay contiguous from index 0.
    if n < out.len() {
      out.copy_within(out.len() - n.., 0);
    }
    Ok(n)
  }

  pub(crate) fn free_small(&self, ctx: &Shared, addr: usize, class: usize, run: u32) -> Result<(), Misuse> {
    let mut bin = self.bins[class].lock();
    if let Some(run) = bin.release(addr, RunId(run))? {
      self.retire_run(ctx, &bin, run);
    }
    Ok(())
  }

  /// Returns cached regions of one class under a single bin lock. Entries
  /// that no longer resolve to a live region of this bin were released
  /// behind the cache's back and come back as misuse.
  pub(crate) fn flush_small(&self, ctx: &Shared, class: usize, addrs: &[usize]) -> Vec<Misuse> {
    let mut misuses = Vec::new();
    let mut bin = self.bins[class].lock();
    for &addr in addrs {
      let run = match ctx.extents.lookup(addr) {
        Some(ExtentNode {
          arena,
          kind: ExtentKind::Small { class: c, run },
        }) if arena == self.id && usize::from(c) == class => RunId(run),
        _ => {
          misuses.push(Misuse::DoubleFree(addr));
          continue;
        }
      };
      match bin.release(addr, run) {
        Ok(Some(run)) => self.retire_run(ctx, &bin, run),
        Ok(None) => {}
        Err(misuse) => misuses.push(misuse),
      }
    }
    bin.record_flush();
    misuses
  }

  fn new_run(&self, ctx: &Shared, bin: &mut Bin) -> Result<(), AllocError> {
    let class = *bin.class();
    let page = ctx.classes.page_size();
    let pages = class.run_size / page;
    let (mut state, span) = self.carve(ctx, pages)?;

    let id = bin.insert_run(span.chunk, span.first_page, span.addr);
    let node = ExtentNode::new(
      self.id,
      ExtentKind::Small {
        class: class.index as u16,
        run: id.0,
      },
    );
    if let Err(err) = ctx.extents.insert(span.addr, class.run_size, node) {
      bin.remove_run(id);
      let surplus = self.free_pages(ctx, &mut state, span.chunk, span.first_page, pages);
      drop(state);
      self.release_extent(ctx, surplus);
      return Err(err);
    }
    log::trace!("arena {} carved {}-byte run for class {} at {:#x}", self.id, class.run_size, class.size, span.addr);
    Ok(())
  }

  fn retire_run(&self, ctx: &Shared, bin: &Bin, run: Run) {
    let class = bin.class();
    let pages = class.run_size / ctx.classes.page_size();
    if let Err(err) = ctx.extents.insert(run.base, class.run_size, ExtentNode::new(self.id, ExtentKind::Free)) {
      log::warn!("could not mark run {:#x} free: {err}", run.base);
    }
    let mut state = self.state.lock();
    let surplus = self.free_pages(ctx, &mut state, run.chunk, run.first_page, pages);
    drop(state);
    self.release_extent(ctx, surplus);
  }

  // ===========================================================================
  // Large
  // ===========================================================================

  pub(crate) fn alloc_large(&self, ctx: &Shared, pages: usize) -> Result<usize, AllocError> {
    let page = ctx.classes.page_size();
    let (mut state, span) = self.carve(ctx, pages)?;
    let node = large_node(self.id, span.chunk, pages);
    if let Err(err) = ctx.extents.insert(span.addr, page, node) {
      let surplus = self.free_pages(ctx, &mut state, span.chunk, span.first_page, pages);
      drop(state);
      self.release_extent(ctx, surplus);
      return Err(err);
    }
    state.large.insert(
      span.addr,
      LargeRun {
        chunk: span.chunk,
        pages,
      },
    );
    let stats = &mut state.large_stats;
    stats.nmalloc += 1;
    stats.current += 1;
    stats.bytes += pages * page;
    Ok(span.addr)
  }

  pub(crate) fn free_large(&self, ctx: &Shared, addr: usize) -> Result<(), Misuse> {
    let mut state = self.state.lock();
    let surplus = self.take_large(ctx, &mut state, addr)?;
    drop(state);
    self.release_extent(ctx, surplus);
    Ok(())
  }

  pub(crate) fn flush_large(&self, ctx: &Shared, addrs: &[usize]) -> Vec<Misuse> {
    let mut misuses = Vec::new();
    let mut state = self.state.lock();
    for &addr in addrs {
      match self.take_large(ctx, &mut state, addr) {
        Ok(None) => {}
        Ok(surplus) => {
          drop(state);
          self.release_extent(ctx, surplus);
          state = self.state.lock();
        }
        Err(misuse) => misuses.push(misuse),
      }
    }
    misuses
  }

  fn take_large(&self, ctx: &Shared, state: &mut ArenaState, addr: usize) -> Result<Option<Extent>, Misuse> {
    let page = ctx.classes.page_size();
    // The head page resolved to a live large run; a missing entry means it
    // was freed since.
    let run = state.large.remove(&addr).ok_or(Misuse::DoubleFree(addr))?;
    if let Err(err) = ctx.extents.insert(addr, page, ExtentNode::new(self.id, ExtentKind::Free)) {
      log::warn!("could not mark large run {addr:#x} free: {err}");
    }
    let stats = &mut state.large_stats;
    stats.ndalloc += 1;
    stats.current -= 1;
    stats.bytes -= run.pages * page;

    let first = match state.chunks.get(run.chunk) {
      Some(chunk) => (addr - chunk.base()) / page,
      None => return Ok(None),
    };
    Ok(self.free_pages(ctx, state, run.chunk, first, run.pages))
  }

  /// Grows or shrinks a large run without moving it.
  pub(crate) fn resize_large(&self, ctx: &Shared, addr: usize, new_pages: usize) -> bool {
    let page = ctx.classes.page_size();
    let mut state = self.state.lock();
    let Some(run) = state.large.get(&addr).copied() else {
      return false;
    };
    if new_pages == run.pages {
      return true;
    }
    let Some(base) = state.chunks.get(run.chunk).map(ChunkMap::base) else {
      return false;
    };
    let first = (addr - base) / page;

    if new_pages < run.pages {
      // The run keeps its head, so the chunk cannot become empty here.
      let surplus = self.free_pages(ctx, &mut state, run.chunk, first + new_pages, run.pages - new_pages);
      debug_assert!(surplus.is_none());
    } else if !state.take_pages_at(run.chunk, first + run.pages, new_pages - run.pages, page) {
      return false;
    }

    if let Err(err) = ctx.extents.insert(addr, page, large_node(self.id, run.chunk, new_pages)) {
      log::warn!("could not update large run {addr:#x}: {err}");
    }
    state.large.insert(
      addr,
      LargeRun {
        chunk: run.chunk,
        pages: new_pages,
      },
    );
    state.large_stats.bytes = state.large_stats.bytes + new_pages * page - run.pages * page;
    true
  }

  /// Bytes of the large run at `addr`.
  pub(crate) fn large_size(&self, ctx: &Shared, addr: usize) -> Option<usize> {
    let pages = self.state.lock().large.get(&addr)?.pages;
    Some(pages * ctx.classes.page_size())
  }

  /// Classifies a free of an address on a page no run currently occupies.
  pub(crate) fn stray_pointer(&self, ctx: &Shared, addr: usize) -> Misuse {
    let page = ctx.classes.page_size();
    let state = self.state.lock();
    match state.large.range(..=addr).next_back() {
      Some((&start, run)) if addr < start + run.pages * page => Misuse::InteriorPointer(addr),
      _ => Misuse::UnknownPointer(addr),
    }
  }

  // ===========================================================================
  // Chunks and page spans
  // ===========================================================================

  /// Carves `pages` contiguous pages, acquiring a chunk if none has room.
  /// Returns with the state lock held so the caller can link the span.
  fn carve(&self, ctx: &Shared, pages: usize) -> Result<(MutexGuard<'_, ArenaState>, Span), AllocError> {
    let page = ctx.classes.page_size();
    let mut state = self.state.lock();
    if let Some(span) = state.alloc_span(pages, page) {
      return Ok((state, span));
    }
    drop(state);

    let extent = ctx.chunks.acquire_chunk(&ctx.extents, self.id)?;
    log::debug!("arena {} acquired chunk {:#x}", self.id, extent.base);
    let mut state = self.state.lock();
    let id = state.chunks.insert(ChunkMap::new(extent, ctx.classes.chunk_pages()));
    state.avail.insert(FreeSpan {
      pages: ctx.classes.chunk_pages(),
      addr: extent.base,
      chunk: id,
    });
    state.empty_chunks += 1;
    let span = state
      .alloc_span(pages, page)
      .ok_or(AllocError::OutOfMemory(pages * page))?;
    Ok((state, span))
  }

  /// Returns pages to their chunk. A chunk left empty is kept or handed back
  /// per the retention policy; an extent to release is returned so the
  /// caller can do so after dropping the lock.
  fn free_pages(
    &self,
    ctx: &Shared,
    state: &mut ArenaState,
    chunk: ChunkId,
    first: usize,
    pages: usize,
  ) -> Option<Extent> {
    let page = ctx.classes.page_size();
    if !state.free_span(chunk, first, pages, page) {
      return None;
    }

    let release = match ctx.config.retention {
      RetentionPolicy::Release => true,
      RetentionPolicy::Spare(n) => state.empty_chunks > n,
      RetentionPolicy::Retain => false,
    };
    if release {
      return state.remove_chunk(chunk, page);
    }

    let map = state.chunks.get_mut(chunk)?;
    if !map.purged && ctx.chunks.purge(map.base(), map.extent.size) {
      map.purged = true;
      state.purges += 1;
    }
    None
  }

  fn release_extent(&self, ctx: &Shared, extent: Option<Extent>) {
    if let Some(extent) = extent {
      log::debug!("arena {} releasing chunk {:#x}", self.id, extent.base);
      ctx.chunks.release(&ctx.extents, extent);
    }
  }

  /// Hands every chunk and huge allocation back. Only called on heap teardown.
  pub(crate) fn release_all(&self, ctx: &Shared) {
    let mut state = self.state.lock();
    state.avail.clear();
    state.large.clear();
    state.empty_chunks = 0;
    let huge = std::mem::take(&mut state.huge);
    let chunks: Vec<Extent> = state.chunks.drain().map(|c| c.extent).collect();
    drop(state);

    for extent in chunks.into_iter().chain(huge.into_values().map(|h| h.extent)) {
      ctx.chunks.release(&ctx.extents, extent);
    }
  }

  // ===========================================================================
  // Stats
  // ===========================================================================

  pub fn stats(&self) -> ArenaStats {
    // Sized up front so no allocation happens under a lock.
    let mut bins = Vec::with_capacity(self.bins.len());
    for bin in self.bins.iter() {
      bins.push(bin.lock().stats());
    }
    let state = self.state.lock();
    ArenaStats {
      id: self.id(),
      nthreads: self.nthreads(),
      bins,
      large: state.large_stats,
      huge: state.huge_stats,
      chunks: state.chunks.len(),
      empty_chunks: state.empty_chunks,
      active_pages: state.chunks.values().map(ChunkMap::used_pages).sum(),
      purges: state.purges,
    }
  }

  /// Set bitmap bits across all runs of `class`.
  pub fn bitmap_population(&self, class: usize) -> Option<usize> {
    Some(self.bins.get(class)?.lock().population())
  }
}

impl ArenaState {
  /// Best fit, lowest address among equals.
  fn alloc_span(&mut self, pages: usize, page: usize) -> Option<Span> {
    let key = FreeSpan {
      pages,
      addr: 0,
      chunk: ChunkId(0),
    };
    let span = *self.avail.range(key..).next()?;
    self.avail.remove(&span);

    let chunk = self.chunks.get_mut(span.chunk)?;
    let first = (span.addr - chunk.base()) / page;
    let was_empty = chunk.is_empty();
    if let Some((rest, len)) = chunk.take(first, pages) {
      let addr = chunk.base() + rest * page;
      self.avail.insert(FreeSpan {
        pages: len,
        addr,
        chunk: span.chunk,
      });
    }
    if was_empty {
      self.empty_chunks -= 1;
    }
    Some(Span {
      chunk: span.chunk,
      first_page: first,
      addr: span.addr,
    })
  }

  /// Takes `pages` starting exactly at page `at` of `chunk`, if free.
  fn take_pages_at(&mut self, chunk: ChunkId, at: usize, pages: usize, page: usize) -> bool {
    let Some(map) = self.chunks.get_mut(chunk) else {
      return false;
    };
    let Some(len) = map.free_at(at).filter(|&len| len >= pages) else {
      return false;
    };
    let base = map.base();
    self.avail.remove(&FreeSpan {
      pages: len,
      addr: base + at * page,
      chunk,
    });
    if let Some((rest, len)) = map.take(at, pages) {
      self.avail.insert(FreeSpan {
        pages: len,
        addr: base + rest * page,
        chunk,
      });
    }
    true
  }

  /// Returns `true` when the chunk became empty.
  fn free_span(&mut self, chunk: ChunkId, first: usize, pages: usize, page: usize) -> bool {
    let Some(map) = self.chunks.get_mut(chunk) else {
      return false;
    };
    let base = map.base();
    let merged = map.give(first, pages);
    for (first, pages) in merged.absorbed.into_iter().flatten() {
      self.avail.remove(&FreeSpan {
        pages,
        addr: base + first * page,
        chunk,
      });
    }
    self.avail.insert(FreeSpan {
      pages: merged.pages,
      addr: base + merged.first * page,
      chunk,
    });
    if map.is_empty() {
      self.empty_chunks += 1;
      return true;
    }
    false
  }

  fn remove_chunk(&mut self, chunk: ChunkId, page: usize) -> Option<Extent> {
    let map = self.chunks.remove(chunk)?;
    debug_assert!(map.is_empty());
    self.avail.remove(&FreeSpan {
      pages: map.extent.size / page,
      addr: map.base(),
      chunk,
    });
    self.empty_chunks -= 1;
    Some(map.extent)
  }
}

fn large_node(arena: u16, chunk: ChunkId, pages: usize) -> ExtentNode {
  ExtentNode::new(
    arena,
    ExtentKind::Large {
      chunk: chunk.0,
      pages: u16::try_from(pages).unwrap_or(0),
    },
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{Config, DssPrecedence};

  fn shared(retention: RetentionPolicy) -> Shared {
    Shared::new(Config {
      narenas: 1,
      dss: DssPrecedence::Disabled,
      retention,
      ..Config::default()
    })
    .unwrap()
  }

  #[test]
  fn small_regions_come_from_one_run() {
    let ctx = shared(RetentionPolicy::default());
    let arena = Arena::new(0, &ctx.classes);
    let class = ctx.classes.class_for(16).unwrap().index;
    let a = arena.alloc_small(&ctx, class).unwrap();
    let b = arena.alloc_small(&ctx, class).unwrap();
    assert_eq!(b - a, 16);
    assert_eq!(
      ctx.extents.lookup(a).map(|n| n.kind),
      Some(ExtentKind::Small {
        class: class as u16,
        run: 0
      })
    );
    let stats = arena.stats();
    assert_eq!(stats.chunks, 1);
    assert_eq!(stats.bins[class].curregs, 2);
    assert_eq!(stats.active_pages, 1);
    arena.release_all(&ctx);
  }

  #[test]
  fn emptied_run_returns_its_pages() {
    let ctx = shared(RetentionPolicy::Retain);
    let arena = Arena::new(0, &ctx.classes);
    let class = ctx.classes.class_for(100).unwrap().index;
    let a = arena.alloc_small(&ctx, class).unwrap();
    let Some(ExtentNode {
      kind: ExtentKind::Small { run, .. },
      ..
    }) = ctx.extents.lookup(a)
    else {
      panic!("expected a small run");
    };
    arena.free_small(&ctx, a, class, run).unwrap();
    let stats = arena.stats();
    assert_eq!(stats.active_pages, 0);
    assert_eq!(stats.empty_chunks, 1);
    assert_eq!(stats.chunks, 1);
    assert_eq!(ctx.extents.lookup(a).map(|n| n.kind), Some(ExtentKind::Free));
    assert_eq!(
      arena.free_small(&ctx, a, class, run),
      Err(Misuse::UnknownPointer(a))
    );
    arena.release_all(&ctx);
  }

  #[test]
  fn release_policy_returns_empty_chunks() {
    let ctx = shared(RetentionPolicy::Release);
    let arena = Arena::new(0, &ctx.classes);
    let addr = arena.alloc_large(&ctx, 4).unwrap();
    arena.free_large(&ctx, addr).unwrap();
    assert_eq!(arena.stats().chunks, 0);
    assert_eq!(ctx.extents.lookup(addr), None);
    assert_eq!(ctx.chunks.stats().releases, 1);
  }

  #[test]
  fn spare_policy_keeps_one_chunk() {
    let ctx = shared(RetentionPolicy::Spare(1));
    let arena = Arena::new(0, &ctx.classes);
    let chunk_pages = ctx.classes.chunk_pages();
    // Two runs that cannot share a chunk.
    let a = arena.alloc_large(&ctx, chunk_pages - 1).unwrap();
    let b = arena.alloc_large(&ctx, chunk_pages - 1).unwrap();
    assert_eq!(arena.stats().chunks, 2);
    arena.free_large(&ctx, a).unwrap();
    assert_eq!(arena.stats().chunks, 2);
    arena.free_large(&ctx, b).unwrap();
    let stats = arena.stats();
    assert_eq!(stats.chunks, 1);
    assert_eq!(stats.empty_chunks, 1);

    let before = ctx.chunks.stats().os_acquisitions;
    let c = arena.alloc_large(&ctx, 8).unwrap();
    assert_eq!(ctx.chunks.stats().os_acquisitions, before);
    arena.free_large(&ctx, c).unwrap();
    arena.release_all(&ctx);
  }

  #[test]
  fn large_runs_coalesce_and_reuse_lowest_address() {
    let ctx = shared(RetentionPolicy::Retain);
    let arena = Arena::new(0, &ctx.classes);
    let page = ctx.classes.page_size();
    let a = arena.alloc_large(&ctx, 2).unwrap();
    let b = arena.alloc_large(&ctx, 2).unwrap();
    let c = arena.alloc_large(&ctx, 2).unwrap();
    assert_eq!(b, a + 2 * page);
    assert_eq!(c, b + 2 * page);
    arena.free_large(&ctx, a).unwrap();
    arena.free_large(&ctx, b).unwrap();
    // The merged 4-page hole is the best fit for 3 pages.
    let d = arena.alloc_large(&ctx, 3).unwrap();
    assert_eq!(d, a);
    assert_eq!(arena.free_large(&ctx, b), Err(Misuse::DoubleFree(b)));
    assert_eq!(arena.stray_pointer(&ctx, d + page), Misuse::InteriorPointer(d + page));
    arena.release_all(&ctx);
  }

  #[test]
  fn large_resize_in_place() {
    let ctx = shared(RetentionPolicy::Retain);
    let arena = Arena::new(0, &ctx.classes);
    let page = ctx.classes.page_size();
    let a = arena.alloc_large(&ctx, 4).unwrap();
    assert!(arena.resize_large(&ctx, a, 10));
    assert_eq!(arena.large_size(&ctx, a), Some(10 * page));
    let b = arena.alloc_large(&ctx, 1).unwrap();
    assert_eq!(b, a + 10 * page);
    // Blocked by `b`.
    assert!(!arena.resize_large(&ctx, a, 11));
    assert!(arena.resize_large(&ctx, a, 3));
    assert_eq!(
      ctx.extents.lookup(a).map(|n| n.kind),
      Some(ExtentKind::Large { chunk: 0, pages: 3 })
    );
    let c = arena.alloc_large(&ctx, 7).unwrap();
    assert_eq!(c, a + 3 * page);
    assert_eq!(arena.stats().large.bytes, 11 * page);
    arena.release_all(&ctx);
  }

  #[test]
  fn fill_writes_lowest_address_last() {
    let ctx = shared(RetentionPolicy::default());
    let arena = Arena::new(0, &ctx.classes);
    let class = ctx.classes.class_for(32).unwrap().index;
    let mut out = [0usize; 8];
    assert_eq!(arena.fill_small(&ctx, class, &mut out), Ok(8));
    for pair in out.windows(2) {
      assert_eq!(pair[0], pair[1] + 32);
    }
    assert!(arena.flush_small(&ctx, class, &out).is_empty());
    let stats = arena.stats();
    assert_eq!(stats.bins[class].curregs, 0);
    assert_eq!(stats.bins[class].nfills, 1);
    assert_eq!(stats.bins[class].nflushes, 1);
    arena.release_all(&ctx);
  }

  #[test]
  fn flushing_released_entries_reports_double_free() {
    let ctx = shared(RetentionPolicy::Retain);
    let arena = Arena::new(0, &ctx.classes);
    let class = ctx.classes.class_for(64).unwrap().index;
    let keep = arena.alloc_small(&ctx, class).unwrap();
    let a = arena.alloc_small(&ctx, class).unwrap();
    assert!(arena.flush_small(&ctx, class, &[a]).is_empty());
    // Run still live: the bitmap rejects the second release.
    assert_eq!(arena.flush_small(&ctx, class, &[a]), [Misuse::DoubleFree(a)]);
    assert!(arena.flush_small(&ctx, class, &[keep]).is_empty());
    // Run retired: the pages no longer map to this bin.
    assert_eq!(arena.flush_small(&ctx, class, &[keep, a]), [Misuse::DoubleFree(keep), Misuse::DoubleFree(a)]);
    assert_eq!(arena.stats().bins[class].curregs, 0);

    let large = arena.alloc_large(&ctx, 2).unwrap();
    assert!(arena.flush_large(&ctx, &[large]).is_empty());
    assert_eq!(arena.flush_large(&ctx, &[large]), [Misuse::DoubleFree(large)]);
    arena.release_all(&ctx);
  }
}
