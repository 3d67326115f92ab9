//! Per-class bins: the runs of one size class and their bitmaps.

use std::collections::BTreeSet;

use super::table::{ChunkId, IdTable, RunId};
use crate::bitmap::Bitmap;
use crate::error::Misuse;
use crate::size_class::SizeClass;
use crate::stats::BinStats;

#[derive(Debug, PartialEq)]
pub(super) struct Run {
  pub(super) chunk: ChunkId,
  pub(super) first_page: usize,
  pub(super) base: usize,
  bitmap: Bitmap,
}

pub(super) struct Bin {
  class: SizeClass,
  runs: IdTable<RunId, Run>,
  /// Runs with at least one free region, by address.
  nonfull: BTreeSet<(usize, RunId)>,
  stats: BinStats,
}

impl Bin {
  pub(super) fn new(class: SizeClass) -> Self {
    Self {
      class,
      runs: IdTable::new(),
      nonfull: BTreeSet::new(),
      stats: BinStats {
        class: class.index,
        size: class.size,
        ..BinStats::default()
      },
    }
  }

  pub(super) fn class(&self) -> &SizeClass {
    &self.class
  }

  /// A region from the lowest-address run with space.
  #[inline]
  pub(super) fn alloc(&mut self) -> Option<usize> {
    let &(base, id) = self.nonfull.first()?;
    let run = self.runs.get_mut(id)?;
    let bit = run.bitmap.acquire()?;
    if run.bitmap.is_full() {
      self.nonfull.remove(&(base, id));
    }
    self.stats.nmalloc += 1;
    self.stats.curregs += 1;
    Some(base + bit * self.class.size)
  }

  pub(super) fn insert_run(&mut self, chunk: ChunkId, first_page: usize, base: usize) -> RunId {
    let id = self.runs.insert(Run {
      chunk,
      first_page,
      base,
      bitmap: Bitmap::new(self.class.regions),
    });
    self.nonfull.insert((base, id));
    self.stats.nruns += 1;
    id
  }

  /// Unlinks a run that never handed out a region.
  pub(super) fn remove_run(&mut self, id: RunId) -> Option<Run> {
    let run = self.runs.remove(id)?;
    self.nonfull.remove(&(run.base, id));
    Some(run)
  }

  /// Frees the region at `addr` of run `id`. Returns the run once it has
  /// become empty; it is already unlinked from the bin.
  pub(super) fn release(&mut self, addr: usize, id: RunId) -> Result<Option<Run>, Misuse> {
    let size = self.class.size;
    let run = self.runs.get_mut(id).ok_or(Misuse::UnknownPointer(addr))?;
    if addr < run.base || addr >= run.base + self.class.run_size {
      return Err(Misuse::UnknownPointer(addr));
    }
    let offset = addr - run.base;
    if offset % size != 0 || offset / size >= self.class.regions {
      return Err(Misuse::InteriorPointer(addr));
    }

    let was_full = run.bitmap.is_full();
    if !run.bitmap.release(offset / size) {
      return Err(Misuse::DoubleFree(addr));
    }
    self.stats.ndalloc += 1;
    self.stats.curregs -= 1;

    let base = run.base;
    if run.bitmap.is_empty() {
      return Ok(self.remove_run(id));
    }
    if was_full {
      self.nonfull.insert((base, id));
    }
    Ok(None)
  }

  pub(super) fn record_fill(&mut self) {
    self.stats.nfills += 1;
  }

  pub(super) fn record_flush(&mut self) {
    self.stats.nflushes += 1;
  }

  pub(super) fn stats(&self) -> BinStats {
    BinStats {
      curruns: self.runs.len(),
      ..self.stats
    }
  }

  /// Set bits across every run's bitmap.
  pub(super) fn population(&self) -> usize {
    self.runs.values().map(|r| r.bitmap.popcount()).sum()
  }
}
