//! Page map of one chunk: which page ranges are free.

use std::collections::BTreeMap;

use crate::chunk::Extent;

pub(super) struct ChunkMap {
  pub(super) extent: Extent,
  /// First page -> length of each maximal free span.
  free: BTreeMap<usize, usize>,
  used_pages: usize,
  /// Pages were handed back to the OS while the chunk sat empty.
  pub(super) purged: bool,
}

/// Result of returning pages: the merged span plus the neighbours it swallowed.
#[derive(Debug, PartialEq, Eq)]
pub(super) struct Coalesced {
  pub(super) first: usize,
  pub(super) pages: usize,
  pub(super) absorbed: [Option<(usize, usize)>; 2],
}

impl ChunkMap {
  pub(super) fn new(extent: Extent, pages: usize) -> Self {
    let mut free = BTreeMap::new();
    free.insert(0, pages);
    Self {
      extent,
      free,
      used_pages: 0,
      purged: false,
    }
  }

  pub(super) fn base(&self) -> usize {
    self.extent.base
  }

  pub(super) fn used_pages(&self) -> usize {
    self.used_pages
  }

  pub(super) fn is_empty(&self) -> bool {
    self.used_pages == 0
  }

  /// Length of the free span starting exactly at `first`.
  pub(super) fn free_at(&self, first: usize) -> Option<usize> {
    self.free.get(&first).copied()
  }

  /// Carves `pages` from the front of the free span at `first`. Returns the
  /// leftover span, if any.
  pub(super) fn take(&mut self, first: usize, pages: usize) -> Option<(usize, usize)> {
    let len = self.free.remove(&first)?;
    debug_assert!(len >= pages, "span {first}+{len} too short for {pages}");
    self.used_pages += pages;
    self.purged = false;
    let rest = len - pages;
    if rest == 0 {
      return None;
    }
    self.free.insert(first + pages, rest);
    Some((first + pages, rest))
  }

  /// Marks `[first, first + pages)` free and merges it with free neighbours.
  pub(super) fn give(&mut self, first: usize, pages: usize) -> Coalesced {
    debug_assert!(self.used_pages >= pages);
    self.used_pages -= pages;
    let mut merged = (first, pages);
    let mut absorbed = [None, None];

    if let Some((&prev, &len)) = self.free.range(..first).next_back()
      && prev + len == first
    {
      self.free.remove(&prev);
      absorbed[0] = Some((prev, len));
      merged = (prev, len + merged.1);
    }
    if let Some(len) = self.free.remove(&(first + pages)) {
      absorbed[1] = Some((first + pages, len));
      merged.1 += len;
    }

    self.free.insert(merged.0, merged.1);
    Coalesced {
      first: merged.0,
      pages: merged.1,
      absorbed,
    }
  }
}
