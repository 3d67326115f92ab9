//! Chunk acquisition from the OS.
//!
//! Two backends: anonymous mappings and growth of the process data segment.
//! The data segment cannot be shrunk from the middle, so released
//! data-segment chunks are purged and parked in a process-wide pool that
//! later acquisitions draw from first.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::collections::BTreeMap;

use crate::config::DssPrecedence;
use crate::error::AllocError;
use crate::extent::{ExtentKind, ExtentNode, ExtentTracker};
use crate::os;
use crate::stats::ChunkStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
  Mmap,
  Dss,
}

/// An aligned span of OS memory handed to an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
  pub base: usize,
  pub size: usize,
  pub backend: Backend,
  /// Bytes from `base` registered in the extent tracker.
  registered: usize,
}

impl Extent {
  pub fn as_ptr(&self) -> *mut u8 {
    self.base as *mut u8
  }

  pub fn end(&self) -> usize {
    self.base + self.size
  }

  /// An unregistered extent over arbitrary addresses, for bookkeeping tests.
  #[cfg(test)]
  pub(crate) fn detached(base: usize, size: usize, backend: Backend) -> Self {
    Self {
      base,
      size,
      backend,
      registered: 0,
    }
  }
}

/// Break bookkeeping shared by every heap in the process.
struct Dss {
  exhausted: bool,
  grown: usize,
  /// Released data-segment extents, base -> size, coalesced.
  pool: BTreeMap<usize, usize>,
}

static DSS: spin::Mutex<Dss> = spin::Mutex::new(Dss {
  exhausted: false,
  grown: 0,
  pool: BTreeMap::new(),
});

/// Attempts at growing the break before giving up on a foreign mover.
const DSS_ATTEMPTS: usize = 4;

pub struct ChunkManager {
  chunk_size: usize,
  page_size: usize,
  precedence: DssPrecedence,
  purge: bool,
  os_acquisitions: AtomicU64,
  recycled: AtomicU64,
  releases: AtomicU64,
  mapped: AtomicUsize,
}

impl ChunkManager {
  pub fn new(chunk_size: usize, page_size: usize, precedence: DssPrecedence, purge: bool) -> Self {
    Self {
      chunk_size,
      page_size,
      precedence,
      purge,
      os_acquisitions: AtomicU64::new(0),
      recycled: AtomicU64::new(0),
      releases: AtomicU64::new(0),
      mapped: AtomicUsize::new(0),
    }
  }

  pub fn chunk_size(&self) -> usize {
    self.chunk_size
  }

  /// One chunk for `arena`, registered page by page as [`ExtentKind::Free`].
  pub fn acquire_chunk(&self, extents: &ExtentTracker, arena: u16) -> Result<Extent, AllocError> {
    let size = self.chunk_size;
    let extent = self.acquire(size, size)?;
    self.register(extents, extent, size, ExtentNode::new(arena, ExtentKind::Free))
  }

  /// `size` bytes (a chunk multiple) aligned to `align`, registered at the head
  /// page as [`ExtentKind::Huge`].
  pub fn acquire_huge(
    &self,
    extents: &ExtentTracker,
    arena: u16,
    size: usize,
    align: usize,
  ) -> Result<Extent, AllocError> {
    debug_assert!(size % self.chunk_size == 0 && align >= self.chunk_size);
    let extent = self.acquire(size, align)?;
    self.register(extents, extent, self.page_size, ExtentNode::new(arena, ExtentKind::Huge))
  }

  fn register(
    &self,
    extents: &ExtentTracker,
    mut extent: Extent,
    len: usize,
    node: ExtentNode,
  ) -> Result<Extent, AllocError> {
    if let Err(err) = extents.insert(extent.base, len, node) {
      self.give_back(extent);
      return Err(err);
    }
    extent.registered = len;
    Ok(extent)
  }

  /// Unregisters `extent` and returns it to its backend.
  pub fn release(&self, extents: &ExtentTracker, extent: Extent) {
    if extent.registered != 0 {
      extents.remove(extent.base, extent.registered);
    }
    self.give_back(extent);
    self.releases.fetch_add(1, Ordering::Relaxed);
    log::trace!(
      "released {:?} chunk {:#x}+{:#x}",
      extent.backend,
      extent.base,
      extent.size
    );
  }

  /// Drops the physical pages of `[base, base + len)`, keeping the mapping.
  pub fn purge(&self, base: usize, len: usize) -> bool {
    // SAFETY: callers pass ranges of chunks they own and no longer use.
    self.purge && unsafe { os::purge(base as *mut u8, len) }
  }

  pub fn stats(&self) -> ChunkStats {
    ChunkStats {
      os_acquisitions: self.os_acquisitions.load(Ordering::Relaxed),
      recycled: self.recycled.load(Ordering::Relaxed),
      releases: self.releases.load(Ordering::Relaxed),
      mapped_bytes: self.mapped.load(Ordering::Relaxed),
      dss_bytes: DSS.lock().grown,
    }
  }

  fn acquire(&self, size: usize, align: usize) -> Result<Extent, AllocError> {
    if self.precedence != DssPrecedence::Disabled
      && let Some(base) = dss_recycle(size, align)
    {
      self.recycled.fetch_add(1, Ordering::Relaxed);
      return Ok(Extent {
        base,
        size,
        backend: Backend::Dss,
        registered: 0,
      });
    }

    let order: &[Backend] = match self.precedence {
      DssPrecedence::Disabled => &[Backend::Mmap],
      DssPrecedence::Primary => &[Backend::Dss, Backend::Mmap],
      DssPrecedence::Secondary => &[Backend::Mmap, Backend::Dss],
    };
    for &backend in order {
      let base = match backend {
        // SAFETY: fresh anonymous mapping.
        Backend::Mmap => (unsafe { os::map_aligned(size, align) }) as usize,
        Backend::Dss => dss_grow(size, align).unwrap_or(0),
      };
      if base == 0 {
        log::debug!("{backend:?} backend could not supply {size:#x} bytes");
        continue;
      }
      if backend == Backend::Mmap {
        self.mapped.fetch_add(size, Ordering::Relaxed);
      }
      self.os_acquisitions.fetch_add(1, Ordering::Relaxed);
      log::trace!("acquired {backend:?} extent {base:#x}+{size:#x}");
      return Ok(Extent {
        base,
        size,
        backend,
        registered: 0,
      });
    }

    log::warn!("chunk acquisition of {size} bytes failed on every backend");
    Err(AllocError::OutOfMemory(size))
  }

  fn give_back(&self, extent: Extent) {
    match extent.backend {
      Backend::Mmap => {
        // SAFETY: the extent came from `map_aligned` and is no longer referenced.
        unsafe { os::unmap(extent.as_ptr(), extent.size) };
        self.mapped.fetch_sub(extent.size, Ordering::Relaxed);
      }
      Backend::Dss => {
        // SAFETY: the extent is owned and unused.
        unsafe { os::purge(extent.as_ptr(), extent.size) };
        dss_pool_insert(extent.base, extent.size);
      }
    }
  }
}

// =============================================================================
// Data segment
// =============================================================================

fn dss_grow(size: usize, align: usize) -> Option<usize> {
  let mut dss = DSS.lock();
  if dss.exhausted {
    return None;
  }

  for _ in 0..DSS_ATTEMPTS {
    // SAFETY: querying the break has no preconditions.
    let cur = unsafe { os::dss_current() }?;
    let aligned = cur.checked_add(align - 1)? & !(align - 1);
    let incr = (aligned - cur).checked_add(size)?;
    // SAFETY: the new memory is only handed out through this function.
    let Some(prev) = (unsafe { os::dss_grow(incr) }) else {
      dss.exhausted = true;
      return None;
    };
    dss.grown += incr;
    if prev == cur {
      return Some(aligned);
    }
    // Someone else moved the break between the two calls; the memory we got
    // starts at `prev` and may still contain an aligned chunk.
    let start = prev.checked_add(align - 1)? & !(align - 1);
    if start + size <= prev + incr {
      return Some(start);
    }
    log::debug!("data segment moved under us, leaking {incr:#x} bytes at {prev:#x}");
  }
  None
}

fn dss_recycle(size: usize, align: usize) -> Option<usize> {
  DSS.lock().take(size, align)
}

fn dss_pool_insert(base: usize, len: usize) {
  DSS.lock().insert(base, len);
}

impl Dss {
  /// Carves an aligned `size` bytes out of the first pooled extent that fits.
  fn take(&mut self, size: usize, align: usize) -> Option<usize> {
    let (base, len, start) = self.pool.iter().find_map(|(&base, &len)| {
      let start = base.checked_add(align - 1)? & !(align - 1);
      (start - base + size <= len).then_some((base, len, start))
    })?;
    self.pool.remove(&base);
    if start > base {
      self.pool.insert(base, start - base);
    }
    let tail = base + len - (start + size);
    if tail > 0 {
      self.pool.insert(start + size, tail);
    }
    Some(start)
  }

  fn insert(&mut self, mut base: usize, mut len: usize) {
    if let Some((&prev, &prev_len)) = self.pool.range(..base).next_back()
      && prev + prev_len == base
    {
      self.pool.remove(&prev);
      base = prev;
      len += prev_len;
    }
    if let Some(next_len) = self.pool.remove(&(base + len)) {
      len += next_len;
    }
    self.pool.insert(base, len);
  }
}
