//! Bootstrap region for the engine's own bookkeeping.
//!
//! With the crate installed as the global allocator, the collections inside
//! arenas and bins allocate through it as well. Those nested requests are
//! served from this region: one lazily reserved mapping carved into
//! power-of-two blocks with intrusive free lists. Each 64 KiB granule
//! remembers which block size it was carved for, so a block can be freed
//! without its size.
//!
//! Everything here runs under a spin lock and must never allocate or log.

use core::ptr::null_mut;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::os;

const REGION_SIZE: usize = 1 << 30; // 1GB, reserved not committed

const GRANULE_BITS: u32 = 16;
const GRANULE: usize = 1 << GRANULE_BITS;
const NGRANULES: usize = REGION_SIZE / GRANULE;

const MIN_BLOCK_BITS: u32 = 4;
const NBINS: usize = (REGION_SIZE.trailing_zeros() - MIN_BLOCK_BITS + 1) as usize;

const _: () = assert!(NBINS < u8::MAX as usize);
const _: () = assert!(REGION_SIZE % GRANULE == 0);

static START: AtomicUsize = AtomicUsize::new(0);
static REGION: Mutex<Region> = Mutex::new(Region::new());

#[derive(Clone, Copy)]
struct Bin {
  /// Head of the free list, 0 when empty.
  free: usize,
  bump: usize,
  bump_end: usize,
}

struct Region {
  cursor: usize,
  end: usize,
  bins: [Bin; NBINS],
  /// Bin index + 1 for every carved granule.
  owner: [u8; NGRANULES],
}

impl Region {
  const fn new() -> Self {
    Self {
      cursor: 0,
      end: 0,
      bins: [Bin {
        free: 0,
        bump: 0,
        bump_end: 0,
      }; NBINS],
      owner: [0; NGRANULES],
    }
  }

  fn init(&mut self) -> bool {
    // Over-allocate for alignment padding.
    // SAFETY: plain anonymous mapping.
    let raw = unsafe { os::map(REGION_SIZE + GRANULE) };
    if raw.is_null() {
      return false;
    }
    let start = crate::align_up(raw as usize, GRANULE);
    self.cursor = start;
    self.end = start + REGION_SIZE;
    START.store(start, Ordering::Release);
    true
  }

  /// Takes whole granules off the bump cursor for `bin`.
  fn carve(&mut self, bytes: usize, bin: usize) -> Option<usize> {
    if self.end - self.cursor < bytes {
      return None;
    }
    let addr = self.cursor;
    self.cursor += bytes;
    let first = (addr - START.load(Ordering::Relaxed)) >> GRANULE_BITS;
    self.owner[first..first + (bytes >> GRANULE_BITS)].fill(bin as u8 + 1);
    Some(addr)
  }

  fn alloc(&mut self, bin: usize) -> Option<usize> {
    let block = block_size(bin);
    let head = self.bins[bin].free;
    if head != 0 {
      // SAFETY: free blocks hold the next link in their first word.
      self.bins[bin].free = unsafe { (head as *const usize).read() };
      return Some(head);
    }
    if block >= GRANULE {
      return self.carve(block, bin);
    }
    if self.bins[bin].bump == self.bins[bin].bump_end {
      let granule = self.carve(GRANULE, bin)?;
      self.bins[bin].bump = granule;
      self.bins[bin].bump_end = granule + GRANULE;
    }
    let b = &mut self.bins[bin];
    let addr = b.bump;
    b.bump += block;
    Some(addr)
  }

  fn bin_of(&self, addr: usize) -> Option<usize> {
    let granule = (addr - START.load(Ordering::Relaxed)) >> GRANULE_BITS;
    self.owner[granule].checked_sub(1).map(usize::from)
  }
}

const fn block_size(bin: usize) -> usize {
  1 << (bin + MIN_BLOCK_BITS as usize)
}

/// Smallest bin whose blocks hold `size` bytes at `align`. Blocks are
/// naturally aligned up to a granule.
fn bin_for(size: usize, align: usize) -> Option<usize> {
  if align > GRANULE {
    return None;
  }
  let block = size.max(align).max(1 << MIN_BLOCK_BITS).checked_next_power_of_two()?;
  let bin = (block.trailing_zeros() - MIN_BLOCK_BITS) as usize;
  (bin < NBINS).then_some(bin)
}

/// True when `ptr` came from this region.
#[inline]
pub(crate) fn contains(ptr: *const u8) -> bool {
  let start = START.load(Ordering::Acquire);
  start != 0 && (ptr as usize).wrapping_sub(start) < REGION_SIZE
}

/// Null when the request is too large or the region cannot be mapped.
pub(crate) fn alloc(size: usize, align: usize) -> *mut u8 {
  let Some(bin) = bin_for(size, align) else {
    return null_mut();
  };
  let mut region = REGION.lock();
  if region.end == 0 && !region.init() {
    return null_mut();
  }
  region.alloc(bin).map_or(null_mut(), |addr| addr as *mut u8)
}

/// # Safety
///
/// `ptr` must be a live block of this region.
pub(crate) unsafe fn dealloc(ptr: *mut u8) {
  let addr = ptr as usize;
  let mut region = REGION.lock();
  let Some(bin) = region.bin_of(addr) else {
    return;
  };

  #[cfg(feature = "release-mem")]
  {
    let page = os::page_size();
    if block_size(bin) >= 2 * page {
      // Keep the first page: it holds the free-list link.
      // SAFETY: the block is owned by the region and no longer in use.
      unsafe { os::purge(ptr.add(page), block_size(bin) - page) };
    }
  }

  // SAFETY: the block is at least 16 bytes and no longer in use.
  unsafe { (addr as *mut usize).write(region.bins[bin].free) };
  region.bins[bin].free = addr;
}

/// # Safety
///
/// `ptr` must be a live block of this region.
pub(crate) unsafe fn usable_size(ptr: *const u8) -> usize {
  REGION.lock().bin_of(ptr as usize).map_or(0, block_size)
}

/// # Safety
///
/// `ptr` must be a live block of this region. It is freed on success.
pub(crate) unsafe fn realloc(ptr: *mut u8, size: usize, align: usize) -> *mut u8 {
  let old = unsafe { usable_size(ptr) };
  if size <= old && bin_for(size, align).is_some_and(|bin| block_size(bin) == old) {
    return ptr;
  }
  let fresh = alloc(size, align);
  if !fresh.is_null() {
    // SAFETY: distinct live blocks; the copy fits in both.
    unsafe {
      core::ptr::copy_nonoverlapping(ptr, fresh, old.min(size));
      dealloc(ptr);
    }
  }
  fresh
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bins_round_up_to_powers_of_two() {
    assert_eq!(bin_for(1, 1), Some(0));
    assert_eq!(bin_for(17, 8), Some(1));
    assert_eq!(bin_for(8, 64), Some(2));
    assert_eq!(bin_for(8, GRANULE * 2), None);
    assert_eq!(bin_for(usize::MAX, 1), None);
  }

  #[test]
  fn blocks_are_aligned_and_reused() {
    let a = alloc(40, 8);
    let b = alloc(40, 8);
    assert!(contains(a) && contains(b));
    assert_eq!(a as usize % 64, 0);
    assert_ne!(a, b);
    unsafe {
      assert_eq!(usable_size(a), 64);
      a.write_bytes(0xEE, 64);
      dealloc(a);
    }
    // Another test may race for the same bin; the block size still holds.
    let c = alloc(64, 64);
    assert_eq!(c as usize % 64, 0);
    unsafe {
      dealloc(b);
      dealloc(c);
    }
  }

  #[test]
  fn concurrent_blocks_never_overlap() {
    let blocks: Vec<Vec<usize>> = std::thread::scope(|s| {
      let workers: Vec<_> = (0..4)
        .map(|t| {
          s.spawn(move || {
            let mut mine = Vec::new();
            for i in 0..500usize {
              let p = alloc(32, 8);
              assert!(!p.is_null());
              unsafe { p.write_bytes(t as u8, 32) };
              if i % 2 == 0 {
                unsafe { dealloc(p) };
              } else {
                mine.push(p as usize);
              }
            }
            for &p in &mine {
              let bytes = unsafe { core::slice::from_raw_parts(p as *const u8, 32) };
              assert!(bytes.iter().all(|&b| b == t as u8));
            }
            mine
          })
        })
        .collect();
      workers.into_iter().map(|w| w.join().unwrap()).collect()
    });
    let mut all: Vec<usize> = blocks.into_iter().flatten().collect();
    all.sort_unstable();
    assert!(all.windows(2).all(|w| w[0] + 32 <= w[1]));
    for p in all {
      unsafe { dealloc(p as *mut u8) };
    }
  }

  #[test]
  fn blocks_larger_than_a_granule() {
    let p = alloc(3 * GRANULE, 16);
    assert!(!p.is_null());
    assert_eq!(p as usize % GRANULE, 0);
    unsafe {
      assert_eq!(usable_size(p), 4 * GRANULE);
      p.add(4 * GRANULE - 1).write(1);
      dealloc(p);
    }
  }

  #[test]
  fn realloc_copies_and_keeps_same_block() {
    let p = alloc(100, 8);
    unsafe {
      for i in 0..100 {
        p.add(i).write(i as u8);
      }
      let same = realloc(p, 120, 8);
      assert_eq!(same, p);
      let q = realloc(same, 1000, 8);
      for i in 0..100 {
        assert_eq!(q.add(i).read(), i as u8);
      }
      dealloc(q);
    }
  }

  #[test]
  fn foreign_pointers_are_not_contained() {
    let local = 0u8;
    assert!(!contains(&local));
    assert!(!contains(null_mut()));
  }
}
