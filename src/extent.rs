//! Address-indexed extent tracker.
//!
//! A three-level radix tree over page numbers of the 48-bit user address
//! space. Every page of a live chunk maps to an [`ExtentNode`] describing
//! what currently occupies it, so `free` can resolve any pointer without
//! reading headers out of the allocation's own memory.
//!
//! Tree nodes come straight from `mmap` (zeroed, so every slot starts empty)
//! and are published with a compare-and-swap; lookups are plain acquire
//! loads. Writes to one page are serialized by whoever owns the page (the bin
//! or arena lock), so the tracker needs no lock of its own.

use core::{
  ptr::null_mut,
  sync::atomic::{AtomicPtr, AtomicU64, Ordering},
};

use crate::error::AllocError;
use crate::os;

/// Bits of user-space virtual address covered by the tree.
const ADDR_BITS: u32 = 48;

const KIND_SHIFT: u32 = 61;
const ARENA_SHIFT: u32 = 48;
const AUX_SHIFT: u32 = 32;
const ARENA_MASK: u64 = (1 << (KIND_SHIFT - ARENA_SHIFT)) - 1;

const KIND_FREE: u64 = 1;
const KIND_SMALL: u64 = 2;
const KIND_LARGE: u64 = 3;
const KIND_HUGE: u64 = 4;

const _: () = assert!(usize::BITS == 64, "extent nodes assume 64-bit addresses");
const _: () = assert!(crate::config::MAX_ARENAS as u64 <= ARENA_MASK + 1);

/// What occupies a tracked page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
  /// Chunk page not carved into any run.
  Free,
  /// Page of a small run.
  Small { class: u16, run: u32 },
  /// Head page of a large run. `pages` is 0 when the count exceeds `u16`.
  Large { chunk: u32, pages: u16 },
  /// Head page of a huge allocation.
  Huge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentNode {
  pub arena: u16,
  pub kind: ExtentKind,
}

impl ExtentNode {
  pub fn new(arena: u16, kind: ExtentKind) -> Self {
    Self { arena, kind }
  }

  fn encode(self) -> u64 {
    let (kind, aux, handle) = match self.kind {
      ExtentKind::Free => (KIND_FREE, 0, 0),
      ExtentKind::Small { class, run } => (KIND_SMALL, u64::from(class), u64::from(run)),
      ExtentKind::Large { chunk, pages } => (KIND_LARGE, u64::from(pages), u64::from(chunk)),
      ExtentKind::Huge => (KIND_HUGE, 0, 0),
    };
    (kind << KIND_SHIFT) | (u64::from(self.arena) << ARENA_SHIFT) | (aux << AUX_SHIFT) | handle
  }

  fn decode(raw: u64) -> Option<Self> {
    let arena = ((raw >> ARENA_SHIFT) & ARENA_MASK) as u16;
    let aux = (raw >> AUX_SHIFT) as u16;
    let handle = raw as u32;
    let kind = match raw >> KIND_SHIFT {
      KIND_FREE => ExtentKind::Free,
      KIND_SMALL => ExtentKind::Small {
        class: aux,
        run: handle,
      },
      KIND_LARGE => ExtentKind::Large {
        chunk: handle,
        pages: aux,
      },
      KIND_HUGE => ExtentKind::Huge,
      _ => return None,
    };
    Some(Self { arena, kind })
  }
}

/// Interior node: pointers to the next level.
type Interior = AtomicPtr<AtomicPtr<AtomicU64>>;

pub struct ExtentTracker {
  root: *mut Interior,
  lg_page: u32,
  root_bits: u32,
  mid_bits: u32,
  leaf_bits: u32,
}

// SAFETY: all shared state is reached through atomics; nodes are never freed
// before the tracker itself is dropped.
unsafe impl Send for ExtentTracker {}
// SAFETY: see above.
unsafe impl Sync for ExtentTracker {}

impl ExtentTracker {
  pub fn new(page_size: usize) -> Result<Self, AllocError> {
    let lg_page = page_size.trailing_zeros();
    let key_bits = ADDR_BITS - lg_page;
    let leaf_bits = key_bits / 3;
    let mid_bits = key_bits / 3;
    let root_bits = key_bits - leaf_bits - mid_bits;

    let root_bytes = node_bytes(root_bits);
    // SAFETY: plain anonymous mapping.
    let root = unsafe { os::map(root_bytes) } as *mut Interior;
    if root.is_null() {
      return Err(AllocError::OutOfMemory(root_bytes));
    }
    Ok(Self {
      root,
      lg_page,
      root_bits,
      mid_bits,
      leaf_bits,
    })
  }

  #[inline]
  fn key(&self, addr: usize) -> Option<usize> {
    if addr >> ADDR_BITS != 0 {
      return None;
    }
    Some(addr >> self.lg_page)
  }

  #[inline]
  fn split(&self, key: usize) -> (usize, usize, usize) {
    let leaf = key & ((1 << self.leaf_bits) - 1);
    let mid = (key >> self.leaf_bits) & ((1 << self.mid_bits) - 1);
    let root = key >> (self.leaf_bits + self.mid_bits);
    debug_assert!(root < 1 << self.root_bits);
    (root, mid, leaf)
  }

  /// The leaf slot for `key`, creating missing nodes when `create` is set.
  fn slot(&self, key: usize, create: bool) -> Result<Option<&AtomicU64>, AllocError> {
    let (r, m, l) = self.split(key);
    // SAFETY: `r` is within the root node, which lives as long as `self`.
    let root_slot = unsafe { &*self.root.add(r) };
    let Some(mid) = self.child(root_slot, self.mid_bits, create)? else {
      return Ok(None);
    };
    // SAFETY: `m` is within the mid node.
    let mid_slot = unsafe { &*mid.add(m) };
    let Some(leaf) = self.child(mid_slot, self.leaf_bits, create)? else {
      return Ok(None);
    };
    // SAFETY: `l` is within the leaf node.
    Ok(Some(unsafe { &*leaf.cast::<AtomicU64>().add(l) }))
  }

  fn child<T>(&self, slot: &AtomicPtr<T>, bits: u32, create: bool) -> Result<Option<*mut T>, AllocError> {
    let cur = slot.load(Ordering::Acquire);
    if !cur.is_null() {
      return Ok(Some(cur));
    }
    if !create {
      return Ok(None);
    }
    let bytes = node_bytes(bits);
    // SAFETY: plain anonymous mapping.
    let fresh = unsafe { os::map(bytes) } as *mut T;
    if fresh.is_null() {
      return Err(AllocError::OutOfMemory(bytes));
    }
    match slot.compare_exchange(null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
      Ok(_) => Ok(Some(fresh)),
      Err(winner) => {
        // SAFETY: `fresh` was never published.
        unsafe { os::unmap(fresh.cast(), bytes) };
        Ok(Some(winner))
      }
    }
  }

  /// Maps every page of `[base, base + len)` to `node`.
  ///
  /// Missing tree nodes are created first, so a failure leaves every page
  /// untouched.
  pub fn insert(&self, base: usize, len: usize, node: ExtentNode) -> Result<(), AllocError> {
    let (first, last) = self.page_range(base, len)?;
    let mut key = first;
    while key <= last {
      self.slot(key, true)?;
      // One slot lookup per leaf is enough to materialize it.
      key = (key | ((1 << self.leaf_bits) - 1)) + 1;
    }

    let raw = node.encode();
    for key in first..=last {
      if let Some(slot) = self.slot(key, false)? {
        slot.store(raw, Ordering::Release);
      }
    }
    Ok(())
  }

  /// Forgets every page of `[base, base + len)`.
  pub fn remove(&self, base: usize, len: usize) {
    let Ok((first, last)) = self.page_range(base, len) else {
      return;
    };
    for key in first..=last {
      if let Ok(Some(slot)) = self.slot(key, false) {
        slot.store(0, Ordering::Release);
      }
    }
  }

  /// Resolves any address to the node of its page.
  #[inline]
  pub fn lookup(&self, addr: usize) -> Option<ExtentNode> {
    let key = self.key(addr)?;
    let slot = self.slot(key, false).ok()??;
    ExtentNode::decode(slot.load(Ordering::Acquire))
  }

  fn page_range(&self, base: usize, len: usize) -> Result<(usize, usize), AllocError> {
    debug_assert!(len > 0);
    let end = base.checked_add(len - 1).ok_or(AllocError::Unaddressable(base))?;
    let first = self.key(base).ok_or(AllocError::Unaddressable(base))?;
    let last = self.key(end).ok_or(AllocError::Unaddressable(end))?;
    Ok((first, last))
  }
}

impl Drop for ExtentTracker {
  fn drop(&mut self) {
    for r in 0..1usize << self.root_bits {
      // SAFETY: in-bounds slot of the root node; `&mut self` excludes readers.
      let mid = unsafe { &*self.root.add(r) }.load(Ordering::Acquire);
      if mid.is_null() {
        continue;
      }
      for m in 0..1usize << self.mid_bits {
        // SAFETY: in-bounds slot of a live mid node.
        let leaf = unsafe { &*mid.add(m) }.load(Ordering::Acquire);
        if !leaf.is_null() {
          // SAFETY: leaf nodes were mapped with exactly this size.
          unsafe { os::unmap(leaf.cast(), node_bytes(self.leaf_bits)) };
        }
      }
      // SAFETY: mid nodes were mapped with exactly this size.
      unsafe { os::unmap(mid.cast(), node_bytes(self.mid_bits)) };
    }
    // SAFETY: the root was mapped in `new` with this size.
    unsafe { os::unmap(self.root.cast(), node_bytes(self.root_bits)) };
  }
}

fn node_bytes(bits: u32) -> usize {
  (1usize << bits) * size_of::<u64>()
}
