//! Per-call allocation flags.

use core::ffi::c_int;

use crate::config::MAX_ARENAS;

const LG_ALIGN_MASK: c_int = 0x3f;
const ZERO: c_int = 0x40;
const NO_CACHE: c_int = 0x80;
const ARENA_SHIFT: u32 = 8;

/// Identifies an arena of a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaId(u16);

impl ArenaId {
  pub fn new(index: usize) -> Option<Self> {
    (index < MAX_ARENAS).then_some(Self(index as u16))
  }

  pub fn index(self) -> usize {
    usize::from(self.0)
  }
}

/// Options for [`ThreadHandle::alloc_with`](crate::ThreadHandle::alloc_with)
/// and friends.
///
/// ```
/// use arenalloc::AllocFlags;
///
/// let flags = AllocFlags::new().align(64).zeroed();
/// assert_eq!(flags.alignment(), 64);
/// assert_eq!(AllocFlags::from_bits(6 | 0x40), Some(flags));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocFlags {
  arena: Option<ArenaId>,
  align: usize,
  zero: bool,
  no_cache: bool,
}

impl AllocFlags {
  pub const fn new() -> Self {
    Self {
      arena: None,
      align: 0,
      zero: false,
      no_cache: false,
    }
  }

  /// Serve from this arena, bypassing the thread cache.
  pub fn arena(mut self, id: ArenaId) -> Self {
    self.arena = Some(id);
    self
  }

  /// Minimum alignment; must be a power of two.
  pub fn align(mut self, align: usize) -> Self {
    self.align = align;
    self
  }

  pub fn zeroed(mut self) -> Self {
    self.zero = true;
    self
  }

  pub fn no_cache(mut self) -> Self {
    self.no_cache = true;
    self
  }

  pub fn arena_id(&self) -> Option<ArenaId> {
    self.arena
  }

  /// Requested alignment, at least 1.
  pub fn alignment(&self) -> usize {
    self.align.max(1)
  }

  pub fn is_zeroed(&self) -> bool {
    self.zero
  }

  /// True when the thread cache must not be used.
  pub fn bypasses_cache(&self) -> bool {
    self.no_cache || self.arena.is_some()
  }

  /// Decodes the `mallocx` flag word: `lg_align` in bits 0..6, zero fill
  /// `0x40`, cache bypass `0x80`, explicit arena as `(arena + 1) << 8`.
  pub fn from_bits(bits: c_int) -> Option<Self> {
    let lg_align = (bits & LG_ALIGN_MASK) as u32;
    if lg_align >= usize::BITS {
      return None;
    }
    let arena = match bits >> ARENA_SHIFT {
      0 => None,
      n => Some(ArenaId::new(n as usize - 1)?),
    };
    Some(Self {
      arena,
      align: if lg_align == 0 { 0 } else { 1 << lg_align },
      zero: bits & ZERO != 0,
      no_cache: bits & NO_CACHE != 0,
    })
  }
}
