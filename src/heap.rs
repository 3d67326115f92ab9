//! The allocator context and its thread-scoped handles.
//!
//! A [`Heap`] owns everything: size classes, the extent tracker, the chunk
//! manager and the arenas. Threads allocate through a [`ThreadHandle`], which
//! binds to one arena and carries that thread's cache. Dropping a handle
//! flushes its cache; dropping the heap hands every chunk back to the OS, and
//! the borrow of the heap held by each handle guarantees that happens last.
//!
//! ```
//! use arenalloc::{Config, Heap};
//!
//! let heap = Heap::new(Config::default()).unwrap();
//! let mut thread = heap.thread();
//! let p = thread.alloc(10).unwrap();
//! assert_eq!(heap.usable_size(p.as_ptr()), Some(16));
//! unsafe { thread.free(p.as_ptr()) };
//! ```

use core::ptr::{self, NonNull};

use crate::arena::Arena;
use crate::chunk::ChunkManager;
use crate::config::{Config, MisusePolicy};
use crate::error::{AllocError, Misuse};
use crate::extent::{ExtentKind, ExtentTracker};
use crate::flags::{AllocFlags, ArenaId};
use crate::os;
use crate::registry::Registry;
use crate::size_class::{SizeClassTable, SizeKind};
use crate::stats::{EventCounters, HeapStats};
use crate::tcache::ThreadCache;

/// State every arena and handle reads.
pub(crate) struct Shared {
  pub(crate) config: Config,
  pub(crate) classes: SizeClassTable,
  pub(crate) chunks: ChunkManager,
  pub(crate) extents: ExtentTracker,
  pub(crate) events: EventCounters,
}

impl Shared {
  pub(crate) fn new(config: Config) -> Result<Self, AllocError> {
    let page = os::page_size();
    config.validate(page)?;
    let classes = SizeClassTable::new(page, config.chunk_size(), config.max_small)?;
    let extents = ExtentTracker::new(page)?;
    let chunks = ChunkManager::new(config.chunk_size(), page, config.dss, config.purge);
    Ok(Self {
      config,
      classes,
      chunks,
      extents,
      events: EventCounters::default(),
    })
  }
}

pub struct Heap {
  shared: Shared,
  registry: Registry,
}

/// A live allocation resolved through the extent tracker.
#[derive(Clone, Copy)]
struct Located<'a> {
  arena: &'a Arena,
  kind: LocatedKind,
}

#[derive(Clone, Copy)]
enum LocatedKind {
  Small { class: usize, run: u32 },
  /// `None` when the page count does not fit the extent node.
  Large { pages: Option<usize> },
  Huge,
}

impl Heap {
  pub fn new(config: Config) -> Result<Self, AllocError> {
    let shared = Shared::new(config)?;
    let registry = Registry::new(
      shared.config.arena_count(),
      &shared.classes,
      shared.config.assignment,
    );
    log::debug!(
      "heap ready: {} arenas, {} small classes up to {} bytes, {}-byte chunks",
      registry.len(),
      shared.classes.len(),
      shared.classes.max_small(),
      shared.classes.chunk_size()
    );
    Ok(Self { shared, registry })
  }

  pub fn config(&self) -> &Config {
    &self.shared.config
  }

  pub fn size_classes(&self) -> &SizeClassTable {
    &self.shared.classes
  }

  pub fn narenas(&self) -> usize {
    self.registry.len()
  }

  pub fn arena(&self, id: ArenaId) -> Option<&Arena> {
    self.registry.get(id.index())
  }

  /// A handle bound to an arena chosen by the assignment policy.
  pub fn thread(&self) -> ThreadHandle<'_> {
    ThreadHandle::bound(self, self.registry.assign())
  }

  /// A handle bound to a specific arena.
  pub fn thread_in(&self, id: ArenaId) -> Result<ThreadHandle<'_>, AllocError> {
    let arena = self
      .registry
      .get(id.index())
      .ok_or(AllocError::UnknownArena(id.index()))?;
    arena.bind();
    Ok(ThreadHandle::bound(self, arena))
  }

  /// Bytes usable at `ptr`, or `None` if this heap did not allocate it.
  pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
    let addr = ptr as usize;
    let loc = self.locate(addr).ok()?;
    self.located_size(loc, addr)
  }

  /// Usable size an allocation of `size` bytes with `flags` would get, or 0
  /// if the request cannot be represented.
  pub fn good_size(&self, size: usize, flags: AllocFlags) -> usize {
    let align = flags.alignment();
    if !align.is_power_of_two() {
      return 0;
    }
    self
      .shared
      .classes
      .classify(size, align)
      .map_or(0, |kind| self.shared.classes.usable_size(kind))
  }

  pub fn stats(&self) -> HeapStats {
    let mut arenas = Vec::with_capacity(self.registry.len());
    for arena in self.registry.iter() {
      arenas.push(arena.stats());
    }
    HeapStats {
      arenas,
      chunks: self.shared.chunks.stats(),
      events: self.shared.events.snapshot(),
    }
  }

  fn locate(&self, addr: usize) -> Result<Located<'_>, Misuse> {
    let node = self
      .shared
      .extents
      .lookup(addr)
      .ok_or(Misuse::UnknownPointer(addr))?;
    let arena = self
      .registry
      .get(usize::from(node.arena))
      .ok_or(Misuse::UnknownPointer(addr))?;
    let classes = &self.shared.classes;

    let kind = match node.kind {
      ExtentKind::Free => return Err(arena.stray_pointer(&self.shared, addr)),
      ExtentKind::Small { class, run } => {
        let class = usize::from(class);
        if addr % classes.get(class).align != 0 {
          return Err(Misuse::InteriorPointer(addr));
        }
        LocatedKind::Small { class, run }
      }
      ExtentKind::Large { pages, .. } => {
        if addr % classes.page_size() != 0 {
          return Err(Misuse::InteriorPointer(addr));
        }
        LocatedKind::Large {
          pages: (pages != 0).then_some(usize::from(pages)),
        }
      }
      ExtentKind::Huge => {
        if addr % classes.chunk_size() != 0 {
          return Err(Misuse::InteriorPointer(addr));
        }
        LocatedKind::Huge
      }
    };
    Ok(Located { arena, kind })
  }

  fn located_size(&self, loc: Located<'_>, addr: usize) -> Option<usize> {
    match loc.kind {
      LocatedKind::Small { class, .. } => Some(self.shared.classes.get(class).size),
      LocatedKind::Large { pages: Some(pages) } => Some(pages * self.shared.classes.page_size()),
      LocatedKind::Large { pages: None } => loc.arena.large_size(&self.shared, addr),
      LocatedKind::Huge => loc.arena.huge_size(addr),
    }
  }

  fn report(&self, misuse: Misuse) {
    match self.shared.config.on_misuse {
      MisusePolicy::Abort => {
        log::error!("{misuse}; aborting");
        std::process::abort();
      }
      MisusePolicy::Ignore => log::warn!("{misuse}; call ignored"),
    }
  }
}

impl Drop for Heap {
  fn drop(&mut self) {
    for arena in self.registry.iter() {
      arena.release_all(&self.shared);
    }
    log::debug!("heap torn down");
  }
}

// =============================================================================
// Thread handle
// =============================================================================

/// A thread's view of a [`Heap`]: its arena and its cache.
///
/// Entries cached by a handle stay allocated from the arena's point of view
/// until the handle flushes them, which it does when dropped.
pub struct ThreadHandle<'h> {
  heap: &'h Heap,
  arena: &'h Arena,
  cache: Option<ThreadCache>,
  bound: bool,
}

impl<'h> ThreadHandle<'h> {
  fn bound(heap: &'h Heap, arena: &'h Arena) -> Self {
    let shared = &heap.shared;
    Self {
      heap,
      arena,
      cache: shared
        .config
        .tcache
        .then(|| ThreadCache::new(&shared.classes, &shared.config)),
      bound: true,
    }
  }

  /// An uncached handle on the first arena that does not count as a bound
  /// thread. Cheap enough to create per call.
  pub fn detached(heap: &'h Heap) -> Self {
    Self {
      heap,
      arena: heap.registry.primary(),
      cache: None,
      bound: false,
    }
  }

  pub fn heap(&self) -> &'h Heap {
    self.heap
  }

  pub fn arena_id(&self) -> usize {
    self.arena.id()
  }

  pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
    self.alloc_with(size, AllocFlags::new())
  }

  pub fn try_alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    self.try_alloc_with(size, AllocFlags::new())
  }

  /// `count * size` zeroed bytes. `None` on overflow.
  pub fn alloc_zeroed(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
    let total = count.checked_mul(size)?;
    self.alloc_with(total, AllocFlags::new().zeroed())
  }

  pub fn aligned_alloc(&mut self, align: usize, size: usize) -> Option<NonNull<u8>> {
    self.alloc_with(size, AllocFlags::new().align(align))
  }

  pub fn alloc_with(&mut self, size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
    self.try_alloc_with(size, flags).ok()
  }

  pub fn try_alloc_with(&mut self, size: usize, flags: AllocFlags) -> Result<NonNull<u8>, AllocError> {
    let ctx = &self.heap.shared;
    let align = flags.alignment();
    if !align.is_power_of_two() {
      return Err(AllocError::InvalidAlignment(align));
    }
    let kind = ctx.classes.classify(size, align).ok_or(AllocError::SizeOverflow)?;
    let (arena, cached) = match flags.arena_id() {
      Some(id) => (
        self
          .heap
          .registry
          .get(id.index())
          .ok_or(AllocError::UnknownArena(id.index()))?,
        false,
      ),
      None => (self.arena, !flags.bypasses_cache()),
    };

    let addr = self.alloc_kind(arena, kind, cached);
    self.report_flushed();
    let addr = addr?;
    if flags.is_zeroed() {
      // SAFETY: the allocation spans at least its usable size.
      unsafe { ptr::write_bytes(addr as *mut u8, 0, ctx.classes.usable_size(kind)) };
    }
    ctx.events.record_alloc();
    NonNull::new(addr as *mut u8).ok_or(AllocError::OutOfMemory(size))
  }

  fn alloc_kind(&mut self, arena: &'h Arena, kind: SizeKind, cached: bool) -> Result<usize, AllocError> {
    let ctx = &self.heap.shared;
    let cache = self.cache.as_mut().filter(|_| cached);
    match kind {
      SizeKind::Small(class) => match cache {
        Some(cache) => cache.alloc_small(ctx, arena, class),
        None => arena.alloc_small(ctx, class),
      },
      SizeKind::Large { pages } => {
        if let Some(cache) = cache
          && let Some(bin) = cache.large_bin(pages)
          && let Some(addr) = cache.alloc_large(ctx, arena, bin)
        {
          return Ok(addr);
        }
        arena.alloc_large(ctx, pages)
      }
      SizeKind::Huge { size, align } => arena.alloc_huge(ctx, size, align),
    }
  }

  /// Frees `ptr`, applying the heap's misuse policy to bad pointers.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation of this heap that is not used
  /// afterwards.
  pub unsafe fn free(&mut self, ptr: *mut u8) {
    if let Err(misuse) = unsafe { self.try_free(ptr) } {
      self.heap.report(misuse);
    }
  }

  /// Frees `ptr`, reporting bad pointers to the caller instead.
  ///
  /// Detection is best effort: frees that land in the thread cache are only
  /// checked for duplicates in debug builds.
  ///
  /// # Safety
  ///
  /// As for [`free`](Self::free).
  pub unsafe fn try_free(&mut self, ptr: *mut u8) -> Result<(), Misuse> {
    if ptr.is_null() {
      return Ok(());
    }
    let ctx = &self.heap.shared;
    let addr = ptr as usize;
    let loc = self.heap.locate(addr).inspect_err(|_| ctx.events.record_misuse())?;
    let own = ptr::eq(loc.arena, self.arena);

    let result = match (loc.kind, self.cache.as_mut().filter(|_| own)) {
      (LocatedKind::Small { class, .. }, Some(cache)) => cache.free(ctx, self.arena, class, addr),
      (LocatedKind::Small { class, run }, None) => loc.arena.free_small(ctx, addr, class, run),
      (LocatedKind::Large { pages }, cache) => {
        match cache
          .zip(pages)
          .and_then(|(cache, pages)| Some((cache.large_bin(pages)?, cache)))
        {
          Some((bin, cache)) => cache.free(ctx, self.arena, bin, addr),
          None => loc.arena.free_large(ctx, addr),
        }
      }
      (LocatedKind::Huge, _) => loc.arena.free_huge(ctx, addr),
    };
    match result {
      Ok(()) => ctx.events.record_free(),
      Err(_) => ctx.events.record_misuse(),
    }
    self.report_flushed();
    result
  }

  /// Applies the misuse policy to entries the cache found stale on flush.
  fn report_flushed(&mut self) {
    let Some(cache) = self.cache.as_mut() else {
      return;
    };
    for misuse in cache.take_misuses() {
      self.heap.shared.events.record_misuse();
      self.heap.report(misuse);
    }
  }

  /// # Safety
  ///
  /// `ptr` must be null or a live allocation of this heap. On success it must
  /// not be used again; on failure it stays valid.
  pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
    unsafe { self.realloc_with(ptr, size, AllocFlags::new()) }
  }

  /// Resizes in place when the new size maps to the same class, page count or
  /// chunk span (or a large run can grow or shrink where it is); otherwise
  /// moves. A size of 0 is treated as 1.
  ///
  /// # Safety
  ///
  /// As for [`realloc`](Self::realloc).
  pub unsafe fn realloc_with(&mut self, ptr: *mut u8, size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
    if ptr.is_null() {
      return self.alloc_with(size, flags);
    }
    let ctx = &self.heap.shared;
    let size = size.max(1);
    let align = flags.alignment();
    if !align.is_power_of_two() {
      return None;
    }
    let addr = ptr as usize;
    let loc = match self.heap.locate(addr) {
      Ok(loc) => loc,
      Err(misuse) => {
        ctx.events.record_misuse();
        self.heap.report(misuse);
        return None;
      }
    };
    let old_usable = self.heap.located_size(loc, addr)?;
    let new_kind = ctx.classes.classify(size, align)?;

    let same_arena = flags.arena_id().is_none_or(|id| id.index() == loc.arena.id());
    if addr % align == 0 && same_arena {
      let in_place = match (loc.kind, new_kind) {
        (LocatedKind::Small { class, .. }, SizeKind::Small(new)) => class == new,
        (LocatedKind::Large { .. }, SizeKind::Large { pages }) => loc.arena.resize_large(ctx, addr, pages),
        (LocatedKind::Huge, SizeKind::Huge { size, .. }) => size == old_usable,
        _ => false,
      };
      if in_place {
        let new_usable = ctx.classes.usable_size(new_kind);
        if flags.is_zeroed() && new_usable > old_usable {
          // SAFETY: the grown tail belongs to this allocation.
          unsafe { ptr::write_bytes(ptr.add(old_usable), 0, new_usable - old_usable) };
        }
        ctx.events.record_realloc();
        return NonNull::new(ptr);
      }
    }

    let fresh = self.alloc_with(size, flags)?;
    // SAFETY: both allocations are live and distinct; the copy fits in each.
    unsafe {
      ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), old_usable.min(size));
      self.free(ptr);
    }
    ctx.events.record_realloc();
    Some(fresh)
  }

  /// Grows or shrinks a large allocation without moving it, aiming for
  /// `size + extra` bytes and settling for `size`. Returns the usable size
  /// afterwards, which is unchanged when nothing could be done (and 0 for
  /// pointers this heap does not know).
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation of this heap.
  pub unsafe fn resize_in_place(&mut self, ptr: *mut u8, size: usize, extra: usize, flags: AllocFlags) -> usize {
    if ptr.is_null() {
      return 0;
    }
    let ctx = &self.heap.shared;
    let addr = ptr as usize;
    let loc = match self.heap.locate(addr) {
      Ok(loc) => loc,
      Err(misuse) => {
        ctx.events.record_misuse();
        self.heap.report(misuse);
        return 0;
      }
    };
    let Some(usable) = self.heap.located_size(loc, addr) else {
      return 0;
    };
    let classes = &ctx.classes;
    if !matches!(loc.kind, LocatedKind::Large { .. }) || size <= classes.max_small() || size > classes.large_max() {
      return usable;
    }

    let page = classes.page_size();
    let want = size.saturating_add(extra).min(classes.large_max()).div_ceil(page);
    let least = size.div_ceil(page);
    let pages = if loc.arena.resize_large(ctx, addr, want) {
      want
    } else if least < want && loc.arena.resize_large(ctx, addr, least) {
      least
    } else {
      return usable;
    };

    let resized = pages * page;
    if flags.is_zeroed() && resized > usable {
      // SAFETY: the grown tail belongs to this allocation.
      unsafe { ptr::write_bytes(ptr.add(usable), 0, resized - usable) };
    }
    resized
  }

  /// # Safety
  ///
  /// `ptr` must be null or point into memory that is mapped.
  pub unsafe fn usable_size(&self, ptr: *const u8) -> Option<usize> {
    self.heap.usable_size(ptr)
  }

  /// Returns every cached entry to the arena.
  pub fn flush(&mut self) {
    if let Some(cache) = self.cache.as_mut() {
      cache.flush_all(&self.heap.shared, self.arena);
    }
    self.report_flushed();
  }

  /// Entries cached for the class that serves `size`.
  pub fn cached(&self, size: usize) -> usize {
    self.cache_bin(size).map_or(0, |(cache, bin)| cache.len(bin))
  }

  /// Capacity of the cache stack that serves `size`.
  pub fn cache_capacity(&self, size: usize) -> usize {
    self.cache_bin(size).map_or(0, |(cache, bin)| cache.capacity(bin))
  }

  fn cache_bin(&self, size: usize) -> Option<(&ThreadCache, usize)> {
    let cache = self.cache.as_ref()?;
    let bin = match self.heap.shared.classes.classify(size, 1)? {
      SizeKind::Small(class) => class,
      SizeKind::Large { pages } => cache.large_bin(pages)?,
      SizeKind::Huge { .. } => return None,
    };
    Some((cache, bin))
  }
}

impl Drop for ThreadHandle<'_> {
  fn drop(&mut self) {
    self.flush();
    if self.bound {
      self.heap.registry.release(self.arena);
    }
  }
}
