//! A concurrent arena allocator: size-classed bitmap runs inside aligned
//! chunks, per-thread caches in front of a set of arenas, and a direct path
//! for huge allocations.
//!
//! Use a [`Heap`] as an explicit allocator context, or install
//! [`Allocator`] as the process allocator:
//!
//! ```no_run
//! #[global_allocator]
//! static GLOBAL: arenalloc::Allocator = arenalloc::Allocator;
//!
//! fn main() {
//!   let v = vec![1u8; 100];
//!   assert_eq!(v.len(), 100);
//! }
//! ```
//!
//! The global heap reads its configuration from `ARENALLOC_CONF` on first
//! use (see [`Config::parse`]). With the `c_api` feature the crate also
//! exports the malloc family and the `*allocx` extensions.

#![allow(clippy::missing_safety_doc)]

mod arena;
mod base;
mod bitmap;
mod chunk;
mod config;
mod error;
mod extent;
mod flags;
mod heap;
mod os;
mod registry;
mod size_class;
mod stats;
mod tcache;

pub use arena::Arena;
pub use bitmap::Bitmap;
pub use chunk::{Backend, ChunkManager, Extent};
pub use config::{ArenaAssignment, Config, DssPrecedence, ENV_VAR, MAX_ARENAS, MisusePolicy, RetentionPolicy};
pub use error::{AllocError, ConfigError, Misuse};
pub use extent::{ExtentKind, ExtentNode, ExtentTracker};
pub use flags::{AllocFlags, ArenaId};
pub use heap::{Heap, ThreadHandle};
pub use os::page_size;
pub use size_class::{SizeClass, SizeClassTable, SizeKind};
pub use stats::{ArenaStats, BinStats, ChunkStats, EventStats, ExtentClassStats, HeapStats};

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::Cell,
  ptr::{self, NonNull, null_mut},
};
use std::{cell::UnsafeCell, sync::OnceLock};

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

// =============================================================================
// Global heap
// =============================================================================

static HEAP: OnceLock<Option<Heap>> = OnceLock::new();

/// Must run with the re-entrancy guard set: building the heap allocates.
fn global() -> Option<&'static Heap> {
  HEAP
    .get_or_init(|| {
      let config = Config::from_env().unwrap_or_else(|err| {
        log::warn!("ignoring {ENV_VAR}: {err}");
        Config::default()
      });
      match Heap::new(config) {
        Ok(heap) => Some(heap),
        Err(err) => {
          log::warn!("global heap with configured options failed: {err}; using defaults");
          Heap::new(Config::default()).ok()
        }
      }
    })
    .as_ref()
}

/// Statistics of the global heap, if it has been initialised.
pub fn stats() -> Option<HeapStats> {
  HEAP.get()?.as_ref().map(Heap::stats)
}

// =============================================================================
// TLS
// =============================================================================

struct TlsHandle {
  handle: Option<ThreadHandle<'static>>,
}

impl Drop for TlsHandle {
  fn drop(&mut self) {
    // Flushing may allocate (lock parking, logging); keep that off the heap.
    IN_ALLOC.with(|flag| flag.set(true));
    drop(self.handle.take());
    IN_ALLOC.with(|flag| flag.set(false));
  }
}

thread_local! {
  static HANDLE: UnsafeCell<TlsHandle> = const { UnsafeCell::new(TlsHandle { handle: None }) };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` on this thread's handle. `None` when called re-entrantly (from
/// inside the allocator) or when no heap could be built. After the thread's
/// handle is gone, an uncached handle stands in.
fn with_handle<R, F: FnOnce(&mut ThreadHandle<'static>) -> R>(f: F) -> Option<R> {
  IN_ALLOC.with(|flag| {
    if flag.get() {
      return None;
    }
    flag.set(true);

    let result = global().and_then(|heap| {
      let mut f = Some(f);
      let cached = HANDLE.try_with(|cell| {
        // SAFETY: only this thread reaches its slot, and the guard above
        // keeps it to one borrow at a time.
        let slot = unsafe { &mut *cell.get() };
        let handle = slot.handle.get_or_insert_with(|| heap.thread());
        f.take().map(|f| f(handle))
      });
      match cached {
        Ok(result) => result,
        Err(_) => f.take().map(|f| f(&mut ThreadHandle::detached(heap))),
      }
    });

    flag.set(false);
    result
  })
}

/// Frees or resizes through the thread's handle, or through a detached one
/// when called from inside the allocator.
fn with_any_handle<R, F: FnOnce(&mut ThreadHandle<'static>) -> R>(f: F) -> Option<R> {
  let mut f = Some(f);
  if let Some(result) = with_handle(|h| f.take().map(|f| f(h))) {
    return result;
  }
  let heap = HEAP.get()?.as_ref()?;
  f.take().map(|f| f(&mut ThreadHandle::detached(heap)))
}

// =============================================================================
// Entry points shared by GlobalAlloc and the C API
// =============================================================================

fn alloc_impl(size: usize, flags: AllocFlags) -> *mut u8 {
  if let Some(result) = with_handle(|h| h.alloc_with(size, flags)) {
    return result.map_or(null_mut(), NonNull::as_ptr);
  }
  // Nested request from inside the engine.
  let ptr = base::alloc(size.max(1), flags.alignment());
  if flags.is_zeroed() && !ptr.is_null() {
    unsafe { ptr::write_bytes(ptr, 0, size) };
  }
  ptr
}

unsafe fn free_impl(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  if base::contains(ptr) {
    unsafe { base::dealloc(ptr) };
    return;
  }
  with_any_handle(|h| unsafe { h.free(ptr) });
}

unsafe fn realloc_impl(ptr: *mut u8, size: usize, flags: AllocFlags) -> *mut u8 {
  if ptr.is_null() {
    return alloc_impl(size, flags);
  }
  if base::contains(ptr) {
    return unsafe { base::realloc(ptr, size, flags.alignment()) };
  }
  with_any_handle(|h| unsafe { h.realloc_with(ptr, size, flags) })
    .flatten()
    .map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
unsafe fn usable_impl(ptr: *const u8) -> usize {
  if ptr.is_null() {
    return 0;
  }
  if base::contains(ptr) {
    return unsafe { base::usable_size(ptr) };
  }
  HEAP
    .get()
    .and_then(Option::as_ref)
    .and_then(|heap| heap.usable_size(ptr))
    .unwrap_or(0)
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// Routes `GlobalAlloc` through the process-wide heap. Requests made from
/// inside the allocator itself are served by a private bootstrap region.
pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    alloc_impl(layout.size(), AllocFlags::new().align(layout.align()))
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    alloc_impl(layout.size(), AllocFlags::new().align(layout.align()).zeroed())
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { free_impl(ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    unsafe { realloc_impl(ptr, new_size, AllocFlags::new().align(layout.align())) }
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
use core::ffi::{c_int, c_void};

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
  alloc_impl(size, AllocFlags::new()).cast()
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  alloc_impl(total, AllocFlags::new().zeroed()).cast()
}

/// `realloc(p, 0)` frees `p` and returns null.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
  if size == 0 && !ptr.is_null() {
    unsafe { free_impl(ptr.cast()) };
    return null_mut();
  }
  unsafe { realloc_impl(ptr.cast(), size, AllocFlags::new()).cast() }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
  unsafe { free_impl(ptr.cast()) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut c_void, alignment: usize, size: usize) -> c_int {
  if !alignment.is_power_of_two() || alignment < size_of::<*mut c_void>() {
    return libc::EINVAL;
  }
  let ptr = alloc_impl(size, AllocFlags::new().align(alignment));
  if ptr.is_null() {
    return libc::ENOMEM;
  }
  unsafe { *memptr = ptr.cast() };
  0
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
  if !alignment.is_power_of_two() {
    return null_mut();
  }
  alloc_impl(size, AllocFlags::new().align(alignment)).cast()
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
  unsafe { usable_impl(ptr.cast()) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mallocx(size: usize, flags: c_int) -> *mut c_void {
  match AllocFlags::from_bits(flags) {
    Some(flags) => alloc_impl(size, flags).cast(),
    None => null_mut(),
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rallocx(ptr: *mut c_void, size: usize, flags: c_int) -> *mut c_void {
  match AllocFlags::from_bits(flags) {
    Some(flags) => unsafe { realloc_impl(ptr.cast(), size, flags).cast() },
    None => null_mut(),
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn xallocx(ptr: *mut c_void, size: usize, extra: usize, flags: c_int) -> usize {
  let Some(flags) = AllocFlags::from_bits(flags) else {
    return unsafe { usable_impl(ptr.cast()) };
  };
  if base::contains(ptr.cast()) {
    return unsafe { base::usable_size(ptr.cast()) };
  }
  with_any_handle(|h| unsafe { h.resize_in_place(ptr.cast(), size, extra, flags) }).unwrap_or(0)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sallocx(ptr: *const c_void, _flags: c_int) -> usize {
  unsafe { usable_impl(ptr.cast()) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dallocx(ptr: *mut c_void, _flags: c_int) {
  unsafe { free_impl(ptr.cast()) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn nallocx(size: usize, flags: c_int) -> usize {
  let Some(flags) = AllocFlags::from_bits(flags) else {
    return 0;
  };
  with_handle(|h| h.heap().good_size(size, flags)).unwrap_or(0)
}
