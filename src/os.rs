//! Thin wrappers over the OS memory interfaces.

use core::{
  ptr::null_mut,
  sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use crate::align_up;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// System page size, queried once.
pub fn page_size() -> usize {
  let cached = PAGE_SIZE.load(Ordering::Relaxed);
  if cached != 0 {
    return cached;
  }
  // SAFETY: sysconf has no memory-safety preconditions.
  let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  let size = if raw > 0 && (raw as usize).is_power_of_two() {
    raw as usize
  } else {
    4096
  };
  PAGE_SIZE.store(size, Ordering::Relaxed);
  size
}

/// Online CPUs, at least 1.
pub fn ncpus() -> usize {
  // SAFETY: sysconf has no memory-safety preconditions.
  let raw = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
  if raw > 0 { raw as usize } else { 1 }
}

/// Maps `size` bytes of zeroed anonymous memory. Null on failure.
pub(crate) unsafe fn map(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

pub(crate) unsafe fn unmap(ptr: *mut u8, size: usize) {
  if size == 0 {
    return;
  }
  if unsafe { libc::munmap(ptr.cast(), size) } != 0 {
    log::warn!("munmap({ptr:p}, {size}) failed");
  }
}

/// Maps `size` bytes aligned to `align` (a power of two, at least a page).
///
/// Tries an exact mapping first; the kernel often hands back aligned
/// addresses for large requests. Otherwise over-maps and trims both ends.
pub(crate) unsafe fn map_aligned(size: usize, align: usize) -> *mut u8 {
  debug_assert!(align.is_power_of_two() && align >= page_size());
  debug_assert!(size % page_size() == 0);

  let ptr = unsafe { map(size) };
  if ptr.is_null() {
    return null_mut();
  }
  if (ptr as usize) & (align - 1) == 0 {
    return ptr;
  }
  unsafe { unmap(ptr, size) };

  let Some(padded) = size.checked_add(align - page_size()) else {
    return null_mut();
  };
  let raw = unsafe { map(padded) };
  if raw.is_null() {
    return null_mut();
  }

  let aligned = align_up(raw as usize, align);
  let lead = aligned - raw as usize;
  let trail = padded - lead - size;
  unsafe {
    unmap(raw, lead);
    unmap((aligned + size) as *mut u8, trail);
  }
  aligned as *mut u8
}

/// Returns the physical pages behind `[ptr, ptr + size)` to the OS while
/// keeping the mapping. Reads afterwards observe zeroes (Linux) or the old
/// contents until the kernel reclaims them (elsewhere).
#[cfg(feature = "release-mem")]
pub(crate) unsafe fn purge(ptr: *mut u8, size: usize) -> bool {
  #[cfg(target_os = "linux")]
  let advice = libc::MADV_DONTNEED;
  #[cfg(not(target_os = "linux"))]
  let advice = libc::MADV_FREE;

  unsafe { libc::madvise(ptr.cast(), size, advice) == 0 }
}

#[cfg(not(feature = "release-mem"))]
pub(crate) unsafe fn purge(_ptr: *mut u8, _size: usize) -> bool {
  false
}

// =============================================================================
// Data segment
// =============================================================================

/// Current program break, if the data segment is usable on this platform.
#[cfg(target_os = "linux")]
pub(crate) unsafe fn dss_current() -> Option<usize> {
  let cur = unsafe { libc::sbrk(0) };
  if cur as isize == -1 { None } else { Some(cur as usize) }
}

/// Moves the program break by `incr` bytes. Returns the previous break.
#[cfg(target_os = "linux")]
pub(crate) unsafe fn dss_grow(incr: usize) -> Option<usize> {
  let incr = isize::try_from(incr).ok()?;
  let prev = unsafe { libc::sbrk(incr as libc::intptr_t) };
  if prev as isize == -1 { None } else { Some(prev as usize) }
}

#[cfg(not(target_os = "linux"))]
pub(crate) unsafe fn dss_current() -> Option<usize> {
  None
}

#[cfg(not(target_os = "linux"))]
pub(crate) unsafe fn dss_grow(_incr: usize) -> Option<usize> {
  None
}

// =============================================================================
// Thread / CPU identity
// =============================================================================

// Each thread gets a different ID
pub(crate) fn thread_id_u32() -> u32 {
  thread_local! {
    static TID: u32 = {
      static CTR: AtomicU32 = AtomicU32::new(1);
      CTR.fetch_add(1, Ordering::Relaxed) // We only need uniqueness, not synchronization
    };
  }
  TID.try_with(|&id| id).unwrap_or(0)
}

// Only supported in the latest x86 CPUs. Seems to be the fastest way to access CPU ID
#[cfg(all(target_arch = "x86_64", target_os = "linux", feature = "rdpid"))]
pub(crate) fn cpu_id() -> usize {
  let cpu: u64;
  unsafe {
    // nomem - Doesn't read/write memory
    // nostack - Doesn't touch the stack pointer
    // preserves_flags - Doesn't modify CPU flags (EFLAGS/RFLAGS)
    std::arch::asm!("rdpid {}", out(reg) cpu, options(nomem, nostack, preserves_flags));
  }
  (cpu & 0xFFF) as usize
}

#[cfg(all(target_os = "linux", not(all(target_arch = "x86_64", feature = "rdpid"))))]
pub(crate) fn cpu_id() -> usize {
  let cpu = unsafe { libc::sched_getcpu() };
  if cpu < 0 {
    thread_id_u32() as usize
  } else {
    cpu as usize
  }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn cpu_id() -> usize {
  thread_id_u32() as usize
}
