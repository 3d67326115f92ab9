//! The set of arenas and the thread-to-arena assignment.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arena::Arena;
use crate::config::ArenaAssignment;
use crate::os;
use crate::size_class::SizeClassTable;

pub(crate) struct Registry {
  arenas: Box<[Arena]>,
  policy: ArenaAssignment,
  next: AtomicUsize,
}

impl Registry {
  pub(crate) fn new(count: usize, classes: &SizeClassTable, policy: ArenaAssignment) -> Self {
    let count = count.max(1);
    Self {
      arenas: (0..count).map(|id| Arena::new(id as u16, classes)).collect(),
      policy,
      next: AtomicUsize::new(0),
    }
  }

  pub(crate) fn len(&self) -> usize {
    self.arenas.len()
  }

  #[inline]
  pub(crate) fn get(&self, id: usize) -> Option<&Arena> {
    self.arenas.get(id)
  }

  /// Arena 0, which always exists.
  pub(crate) fn primary(&self) -> &Arena {
    &self.arenas[0]
  }

  pub(crate) fn iter(&self) -> impl Iterator<Item = &Arena> {
    self.arenas.iter()
  }

  /// Picks an arena for a new thread and binds it.
  pub(crate) fn assign(&self) -> &Arena {
    let n = self.arenas.len();
    let idx = match self.policy {
      ArenaAssignment::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % n,
      ArenaAssignment::CpuAffine => os::cpu_id() % n,
      ArenaAssignment::LeastLoaded => self
        .arenas
        .iter()
        .enumerate()
        .min_by_key(|(i, a)| (a.nthreads(), *i))
        .map_or(0, |(i, _)| i),
    };
    let arena = &self.arenas[idx];
    arena.bind();
    arena
  }

  pub(crate) fn release(&self, arena: &Arena) {
    arena.unbind();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn classes() -> SizeClassTable {
    SizeClassTable::new(os::page_size(), 4 << 20, 3584).unwrap()
  }

  #[test]
  fn round_robin_cycles() {
    let r = Registry::new(3, &classes(), ArenaAssignment::RoundRobin);
    let ids: Vec<usize> = (0..4).map(|_| r.assign().id()).collect();
    assert_eq!(ids, [0, 1, 2, 0]);
    assert_eq!(r.get(0).unwrap().nthreads(), 2);
    assert!(r.get(3).is_none());
  }

  #[test]
  fn least_loaded_prefers_idle_arenas() {
    let r = Registry::new(3, &classes(), ArenaAssignment::LeastLoaded);
    let a = r.assign();
    let b = r.assign();
    assert_eq!((a.id(), b.id()), (0, 1));
    r.release(a);
    assert_eq!(r.assign().id(), 0);
    assert_eq!(r.assign().id(), 2);
  }

  #[test]
  fn cpu_affine_stays_in_range() {
    let r = Registry::new(2, &classes(), ArenaAssignment::CpuAffine);
    for _ in 0..8 {
      assert!(r.assign().id() < 2);
    }
    assert_eq!(r.iter().map(Arena::nthreads).sum::<usize>(), 8);
  }
}
