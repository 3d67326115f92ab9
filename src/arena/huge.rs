//! Huge allocations: whole chunk multiples straight from the chunk manager.

use super::Arena;
use crate::chunk::Extent;
use crate::error::{AllocError, Misuse};
use crate::heap::Shared;

pub(super) struct HugeAllocation {
  pub(super) extent: Extent,
}

impl Arena {
  pub(crate) fn alloc_huge(&self, ctx: &Shared, size: usize, align: usize) -> Result<usize, AllocError> {
    let extent = ctx.chunks.acquire_huge(&ctx.extents, self.id, size, align)?;
    let mut state = self.state.lock();
    state.huge.insert(extent.base, HugeAllocation { extent });
    let stats = &mut state.huge_stats;
    stats.nmalloc += 1;
    stats.current += 1;
    stats.bytes += size;
    drop(state);
    log::debug!("arena {} mapped huge {size:#x} at {:#x}", self.id, extent.base);
    Ok(extent.base)
  }

  pub(crate) fn free_huge(&self, ctx: &Shared, addr: usize) -> Result<(), Misuse> {
    let mut state = self.state.lock();
    let huge = state.huge.remove(&addr).ok_or(Misuse::DoubleFree(addr))?;
    let stats = &mut state.huge_stats;
    stats.ndalloc += 1;
    stats.current -= 1;
    stats.bytes -= huge.extent.size;
    drop(state);
    ctx.chunks.release(&ctx.extents, huge.extent);
    Ok(())
  }

  pub(crate) fn huge_size(&self, addr: usize) -> Option<usize> {
    Some(self.state.lock().huge.get(&addr)?.extent.size)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{Config, DssPrecedence};
  use crate::extent::{ExtentKind, ExtentNode};

  #[test]
  fn huge_allocations_are_chunk_aligned_and_indexed() {
    let ctx = Shared::new(Config {
      dss: DssPrecedence::Disabled,
      ..Config::default()
    })
    .unwrap();
    let arena = Arena::new(2, &ctx.classes);
    let chunk = ctx.classes.chunk_size();

    let addr = arena.alloc_huge(&ctx, 3 * chunk, chunk).unwrap();
    assert_eq!(addr % chunk, 0);
    assert_eq!(arena.huge_size(addr), Some(3 * chunk));
    assert_eq!(ctx.extents.lookup(addr), Some(ExtentNode::new(2, ExtentKind::Huge)));
    let stats = arena.stats();
    assert_eq!((stats.huge.current, stats.huge.bytes), (1, 3 * chunk));

    arena.free_huge(&ctx, addr).unwrap();
    assert_eq!(arena.huge_size(addr), None);
    assert_eq!(ctx.extents.lookup(addr), None);
    assert_eq!(arena.free_huge(&ctx, addr), Err(Misuse::DoubleFree(addr)));
    assert_eq!(arena.stats().huge.ndalloc, 1);
  }
}
