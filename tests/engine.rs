use arenalloc::{AllocFlags, ArenaId, Config, DssPrecedence, Heap, MisusePolicy, RetentionPolicy, SizeKind};

fn config() -> Config {
  Config {
    narenas: 1,
    dss: DssPrecedence::Disabled,
    on_misuse: MisusePolicy::Ignore,
    ..Config::default()
  }
}

fn arena0() -> ArenaId {
  ArenaId::new(0).unwrap()
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn ten_bytes_come_from_the_sixteen_byte_class() {
  let heap = Heap::new(config()).unwrap();
  let classes = heap.size_classes();
  assert_eq!(classes.get(0).size, 8);
  assert_eq!(classes.get(1).size, 16);
  assert_eq!(classes.get(2).size, 32);
  assert_eq!(classes.class_for(10).map(|c| c.size), Some(16));

  let mut t = heap.thread();
  let p = t.alloc(10).unwrap();
  assert_eq!(heap.usable_size(p.as_ptr()), Some(16));
  unsafe { t.free(p.as_ptr()) };
}

#[test]
fn first_small_allocation_carves_a_run_in_a_fresh_chunk() {
  let heap = Heap::new(Config {
    tcache: false,
    ..config()
  })
  .unwrap();
  let classes = heap.size_classes();
  assert_eq!(classes.chunk_size(), 4 << 20);
  let class = *classes.class_for(16).unwrap();
  if classes.page_size() == 4096 {
    assert_eq!(class.run_size, 4096);
    assert_eq!(class.regions, 256);
    assert_eq!(class.bitmap_bytes(), 32);
  }
  assert_eq!(heap.stats().chunks.os_acquisitions, 0);

  let mut t = heap.thread();
  let p = t.alloc(16).unwrap().as_ptr() as usize;
  let stats = heap.stats();
  assert_eq!(stats.chunks.os_acquisitions, 1);
  assert_eq!(stats.arenas[0].chunks, 1);
  assert_eq!(stats.arenas[0].bins[class.index].curruns, 1);
  // Region 0 of the first run, at the start of the chunk.
  assert_eq!(p % classes.chunk_size(), 0);
  unsafe { t.free(p as *mut u8) };
}

#[test]
fn freeing_the_last_region_empties_run_and_chunk() {
  for (retention, chunks_left) in [(RetentionPolicy::Release, 0), (RetentionPolicy::Retain, 1)] {
    let heap = Heap::new(Config {
      tcache: false,
      retention,
      ..config()
    })
    .unwrap();
    let mut t = heap.thread();
    let class = heap.size_classes().class_for(16).unwrap().index;

    let a = t.alloc(16).unwrap();
    let b = t.alloc(16).unwrap();
    unsafe { t.free(a.as_ptr()) };
    let stats = heap.stats().arenas[0].clone();
    assert_eq!(stats.bins[class].curregs, 1);
    assert_eq!(stats.bins[class].curruns, 1);

    unsafe { t.free(b.as_ptr()) };
    let stats = heap.stats();
    assert_eq!(stats.arenas[0].bins[class].curruns, 0);
    assert_eq!(stats.arenas[0].chunks, chunks_left, "{retention:?}");
    assert_eq!(stats.arenas[0].empty_chunks, chunks_left);
    assert_eq!(stats.chunks.releases as usize, 1 - chunks_left);
    // The run's pages no longer resolve to a live allocation.
    assert_eq!(heap.usable_size(b.as_ptr()), None);
  }
}

#[test]
fn ten_mib_becomes_a_twelve_mib_huge_allocation() {
  let heap = Heap::new(config()).unwrap();
  let chunk = heap.size_classes().chunk_size();
  assert!(matches!(
    heap.size_classes().classify(10 << 20, 1),
    Some(SizeKind::Huge { size, .. }) if size == 12 << 20
  ));

  let mut t = heap.thread();
  let p = t.alloc(10 << 20).unwrap();
  assert_eq!(p.as_ptr() as usize % chunk, 0);
  assert_eq!(heap.usable_size(p.as_ptr()), Some(12 << 20));

  let stats = heap.stats();
  let arena = &stats.arenas[t.arena_id()];
  assert_eq!((arena.huge.current, arena.huge.bytes), (1, 12 << 20));
  assert_eq!(arena.chunks, 0, "huge allocations bypass arena chunks");
  assert_eq!(stats.small_allocated(), 0);

  unsafe {
    p.as_ptr().add((10 << 20) - 1).write(0x5A);
    t.free(p.as_ptr());
  }
  assert_eq!(heap.stats().arenas[t.arena_id()].huge.current, 0);
}

#[test]
fn thread_exit_flushes_every_cached_entry() {
  let heap = Heap::new(Config {
    tcache_slots_small: 64,
    tcache_gc_sweep: 0,
    ..config()
  })
  .unwrap();
  let class = heap.size_classes().class_for(64).unwrap().index;

  std::thread::scope(|s| {
    s.spawn(|| {
      let mut t = heap.thread_in(arena0()).unwrap();
      let ptrs: Vec<_> = (0..40).map(|_| t.alloc(64).unwrap()).collect();
      for p in ptrs {
        unsafe { t.free(p.as_ptr()) };
      }
      assert!(t.cached(64) >= 40);
      assert!(heap.arena(arena0()).unwrap().stats().bins[class].curregs >= 40);
    });
  });

  let arena = heap.arena(arena0()).unwrap();
  let bin = &arena.stats().bins[class];
  assert_eq!(bin.curregs, 0);
  assert!(bin.nflushes >= 1);
  assert_eq!(arena.nthreads(), 0);
}

// =============================================================================
// Properties
// =============================================================================

#[test]
fn small_classes_are_aligned_and_disjoint() {
  let heap = Heap::new(config()).unwrap();
  let mut t = heap.thread();
  let mut live = Vec::new();
  for class in heap.size_classes().iter() {
    for _ in 0..3 {
      let p = t.alloc(class.size).unwrap().as_ptr();
      assert_eq!(p as usize % class.align, 0, "class {}", class.size);
      unsafe { p.write_bytes(class.index as u8, class.size) };
      live.push((p, class.size, class.index as u8));
    }
  }

  let mut ranges: Vec<_> = live.iter().map(|&(p, len, _)| (p as usize, p as usize + len)).collect();
  ranges.sort_unstable();
  for pair in ranges.windows(2) {
    assert!(pair[0].1 <= pair[1].0, "overlap: {pair:?}");
  }

  for (p, len, tag) in live {
    let bytes = unsafe { core::slice::from_raw_parts(p, len) };
    assert!(bytes.iter().all(|&b| b == tag));
    unsafe { t.free(p) };
  }
}

#[test]
fn bitmap_population_tracks_bookkeeping() {
  let heap = Heap::new(Config {
    tcache_slots_small: 16,
    ..config()
  })
  .unwrap();
  let arena = heap.arena(arena0()).unwrap();
  let mut t = heap.thread();
  let sizes = [8, 24, 100, 700, 3000];
  let mut live = Vec::new();

  let check = || {
    let stats = arena.stats();
    for bin in &stats.bins {
      assert_eq!(arena.bitmap_population(bin.class), Some(bin.curregs), "class {}", bin.size);
    }
  };

  for round in 0..200usize {
    let size = sizes[round % sizes.len()];
    live.push(t.alloc(size).unwrap());
    if round % 3 == 2 {
      let victim = live.swap_remove(round % live.len());
      unsafe { t.free(victim.as_ptr()) };
    }
    if round % 25 == 0 {
      check();
    }
  }
  for p in live {
    unsafe { t.free(p.as_ptr()) };
  }
  t.flush();
  check();
  assert_eq!(arena.stats().small_allocated(), 0);
}

#[test]
fn free_then_realloc_reuses_capacity() {
  for tcache in [false, true] {
    let heap = Heap::new(Config { tcache, ..config() }).unwrap();
    let mut t = heap.thread();
    let page = heap.size_classes().page_size();
    let mut p = t.alloc(48).unwrap();
    let mut q = t.alloc(5 * page).unwrap();
    let before = heap.stats().chunks.os_acquisitions;
    assert_eq!(before, 1);

    for _ in 0..100 {
      unsafe {
        t.free(p.as_ptr());
        t.free(q.as_ptr());
      }
      p = t.alloc(48).unwrap();
      q = t.alloc(5 * page).unwrap();
      assert_eq!(heap.stats().chunks.os_acquisitions, before, "tcache {tcache}");
    }
    unsafe {
      t.free(p.as_ptr());
      t.free(q.as_ptr());
    }
  }
}

#[test]
fn huge_allocations_are_chunk_multiples() {
  let heap = Heap::new(config()).unwrap();
  let chunk = heap.size_classes().chunk_size();
  let mut t = heap.thread();
  for size in [chunk - heap.size_classes().page_size() + 1, chunk, chunk + 1, 3 * chunk - 7] {
    let p = t.alloc(size).unwrap().as_ptr();
    assert_eq!(p as usize % chunk, 0);
    assert_eq!(heap.usable_size(p), Some(size.div_ceil(chunk) * chunk), "size {size}");
    unsafe { t.free(p) };
  }
  // Alignment beyond a page escalates to the huge path too.
  let p = t.aligned_alloc(2 * chunk, 100).unwrap().as_ptr();
  assert_eq!(p as usize % (2 * chunk), 0);
  assert_eq!(heap.usable_size(p), Some(chunk));
  unsafe { t.free(p) };
}

#[test]
fn overflowing_cache_flushes_below_the_watermark() {
  let heap = Heap::new(Config {
    tcache_slots_small: 32,
    tcache_gc_sweep: 0,
    ..config()
  })
  .unwrap();
  let arena = heap.arena(arena0()).unwrap();
  let class = heap.size_classes().class_for(32).unwrap().index;
  let mut t = heap.thread_in(arena0()).unwrap();
  let high = t.cache_capacity(32);
  assert_eq!(high, 32);

  let ptrs: Vec<_> = (0..=high)
    .map(|_| t.alloc_with(32, AllocFlags::new().no_cache()).unwrap())
    .collect();
  for p in &ptrs[..high] {
    unsafe { t.free(p.as_ptr()) };
  }
  assert_eq!(t.cached(32), high);
  assert_eq!(arena.stats().bins[class].curregs, high + 1);

  unsafe { t.free(ptrs[high].as_ptr()) };
  let cached = t.cached(32);
  assert!(cached < high);
  let bin = &arena.stats().bins[class];
  assert_eq!(bin.curregs, cached);
  assert_eq!(bin.nflushes, 1);
  assert_eq!(arena.bitmap_population(class), Some(cached));
}

// =============================================================================
// Misuse
// =============================================================================

#[test]
fn double_free_split_across_caches_is_reported_on_flush() {
  let heap = Heap::new(config()).unwrap();
  let arena = heap.arena(arena0()).unwrap();
  let class = heap.size_classes().class_for(64).unwrap().index;
  let mut a = heap.thread_in(arena0()).unwrap();
  let mut b = heap.thread_in(arena0()).unwrap();

  let keep = a.alloc(64).unwrap();
  let p = a.alloc(64).unwrap().as_ptr();
  unsafe {
    a.free(p);
    b.free(p);
  }
  assert_eq!(heap.stats().events.misuses, 0);

  b.flush();
  assert_eq!(heap.stats().events.misuses, 0);
  a.flush();
  assert_eq!(heap.stats().events.misuses, 1);

  let bin = &arena.stats().bins[class];
  assert_eq!(bin.curregs, 1);
  assert_eq!(arena.bitmap_population(class), Some(1));

  unsafe { a.free(keep.as_ptr()) };
  drop(a);
  drop(b);
  assert_eq!(arena.stats().small_allocated(), 0);
  assert_eq!(heap.stats().events.misuses, 1);
}
