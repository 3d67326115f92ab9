//! The default misuse policy ends the process. Each test re-runs itself in a
//! child process and checks that the child died of SIGABRT.

#![cfg(unix)]

use std::env;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus};

use arenalloc::{ArenaId, Config, DssPrecedence, Heap, MisusePolicy};

const CHILD: &str = "ARENALLOC_ABORT_CHILD";

fn in_child() -> bool {
  env::var_os(CHILD).is_some()
}

fn rerun(test: &str) -> ExitStatus {
  Command::new(env::current_exe().unwrap())
    .args(["--exact", test, "--nocapture", "--test-threads=1"])
    .env(CHILD, "1")
    .status()
    .unwrap()
}

fn aborting_heap() -> Heap {
  let config = Config {
    narenas: 1,
    dss: DssPrecedence::Disabled,
    ..Config::default()
  };
  assert_eq!(config.on_misuse, MisusePolicy::Abort);
  Heap::new(config).unwrap()
}

#[test]
fn foreign_free_aborts() {
  if in_child() {
    let heap = aborting_heap();
    let mut t = heap.thread();
    let mut local = [0u64; 4];
    unsafe { t.free(local.as_mut_ptr().cast()) };
    return;
  }
  assert_eq!(rerun("foreign_free_aborts").signal(), Some(libc::SIGABRT));
}

#[test]
fn double_free_found_on_flush_aborts() {
  if in_child() {
    let heap = aborting_heap();
    let arena = ArenaId::new(0).unwrap();
    let mut a = heap.thread_in(arena).unwrap();
    let mut b = heap.thread_in(arena).unwrap();
    let _keep = a.alloc(64).unwrap();
    let p = a.alloc(64).unwrap().as_ptr();
    unsafe {
      a.free(p);
      b.free(p);
    }
    b.flush();
    a.flush();
    return;
  }
  assert_eq!(rerun("double_free_found_on_flush_aborts").signal(), Some(libc::SIGABRT));
}

#[test]
fn ignore_policy_survives_the_same_misuse() {
  let heap = Heap::new(Config {
    narenas: 1,
    dss: DssPrecedence::Disabled,
    on_misuse: MisusePolicy::Ignore,
    ..Config::default()
  })
  .unwrap();
  let mut t = heap.thread();
  let mut local = [0u64; 4];
  unsafe { t.free(local.as_mut_ptr().cast()) };
  assert_eq!(heap.stats().events.misuses, 1);
}
