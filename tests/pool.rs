use std::{env, os::unix::process::ExitStatusExt, process::Command, ptr::NonNull};

use proptest::prelude::*;
use rpool::{CorruptionPolicy, HEADER_SIZE, Pool, PoolConfig, PoolError, SENTINEL_SIZE};

fn plain(capacity: usize) -> Pool {
  Pool::with_capacity(capacity, PoolConfig::new().with_corruption_guard(false)).unwrap()
}

fn guarded(capacity: usize) -> Pool {
  let config = PoolConfig::new()
    .with_corruption_guard(true)
    .with_policy(CorruptionPolicy::Panic);
  Pool::with_capacity(capacity, config).unwrap()
}

fn addr(ptr: NonNull<u8>) -> usize {
  ptr.as_ptr() as usize
}

#[test]
fn store_and_release_leaves_one_free_block() {
  let mut pool = plain(1024);

  let ptr = pool.allocate(4).unwrap().cast::<i32>();
  unsafe {
    ptr.write(10);
    assert_eq!(ptr.read(), 10);
    pool.release(ptr.cast());
  }

  let blocks: Vec<_> = pool.dump_blocks().collect();
  assert_eq!(blocks.len(), 1);
  assert!(blocks[0].free);
  assert_eq!(blocks[0].size, 1024 - HEADER_SIZE);

  pool.teardown().unwrap();
}

#[test]
fn guarded_pool_reserves_sentinels_on_head() {
  let pool = guarded(1024);

  let blocks: Vec<_> = pool.dump_blocks().collect();
  assert_eq!(blocks.len(), 1);
  assert_eq!(blocks[0].size, 1024 - HEADER_SIZE - 2 * SENTINEL_SIZE);
}

#[test]
fn releasing_between_two_free_neighbours_merges_all_three() {
  let sizes = [96, 200, 304];

  // Release the middle block last, once with left freed first and once
  // with right freed first.
  for left_first in [true, false] {
    let mut pool = plain(4096);
    let ptrs: Vec<_> = sizes.iter().map(|&s| pool.allocate(s).unwrap()).collect();
    let _fence = pool.allocate(8).unwrap();

    unsafe {
      if left_first {
        pool.release(ptrs[0]);
        pool.release(ptrs[2]);
      } else {
        pool.release(ptrs[2]);
        pool.release(ptrs[0]);
      }
      pool.release(ptrs[1]);
    }

    let first = pool.dump_blocks().next().unwrap();
    assert!(first.free);
    assert_eq!(first.offset, 0);
    assert_eq!(first.size, 96 + 200 + 304 + 2 * HEADER_SIZE);
    pool.check_invariants().unwrap();
  }
}

#[test]
fn released_slot_is_reused_for_smaller_request() {
  let mut pool = plain(4096);
  let _before = pool.allocate(40).unwrap();
  let original = pool.allocate(256).unwrap();
  let _after = pool.allocate(40).unwrap();

  unsafe { pool.release(original) };

  for smaller in [256, 200, 1] {
    let reused = pool.allocate(smaller).unwrap();
    assert!(addr(reused) >= addr(original));
    assert!(addr(reused) + smaller <= addr(original) + 256);
    unsafe { pool.release(reused) };
  }
}

#[test]
fn exact_largest_block_fits_and_one_more_byte_does_not() {
  let mut pool = plain(2048);
  let _head = pool.allocate(64).unwrap();

  let largest = pool.stats().largest_free;

  assert!(pool.allocate(largest + 1).is_none());

  let ptr = pool.allocate(largest).unwrap();
  let stats = pool.stats();
  assert_eq!(stats.free_blocks, 0);
  assert_eq!(stats.block_count, 2);

  unsafe { pool.release(ptr) };
  assert_eq!(pool.stats().largest_free, largest);
}

#[test]
fn merged_span_satisfies_request_only_after_release() {
  let mut pool = plain(4096);

  let a = pool.allocate(96).unwrap();
  let b = pool.allocate(200).unwrap();
  let c = pool.allocate(304).unwrap();
  let d = pool.allocate(400).unwrap();
  let rest = pool.stats().largest_free;
  let _tail = pool.allocate(rest).unwrap();
  assert_eq!(pool.stats().free_blocks, 0);

  unsafe {
    pool.release(b);
    pool.release(d);
  }

  let request = 200 + 304 + 400;
  assert!(pool.allocate(request).is_none());
  assert_eq!(pool.stats().free_blocks, 2);

  unsafe { pool.release(c) };

  let merged = pool.allocate(request).unwrap();
  assert_eq!(addr(merged), addr(b));
  assert_ne!(merged, a);
  pool.check_invariants().unwrap();
}

#[test]
fn exhaustion_is_reported_and_recoverable() {
  let mut pool = plain(1024);
  let mut live = Vec::new();

  while let Some(ptr) = pool.allocate(100) {
    live.push(ptr);
  }
  assert!(!live.is_empty());
  assert!(pool.allocate(100).is_none());

  let ptr = live.pop().unwrap();
  unsafe { pool.release(ptr) };
  assert!(pool.allocate(100).is_some());
}

#[test]
fn initialize_on_live_pool_fails() {
  let mut pool = plain(1024);
  assert!(matches!(pool.initialize(1024), Err(PoolError::AlreadyInitialized)));
}

#[test]
#[should_panic(expected = "tests/pool.rs")]
fn overrun_reports_allocation_site() {
  let mut pool = guarded(1024);
  let ptr = pool.allocate(12).unwrap();

  unsafe {
    ptr.add(12).write(0xFF);
    pool.release(ptr);
  }
}

const ABORT_CHILD: &str = "RPOOL_ABORT_CHILD";

#[test]
fn overrun_aborts_with_allocation_site_by_default() {
  if env::var_os(ABORT_CHILD).is_some() {
    let config = PoolConfig::new().with_corruption_guard(true);
    assert_eq!(config.on_corruption, CorruptionPolicy::Abort);

    let mut pool = Pool::with_capacity(1024, config).unwrap();
    let line = line!() + 1;
    let ptr = pool.allocate(12).unwrap();
    eprintln!("site: {}:{line}", file!());
    unsafe {
      ptr.add(12).write(0xFF);
      pool.release(ptr);
    }
    unreachable!("release returned after a sentinel mismatch");
  }

  let output = Command::new(env::current_exe().unwrap())
    .args(["--exact", "overrun_aborts_with_allocation_site_by_default", "--nocapture"])
    .env(ABORT_CHILD, "1")
    .output()
    .unwrap();

  let stderr = String::from_utf8_lossy(&output.stderr);
  assert!(!output.status.success());
  assert_eq!(output.status.signal(), Some(libc::SIGABRT), "stderr: {stderr}");
  assert!(stderr.contains("trailing sentinel"), "stderr: {stderr}");

  let site = stderr
    .lines()
    .find_map(|line| line.strip_prefix("site: "))
    .expect("child reported its allocation site");
  assert!(site.starts_with("tests/pool.rs:"));
  assert!(stderr.contains(&format!("allocated at {site}")), "stderr: {stderr}");
}

#[test]
fn in_bounds_writes_pass_guard() {
  let mut pool = guarded(1024);
  let ptr = pool.allocate(12).unwrap();

  unsafe {
    ptr.as_ptr().write_bytes(0xFF, 12);
    pool.release(ptr);
  }

  assert_eq!(pool.dump_blocks().count(), 1);
}

#[derive(Debug, Clone)]
enum Op {
  Alloc(usize),
  Free(prop::sample::Index),
}

fn op() -> impl Strategy<Value = Op> {
  prop_oneof![
    (0usize..512).prop_map(Op::Alloc),
    any::<prop::sample::Index>().prop_map(Op::Free),
  ]
}

fn run_ops(
  pool: &mut Pool,
  ops: Vec<Op>,
) -> Result<(), TestCaseError> {
  let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
  let mut tag = 0u8;

  for op in ops {
    match op {
      Op::Alloc(size) => {
        if let Some(ptr) = pool.allocate(size) {
          tag = tag.wrapping_add(1);
          unsafe { ptr.as_ptr().write_bytes(tag, size) };
          live.push((ptr, size, tag));
        }
      }
      Op::Free(index) if !live.is_empty() => {
        let (ptr, _, _) = live.swap_remove(index.index(live.len()));
        unsafe { pool.release(ptr) };
      }
      Op::Free(_) => {}
    }

    prop_assert_eq!(pool.check_invariants(), Ok(()));

    let occupied = pool.dump_blocks().filter(|b| !b.free).count();
    prop_assert_eq!(occupied, live.len());
  }

  for (ptr, size, tag) in &live {
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), *size) };
    prop_assert!(bytes.iter().all(|b| b == tag));
  }

  for (ptr, _, _) in live {
    unsafe { pool.release(ptr) };
  }

  let blocks: Vec<_> = pool.dump_blocks().collect();
  prop_assert_eq!(blocks.len(), 1);
  prop_assert!(blocks[0].free);

  Ok(())
}

proptest! {
  #[test]
  fn registry_stays_consistent(ops in prop::collection::vec(op(), 1..200)) {
    let mut pool = plain(16 * 1024);
    run_ops(&mut pool, ops)?;
  }

  #[test]
  fn guarded_registry_stays_consistent(ops in prop::collection::vec(op(), 1..200)) {
    let mut pool = guarded(16 * 1024);
    run_ops(&mut pool, ops)?;
  }
}
