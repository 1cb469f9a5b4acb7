//! Read-only views of the block list.

use std::iter::FusedIterator;

use crate::{arena::Arena, guard::CallSite};

/// One block as seen from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  /// Offset of the block header from the start of the arena.
  pub offset: usize,
  /// Address of the block header.
  pub address: usize,
  /// Usable payload size.
  pub size: usize,
  pub free: bool,
  /// Allocation site of an occupied block, when the guard records it.
  pub call_site: Option<CallSite>,
}

/// Iterator over the blocks of a pool, front to back.
///
/// Produced by [`Pool::dump_blocks`](crate::Pool::dump_blocks); every call
/// starts a fresh walk from the first block. A clone continues from the
/// same position as the original.
#[derive(Clone)]
pub struct Blocks<'a> {
  arena: Option<&'a Arena>,
  cursor: Option<usize>,
}

impl<'a> Blocks<'a> {
  pub(crate) fn new(arena: Option<&'a Arena>) -> Self {
    Self {
      arena,
      cursor: arena.map(|_| 0),
    }
  }
}

impl Iterator for Blocks<'_> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<Self::Item> {
    let arena = self.arena?;
    let offset = self.cursor?;

    // SAFETY: offset is the head or a `next` link of a live arena.
    let header = unsafe { arena.header(offset) };
    self.cursor = header.next();

    Some(BlockInfo {
      offset,
      address: arena.base_addr() + offset,
      size: header.usable_size,
      free: header.is_free,
      call_site: header.call_site,
    })
  }
}

impl FusedIterator for Blocks<'_> {}

/// Summary of a pool's block list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
  pub capacity: usize,
  pub block_count: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub used_bytes: usize,
  pub largest_free: usize,
}

impl PoolStats {
  pub(crate) fn collect(
    capacity: usize,
    blocks: Blocks<'_>,
  ) -> Self {
    blocks.fold(
      Self {
        capacity,
        ..Self::default()
      },
      |mut stats, block| {
        stats.block_count += 1;
        if block.free {
          stats.free_blocks += 1;
          stats.free_bytes += block.size;
          stats.largest_free = stats.largest_free.max(block.size);
        } else {
          stats.used_bytes += block.size;
        }
        stats
      },
    )
  }

  /// How scattered free memory is: 0.0 when it is one block, approaching
  /// 1.0 as the largest free block shrinks relative to the total.
  pub fn fragmentation(&self) -> f32 {
    if self.free_bytes == 0 {
      return 0.0;
    }
    1.0 - (self.largest_free as f32 / self.free_bytes as f32)
  }
}

#[cfg(test)]
mod tests {
  use crate::{HEADER_SIZE, Pool, PoolConfig};

  fn pool(capacity: usize) -> Pool {
    Pool::with_capacity(capacity, PoolConfig::new().with_corruption_guard(false)).unwrap()
  }

  #[test]
  fn test_fresh_pool_single_block() {
    let pool = pool(1024);
    let blocks: Vec<_> = pool.dump_blocks().collect();

    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].offset, 0);
    assert_eq!(blocks[0].size, 1024 - HEADER_SIZE);
    assert!(blocks[0].free);
  }

  #[test]
  fn test_dump_is_restartable() {
    let mut pool = pool(2048);
    let _a = pool.allocate(100).unwrap();
    let _b = pool.allocate(200).unwrap();

    let first: Vec<_> = pool.dump_blocks().collect();
    let second: Vec<_> = pool.dump_blocks().collect();
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);

    let mut blocks = pool.dump_blocks();
    blocks.next();
    let rest = blocks.clone();
    assert_eq!(blocks.count(), 2);
    assert_eq!(rest.count(), 2);
  }

  #[test]
  fn test_addresses_increase() {
    let mut pool = pool(4096);
    for size in [8, 16, 24, 32] {
      pool.allocate(size).unwrap();
    }

    let addresses: Vec<_> = pool.dump_blocks().map(|b| b.address).collect();
    assert!(addresses.windows(2).all(|w| w[0] < w[1]));
  }

  #[test]
  fn test_stats_and_fragmentation() {
    let mut pool = pool(4096);
    assert_eq!(pool.stats().fragmentation(), 0.0);

    let a = pool.allocate(256).unwrap();
    let _b = pool.allocate(256).unwrap();
    unsafe { pool.release(a) };

    let stats = pool.stats();
    assert_eq!(stats.capacity, 4096);
    assert_eq!(stats.block_count, 3);
    assert_eq!(stats.free_blocks, 2);
    assert_eq!(stats.used_bytes, 256);
    assert_eq!(stats.free_bytes, 4096 - 3 * HEADER_SIZE - 256);
    assert!(stats.fragmentation() > 0.0);
  }

  #[test]
  fn test_empty_without_arena() {
    let pool = Pool::new(PoolConfig::default());
    assert_eq!(pool.dump_blocks().count(), 0);
    assert_eq!(pool.stats(), Default::default());
  }
}
