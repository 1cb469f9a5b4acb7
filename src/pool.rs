use std::ptr::NonNull;

use crate::{
  align::{WORD, checked_align},
  arena::Arena,
  block::{self, BlockHeader, HEADER_SIZE, MergeOrder},
  config::PoolConfig,
  error::{InvariantViolation, PoolError, PoolResult},
  guard::{self, CallSite, SENTINEL},
  inspect::{Blocks, PoolStats},
};

/// First-fit allocator over a single mmap'd arena.
///
/// A `Pool` starts out empty. [`Pool::initialize`] maps the arena and
/// covers it with one free block; [`Pool::teardown`] (or dropping the pool)
/// gives it back to the OS.
pub struct Pool {
  arena: Option<Arena>,
  config: PoolConfig,
}

impl Pool {
  pub fn new(config: PoolConfig) -> Self {
    Self { arena: None, config }
  }

  /// Creates a pool and initializes its arena in one step.
  pub fn with_capacity(
    capacity: usize,
    config: PoolConfig,
  ) -> PoolResult<Self> {
    let mut pool = Self::new(config);
    pool.initialize(capacity)?;
    Ok(pool)
  }

  pub fn config(&self) -> &PoolConfig {
    &self.config
  }

  pub fn is_live(&self) -> bool {
    self.arena.is_some()
  }

  /// Usable arena length in bytes, zero when no arena is live.
  pub fn capacity(&self) -> usize {
    self.arena.as_ref().map_or(0, Arena::len)
  }

  /// Bytes a block costs on top of its payload.
  pub fn overhead(&self) -> usize {
    HEADER_SIZE + 2 * self.config.guard_size()
  }

  /// Maps `capacity` bytes and installs a single free block spanning them.
  ///
  /// # Errors
  ///
  /// A failed `mmap` is returned as [`PoolError::Reserve`] instead of ending
  /// the process. The pool stays uninitialized, and callers that cannot run
  /// without it should exit themselves, as the `matrix` demo does.
  /// [`PoolError::AlreadyInitialized`] and [`PoolError::CapacityTooSmall`]
  /// leave a live arena untouched.
  pub fn initialize(
    &mut self,
    capacity: usize,
  ) -> PoolResult<()> {
    if self.arena.is_some() {
      return Err(PoolError::AlreadyInitialized);
    }

    let minimum = self.overhead();
    let len = align_down!(capacity);
    if len < minimum {
      return Err(PoolError::CapacityTooSmall {
        requested: capacity,
        minimum,
      });
    }

    let mut arena = Arena::reserve(capacity).map_err(PoolError::Reserve)?;
    let head = BlockHeader::free(arena.len() - minimum, None, None);
    arena.set_header(0, &head);

    tracing::debug!(
      capacity,
      head_size = head.usable_size,
      corruption_guard = self.config.corruption_guard,
      "initialized pool"
    );

    self.arena = Some(arena);
    Ok(())
  }

  /// Unmaps the arena. Every pointer handed out so far becomes dangling.
  ///
  /// # Errors
  ///
  /// A failed `munmap` is returned as [`PoolError::Release`] rather than
  /// terminating. The arena is forgotten either way.
  pub fn teardown(&mut self) -> PoolResult<()> {
    let arena = self.arena.take().ok_or(PoolError::NotInitialized)?;
    arena.unmap().map_err(PoolError::Release)
  }

  /// Allocates `size` bytes, recording the caller as the call site.
  ///
  /// Returns `None` when no free block is large enough or no arena is live.
  #[track_caller]
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Option<NonNull<u8>> {
    self.allocate_at(size, CallSite::caller())
  }

  /// Allocates `size` bytes on behalf of `site`.
  pub fn allocate_at(
    &mut self,
    size: usize,
    site: CallSite,
  ) -> Option<NonNull<u8>> {
    let guard = self.config.guard_size();

    let Some(arena) = self.arena.as_mut() else {
      tracing::warn!(size, %site, "allocation from a pool without an arena");
      return None;
    };

    let need = checked_align(size)?;

    let Some(offset) = Self::find_free_block(arena, need) else {
      tracing::debug!(size, %site, "no free block large enough");
      return None;
    };

    // SAFETY: offset was reached by walking the block list.
    let mut header = unsafe { arena.header(offset) };

    if header.actual_size - need > HEADER_SIZE + 2 * guard {
      // SAFETY: live block, and the excess was just checked.
      unsafe { block::split(arena, offset, need, guard) };
      header = unsafe { arena.header(offset) };
    }

    header.is_free = false;
    header.usable_size = size;
    header.call_site = (guard > 0).then_some(site);
    arena.set_header(offset, &header);

    let payload = offset + HEADER_SIZE + guard;
    if guard > 0 {
      arena.write_word(offset + HEADER_SIZE, SENTINEL);
      arena.write_word(payload + size, SENTINEL);
    }

    tracing::trace!(size, offset, reserved = header.actual_size, "allocated block");

    Some(arena.ptr_at(payload))
  }

  fn find_free_block(
    arena: &Arena,
    size: usize,
  ) -> Option<usize> {
    let mut current = Some(0);

    while let Some(offset) = current {
      // SAFETY: offset is the head or a `next` link.
      let header = unsafe { arena.header(offset) };
      if header.is_free && header.actual_size >= size {
        return Some(offset);
      }
      current = header.next();
    }

    None
  }

  /// Returns the block behind `ptr` to the pool and merges it with any free
  /// neighbour.
  ///
  /// Pointers outside the arena and blocks that are already free are
  /// ignored with a warning. With the corruption guard on, damaged
  /// sentinels trigger the configured [`CorruptionPolicy`](crate::CorruptionPolicy).
  ///
  /// # Safety
  ///
  /// `ptr` must have been returned by [`Pool::allocate`] on this pool, and
  /// not released since.
  pub unsafe fn release(
    &mut self,
    ptr: NonNull<u8>,
  ) {
    let guard = self.config.guard_size();
    let policy = self.config.on_corruption;

    let Some(arena) = self.arena.as_mut() else {
      tracing::warn!(?ptr, "release on a pool without an arena");
      return;
    };

    let Some(offset) = Self::find_block(arena, ptr, guard) else {
      tracing::warn!(?ptr, "release of a pointer outside the arena ignored");
      return;
    };

    // SAFETY: the caller guarantees ptr came from allocate, so a header
    // sits right before it.
    let mut header = unsafe { arena.header(offset) };

    if header.is_free {
      tracing::warn!(?ptr, offset, "release of a free block ignored");
      return;
    }

    if guard > 0 {
      let payload = offset + HEADER_SIZE + guard;
      let leading = arena.read_word(offset + HEADER_SIZE);
      let trailing = arena.read_word(payload + header.usable_size);

      if let Err(report) = guard::inspect(offset, leading, trailing, header.call_site) {
        guard::fail(report, policy);
      }
    }

    header.is_free = true;
    header.usable_size = header.actual_size;
    header.call_site = None;
    arena.set_header(offset, &header);

    // SAFETY: offset is a live block that was just marked free.
    let survivor = unsafe { block::coalesce(arena, offset, guard, MergeOrder::NextFirst) };

    tracing::trace!(offset, survivor, "released block");
  }

  fn find_block(
    arena: &Arena,
    ptr: NonNull<u8>,
    guard: usize,
  ) -> Option<usize> {
    let payload = arena.offset_of(ptr)?;
    let offset = payload.checked_sub(HEADER_SIZE + guard)?;

    (offset % WORD == 0 && offset + HEADER_SIZE <= arena.len()).then_some(offset)
  }

  /// Blocks in address order. Empty when no arena is live.
  pub fn dump_blocks(&self) -> Blocks<'_> {
    Blocks::new(self.arena.as_ref())
  }

  pub fn stats(&self) -> PoolStats {
    PoolStats::collect(self.capacity(), self.dump_blocks())
  }

  /// Emits every block as a `debug` event.
  pub fn log_blocks(&self) {
    for (i, info) in self.dump_blocks().enumerate() {
      tracing::debug!(
        block = i + 1,
        offset = info.offset,
        address = info.address,
        size = info.size,
        free = info.free,
        "pool block"
      );
    }
  }

  /// Walks the block list and checks its layout rules.
  pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
    match &self.arena {
      Some(arena) => block::verify(arena, self.config.guard_size()).map(|_| ()),
      None => Ok(()),
    }
  }
}

impl Default for Pool {
  fn default() -> Self {
    Self::new(PoolConfig::default())
  }
}
