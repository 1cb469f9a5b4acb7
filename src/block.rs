//! Block headers and the structural operations on the block list.
//!
//! Every chunk of the arena starts with a [`BlockHeader`]. Headers link to
//! their address-order neighbours by arena offset, so the whole arena is
//! one doubly linked list:
//!
//! ```text
//!   offset 0                                                    arena end
//!   ┌────────┬─────────┬────────┬──────────────┬────────┬───────────┐
//!   │ header │ payload │ header │   payload    │ header │  payload  │
//!   └────────┴─────────┴────────┴──────────────┴────────┴───────────┘
//!       │ ▲                │ ▲                     │
//!       │ └──── prev ──────┘ └──────── prev ───────┘
//!       └────── next ──────▶ └──────── next ───────▶
//! ```
//!
//! The functions here only reshape the list. Whether to split or merge is
//! decided by the pool.

use std::mem;

use crate::{arena::Arena, error::InvariantViolation, guard::CallSite};

/// Marks a missing neighbour in `next` / `prev`.
const NIL: usize = usize::MAX;

/// Bytes occupied by a header inside the arena.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

const _: () = assert!(HEADER_SIZE % mem::size_of::<usize>() == 0);
const _: () = assert!(mem::align_of::<BlockHeader>() <= mem::size_of::<usize>());

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHeader {
  /// Bytes the caller may use. Equal to `actual_size` while free.
  pub usable_size: usize,
  /// Bytes reserved for the payload, word aligned.
  pub actual_size: usize,
  next: usize,
  prev: usize,
  /// Only recorded when the corruption guard is on. The slot is present in
  /// unguarded pools as well and counts toward [`HEADER_SIZE`].
  pub call_site: Option<CallSite>,
  pub is_free: bool,
}

impl BlockHeader {
  pub fn free(
    size: usize,
    prev: Option<usize>,
    next: Option<usize>,
  ) -> Self {
    Self {
      usable_size: size,
      actual_size: size,
      next: next.unwrap_or(NIL),
      prev: prev.unwrap_or(NIL),
      call_site: None,
      is_free: true,
    }
  }

  pub fn next(&self) -> Option<usize> {
    (self.next != NIL).then_some(self.next)
  }

  pub fn prev(&self) -> Option<usize> {
    (self.prev != NIL).then_some(self.prev)
  }

  pub fn set_next(
    &mut self,
    next: Option<usize>,
  ) {
    self.next = next.unwrap_or(NIL);
  }

  pub fn set_prev(
    &mut self,
    prev: Option<usize>,
  ) {
    self.prev = prev.unwrap_or(NIL);
  }

  /// Bytes from this header to the next one.
  pub fn span(
    &self,
    guard: usize,
  ) -> usize {
    HEADER_SIZE + self.actual_size + 2 * guard
  }
}

/// Order in which a released block is merged with its neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeOrder {
  NextFirst,
  #[cfg(test)]
  PrevFirst,
}

/// Cuts the block at `offset` down to `size` payload bytes and links the
/// remainder in after it as a new free block.
///
/// # Safety
///
/// `offset` must be a live block whose `actual_size` exceeds
/// `size + HEADER_SIZE + 2 * guard`.
pub(crate) unsafe fn split(
  arena: &mut Arena,
  offset: usize,
  size: usize,
  guard: usize,
) -> usize {
  let mut current = unsafe { arena.header(offset) };
  debug_assert!(current.actual_size > size + HEADER_SIZE + 2 * guard);

  let tail_offset = offset + HEADER_SIZE + size + 2 * guard;
  let tail_size = current.actual_size - size - HEADER_SIZE - 2 * guard;
  let tail = BlockHeader::free(tail_size, Some(offset), current.next());

  if let Some(after) = current.next() {
    let mut following = unsafe { arena.header(after) };
    following.set_prev(Some(tail_offset));
    arena.set_header(after, &following);
  }

  current.set_next(Some(tail_offset));
  current.actual_size = size;
  current.usable_size = size;

  arena.set_header(tail_offset, &tail);
  arena.set_header(offset, &current);

  tracing::trace!(offset, size, tail_offset, tail_size, "split block");

  tail_offset
}

/// Folds the block following `offset` into it if that block is free.
/// Returns whether a merge happened.
///
/// # Safety
///
/// `offset` must be a live, free block.
pub(crate) unsafe fn absorb_next(
  arena: &mut Arena,
  offset: usize,
  guard: usize,
) -> bool {
  let mut current = unsafe { arena.header(offset) };

  let Some(next_offset) = current.next() else {
    return false;
  };

  let next = unsafe { arena.header(next_offset) };
  if !next.is_free {
    return false;
  }

  current.actual_size += next.span(guard);
  current.usable_size = current.actual_size;
  current.set_next(next.next());

  if let Some(after) = next.next() {
    let mut following = unsafe { arena.header(after) };
    following.set_prev(Some(offset));
    arena.set_header(after, &following);
  }

  arena.set_header(offset, &current);

  tracing::trace!(offset, absorbed = next_offset, size = current.actual_size, "merged blocks");

  true
}

/// Merges the free block at `offset` with whichever neighbours are free.
/// Returns the offset of the surviving block.
///
/// # Safety
///
/// `offset` must be a live block that has just been marked free.
pub(crate) unsafe fn coalesce(
  arena: &mut Arena,
  offset: usize,
  guard: usize,
  order: MergeOrder,
) -> usize {
  unsafe {
    match order {
      MergeOrder::NextFirst => {
        absorb_next(arena, offset, guard);
        merge_into_prev(arena, offset, guard)
      }
      #[cfg(test)]
      MergeOrder::PrevFirst => {
        let survivor = merge_into_prev(arena, offset, guard);
        absorb_next(arena, survivor, guard);
        survivor
      }
    }
  }
}

unsafe fn merge_into_prev(
  arena: &mut Arena,
  offset: usize,
  guard: usize,
) -> usize {
  unsafe {
    let current = arena.header(offset);
    match current.prev() {
      Some(prev) if arena.header(prev).is_free => {
        absorb_next(arena, prev, guard);
        prev
      }
      _ => offset,
    }
  }
}

/// Walks the whole list and checks the layout invariants: back links match,
/// blocks tile the arena without gaps, and no two neighbours are both free.
/// Returns the number of blocks.
pub(crate) fn verify(
  arena: &Arena,
  guard: usize,
) -> Result<usize, InvariantViolation> {
  let mut offset = 0;
  let mut prev: Option<usize> = None;
  let mut prev_free = false;
  let mut count = 0;
  let limit = arena.len() / HEADER_SIZE + 1;

  loop {
    if offset + HEADER_SIZE > arena.len() {
      return Err(InvariantViolation::OutOfBounds { offset });
    }

    // SAFETY: offset is in bounds and was reached through the list.
    let header = unsafe { arena.header(offset) };
    count += 1;

    if count > limit {
      return Err(InvariantViolation::Cycle { offset });
    }
    if header.prev() != prev {
      return Err(InvariantViolation::BackLink {
        offset,
        expected: prev,
        found: header.prev(),
      });
    }
    if header.is_free && prev_free {
      return Err(InvariantViolation::AdjacentFree { offset });
    }
    if header.is_free && header.usable_size != header.actual_size {
      return Err(InvariantViolation::FreeSizeMismatch { offset });
    }
    if header.usable_size > header.actual_size {
      return Err(InvariantViolation::Oversized { offset });
    }

    let end = offset + header.span(guard);
    match header.next() {
      Some(next) if next == end => {
        prev = Some(offset);
        prev_free = header.is_free;
        offset = next;
      }
      Some(next) => {
        return Err(InvariantViolation::Gap {
          offset,
          expected: end,
          found: next,
        });
      }
      None if end == arena.len() => return Ok(count),
      None => {
        return Err(InvariantViolation::Gap {
          offset,
          expected: arena.len(),
          found: end,
        });
      }
    }
  }
}
