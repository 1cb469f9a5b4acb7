use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
  #[error("failed to reserve arena from the OS: {0}")]
  Reserve(#[source] io::Error),

  #[error("failed to return arena to the OS: {0}")]
  Release(#[source] io::Error),

  #[error("arena is already initialized")]
  AlreadyInitialized,

  #[error("arena is not initialized")]
  NotInitialized,

  #[error("capacity of {requested} bytes cannot hold a single block, need at least {minimum}")]
  CapacityTooSmall { requested: usize, minimum: usize },
}

pub type PoolResult<T> = Result<T, PoolError>;

/// A broken layout rule found while walking the block list.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InvariantViolation {
  #[error("block header at offset {offset} does not fit in the arena")]
  OutOfBounds { offset: usize },

  #[error("block list loops back on itself at offset {offset}")]
  Cycle { offset: usize },

  #[error("block at offset {offset} links back to {found:?}, expected {expected:?}")]
  BackLink {
    offset: usize,
    expected: Option<usize>,
    found: Option<usize>,
  },

  #[error("block at offset {offset} should be followed at {expected}, found {found}")]
  Gap {
    offset: usize,
    expected: usize,
    found: usize,
  },

  #[error("free blocks at offset {offset} and before it were not merged")]
  AdjacentFree { offset: usize },

  #[error("free block at offset {offset} reports a usable size different from its reservation")]
  FreeSizeMismatch { offset: usize },

  #[error("block at offset {offset} reports more usable bytes than it reserves")]
  Oversized { offset: usize },
}
