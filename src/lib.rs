//! # rpool - A First-Fit Pool Allocator
//!
//! This crate provides a **pool allocator** that reserves one contiguous
//! arena from the operating system with `mmap(2)` and serves any number of
//! allocate/release calls out of it.
//!
//! ## Overview
//!
//! The arena is carved into variable-size blocks. Each block starts with a
//! header, and the headers form a doubly linked list in address order:
//!
//! ```text
//!   Pool Allocator Concept:
//!
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │                         ARENA (one mmap)                             │
//!   │                                                                      │
//!   │   ┌────┬──────┬────┬──────────┬────┬────┬────┬───────────────────┐   │
//!   │   │ H  │ used │ H  │   free   │ H  │used│ H  │       free        │   │
//!   │   └────┴──────┴────┴──────────┴────┴────┴────┴───────────────────┘   │
//!   │     │           ▲                                                    │
//!   │     └── next ───┘  ... first fit walks left to right                 │
//!   │                                                                      │
//!   └──────────────────────────────────────────────────────────────────────┘
//!
//!   Allocation takes the first free block that is large enough and splits
//!   off the remainder. Release merges the block with free neighbours.
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   rpool
//!   ├── align      - Word alignment macros (align!, align_down!)
//!   ├── arena      - mmap'd region and bounds-checked access (internal)
//!   ├── block      - Block headers, split and merge (internal)
//!   ├── pool       - Pool: initialize, allocate, release, teardown
//!   ├── guard      - Sentinels and call sites for corruption detection
//!   ├── inspect    - Block iteration and statistics
//!   ├── config     - PoolConfig
//!   ├── backend    - MemorySource trait and backend selection
//!   └── error      - PoolError, InvariantViolation
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use rpool::{Pool, PoolConfig};
//!
//! let mut pool = Pool::with_capacity(1024, PoolConfig::default()).unwrap();
//!
//! let ptr = pool.allocate(4).unwrap().cast::<i32>();
//! unsafe {
//!     ptr.write(10);
//!     assert_eq!(ptr.read(), 10);
//!     pool.release(ptr.cast());
//! }
//!
//! let blocks: Vec<_> = pool.dump_blocks().collect();
//! assert_eq!(blocks.len(), 1);
//! assert!(blocks[0].free);
//!
//! pool.teardown().unwrap();
//! ```
//!
//! ## How It Works
//!
//! A block on its way through an allocation:
//!
//! ```text
//!   Split:
//!   ┌────────┬──────────────────────────────────────────┐
//!   │ header │              free (N bytes)              │
//!   └────────┴──────────────────────────────────────────┘
//!                            │ allocate(S)
//!                            ▼
//!   ┌────────┬────────────┬────────┬────────────────────┐
//!   │ header │ used (S)   │ header │ free (N - S - H)   │
//!   └────────┴────────────┴────────┴────────────────────┘
//!            ▲
//!            └── pointer returned to user
//! ```
//!
//! If what would remain after the split is not more than a header, the
//! whole block is handed out instead.
//!
//! ## Corruption Guard
//!
//! With [`PoolConfig::corruption_guard`] set, every payload is bracketed by
//! two sentinel words and the allocation's file and line are stored in the
//! header. Release checks both sentinels and, on a mismatch, reports the
//! allocation site and aborts (or panics, see [`CorruptionPolicy`]). The
//! `corruption-guard` cargo feature turns the guard on by default.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: `Pool` is neither `Send` nor `Sync`
//! - **Fixed size**: the arena never grows, exhaustion returns `None`
//! - **No compaction**: free space split across distant blocks stays split
//! - **Unix-only**: requires `libc` and `mmap`
//!
//! ## Safety
//!
//! Allocation is safe. Writing through the returned pointers and releasing
//! them is `unsafe`: the pool trusts that a released pointer is one it
//! handed out.

#[macro_use]
pub mod align;
mod arena;
pub mod backend;
mod block;
pub mod config;
pub mod error;
pub mod guard;
pub mod inspect;
mod pool;

pub use backend::{Backend, MemorySource, SystemSource, open_source};
pub use block::HEADER_SIZE;
pub use config::PoolConfig;
pub use error::{InvariantViolation, PoolError, PoolResult};
pub use guard::{CallSite, CorruptionPolicy, CorruptionReport, SENTINEL, SENTINEL_SIZE};
pub use inspect::{BlockInfo, Blocks, PoolStats};
pub use pool::Pool;
