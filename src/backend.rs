//! Choosing where a workload gets its memory from.
//!
//! Consumers talk to a [`MemorySource`] rather than to [`Pool`] directly, so
//! the same workload can run against the pool or against the platform
//! allocator for comparison.

use std::{
  alloc::{GlobalAlloc, Layout, System},
  fmt,
  ptr::NonNull,
  str::FromStr,
};

use thiserror::Error;

use crate::{
  align::WORD,
  config::PoolConfig,
  error::PoolResult,
  guard::CallSite,
  inspect::PoolStats,
  pool::Pool,
};

/// Anything that hands out and takes back raw byte blocks.
pub trait MemorySource {
  fn name(&self) -> &'static str;

  /// Returns a word aligned block of at least `size` bytes, or `None` when
  /// the source is exhausted.
  fn acquire(
    &mut self,
    size: usize,
    site: CallSite,
  ) -> Option<NonNull<u8>>;

  /// # Safety
  ///
  /// `ptr` must come from `acquire` on this source and not have been
  /// released yet.
  unsafe fn release(
    &mut self,
    ptr: NonNull<u8>,
  );

  /// Block statistics, if the source keeps any.
  fn stats(&self) -> Option<PoolStats> {
    None
  }
}

impl MemorySource for Pool {
  fn name(&self) -> &'static str {
    "pool"
  }

  fn acquire(
    &mut self,
    size: usize,
    site: CallSite,
  ) -> Option<NonNull<u8>> {
    self.allocate_at(size, site)
  }

  unsafe fn release(
    &mut self,
    ptr: NonNull<u8>,
  ) {
    unsafe { Pool::release(self, ptr) }
  }

  fn stats(&self) -> Option<PoolStats> {
    Some(Pool::stats(self))
  }
}

/// The platform allocator. Each block carries its size in a prefix so it
/// can be released from the pointer alone.
#[derive(Debug, Default)]
pub struct SystemSource {
  live: usize,
}

impl SystemSource {
  const PREFIX: usize = 2 * WORD;

  pub fn new() -> Self {
    Self::default()
  }

  /// Blocks acquired and not yet released.
  pub fn live(&self) -> usize {
    self.live
  }
}

impl MemorySource for SystemSource {
  fn name(&self) -> &'static str {
    "system"
  }

  fn acquire(
    &mut self,
    size: usize,
    _site: CallSite,
  ) -> Option<NonNull<u8>> {
    let total = size.checked_add(Self::PREFIX)?;
    let layout = Layout::from_size_align(total, Self::PREFIX).ok()?;

    // SAFETY: layout has a non-zero size.
    let base = NonNull::new(unsafe { System.alloc(layout) })?;

    self.live += 1;

    // SAFETY: the block is at least PREFIX bytes and PREFIX aligned.
    unsafe {
      base.cast::<usize>().write(total);
      Some(base.add(Self::PREFIX))
    }
  }

  unsafe fn release(
    &mut self,
    ptr: NonNull<u8>,
  ) {
    unsafe {
      let base = ptr.sub(Self::PREFIX);
      let total = base.cast::<usize>().read();
      let layout = Layout::from_size_align_unchecked(total, Self::PREFIX);
      System.dealloc(base.as_ptr(), layout);
    }

    self.live -= 1;
  }
}

/// Which allocator a workload should run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
  #[default]
  Pool,
  System,
}

#[derive(Debug, Error)]
#[error("unknown backend `{0}`, expected `pool` or `system`")]
pub struct UnknownBackend(pub String);

impl FromStr for Backend {
  type Err = UnknownBackend;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "pool" => Ok(Backend::Pool),
      "system" => Ok(Backend::System),
      _ => Err(UnknownBackend(s.to_string())),
    }
  }
}

impl fmt::Display for Backend {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match self {
      Backend::Pool => f.write_str("pool"),
      Backend::System => f.write_str("system"),
    }
  }
}

/// Builds the memory source selected by `backend`. `capacity` and `config`
/// only matter for [`Backend::Pool`].
pub fn open_source(
  backend: Backend,
  capacity: usize,
  config: PoolConfig,
) -> PoolResult<Box<dyn MemorySource>> {
  tracing::info!(%backend, capacity, "opening memory source");

  Ok(match backend {
    Backend::Pool => Box::new(Pool::with_capacity(capacity, config)?),
    Backend::System => Box::new(SystemSource::new()),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::call_site;

  fn exercise(source: &mut dyn MemorySource) {
    let mut blocks = Vec::new();

    for (i, size) in [1usize, 7, 64, 300].into_iter().enumerate() {
      let ptr = source.acquire(size, call_site!()).unwrap();
      assert_eq!(ptr.as_ptr() as usize % WORD, 0);

      unsafe { ptr.as_ptr().write_bytes(i as u8, size) };
      blocks.push((ptr, size, i as u8));
    }

    for (ptr, size, fill) in &blocks {
      let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), *size) };
      assert!(bytes.iter().all(|b| b == fill));
    }

    for (ptr, _, _) in blocks {
      unsafe { source.release(ptr) };
    }
  }

  #[test]
  fn test_pool_source() {
    let mut source = open_source(Backend::Pool, 4096, PoolConfig::default()).unwrap();
    assert_eq!(source.name(), "pool");

    exercise(source.as_mut());

    let stats = source.stats().unwrap();
    assert_eq!(stats.block_count, 1);
  }

  #[test]
  fn test_system_source() {
    let mut source = SystemSource::new();
    exercise(&mut source);

    assert_eq!(source.live(), 0);
    assert!(MemorySource::stats(&source).is_none());
  }

  #[test]
  fn test_parse_backend() {
    assert_eq!("pool".parse::<Backend>().unwrap(), Backend::Pool);
    assert_eq!("SYSTEM".parse::<Backend>().unwrap(), Backend::System);

    let err = "jemalloc".parse::<Backend>().unwrap_err();
    assert!(err.to_string().contains("jemalloc"));
  }
}
