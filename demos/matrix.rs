//! Matrix multiplication stress workload.
//!
//! Builds pairs of identity matrices row by row, multiplies them and checks
//! that the product is the identity again. Products are kept alive for two
//! rounds before being released, so allocations of different sizes
//! interleave and the pool has to split and merge constantly.
//!
//! ```text
//!   cargo run --example matrix -- --backend pool --matrix-size 64 --rounds 16
//!   RUST_LOG=rpool=trace cargo run --example matrix -- --guard
//! ```

use std::{collections::VecDeque, mem, process::ExitCode, ptr::NonNull};

use clap::Parser;
use rpool::{Backend, CallSite, MemorySource, PoolConfig, call_site, open_source};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(about = "Drive a memory source with identity matrix products")]
struct Args {
  /// Memory source to allocate from: `pool` or `system`.
  #[arg(long, default_value_t = Backend::Pool)]
  backend: Backend,

  /// Arena size in bytes for the pool backend.
  #[arg(long, default_value_t = 64 * 1024 * 1024)]
  capacity: usize,

  /// Base edge length of the matrices. Each round varies it a little.
  #[arg(long, default_value_t = 64)]
  matrix_size: usize,

  /// Number of products to build.
  #[arg(long, default_value_t = 8)]
  rounds: usize,

  /// Bracket payloads with sentinels and record call sites.
  #[arg(long)]
  guard: bool,
}

/// Square matrix stored as a table of separately allocated rows.
struct Matrix {
  rows: NonNull<NonNull<i32>>,
  size: usize,
}

impl Matrix {
  fn zeroed(
    source: &mut dyn MemorySource,
    size: usize,
    site: CallSite,
  ) -> Option<Self> {
    let rows = source.acquire(size * mem::size_of::<NonNull<i32>>(), site)?.cast();

    for i in 0..size {
      let Some(row) = source.acquire(size * mem::size_of::<i32>(), site) else {
        unsafe { Self::release_rows(source, rows, i) };
        return None;
      };

      let row = row.cast::<i32>();
      unsafe {
        row.as_ptr().write_bytes(0, size);
        rows.add(i).write(row);
      }
    }

    Some(Self { rows, size })
  }

  fn identity(
    source: &mut dyn MemorySource,
    size: usize,
  ) -> Option<Self> {
    let mut matrix = Self::zeroed(source, size, call_site!())?;
    for i in 0..size {
      matrix.set(i, i, 1);
    }
    Some(matrix)
  }

  fn get(
    &self,
    i: usize,
    j: usize,
  ) -> i32 {
    assert!(i < self.size && j < self.size);
    unsafe { self.rows.add(i).read().add(j).read() }
  }

  fn set(
    &mut self,
    i: usize,
    j: usize,
    value: i32,
  ) {
    assert!(i < self.size && j < self.size);
    unsafe { self.rows.add(i).read().add(j).write(value) }
  }

  fn multiply(
    &self,
    other: &Matrix,
    source: &mut dyn MemorySource,
  ) -> Option<Matrix> {
    let size = self.size;
    let mut result = Self::zeroed(source, size, call_site!())?;

    for i in 0..size {
      for j in 0..size {
        let sum = (0..size).map(|k| self.get(i, k) * other.get(k, j)).sum();
        result.set(i, j, sum);
      }
    }

    Some(result)
  }

  fn is_identity(&self) -> bool {
    (0..self.size).all(|i| (0..self.size).all(|j| self.get(i, j) == i32::from(i == j)))
  }

  unsafe fn release_rows(
    source: &mut dyn MemorySource,
    rows: NonNull<NonNull<i32>>,
    count: usize,
  ) {
    unsafe {
      for i in 0..count {
        source.release(rows.add(i).read().cast());
      }
      source.release(rows.cast());
    }
  }

  /// # Safety
  ///
  /// `source` must be the one the matrix was built from.
  unsafe fn free(
    self,
    source: &mut dyn MemorySource,
  ) {
    unsafe { Self::release_rows(source, self.rows, self.size) }
  }
}

struct MatrixProduct {
  a: Matrix,
  b: Matrix,
  ab: Matrix,
}

impl MatrixProduct {
  fn build(
    source: &mut dyn MemorySource,
    size: usize,
  ) -> Option<Self> {
    let a = Matrix::identity(source, size)?;

    let Some(b) = Matrix::identity(source, size) else {
      unsafe { a.free(source) };
      return None;
    };

    let Some(ab) = a.multiply(&b, source) else {
      unsafe {
        a.free(source);
        b.free(source);
      }
      return None;
    };

    Some(Self { a, b, ab })
  }

  fn verify(&self) -> bool {
    self.a.is_identity() && self.b.is_identity() && self.ab.is_identity()
  }

  unsafe fn destroy(
    self,
    source: &mut dyn MemorySource,
  ) {
    unsafe {
      self.a.free(source);
      self.b.free(source);
      self.ab.free(source);
    }
  }
}

fn main() -> ExitCode {
  fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();
  let config = PoolConfig::new().with_corruption_guard(args.guard);

  let mut source = match open_source(args.backend, args.capacity, config) {
    Ok(source) => source,
    Err(err) => {
      tracing::error!(%err, "cannot open memory source");
      return ExitCode::FAILURE;
    }
  };

  let mut pending = VecDeque::new();
  let mut failures = 0;

  for round in 0..args.rounds {
    let size = args.matrix_size + (round * 13) % (args.matrix_size / 2 + 1);

    match MatrixProduct::build(source.as_mut(), size) {
      Some(product) if product.verify() => {
        tracing::info!(round, size, "product is identity");
        pending.push_back(product);
      }
      Some(product) => {
        tracing::error!(round, size, "product is not identity");
        failures += 1;
        unsafe { product.destroy(source.as_mut()) };
      }
      None => {
        tracing::warn!(round, size, backend = source.name(), "out of memory building product");
        failures += 1;
      }
    }

    if pending.len() > 2 {
      if let Some(old) = pending.pop_front() {
        unsafe { old.destroy(source.as_mut()) };
      }
    }

    if let Some(stats) = source.stats() {
      tracing::debug!(
        round,
        blocks = stats.block_count,
        free_bytes = stats.free_bytes,
        fragmentation = stats.fragmentation(),
        "pool after round"
      );
    }
  }

  for product in pending.drain(..) {
    unsafe { product.destroy(source.as_mut()) };
  }

  if let Some(stats) = source.stats() {
    tracing::info!(
      blocks = stats.block_count,
      free_bytes = stats.free_bytes,
      largest_free = stats.largest_free,
      "pool after workload"
    );
  }

  if failures > 0 {
    tracing::error!(failures, rounds = args.rounds, "workload failed");
    return ExitCode::FAILURE;
  }

  ExitCode::SUCCESS
}
