use crate::guard::{CorruptionPolicy, SENTINEL_SIZE};

/// Construction-time options of a [`Pool`](crate::Pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
  /// Bracket every payload with sentinels and record the call site.
  pub corruption_guard: bool,
  /// Reaction to a sentinel mismatch. Ignored without the guard.
  pub on_corruption: CorruptionPolicy,
}

impl PoolConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_corruption_guard(
    mut self,
    enabled: bool,
  ) -> Self {
    self.corruption_guard = enabled;
    self
  }

  pub fn with_policy(
    mut self,
    policy: CorruptionPolicy,
  ) -> Self {
    self.on_corruption = policy;
    self
  }

  /// Bytes taken by one sentinel in this configuration, zero without guard.
  pub fn guard_size(&self) -> usize {
    if self.corruption_guard { SENTINEL_SIZE } else { 0 }
  }
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      corruption_guard: cfg!(feature = "corruption-guard"),
      on_corruption: CorruptionPolicy::Abort,
    }
  }
}
