//! Corruption guard: sentinels around every payload and the call site of
//! the allocation that owns them.
//!
//! ```text
//!   Guarded block:
//!   ┌──────────────┬──────────┬───────────────────────────┬──────────┐
//!   │ Block Header │ SENTINEL │   payload (usable_size)   │ SENTINEL │
//!   └──────────────┴──────────┴───────────────────────────┴──────────┘
//!                             ▲                           ▲
//!                             │                           └── payload + usable_size
//!                             └── pointer returned to user
//! ```
//!
//! Both sentinels are checked on release, before the block is touched. A
//! mismatch means something wrote outside its payload and the heap can no
//! longer be trusted.

use std::{fmt, panic::Location};

/// Value written on both sides of a guarded payload.
pub const SENTINEL: u64 = 0xCAFE_BABE_CAFE_BABE;

/// Bytes reserved for one sentinel.
pub const SENTINEL_SIZE: usize = ::core::mem::size_of::<u64>();

/// Where an allocation was requested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
  pub file: &'static str,
  pub line: u32,
}

impl CallSite {
  pub const fn new(
    file: &'static str,
    line: u32,
  ) -> Self {
    Self { file, line }
  }

  /// Location of the caller of the function this is invoked from.
  #[track_caller]
  pub fn caller() -> Self {
    Location::caller().into()
  }
}

impl From<&'static Location<'static>> for CallSite {
  fn from(location: &'static Location<'static>) -> Self {
    Self::new(location.file(), location.line())
  }
}

impl fmt::Display for CallSite {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "{}:{}", self.file, self.line)
  }
}

/// Expands to the [`CallSite`] of the macro invocation.
///
/// ```rust
/// use rpool::{CallSite, call_site};
///
/// let site: CallSite = call_site!();
/// assert_eq!(site.file, file!());
/// ```
#[macro_export]
macro_rules! call_site {
  () => {
    $crate::CallSite::new(file!(), line!())
  };
}

/// What to do once a sentinel mismatch has been found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorruptionPolicy {
  /// Report on stderr and abort the process.
  #[default]
  Abort,
  /// Panic with the report. The arena is left exactly as it was found.
  Panic,
}

/// Which of the two sentinels was overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
  Leading,
  Trailing,
}

impl fmt::Display for Side {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match self {
      Side::Leading => f.write_str("leading"),
      Side::Trailing => f.write_str("trailing"),
    }
  }
}

/// Details of a detected corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptionReport {
  /// Arena offset of the damaged block's header.
  pub offset: usize,
  pub side: Side,
  pub found: u64,
  pub call_site: Option<CallSite>,
}

impl fmt::Display for CorruptionReport {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(
      f,
      "memory corruption detected: {} sentinel of block at offset {} is {:#x}, expected {:#x}",
      self.side, self.offset, self.found, SENTINEL
    )?;
    match self.call_site {
      Some(site) => write!(f, "; allocated at {site}"),
      None => f.write_str("; allocation site unknown"),
    }
  }
}

/// Compares the two sentinel values read from a block.
pub(crate) fn inspect(
  offset: usize,
  leading: u64,
  trailing: u64,
  call_site: Option<CallSite>,
) -> Result<(), CorruptionReport> {
  let (side, found) = if leading != SENTINEL {
    (Side::Leading, leading)
  } else if trailing != SENTINEL {
    (Side::Trailing, trailing)
  } else {
    return Ok(());
  };

  Err(CorruptionReport {
    offset,
    side,
    found,
    call_site,
  })
}

/// Terminates according to `policy`. Never returns.
pub(crate) fn fail(
  report: CorruptionReport,
  policy: CorruptionPolicy,
) -> ! {
  tracing::error!(
    offset = report.offset,
    side = %report.side,
    call_site = ?report.call_site,
    "sentinel mismatch on release"
  );

  match policy {
    CorruptionPolicy::Abort => {
      eprintln!("{report}");
      std::process::abort()
    }
    CorruptionPolicy::Panic => panic!("{report}"),
  }
}
