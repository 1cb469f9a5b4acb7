/// Size of a machine word. Every block header, reservation and payload in
/// the arena starts on a multiple of this.
pub const WORD: usize = ::core::mem::size_of::<usize>();

/// Rounds the given size up to the next machine word.
///
/// # Examples
///
/// ```rust
/// use rpool::align;
///
/// match std::mem::size_of::<usize>() {
///     8 => assert_eq!(align!(13), 16), // 64 bit machine.
///     4 => assert_eq!(align!(11), 12), // 32 bit machine.
///     _ => {},
/// };
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    ($value + ::core::mem::size_of::<usize>() - 1) & !(::core::mem::size_of::<usize>() - 1)
  };
}

/// Rounds the given size down to a machine word.
///
/// ```rust
/// use rpool::align_down;
///
/// let word = std::mem::size_of::<usize>();
/// assert_eq!(align_down!(word * 3 + 1), word * 3);
/// ```
#[macro_export]
macro_rules! align_down {
  ($value:expr) => {
    $value & !(::core::mem::size_of::<usize>() - 1)
  };
}

/// Checked variant of [`align!`] for sizes that come from callers.
pub(crate) fn checked_align(size: usize) -> Option<usize> {
  size.checked_add(WORD - 1).map(|v| v & !(WORD - 1))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_align() {
    let mut alignments = Vec::new();

    for i in 0..10 {
      let sizes = (WORD * i + 1)..=(WORD * (i + 1));

      let expected_alignment = WORD * (i + 1);

      alignments.push((sizes, expected_alignment));
    }

    for (sizes, expected) in alignments {
      for size in sizes {
        assert_eq!(expected, align!(size));
        assert_eq!(Some(expected), checked_align(size));
      }
    }
  }

  #[test]
  fn test_align_down() {
    assert_eq!(align_down!(0usize), 0);
    assert_eq!(align_down!(WORD - 1), 0);
    assert_eq!(align_down!(WORD), WORD);
    assert_eq!(align_down!(1024usize + 3), 1024);
  }

  #[test]
  fn test_checked_align_overflow() {
    assert_eq!(checked_align(0), Some(0));
    assert_eq!(checked_align(usize::MAX), None);
  }
}
