//! The one contiguous region every block lives in.
//!
//! The arena is an anonymous private mapping obtained with `mmap(2)` and
//! returned with `munmap(2)`. It is also the only place in the crate that
//! dereferences raw memory: everything else addresses the region by offset,
//! and every offset is bounds-checked here before it turns into a pointer.

use std::{io, mem::ManuallyDrop, ptr::NonNull};

use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, c_void, mmap, munmap};

use crate::block::{BlockHeader, HEADER_SIZE};

pub(crate) struct Arena {
  base: NonNull<u8>,
  /// Bytes handed to `mmap`.
  mapped: usize,
  /// Bytes usable for blocks, `mapped` rounded down to a word.
  len: usize,
}

impl Arena {
  /// Maps `capacity` bytes of zeroed, read-write memory.
  pub fn reserve(capacity: usize) -> io::Result<Self> {
    if capacity == 0 {
      return Err(io::Error::from(io::ErrorKind::InvalidInput));
    }

    // SAFETY: anonymous mapping with no address hint, nothing is aliased.
    let address = unsafe {
      mmap(
        std::ptr::null_mut(),
        capacity,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if address == MAP_FAILED {
      return Err(io::Error::last_os_error());
    }

    let base = NonNull::new(address as *mut u8).ok_or_else(io::Error::last_os_error)?;

    tracing::debug!(?base, capacity, "mapped arena");

    Ok(Self {
      base,
      mapped: capacity,
      len: align_down!(capacity),
    })
  }

  /// Returns the region to the OS.
  pub fn unmap(self) -> io::Result<()> {
    let this = ManuallyDrop::new(self);
    // SAFETY: base/mapped are exactly what mmap returned, and `this` is
    // never used again.
    unsafe { this.unmap_in_place() }
  }

  unsafe fn unmap_in_place(&self) -> io::Result<()> {
    let result = unsafe { munmap(self.base.as_ptr() as *mut c_void, self.mapped) };
    if result == -1 {
      return Err(io::Error::last_os_error());
    }

    tracing::debug!(base = ?self.base, capacity = self.mapped, "unmapped arena");
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn base_addr(&self) -> usize {
    self.base.as_ptr() as usize
  }

  fn check(
    &self,
    offset: usize,
    size: usize,
  ) {
    let end = offset.checked_add(size);
    assert!(
      end.is_some_and(|end| end <= self.len),
      "arena access out of bounds: {offset} + {size} > {}",
      self.len
    );
  }

  /// Reads the block header stored at `offset`.
  ///
  /// # Safety
  ///
  /// A header must have been written at `offset` with [`Arena::set_header`].
  pub unsafe fn header(
    &self,
    offset: usize,
  ) -> BlockHeader {
    self.check(offset, HEADER_SIZE);
    assert_eq!(offset % align_of::<BlockHeader>(), 0, "misaligned header offset {offset}");

    unsafe { self.base.add(offset).cast::<BlockHeader>().read() }
  }

  pub fn set_header(
    &mut self,
    offset: usize,
    header: &BlockHeader,
  ) {
    self.check(offset, HEADER_SIZE);
    assert_eq!(offset % align_of::<BlockHeader>(), 0, "misaligned header offset {offset}");

    // SAFETY: in bounds, aligned, and the mapping is writable.
    unsafe { self.base.add(offset).cast::<BlockHeader>().write(*header) }
  }

  pub fn read_word(
    &self,
    offset: usize,
  ) -> u64 {
    self.check(offset, size_of::<u64>());
    // SAFETY: in bounds, and any bit pattern is a valid u64.
    unsafe { self.base.add(offset).cast::<u64>().read_unaligned() }
  }

  pub fn write_word(
    &mut self,
    offset: usize,
    value: u64,
  ) {
    self.check(offset, size_of::<u64>());
    // SAFETY: in bounds and the mapping is writable.
    unsafe { self.base.add(offset).cast::<u64>().write_unaligned(value) }
  }

  /// Pointer to `offset`. One past the end is allowed.
  pub fn ptr_at(
    &self,
    offset: usize,
  ) -> NonNull<u8> {
    self.check(offset, 0);
    // SAFETY: offset <= len, so the result stays inside the mapping or one
    // past it.
    unsafe { self.base.add(offset) }
  }

  /// Translates a pointer back to an arena offset, or `None` if it does not
  /// point into the arena.
  pub fn offset_of(
    &self,
    ptr: NonNull<u8>,
  ) -> Option<usize> {
    let address = ptr.as_ptr() as usize;
    let base = self.base_addr();

    (base..=base + self.len)
      .contains(&address)
      .then(|| address - base)
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    // SAFETY: drop runs once, after which the mapping is unreachable.
    if let Err(err) = unsafe { self.unmap_in_place() } {
      tracing::warn!(%err, "failed to unmap arena on drop");
    }
  }
}
