//! Virtual memory backend.
//!
//! The virtual stack allocator reserves address space once and then commits and
//! decommits page ranges inside it. [`VirtualMemory`] is the capability it
//! needs; [`OsVirtualMemory`] provides it on unix via `mmap`/`mprotect`.

use crate::span::{Span, align_down, align_up};

/// Page-granular reserve/commit/decommit/release.
///
/// # Safety
///
/// Implementations must return page-aligned reservations from
/// [`reserve`](VirtualMemory::reserve), and after a successful
/// [`commit`](VirtualMemory::commit) the range must be readable and writable
/// until it is decommitted or released.
pub unsafe trait VirtualMemory {
  fn page_size(&self) -> usize;

  /// Alignment of reservations. Equal to the page size unless the platform
  /// reserves at a coarser granularity.
  fn page_alignment(&self) -> usize {
    self.page_size()
  }

  /// Reserves `size` bytes of address space without backing them. Returns the
  /// null span on failure.
  fn reserve(&self, size: usize) -> Span;

  /// Backs `span` with memory.
  ///
  /// # Safety
  ///
  /// `span` must be page-aligned and inside a live reservation.
  unsafe fn commit(&self, span: Span) -> bool;

  /// Drops the backing of `span`; its contents are lost.
  ///
  /// # Safety
  ///
  /// `span` must be page-aligned and inside a live reservation; nothing in it
  /// may be used afterwards.
  unsafe fn decommit(&self, span: Span) -> bool;

  /// Returns a whole reservation to the OS.
  ///
  /// # Safety
  ///
  /// `span` must be exactly a span returned by `reserve` on this backend.
  unsafe fn release(&self, span: Span) -> bool;

  #[inline]
  fn page_floor(&self, x: usize) -> usize {
    align_down(x, self.page_size())
  }

  #[inline]
  fn page_ceil(&self, x: usize) -> usize {
    align_up(x, self.page_size())
  }
}

unsafe impl<V: VirtualMemory + ?Sized> VirtualMemory for &V {
  fn page_size(&self) -> usize {
    (**self).page_size()
  }

  fn page_alignment(&self) -> usize {
    (**self).page_alignment()
  }

  fn reserve(&self, size: usize) -> Span {
    (**self).reserve(size)
  }

  unsafe fn commit(&self, span: Span) -> bool {
    unsafe { (**self).commit(span) }
  }

  unsafe fn decommit(&self, span: Span) -> bool {
    unsafe { (**self).decommit(span) }
  }

  unsafe fn release(&self, span: Span) -> bool {
    unsafe { (**self).release(span) }
  }
}

// =============================================================================
// Platform
// =============================================================================

/// The operating system's virtual memory, through `libc`.
#[cfg(unix)]
#[derive(Clone, Copy, Debug, Default)]
pub struct OsVirtualMemory;

#[cfg(unix)]
fn os_page_size() -> usize {
  use std::sync::OnceLock;

  static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
  *PAGE_SIZE.get_or_init(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size < 1 { 4096 } else { size as usize }
  })
}

#[cfg(unix)]
unsafe impl VirtualMemory for OsVirtualMemory {
  #[inline]
  fn page_size(&self) -> usize {
    os_page_size()
  }

  fn reserve(&self, size: usize) -> Span {
    if size == 0 {
      return Span::null();
    }

    let ptr = unsafe {
      libc::mmap(
        core::ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
      )
    };

    if ptr == libc::MAP_FAILED {
      log::debug!("mmap reserve of {size} bytes failed");
      Span::null()
    } else {
      log::trace!("reserved {size} bytes at {ptr:p}");
      Span::new(ptr.cast(), size)
    }
  }

  unsafe fn commit(&self, span: Span) -> bool {
    debug_assert!(span.begin() % self.page_size() == 0);
    let rc = unsafe {
      libc::mprotect(
        span.as_ptr().cast(),
        span.len(),
        libc::PROT_READ | libc::PROT_WRITE,
      )
    };
    rc == 0
  }

  unsafe fn decommit(&self, span: Span) -> bool {
    debug_assert!(span.begin() % self.page_size() == 0);
    // Pages read back as zero once recommitted.
    #[cfg(feature = "release-mem")]
    unsafe {
      libc::madvise(span.as_ptr().cast(), span.len(), libc::MADV_DONTNEED);
    }
    let rc = unsafe { libc::mprotect(span.as_ptr().cast(), span.len(), libc::PROT_NONE) };
    rc == 0
  }

  unsafe fn release(&self, span: Span) -> bool {
    let rc = unsafe { libc::munmap(span.as_ptr().cast(), span.len()) };
    log::trace!("released {} bytes at {:p}", span.len(), span.as_ptr());
    rc == 0
  }
}
