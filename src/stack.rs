//! Linear allocation over a virtual memory reservation that is committed on
//! demand.
//!
//! ```text
//!   virtual_span (reserved once, released on drop)
//!   ┌──────────────────────────┬──────────┬──────────────────────────────┐
//!   │        allocated         │ committed│         reserved only        │
//!   └──────────────────────────┴──────────┴──────────────────────────────┘
//!   ▲ base                     ▲          ▲                              ▲ end
//!                              │          └─ uncommitted_span begins
//!                              └─ unallocated_span begins
//!
//!   Commits happen in whole `granularity` units, so the committed prefix is
//!   always a multiple of it and never shorter than the allocated prefix.
//! ```

use core::ops::{Deref, DerefMut};

use crate::{
  Allocator, DeallocateAll,
  error::{Error, Result},
  span::{Span, checked_align_up},
  vm::VirtualMemory,
};
#[cfg(unix)]
use crate::vm::OsVirtualMemory;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtualStackConfig {
  /// Address space to reserve; rounded up to `granularity`.
  pub capacity: usize,
  /// Commit step; rounded up to the page size.
  pub granularity: usize,
}

impl VirtualStackConfig {
  pub const fn new(capacity: usize, granularity: usize) -> Self {
    Self {
      capacity,
      granularity,
    }
  }
}

impl Default for VirtualStackConfig {
  fn default() -> Self {
    Self::new(1 << 30, 64 * 1024)
  }
}

/// Opaque snapshot of a [`VirtualStackAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
  unallocated: *mut u8,
  uncommitted: *mut u8,
}

pub struct VirtualStackAllocator<V: VirtualMemory> {
  vm: V,
  virtual_span: Span,
  /// Start of `unallocated_span`; it runs to the end of `virtual_span`.
  unallocated: *mut u8,
  /// Start of `uncommitted_span`; it runs to the end of `virtual_span`.
  uncommitted: *mut u8,
  /// Every committed page lies below this, including pages committed through
  /// `commit_range`. Never below `uncommitted`.
  committed_end: *mut u8,
  granularity: usize,
}

#[cfg(unix)]
impl VirtualStackAllocator<OsVirtualMemory> {
  pub fn new(config: VirtualStackConfig) -> Result<Self> {
    Self::with_backend(OsVirtualMemory, config)
  }
}

impl<V: VirtualMemory> VirtualStackAllocator<V> {
  pub fn with_backend(vm: V, config: VirtualStackConfig) -> Result<Self> {
    if config.granularity == 0 {
      return Err(Error::InvalidGranularity(config.granularity));
    }
    if config.capacity == 0 {
      return Err(Error::InvalidCapacity(config.capacity));
    }

    let granularity = vm.page_ceil(config.granularity);
    let capacity = config
      .capacity
      .div_ceil(granularity)
      .checked_mul(granularity)
      .ok_or(Error::ReserveFailed {
        size: config.capacity,
      })?;

    let virtual_span = vm.reserve(capacity);
    if virtual_span.is_null() {
      return Err(Error::ReserveFailed { size: capacity });
    }
    log::debug!(
      "virtual stack: reserved {} bytes at {:p}, commit granularity {}",
      capacity,
      virtual_span.as_ptr(),
      granularity
    );

    Ok(Self {
      vm,
      virtual_span,
      unallocated: virtual_span.as_ptr(),
      uncommitted: virtual_span.as_ptr(),
      committed_end: virtual_span.as_ptr(),
      granularity,
    })
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.virtual_span.len()
  }

  #[inline]
  pub fn granularity(&self) -> usize {
    self.granularity
  }

  #[inline]
  pub fn committed_bytes(&self) -> usize {
    self.uncommitted as usize - self.virtual_span.begin()
  }

  #[inline]
  pub fn allocated_bytes(&self) -> usize {
    self.unallocated as usize - self.virtual_span.begin()
  }

  pub fn virtual_span(&self) -> Span {
    self.virtual_span
  }

  pub fn unallocated_span(&self) -> Span {
    Span::from_bounds(self.unallocated, self.end_ptr())
  }

  pub fn uncommitted_span(&self) -> Span {
    Span::from_bounds(self.uncommitted, self.end_ptr())
  }

  pub fn backend(&self) -> &V {
    &self.vm
  }

  #[inline(always)]
  fn end_ptr(&self) -> *mut u8 {
    self.virtual_span.as_ptr().wrapping_add(self.virtual_span.len())
  }

  /// Start and end address of a `size` byte block aligned to `align` at the
  /// top of the stack, if the reservation has room.
  #[inline(always)]
  fn carve(&self, size: usize, align: usize) -> Option<(usize, usize)> {
    debug_assert!(align.is_power_of_two());
    let start = checked_align_up(self.unallocated as usize, align)?;
    let end = start.checked_add(size)?;
    (end <= self.virtual_span.end()).then_some((start, end))
  }

  /// Commits whole granularity units until `addr` is covered.
  #[inline(never)]
  fn commit_through(&mut self, addr: usize) -> bool {
    let base = self.virtual_span.begin();
    let target = (addr - base).div_ceil(self.granularity) * self.granularity;
    let committed = self.committed_bytes();
    if target <= committed {
      return true;
    }

    let span = Span::new(self.uncommitted, target - committed);
    if !unsafe { self.vm.commit(span) } {
      log::warn!("virtual stack: commit of {} bytes at {:p} failed", span.len(), span.as_ptr());
      return false;
    }
    self.uncommitted = self.uncommitted.wrapping_add(span.len());
    self.committed_end = self.committed_end.max(self.uncommitted);
    true
  }

  /// Hands out address space like `allocate` but commits nothing. The caller
  /// must commit the block (see [`commit_range`](Self::commit_range)) before
  /// touching it.
  pub fn reserve(&mut self, size: usize, align: usize) -> Span {
    let Some((start, end)) = self.carve(size, align) else {
      return Span::null();
    };
    let ptr = self.unallocated.wrapping_add(start - self.unallocated as usize);
    self.unallocated = self.unallocated.wrapping_add(end - self.unallocated as usize);
    Span::new(ptr, size)
  }

  /// Commits the pages under `block`, which must lie in the reservation.
  pub fn commit_range(&mut self, block: Span) -> bool {
    if !self.virtual_span.contains(block) {
      return false;
    }
    if block.is_empty() {
      return true;
    }
    let begin = self.vm.page_floor(block.begin());
    let end = self.vm.page_ceil(block.end());
    let offset = begin - self.virtual_span.begin();
    let pages = Span::new(self.virtual_span.as_ptr().wrapping_add(offset), end - begin);
    if !unsafe { self.vm.commit(pages) } {
      return false;
    }
    let pages_end = self.virtual_span.as_ptr().wrapping_add(end - self.virtual_span.begin());
    self.committed_end = self.committed_end.max(pages_end);
    true
  }

  #[inline]
  pub fn checkpoint(&self) -> Checkpoint {
    Checkpoint {
      unallocated: self.unallocated,
      uncommitted: self.uncommitted,
    }
  }

  /// Rewinds to `checkpoint`, decommitting the pages committed since.
  ///
  /// Pages under blocks that were reserved before the checkpoint stay
  /// committed; everything above them goes, whether `allocate` or
  /// [`commit_range`](Self::commit_range) committed it.
  ///
  /// # Safety
  ///
  /// `checkpoint` must come from this allocator and must not have been
  /// superseded by rewinding to an older one. No block allocated after it may
  /// be used afterwards.
  pub unsafe fn rewind(&mut self, checkpoint: Checkpoint) {
    debug_assert!(
      checkpoint.unallocated <= self.unallocated && checkpoint.uncommitted <= self.uncommitted,
      "rewind: checkpoint {checkpoint:?} is ahead of the stack"
    );
    let unallocated = checkpoint.unallocated.min(self.unallocated);
    let uncommitted = checkpoint.uncommitted.min(self.uncommitted);

    let live_end = self.vm.page_ceil(unallocated as usize);
    let keep = self
      .virtual_span
      .as_ptr()
      .wrapping_add(live_end - self.virtual_span.begin())
      .max(uncommitted);
    if keep < self.committed_end {
      self.decommit_from(keep);
    }

    self.unallocated = unallocated;
    self.uncommitted = uncommitted;
    self.committed_end = self.committed_end.min(keep);
  }

  /// Decommits `[from, committed_end)`.
  #[inline(never)]
  fn decommit_from(&mut self, from: *mut u8) {
    let delta = Span::from_bounds(from, self.committed_end);
    if !unsafe { self.vm.decommit(delta) } {
      log::warn!(
        "virtual stack: decommit of {} bytes at {:p} failed",
        delta.len(),
        delta.as_ptr()
      );
    }
  }

  /// Takes a checkpoint and rewinds to it when the returned guard drops.
  pub fn scope(&mut self) -> StackScope<'_, V> {
    let checkpoint = self.checkpoint();
    StackScope {
      allocator: self,
      checkpoint,
    }
  }
}

impl<V: VirtualMemory> Allocator for VirtualStackAllocator<V> {
  #[inline]
  fn allocate(&mut self, size: usize, align: usize) -> Span {
    let Some((start, end)) = self.carve(size, align) else {
      return Span::null();
    };
    if end > self.uncommitted as usize && !self.commit_through(end) {
      return Span::null();
    }

    let ptr = self.unallocated.wrapping_add(start - self.unallocated as usize);
    self.unallocated = self.unallocated.wrapping_add(end - self.unallocated as usize);
    Span::new(ptr, size)
  }

  #[inline]
  unsafe fn deallocate(&mut self, block: Span, _align: usize) {
    debug_assert!(
      block.is_null() || self.owns(block),
      "deallocate: {block:?} was not allocated here"
    );
  }

  #[inline]
  fn owns(&self, block: Span) -> bool {
    Span::from_bounds(self.virtual_span.as_ptr(), self.unallocated).contains(block)
  }
}

impl<V: VirtualMemory> DeallocateAll for VirtualStackAllocator<V> {
  fn deallocate_all(&mut self) {
    let base = self.virtual_span.as_ptr();
    if base < self.committed_end {
      self.decommit_from(base);
    }

    self.unallocated = base;
    self.uncommitted = base;
    self.committed_end = base;
  }
}

impl<V: VirtualMemory> Drop for VirtualStackAllocator<V> {
  fn drop(&mut self) {
    if !unsafe { self.vm.release(self.virtual_span) } {
      log::warn!(
        "virtual stack: release of {} bytes at {:p} failed",
        self.virtual_span.len(),
        self.virtual_span.as_ptr()
      );
    }
  }
}

/// Rewinds a [`VirtualStackAllocator`] to the checkpoint taken when the guard
/// was made.
pub struct StackScope<'s, V: VirtualMemory> {
  allocator: &'s mut VirtualStackAllocator<V>,
  checkpoint: Checkpoint,
}

impl<V: VirtualMemory> Deref for StackScope<'_, V> {
  type Target = VirtualStackAllocator<V>;

  fn deref(&self) -> &Self::Target {
    self.allocator
  }
}

impl<V: VirtualMemory> DerefMut for StackScope<'_, V> {
  fn deref_mut(&mut self) -> &mut Self::Target {
    self.allocator
  }
}

impl<V: VirtualMemory> Drop for StackScope<'_, V> {
  fn drop(&mut self) {
    unsafe { self.allocator.rewind(self.checkpoint) };
  }
}
