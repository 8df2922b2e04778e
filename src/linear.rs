//! Bump-pointer (arena) allocation.
//!
//! ```text
//!   LinearAllocator:
//!
//!   begin                     head                               end
//!   ┌──────┬───┬──────────┬───┬────────────────────────────────────┐
//!   │  A1  │pad│    A2    │A3 │              free                  │
//!   └──────┴───┴──────────┴───┴────────────────────────────────────┘
//!                             ▲
//!                        save_state() captures this
//!
//!   ChunkedLinearAllocator (LIFO chain through `previous`):
//!
//!   current ──▶ ┌hdr┬──────────┬──head──┐   ┌hdr┬─────────────┐   ┌hdr┬────┐
//!               │   │  blocks  │  free  │──▶│   │   blocks    │──▶│   │ .. │──▶ null
//!               └───┴──────────┴────────┘   └───┴─────────────┘   └───┴────┘
//! ```
//!
//! Individual blocks are never freed. Memory comes back all at once through
//! [`DeallocateAll`] or down to a checkpoint through `restore_state`.

use core::{
  marker::PhantomData,
  mem::{MaybeUninit, align_of, size_of},
  ops::{Deref, DerefMut},
  ptr::null_mut,
};

use crate::{
  Allocator, DeallocateAll,
  error::{Error, Result},
  span::{Span, checked_align_up},
};

/// Carves `size` bytes aligned to `align` from `[*head, end)` and advances
/// `head`. `None` if the range is too small.
#[inline(always)]
fn bump(head: &mut *mut u8, end: usize, size: usize, align: usize) -> Option<Span> {
  debug_assert!(align.is_power_of_two());
  let addr = *head as usize;
  let start = checked_align_up(addr, align)?;
  let new_head = start.checked_add(size)?;
  if new_head > end {
    return None;
  }

  let ptr = head.wrapping_add(start - addr);
  *head = ptr.wrapping_add(size);
  Some(Span::new(ptr, size))
}

// =============================================================================
// Fixed range
// =============================================================================

/// Bump allocator over one caller-provided memory range.
#[derive(Debug)]
pub struct LinearAllocator<'a> {
  begin: *mut u8,
  end: *mut u8,
  head: *mut u8,
  _buffer: PhantomData<&'a mut [MaybeUninit<u8>]>,
}

/// Opaque snapshot of a [`LinearAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinearState {
  head: *mut u8,
}

impl<'a> LinearAllocator<'a> {
  pub fn new(buffer: &'a mut [MaybeUninit<u8>]) -> Self {
    let span = Span::new(buffer.as_mut_ptr().cast(), buffer.len());
    unsafe { Self::from_span(span) }
  }

  /// Builds an allocator over raw memory.
  ///
  /// # Safety
  ///
  /// `span` must be valid for reads and writes for as long as the allocator and
  /// every block it hands out are in use.
  pub unsafe fn from_span(span: Span) -> Self {
    Self {
      begin: span.as_ptr(),
      end: span.as_ptr().wrapping_add(span.len()),
      head: span.as_ptr(),
      _buffer: PhantomData,
    }
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.end as usize - self.begin as usize
  }

  #[inline]
  pub fn used(&self) -> usize {
    self.head as usize - self.begin as usize
  }

  #[inline]
  pub fn remaining(&self) -> usize {
    self.end as usize - self.head as usize
  }

  #[inline]
  pub fn save_state(&self) -> LinearState {
    LinearState { head: self.head }
  }

  /// Rewinds to `state`. Everything allocated since it was saved is released.
  ///
  /// # Safety
  ///
  /// `state` must come from this allocator and must not have been superseded by
  /// restoring an older state. No block allocated after `state` may be used
  /// afterwards.
  pub unsafe fn restore_state(&mut self, state: LinearState) {
    debug_assert!(
      state.head as usize >= self.begin as usize && state.head as usize <= self.end as usize,
      "restore_state: {:p} is outside [{:p}, {:p}]",
      state.head,
      self.begin,
      self.end
    );
    self.head = state.head.clamp(self.begin, self.head);
  }

  /// Saves the current state and restores it when the returned guard drops.
  pub fn scope(&mut self) -> LinearScope<'_, 'a> {
    let state = self.save_state();
    LinearScope {
      allocator: self,
      state,
    }
  }
}

impl Allocator for LinearAllocator<'_> {
  #[inline]
  fn allocate(&mut self, size: usize, align: usize) -> Span {
    bump(&mut self.head, self.end as usize, size, align).unwrap_or(Span::null())
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
    Span::from_bounds(self.begin, self.head).contains(block)
  }
}

impl DeallocateAll for LinearAllocator<'_> {
  #[inline]
  fn deallocate_all(&mut self) {
    self.head = self.begin;
  }
}

/// Restores a [`LinearAllocator`] to the state it had when the guard was made.
pub struct LinearScope<'s, 'a> {
  allocator: &'s mut LinearAllocator<'a>,
  state: LinearState,
}

impl<'a> Deref for LinearScope<'_, 'a> {
  type Target = LinearAllocator<'a>;

  fn deref(&self) -> &Self::Target {
    self.allocator
  }
}

impl DerefMut for LinearScope<'_, '_> {
  fn deref_mut(&mut self) -> &mut Self::Target {
    self.allocator
  }
}

impl Drop for LinearScope<'_, '_> {
  fn drop(&mut self) {
    unsafe { self.allocator.restore_state(self.state) };
  }
}

// =============================================================================
// Chunked
// =============================================================================

#[repr(C)]
struct LinearChunk {
  previous: *mut LinearChunk,
  end: *mut u8,
}

const CHUNK_HEADER_SIZE: usize = size_of::<LinearChunk>();
const CHUNK_ALIGN: usize = align_of::<LinearChunk>();

/// Bump allocator that grows by requesting chunks from an underlying
/// allocator.
///
/// A request that does not fit the current chunk opens a new one of
/// `ceil(header + size + padding, granularity)` bytes; whatever was left in the
/// old chunk is abandoned until the chain is unwound.
pub struct ChunkedLinearAllocator<A: Allocator> {
  underlying: A,
  current: *mut LinearChunk,
  head: *mut u8,
  granularity: usize,
  chunk_count: usize,
}

/// Opaque snapshot of a [`ChunkedLinearAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkedState {
  head: *mut u8,
  chunk: *mut LinearChunk,
}

impl<A: Allocator> ChunkedLinearAllocator<A> {
  pub fn new(underlying: A, granularity: usize) -> Result<Self> {
    if granularity == 0 {
      return Err(Error::InvalidGranularity(granularity));
    }

    Ok(Self {
      underlying,
      current: null_mut(),
      head: null_mut(),
      granularity,
      chunk_count: 0,
    })
  }

  #[inline]
  pub fn granularity(&self) -> usize {
    self.granularity
  }

  #[inline]
  pub fn chunk_count(&self) -> usize {
    self.chunk_count
  }

  pub fn underlying(&self) -> &A {
    &self.underlying
  }

  #[inline]
  pub fn save_state(&self) -> ChunkedState {
    ChunkedState {
      head: self.head,
      chunk: self.current,
    }
  }

  /// Rewinds to `state`, returning every chunk opened after it to the
  /// underlying allocator.
  ///
  /// # Safety
  ///
  /// `state` must come from this allocator and must not have been superseded by
  /// restoring an older state. No block allocated after `state` may be used
  /// afterwards.
  pub unsafe fn restore_state(&mut self, state: ChunkedState) {
    if self.current == state.chunk {
      self.head = state.head.min(self.head);
      return;
    }

    let in_chain = state.chunk.is_null() || self.holds_chunk(state.chunk);
    debug_assert!(
      in_chain,
      "restore_state: chunk {:p} is not in the chain",
      state.chunk
    );
    if !in_chain {
      return;
    }

    while self.current != state.chunk {
      unsafe { self.pop_chunk() };
    }
    self.head = state.head;
  }

  fn holds_chunk(&self, target: *mut LinearChunk) -> bool {
    let mut chunk = self.current;
    while !chunk.is_null() {
      if chunk == target {
        return true;
      }
      chunk = unsafe { (*chunk).previous };
    }
    false
  }

  /// Saves the current state and restores it when the returned guard drops.
  pub fn scope(&mut self) -> ChunkedScope<'_, A> {
    let state = self.save_state();
    ChunkedScope {
      allocator: self,
      state,
    }
  }

  #[inline(never)]
  fn allocate_chunk(&mut self, size: usize, align: usize) -> Span {
    let Some(needed) = CHUNK_HEADER_SIZE
      .checked_add(size)
      .and_then(|v| v.checked_add(align.max(CHUNK_ALIGN) - CHUNK_ALIGN))
    else {
      return Span::null();
    };
    let Some(chunk_size) = needed.div_ceil(self.granularity).checked_mul(self.granularity) else {
      return Span::null();
    };

    let chunk = self.underlying.allocate(chunk_size, CHUNK_ALIGN);
    if chunk.is_null() {
      log::debug!("linear: underlying allocator refused a {chunk_size} byte chunk");
      return Span::null();
    }

    let header = chunk.as_ptr() as *mut LinearChunk;
    unsafe {
      header.write(LinearChunk {
        previous: self.current,
        end: chunk.as_ptr().add(chunk.len()),
      });
    }
    self.current = header;
    self.head = chunk.as_ptr().wrapping_add(CHUNK_HEADER_SIZE);
    self.chunk_count += 1;
    log::trace!(
      "linear: opened chunk #{} at {:p} ({} bytes)",
      self.chunk_count,
      header,
      chunk.len()
    );

    let end = chunk.end();
    bump(&mut self.head, end, size, align).unwrap_or(Span::null())
  }

  /// Unlinks the current chunk and hands it back to the underlying allocator.
  unsafe fn pop_chunk(&mut self) {
    let chunk = self.current;
    debug_assert!(!chunk.is_null());

    let (previous, end) = unsafe { ((*chunk).previous, (*chunk).end) };
    let span = Span::from_bounds(chunk.cast(), end);
    self.current = previous;
    self.chunk_count -= 1;
    unsafe { self.underlying.deallocate(span, CHUNK_ALIGN) };
  }
}

impl<A: Allocator> Allocator for ChunkedLinearAllocator<A> {
  #[inline]
  fn allocate(&mut self, size: usize, align: usize) -> Span {
    if !self.current.is_null() {
      let end = unsafe { (*self.current).end } as usize;
      if let Some(block) = bump(&mut self.head, end, size, align) {
        return block;
      }
    }

    self.allocate_chunk(size, align)
  }

  #[inline]
  unsafe fn deallocate(&mut self, block: Span, _align: usize) {
    debug_assert!(
      block.is_null() || self.owns(block),
      "deallocate: {block:?} was not allocated here"
    );
  }

  fn owns(&self, block: Span) -> bool {
    // The underlying allocator may be shared, so walk our own chain.
    let mut chunk = self.current;
    let mut limit = self.head;
    while !chunk.is_null() {
      let begin = chunk.cast::<u8>().wrapping_add(CHUNK_HEADER_SIZE);
      if Span::from_bounds(begin, limit).contains(block) {
        return true;
      }
      chunk = unsafe { (*chunk).previous };
      if !chunk.is_null() {
        limit = unsafe { (*chunk).end };
      }
    }
    false
  }
}

impl<A: Allocator> DeallocateAll for ChunkedLinearAllocator<A> {
  fn deallocate_all(&mut self) {
    while !self.current.is_null() {
      unsafe { self.pop_chunk() };
    }
    self.head = null_mut();
  }
}

impl<A: Allocator> Drop for ChunkedLinearAllocator<A> {
  fn drop(&mut self) {
    self.deallocate_all();
  }
}

/// Restores a [`ChunkedLinearAllocator`] to the state it had when the guard
/// was made, releasing chunks opened inside the scope.
pub struct ChunkedScope<'s, A: Allocator> {
  allocator: &'s mut ChunkedLinearAllocator<A>,
  state: ChunkedState,
}

impl<A: Allocator> Deref for ChunkedScope<'_, A> {
  type Target = ChunkedLinearAllocator<A>;

  fn deref(&self) -> &Self::Target {
    self.allocator
  }
}

impl<A: Allocator> DerefMut for ChunkedScope<'_, A> {
  fn deref_mut(&mut self) -> &mut Self::Target {
    self.allocator
  }
}

impl<A: Allocator> Drop for ChunkedScope<'_, A> {
  fn drop(&mut self) {
    unsafe { self.allocator.restore_state(self.state) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{Counting, Heap, NullAllocator};

  /// Heap that remembers the size of every chunk it hands out.
  #[derive(Default)]
  struct SizeLog {
    sizes: Vec<usize>,
  }

  impl Allocator for SizeLog {
    fn allocate(&mut self, size: usize, align: usize) -> Span {
      self.sizes.push(size);
      Heap.allocate(size, align)
    }

    unsafe fn deallocate(&mut self, block: Span, align: usize) {
      unsafe { Heap.deallocate(block, align) }
    }

    fn owns(&self, _block: Span) -> bool {
      false
    }
  }

  fn arena<const N: usize>() -> [MaybeUninit<u8>; N] {
    [MaybeUninit::uninit(); N]
  }

  #[test]
  fn exhausts_small_arena() {
    let mut buf = arena::<64>();
    let base = buf.as_ptr() as usize;
    let mut linear = LinearAllocator::new(&mut buf);

    let a = linear.allocate(40, 1);
    assert_eq!(a.begin(), base);
    assert_eq!(a.len(), 40);

    assert!(linear.allocate(30, 1).is_null());
    assert_eq!(linear.remaining(), 24);

    let b = linear.allocate(24, 1);
    assert_eq!(b.begin(), base + 40);
    assert_eq!(linear.remaining(), 0);
  }

  #[test]
  fn blocks_are_aligned_and_disjoint() {
    let mut buf = arena::<1024>();
    let mut linear = LinearAllocator::new(&mut buf);
    let whole = Span::new(linear.begin, linear.capacity());

    let mut blocks = Vec::new();
    for (i, align) in [1usize, 8, 2, 64, 16, 4, 32].iter().cycle().take(20).enumerate() {
      let block = linear.allocate(i + 3, *align);
      if block.is_null() {
        break;
      }
      assert_eq!(block.begin() % align, 0);
      assert!(whole.contains(block));
      blocks.push(block);
    }

    assert!(blocks.len() > 5);
    for pair in blocks.windows(2) {
      assert!(pair[0].end() <= pair[1].begin());
    }
  }

  #[test]
  fn save_then_restore_is_a_noop() {
    let mut buf = arena::<256>();
    let mut linear = LinearAllocator::new(&mut buf);
    linear.allocate(10, 1);

    let before = linear.save_state();
    let expected = linear.allocate(16, 8);
    unsafe { linear.restore_state(before) };

    let state = linear.save_state();
    unsafe { linear.restore_state(state) };
    assert_eq!(linear.allocate(16, 8), expected);
  }

  #[test]
  fn restore_rewinds_head() {
    let mut buf = arena::<128>();
    let mut linear = LinearAllocator::new(&mut buf);
    linear.allocate(16, 1);
    let state = linear.save_state();
    let first = linear.allocate(32, 1);
    linear.allocate(32, 1);
    unsafe { linear.restore_state(state) };

    assert_eq!(linear.used(), 16);
    assert!(!linear.owns(first));
    assert_eq!(linear.allocate(32, 1), first);
  }

  #[test]
  fn superseded_state_does_not_move_head_forward() {
    let mut buf = arena::<128>();
    let mut linear = LinearAllocator::new(&mut buf);
    let early = linear.save_state();
    linear.allocate(48, 1);
    let late = linear.save_state();

    unsafe {
      linear.restore_state(early);
      linear.restore_state(late);
    }
    assert_eq!(linear.used(), 0);
  }

  #[test]
  fn scope_guard_restores_on_drop() {
    let mut buf = arena::<128>();
    let mut linear = LinearAllocator::new(&mut buf);
    linear.allocate(8, 1);
    {
      let mut scope = linear.scope();
      assert!(!scope.allocate(64, 1).is_null());
      assert_eq!(scope.used(), 72);
    }
    assert_eq!(linear.used(), 8);
  }

  #[test]
  fn deallocate_all_resets() {
    let mut buf = arena::<32>();
    let mut linear = LinearAllocator::new(&mut buf);
    let a = linear.allocate(32, 1);
    assert!(linear.owns(a));
    linear.deallocate_all();
    assert!(!linear.owns(a));
    assert_eq!(linear.allocate(32, 1), a);
  }

  #[test]
  fn chunked_grows_and_owns_every_chunk() {
    let mut linear = ChunkedLinearAllocator::new(Counting::new(Heap), 256).unwrap();
    let a = linear.allocate(100, 8);
    let b = linear.allocate(100, 8);
    let c = linear.allocate(100, 8);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());
    assert_eq!(linear.chunk_count(), 2);
    assert!(linear.owns(a) && linear.owns(b) && linear.owns(c));
    assert_eq!(linear.underlying().live_count(), 2);

    let mut other = [0u8; 8];
    assert!(!linear.owns(Span::new(other.as_mut_ptr(), 8)));
  }

  #[test]
  fn chunked_oversized_request_gets_its_own_chunk() {
    let mut linear = ChunkedLinearAllocator::new(Heap, 64).unwrap();
    let big = linear.allocate(1000, 128);
    assert_eq!(big.len(), 1000);
    assert_eq!(big.begin() % 128, 0);
    assert!(linear.owns(big));
  }

  #[test]
  fn chunk_size_covers_header_size_and_padding() {
    let mut linear = ChunkedLinearAllocator::new(SizeLog::default(), 1024).unwrap();

    // Exactly one granule: header plus payload, no padding at 8-byte alignment.
    let exact = linear.allocate(1024 - CHUNK_HEADER_SIZE, CHUNK_ALIGN);
    assert!(!exact.is_null());

    // 64-byte alignment may need up to 56 bytes of padding past the header.
    let padded = linear.allocate(2000, 64);
    assert_eq!(padded.begin() % 64, 0);

    let header_size_padding = CHUNK_HEADER_SIZE + 2000 + (64 - CHUNK_ALIGN);
    assert_eq!(header_size_padding.div_ceil(1024) * 1024, 3072);
    assert_eq!(linear.underlying().sizes, vec![1024, 3072]);
  }

  #[test]
  fn chunked_superseded_state_in_current_chunk_is_clamped() {
    let mut linear = ChunkedLinearAllocator::new(Heap, 1024).unwrap();
    let a = linear.allocate(16, 8);
    let early = linear.save_state();
    linear.allocate(64, 8);
    let late = linear.save_state();

    unsafe {
      linear.restore_state(early);
      linear.restore_state(late);
    }
    assert_eq!(linear.chunk_count(), 1);
    let b = linear.allocate(16, 8);
    assert_eq!(b.begin(), a.end());
  }

  #[test]
  fn chunked_restore_releases_later_chunks() {
    let mut linear = ChunkedLinearAllocator::new(Counting::new(Heap), 128).unwrap();
    linear.allocate(64, 8);
    let state = linear.save_state();
    for _ in 0..10 {
      linear.allocate(64, 8);
    }
    assert!(linear.chunk_count() > 1);

    unsafe { linear.restore_state(state) };
    assert_eq!(linear.chunk_count(), 1);
    assert_eq!(linear.underlying().live_count(), 1);

    linear.deallocate_all();
    assert_eq!(linear.chunk_count(), 0);
    assert_eq!(linear.underlying().live_count(), 0);
  }

  #[test]
  fn chunked_restore_to_empty_state_releases_everything() {
    let mut linear = ChunkedLinearAllocator::new(Counting::new(Heap), 128).unwrap();
    let state = linear.save_state();
    linear.allocate(64, 8);
    linear.allocate(200, 8);
    unsafe { linear.restore_state(state) };
    assert_eq!(linear.chunk_count(), 0);
    assert_eq!(linear.underlying().live_count(), 0);
  }

  #[test]
  fn chunked_scope_releases_chunks() {
    let mut linear = ChunkedLinearAllocator::new(Counting::new(Heap), 128).unwrap();
    linear.allocate(16, 8);
    {
      let mut scope = linear.scope();
      for _ in 0..8 {
        scope.allocate(100, 8);
      }
      assert!(scope.chunk_count() > 1);
    }
    assert_eq!(linear.chunk_count(), 1);
  }

  #[test]
  fn chunked_fails_when_underlying_fails() {
    let mut linear = ChunkedLinearAllocator::new(NullAllocator, 128).unwrap();
    assert!(linear.allocate(8, 8).is_null());
    assert_eq!(linear.chunk_count(), 0);
  }

  #[test]
  fn zero_granularity_is_rejected() {
    assert!(matches!(
      ChunkedLinearAllocator::new(Heap, 0),
      Err(Error::InvalidGranularity(0))
    ));
  }
}
