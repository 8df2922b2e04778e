//! Allocators built out of other allocators.

use crate::{Allocator, DeallocateAll, Span};

// =============================================================================
// Chain
// =============================================================================

/// Tries `primary`, then `fallback`.
///
/// Longer chains nest: `Chain<A, Chain<B, C>>`, most easily built with
/// [`chain!`](crate::chain). A block goes back to the first stage that owns it.
/// When no stage claims it, the last stage receives it anyway, which is what
/// lets an ownership-blind allocator such as [`Heap`](crate::Heap) sit at the
/// end.
#[derive(Debug, Default)]
pub struct Chain<P, F> {
  primary: P,
  fallback: F,
}

impl<P, F> Chain<P, F> {
  pub const fn new(primary: P, fallback: F) -> Self {
    Self { primary, fallback }
  }

  pub fn primary(&self) -> &P {
    &self.primary
  }

  pub fn primary_mut(&mut self) -> &mut P {
    &mut self.primary
  }

  pub fn fallback(&self) -> &F {
    &self.fallback
  }

  pub fn fallback_mut(&mut self) -> &mut F {
    &mut self.fallback
  }

  pub fn into_parts(self) -> (P, F) {
    (self.primary, self.fallback)
  }
}

impl<P: Allocator, F: Allocator> Allocator for Chain<P, F> {
  #[inline]
  fn allocate(&mut self, size: usize, align: usize) -> Span {
    let block = self.primary.allocate(size, align);
    if !block.is_null() {
      return block;
    }
    self.fallback.allocate(size, align)
  }

  #[inline]
  unsafe fn deallocate(&mut self, block: Span, align: usize) {
    if self.primary.owns(block) {
      unsafe { self.primary.deallocate(block, align) }
    } else {
      unsafe { self.fallback.deallocate(block, align) }
    }
  }

  #[inline]
  fn owns(&self, block: Span) -> bool {
    self.primary.owns(block) || self.fallback.owns(block)
  }
}

impl<P: DeallocateAll, F: DeallocateAll> DeallocateAll for Chain<P, F> {
  fn deallocate_all(&mut self) {
    self.primary.deallocate_all();
    self.fallback.deallocate_all();
  }
}

/// Builds a [`Chain`] from a list of allocators, tried in order.
///
/// ```
/// use memkit::{Allocator, Heap, NullAllocator, chain};
///
/// let mut alloc = chain![NullAllocator, NullAllocator, Heap];
/// let block = alloc.allocate(32, 8);
/// assert!(!block.is_null());
/// unsafe { alloc.deallocate(block, 8) };
/// ```
#[macro_export]
macro_rules! chain {
  ($last:expr $(,)?) => {
    $last
  };
  ($first:expr, $($rest:expr),+ $(,)?) => {
    $crate::Chain::new($first, $crate::chain!($($rest),+))
  };
}

// =============================================================================
// Null / Passthrough
// =============================================================================

/// Never allocates. `owns` is always `false`; deallocation does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullAllocator;

impl Allocator for NullAllocator {
  #[inline(always)]
  fn allocate(&mut self, _size: usize, _align: usize) -> Span {
    Span::null()
  }

  #[inline(always)]
  unsafe fn deallocate(&mut self, _block: Span, _align: usize) {}

  #[inline(always)]
  fn owns(&self, _block: Span) -> bool {
    false
  }
}

impl DeallocateAll for NullAllocator {
  #[inline(always)]
  fn deallocate_all(&mut self) {}
}

/// Forwards to a borrowed allocator, or behaves as [`NullAllocator`] when it
/// has none.
///
/// Code that needs "some allocator" takes a `Passthrough` (often over
/// `dyn Allocator`) instead of reaching for a global default.
pub struct Passthrough<'a, A: Allocator + ?Sized> {
  target: Option<&'a mut A>,
}

impl<'a, A: Allocator + ?Sized> Passthrough<'a, A> {
  pub fn new(target: &'a mut A) -> Self {
    Self {
      target: Some(target),
    }
  }

  pub const fn null() -> Self {
    Self { target: None }
  }

  /// Points at `target`, returning the previous one.
  pub fn set(&mut self, target: &'a mut A) -> Option<&'a mut A> {
    self.target.replace(target)
  }

  /// Detaches the target; the passthrough becomes a null allocator.
  pub fn take(&mut self) -> Option<&'a mut A> {
    self.target.take()
  }

  #[inline]
  pub fn is_null(&self) -> bool {
    self.target.is_none()
  }

  pub fn get(&self) -> Option<&A> {
    self.target.as_deref()
  }

  pub fn get_mut(&mut self) -> Option<&mut A> {
    self.target.as_deref_mut()
  }
}

impl<A: Allocator + ?Sized> Default for Passthrough<'_, A> {
  fn default() -> Self {
    Self::null()
  }
}

impl<A: Allocator + ?Sized> Allocator for Passthrough<'_, A> {
  #[inline]
  fn allocate(&mut self, size: usize, align: usize) -> Span {
    match self.target.as_deref_mut() {
      Some(target) => target.allocate(size, align),
      None => Span::null(),
    }
  }

  #[inline]
  unsafe fn deallocate(&mut self, block: Span, align: usize) {
    if let Some(target) = self.target.as_deref_mut() {
      unsafe { target.deallocate(block, align) }
    }
  }

  #[inline]
  fn owns(&self, block: Span) -> bool {
    self.target.as_deref().is_some_and(|target| target.owns(block))
  }
}

impl<A: DeallocateAll + ?Sized> DeallocateAll for Passthrough<'_, A> {
  fn deallocate_all(&mut self) {
    if let Some(target) = self.target.as_deref_mut() {
      target.deallocate_all();
    }
  }
}

// =============================================================================
// Counting
// =============================================================================

/// Counts allocations and deallocations going through `inner`. The counters
/// never influence what `inner` does.
#[derive(Debug, Default)]
pub struct Counting<A> {
  inner: A,
  allocation_count: usize,
  deallocation_count: usize,
}

impl<A> Counting<A> {
  pub const fn new(inner: A) -> Self {
    Self {
      inner,
      allocation_count: 0,
      deallocation_count: 0,
    }
  }

  pub fn inner(&self) -> &A {
    &self.inner
  }

  pub fn inner_mut(&mut self) -> &mut A {
    &mut self.inner
  }

  pub fn into_inner(self) -> A {
    self.inner
  }

  /// Successful allocations so far.
  #[inline]
  pub fn allocation_count(&self) -> usize {
    self.allocation_count
  }

  #[inline]
  pub fn deallocation_count(&self) -> usize {
    self.deallocation_count
  }

  /// Allocations not yet deallocated.
  #[inline]
  pub fn live_count(&self) -> usize {
    self.allocation_count.saturating_sub(self.deallocation_count)
  }

  /// Every allocation ever made, live or not.
  #[inline]
  pub fn total_count(&self) -> usize {
    self.allocation_count
  }
}

impl<A: Allocator> Allocator for Counting<A> {
  #[inline]
  fn allocate(&mut self, size: usize, align: usize) -> Span {
    let block = self.inner.allocate(size, align);
    if !block.is_null() {
      self.allocation_count += 1;
    }
    block
  }

  #[inline]
  unsafe fn deallocate(&mut self, block: Span, align: usize) {
    self.deallocation_count += 1;
    unsafe { self.inner.deallocate(block, align) }
  }

  #[inline]
  fn owns(&self, block: Span) -> bool {
    self.inner.owns(block)
  }
}

impl<A: DeallocateAll> DeallocateAll for Counting<A> {
  /// Everything live is released, so the live count drops to zero.
  fn deallocate_all(&mut self) {
    self.inner.deallocate_all();
    self.deallocation_count = self.allocation_count;
  }
}
