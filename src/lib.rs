//! # memkit - allocation primitives that do not lean on a general-purpose heap
//!
//! ```text
//!   memkit
//!   ├── span     - Span value type and alignment helpers
//!   ├── vm       - VirtualMemory backend (reserve/commit/decommit/release)
//!   ├── heap     - Heap: the system allocator, for the end of a chain
//!   ├── linear   - LinearAllocator / ChunkedLinearAllocator (bump + checkpoints)
//!   ├── pool     - PoolAllocator (fixed-size blocks, chunked, free-list)
//!   ├── stack    - VirtualStackAllocator (commit on demand, rewind decommits)
//!   └── adaptor  - Chain, Passthrough, NullAllocator, Counting
//! ```
//!
//! Every allocator speaks the same small protocol, [`Allocator`]:
//!
//! - `allocate(size, align)` returns a [`Span`] of exactly `size` bytes aligned
//!   to `align`, or [`Span::null`] when it cannot. That is the only failure mode.
//! - `deallocate(span, align)` hands a block back. Passing a span that did not
//!   come from the same instance is undefined behaviour, hence `unsafe`.
//! - `owns(span)` answers from the allocator's own bookkeeping, never by asking
//!   an underlying allocator, since that one may be shared.
//!
//! The allocators that can drop everything at once also implement
//! [`DeallocateAll`]. Swapping two allocators is `core::mem::swap`.
//!
//! ```text
//!   Pool over a shared linear arena, with the heap as a fallback:
//!
//!   ┌──────────────────────────── Chain ─────────────────────────────┐
//!   │  ┌──────── PoolAllocator ────────┐      ┌──────── Heap ──────┐ │
//!   │  │ chunk ─ chunk ─ chunk         │ ───▶ │ std::alloc::System │ │
//!   │  └───────────┬───────────────────┘      └────────────────────┘ │
//!   └──────────────┼─────────────────────────────────────────────────┘
//!                  ▼
//!          &mut LinearAllocator (chunks are carved here)
//! ```
//!
//! ## Threading
//!
//! Nothing in this crate is internally synchronized. Allocators hold raw
//! pointers and are neither `Send` nor `Sync`; one owner drives one instance.

pub mod adaptor;
pub mod error;
pub mod heap;
pub mod linear;
pub mod pool;
pub mod span;
pub mod stack;
pub mod vm;

pub use adaptor::{Chain, Counting, NullAllocator, Passthrough};
pub use error::{Error, Result};
pub use heap::Heap;
pub use linear::{ChunkedLinearAllocator, ChunkedState, LinearAllocator, LinearState};
pub use pool::{ChunkRelease, PoolAllocator, PoolConfig};
pub use span::Span;
pub use stack::{Checkpoint, VirtualStackAllocator, VirtualStackConfig};
#[cfg(unix)]
pub use vm::OsVirtualMemory;
pub use vm::VirtualMemory;

/// The allocation protocol shared by every allocator and adaptor.
///
/// The trait is object safe, so `&mut dyn Allocator` can stand in for any
/// concrete allocator (see [`Passthrough`]).
pub trait Allocator {
  /// Returns `size` bytes aligned to `align` (a power of two), or the null
  /// span if the request cannot be served.
  fn allocate(&mut self, size: usize, align: usize) -> Span;

  /// Returns `block` to the allocator.
  ///
  /// # Safety
  ///
  /// `block` must have been returned by `allocate` on this same instance with
  /// the same `align`, and must not have been deallocated since.
  unsafe fn deallocate(&mut self, block: Span, align: usize);

  /// Returns `true` if `block` lies in memory handed out by this allocator.
  fn owns(&self, block: Span) -> bool;
}

/// Allocators that can release every outstanding block at once.
///
/// Every span previously returned by the allocator is dangling afterwards.
pub trait DeallocateAll: Allocator {
  fn deallocate_all(&mut self);
}

impl<A: Allocator + ?Sized> Allocator for &mut A {
  #[inline]
  fn allocate(&mut self, size: usize, align: usize) -> Span {
    (**self).allocate(size, align)
  }

  #[inline]
  unsafe fn deallocate(&mut self, block: Span, align: usize) {
    unsafe { (**self).deallocate(block, align) }
  }

  #[inline]
  fn owns(&self, block: Span) -> bool {
    (**self).owns(block)
  }
}

impl<A: DeallocateAll + ?Sized> DeallocateAll for &mut A {
  #[inline]
  fn deallocate_all(&mut self) {
    (**self).deallocate_all()
  }
}
