use core::alloc::{GlobalAlloc, Layout};
use std::alloc::System;

use crate::{Allocator, Span};

/// The system heap.
///
/// `System` keeps no record the crate could query, so `owns` is always
/// `false`. Put `Heap` last in a [`Chain`](crate::Chain): unclaimed blocks
/// fall through to the last stage.
#[derive(Clone, Copy, Debug, Default)]
pub struct Heap;

impl Allocator for Heap {
  fn allocate(&mut self, size: usize, align: usize) -> Span {
    let Ok(layout) = Layout::from_size_align(size.max(1), align) else {
      return Span::null();
    };

    let ptr = unsafe { System.alloc(layout) };
    if ptr.is_null() {
      Span::null()
    } else {
      Span::new(ptr, size)
    }
  }

  unsafe fn deallocate(&mut self, block: Span, align: usize) {
    if block.is_null() {
      return;
    }
    let layout = unsafe { Layout::from_size_align_unchecked(block.len().max(1), align) };
    unsafe { System.dealloc(block.as_ptr(), layout) };
  }

  fn owns(&self, _block: Span) -> bool {
    false
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn allocates_aligned_blocks() {
    let mut heap = Heap;
    let block = heap.allocate(100, 256);
    assert!(!block.is_null());
    assert_eq!(block.len(), 100);
    assert_eq!(block.begin() % 256, 0);
    assert!(!heap.owns(block));
    unsafe { heap.deallocate(block, 256) };
  }

  #[test]
  fn rejects_bad_alignment() {
    let mut heap = Heap;
    assert!(heap.allocate(8, 3).is_null());
  }
}
