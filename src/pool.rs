//! Fixed-size block allocation.
//!
//! ```text
//!   One chunk (chunk_size bytes, aligned to chunk_size):
//!
//!   base                    payload
//!   ┌────────────────────┬───┬─────┬─────┬─────┬─────┬───────────────┐
//!   │ PoolChunk header   │pad│ B0  │ B1  │ B2  │ B3  │  un-issued    │
//!   │ prev/next/free/... │   │used │free │used │free │  (bump..end)  │
//!   └────────────────────┴───┴─────┴──┬──┴─────┴──▲──┴───────────────┘
//!                                     └───next────┘
//!                           free list overlaid on freed blocks
//!
//!   available:   chunk ⇄ chunk ⇄ chunk     (free block or un-issued space left)
//!   unavailable: chunk ⇄ chunk             (every block handed out)
//! ```
//!
//! Chunks are self-aligned, so the owner of any block is found by masking its
//! address down to `chunk_size`, the same trick spans use in a size-class
//! allocator. Allocation takes from the head of `available`; a chunk moves to
//! `unavailable` when its last block goes out and back to the front of
//! `available` when one comes home.

use core::{
  mem::size_of,
  ptr::{self, null_mut},
};

use crate::{
  Allocator, DeallocateAll,
  error::{Error, Result},
  span::{Span, align_up, is_aligned, natural_alignment},
};

// =============================================================================
// Types
// =============================================================================

/// What happens to a chunk whose last live block is deallocated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChunkRelease {
  /// Keep it for reuse until `deallocate_all`. Blocks in it recycle through
  /// its free list.
  #[default]
  Retain,
  /// Give it back to the underlying allocator right away, unless it is the
  /// only chunk with free capacity.
  Eager,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
  /// Largest request served; also the stride between blocks.
  pub block_size: usize,
  /// Bytes requested from the underlying allocator per chunk, aligned to
  /// itself. Must be a power of two.
  pub chunk_size: usize,
  pub release: ChunkRelease,
}

impl PoolConfig {
  pub const fn new(block_size: usize, chunk_size: usize) -> Self {
    Self {
      block_size,
      chunk_size,
      release: ChunkRelease::Retain,
    }
  }

  pub const fn with_release(mut self, release: ChunkRelease) -> Self {
    self.release = release;
    self
  }
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self::new(64, 64 * 1024)
  }
}

/// Overlaid on a block while it sits on a free list.
#[repr(C)]
struct FreeBlock {
  next: *mut FreeBlock,
}

/// Chunk metadata. Sits at offset 0 of each chunk.
#[repr(C)]
struct PoolChunk {
  prev: *mut PoolChunk,
  next: *mut PoolChunk,
  /// Blocks handed back, LIFO.
  free: *mut FreeBlock,
  /// Next never-issued block.
  bump: *mut u8,
  /// End of the last whole block.
  end: *mut u8,
  /// Outstanding allocations.
  used: usize,
}

const CHUNK_HEADER_SIZE: usize = size_of::<PoolChunk>();

impl PoolChunk {
  #[inline(always)]
  unsafe fn has_capacity(chunk: *const PoolChunk) -> bool {
    unsafe { !(*chunk).free.is_null() || (*chunk).bump < (*chunk).end }
  }
}

/// Intrusive doubly-linked list of chunks.
struct ChunkList {
  head: *mut PoolChunk,
  count: usize,
}

impl ChunkList {
  const fn new() -> Self {
    Self {
      head: null_mut(),
      count: 0,
    }
  }

  unsafe fn push_front(&mut self, chunk: *mut PoolChunk) {
    unsafe {
      (*chunk).prev = null_mut();
      (*chunk).next = self.head;
      if !self.head.is_null() {
        (*self.head).prev = chunk;
      }
    }
    self.head = chunk;
    self.count += 1;
  }

  unsafe fn remove(&mut self, chunk: *mut PoolChunk) {
    unsafe {
      let prev = (*chunk).prev;
      let next = (*chunk).next;
      if prev.is_null() {
        debug_assert!(self.head == chunk);
        self.head = next;
      } else {
        (*prev).next = next;
      }
      if !next.is_null() {
        (*next).prev = prev;
      }
      (*chunk).prev = null_mut();
      (*chunk).next = null_mut();
    }
    self.count -= 1;
  }

  fn iter(&self) -> ChunkIter {
    ChunkIter { next: self.head }
  }
}

struct ChunkIter {
  next: *mut PoolChunk,
}

impl Iterator for ChunkIter {
  type Item = *mut PoolChunk;

  fn next(&mut self) -> Option<Self::Item> {
    let chunk = self.next;
    if chunk.is_null() {
      return None;
    }
    self.next = unsafe { (*chunk).next };
    Some(chunk)
  }
}

// =============================================================================
// Pool
// =============================================================================

/// Serves blocks of at most `block_size` bytes from chunks obtained from an
/// underlying allocator.
///
/// The pool exclusively owns its chunks. They go back to the underlying
/// allocator on [`deallocate_all`](DeallocateAll::deallocate_all), on drop,
/// and, under [`ChunkRelease::Eager`], when they empty out.
pub struct PoolAllocator<A: Allocator> {
  underlying: A,
  block_size: usize,
  block_align: usize,
  chunk_size: usize,
  /// Offset of the first block from the chunk base.
  payload_offset: usize,
  blocks_per_chunk: usize,
  release: ChunkRelease,
  available: ChunkList,
  unavailable: ChunkList,
  live_blocks: usize,
}

impl<A: Allocator> PoolAllocator<A> {
  pub fn new(underlying: A, config: PoolConfig) -> Result<Self> {
    let PoolConfig {
      block_size,
      chunk_size,
      release,
    } = config;

    let min_block = size_of::<FreeBlock>();
    if block_size < min_block {
      return Err(Error::InvalidBlockSize {
        size: block_size,
        min: min_block,
      });
    }

    let block_align = natural_alignment(block_size).min(chunk_size.max(1));
    let payload_offset = align_up(CHUNK_HEADER_SIZE, block_align);
    let min_chunk = payload_offset.saturating_add(block_size);
    if !chunk_size.is_power_of_two() || chunk_size < min_chunk {
      return Err(Error::InvalidChunkSize {
        size: chunk_size,
        min: min_chunk,
      });
    }

    Ok(Self {
      underlying,
      block_size,
      block_align,
      chunk_size,
      payload_offset,
      blocks_per_chunk: (chunk_size - payload_offset) / block_size,
      release,
      available: ChunkList::new(),
      unavailable: ChunkList::new(),
      live_blocks: 0,
    })
  }

  #[inline]
  pub fn block_size(&self) -> usize {
    self.block_size
  }

  /// Strongest alignment a block is guaranteed to have.
  #[inline]
  pub fn block_align(&self) -> usize {
    self.block_align
  }

  #[inline]
  pub fn chunk_size(&self) -> usize {
    self.chunk_size
  }

  #[inline]
  pub fn blocks_per_chunk(&self) -> usize {
    self.blocks_per_chunk
  }

  #[inline]
  pub fn chunk_count(&self) -> usize {
    self.available.count + self.unavailable.count
  }

  /// Chunks that can still serve a block without asking the underlying
  /// allocator.
  #[inline]
  pub fn available_chunks(&self) -> usize {
    self.available.count
  }

  #[inline]
  pub fn live_blocks(&self) -> usize {
    self.live_blocks
  }

  pub fn underlying(&self) -> &A {
    &self.underlying
  }

  /// Gets a fresh chunk from the underlying allocator and makes it current.
  #[inline(never)]
  fn allocate_chunk(&mut self) -> *mut PoolChunk {
    let span = self.underlying.allocate(self.chunk_size, self.chunk_size);
    if span.is_null() {
      log::debug!(
        "pool: underlying allocator refused a {} byte chunk",
        self.chunk_size
      );
      return null_mut();
    }

    // Block-to-chunk lookup masks addresses, so a misaligned chunk is useless.
    if !is_aligned(span.begin(), self.chunk_size) {
      log::warn!(
        "pool: underlying allocator returned {:p}, not aligned to {}",
        span.as_ptr(),
        self.chunk_size
      );
      unsafe { self.underlying.deallocate(span, self.chunk_size) };
      return null_mut();
    }

    let base = span.as_ptr();
    let chunk = base as *mut PoolChunk;
    unsafe {
      let bump = base.add(self.payload_offset);
      chunk.write(PoolChunk {
        prev: null_mut(),
        next: null_mut(),
        free: null_mut(),
        bump,
        end: bump.add(self.blocks_per_chunk * self.block_size),
        used: 0,
      });
      self.available.push_front(chunk);
    }

    log::trace!(
      "pool: opened chunk {:p} ({} blocks of {} bytes)",
      chunk,
      self.blocks_per_chunk,
      self.block_size
    );
    chunk
  }

  /// Returns `chunk` to the underlying allocator. It must already be unlinked.
  unsafe fn release_chunk(&mut self, chunk: *mut PoolChunk) {
    let span = Span::new(chunk.cast(), self.chunk_size);
    log::trace!("pool: releasing chunk {chunk:p}");
    unsafe { self.underlying.deallocate(span, self.chunk_size) };
  }

  #[inline(always)]
  fn chunk_of(&self, block: *mut u8) -> *mut PoolChunk {
    let offset = block as usize & (self.chunk_size - 1);
    block.wrapping_sub(offset).cast()
  }

  #[inline(always)]
  fn payload(&self, chunk: *mut PoolChunk) -> Span {
    let begin = chunk.cast::<u8>().wrapping_add(self.payload_offset);
    Span::new(begin, self.blocks_per_chunk * self.block_size)
  }
}

impl<A: Allocator> Allocator for PoolAllocator<A> {
  fn allocate(&mut self, size: usize, align: usize) -> Span {
    debug_assert!(align.is_power_of_two());
    if size > self.block_size || align > self.block_align {
      return Span::null();
    }

    let mut chunk = self.available.head;
    if chunk.is_null() {
      chunk = self.allocate_chunk();
      if chunk.is_null() {
        return Span::null();
      }
    }

    unsafe {
      debug_assert!(PoolChunk::has_capacity(chunk));

      // Fast path: recycle the most recently freed block.
      let free = (*chunk).free;
      let block = if !free.is_null() {
        (*chunk).free = ptr::read_unaligned(free).next;
        free.cast::<u8>()
      } else {
        let bump = (*chunk).bump;
        (*chunk).bump = bump.add(self.block_size);
        bump
      };

      (*chunk).used += 1;
      self.live_blocks += 1;

      if !PoolChunk::has_capacity(chunk) {
        self.available.remove(chunk);
        self.unavailable.push_front(chunk);
      }

      Span::new(block, size)
    }
  }

  unsafe fn deallocate(&mut self, block: Span, _align: usize) {
    if block.is_null() {
      return;
    }
    debug_assert!(self.owns(block), "deallocate: {block:?} is not in this pool");

    let chunk = self.chunk_of(block.as_ptr());
    unsafe {
      debug_assert!((*chunk).used > 0, "deallocate: chunk {chunk:p} has no live blocks");
      let was_full = !PoolChunk::has_capacity(chunk);

      let node = block.as_ptr().cast::<FreeBlock>();
      ptr::write_unaligned(node, FreeBlock { next: (*chunk).free });
      (*chunk).free = node;
      (*chunk).used -= 1;
      self.live_blocks -= 1;

      if was_full {
        self.unavailable.remove(chunk);
        self.available.push_front(chunk);
      }

      if (*chunk).used == 0 && self.release == ChunkRelease::Eager && self.available.count > 1 {
        self.available.remove(chunk);
        self.release_chunk(chunk);
      }
    }
  }

  fn owns(&self, block: Span) -> bool {
    // The underlying allocator may be shared, so scan our own chunks.
    self
      .available
      .iter()
      .chain(self.unavailable.iter())
      .any(|chunk| self.payload(chunk).contains(block))
  }
}

impl<A: Allocator> DeallocateAll for PoolAllocator<A> {
  fn deallocate_all(&mut self) {
    let heads = [self.available.head, self.unavailable.head];
    self.available = ChunkList::new();
    self.unavailable = ChunkList::new();

    for mut chunk in heads {
      while !chunk.is_null() {
        let next = unsafe { (*chunk).next };
        let span = Span::new(chunk.cast(), self.chunk_size);
        unsafe { self.underlying.deallocate(span, self.chunk_size) };
        chunk = next;
      }
    }
    self.live_blocks = 0;
  }
}

impl<A: Allocator> Drop for PoolAllocator<A> {
  fn drop(&mut self) {
    self.deallocate_all();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{Counting, Heap, NullAllocator};

  fn pool(block_size: usize, chunk_size: usize) -> PoolAllocator<Counting<Heap>> {
    PoolAllocator::new(Counting::new(Heap), PoolConfig::new(block_size, chunk_size)).unwrap()
  }

  #[test]
  fn rejects_bad_config() {
    assert!(matches!(
      PoolAllocator::new(Heap, PoolConfig::new(4, 4096)),
      Err(Error::InvalidBlockSize { size: 4, .. })
    ));
    assert!(matches!(
      PoolAllocator::new(Heap, PoolConfig::new(16, 1000)),
      Err(Error::InvalidChunkSize { size: 1000, .. })
    ));
    assert!(matches!(
      PoolAllocator::new(Heap, PoolConfig::new(64, 64)),
      Err(Error::InvalidChunkSize { size: 64, .. })
    ));
  }

  #[test]
  fn enforces_block_size_and_alignment_ceiling() {
    let mut pool = pool(24, 4096);
    assert_eq!(pool.block_align(), 8);
    assert!(pool.allocate(25, 1).is_null());
    assert!(pool.allocate(8, 16).is_null());

    let block = pool.allocate(24, 8);
    assert_eq!(block.len(), 24);
    assert_eq!(block.begin() % 8, 0);
    let small = pool.allocate(3, 1);
    assert_eq!(small.len(), 3);
  }

  #[test]
  fn recycles_last_freed_block() {
    let mut pool = pool(32, 4096);
    let _keep = pool.allocate(32, 8);
    let x = pool.allocate(32, 8);
    unsafe { pool.deallocate(x, 8) };
    let y = pool.allocate(32, 8);
    assert_eq!(x.as_ptr(), y.as_ptr());
    assert_eq!(pool.live_blocks(), 2);
  }

  #[test]
  fn spills_into_new_chunk_and_tracks_lists() {
    let mut pool = pool(16, 256);
    let per_chunk = pool.blocks_per_chunk();
    assert!(per_chunk > 0 && per_chunk < 20);

    let blocks: Vec<Span> = (0..per_chunk).map(|_| pool.allocate(16, 16)).collect();
    assert_eq!(pool.chunk_count(), 1);
    assert_eq!(pool.available_chunks(), 0);

    let extra = pool.allocate(16, 16);
    assert!(!extra.is_null());
    assert_eq!(pool.chunk_count(), 2);
    assert_eq!(pool.available_chunks(), 1);

    // Freeing a block of the full chunk makes it available again, in front.
    unsafe { pool.deallocate(blocks[3], 16) };
    assert_eq!(pool.available_chunks(), 2);
    assert_eq!(pool.allocate(16, 16), blocks[3]);
    assert_eq!(pool.available_chunks(), 1);
  }

  #[test]
  fn blocks_are_distinct_and_owned() {
    let mut pool = pool(48, 1024);
    let blocks: Vec<Span> = (0..64).map(|_| pool.allocate(48, 16)).collect();
    for block in &blocks {
      assert!(!block.is_null());
      assert!(pool.owns(*block));
      assert_eq!(block.begin() % 16, 0);
    }
    let mut starts: Vec<usize> = blocks.iter().map(Span::begin).collect();
    starts.sort_unstable();
    starts.dedup();
    assert_eq!(starts.len(), blocks.len());

    let mut foreign = [0u8; 48];
    assert!(!pool.owns(Span::new(foreign.as_mut_ptr(), 48)));
  }

  #[test]
  fn retains_empty_chunks_by_default() {
    let mut pool = pool(64, 512);
    let blocks: Vec<Span> = (0..20).map(|_| pool.allocate(64, 8)).collect();
    let chunks = pool.chunk_count();
    for block in blocks {
      unsafe { pool.deallocate(block, 8) };
    }
    assert_eq!(pool.live_blocks(), 0);
    assert_eq!(pool.chunk_count(), chunks);
    assert_eq!(pool.underlying().live_count(), chunks);
  }

  #[test]
  fn eager_release_returns_empty_chunks() {
    let config = PoolConfig::new(64, 512).with_release(ChunkRelease::Eager);
    let mut pool = PoolAllocator::new(Counting::new(Heap), config).unwrap();
    let blocks: Vec<Span> = (0..20).map(|_| pool.allocate(64, 8)).collect();
    assert!(pool.chunk_count() > 1);
    for block in blocks {
      unsafe { pool.deallocate(block, 8) };
    }
    assert_eq!(pool.chunk_count(), 1);
    assert_eq!(pool.underlying().live_count(), 1);
  }

  #[test]
  fn deallocate_all_returns_every_chunk() {
    let mut pool = pool(16, 256);
    for _ in 0..100 {
      pool.allocate(16, 16);
    }
    assert!(pool.underlying().live_count() > 1);
    pool.deallocate_all();
    assert_eq!(pool.chunk_count(), 0);
    assert_eq!(pool.live_blocks(), 0);
    assert_eq!(pool.underlying().live_count(), 0);

    assert!(!pool.allocate(16, 16).is_null());
  }

  #[test]
  fn fails_without_underlying_memory() {
    let mut pool = PoolAllocator::new(NullAllocator, PoolConfig::new(16, 256)).unwrap();
    assert!(pool.allocate(16, 8).is_null());
    assert_eq!(pool.chunk_count(), 0);
  }

  #[test]
  fn odd_block_sizes_keep_free_list_intact() {
    let mut pool = pool(12, 256);
    assert_eq!(pool.block_align(), 4);
    let a = pool.allocate(12, 4);
    let b = pool.allocate(12, 4);
    let c = pool.allocate(12, 4);
    unsafe {
      pool.deallocate(a, 4);
      pool.deallocate(c, 4);
    }
    assert_eq!(pool.allocate(12, 4), c);
    assert_eq!(pool.allocate(12, 4), a);
    assert!(pool.owns(b));
  }
}
