use core::{fmt, ptr::null_mut};

/// A contiguous byte range `[begin, begin + len)`.
///
/// Every allocator in this crate hands out and takes back `Span`s. The null
/// span (null pointer, zero length) is the only failure signal of `allocate`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Span {
  ptr: *mut u8,
  len: usize,
}

impl Span {
  /// The null span returned by every failed allocation.
  #[inline(always)]
  pub const fn null() -> Self {
    Self {
      ptr: null_mut(),
      len: 0,
    }
  }

  #[inline(always)]
  pub const fn new(ptr: *mut u8, len: usize) -> Self {
    Self { ptr, len }
  }

  /// Span covering `[begin, end)`. `end` must not precede `begin`.
  #[inline(always)]
  pub fn from_bounds(begin: *mut u8, end: *mut u8) -> Self {
    debug_assert!(begin as usize <= end as usize);
    Self {
      ptr: begin,
      len: end as usize - begin as usize,
    }
  }

  #[inline(always)]
  pub const fn is_null(&self) -> bool {
    self.ptr.is_null()
  }

  #[inline(always)]
  pub const fn as_ptr(&self) -> *mut u8 {
    self.ptr
  }

  #[inline(always)]
  pub const fn len(&self) -> usize {
    self.len
  }

  /// `true` for zero-length spans, including the null span.
  #[inline(always)]
  pub const fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[inline(always)]
  pub fn begin(&self) -> usize {
    self.ptr as usize
  }

  #[inline(always)]
  pub fn end(&self) -> usize {
    self.ptr as usize + self.len
  }

  /// Returns `true` if `other` lies entirely inside `self`. The null span is
  /// contained nowhere.
  #[inline]
  pub fn contains(&self, other: Span) -> bool {
    !other.is_null() && other.begin() >= self.begin() && other.end() <= self.end()
  }

  /// Returns `true` if the address `addr` lies in `[begin, end)`.
  #[inline]
  pub fn contains_addr(&self, addr: usize) -> bool {
    addr >= self.begin() && addr < self.end()
  }

  /// Sub-span starting `offset` bytes in. `offset` must not exceed `len`.
  #[inline]
  pub fn skip(&self, offset: usize) -> Span {
    debug_assert!(offset <= self.len);
    Span::new(self.ptr.wrapping_add(offset), self.len - offset)
  }
}

impl Default for Span {
  fn default() -> Self {
    Self::null()
  }
}

impl fmt::Debug for Span {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Span({:p}..{:#x}, {} bytes)", self.ptr, self.end(), self.len)
  }
}

// =============================================================================
// Alignment
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Rounds `x` down to a multiple of `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_down(x: usize, align: usize) -> usize {
  x & !(align - 1)
}

/// Checked variant of [`align_up`]; `None` if rounding overflows.
#[inline(always)]
pub const fn checked_align_up(x: usize, align: usize) -> Option<usize> {
  match x.checked_add(align - 1) {
    Some(v) => Some(v & !(align - 1)),
    None => None,
  }
}

#[inline(always)]
pub const fn is_aligned(x: usize, align: usize) -> bool {
  x & (align - 1) == 0
}

/// Largest power of two dividing `size`: the alignment every multiple of
/// `size` is guaranteed to keep.
#[inline(always)]
pub const fn natural_alignment(size: usize) -> usize {
  if size == 0 {
    return 1 << (usize::BITS - 1);
  }
  size & size.wrapping_neg()
}
