use thiserror::Error;

/// Errors raised while constructing an allocator.
///
/// Allocation itself never fails with an error: an exhausted allocator
/// returns [`Span::null`](crate::Span::null).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
  #[error("block size {size} is smaller than a free-list link ({min} bytes)")]
  InvalidBlockSize { size: usize, min: usize },

  #[error("chunk size {size} must be a power of two holding at least {min} bytes")]
  InvalidChunkSize { size: usize, min: usize },

  #[error("commit granularity {0} must be non-zero")]
  InvalidGranularity(usize),

  #[error("capacity {0} must be non-zero")]
  InvalidCapacity(usize),

  #[error("failed to reserve {size} bytes of virtual address space")]
  ReserveFailed { size: usize },
}

pub type Result<T> = core::result::Result<T, Error>;
