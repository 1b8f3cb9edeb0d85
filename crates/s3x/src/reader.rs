//! 📖 The read side: ranges, slots, and the reader that drains them in order.

pub(crate) mod chunk_buffer;
pub(crate) mod parallel_reader;
pub(crate) mod range_allocator;

pub use parallel_reader::{ParallelReader, ReaderParams};
pub use range_allocator::{Range, RangeAllocator};
