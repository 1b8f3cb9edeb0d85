//! ✂️ RangeAllocator: hands out the next slice of the object, one caller at a time.
//!
//! Think deli counter. Take a number, get the next `chunk_size` bytes of the
//! object. When the meat runs out, every further ticket says "offset = size,
//! length = 0" and keeps saying it forever.

use std::sync::{Mutex, MutexGuard};

/// 📏 A byte range of an object. Immutable once handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub offset: u64,
    pub length: u64,
}

impl Range {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// One past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// The zero-length marker the allocator hands out once the object is exhausted.
    pub fn is_end_marker(&self) -> bool {
        self.length == 0
    }
}

/// ✂️ Splits `[0, object_size)` into `chunk_size` ranges, in order, exactly once.
#[derive(Debug)]
pub struct RangeAllocator {
    object_size: u64,
    chunk_size: u64,
    cursor: Mutex<u64>,
}

impl RangeAllocator {
    pub fn new(object_size: u64, chunk_size: u64) -> Self {
        Self {
            object_size,
            chunk_size,
            cursor: Mutex::new(0),
        }
    }

    // -- the cursor is a plain integer; a poisoned lock still holds a valid one
    fn lock(&self) -> MutexGuard<'_, u64> {
        self.cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims the next unclaimed range: `min(chunk_size, remaining)` bytes.
    /// Once nothing remains, returns `{object_size, 0}` on every call.
    pub fn next_range(&self) -> Range {
        let mut cursor = self.lock();
        let remaining = self.object_size - *cursor;
        let length = remaining.min(self.chunk_size);
        let range = Range::new(*cursor, length);
        *cursor += length;
        range
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(allocator: &RangeAllocator) -> Vec<Range> {
        let mut ranges = Vec::new();
        loop {
            let range = allocator.next_range();
            if range.is_end_marker() {
                return ranges;
            }
            ranges.push(range);
        }
    }

    #[test]
    fn the_one_where_4096_bytes_get_cut_into_thousands() {
        let the_allocator = RangeAllocator::new(4096, 1000);
        assert_eq!(the_allocator.next_range(), Range::new(0, 1000));
        assert_eq!(the_allocator.next_range(), Range::new(1000, 1000));
        assert_eq!(the_allocator.next_range(), Range::new(2000, 1000));
        assert_eq!(the_allocator.next_range(), Range::new(3000, 1000));
        assert_eq!(the_allocator.next_range(), Range::new(4000, 96));
        assert_eq!(the_allocator.next_range(), Range::new(4096, 0));
        assert_eq!(the_allocator.next_range(), Range::new(4096, 0));
    }

    #[test]
    fn the_one_where_the_chunk_is_bigger_than_the_object() {
        let the_allocator = RangeAllocator::new(127, 1024);
        assert_eq!(the_allocator.next_range(), Range::new(0, 127));
        assert_eq!(the_allocator.next_range(), Range::new(127, 0));
    }

    #[test]
    fn the_one_where_sizes_line_up_exactly() {
        let the_allocator = RangeAllocator::new(1024, 1024);
        assert_eq!(the_allocator.next_range(), Range::new(0, 1024));
        assert_eq!(the_allocator.next_range(), Range::new(1024, 0));

        let the_allocator = RangeAllocator::new(4096, 1024);
        assert_eq!(drain(&the_allocator).len(), 4);
        assert_eq!(the_allocator.next_range(), Range::new(4096, 0));
    }

    #[test]
    fn the_one_where_an_empty_object_ends_before_it_begins() {
        let the_allocator = RangeAllocator::new(0, 64);
        assert_eq!(the_allocator.next_range(), Range::new(0, 0));
        assert_eq!(the_allocator.next_range(), Range::new(0, 0));
    }

    #[test]
    fn the_one_where_a_crowd_of_threads_still_partitions_the_object() {
        let the_allocator = RangeAllocator::new(1_000_003, 4096);
        let mut the_claims: Vec<Range> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| drain(&the_allocator)))
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().expect("💀 allocator thread panicked"))
                .collect()
        });

        the_claims.sort_by_key(|range| range.offset);
        let mut expected_offset = 0;
        for range in &the_claims {
            assert_eq!(range.offset, expected_offset, "gap or overlap at {range:?}");
            expected_offset = range.end();
        }
        assert_eq!(expected_offset, 1_000_003);
    }
}
