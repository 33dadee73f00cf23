//! Chunked bitmap allocator: the heap's middle tier.
//!
//! Carves a byte region into 128-byte chunks tracked by a bitmap stored at
//! the end of the region (after the chunk area). Serves requests the slabs
//! rejected, up to just under the page tier's 64 KiB threshold.

use bekos_core::addr::VirtAddr;

/// Allocation granule of the bitmap tier.
pub const CHUNK_SIZE: usize = 128;

const BITS_PER_WORD: usize = 64;

pub(crate) struct BitmapAllocator {
    data: VirtAddr,
    chunk_count: usize,
    allocated_chunks: usize,
}

/// Chunks that fit in `size` bytes once each chunk also pays for its
/// bitmap bit.
const fn chunk_count_for(size: usize) -> usize {
    (size * 8) / (CHUNK_SIZE * 8 + 1)
}

impl BitmapAllocator {
    /// Creates an allocator over `[data, data+size)`.
    ///
    /// `data` must be chunk-aligned; the bitmap is placed after the chunk
    /// area and zeroed.
    pub(crate) fn new(data: VirtAddr, size: usize) -> Self {
        assert!(data.is_aligned(CHUNK_SIZE as u64), "base must be chunk-aligned");
        let chunk_count = chunk_count_for(size);
        let words = chunk_count.div_ceil(BITS_PER_WORD);
        assert!(chunk_count * CHUNK_SIZE + words * 8 <= size);

        let this = Self {
            data,
            chunk_count,
            allocated_chunks: 0,
        };
        // SAFETY: The bitmap area lies inside the region handed to us.
        unsafe { core::ptr::write_bytes(this.bitmap_ptr(), 0, words) };
        this
    }

    fn bitmap_ptr(&self) -> *mut u64 {
        (self.data + (self.chunk_count * CHUNK_SIZE) as u64).as_mut_ptr()
    }

    fn bit(&self, index: usize) -> bool {
        // SAFETY: index < chunk_count, within the bitmap area.
        unsafe {
            self.bitmap_ptr()
                .add(index / BITS_PER_WORD)
                .read()
                & (1u64 << (index % BITS_PER_WORD))
                != 0
        }
    }

    fn set_bit(&mut self, index: usize, value: bool) {
        // SAFETY: index < chunk_count, within the bitmap area.
        unsafe {
            let word = self.bitmap_ptr().add(index / BITS_PER_WORD);
            let mask = 1u64 << (index % BITS_PER_WORD);
            if value {
                word.write(word.read() | mask);
            } else {
                word.write(word.read() & !mask);
            }
        }
    }

    /// Allocates `size` bytes with the given alignment.
    ///
    /// Alignment is honoured up to chunk multiples: both `align` and
    /// `CHUNK_SIZE` being powers of two guarantees a chunk boundary that is
    /// `align`-aligned exists every `ceil(align / CHUNK_SIZE)` chunks.
    pub(crate) fn allocate(&mut self, size: usize, align: usize) -> Option<VirtAddr> {
        let chunks_needed = size.div_ceil(CHUNK_SIZE).max(1);
        let chunk_align = align.div_ceil(CHUNK_SIZE).max(1);
        debug_assert!((chunk_align * CHUNK_SIZE) % align == 0);

        let base_chunk = (self.data.as_u64() as usize) / CHUNK_SIZE;

        let mut start = 0usize;
        'search: while start + chunks_needed <= self.chunk_count {
            if (base_chunk + start) % chunk_align != 0 {
                start += 1;
                continue;
            }
            for offset in 0..chunks_needed {
                if self.bit(start + offset) {
                    start += offset + 1;
                    continue 'search;
                }
            }
            for offset in 0..chunks_needed {
                self.set_bit(start + offset, true);
            }
            self.allocated_chunks += chunks_needed;
            return Some(self.data + (start * CHUNK_SIZE) as u64);
        }
        None
    }

    /// Frees a prior allocation. `size` may be any value whose chunk count
    /// matches the original request's.
    pub(crate) fn free(&mut self, ptr: VirtAddr, size: usize) {
        let offset = (ptr - self.data) as usize;
        debug_assert!(offset % CHUNK_SIZE == 0, "pointer not chunk-aligned");
        debug_assert!(offset / CHUNK_SIZE < self.chunk_count);
        let first = offset / CHUNK_SIZE;
        let chunks = size.div_ceil(CHUNK_SIZE).max(1);
        for index in first..first + chunks {
            debug_assert!(self.bit(index), "double free in bitmap tier");
            self.set_bit(index, false);
        }
        self.allocated_chunks -= chunks;
    }

    /// Returns `true` if `ptr` lies inside the chunk area.
    pub(crate) fn owns(&self, ptr: VirtAddr) -> bool {
        self.data <= ptr && ptr < self.data + (self.chunk_count * CHUNK_SIZE) as u64
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.chunk_count * CHUNK_SIZE
    }

    pub(crate) fn free_bytes(&self) -> usize {
        (self.chunk_count - self.allocated_chunks) * CHUNK_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::Layout;

    fn make(size: usize) -> BitmapAllocator {
        let layout = Layout::from_size_align(size, CHUNK_SIZE).unwrap();
        // SAFETY: non-zero size; leaked for the test's lifetime.
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!buf.is_null());
        BitmapAllocator::new(VirtAddr::new(buf as u64), size)
    }

    #[test]
    fn allocations_are_disjoint() {
        let mut alloc = make(64 * 1024);
        let a = alloc.allocate(300, 1).unwrap();
        let b = alloc.allocate(300, 1).unwrap();
        // 300 bytes round to 3 chunks.
        assert!(b.as_u64() >= a.as_u64() + 384 || a.as_u64() >= b.as_u64() + 384);
    }

    #[test]
    fn alignment_honoured() {
        let mut alloc = make(64 * 1024);
        let _pad = alloc.allocate(1, 1).unwrap();
        let aligned = alloc.allocate(100, 1024).unwrap();
        assert!(aligned.is_aligned(1024));
    }

    #[test]
    fn free_reuses_space() {
        let mut alloc = make(8 * 1024);
        let baseline = alloc.free_bytes();
        let a = alloc.allocate(1000, 1).unwrap();
        assert!(alloc.free_bytes() < baseline);
        alloc.free(a, 1000);
        assert_eq!(alloc.free_bytes(), baseline);

        let b = alloc.allocate(1000, 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn free_accepts_rounded_size() {
        let mut alloc = make(8 * 1024);
        let baseline = alloc.free_bytes();
        let a = alloc.allocate(130, 1).unwrap();
        // 130 requested, 256 actual: any size in between frees both chunks.
        alloc.free(a, 200);
        assert_eq!(alloc.free_bytes(), baseline);
    }

    #[test]
    fn exhaustion() {
        let mut alloc = make(4 * 1024);
        let mut count = 0;
        while alloc.allocate(CHUNK_SIZE, 1).is_some() {
            count += 1;
        }
        assert_eq!(count, alloc.total_bytes() / CHUNK_SIZE);
    }
}
