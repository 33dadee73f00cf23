//! The kernel heap: slab tier, bitmap tier, page tier.
//!
//! Requests are served by the first tier that fits:
//!
//! 1. **Slabs**: six fixed sizes (32..1024 bytes) for small objects.
//! 2. **Bitmap**: 128-byte chunks for anything below 64 KiB the slabs
//!    rejected (including over-aligned small requests).
//! 3. **Pages**: whole pages from the page allocator for 64 KiB and up.
//!
//! The contract is `allocate(size, align) -> (ptr, actual)` with
//! `actual >= size`, and `free(ptr, size, align)` accepting any size in
//! `[requested, actual]`; the pair always routes to the tier that served
//! the allocation.

use bekos_core::addr::{PAGE_SIZE, VirtAddr};
use bekos_core::sync::IrqSpinLock;

use crate::bitmap::BitmapAllocator;
use crate::slab::SlabAllocator;
use crate::{ident, pmm};

/// Requests at or above this size go straight to the page tier.
pub const PAGE_TIER_THRESHOLD: usize = 64 * 1024;

/// The slab sizes, smallest first.
const SLAB_SIZES: [usize; 6] = [32, 64, 128, 256, 512, 1024];

/// The assembled three-tier allocator.
pub struct KernelAllocator {
    bitmap: BitmapAllocator,
    slabs: [SlabAllocator; 6],
}

impl KernelAllocator {
    /// Creates the heap over an initial byte region (chunk-aligned).
    #[must_use]
    pub fn new(initial: VirtAddr, size: usize) -> Self {
        Self {
            bitmap: BitmapAllocator::new(initial, size),
            slabs: SLAB_SIZES.map(SlabAllocator::new),
        }
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// Returns the pointer and the actual usable size, or `None` if every
    /// eligible tier is exhausted.
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<(VirtAddr, usize)> {
        if size >= PAGE_TIER_THRESHOLD {
            assert!(align as u64 <= PAGE_SIZE, "page tier caps alignment at 4 KiB");
            let pages = size.div_ceil(PAGE_SIZE as usize);
            let region = pmm::with(|pa| pa.allocate_region(pages))?;
            return Some((ident::phys_to_virt(region.start), pages * PAGE_SIZE as usize));
        }

        for index in 0..self.slabs.len() {
            let obj = self.slabs[index].object_size();
            if size <= obj && align <= obj {
                if let Some(ptr) = self.slabs[index].allocate() {
                    return Some((ptr, obj));
                }
                // The slab needs a new block from the bitmap tier.
                let blk = self.slabs[index].block_size();
                let block = self.bitmap.allocate(blk, blk)?;
                // SAFETY: The bitmap tier just handed us `blk` exclusive,
                // blk-aligned bytes.
                unsafe { self.slabs[index].add_block(block) };
                let ptr = self.slabs[index].allocate()?;
                return Some((ptr, obj));
            }
        }

        let ptr = self.bitmap.allocate(size, align)?;
        let actual = size.div_ceil(crate::bitmap::CHUNK_SIZE).max(1) * crate::bitmap::CHUNK_SIZE;
        Some((ptr, actual))
    }

    /// Frees a prior allocation. `size` and `align` must route to the tier
    /// that served it: any size in `[requested, actual]` does.
    pub fn free(&mut self, ptr: VirtAddr, size: usize, align: usize) {
        if size >= PAGE_TIER_THRESHOLD {
            assert!(ptr.is_aligned(PAGE_SIZE));
            pmm::with(|pa| pa.free_region(ident::virt_to_phys(ptr)));
            return;
        }

        for slab in &mut self.slabs {
            let obj = slab.object_size();
            if size <= obj && align <= obj {
                slab.free(ptr);
                return;
            }
        }

        self.bitmap.free(ptr, size);
    }

    /// Returns `(free_bytes, total_bytes)` across the bitmap and slab tiers.
    #[must_use]
    pub fn usage(&self) -> (usize, usize) {
        let mut free = self.bitmap.free_bytes();
        let total = self.bitmap.total_bytes();
        for slab in &self.slabs {
            free += slab.free_bytes();
        }
        (free, total)
    }
}

// ---------------------------------------------------------------------------
// Global heap
// ---------------------------------------------------------------------------

static KERNEL_HEAP: IrqSpinLock<Option<KernelAllocator>> = IrqSpinLock::new(None);

/// Initialises the global heap over the initial allocation region.
///
/// # Panics
///
/// Panics if called twice.
pub fn init(initial: VirtAddr, size: usize) {
    let mut heap = KERNEL_HEAP.lock();
    assert!(heap.is_none(), "kernel heap already initialised");
    *heap = Some(KernelAllocator::new(initial, size));
}

/// Allocates from the global heap.
pub fn allocate(size: usize, align: usize) -> Option<(VirtAddr, usize)> {
    let mut heap = KERNEL_HEAP.lock();
    heap.as_mut()
        .expect("kernel heap not initialised")
        .allocate(size, align)
}

/// Frees into the global heap.
pub fn free(ptr: VirtAddr, size: usize, align: usize) {
    let mut heap = KERNEL_HEAP.lock();
    heap.as_mut()
        .expect("kernel heap not initialised")
        .free(ptr, size, align);
}

/// Returns `(free_bytes, total_bytes)` of the global heap.
#[must_use]
pub fn usage() -> (usize, usize) {
    let heap = KERNEL_HEAP.lock();
    heap.as_ref().map_or((0, 0), KernelAllocator::usage)
}

/// `GlobalAlloc` adapter over the global heap.
///
/// Registered with `#[global_allocator]` by the kernel crate on the
/// `target_os = "none"` build.
pub struct GlobalHeap;

// SAFETY: Delegates to the locked global heap; pointers are only returned
// once and sizes/alignments are taken from the Layout on both sides.
unsafe impl core::alloc::GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        match allocate(layout.size().max(1), layout.align()) {
            Some((ptr, _actual)) => ptr.as_mut_ptr(),
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: core::alloc::Layout) {
        if !ptr.is_null() {
            free(VirtAddr::new(ptr as u64), layout.size().max(1), layout.align());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::Layout;

    const HEAP_SIZE: usize = 1024 * 1024;

    fn make_heap() -> KernelAllocator {
        let layout = Layout::from_size_align(HEAP_SIZE, 4096).unwrap();
        // SAFETY: non-zero size; leaked for the test lifetime.
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!buf.is_null());
        KernelAllocator::new(VirtAddr::new(buf as u64), HEAP_SIZE)
    }

    #[test]
    fn small_requests_get_slab_actual_size() {
        let mut heap = make_heap();
        let (_, actual) = heap.allocate(20, 8).unwrap();
        assert_eq!(actual, 32);
        let (_, actual) = heap.allocate(100, 8).unwrap();
        assert_eq!(actual, 128);
        let (_, actual) = heap.allocate(1024, 8).unwrap();
        assert_eq!(actual, 1024);
    }

    #[test]
    fn medium_requests_use_bitmap_tier() {
        let mut heap = make_heap();
        let (ptr, actual) = heap.allocate(2000, 8).unwrap();
        assert!(actual >= 2000);
        assert_eq!(actual % 128, 0);
        heap.free(ptr, 2000, 8);
    }

    #[test]
    fn over_aligned_small_request_skips_slabs() {
        let mut heap = make_heap();
        // 64-byte request with 4096 alignment cannot come from a slab.
        let (ptr, _) = heap.allocate(64, 4096).unwrap();
        assert!(ptr.is_aligned(4096));
        heap.free(ptr, 64, 4096);
    }

    #[test]
    fn free_accepts_any_size_between_requested_and_actual() {
        let mut heap = make_heap();

        let (a, actual) = heap.allocate(40, 8).unwrap();
        assert_eq!(actual, 64);
        // Caller may remember either the requested or the rounded size.
        heap.free(a, 50, 8);

        let (b, _) = heap.allocate(40, 8).unwrap();
        assert_eq!(a, b);
        heap.free(b, 64, 8);
    }

    #[test]
    fn accounting_round_trip() {
        // Invariant: total - free returns to its pre-sequence value after
        // every allocation is freed. The baseline is taken after a warm-up
        // pass so slab block acquisition does not skew the numbers.
        let mut heap = make_heap();
        const SIZES: [usize; 8] = [16, 48, 90, 200, 700, 1024, 3000, 8000];

        let run = |heap: &mut KernelAllocator| {
            let live: Vec<(VirtAddr, usize)> = SIZES
                .iter()
                .map(|&size| (heap.allocate(size, 8).unwrap().0, size))
                .collect();
            for (ptr, size) in live {
                heap.free(ptr, size, 8);
            }
        };

        run(&mut heap);
        let (free_before, total) = heap.usage();
        run(&mut heap);
        let (free_after, total_after) = heap.usage();
        assert_eq!(total, total_after);
        assert_eq!(free_after, free_before);
    }

    #[test]
    fn many_small_allocations_distinct() {
        let mut heap = make_heap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            let (ptr, _) = heap.allocate(64, 8).unwrap();
            assert!(seen.insert(ptr.as_u64()), "duplicate heap pointer");
        }
    }

    #[test]
    fn page_tier_round_trip() {
        crate::test_support::init_test_pmm();
        let mut heap = make_heap();
        let (ptr, actual) = heap.allocate(PAGE_TIER_THRESHOLD, 4096).unwrap();
        assert!(ptr.is_aligned(PAGE_SIZE));
        assert_eq!(actual, PAGE_TIER_THRESHOLD);
        // Writable across the whole range.
        // SAFETY: the page tier handed us `actual` exclusive bytes.
        unsafe { core::ptr::write_bytes(ptr.as_mut_ptr::<u8>(), 0xA5, actual) };
        heap.free(ptr, PAGE_TIER_THRESHOLD, 4096);
    }
}
