//! Physical page allocator.
//!
//! Physical memory is described as up to [`MAX_PHYSICAL_REGIONS`] windows,
//! each managed by a [`RegionPageAllocator`] that stores its own metadata
//! (a free bitmap and a continuation bitmap) in the first pages of the
//! window it manages. The continuation bitmap records, for every page of an
//! allocated run except the first, that it belongs to the run started
//! earlier; this is what lets [`free_region`](RegionPageAllocator::free_region)
//! recover the length of a block without being told.

use bekos_core::addr::{PAGE_SIZE, PhysAddr, PhysRegion};
use bekos_core::sync::IrqSpinLock;

use crate::ident;

const BITS_PER_WORD: usize = 64;

/// Maximum number of physical windows the allocator tracks.
pub const MAX_PHYSICAL_REGIONS: usize = 4;

/// Allocator for one contiguous window of physical pages.
///
/// Invariant: every frame of the window is free, reserved, or part of
/// exactly one allocated run whose first page has a clear continuation bit.
pub struct RegionPageAllocator {
    region: PhysRegion,
    page_count: usize,
    free_count: usize,
    /// Word-index hint for the next allocation search.
    search_hint: usize,
    free_bitmap: &'static mut [u64],
    continuation_bitmap: &'static mut [u64],
}

fn bit_is_set(map: &[u64], index: usize) -> bool {
    map[index / BITS_PER_WORD] & (1u64 << (index % BITS_PER_WORD)) != 0
}

fn set_bit(map: &mut [u64], index: usize, value: bool) {
    let word = &mut map[index / BITS_PER_WORD];
    let mask = 1u64 << (index % BITS_PER_WORD);
    if value {
        *word |= mask;
    } else {
        *word &= !mask;
    }
}

impl RegionPageAllocator {
    /// Creates an allocator over `region`, placing its bitmaps at the start
    /// of the window and reserving the pages they occupy.
    ///
    /// `region` must be page-aligned and large enough to hold the metadata.
    #[must_use]
    pub fn new(region: PhysRegion) -> Self {
        assert!(region.page_aligned(), "window must be page-aligned");
        let page_count = (region.size / PAGE_SIZE) as usize;
        let words = page_count.div_ceil(BITS_PER_WORD);

        let base = ident::phys_to_virt(region.start);
        // SAFETY: The window was handed to us exclusively; its first pages
        // become the bitmaps. Both slices are disjoint and within bounds
        // (checked below via metadata_pages <= page_count).
        let (free_bitmap, continuation_bitmap) = unsafe {
            let ptr = base.as_mut_ptr::<u64>();
            core::ptr::write_bytes(ptr, 0, 2 * words);
            (
                core::slice::from_raw_parts_mut(ptr, words),
                core::slice::from_raw_parts_mut(ptr.add(words), words),
            )
        };

        let metadata_bytes = (2 * words * 8) as u64;
        let metadata_pages = metadata_bytes.div_ceil(PAGE_SIZE) as usize;
        assert!(metadata_pages < page_count, "window too small for metadata");

        let mut allocator = Self {
            region,
            page_count,
            free_count: page_count,
            search_hint: 0,
            free_bitmap,
            continuation_bitmap,
        };

        // Pages beyond the window (bitmap tail bits) and the metadata pages
        // must never be handed out.
        for index in page_count..words * BITS_PER_WORD {
            set_bit(allocator.free_bitmap, index, true);
        }
        allocator.reserve_index_range(0, metadata_pages);
        allocator
    }

    /// Returns the window this allocator manages.
    #[must_use]
    pub fn region(&self) -> PhysRegion {
        self.region
    }

    /// Returns the number of currently free pages.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.free_count
    }

    fn reserve_index_range(&mut self, start: usize, count: usize) {
        for index in start..start + count {
            if index < self.page_count && !bit_is_set(self.free_bitmap, index) {
                set_bit(self.free_bitmap, index, true);
                self.free_count -= 1;
            }
        }
    }

    /// Marks a sub-window as reserved. `sub` must lie within the window.
    pub fn mark_as_reserved(&mut self, sub: PhysRegion) {
        assert!(self.region.contains(sub), "reservation outside window");
        let first = ((sub.start - self.region.start) / PAGE_SIZE) as usize;
        let count = (sub.size.div_ceil(PAGE_SIZE)) as usize;
        self.reserve_index_range(first, count);
    }

    /// Allocates a contiguous run of `n_pages` pages.
    pub fn allocate_region(&mut self, n_pages: usize) -> Option<PhysRegion> {
        if n_pages == 0 || self.free_count < n_pages {
            return None;
        }

        let words = self.free_bitmap.len();
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        let mut found = false;

        // Scan whole words from the hint, wrapping once.
        'outer: for word_offset in 0..=words {
            let word_idx = (self.search_hint + word_offset) % words;
            if word_offset > 0 && word_idx == self.search_hint {
                break;
            }
            let word = self.free_bitmap[word_idx];
            if word == u64::MAX {
                run_len = 0;
                continue;
            }
            for bit in 0..BITS_PER_WORD {
                let index = word_idx * BITS_PER_WORD + bit;
                if index >= self.page_count {
                    run_len = 0;
                    continue;
                }
                // A wrap restarts the run: runs must be physically contiguous.
                if run_len > 0 && run_start + run_len != index {
                    run_len = 0;
                }
                if word & (1u64 << bit) != 0 {
                    run_len = 0;
                } else {
                    if run_len == 0 {
                        run_start = index;
                    }
                    run_len += 1;
                    if run_len == n_pages {
                        found = true;
                        break 'outer;
                    }
                }
            }
        }

        if !found {
            return None;
        }

        set_bit(self.free_bitmap, run_start, true);
        for index in run_start + 1..run_start + n_pages {
            set_bit(self.free_bitmap, index, true);
            set_bit(self.continuation_bitmap, index, true);
        }
        self.free_count -= n_pages;
        self.search_hint = (run_start + n_pages) / BITS_PER_WORD % self.free_bitmap.len();

        Some(PhysRegion::new(
            self.region.start + run_start as u64 * PAGE_SIZE,
            n_pages as u64 * PAGE_SIZE,
        ))
    }

    /// Frees the run starting at `start`, recovering its length from the
    /// continuation bitmap. Returns the number of pages freed.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not the first page of an allocated run.
    pub fn free_region(&mut self, start: PhysAddr) -> usize {
        assert!(self.region.contains_addr(start), "free outside window");
        let first = ((start - self.region.start) / PAGE_SIZE) as usize;
        assert!(
            bit_is_set(self.free_bitmap, first),
            "freeing an unallocated page"
        );
        assert!(
            !bit_is_set(self.continuation_bitmap, first),
            "free must target the first page of a run"
        );

        set_bit(self.free_bitmap, first, false);
        let mut freed = 1;
        let mut index = first + 1;
        while index < self.page_count && bit_is_set(self.continuation_bitmap, index) {
            set_bit(self.continuation_bitmap, index, false);
            set_bit(self.free_bitmap, index, false);
            freed += 1;
            index += 1;
        }
        self.free_count += freed;
        let hint = first / BITS_PER_WORD;
        if hint < self.search_hint {
            self.search_hint = hint;
        }
        freed
    }
}

// ---------------------------------------------------------------------------
// Global allocator over all windows
// ---------------------------------------------------------------------------

/// The system-wide page allocator: a set of physical windows.
pub struct PageAllocator {
    regions: [Option<RegionPageAllocator>; MAX_PHYSICAL_REGIONS],
}

impl PageAllocator {
    const fn new() -> Self {
        Self {
            regions: [const { None }; MAX_PHYSICAL_REGIONS],
        }
    }

    /// Registers a new window of physical memory.
    ///
    /// # Panics
    ///
    /// Panics if the window table is full or the window overlaps an
    /// existing one.
    pub fn register_new_region(&mut self, region: PhysRegion) {
        for existing in self.regions.iter().flatten() {
            assert!(!existing.region().overlaps(region), "windows overlap");
        }
        let slot = self
            .regions
            .iter_mut()
            .find(|slot| slot.is_none())
            .expect("physical window table full");
        *slot = Some(RegionPageAllocator::new(region));
    }

    /// Marks a region of physical pages as reserved; it must be contained
    /// in a registered window.
    pub fn mark_as_reserved(&mut self, region: PhysRegion) {
        for allocator in self.regions.iter_mut().flatten() {
            if let Some(overlap) = allocator.region().intersection(region) {
                allocator.mark_as_reserved(overlap);
            }
        }
    }

    /// Allocates a contiguous run of `n_pages` pages from any window.
    pub fn allocate_region(&mut self, n_pages: usize) -> Option<PhysRegion> {
        self.regions
            .iter_mut()
            .flatten()
            .find_map(|a| a.allocate_region(n_pages))
    }

    /// Frees the run starting at `start`. Returns the number of pages freed.
    ///
    /// # Panics
    ///
    /// Panics if `start` lies in no registered window or was not the first
    /// page of an allocated run.
    pub fn free_region(&mut self, start: PhysAddr) -> usize {
        for allocator in self.regions.iter_mut().flatten() {
            if allocator.region().contains_addr(start) {
                return allocator.free_region(start);
            }
        }
        panic!("free_region: {start} is in no registered window");
    }

    /// Returns the total number of free pages across all windows.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.regions.iter().flatten().map(RegionPageAllocator::free_pages).sum()
    }
}

static PAGE_ALLOCATOR: IrqSpinLock<Option<PageAllocator>> = IrqSpinLock::new(None);

/// Initialises the global page allocator. Called once from the boot path,
/// before any window registration.
pub fn init() {
    let mut guard = PAGE_ALLOCATOR.lock();
    assert!(guard.is_none(), "page allocator already initialised");
    *guard = Some(PageAllocator::new());
}

/// Executes a closure with exclusive access to the global page allocator.
///
/// # Panics
///
/// Panics if [`init`] has not been called.
pub fn with<R>(f: impl FnOnce(&mut PageAllocator) -> R) -> R {
    let mut guard = PAGE_ALLOCATOR.lock();
    f(guard.as_mut().expect("page allocator not initialised"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::Layout;

    const WINDOW_PAGES: usize = 64;

    /// Allocates a page-aligned window and leaks it (test fixture).
    fn make_window(pages: usize) -> PhysRegion {
        let size = pages * PAGE_SIZE as usize;
        let layout = Layout::from_size_align(size, PAGE_SIZE as usize).unwrap();
        // SAFETY: Non-zero size; leaked for the test's lifetime.
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!buf.is_null());
        PhysRegion::new(PhysAddr::new(buf as u64), size as u64)
    }

    #[test]
    fn metadata_reserved_at_construction() {
        let allocator = RegionPageAllocator::new(make_window(WINDOW_PAGES));
        // One page of metadata for a 64-page window (2 bitmaps * 8 bytes).
        assert_eq!(allocator.free_pages(), WINDOW_PAGES - 1);
    }

    #[test]
    fn allocate_is_page_aligned_and_in_window() {
        let mut allocator = RegionPageAllocator::new(make_window(WINDOW_PAGES));
        let region = allocator.allocate_region(3).unwrap();
        assert!(region.page_aligned());
        assert_eq!(region.size, 3 * PAGE_SIZE);
        assert!(allocator.region().contains(region));
    }

    #[test]
    fn free_recovers_run_length() {
        let mut allocator = RegionPageAllocator::new(make_window(WINDOW_PAGES));
        let before = allocator.free_pages();

        let region = allocator.allocate_region(5).unwrap();
        assert_eq!(allocator.free_pages(), before - 5);

        // The size is not passed in: the continuation bitmap recovers it.
        let freed = allocator.free_region(region.start);
        assert_eq!(freed, 5);
        assert_eq!(allocator.free_pages(), before);
    }

    #[test]
    fn distinct_allocations_do_not_overlap() {
        let mut allocator = RegionPageAllocator::new(make_window(WINDOW_PAGES));
        let a = allocator.allocate_region(4).unwrap();
        let b = allocator.allocate_region(4).unwrap();
        assert!(!a.overlaps(b));
    }

    #[test]
    fn adjacent_runs_free_independently() {
        let mut allocator = RegionPageAllocator::new(make_window(WINDOW_PAGES));
        let a = allocator.allocate_region(2).unwrap();
        let b = allocator.allocate_region(2).unwrap();
        // Freeing a must not free b's pages even if physically adjacent.
        assert_eq!(allocator.free_region(a.start), 2);
        assert_eq!(allocator.free_region(b.start), 2);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut allocator = RegionPageAllocator::new(make_window(8));
        // 7 pages usable (1 metadata).
        assert!(allocator.allocate_region(8).is_none());
        let region = allocator.allocate_region(7).unwrap();
        assert!(allocator.allocate_region(1).is_none());
        allocator.free_region(region.start);
        assert!(allocator.allocate_region(1).is_some());
    }

    #[test]
    fn reserved_pages_never_allocated() {
        let window = make_window(WINDOW_PAGES);
        let mut allocator = RegionPageAllocator::new(window);
        let reserved = PhysRegion::new(window.start + 8 * PAGE_SIZE, 48 * PAGE_SIZE);
        allocator.mark_as_reserved(reserved);

        while let Some(region) = allocator.allocate_region(1) {
            assert!(
                region.intersection(reserved).is_none(),
                "allocated inside a reserved range"
            );
        }
    }

    #[test]
    fn accounting_round_trip() {
        // Invariant: after every allocation is freed, the free count
        // returns to its initial value.
        let mut allocator = RegionPageAllocator::new(make_window(WINDOW_PAGES));
        let initial = allocator.free_pages();

        let regions: Vec<PhysRegion> = (1..=4)
            .filter_map(|n| allocator.allocate_region(n))
            .collect();
        assert_eq!(regions.len(), 4);
        for region in &regions {
            allocator.free_region(region.start);
        }
        assert_eq!(allocator.free_pages(), initial);
    }

    #[test]
    fn multi_window_dispatch() {
        let mut pa = PageAllocator::new();
        let w1 = make_window(8);
        let w2 = make_window(8);
        pa.register_new_region(w1);
        pa.register_new_region(w2);

        // Exhaust the first window; further allocations come from the second.
        let mut allocated = Vec::new();
        while let Some(r) = pa.allocate_region(1) {
            allocated.push(r);
        }
        assert!(allocated.iter().any(|r| w1.contains(*r)));
        assert!(allocated.iter().any(|r| w2.contains(*r)));

        let total = pa.free_pages();
        assert_eq!(total, 0);
        for r in &allocated {
            pa.free_region(r.start);
        }
        assert_eq!(pa.free_pages(), allocated.len());
    }
}
