//! DMA regions and cache maintenance for device-shared memory.
//!
//! A [`DmaRegion`] is a contiguous run of frames with three views: the
//! physical region (ownership), the kernel-virtual window (CPU access) and
//! the device address (what the bus master sees, translated through
//! `dma-ranges`). [`DmaPool`] captures the physical→device translation of
//! one bus so drivers can allocate without carrying it around.
//!
//! Coherency is explicit: [`DmaRegion::sync_after_write`] cleans the cache
//! to the point of coherency before the device reads, and
//! [`DmaRegion::sync_before_read`] invalidates before the CPU reads what
//! the device wrote. The actual cache operations are architecture code
//! registered at boot; host tests run with the no-op defaults.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicPtr, Ordering};

use bekos_core::addr::{DmaAddr, PAGE_SIZE, PhysRegion, VirtAddr};
use bekos_core::{SysError, SysResult};

use crate::{ident, pmm};

/// Cache maintenance function: operates on `[virt, virt+len)`.
pub type CacheOpFn = fn(VirtAddr, usize);

fn nop_cache_op(_virt: VirtAddr, _len: usize) {}

static CLEAN_FN: AtomicPtr<()> = AtomicPtr::new(nop_cache_op as *mut ());
static INVALIDATE_FN: AtomicPtr<()> = AtomicPtr::new(nop_cache_op as *mut ());

/// Registers the architecture's clean / invalidate operations.
pub fn register_cache_ops(clean: CacheOpFn, invalidate: CacheOpFn) {
    CLEAN_FN.store(clean as *mut (), Ordering::Release);
    INVALIDATE_FN.store(invalidate as *mut (), Ordering::Release);
}

fn call_cache_op(slot: &AtomicPtr<()>, virt: VirtAddr, len: usize) {
    let ptr = slot.load(Ordering::Acquire);
    // SAFETY: Only valid `CacheOpFn` pointers are stored in the slots.
    let f: CacheOpFn = unsafe { core::mem::transmute(ptr) };
    f(virt, len);
}

// ---------------------------------------------------------------------------
// DmaPool
// ---------------------------------------------------------------------------

/// Allocator handle for one bus's DMA-capable memory.
///
/// Carries the physical→device address offset resolved from the owning
/// device-tree node's `dma-ranges` chain (zero when the bus sees physical
/// addresses directly).
#[derive(Debug, Clone, Copy)]
pub struct DmaPool {
    /// Added to a physical address to obtain the device's view.
    dma_offset: u64,
}

impl DmaPool {
    /// A pool whose bus sees physical addresses unchanged.
    #[must_use]
    pub const fn identity() -> Self {
        Self { dma_offset: 0 }
    }

    /// A pool with a fixed physical→device offset.
    #[must_use]
    pub const fn with_offset(dma_offset: u64) -> Self {
        Self { dma_offset }
    }

    /// Translates a physical address to the bus's view.
    #[must_use]
    pub fn phys_to_dma(&self, phys: bekos_core::PhysAddr) -> DmaAddr {
        DmaAddr::new(phys.as_u64().wrapping_add(self.dma_offset))
    }

    /// Allocates a zeroed DMA region of at least `size` bytes.
    ///
    /// The region is page-granular, which satisfies any power-of-two
    /// alignment up to the page size.
    ///
    /// # Errors
    ///
    /// Returns `ENOMEM` when no contiguous run is available.
    pub fn allocate(&self, size: usize) -> SysResult<DmaRegion> {
        let pages = size.div_ceil(PAGE_SIZE as usize).max(1);
        let region = pmm::with(|pa| pa.allocate_region(pages)).ok_or(SysError::NoMemory)?;
        let virt = ident::phys_to_virt(region.start);
        // SAFETY: Freshly allocated frames, identity-mapped for the kernel.
        unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, region.size as usize) };
        Ok(DmaRegion {
            phys: region,
            virt,
            dma: self.phys_to_dma(region.start),
            owned: true,
        })
    }
}

// ---------------------------------------------------------------------------
// DmaRegion
// ---------------------------------------------------------------------------

/// An owned, pinned, physically-contiguous buffer shared with a device.
pub struct DmaRegion {
    phys: PhysRegion,
    virt: VirtAddr,
    dma: DmaAddr,
    owned: bool,
}

impl DmaRegion {
    /// Wraps an existing buffer without taking ownership of its frames.
    ///
    /// Used by host tests and by regions whose memory is owned elsewhere.
    ///
    /// # Safety
    ///
    /// `[virt, virt+size)` must be valid for reads and writes for the
    /// region's lifetime, and `dma` must be the device's view of it.
    #[must_use]
    pub unsafe fn from_raw(phys: PhysRegion, virt: VirtAddr, dma: DmaAddr) -> Self {
        Self {
            phys,
            virt,
            dma,
            owned: false,
        }
    }

    /// Returns the device's address of the buffer.
    #[must_use]
    pub fn dma_ptr(&self) -> DmaAddr {
        self.dma
    }

    /// Returns the kernel-virtual base of the buffer.
    #[must_use]
    pub fn virt_base(&self) -> VirtAddr {
        self.virt
    }

    /// Returns the size of the buffer in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.phys.size as usize
    }

    /// Returns the buffer as a byte slice.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: The region owns (or was promised, in `from_raw`) this
        // memory for its lifetime.
        unsafe { core::slice::from_raw_parts(self.virt.as_ptr(), self.size()) }
    }

    /// Returns the buffer as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: As in `as_slice`; `&mut self` gives exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.virt.as_mut_ptr(), self.size()) }
    }

    /// Cleans the cache after CPU writes so the device observes them.
    pub fn sync_after_write(&self) {
        call_cache_op(&CLEAN_FN, self.virt, self.size());
    }

    /// Invalidates the cache before CPU reads of device-written data.
    pub fn sync_before_read(&self) {
        call_cache_op(&INVALIDATE_FN, self.virt, self.size());
    }

    /// Cleans only the `len` bytes at `offset`.
    pub fn sync_range_after_write(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.size());
        call_cache_op(&CLEAN_FN, self.virt + offset as u64, len);
    }

    /// Invalidates only the `len` bytes at `offset`.
    pub fn sync_range_before_read(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.size());
        call_cache_op(&INVALIDATE_FN, self.virt + offset as u64, len);
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        if self.owned {
            pmm::with(|pa| pa.free_region(self.phys.start));
        }
    }
}

// ---------------------------------------------------------------------------
// DmaArray
// ---------------------------------------------------------------------------

/// A typed array view over a [`DmaRegion`].
///
/// Element access is by value; explicit sync calls publish writes to the
/// device and fetch its updates, mirroring the cycle-bit discipline of the
/// ring consumers built on top.
pub struct DmaArray<T: Copy> {
    region: DmaRegion,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy> DmaArray<T> {
    /// Allocates a zeroed array of `len` elements from `pool`.
    ///
    /// # Errors
    ///
    /// Returns `ENOMEM` when the backing region cannot be allocated.
    pub fn new(pool: &DmaPool, len: usize) -> SysResult<Self> {
        let region = pool.allocate(len * size_of::<T>())?;
        Ok(Self::over(region, len))
    }

    /// Builds the view over an existing region.
    #[must_use]
    pub fn over(region: DmaRegion, len: usize) -> Self {
        assert!(len * size_of::<T>() <= region.size());
        Self {
            region,
            len,
            _marker: PhantomData,
        }
    }

    /// Returns the number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the array holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the device address of the first element.
    #[must_use]
    pub fn dma_ptr(&self) -> DmaAddr {
        self.region.dma_ptr()
    }

    /// Returns the device address of element `index`.
    #[must_use]
    pub fn dma_ptr_of(&self, index: usize) -> DmaAddr {
        assert!(index < self.len);
        self.region.dma_ptr() + (index * size_of::<T>()) as u64
    }

    /// Reads element `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> T {
        assert!(index < self.len);
        // SAFETY: index bounds-checked; region outlives the read.
        unsafe { self.region.virt.as_ptr::<T>().add(index).read() }
    }

    /// Writes element `index`.
    pub fn set(&mut self, index: usize, value: T) {
        assert!(index < self.len);
        // SAFETY: index bounds-checked; `&mut self` gives exclusivity.
        unsafe { self.region.virt.as_mut_ptr::<T>().add(index).write(value) };
    }

    /// Publishes element `index` to the device.
    pub fn sync_element_after_write(&self, index: usize) {
        self.region
            .sync_range_after_write(index * size_of::<T>(), size_of::<T>());
    }

    /// Fetches element `index` from the device.
    pub fn sync_element_before_read(&self, index: usize) {
        self.region
            .sync_range_before_read(index * size_of::<T>(), size_of::<T>());
    }

    /// Publishes the whole array to the device.
    pub fn sync_after_write(&self) {
        self.region.sync_after_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bekos_core::PhysAddr;

    #[test]
    fn pool_allocation_round_trip() {
        crate::test_support::init_test_pmm();
        let pool = DmaPool::identity();
        let mut region = pool.allocate(100).unwrap();
        assert_eq!(region.size(), PAGE_SIZE as usize);
        assert!(region.as_slice().iter().all(|&b| b == 0));
        region.as_mut_slice()[0] = 0xAA;
        assert_eq!(region.as_slice()[0], 0xAA);
        assert_eq!(region.dma_ptr().as_u64(), region.virt_base().as_u64());
    }

    #[test]
    fn pool_offset_translation() {
        let pool = DmaPool::with_offset(0xC000_0000);
        let dma = pool.phys_to_dma(PhysAddr::new(0x1000));
        assert_eq!(dma.as_u64(), 0xC000_1000);
    }

    #[test]
    fn typed_array_access() {
        crate::test_support::init_test_pmm();
        let pool = DmaPool::identity();
        let mut array: DmaArray<[u32; 4]> = DmaArray::new(&pool, 16).unwrap();
        assert_eq!(array.len(), 16);
        array.set(3, [1, 2, 3, 4]);
        assert_eq!(array.get(3), [1, 2, 3, 4]);
        assert_eq!(
            array.dma_ptr_of(3).as_u64(),
            array.dma_ptr().as_u64() + 3 * 16
        );
        array.sync_element_after_write(3);
        array.sync_element_before_read(3);
    }
}
