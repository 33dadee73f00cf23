//! The kernel memory manager.
//!
//! Owns the kernel's root translation table after boot hands it over, and
//! maps device MMIO regions into a dedicated high-half hole, handing out
//! [`DeviceArea`] views to drivers.

use bekos_core::addr::{PAGE_SIZE, PhysRegion, VirtAddr};
use bekos_core::sync::SpinLock;
use bekos_core::{SysError, SysResult};
use bekos_mm::areas::DeviceArea;
use bekos_mm::layout::{MMIO_HOLE_BASE, MMIO_HOLE_SIZE};
use bekos_mm::table::{MemAttrIndex, PageAttributes, TableManager};

/// The memory manager: kernel table plus the MMIO hole cursor.
pub struct MemoryManager {
    tables: TableManager,
    mmio_next: u64,
}

impl MemoryManager {
    /// Maps a physical MMIO region with device attributes and returns the
    /// kernel's view of it.
    ///
    /// The region is widened to page boundaries; the returned area points
    /// at the requested start, not the page base.
    ///
    /// # Errors
    ///
    /// `ENOMEM` when the hole is exhausted, plus any mapping failure.
    pub fn map_for_io(&mut self, region: PhysRegion) -> SysResult<DeviceArea> {
        let page_base = region.start.page_base();
        let offset = region.start.page_offset();
        let mapped_size = (region.size + offset).div_ceil(PAGE_SIZE) * PAGE_SIZE;

        if self.mmio_next + mapped_size > MMIO_HOLE_BASE + MMIO_HOLE_SIZE {
            return Err(SysError::NoMemory);
        }
        let virt = VirtAddr::new_truncate(self.mmio_next);
        self.tables.map_region(
            virt,
            page_base,
            mapped_size,
            PageAttributes::DEVICE,
            MemAttrIndex::Device,
        )?;
        self.mmio_next += mapped_size;

        // SAFETY: The range was just mapped with device attributes and the
        // hole cursor never reuses it.
        Ok(unsafe { DeviceArea::new(region.start, virt + offset, region.size) })
    }

    /// Returns the kernel table manager (for boot-time kernel mappings).
    pub fn tables(&mut self) -> &mut TableManager {
        &mut self.tables
    }
}

static MEMORY_MANAGER: SpinLock<Option<MemoryManager>> = SpinLock::new(None);

/// Hands the kernel's root table to the memory manager. Called once from
/// the boot path.
pub fn init(tables: TableManager) {
    let mut manager = MEMORY_MANAGER.lock();
    assert!(manager.is_none(), "memory manager already initialised");
    *manager = Some(MemoryManager {
        tables,
        mmio_next: MMIO_HOLE_BASE,
    });
}

/// Runs a closure against the global memory manager.
///
/// # Panics
///
/// Panics before [`init`].
pub fn with<R>(f: impl FnOnce(&mut MemoryManager) -> R) -> R {
    let mut manager = MEMORY_MANAGER.lock();
    f(manager.as_mut().expect("memory manager not initialised"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bekos_core::addr::PhysAddr;
    use std::alloc::Layout;

    fn manager() -> MemoryManager {
        let layout = Layout::from_size_align(16 * 4096, 4096).unwrap();
        // SAFETY: non-zero size; leaked for the test's lifetime.
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!buf.is_null());
        let root = PhysAddr::new(buf as u64);
        // SAFETY: fresh zeroed root with exclusive scratch.
        let tables =
            unsafe { TableManager::global(root, root + 4096, root + 16 * 4096) };
        MemoryManager {
            tables,
            mmio_next: MMIO_HOLE_BASE,
        }
    }

    #[test]
    fn io_mapping_lands_in_the_hole() {
        let mut mm = manager();
        let area = mm
            .map_for_io(PhysRegion::new(PhysAddr::new(0xFD50_0000), 0x1000))
            .unwrap();
        assert_eq!(area.size(), 0x1000);
        assert_eq!(area.virt_base().as_u64(), MMIO_HOLE_BASE);
        // The mapping is walkable and device-typed.
        let translation = mm.tables().translate(area.virt_base()).unwrap();
        assert_eq!(translation.phys.as_u64(), 0xFD50_0000);
        assert_eq!(translation.attr_idx, MemAttrIndex::Device);
        assert!(translation.attrs.contains(PageAttributes::PXN));
    }

    #[test]
    fn unaligned_region_keeps_its_offset() {
        let mut mm = manager();
        let area = mm
            .map_for_io(PhysRegion::new(PhysAddr::new(0x3F20_1040), 0x90))
            .unwrap();
        assert_eq!(area.phys_base().as_u64(), 0x3F20_1040);
        assert_eq!(area.virt_base().as_u64() & 0xFFF, 0x40);
        let translation = mm.tables().translate(area.virt_base()).unwrap();
        assert_eq!(translation.phys.as_u64(), 0x3F20_1040);
    }

    #[test]
    fn successive_mappings_do_not_overlap() {
        let mut mm = manager();
        let a = mm
            .map_for_io(PhysRegion::new(PhysAddr::new(0xF000_0000), 0x2000))
            .unwrap();
        let b = mm
            .map_for_io(PhysRegion::new(PhysAddr::new(0xF100_0000), 0x2000))
            .unwrap();
        assert!(b.virt_base().as_u64() >= a.virt_base().as_u64() + 0x2000);
    }
}
