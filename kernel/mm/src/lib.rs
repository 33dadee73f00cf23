//! `bekos-mm` --- memory management for the bekOS kernel.
//!
//! Contains the physical page allocator, the three-tier kernel heap, the
//! stage-1 translation-table manager, MMIO device areas, DMA region
//! helpers, and the per-process address-space manager.
//!
//! All algorithms are pure over an "identity window" translation
//! ([`ident`]) that maps physical frames into kernel-visible memory. On the
//! kernel target the window is the high-half identity mapping; in host
//! tests the offset is zero and heap buffers stand in for physical frames,
//! which makes every allocator and the table walker testable off-target.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address_space;
pub mod areas;
pub mod dma;
pub mod heap;
pub mod ident;
pub mod layout;
pub mod pmm;
pub mod table;

mod bitmap;
mod slab;

pub use address_space::{Backing, MemoryOperation, SpaceManager, UserspaceRegion};
pub use areas::{DeviceArea, PcieDeviceArea};
pub use table::{MemAttrIndex, PageAttributes, TableManager};

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for host tests: a global page allocator backed by a
    //! leaked, page-aligned heap buffer (identity window offset zero).

    use bekos_core::addr::{PAGE_SIZE, PhysAddr, PhysRegion};
    use std::sync::Once;

    static INIT: Once = Once::new();

    /// Size of the backing window handed to the global page allocator.
    const TEST_WINDOW_SIZE: usize = 8 * 1024 * 1024;

    /// Initialises the global page allocator exactly once per test process.
    pub fn init_test_pmm() {
        INIT.call_once(|| {
            let layout =
                std::alloc::Layout::from_size_align(TEST_WINDOW_SIZE, PAGE_SIZE as usize).unwrap();
            // SAFETY: layout has non-zero size; the buffer is leaked so the
            // allocator's window lives for the whole test process.
            let buf = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!buf.is_null());
            let region = PhysRegion::new(PhysAddr::new(buf as u64), TEST_WINDOW_SIZE as u64);
            crate::pmm::init();
            crate::pmm::with(|pa| pa.register_new_region(region));
        });
    }
}
