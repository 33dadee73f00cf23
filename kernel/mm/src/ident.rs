//! The identity window: kernel-visible views of physical frames.
//!
//! After boot, every RAM frame is mapped at `phys + VA_IDENT_OFFSET`. The
//! offset is stored here once during bring-up; all allocators and the table
//! walker translate through these helpers. The offset defaults to zero,
//! which is what host tests rely on (heap buffers stand in for frames).

use core::sync::atomic::{AtomicU64, Ordering};

use bekos_core::addr::{PhysAddr, VirtAddr};

static IDENT_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Records the identity-window offset. Called once from the boot path,
/// before the page allocator is constructed.
pub fn init(offset: u64) {
    IDENT_OFFSET.store(offset, Ordering::Release);
}

/// Returns the identity-window offset.
#[must_use]
pub fn offset() -> u64 {
    IDENT_OFFSET.load(Ordering::Acquire)
}

/// Returns the kernel-virtual view of a physical address.
#[must_use]
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new_truncate(phys.as_u64().wrapping_add(offset()))
}

/// Returns the physical address behind an identity-window virtual address.
///
/// Only valid for addresses previously produced by [`phys_to_virt`]; the
/// kernel image itself lives outside the window.
#[must_use]
pub fn virt_to_phys(virt: VirtAddr) -> PhysAddr {
    PhysAddr::new_truncate(virt.as_u64().wrapping_sub(offset()))
}
