//! Data-cache maintenance for DMA buffers.
//!
//! The operations run to the point of coherency against the line size
//! read from `CTR_EL0` at runtime, aligning the range outward to whole
//! lines.

use bekos_core::addr::VirtAddr;

/// Reads the smallest data-cache line size in bytes.
#[must_use]
pub fn cache_line_size() -> u64 {
    let ctr: u64;
    // SAFETY: CTR_EL0 is a read-only feature register.
    unsafe { core::arch::asm!("mrs {0}, ctr_el0", out(reg) ctr) };
    4 << ((ctr >> 16) & 0xF)
}

fn line_range(virt: VirtAddr, len: usize) -> (u64, u64, u64) {
    let line = cache_line_size();
    let start = virt.as_u64() & !(line - 1);
    let end = (virt.as_u64() + len as u64 + line - 1) & !(line - 1);
    (start, end, line)
}

/// Cleans `[virt, virt+len)` to the point of coherency (before a device
/// reads it).
pub fn clean_range(virt: VirtAddr, len: usize) {
    let (mut addr, end, line) = line_range(virt, len);
    while addr < end {
        // SAFETY: Cleaning by VA only writes dirty lines back.
        unsafe { core::arch::asm!("dc cvac, {0}", in(reg) addr) };
        addr += line;
    }
    // SAFETY: Barrier only.
    unsafe { core::arch::asm!("dsb sy") };
}

/// Invalidates `[virt, virt+len)` (before the CPU reads device-written
/// data). Edge lines shared with adjacent data are cleaned+invalidated so
/// neighbouring bytes are not lost.
pub fn invalidate_range(virt: VirtAddr, len: usize) {
    let (mut addr, end, line) = line_range(virt, len);
    while addr < end {
        // SAFETY: civac preserves adjacent dirty data by cleaning first.
        unsafe { core::arch::asm!("dc civac, {0}", in(reg) addr) };
        addr += line;
    }
    // SAFETY: Barrier only.
    unsafe { core::arch::asm!("dsb sy") };
}
