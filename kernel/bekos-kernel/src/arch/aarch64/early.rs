//! Pre-MMU translation-table construction.
//!
//! Runs at the physical load address with the MMU off, so everything here
//! lives in `.text.boot` (linked at the load address by the linker
//! script), touches memory only through addresses handed in or computed
//! from them, and calls nothing outside this file except `#[inline]`
//! helpers.
//!
//! The builder maps, at 2 MiB granularity from a linear scratch area:
//! the kernel image high (text/rodata executable read-only, data/bss
//! read-write no-exec), the device tree read-only at its link-time
//! window, the kernel image at its physical address (the identity entry
//! point for the MMU flip), and the debug UART at a fixed high address.
//! It then computes TCR from `ID_AA64MMFR0_EL1`, programs MAIR and both
//! TTBRs, and leaves the MMU enable to the assembly caller.

use crate::arch::tcr;

/// 2 MiB, the only granularity the crude mapper speaks.
const SIZE_2M: u64 = 2 << 20;
/// Entries per table.
const ENTRY_COUNT: u64 = 512;
/// Bytes per table.
const TABLE_SIZE: u64 = 4096;

/// Link base of the kernel image.
const KERNEL_VBASE: u64 = 0xFFFF_8000_0000_0000;
/// Base of the identity window (and of the fixed UART mapping).
const VA_START: u64 = 0xFFFF_0000_0000_0000;

/// QEMU virt PL011; the Raspberry Pi UART lands here via the same scheme
/// once the device tree names it.
const EARLY_UART_PHYS: u64 = 0x0900_0000;
/// Where the early UART is mapped in the high half.
pub const EARLY_UART_VIRT: u64 = VA_START + EARLY_UART_PHYS;

/// Block attribute bits (descriptor low/upper attributes).
const ATTR_AF: u64 = 1 << 10;
const ATTR_RO: u64 = 1 << 7;
const ATTR_PXN: u64 = 1 << 53;
const ATTR_NORMAL_IDX: u64 = tcr::MAIR_NORMAL_INDEX << 2;
const ATTR_DEVICE_IDX: u64 = tcr::MAIR_DEVICE_INDEX << 2;

/// Kernel text/rodata: executable, read-only, normal memory.
const PT_KERNEL_EXEC: u64 = ATTR_AF | ATTR_RO | ATTR_NORMAL_IDX;
/// Kernel data: read-write, never executable.
const PT_KERNEL_DATA: u64 = ATTR_AF | ATTR_PXN | ATTR_NORMAL_IDX;
/// Device tree: read-only, never executable.
const PT_KERNEL_RO: u64 = ATTR_AF | ATTR_RO | ATTR_PXN | ATTR_NORMAL_IDX;
/// Early UART: device-nGnRnE, never executable.
const PT_DEVICE: u64 = ATTR_AF | ATTR_PXN | ATTR_DEVICE_IDX;

/// Everything `kernel_main` needs to know about what boot left behind.
/// Written through its physical alias before the MMU turns on.
#[repr(C)]
pub struct BootHandoff {
    /// Physical address of the root L0 table.
    pub root_table: u64,
    /// First unused byte of the boot table scratch.
    pub scratch_next: u64,
    /// End of the boot table scratch.
    pub scratch_end: u64,
    /// Kernel-virtual pointer to the device tree blob.
    pub devtree_virt: u64,
    /// Size of the mapped device-tree window.
    pub devtree_size: u64,
    /// Physical load address of the kernel image.
    pub load_base: u64,
    /// Physical address of the device tree blob.
    pub dtb_phys: u64,
}

/// Filled in by [`setup_early_tables`]; read (high) by `kernel_main`.
#[unsafe(no_mangle)]
pub static mut BOOT_HANDOFF: BootHandoff = BootHandoff {
    root_table: 0,
    scratch_next: 0,
    scratch_end: 0,
    devtree_virt: 0,
    devtree_size: 0,
    load_base: 0,
    dtb_phys: 0,
};

unsafe extern "C" {
    static __kernel_start: u8;
    static __kernel_ro_end: u8;
    static __kernel_rw_start: u8;
    static __kernel_end: u8;
    static __initial_pgtables_start: u8;
    static __initial_pgtables_end: u8;
    static __devtree_start: u8;
}

/// Converts a high-half link address to its physical location.
///
/// The linker script links the high half at `KERNEL_VBASE + physical`,
/// so the conversion is a plain offset subtraction.
#[inline(always)]
fn kptr_phys(link_addr: u64) -> u64 {
    if link_addr >= KERNEL_VBASE {
        link_addr - KERNEL_VBASE
    } else {
        link_addr
    }
}

#[inline(always)]
fn read_entry(table: u64, index: u64) -> u64 {
    // SAFETY: `table` is a live physical table page; MMU is off.
    unsafe { ((table + index * 8) as *const u64).read_volatile() }
}

#[inline(always)]
fn write_entry(table: u64, index: u64, value: u64) {
    // SAFETY: As in `read_entry`.
    unsafe { ((table + index * 8) as *mut u64).write_volatile(value) };
}

#[inline(always)]
fn zero_table(table: u64) {
    for index in 0..ENTRY_COUNT {
        write_entry(table, index, 0);
    }
}

/// Takes the next page of the scratch area, or fails.
#[inline(always)]
fn take_table(current: &mut u64, end: u64) -> Option<u64> {
    if *current + TABLE_SIZE > end {
        return None;
    }
    let table = *current;
    *current += TABLE_SIZE;
    zero_table(table);
    Some(table)
}

/// Maps `[virt, virt+size)` to `[phys, ...)` as 2 MiB blocks.
///
/// Allocates at most one L1 and one L2 table per call from the scratch.
/// Fails (returns `false`) if the scratch runs out, the request is not
/// 2 MiB-aligned, or it crosses an L1 table boundary.
#[unsafe(link_section = ".text.boot")]
pub fn crude_map_region(
    virt: u64,
    phys: u64,
    size: u64,
    flags: u64,
    root: u64,
    scratch_current: &mut u64,
    scratch_end: u64,
) -> bool {
    if virt % SIZE_2M != 0 || phys % SIZE_2M != 0 || size % SIZE_2M != 0 || size == 0 {
        return false;
    }
    // The whole request must sit under one L1 entry span check: it may
    // not cross an L0-entry (512 GiB) boundary, and the L2 walk below
    // only fetches one L2 table.
    let l0_index = (virt >> 39) & 0x1FF;
    let l1_index = (virt >> 30) & 0x1FF;
    let end = virt + size - 1;
    if (end >> 39) & 0x1FF != l0_index {
        return false;
    }

    // L0 -> L1.
    let l0_entry = read_entry(root, l0_index);
    let l1_table = if l0_entry & 0b11 == 0b11 {
        l0_entry & 0x0000_FFFF_FFFF_F000
    } else {
        let Some(table) = take_table(scratch_current, scratch_end) else {
            return false;
        };
        write_entry(root, l0_index, table | 0b11);
        table
    };

    // L1 -> L2, one table for the whole request.
    if (end >> 30) & 0x1FF != l1_index {
        return false;
    }
    let l1_entry = read_entry(l1_table, l1_index);
    let l2_table = if l1_entry & 0b11 == 0b11 {
        l1_entry & 0x0000_FFFF_FFFF_F000
    } else {
        let Some(table) = take_table(scratch_current, scratch_end) else {
            return false;
        };
        write_entry(l1_table, l1_index, table | 0b11);
        table
    };

    // 2 MiB block entries.
    let mut offset = 0;
    while offset < size {
        let l2_index = ((virt + offset) >> 21) & 0x1FF;
        write_entry(l2_table, l2_index, (phys + offset) | flags | 0b01);
        offset += SIZE_2M;
    }
    true
}

#[inline(always)]
fn align_down_2m(value: u64) -> u64 {
    value & !(SIZE_2M - 1)
}

#[inline(always)]
fn align_up_2m(value: u64) -> u64 {
    (value + SIZE_2M - 1) & !(SIZE_2M - 1)
}

/// Reads the device tree's `totalsize` field (big-endian word 1).
#[inline(always)]
fn devtree_total_size(dtb_phys: u64) -> u64 {
    // SAFETY: The caller verified a DTB lives here; MMU is off.
    let bytes = unsafe { core::slice::from_raw_parts((dtb_phys + 4) as *const u8, 4) };
    u64::from(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Builds the initial tables and programs the translation registers.
///
/// Returns 0 on success or a negative step code identifying the mapping
/// that failed. The caller (assembly) enables the MMU on success.
#[unsafe(no_mangle)]
#[unsafe(link_section = ".text.boot")]
pub extern "C" fn setup_early_tables(load_base: u64, dtb_phys: u64) -> i64 {
    let exec_virt = core::ptr::addr_of!(__kernel_start) as u64;
    let exec_size = core::ptr::addr_of!(__kernel_ro_end) as u64 - exec_virt;
    let data_virt = core::ptr::addr_of!(__kernel_rw_start) as u64;
    let data_size = core::ptr::addr_of!(__kernel_end) as u64 - data_virt;
    let scratch_start = kptr_phys(core::ptr::addr_of!(__initial_pgtables_start) as u64);
    let scratch_end = kptr_phys(core::ptr::addr_of!(__initial_pgtables_end) as u64);
    let devtree_window = core::ptr::addr_of!(__devtree_start) as u64;

    let exec_phys = kptr_phys(exec_virt);
    let data_phys = kptr_phys(data_virt);

    let devtree_phys = align_down_2m(dtb_phys);
    let devtree_size = align_up_2m(dtb_phys + devtree_total_size(dtb_phys)) - devtree_phys;
    let devtree_virt = devtree_window + (dtb_phys - devtree_phys);

    let mut scratch = scratch_start;
    let Some(root) = take_table(&mut scratch, scratch_end) else {
        return -1;
    };

    // Kernel text + rodata, high.
    if !crude_map_region(
        align_down_2m(exec_virt),
        align_down_2m(exec_phys),
        align_up_2m(exec_virt + exec_size) - align_down_2m(exec_virt),
        PT_KERNEL_EXEC,
        root,
        &mut scratch,
        scratch_end,
    ) {
        return -2;
    }
    // Kernel data + bss (+ boot scratch), high.
    if !crude_map_region(
        align_down_2m(data_virt),
        align_down_2m(data_phys),
        align_up_2m(data_virt + data_size) - align_down_2m(data_virt),
        PT_KERNEL_DATA,
        root,
        &mut scratch,
        scratch_end,
    ) {
        return -3;
    }
    // Device tree, read-only at its link-time window.
    if !crude_map_region(
        align_down_2m(devtree_window),
        devtree_phys,
        devtree_size,
        PT_KERNEL_RO,
        root,
        &mut scratch,
        scratch_end,
    ) {
        return -4;
    }
    // Identity view of the kernel image for the MMU flip.
    if !crude_map_region(
        align_down_2m(exec_phys),
        align_down_2m(exec_phys),
        align_up_2m(exec_phys + exec_size + data_size + SIZE_2M) - align_down_2m(exec_phys),
        PT_KERNEL_EXEC,
        root,
        &mut scratch,
        scratch_end,
    ) {
        return -5;
    }
    // Debug UART at its fixed high address.
    if !crude_map_region(
        EARLY_UART_VIRT,
        EARLY_UART_PHYS,
        SIZE_2M,
        PT_DEVICE,
        root,
        &mut scratch,
        scratch_end,
    ) {
        return -6;
    }

    // Feature check and translation-register programming.
    let mmfr0: u64;
    // SAFETY: Feature register read.
    unsafe { core::arch::asm!("mrs {0}, id_aa64mmfr0_el1", out(reg) mmfr0) };
    if !tcr::granule_4k_supported(mmfr0) {
        return -7;
    }
    let tcr_value = tcr::compute_tcr(tcr::pa_size_tag(mmfr0));

    // SAFETY: Programming MAIR/TCR/TTBR with the MMU still off; the ISB
    // orders the writes before the caller sets SCTLR.M.
    unsafe {
        core::arch::asm!(
            "msr mair_el1, {mair}",
            "msr tcr_el1, {tcr}",
            "isb",
            "msr ttbr0_el1, {root}",
            "msr ttbr1_el1, {root}",
            "dsb ish",
            "isb",
            mair = in(reg) tcr::MAIR_VALUE,
            tcr = in(reg) tcr_value,
            root = in(reg) root,
        );
    }

    // Publish the handoff through its physical alias.
    let handoff_phys =
        kptr_phys(core::ptr::addr_of!(BOOT_HANDOFF) as u64) as *mut BootHandoff;
    // SAFETY: The alias targets this image's .data with the MMU off.
    unsafe {
        handoff_phys.write(BootHandoff {
            root_table: root,
            scratch_next: scratch,
            scratch_end,
            devtree_virt,
            devtree_size,
            load_base,
            dtb_phys,
        });
    }
    0
}
