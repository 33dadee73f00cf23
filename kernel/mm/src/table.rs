//! Stage-1 translation-table manager.
//!
//! Wraps one root L0 table (the kernel's, or a per-process user root) and
//! exposes [`map_region`](TableManager::map_region) /
//! [`unmap_region`](TableManager::unmap_region) over the 4 KiB granule with
//! 1 GiB (L1) and 2 MiB (L2) block entries where alignment allows.
//!
//! Intermediate tables come from an embedded scratch range first (the boot
//! scratch for the kernel root) and from the page allocator afterwards.
//! Table memory is accessed through the identity window, which is what
//! makes the walker testable on the host.
//!
//! TLB maintenance is dispatched through a registered flush callback; the
//! architecture registers its `TLBI` sequence at boot and host tests run
//! with the no-op default.

use core::sync::atomic::{AtomicPtr, Ordering};

use bekos_core::addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use bekos_core::{SysError, SysResult};
use bitflags::bitflags;

use crate::layout::{SIZE_1G, SIZE_2M};
use crate::{ident, pmm};

/// Entries per table at every level.
const ENTRY_COUNT: usize = 512;

/// Output-address field of a descriptor (bits 12..47).
const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// Descriptor-code values in bits 0..1.
const DESC_INVALID: u64 = 0b00;
const DESC_BLOCK: u64 = 0b01;
const DESC_TABLE_OR_PAGE: u64 = 0b11;

bitflags! {
    /// Stage-1 descriptor attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageAttributes: u64 {
        /// Unprivileged execute-never.
        const UXN = 1 << 54;
        /// Privileged execute-never.
        const PXN = 1 << 53;
        /// Contiguous hint.
        const CONTIGUOUS = 1 << 52;
        /// Not global (ASID-tagged).
        const NOT_GLOBAL = 1 << 11;
        /// Access flag; set on every live entry.
        const AF = 1 << 10;
        /// AP[2]: read-only when set.
        const READ_ONLY = 1 << 7;
        /// AP[1]: accessible from EL0 when set.
        const EL0_ACCESS = 1 << 6;
    }
}

impl PageAttributes {
    /// Kernel code: read-only, executable at EL1.
    pub const KERNEL_CODE: Self = Self::AF.union(Self::READ_ONLY);
    /// Kernel data: read/write, never executable.
    pub const KERNEL_DATA: Self = Self::AF.union(Self::PXN);
    /// Kernel read-only data: read-only, never executable.
    pub const KERNEL_RODATA: Self = Self::AF.union(Self::READ_ONLY).union(Self::PXN);
    /// Device MMIO: read/write, never executable.
    pub const DEVICE: Self = Self::AF.union(Self::PXN);

    /// Attributes for a userspace mapping.
    ///
    /// The kernel never executes user code, so `PXN` is always set. `UXN`
    /// is cleared only for executable mappings and `READ_ONLY` only for
    /// writable ones.
    #[must_use]
    pub fn for_user(readable: bool, writable: bool, executable: bool) -> Self {
        let mut attrs = Self::AF | Self::PXN | Self::NOT_GLOBAL;
        if readable || writable {
            attrs |= Self::EL0_ACCESS;
        }
        if !writable {
            attrs |= Self::READ_ONLY;
        }
        if !executable {
            attrs |= Self::UXN;
        }
        attrs
    }
}

/// MAIR attribute index carried in descriptor bits 2..4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemAttrIndex {
    /// Device-nGnRnE (MAIR index 0).
    Device = 0,
    /// Normal cacheable RAM (MAIR index 1).
    Normal = 1,
}

impl MemAttrIndex {
    fn from_bits(bits: u64) -> Self {
        if bits & 0b111 == 0 {
            Self::Device
        } else {
            Self::Normal
        }
    }
}

/// The result of walking the tables for one virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Physical address the input translates to.
    pub phys: PhysAddr,
    /// Attribute bits of the covering descriptor.
    pub attrs: PageAttributes,
    /// MAIR index of the covering descriptor.
    pub attr_idx: MemAttrIndex,
    /// Size of the covering descriptor (4 KiB page, 2 MiB or 1 GiB block).
    pub block_size: u64,
}

// ---------------------------------------------------------------------------
// Registered TLB flush
// ---------------------------------------------------------------------------

fn nop_flush(_virt: VirtAddr) {}

static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush as *mut ());

/// Registers the architecture's per-address TLB invalidation.
///
/// Called once during early boot; until then (and in host tests) flushes
/// are no-ops, which is safe while no stale entries can exist.
pub fn register_tlb_flush(f: fn(VirtAddr)) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

fn flush_address(virt: VirtAddr) {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn(VirtAddr)` pointers are stored in TLB_FLUSH_FN.
    let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
    f(virt);
}

// ---------------------------------------------------------------------------
// Raw table access
// ---------------------------------------------------------------------------

fn shift_for_level(level: usize) -> u64 {
    match level {
        0 => 39,
        1 => 30,
        2 => 21,
        _ => 12,
    }
}

fn read_entry(table: PhysAddr, index: usize) -> u64 {
    debug_assert!(index < ENTRY_COUNT);
    let ptr = ident::phys_to_virt(table).as_ptr::<u64>();
    // SAFETY: `table` is a live table page owned by this manager; index is
    // bounds-checked above.
    unsafe { ptr.add(index).read_volatile() }
}

fn write_entry(table: PhysAddr, index: usize, value: u64) {
    debug_assert!(index < ENTRY_COUNT);
    let ptr = ident::phys_to_virt(table).as_mut_ptr::<u64>();
    // SAFETY: As in `read_entry`; the MMU observes these writes, so they
    // are volatile.
    unsafe { ptr.add(index).write_volatile(value) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Invalid,
    Table,
    Block,
}

/// Classifies an entry at levels 0..2.
fn upper_entry_kind(raw: u64) -> EntryKind {
    match raw & 0b11 {
        v if v == DESC_TABLE_OR_PAGE => EntryKind::Table,
        v if v == DESC_BLOCK => EntryKind::Block,
        _ => EntryKind::Invalid,
    }
}

fn make_table_entry(table: PhysAddr) -> u64 {
    debug_assert!(table.is_aligned(PAGE_SIZE));
    table.as_u64() | DESC_TABLE_OR_PAGE
}

fn make_block_entry(phys: PhysAddr, flags: u64) -> u64 {
    (phys.as_u64() & ADDR_MASK) | flags | DESC_BLOCK
}

fn make_page_entry(phys: PhysAddr, flags: u64) -> u64 {
    (phys.as_u64() & ADDR_MASK) | flags | DESC_TABLE_OR_PAGE
}

/// Attribute + attr-index bits of a descriptor, without code or address.
fn entry_flags(raw: u64) -> u64 {
    raw & !(ADDR_MASK | 0b11)
}

// ---------------------------------------------------------------------------
// TableManager
// ---------------------------------------------------------------------------

/// Manages one root L0 translation table.
pub struct TableManager {
    root: PhysAddr,
    scratch_next: PhysAddr,
    scratch_end: PhysAddr,
    owns_root: bool,
}

impl TableManager {
    /// Adopts the pre-existing boot root table along with the remainder of
    /// the boot page-table scratch range.
    ///
    /// # Safety
    ///
    /// `root` must be the live L0 table and `scratch_next..scratch_end` a
    /// physical range reserved for table pages and unused by anything else.
    #[must_use]
    pub unsafe fn global(root: PhysAddr, scratch_next: PhysAddr, scratch_end: PhysAddr) -> Self {
        Self {
            root,
            scratch_next,
            scratch_end,
            owns_root: false,
        }
    }

    /// Creates a manager with a fresh zero-filled root for a user process.
    ///
    /// # Errors
    ///
    /// Returns `ENOMEM` if no page is available for the root.
    pub fn user() -> SysResult<Self> {
        let region = pmm::with(|pa| pa.allocate_region(1)).ok_or(SysError::NoMemory)?;
        zero_table(region.start);
        Ok(Self {
            root: region.start,
            scratch_next: PhysAddr::zero(),
            scratch_end: PhysAddr::zero(),
            owns_root: true,
        })
    }

    /// Returns the kernel-virtual pointer to the root table.
    #[must_use]
    pub fn get_root_table(&self) -> VirtAddr {
        ident::phys_to_virt(self.root)
    }

    /// Returns the physical address of the root table, for TTBR programming.
    #[must_use]
    pub fn root_phys(&self) -> PhysAddr {
        self.root
    }

    fn allocate_table(&mut self) -> SysResult<PhysAddr> {
        if self.scratch_next < self.scratch_end {
            let table = self.scratch_next;
            self.scratch_next = self.scratch_next + PAGE_SIZE;
            zero_table(table);
            return Ok(table);
        }
        let region = pmm::with(|pa| pa.allocate_region(1)).ok_or(SysError::NoMemory)?;
        zero_table(region.start);
        Ok(region.start)
    }

    /// Maps `[virt, virt+size)` to `[phys, phys+size)`.
    ///
    /// Uses the largest block granularity alignment allows. All three
    /// arguments must be page-aligned.
    ///
    /// # Errors
    ///
    /// `EADDRINUSE` if any part of the range is already mapped to a
    /// different target or with different attributes; `ENOMEM` if an
    /// intermediate table cannot be allocated.
    pub fn map_region(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        size: u64,
        attrs: PageAttributes,
        attr_idx: MemAttrIndex,
    ) -> SysResult<()> {
        assert!(virt.is_aligned(PAGE_SIZE), "virt must be page-aligned");
        assert!(phys.is_aligned(PAGE_SIZE), "phys must be page-aligned");
        assert!(size % PAGE_SIZE == 0, "size must be page-aligned");

        let flags = attrs.bits() | (u64::from(attr_idx as u8) << 2);
        let mut cursor_virt = virt.as_u64();
        let mut cursor_phys = phys.as_u64();
        let mut remaining = size;
        self.map_level(self.root, 0, &mut cursor_virt, &mut cursor_phys, &mut remaining, flags)?;
        debug_assert_eq!(remaining, 0);
        Ok(())
    }

    fn map_level(
        &mut self,
        table: PhysAddr,
        level: usize,
        virt: &mut u64,
        phys: &mut u64,
        size: &mut u64,
        flags: u64,
    ) -> SysResult<()> {
        let shift = shift_for_level(level);
        let start_idx = ((*virt >> shift) as usize) % ENTRY_COUNT;

        for index in start_idx..ENTRY_COUNT {
            if *size == 0 {
                break;
            }

            if level == 3 {
                let wanted = make_page_entry(PhysAddr::new_truncate(*phys), flags);
                let existing = read_entry(table, index);
                if existing & 0b11 != DESC_INVALID && existing != wanted {
                    return Err(SysError::AddressInUse);
                }
                write_entry(table, index, wanted);
                *virt += PAGE_SIZE;
                *phys += PAGE_SIZE;
                *size -= PAGE_SIZE;
                continue;
            }

            let block_size = match level {
                1 => Some(SIZE_1G),
                2 => Some(SIZE_2M),
                _ => None,
            };
            let raw = read_entry(table, index);
            let next_table = match upper_entry_kind(raw) {
                EntryKind::Invalid => {
                    // A whole block fits here if everything is aligned.
                    if let Some(block) = block_size {
                        if *size >= block && *virt % block == 0 && *phys % block == 0 {
                            let entry = make_block_entry(PhysAddr::new_truncate(*phys), flags);
                            write_entry(table, index, entry);
                            *virt += block;
                            *phys += block;
                            *size -= block;
                            continue;
                        }
                    }
                    let fresh = self.allocate_table()?;
                    write_entry(table, index, make_table_entry(fresh));
                    fresh
                }
                EntryKind::Block => {
                    // Idempotent re-map of an identical block is fine.
                    if let Some(block) = block_size {
                        let wanted = make_block_entry(PhysAddr::new_truncate(*phys), flags);
                        if raw == wanted && *size >= block && *virt % block == 0 {
                            *virt += block;
                            *phys += block;
                            *size -= block;
                            continue;
                        }
                    }
                    return Err(SysError::AddressInUse);
                }
                EntryKind::Table => PhysAddr::new_truncate(raw & ADDR_MASK),
            };

            self.map_level(next_table, level + 1, virt, phys, size, flags)?;
        }
        Ok(())
    }

    /// Unmaps `[virt, virt+size)`, the exact inverse of a prior mapping.
    ///
    /// A block entry may only be removed if the request spans the entire
    /// block; partial block splitting is not implemented.
    ///
    /// # Errors
    ///
    /// `EINVAL` if part of the range is unmapped, or if the range covers
    /// only part of a block.
    pub fn unmap_region(&mut self, virt: VirtAddr, size: u64) -> SysResult<()> {
        assert!(virt.is_aligned(PAGE_SIZE), "virt must be page-aligned");
        assert!(size % PAGE_SIZE == 0, "size must be page-aligned");

        let mut cursor_virt = virt.as_u64();
        let mut remaining = size;
        self.unmap_level(self.root, 0, &mut cursor_virt, &mut remaining)?;
        debug_assert_eq!(remaining, 0);
        Ok(())
    }

    fn unmap_level(
        &mut self,
        table: PhysAddr,
        level: usize,
        virt: &mut u64,
        size: &mut u64,
    ) -> SysResult<()> {
        let shift = shift_for_level(level);
        let start_idx = ((*virt >> shift) as usize) % ENTRY_COUNT;

        for index in start_idx..ENTRY_COUNT {
            if *size == 0 {
                break;
            }

            if level == 3 {
                let raw = read_entry(table, index);
                if raw & 0b11 != DESC_TABLE_OR_PAGE {
                    return Err(SysError::InvalidArgument);
                }
                write_entry(table, index, 0);
                flush_address(VirtAddr::new_truncate(*virt));
                *virt += PAGE_SIZE;
                *size -= PAGE_SIZE;
                continue;
            }

            let raw = read_entry(table, index);
            match upper_entry_kind(raw) {
                EntryKind::Invalid => return Err(SysError::InvalidArgument),
                EntryKind::Block => {
                    let block = if level == 1 { SIZE_1G } else { SIZE_2M };
                    if *virt % block != 0 || *size < block {
                        // Partial block unmap: not supported.
                        return Err(SysError::InvalidArgument);
                    }
                    write_entry(table, index, 0);
                    flush_address(VirtAddr::new_truncate(*virt));
                    *virt += block;
                    *size -= block;
                }
                EntryKind::Table => {
                    let next = PhysAddr::new_truncate(raw & ADDR_MASK);
                    self.unmap_level(next, level + 1, virt, size)?;
                }
            }
        }
        Ok(())
    }

    /// Walks the tables for `virt`.
    ///
    /// Returns the covering translation, or `None` if the address is not
    /// mapped.
    #[must_use]
    pub fn translate(&self, virt: VirtAddr) -> Option<Translation> {
        let raw_virt = virt.as_u64();
        let mut table = self.root;
        for level in 0..4 {
            let shift = shift_for_level(level);
            let index = ((raw_virt >> shift) as usize) % ENTRY_COUNT;
            let raw = read_entry(table, index);

            if level == 3 {
                if raw & 0b11 != DESC_TABLE_OR_PAGE {
                    return None;
                }
                return Some(Translation {
                    phys: PhysAddr::new_truncate((raw & ADDR_MASK) | (raw_virt & (PAGE_SIZE - 1))),
                    attrs: PageAttributes::from_bits_truncate(entry_flags(raw)),
                    attr_idx: MemAttrIndex::from_bits((raw >> 2) & 0b111),
                    block_size: PAGE_SIZE,
                });
            }

            match upper_entry_kind(raw) {
                EntryKind::Invalid => return None,
                EntryKind::Block => {
                    let block = if level == 1 { SIZE_1G } else { SIZE_2M };
                    let base = raw & ADDR_MASK & !(block - 1);
                    return Some(Translation {
                        phys: PhysAddr::new_truncate(base | (raw_virt & (block - 1))),
                        attrs: PageAttributes::from_bits_truncate(entry_flags(raw)),
                        attr_idx: MemAttrIndex::from_bits((raw >> 2) & 0b111),
                        block_size: block,
                    });
                }
                EntryKind::Table => table = PhysAddr::new_truncate(raw & ADDR_MASK),
            }
        }
        None
    }
}

impl Drop for TableManager {
    fn drop(&mut self) {
        if self.owns_root {
            pmm::with(|pa| pa.free_region(self.root));
        }
    }
}

fn zero_table(table: PhysAddr) {
    let ptr = ident::phys_to_virt(table).as_mut_ptr::<u8>();
    // SAFETY: `table` is a freshly allocated page owned by the manager.
    unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE as usize) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::Layout;

    /// Builds a manager whose root and scratch come from leaked host pages.
    fn test_manager(scratch_pages: usize) -> TableManager {
        let total = (1 + scratch_pages) * PAGE_SIZE as usize;
        let layout = Layout::from_size_align(total, PAGE_SIZE as usize).unwrap();
        // SAFETY: non-zero size; leaked for the test lifetime.
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!buf.is_null());
        let root = PhysAddr::new(buf as u64);
        // SAFETY: root is a fresh zeroed page; scratch range is exclusive.
        unsafe {
            TableManager::global(
                root,
                root + PAGE_SIZE,
                root + (1 + scratch_pages as u64) * PAGE_SIZE,
            )
        }
    }

    const ATTRS: PageAttributes = PageAttributes::KERNEL_DATA;

    #[test]
    fn map_translate_round_trip() {
        let mut tm = test_manager(8);
        let virt = VirtAddr::new_truncate(0xFFFF_0000_4000_0000);
        let phys = PhysAddr::new(0x8000_0000);
        tm.map_region(virt, phys, 4 * PAGE_SIZE, ATTRS, MemAttrIndex::Normal)
            .unwrap();

        // Every page of the range resolves, with interior offsets honoured.
        for page in 0..4u64 {
            for offset in [0u64, 0x123, 0xFFF] {
                let probe = virt + page * PAGE_SIZE + offset;
                let t = tm.translate(probe).unwrap();
                assert_eq!(t.phys, phys + page * PAGE_SIZE + offset);
                assert_eq!(t.attrs, ATTRS);
                assert_eq!(t.attr_idx, MemAttrIndex::Normal);
                assert_eq!(t.block_size, PAGE_SIZE);
            }
        }
        // One page past the range is unmapped.
        assert!(tm.translate(virt + 4 * PAGE_SIZE).is_none());
    }

    #[test]
    fn unmap_round_trip() {
        let mut tm = test_manager(8);
        let virt = VirtAddr::new_truncate(0xFFFF_0000_0020_0000);
        let phys = PhysAddr::new(0x4000_0000);
        tm.map_region(virt, phys, 8 * PAGE_SIZE, ATTRS, MemAttrIndex::Normal)
            .unwrap();
        tm.unmap_region(virt, 8 * PAGE_SIZE).unwrap();
        for page in 0..8u64 {
            assert!(tm.translate(virt + page * PAGE_SIZE).is_none());
        }
        // The range can be mapped again afterwards.
        tm.map_region(virt, phys, PAGE_SIZE, ATTRS, MemAttrIndex::Normal)
            .unwrap();
    }

    #[test]
    fn conflicting_mapping_rejected() {
        let mut tm = test_manager(8);
        let virt = VirtAddr::new_truncate(0xFFFF_0000_0010_0000);
        tm.map_region(virt, PhysAddr::new(0x1000_0000), PAGE_SIZE, ATTRS, MemAttrIndex::Normal)
            .unwrap();
        // Same page, different target.
        let err = tm.map_region(
            virt,
            PhysAddr::new(0x2000_0000),
            PAGE_SIZE,
            ATTRS,
            MemAttrIndex::Normal,
        );
        assert_eq!(err, Err(SysError::AddressInUse));
        // Identical re-map is idempotent.
        tm.map_region(virt, PhysAddr::new(0x1000_0000), PAGE_SIZE, ATTRS, MemAttrIndex::Normal)
            .unwrap();
    }

    #[test]
    fn large_mapping_uses_l2_blocks() {
        let mut tm = test_manager(8);
        let virt = VirtAddr::new_truncate(0xFFFF_0000_4000_0000);
        let phys = PhysAddr::new(0x8000_0000);
        tm.map_region(virt, phys, SIZE_2M, ATTRS, MemAttrIndex::Normal)
            .unwrap();
        let t = tm.translate(virt + 0x10_0000).unwrap();
        assert_eq!(t.block_size, SIZE_2M);
        assert_eq!(t.phys, phys + 0x10_0000);
    }

    #[test]
    fn giant_mapping_uses_l1_blocks() {
        let mut tm = test_manager(8);
        let virt = VirtAddr::new_truncate(0xFFFF_0000_4000_0000);
        let phys = PhysAddr::new(0x1_0000_0000);
        tm.map_region(virt, phys, SIZE_1G, ATTRS, MemAttrIndex::Normal)
            .unwrap();
        let t = tm.translate(virt + SIZE_2M + 0x1234).unwrap();
        assert_eq!(t.block_size, SIZE_1G);
        assert_eq!(t.phys, phys + SIZE_2M + 0x1234);
    }

    #[test]
    fn partial_block_unmap_fails() {
        let mut tm = test_manager(8);
        let virt = VirtAddr::new_truncate(0xFFFF_0000_4000_0000);
        tm.map_region(virt, PhysAddr::new(0x8000_0000), SIZE_2M, ATTRS, MemAttrIndex::Normal)
            .unwrap();
        // Unmapping a strict sub-block must fail without touching the entry.
        assert_eq!(
            tm.unmap_region(virt, PAGE_SIZE),
            Err(SysError::InvalidArgument)
        );
        assert!(tm.translate(virt).is_some());
        // The whole block unmaps fine.
        tm.unmap_region(virt, SIZE_2M).unwrap();
        assert!(tm.translate(virt).is_none());
    }

    #[test]
    fn unmap_of_unmapped_range_fails() {
        let mut tm = test_manager(4);
        assert_eq!(
            tm.unmap_region(VirtAddr::new_truncate(0xFFFF_0000_0000_0000), PAGE_SIZE),
            Err(SysError::InvalidArgument)
        );
    }

    #[test]
    fn scratch_exhaustion_falls_back_to_page_allocator() {
        crate::test_support::init_test_pmm();
        // Mapping a 4 KiB page needs L1 + L2 + L3 tables, but only two
        // scratch pages exist; the third table comes from the allocator.
        let mut tm = test_manager(2);
        let virt = VirtAddr::new_truncate(0xFFFF_0000_0000_0000);
        tm.map_region(virt, PhysAddr::new(0x9000_0000), PAGE_SIZE, ATTRS, MemAttrIndex::Normal)
            .unwrap();
        assert!(tm.translate(virt).is_some());
    }

    #[test]
    fn user_attributes_follow_contract() {
        // Kernel never executes user code: PXN always set.
        for (r, w, x) in [
            (true, false, false),
            (true, true, false),
            (true, false, true),
            (false, true, false),
        ] {
            let attrs = PageAttributes::for_user(r, w, x);
            assert!(attrs.contains(PageAttributes::PXN));
            assert!(attrs.contains(PageAttributes::AF));
            assert_eq!(attrs.contains(PageAttributes::EL0_ACCESS), r || w);
            assert_eq!(attrs.contains(PageAttributes::READ_ONLY), !w);
            assert_eq!(attrs.contains(PageAttributes::UXN), !x);
        }
    }

    #[test]
    fn user_root_is_fresh_and_zeroed() {
        crate::test_support::init_test_pmm();
        let mut tm = TableManager::user().unwrap();
        assert!(tm.root_phys().is_aligned(PAGE_SIZE));
        // A fresh root maps nothing.
        assert!(tm.translate(VirtAddr::new_truncate(0x40_0000)).is_none());
        // And accepts user mappings.
        tm.map_region(
            VirtAddr::new_truncate(0x40_0000),
            PhysAddr::new(0x8000_0000),
            PAGE_SIZE,
            PageAttributes::for_user(true, true, false),
            MemAttrIndex::Normal,
        )
        .unwrap();
        assert!(tm.translate(VirtAddr::new_truncate(0x40_0000)).is_some());
    }
}
