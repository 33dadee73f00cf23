//! Virtual-address-space layout constants.
//!
//! The 48-bit kernel half is split between an identity window covering all
//! of RAM and MMIO, and the link-time home of the kernel image.

/// First kernel-half virtual address (48-bit VAs).
pub const VA_START: u64 = 0xFFFF_0000_0000_0000;

/// Offset of the identity window: `virt = phys + VA_IDENT_OFFSET` for every
/// RAM and MMIO frame.
pub const VA_IDENT_OFFSET: u64 = VA_START;

/// Where the kernel image is linked and mapped. Leaves 128 TiB for the
/// identity window below.
pub const KERNEL_VBASE: u64 = 0xFFFF_8000_0000_0000;

/// First address past the userspace half; every user-supplied pointer is
/// checked against this bound.
pub const USER_ADDR_MAX: u64 = 0x0000_8000_0000_0000;

/// Base of the high-half hole used for MMIO mappings handed out by the
/// memory manager.
pub const MMIO_HOLE_BASE: u64 = 0xFFFF_7000_0000_0000;

/// Size of the MMIO hole.
pub const MMIO_HOLE_SIZE: u64 = 0x0000_0010_0000_0000;

/// Page size (4 KiB granule).
pub const PAGE_SIZE: u64 = bekos_core::addr::PAGE_SIZE;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u64 = bekos_core::addr::PAGE_SHIFT;

/// Size mapped by one L2 block entry.
pub const SIZE_2M: u64 = 2 << 20;

/// Size mapped by one L1 block entry.
pub const SIZE_1G: u64 = 1 << 30;
