//! Typed physical, virtual, and DMA address wrappers.
//!
//! Provides [`PhysAddr`], [`VirtAddr`], and [`DmaAddr`] newtypes that prevent
//! mixing address spaces at the type level, plus the page-granular region
//! types used throughout the memory subsystem.

use core::fmt;
use core::ops::{Add, Sub};

/// Page size used throughout the kernel (4 KiB granule).
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u64 = 12;

/// A canonical 64-bit virtual address.
///
/// With 48-bit VAs, addresses must fall in the TTBR0
/// (`0x0000_xxxx_xxxx_xxxx`) or TTBR1 (`0xFFFF_xxxx_xxxx_xxxx`) range.
/// This type enforces that invariant via sign-extension from bit 47.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

/// A 64-bit physical address (masked to 52 bits).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

/// An address as seen by a DMA-capable bus master.
///
/// Produced by walking the `dma-ranges` chain of the owning device-tree
/// node; identical to the physical address when the bus has no translation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DmaAddr(u64);

/// Physical address space mask: bits 0..51.
const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_FFFF;

/// Mask for a 9-bit page table index (used by all paging levels).
const PAGE_TABLE_INDEX_MASK: usize = 0x1FF;

impl VirtAddr {
    /// Creates a new `VirtAddr`, sign-extending from bit 47 to enforce
    /// canonical form. Panics if the address is not canonical.
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        let canonical = Self::new_truncate(addr);
        assert!(
            canonical.0 == addr,
            "VirtAddr::new: address is not canonical"
        );
        canonical
    }

    /// Creates a new `VirtAddr`, truncating to canonical form by
    /// sign-extending from bit 47.
    #[inline]
    #[must_use]
    pub const fn new_truncate(addr: u64) -> Self {
        Self(((addr << 16) as i64 >> 16) as u64)
    }

    /// Returns the zero address.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u64` value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Converts this address to a raw pointer.
    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts this address to a raw mutable pointer.
    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns `true` if the address is aligned to `align` (a power of two).
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to `align` (a power of two).
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self::new_truncate(self.0 & !(align - 1))
    }

    /// Aligns the address up to `align` (a power of two).
    #[inline]
    #[must_use]
    pub const fn align_up(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self::new_truncate((self.0 + align - 1) & !(align - 1))
    }

    /// Returns the page offset (bits 0..11).
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns the L0 table index (bits 39..47) for a 4 KiB granule.
    #[inline]
    #[must_use]
    pub const fn l0_index(self) -> usize {
        ((self.0 >> 39) as usize) & PAGE_TABLE_INDEX_MASK
    }

    /// Returns the L1 table index (bits 30..38) for a 4 KiB granule.
    #[inline]
    #[must_use]
    pub const fn l1_index(self) -> usize {
        ((self.0 >> 30) as usize) & PAGE_TABLE_INDEX_MASK
    }

    /// Returns the L2 table index (bits 21..29) for a 4 KiB granule.
    #[inline]
    #[must_use]
    pub const fn l2_index(self) -> usize {
        ((self.0 >> 21) as usize) & PAGE_TABLE_INDEX_MASK
    }

    /// Returns the L3 table index (bits 12..20) for a 4 KiB granule.
    #[inline]
    #[must_use]
    pub const fn l3_index(self) -> usize {
        ((self.0 >> 12) as usize) & PAGE_TABLE_INDEX_MASK
    }
}

impl Add<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self::new_truncate(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self {
        Self::new_truncate(self.0.wrapping_sub(rhs))
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: VirtAddr) -> u64 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// PhysAddr
// ---------------------------------------------------------------------------

impl PhysAddr {
    /// Creates a new `PhysAddr`. Panics if bits above 52 are set.
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        assert!(
            addr & !PHYS_ADDR_MASK == 0,
            "PhysAddr::new: address exceeds 52-bit physical address space"
        );
        Self(addr)
    }

    /// Creates a new `PhysAddr`, truncating to the 52-bit space.
    #[inline]
    #[must_use]
    pub const fn new_truncate(addr: u64) -> Self {
        Self(addr & PHYS_ADDR_MASK)
    }

    /// Returns the zero address.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u64` value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` if the address is aligned to `align` (a power of two).
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to `align` (a power of two).
    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self(self.0 & !(align - 1))
    }

    /// Aligns the address up to `align` (a power of two).
    #[inline]
    #[must_use]
    pub const fn align_up(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self((self.0 + align - 1) & !(align - 1))
    }

    /// Returns the base of the page containing this address.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        self.align_down(PAGE_SIZE)
    }

    /// Returns the offset of this address within its page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl Add<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self::new(self.0 + rhs)
    }
}

impl Sub<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self {
        Self::new(self.0 - rhs)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: PhysAddr) -> u64 {
        self.0 - rhs.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// DmaAddr
// ---------------------------------------------------------------------------

impl DmaAddr {
    /// Creates a new `DmaAddr` from a raw bus address.
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Returns the raw `u64` value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Add<u64> for DmaAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl fmt::Debug for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DmaAddr({:#x})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Regions
// ---------------------------------------------------------------------------

macro_rules! region_type {
    ($(#[$meta:meta])* $name:ident, $addr:ty) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            /// First address of the region.
            pub start: $addr,
            /// Size of the region in bytes.
            pub size: u64,
        }

        impl $name {
            /// Creates a new region from its start and size.
            #[inline]
            #[must_use]
            pub const fn new(start: $addr, size: u64) -> Self {
                Self { start, size }
            }

            /// Returns the first address past the end of the region.
            #[inline]
            #[must_use]
            pub fn end(self) -> $addr {
                self.start + self.size
            }

            /// Returns `true` if both start and size are page-aligned.
            #[inline]
            #[must_use]
            pub fn page_aligned(self) -> bool {
                self.start.is_aligned(PAGE_SIZE) && self.size % PAGE_SIZE == 0
            }

            /// Returns `true` if `addr` lies within the region.
            #[inline]
            #[must_use]
            pub fn contains_addr(self, addr: $addr) -> bool {
                self.start <= addr && addr < self.end()
            }

            /// Returns `true` if `other` is entirely contained in this region.
            #[inline]
            #[must_use]
            pub fn contains(self, other: Self) -> bool {
                self.start <= other.start && other.end() <= self.end()
            }

            /// Returns `true` if the regions share any address.
            #[inline]
            #[must_use]
            pub fn overlaps(self, other: Self) -> bool {
                self.start < other.end() && other.start < self.end()
            }

            /// Returns the intersection of the regions, if non-empty.
            #[must_use]
            pub fn intersection(self, other: Self) -> Option<Self> {
                let start = if self.start > other.start { self.start } else { other.start };
                let end = if self.end() < other.end() { self.end() } else { other.end() };
                if start < end {
                    Some(Self::new(start, end - start))
                } else {
                    None
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({} + {:#x})", stringify!($name), self.start, self.size)
            }
        }
    };
}

region_type! {
    /// A contiguous region of physical memory.
    PhysRegion, PhysAddr
}

region_type! {
    /// A contiguous region of kernel virtual memory.
    VirtRegion, VirtAddr
}

/// A contiguous region of a user address space.
///
/// User addresses are plain low-half values, so the region stores raw
/// `u64`s rather than [`VirtAddr`]s: a user pointer is only meaningful
/// relative to the process whose tables are installed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UserRegion {
    /// First user address of the region.
    pub start: u64,
    /// Size of the region in bytes.
    pub size: u64,
}

impl UserRegion {
    /// Creates a new user region from its start and size.
    #[inline]
    #[must_use]
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// Returns the first address past the end of the region.
    #[inline]
    #[must_use]
    pub const fn end(self) -> u64 {
        self.start + self.size
    }

    /// Returns `true` if both start and size are page-aligned.
    #[inline]
    #[must_use]
    pub const fn page_aligned(self) -> bool {
        self.start % PAGE_SIZE == 0 && self.size % PAGE_SIZE == 0
    }

    /// Returns `true` if `other` is entirely contained in this region.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.start <= other.start && other.end() <= self.end()
    }

    /// Returns `true` if the regions share any address.
    #[inline]
    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

impl fmt::Debug for UserRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserRegion({:#x} + {:#x})", self.start, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_addr_canonical_low() {
        let addr = VirtAddr::new(0x0000_1234_5678_9ABC);
        assert_eq!(addr.as_u64(), 0x0000_1234_5678_9ABC);
    }

    #[test]
    fn virt_addr_truncate_high_half() {
        // Bit 47 set → sign-extends to set bits 48..63.
        let addr = VirtAddr::new_truncate(0x0000_8000_0000_0000);
        assert_eq!(addr.as_u64(), 0xFFFF_8000_0000_0000);
    }

    #[test]
    fn virt_addr_align() {
        let addr = VirtAddr::new(0x1234);
        assert_eq!(addr.align_down(4096).as_u64(), 0x1000);
        assert_eq!(addr.align_up(4096).as_u64(), 0x2000);
        assert!(VirtAddr::new(0x2000).is_aligned(4096));
    }

    #[test]
    fn virt_addr_table_indices() {
        // High-half address with known index fields.
        let addr = VirtAddr::new(0xFFFF_8000_4020_1000);
        assert_eq!(addr.l0_index(), 256);
        assert_eq!(addr.l1_index(), 1);
        assert_eq!(addr.l2_index(), 0x201 >> 9 << 9 >> 9); // bits 21..29
        assert_eq!(addr.l3_index(), 1);
        assert_eq!(addr.page_offset(), 0);
    }

    #[test]
    fn virt_addr_arith() {
        let addr = VirtAddr::new(0x1000);
        assert_eq!((addr + 0x500).as_u64(), 0x1500);
        assert_eq!((addr - 0x500).as_u64(), 0x0B00);
        assert_eq!(VirtAddr::new(0x2000) - addr, 0x1000);
    }

    #[test]
    fn phys_addr_truncate() {
        let addr = PhysAddr::new_truncate(u64::MAX);
        assert_eq!(addr.as_u64(), PHYS_ADDR_MASK);
    }

    #[test]
    fn phys_addr_page_helpers() {
        let addr = PhysAddr::new(0x3456);
        assert_eq!(addr.page_base().as_u64(), 0x3000);
        assert_eq!(addr.page_offset(), 0x456);
    }

    #[test]
    fn phys_region_contains_overlaps() {
        let a = PhysRegion::new(PhysAddr::new(0x1000), 0x3000);
        let b = PhysRegion::new(PhysAddr::new(0x2000), 0x1000);
        let c = PhysRegion::new(PhysAddr::new(0x4000), 0x1000);
        assert!(a.contains(b));
        assert!(a.overlaps(b));
        assert!(!a.overlaps(c));
        assert!(a.contains_addr(PhysAddr::new(0x3FFF)));
        assert!(!a.contains_addr(PhysAddr::new(0x4000)));
    }

    #[test]
    fn phys_region_intersection() {
        let a = PhysRegion::new(PhysAddr::new(0x1000), 0x3000);
        let b = PhysRegion::new(PhysAddr::new(0x3000), 0x3000);
        let i = a.intersection(b).unwrap();
        assert_eq!(i.start.as_u64(), 0x3000);
        assert_eq!(i.size, 0x1000);

        let c = PhysRegion::new(PhysAddr::new(0x8000), 0x1000);
        assert!(a.intersection(c).is_none());
    }

    #[test]
    fn user_region_page_aligned() {
        assert!(UserRegion::new(0x1000, 0x2000).page_aligned());
        assert!(!UserRegion::new(0x1001, 0x2000).page_aligned());
        assert!(!UserRegion::new(0x1000, 0x2001).page_aligned());
    }

    #[test]
    fn user_region_overlap_rules() {
        let a = UserRegion::new(0x1000, 0x1000);
        let b = UserRegion::new(0x2000, 0x1000);
        // Adjacent regions do not overlap.
        assert!(!a.overlaps(b));
        assert!(a.overlaps(UserRegion::new(0x1FFF, 0x10)));
    }
}
