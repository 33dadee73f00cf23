//! Per-process user address spaces.
//!
//! A [`SpaceManager`] pairs a user root table with a sorted list of
//! non-overlapping [`UserspaceRegion`]s. Each region is backed by a
//! [`Backing`]: either a reference-counted contiguous allocation of frames
//! or a device-owned MMIO range, and each backing knows how to map itself
//! into a table, how to come back out, and what forking it means.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bekos_core::addr::{PAGE_SIZE, PhysRegion, UserRegion, VirtAddr, VirtRegion};
use bekos_core::{SysError, SysResult};
use bitflags::bitflags;

use crate::layout::USER_ADDR_MAX;
use crate::table::{MemAttrIndex, PageAttributes, TableManager};
use crate::{ident, pmm};

/// Lowest address handed out when neither a hint nor a predecessor region
/// constrains placement.
const VIRT_ADDR_START: u64 = 0x0050_0000;

bitflags! {
    /// Operations a userspace mapping permits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryOperation: u8 {
        /// Loads are allowed.
        const READ = 1 << 0;
        /// Stores are allowed.
        const WRITE = 1 << 1;
        /// Instruction fetch is allowed.
        const EXECUTE = 1 << 2;
    }
}

// ---------------------------------------------------------------------------
// Backings
// ---------------------------------------------------------------------------

/// A contiguous run of frames owned by its reference count.
pub struct OwnedAllocation {
    region: PhysRegion,
}

impl OwnedAllocation {
    /// Allocates `n_pages` contiguous zeroed frames.
    ///
    /// # Errors
    ///
    /// Returns `ENOMEM` when no contiguous run is available.
    pub fn create_contiguous(n_pages: usize) -> SysResult<Arc<Self>> {
        let region = pmm::with(|pa| pa.allocate_region(n_pages)).ok_or(SysError::NoMemory)?;
        let virt = ident::phys_to_virt(region.start);
        // SAFETY: Freshly allocated frames, identity-mapped for the kernel.
        unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, region.size as usize) };
        Ok(Arc::new(Self { region }))
    }

    /// Returns the owned physical region.
    #[must_use]
    pub fn phys_region(&self) -> PhysRegion {
        self.region
    }

    /// Returns the kernel-visible window onto the allocation.
    #[must_use]
    pub fn kernel_mapped_region(&self) -> VirtRegion {
        VirtRegion::new(ident::phys_to_virt(self.region.start), self.region.size)
    }
}

impl Drop for OwnedAllocation {
    fn drop(&mut self) {
        pmm::with(|pa| pa.free_region(self.region.start));
    }
}

/// What a userspace region maps: the source of its frames plus the rules
/// for mapping, unmapping, and forking it.
#[derive(Clone)]
pub enum Backing {
    /// A reference-counted contiguous allocation; forking deep-copies it.
    Owned(Arc<OwnedAllocation>),
    /// MMIO frames owned by a driver; forking shares the same frames.
    Device {
        /// The device frames to expose.
        phys: PhysRegion,
    },
}

impl Backing {
    /// Returns the size of the backing in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Owned(alloc) => alloc.region.size,
            Self::Device { phys } => phys.size,
        }
    }

    fn phys_start(&self) -> bekos_core::PhysAddr {
        match self {
            Self::Owned(alloc) => alloc.region.start,
            Self::Device { phys } => phys.start,
        }
    }

    fn attr_index(&self) -> MemAttrIndex {
        match self {
            Self::Owned(_) => MemAttrIndex::Normal,
            Self::Device { .. } => MemAttrIndex::Device,
        }
    }

    /// Maps `user_region` onto this backing at `offset` with the given
    /// permission triple.
    ///
    /// # Errors
    ///
    /// Propagates table-manager failures (`EADDRINUSE`, `ENOMEM`).
    pub fn map_into_table(
        &self,
        tables: &mut TableManager,
        user_region: UserRegion,
        offset: u64,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> SysResult<()> {
        debug_assert!(offset + user_region.size <= self.size());
        tables.map_region(
            VirtAddr::new_truncate(user_region.start),
            self.phys_start() + offset,
            user_region.size,
            PageAttributes::for_user(readable, writable, executable),
            self.attr_index(),
        )
    }

    /// Removes the mapping installed by
    /// [`map_into_table`](Self::map_into_table).
    ///
    /// # Errors
    ///
    /// Propagates table-manager failures (`EINVAL`).
    pub fn unmap_from_table(
        &self,
        tables: &mut TableManager,
        user_region: UserRegion,
        _offset: u64,
    ) -> SysResult<()> {
        tables.unmap_region(VirtAddr::new_truncate(user_region.start), user_region.size)
    }

    /// Produces the child's backing for a fork.
    ///
    /// Owned allocations are copied frame-for-frame; device regions are
    /// shared with the parent.
    ///
    /// # Errors
    ///
    /// Returns `ENOMEM` if the copy cannot be allocated.
    pub fn clone_for_fork(&self) -> SysResult<Backing> {
        match self {
            Self::Owned(alloc) => {
                let pages = (alloc.region.size / PAGE_SIZE) as usize;
                let copy = OwnedAllocation::create_contiguous(pages)?;
                let src = alloc.kernel_mapped_region();
                let dst = copy.kernel_mapped_region();
                // SAFETY: Both windows are identity-mapped, disjoint, and
                // sized identically.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        src.start.as_ptr::<u8>(),
                        dst.start.as_mut_ptr::<u8>(),
                        alloc.region.size as usize,
                    );
                }
                Ok(Self::Owned(copy))
            }
            Self::Device { phys } => Ok(Self::Device { phys: *phys }),
        }
    }

    /// Returns the kernel-visible window, if the backing has one.
    #[must_use]
    pub fn kernel_mapped_region(&self) -> Option<VirtRegion> {
        match self {
            Self::Owned(alloc) => Some(alloc.kernel_mapped_region()),
            Self::Device { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// SpaceManager
// ---------------------------------------------------------------------------

/// One region of a user address space.
pub struct UserspaceRegion {
    /// Where the region sits in the user half.
    pub user_region: UserRegion,
    /// The frames behind it.
    pub backing: Backing,
    /// Diagnostic name (`"stack"`, `"[init](r-x)"`, ...).
    pub name: String,
    /// Operations the mapping permits.
    pub permissions: MemoryOperation,
}

/// Manages one process's user address space.
///
/// Invariant: `regions` is sorted by start address and pairwise
/// non-overlapping; every region is page-aligned.
pub struct SpaceManager {
    tables: TableManager,
    regions: Vec<UserspaceRegion>,
}

impl SpaceManager {
    /// Creates an empty address space with a fresh user root table.
    ///
    /// # Errors
    ///
    /// Returns `ENOMEM` if the root table cannot be allocated.
    pub fn create() -> SysResult<Self> {
        Ok(Self {
            tables: TableManager::user()?,
            regions: Vec::new(),
        })
    }

    /// Returns the physical address of the root table for TTBR0.
    #[must_use]
    pub fn raw_root_ptr(&self) -> bekos_core::PhysAddr {
        self.tables.root_phys()
    }

    /// Returns the regions, sorted by start address.
    #[must_use]
    pub fn regions(&self) -> &[UserspaceRegion] {
        &self.regions
    }

    /// Chooses an address for `backing` and maps it.
    ///
    /// The address is the hint if given, else just past the last region,
    /// else the fixed floor. The chosen range must not overlap an existing
    /// region and must stay below `USER_ADDR_MAX`.
    ///
    /// # Errors
    ///
    /// `EADDRINUSE` on overlap, `EINVAL` if placement exceeds the user
    /// half, plus any mapping failure.
    pub fn place_region(
        &mut self,
        hint: Option<u64>,
        permissions: MemoryOperation,
        name: String,
        backing: Backing,
    ) -> SysResult<UserRegion> {
        let pages = backing.size().div_ceil(PAGE_SIZE);
        let size = pages * PAGE_SIZE;

        let start = match hint {
            Some(addr) => addr,
            None => self.regions.last().map_or(VIRT_ADDR_START, |last| {
                (last.user_region.end() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
            }),
        };
        if start % PAGE_SIZE != 0 {
            return Err(SysError::InvalidArgument);
        }
        let desired = UserRegion::new(start, size);
        if desired.end() > USER_ADDR_MAX {
            return Err(SysError::InvalidArgument);
        }

        // Find the sorted insertion point, rejecting overlap.
        let mut insert_at = self.regions.len();
        for (index, existing) in self.regions.iter().enumerate() {
            if existing.user_region.overlaps(desired) {
                return Err(SysError::AddressInUse);
            }
            if existing.user_region.start >= desired.end() {
                insert_at = index;
                break;
            }
        }

        backing.map_into_table(
            &mut self.tables,
            desired,
            0,
            permissions.contains(MemoryOperation::READ),
            permissions.contains(MemoryOperation::WRITE),
            permissions.contains(MemoryOperation::EXECUTE),
        )?;

        self.regions.insert(
            insert_at,
            UserspaceRegion {
                user_region: desired,
                backing,
                name,
                permissions,
            },
        );
        Ok(desired)
    }

    /// Allocates a fresh owned backing of exactly `region`'s size and
    /// places it there.
    ///
    /// # Errors
    ///
    /// As [`place_region`](Self::place_region), plus `ENOMEM` for the
    /// allocation itself.
    pub fn allocate_placed_region(
        &mut self,
        region: UserRegion,
        permissions: MemoryOperation,
        name: String,
    ) -> SysResult<Arc<OwnedAllocation>> {
        assert!(region.page_aligned());
        let allocation = OwnedAllocation::create_contiguous((region.size / PAGE_SIZE) as usize)?;
        self.place_region(
            Some(region.start),
            permissions,
            name,
            Backing::Owned(allocation.clone()),
        )?;
        Ok(allocation)
    }

    /// Removes the region that starts at `addr` with exactly `size` bytes.
    /// Splitting is not supported.
    ///
    /// # Errors
    ///
    /// `EINVAL` if no region matches exactly.
    pub fn deallocate_userspace_region(&mut self, addr: u64, size: u64) -> SysResult<()> {
        let index = self
            .regions
            .iter()
            .position(|r| r.user_region.start == addr && r.user_region.size == size)
            .ok_or(SysError::InvalidArgument)?;
        let region = &self.regions[index];
        region
            .backing
            .unmap_from_table(&mut self.tables, region.user_region, 0)?;
        self.regions.remove(index);
        Ok(())
    }

    /// Verifies that `[addr, addr+size)` is fully contained in one region
    /// permitting `op`.
    #[must_use]
    pub fn check_region(&self, addr: u64, size: u64, op: MemoryOperation) -> bool {
        let Some(end) = addr.checked_add(size) else {
            return false;
        };
        let wanted = UserRegion::new(addr, end - addr);
        self.regions
            .iter()
            .any(|r| r.user_region.contains(wanted) && r.permissions.contains(op))
    }

    /// Produces the child address space for a fork: every region keeps its
    /// place, name and permissions over its backing's fork clone, mapped
    /// into a fresh root table.
    ///
    /// # Errors
    ///
    /// Returns `ENOMEM` if any clone or mapping fails.
    pub fn clone_for_fork(&self) -> SysResult<SpaceManager> {
        let mut tables = TableManager::user()?;
        let mut regions = Vec::with_capacity(self.regions.len());
        for old in &self.regions {
            let backing = old.backing.clone_for_fork()?;
            backing.map_into_table(
                &mut tables,
                old.user_region,
                0,
                old.permissions.contains(MemoryOperation::READ),
                old.permissions.contains(MemoryOperation::WRITE),
                old.permissions.contains(MemoryOperation::EXECUTE),
            )?;
            regions.push(UserspaceRegion {
                user_region: old.user_region,
                backing,
                name: old.name.clone(),
                permissions: old.permissions,
            });
        }
        Ok(SpaceManager { tables, regions })
    }

    /// Translates a user address through this space's tables (diagnostic /
    /// test aid).
    #[must_use]
    pub fn translate(&self, addr: u64) -> Option<bekos_core::PhysAddr> {
        self.tables
            .translate(VirtAddr::new_truncate(addr))
            .map(|t| t.phys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    const RW: MemoryOperation = MemoryOperation::READ.union(MemoryOperation::WRITE);

    fn space() -> SpaceManager {
        crate::test_support::init_test_pmm();
        SpaceManager::create().unwrap()
    }

    fn owned(pages: usize) -> Backing {
        Backing::Owned(OwnedAllocation::create_contiguous(pages).unwrap())
    }

    #[test]
    fn placement_uses_floor_then_packs() {
        let mut sm = space();
        let a = sm
            .place_region(None, RW, "a".to_string(), owned(1))
            .unwrap();
        assert_eq!(a.start, 0x50_0000);
        let b = sm
            .place_region(None, RW, "b".to_string(), owned(2))
            .unwrap();
        assert_eq!(b.start, a.end());
    }

    #[test]
    fn hint_is_respected() {
        let mut sm = space();
        let region = sm
            .place_region(Some(0x100_0000), RW, "hinted".to_string(), owned(1))
            .unwrap();
        assert_eq!(region.start, 0x100_0000);
        assert!(sm.translate(0x100_0000).is_some());
    }

    #[test]
    fn overlap_rejected_with_addressinuse() {
        let mut sm = space();
        sm.place_region(Some(0x100_0000), RW, "a".to_string(), owned(2))
            .unwrap();
        let err = sm.place_region(Some(0x100_1000), RW, "b".to_string(), owned(1));
        assert_eq!(err.err(), Some(SysError::AddressInUse));
    }

    #[test]
    fn placement_beyond_user_max_rejected() {
        let mut sm = space();
        let err = sm.place_region(
            Some(USER_ADDR_MAX - PAGE_SIZE),
            RW,
            "high".to_string(),
            owned(2),
        );
        assert_eq!(err.err(), Some(SysError::InvalidArgument));
    }

    #[test]
    fn regions_stay_sorted_and_disjoint() {
        let mut sm = space();
        for hint in [0x300_0000u64, 0x100_0000, 0x200_0000] {
            sm.place_region(Some(hint), RW, "r".to_string(), owned(1))
                .unwrap();
        }
        let regions = sm.regions();
        for pair in regions.windows(2) {
            assert!(pair[0].user_region.end() <= pair[1].user_region.start);
        }
    }

    #[test]
    fn deallocate_requires_exact_match() {
        let mut sm = space();
        let region = sm
            .place_region(Some(0x100_0000), RW, "a".to_string(), owned(2))
            .unwrap();
        // Wrong size: refused.
        assert_eq!(
            sm.deallocate_userspace_region(region.start, PAGE_SIZE),
            Err(SysError::InvalidArgument)
        );
        sm.deallocate_userspace_region(region.start, region.size)
            .unwrap();
        assert!(sm.regions().is_empty());
        assert!(sm.translate(region.start).is_none());
    }

    #[test]
    fn check_region_honours_bounds_and_permissions() {
        let mut sm = space();
        let region = sm
            .place_region(Some(0x100_0000), MemoryOperation::READ, "ro".to_string(), owned(1))
            .unwrap();
        assert!(sm.check_region(region.start, 10, MemoryOperation::READ));
        assert!(!sm.check_region(region.start, 10, MemoryOperation::WRITE));
        // Straddling the end of the region fails.
        assert!(!sm.check_region(region.start + PAGE_SIZE - 4, 8, MemoryOperation::READ));
        // Unmapped address fails.
        assert!(!sm.check_region(0x700_0000, 4, MemoryOperation::READ));
        // Overflowing range fails.
        assert!(!sm.check_region(u64::MAX - 2, 8, MemoryOperation::READ));
    }

    #[test]
    fn fork_clones_layout_and_contents() {
        let mut sm = space();
        let region = sm
            .place_region(Some(0x100_0000), RW, "data".to_string(), owned(1))
            .unwrap();

        // Scribble into the parent's backing through the kernel window.
        let parent_window = sm.regions()[0].backing.kernel_mapped_region().unwrap();
        // SAFETY: window is the identity view of the owned frames.
        unsafe {
            core::ptr::write_bytes(parent_window.start.as_mut_ptr::<u8>(), 0x5A, 64);
        }

        let child = sm.clone_for_fork().unwrap();

        // Same sequence of names, positions, sizes, permissions.
        assert_eq!(child.regions().len(), sm.regions().len());
        for (p, c) in sm.regions().iter().zip(child.regions()) {
            assert_eq!(p.user_region, c.user_region);
            assert_eq!(p.name, c.name);
            assert_eq!(p.permissions, c.permissions);
        }

        // Distinct frames, equal bytes.
        let child_window = child.regions()[0].backing.kernel_mapped_region().unwrap();
        assert_ne!(parent_window.start, child_window.start);
        // SAFETY: both windows are live identity views.
        let (parent_bytes, child_bytes) = unsafe {
            (
                core::slice::from_raw_parts(parent_window.start.as_ptr::<u8>(), 64),
                core::slice::from_raw_parts(child_window.start.as_ptr::<u8>(), 64),
            )
        };
        assert_eq!(parent_bytes, child_bytes);

        // Distinct root tables resolving to distinct frames.
        assert_ne!(sm.raw_root_ptr(), child.raw_root_ptr());
        assert_ne!(
            sm.translate(region.start),
            child.translate(region.start)
        );
    }

    #[test]
    fn device_backing_shares_frames_across_fork() {
        let mut sm = space();
        let phys = PhysRegion::new(bekos_core::PhysAddr::new(0xF000_0000), PAGE_SIZE);
        sm.place_region(
            Some(0x200_0000),
            RW,
            "fb".to_string(),
            Backing::Device { phys },
        )
        .unwrap();
        let child = sm.clone_for_fork().unwrap();
        assert_eq!(sm.translate(0x200_0000), child.translate(0x200_0000));
    }
}
