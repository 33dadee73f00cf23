//! Program loading.
//!
//! Places each `PT_LOAD` segment of a validated ELF into a fresh owned
//! region of the target address space, copies the file bytes at the right
//! intra-page offset (the allocation arrives zeroed, which covers the
//! prefix and the `.bss` tail), and suggests where the stack should go:
//! below the image with a guard page when there is room for a full-size
//! stack, otherwise above it.

use alloc::format;

use bekos_core::addr::{PAGE_SIZE, UserRegion};
use bekos_core::{SysError, SysResult};
use bekos_elf::{ElfFile, PF_R, PF_W, PF_X};
use bekos_mm::address_space::{MemoryOperation, SpaceManager};
use bekos_mm::layout::USER_ADDR_MAX;

/// Size of the stack mapping given to a fresh process.
pub const DEFAULT_USER_STACK: u64 = 4 * PAGE_SIZE;
/// Room the stack suggestion reserves for growth.
pub const MAX_USER_STACK: u64 = 1024 * PAGE_SIZE;

/// What loading an image produced.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    /// The ELF entry point.
    pub entry_point: u64,
    /// Lowest mapped address of the image.
    pub lowest: u64,
    /// One past the highest mapped address.
    pub highest: u64,
}

fn operations_for(flags: u32) -> MemoryOperation {
    let mut ops = MemoryOperation::empty();
    if flags & PF_R != 0 {
        ops |= MemoryOperation::READ;
    }
    if flags & PF_W != 0 {
        ops |= MemoryOperation::WRITE;
    }
    if flags & PF_X != 0 {
        ops |= MemoryOperation::EXECUTE;
    }
    ops
}

fn permission_suffix(ops: MemoryOperation) -> &'static str {
    match (
        ops.contains(MemoryOperation::WRITE),
        ops.contains(MemoryOperation::EXECUTE),
    ) {
        (false, false) => "r--",
        (true, false) => "rw-",
        (false, true) => "r-x",
        (true, true) => "rwx",
    }
}

/// Loads every `PT_LOAD` segment of `elf` into `space`.
///
/// # Errors
///
/// `ENOTSUP` for segments outside the user half; placement and allocation
/// errors propagate.
pub fn load_into(elf: &ElfFile<'_>, name: &str, space: &mut SpaceManager) -> SysResult<LoadedImage> {
    let mut lowest = u64::MAX;
    let mut highest = 0u64;

    for segment in elf.load_segments() {
        let end = segment
            .vaddr
            .checked_add(segment.memsz)
            .ok_or(SysError::NotSupported)?;
        if segment.vaddr >= USER_ADDR_MAX || end >= USER_ADDR_MAX {
            return Err(SysError::NotSupported);
        }

        let ops = operations_for(segment.flags);
        if ops.contains(MemoryOperation::WRITE) && ops.contains(MemoryOperation::EXECUTE) {
            bekos_core::kwarn!("exec", "{}: segment is writable and executable", name);
        }

        let aligned_start = segment.vaddr & !(PAGE_SIZE - 1);
        let aligned_end = (end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let region = UserRegion::new(aligned_start, aligned_end - aligned_start);

        let allocation = space.allocate_placed_region(
            region,
            ops,
            format!("[{}]({})", name, permission_suffix(ops)),
        )?;

        // The allocation is zero-filled; only the file bytes need copying,
        // at their offset within the first page.
        let window = allocation.kernel_mapped_region();
        let copy_to = window.start + (segment.vaddr - aligned_start);
        // SAFETY: The window spans the whole aligned region and the file
        // slice fits inside it by construction.
        unsafe {
            core::ptr::copy_nonoverlapping(
                segment.data.as_ptr(),
                copy_to.as_mut_ptr::<u8>(),
                segment.data.len(),
            );
        }

        lowest = lowest.min(aligned_start);
        highest = highest.max(aligned_end);
    }

    if lowest > highest {
        // No loadable segments at all.
        return Err(SysError::NotExecutable);
    }

    Ok(LoadedImage {
        entry_point: elf.entry_point(),
        lowest,
        highest,
    })
}

/// Suggests the stack region for a loaded image: `DEFAULT_USER_STACK`
/// bytes ending one guard page below the image if a full-size stack fits
/// there, otherwise starting one guard page above it.
#[must_use]
pub fn suggested_stack(image: &LoadedImage) -> UserRegion {
    if image.lowest >= MAX_USER_STACK + PAGE_SIZE {
        let top = image.lowest - PAGE_SIZE;
        UserRegion::new(top - DEFAULT_USER_STACK, DEFAULT_USER_STACK)
    } else {
        UserRegion::new(image.highest + PAGE_SIZE, DEFAULT_USER_STACK)
    }
}
