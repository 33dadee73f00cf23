//! Memory syscalls: allocate and deallocate user regions.

use alloc::string::String;

use bekos_core::addr::PAGE_SIZE;
use bekos_core::{SysError, SysResult};
use bekos_mm::address_space::{Backing, MemoryOperation, OwnedAllocation};

use crate::proc::with_current_userspace;

use super::INVALID_ADDRESS;

/// Largest single allocation a process may request.
const MAX_ALLOCATION: u64 = 64 * 1024 * 1024;

pub fn sys_allocate(address: u64, size: u64, _flags: u64) -> SysResult<i64> {
    if size > MAX_ALLOCATION {
        return Err(SysError::NoMemory);
    }
    if size == 0 || size % PAGE_SIZE != 0 {
        return Err(SysError::InvalidArgument);
    }

    let hint = if address == INVALID_ADDRESS {
        None
    } else {
        if address % PAGE_SIZE != 0 {
            return Err(SysError::InvalidArgument);
        }
        Some(address)
    };

    let allocation = OwnedAllocation::create_contiguous((size / PAGE_SIZE) as usize)?;
    let region = with_current_userspace(|userspace| {
        userspace.space.place_region(
            hint,
            MemoryOperation::READ | MemoryOperation::WRITE,
            String::from("allocate"),
            Backing::Owned(allocation),
        )
    })?;
    Ok(region.start as i64)
}

pub fn sys_deallocate(address: u64, size: u64) -> SysResult<i64> {
    with_current_userspace(|userspace| {
        userspace.space.deallocate_userspace_region(address, size)?;
        Ok(0)
    })
}
