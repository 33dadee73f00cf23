//! Validated user-space buffers.
//!
//! A [`UserBuffer`] is only constructed after the current process's space
//! manager confirmed the whole range lies inside one region permitting
//! the requested operation. The kernel runs with the process's user table
//! installed, so access is then a plain copy at the user address.

use alloc::string::String;
use alloc::vec::Vec;

use bekos_core::{SysError, SysResult};
use bekos_mm::address_space::MemoryOperation;

/// Longest string a syscall accepts.
pub const MAX_USER_STRING: usize = 1024;

/// A user range validated against the current address space.
pub struct UserBuffer {
    addr: u64,
    len: usize,
}

impl UserBuffer {
    /// Validates `[addr, addr+len)` for kernel reads (the user wrote it).
    ///
    /// # Errors
    ///
    /// `EFAULT` if the range is not fully inside a readable region.
    pub fn for_read(addr: u64, len: usize) -> SysResult<Self> {
        Self::validated(addr, len, MemoryOperation::READ)
    }

    /// Validates `[addr, addr+len)` for kernel writes (results for the
    /// user).
    ///
    /// # Errors
    ///
    /// `EFAULT` if the range is not fully inside a writable region.
    pub fn for_write(addr: u64, len: usize) -> SysResult<Self> {
        Self::validated(addr, len, MemoryOperation::WRITE)
    }

    fn validated(addr: u64, len: usize, op: MemoryOperation) -> SysResult<Self> {
        if len == 0 {
            return Ok(Self { addr: 0, len: 0 });
        }
        let valid = crate::proc::with_current_userspace(|userspace| {
            Ok(userspace.space.check_region(addr, len as u64, op))
        })?;
        if !valid {
            return Err(SysError::BadAddress);
        }
        Ok(Self { addr, len })
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies the buffer into kernel memory.
    #[must_use]
    pub fn read_to_vec(&self) -> Vec<u8> {
        let mut data = alloc::vec![0u8; self.len];
        if self.len > 0 {
            // SAFETY: The range was validated readable in the current
            // address space, which stays installed for this syscall.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.addr as *const u8,
                    data.as_mut_ptr(),
                    self.len,
                );
            }
        }
        data
    }

    /// Copies `data` into the buffer.
    ///
    /// # Errors
    ///
    /// `EOVERFLOW` if `data` is longer than the buffer.
    pub fn write_bytes(&self, data: &[u8]) -> SysResult<()> {
        if data.len() > self.len {
            return Err(SysError::Overflow);
        }
        if !data.is_empty() {
            // SAFETY: Validated writable; see `read_to_vec`.
            unsafe {
                core::ptr::copy_nonoverlapping(data.as_ptr(), self.addr as *mut u8, data.len());
            }
        }
        Ok(())
    }
}

/// Reads a length-bounded UTF-8 string from userspace.
///
/// # Errors
///
/// `EINVAL` for over-long or non-UTF-8 strings, `EFAULT` for a bad range.
pub fn read_user_string(addr: u64, len: usize) -> SysResult<String> {
    if len > MAX_USER_STRING {
        return Err(SysError::InvalidArgument);
    }
    let buffer = UserBuffer::for_read(addr, len)?;
    String::from_utf8(buffer.read_to_vec()).map_err(|_| SysError::InvalidArgument)
}
