//! System-call dispatch.
//!
//! One entry from EL0: the call number arrives in the low 32 bits of x0
//! with up to seven arguments in x1..x7. Every handler returns
//! `SysResult<i64>`; the dispatcher flattens that to a signed value,
//! `-errno` on failure.

mod io;
mod memory;
mod process;
mod query;
pub mod records;
pub mod userptr;

use bekos_core::SysResult;

/// Handle argument meaning "none" (`u64::MAX` on the wire).
pub const INVALID_HANDLE: u64 = u64::MAX;
/// Address argument meaning "no hint".
pub const INVALID_ADDRESS: u64 = u64::MAX;

/// The system-call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SysCall {
    /// Open a filesystem entry.
    Open = 1,
    /// Close an open entity.
    Close = 2,
    /// Read from an entity at an offset.
    Read = 3,
    /// Write to an entity at an offset.
    Write = 4,
    /// Move an entity's cursor.
    Seek = 5,
    /// Serialise a directory's children.
    GetDirEntries = 6,
    /// Stat an entry by handle or path.
    Stat = 7,
    /// List registered devices.
    ListDevices = 8,
    /// Open a registered device by name.
    OpenDevice = 9,
    /// Send a protocol message to a device.
    CommandDevice = 10,
    /// Map fresh memory into the address space.
    Allocate = 11,
    /// Remove a previously allocated region.
    Deallocate = 12,
    /// The caller's pid.
    GetPid = 13,
    /// Duplicate the calling process.
    Fork = 14,
    /// Block for a number of nanoseconds.
    Sleep = 15,
    /// Terminate the calling process.
    Exit = 16,
}

impl SysCall {
    fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::Open,
            2 => Self::Close,
            3 => Self::Read,
            4 => Self::Write,
            5 => Self::Seek,
            6 => Self::GetDirEntries,
            7 => Self::Stat,
            8 => Self::ListDevices,
            9 => Self::OpenDevice,
            10 => Self::CommandDevice,
            11 => Self::Allocate,
            12 => Self::Deallocate,
            13 => Self::GetPid,
            14 => Self::Fork,
            15 => Self::Sleep,
            16 => Self::Exit,
            _ => return None,
        })
    }
}

fn handle(call: SysCall, a: [u64; 7]) -> SysResult<i64> {
    match call {
        SysCall::Open => io::sys_open(a[0], a[1], a[2], a[3], a[4]),
        SysCall::Close => io::sys_close(a[0]),
        SysCall::Read => io::sys_read(a[0], a[1], a[2], a[3]),
        SysCall::Write => io::sys_write(a[0], a[1], a[2], a[3]),
        SysCall::Seek => io::sys_seek(a[0], a[1], a[2]),
        SysCall::GetDirEntries => io::sys_get_dir_entries(a[0], a[1], a[2], a[3]),
        SysCall::Stat => io::sys_stat(a[0], a[1], a[2], a[3], a[4]),
        SysCall::ListDevices => query::sys_list_devices(a[0], a[1], a[2]),
        SysCall::OpenDevice => query::sys_open_device(a[0], a[1]),
        SysCall::CommandDevice => query::sys_message_device(a[0], a[1], a[2], a[3]),
        SysCall::Allocate => memory::sys_allocate(a[0], a[1], a[2]),
        SysCall::Deallocate => memory::sys_deallocate(a[0], a[1]),
        SysCall::GetPid => process::sys_get_pid(),
        SysCall::Fork => process::sys_fork(),
        SysCall::Sleep => process::sys_sleep(a[0]),
        SysCall::Exit => process::sys_exit(a[0]),
    }
}

/// The dispatch entry, called from the EL0 synchronous-exception handler.
///
/// Unknown call numbers return `-ENOTSUP`.
#[must_use]
pub fn dispatch(number: u32, args: [u64; 7]) -> i64 {
    let Some(call) = SysCall::from_u32(number) else {
        return -bekos_core::SysError::NotSupported.errno();
    };
    match handle(call, args) {
        Ok(value) => value,
        Err(err) => -err.errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_number_is_enotsup() {
        assert_eq!(
            dispatch(0, [0; 7]),
            -bekos_core::SysError::NotSupported.errno()
        );
        assert_eq!(
            dispatch(999, [0; 7]),
            -bekos_core::SysError::NotSupported.errno()
        );
    }

    #[test]
    fn call_numbers_round_trip() {
        for n in 1..=16u32 {
            let call = SysCall::from_u32(n).unwrap();
            assert_eq!(call as u32, n);
        }
        assert!(SysCall::from_u32(17).is_none());
    }
}
