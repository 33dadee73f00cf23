//! Device-registry syscalls: list, open, and message.

use alloc::vec::Vec;

use bekos_core::{SysError, SysResult};

use crate::api::DeviceProtocol;
use crate::drivers::registry;
use crate::proc::handles::{DeviceHandle, HandleOps};
use crate::proc::with_current_userspace;

use super::records::{DeviceRecord, device_list_size, serialise_device_list};
use super::userptr::{UserBuffer, read_user_string};

pub fn sys_list_devices(buffer: u64, len: u64, protocol_filter: u64) -> SysResult<i64> {
    let filter = if protocol_filter == 0 {
        None
    } else {
        Some(
            DeviceProtocol::from_u32(protocol_filter as u32)
                .ok_or(SysError::InvalidArgument)?,
        )
    };

    // Only devices with a userspace protocol are listed.
    let snapshot = registry::with(|r| r.snapshot());
    let visible: Vec<(&str, DeviceProtocol)> = snapshot
        .iter()
        .filter_map(|(name, device)| {
            let protocol = device.userspace_protocol()?;
            if filter.is_some_and(|f| f != protocol) {
                return None;
            }
            Some((name.as_str(), protocol))
        })
        .collect();
    let items: Vec<DeviceRecord<'_>> = visible
        .iter()
        .map(|&(name, protocol)| DeviceRecord { name, protocol })
        .collect();

    if len == 0 {
        // Probe mode: report how many bytes a full listing needs.
        return Ok(device_list_size(&items) as i64);
    }

    let user = UserBuffer::for_write(buffer, len as usize)?;
    let mut staging = alloc::vec![0u8; len as usize];
    let result = serialise_device_list(&items, &mut staging);
    user.write_bytes(&staging)?;
    match result {
        Ok(()) => Ok(0),
        Err(()) => Err(SysError::Overflow),
    }
}

pub fn sys_open_device(name_ptr: u64, name_len: u64) -> SysResult<i64> {
    let name = read_user_string(name_ptr, name_len as usize)?;
    let device = registry::with(|r| r.open(&name)).ok_or(SysError::NoEntry)?;
    let handle = DeviceHandle::new(device);
    with_current_userspace(|userspace| Ok(userspace.install_handle(handle)))
}

pub fn sys_message_device(handle: u64, message_id: u64, buffer: u64, len: u64) -> SysResult<i64> {
    let handle = with_current_userspace(|userspace| userspace.get_handle(handle as i64))?;
    if !handle.supported_operations().contains(HandleOps::MESSAGE) {
        return Err(SysError::NotSupported);
    }

    // Message records are read-write: copy in, let the device mutate,
    // copy back.
    let user = UserBuffer::for_write(buffer, len as usize)?;
    let mut staging = user.read_to_vec();
    let result = handle.message(message_id, &mut staging)?;
    user.write_bytes(&staging)?;
    Ok(result)
}
