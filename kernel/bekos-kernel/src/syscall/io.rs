//! File-oriented syscalls: open, close, read, write, seek, directory
//! enumeration, and stat.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bekos_core::{SysError, SysResult};
use bitflags::bitflags;

use crate::fs::{self, EntryRef, path::Path};
use crate::proc::handles::{EntityHandle, FileHandle, HandleOps, SeekLocation};
use crate::proc::with_current_userspace;

use super::records::{DirRecord, serialise_dir_entries};
use super::userptr::{UserBuffer, read_user_string};
use super::INVALID_HANDLE;

bitflags! {
    /// Flags to `sys_open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u64 {
        /// Create the entry if the final component is missing.
        const CREATE_IF_MISSING = 1 << 0;
        /// Create the entry; fail with `EEXIST` if it already exists.
        const CREATE_ONLY = 1 << 1;
        /// A created entry is a directory.
        const DIRECTORY = 1 << 2;
    }
}

/// The stat record's wire size: size (8) + kind (4), padded to 16.
const STAT_WIRE_SIZE: usize = 16;

fn write_stat(buffer_addr: u64, entry: &EntryRef) -> SysResult<()> {
    let region = UserBuffer::for_write(buffer_addr, STAT_WIRE_SIZE)?;
    let mut wire = [0u8; STAT_WIRE_SIZE];
    wire[0..8].copy_from_slice(&entry.size().to_le_bytes());
    wire[8..12].copy_from_slice(&(entry.kind() as u32).to_le_bytes());
    region.write_bytes(&wire)
}

fn entry_of_handle(handle: &Arc<dyn EntityHandle>) -> SysResult<EntryRef> {
    handle.entry().ok_or(SysError::BadHandle)
}

pub fn sys_open(
    path_ptr: u64,
    path_len: u64,
    flags: u64,
    parent: u64,
    stat_ptr: u64,
) -> SysResult<i64> {
    let flags = OpenFlags::from_bits_truncate(flags);
    let path_string = read_user_string(path_ptr, path_len as usize)?;
    let path = Path::parse(&path_string)?;

    // Resolve relative to the cwd, or an open directory handle.
    let root: EntryRef = if parent == INVALID_HANDLE {
        with_current_userspace(|userspace| Ok(userspace.cwd.clone()))?
    } else {
        let handle = with_current_userspace(|userspace| userspace.get_handle(parent as i64))?;
        let entry = entry_of_handle(&handle)?;
        if !entry.is_directory() {
            return Err(SysError::NotDirectory);
        }
        entry
    };

    let mut parent_holder: Option<EntryRef> = None;
    let entry = match fs::full_path_lookup(&root, &path, Some(&mut parent_holder)) {
        Ok(found) => {
            if flags.contains(OpenFlags::CREATE_ONLY) {
                return Err(SysError::Exists);
            }
            found
        }
        Err(SysError::NoEntry)
            if flags.intersects(OpenFlags::CREATE_IF_MISSING | OpenFlags::CREATE_ONLY) =>
        {
            let parent_entry = parent_holder.ok_or(SysError::NoEntry)?;
            let name = path.segments().last().copied().ok_or(SysError::InvalidArgument)?;
            parent_entry.add_child(name, flags.contains(OpenFlags::DIRECTORY))?
        }
        Err(err) => return Err(err),
    };

    if stat_ptr != 0 {
        write_stat(stat_ptr, &entry)?;
    }

    let handle = FileHandle::new(entry);
    with_current_userspace(|userspace| Ok(userspace.install_handle(handle)))
}

pub fn sys_close(handle: u64) -> SysResult<i64> {
    with_current_userspace(|userspace| {
        userspace.close_handle(handle as i64)?;
        Ok(0)
    })
}

pub fn sys_read(handle: u64, offset: u64, buffer: u64, len: u64) -> SysResult<i64> {
    let handle = with_current_userspace(|userspace| userspace.get_handle(handle as i64))?;
    if !handle.supported_operations().contains(HandleOps::READ) {
        return Err(SysError::NotSupported);
    }

    let user = UserBuffer::for_write(buffer, len as usize)?;
    let mut staging = alloc::vec![0u8; len as usize];
    let read = handle.read(offset, &mut staging)?;
    user.write_bytes(&staging[..read])?;
    Ok(read as i64)
}

pub fn sys_write(handle: u64, offset: u64, buffer: u64, len: u64) -> SysResult<i64> {
    let handle = with_current_userspace(|userspace| userspace.get_handle(handle as i64))?;
    if !handle.supported_operations().contains(HandleOps::WRITE) {
        return Err(SysError::NotSupported);
    }

    let user = UserBuffer::for_read(buffer, len as usize)?;
    let staging = user.read_to_vec();
    let written = handle.write(offset, &staging)?;
    Ok(written as i64)
}

pub fn sys_seek(handle: u64, location: u64, offset: u64) -> SysResult<i64> {
    let handle = with_current_userspace(|userspace| userspace.get_handle(handle as i64))?;
    if !handle.supported_operations().contains(HandleOps::SEEK) {
        return Err(SysError::NotSupported);
    }
    let location = SeekLocation::from_u64(location).ok_or(SysError::InvalidArgument)?;
    let position = handle.seek(location, offset as i64)?;
    Ok(position as i64)
}

pub fn sys_get_dir_entries(handle: u64, start: u64, buffer: u64, len: u64) -> SysResult<i64> {
    let handle = with_current_userspace(|userspace| userspace.get_handle(handle as i64))?;
    let entry = entry_of_handle(&handle)?;
    if !entry.is_directory() {
        return Err(SysError::NotDirectory);
    }

    let children = entry.all_children()?;
    let dir_records: Vec<DirRecord<'_>> = children
        .iter()
        .map(|child| DirRecord {
            name: child.name(),
            size: child.size(),
            kind: child.kind(),
        })
        .collect();

    let user = UserBuffer::for_write(buffer, len as usize)?;
    let mut staging = alloc::vec![0u8; len as usize];
    let written = serialise_dir_entries(&dir_records, start as usize, &mut staging);
    user.write_bytes(&staging)?;
    Ok((start as usize + written) as i64)
}

pub fn sys_stat(
    handle: u64,
    path_ptr: u64,
    path_len: u64,
    _follow_links: u64,
    stat_ptr: u64,
) -> SysResult<i64> {
    let entry = if handle != INVALID_HANDLE {
        let handle = with_current_userspace(|userspace| userspace.get_handle(handle as i64))?;
        entry_of_handle(&handle)?
    } else {
        let path_string = read_user_string(path_ptr, path_len as usize)?;
        let path = Path::parse(&path_string)?;
        let cwd = with_current_userspace(|userspace| Ok(userspace.cwd.clone()))?;
        fs::full_path_lookup(&cwd, &path, None)?
    };

    write_stat(stat_ptr, &entry)?;
    Ok(0)
}
