//! Variable-length record serialisation for the enumeration syscalls.
//!
//! Directory entries and device listings are returned as chains of
//! variable-sized records linked by `next_offset`: 0 marks the final
//! record, and when the next record would not fit, `next_offset` is set
//! to the remaining buffer bytes so a walker steps cleanly off the end.

use crate::api::DeviceProtocol;
use crate::fs::FileKind;

/// Field offsets of a directory-entry record.
pub mod file_item {
    /// `next_offset`: 0 on the final record; remaining buffer bytes when
    /// the next record cannot fit.
    pub const NEXT_OFFSET: usize = 0;
    /// Object size in bytes.
    pub const SIZE: usize = 8;
    /// Object kind (1 = file, 2 = directory).
    pub const KIND: usize = 16;
    /// NUL-terminated name.
    pub const NAME: usize = 20;

    /// Record alignment, from its widest field.
    pub const ALIGN: usize = 8;

    /// Bytes a record with an `n`-byte name occupies before alignment.
    #[must_use]
    pub const fn whole_size(name_len: usize) -> usize {
        NAME + name_len + 1
    }
}

/// Field offsets of a device-list record.
pub mod device_item {
    /// `next_offset`: same convention as directory records.
    pub const NEXT_OFFSET: usize = 0;
    /// The device's userspace protocol tag.
    pub const PROTOCOL: usize = 8;
    /// NUL-terminated registry name.
    pub const NAME: usize = 12;

    /// Record alignment.
    pub const ALIGN: usize = 8;

    /// Bytes a record with an `n`-byte name occupies before alignment.
    #[must_use]
    pub const fn whole_size(name_len: usize) -> usize {
        NAME + name_len + 1
    }
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn put_u64(buffer: &mut [u8], offset: usize, value: u64) {
    buffer[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// One directory entry to serialise.
pub struct DirRecord<'a> {
    /// Entry name.
    pub name: &'a str,
    /// Entry size in bytes.
    pub size: u64,
    /// File or directory.
    pub kind: FileKind,
}

/// Serialises `entries[start..]` into `buffer`.
///
/// Returns the number of entries written. The last written record's
/// `next_offset` is 0 if it is the directory's final entry, else the
/// remaining buffer bytes (the out-of-space sentinel).
#[must_use]
pub fn serialise_dir_entries(entries: &[DirRecord<'_>], start: usize, buffer: &mut [u8]) -> usize {
    buffer.fill(0);
    let mut index = start;
    let mut cursor = 0usize;

    while index < entries.len() {
        let entry = &entries[index];
        let entry_size = file_item::whole_size(entry.name.len());
        if cursor + entry_size > buffer.len() {
            break;
        }

        let mut offset_to_next = align_up(entry_size, file_item::ALIGN);
        if index + 1 == entries.len() {
            offset_to_next = 0;
        } else {
            let next_size = file_item::whole_size(entries[index + 1].name.len());
            if cursor + offset_to_next + next_size > buffer.len() {
                // The next record will not fit: point past the buffer.
                offset_to_next = buffer.len() - cursor;
            }
        }

        put_u64(buffer, cursor + file_item::NEXT_OFFSET, offset_to_next as u64);
        put_u64(buffer, cursor + file_item::SIZE, entry.size);
        put_u32(buffer, cursor + file_item::KIND, entry.kind as u32);
        let name_at = cursor + file_item::NAME;
        buffer[name_at..name_at + entry.name.len()].copy_from_slice(entry.name.as_bytes());
        // The NUL terminator is already there from the initial clear.

        index += 1;
        if offset_to_next == 0 || cursor + offset_to_next >= buffer.len() {
            break;
        }
        cursor += offset_to_next;
    }
    index - start
}

/// One device to serialise.
pub struct DeviceRecord<'a> {
    /// Full registry name.
    pub name: &'a str,
    /// The device's protocol tag.
    pub protocol: DeviceProtocol,
}

/// Bytes needed to list every device in `devices` (the `len == 0` probe
/// mode of `ListDevices`).
#[must_use]
pub fn device_list_size(devices: &[DeviceRecord<'_>]) -> usize {
    let mut total = 0usize;
    for device in devices {
        total = align_up(total, device_item::ALIGN) + device_item::whole_size(device.name.len());
    }
    total
}

/// Serialises `devices` into `buffer`.
///
/// Returns `Ok(())` when everything fit (final record's `next_offset` is
/// 0) or `Err(())` on overflow, with the last written record carrying the
/// out-of-space sentinel.
pub fn serialise_device_list(
    devices: &[DeviceRecord<'_>],
    buffer: &mut [u8],
) -> Result<(), ()> {
    buffer.fill(0);
    let mut cursor = 0usize;
    let mut written_at: Option<usize> = None;

    for device in devices {
        let entry_size = device_item::whole_size(device.name.len());
        if cursor + entry_size > buffer.len() {
            // Out of space: the previous record points past the buffer.
            if let Some(last) = written_at {
                put_u64(
                    buffer,
                    last + device_item::NEXT_OFFSET,
                    (buffer.len() - last) as u64,
                );
            }
            return Err(());
        }

        let offset_to_next = align_up(entry_size, device_item::ALIGN);
        put_u64(buffer, cursor + device_item::NEXT_OFFSET, offset_to_next as u64);
        put_u32(buffer, cursor + device_item::PROTOCOL, device.protocol as u32);
        let name_at = cursor + device_item::NAME;
        buffer[name_at..name_at + device.name.len()].copy_from_slice(device.name.as_bytes());

        written_at = Some(cursor);
        cursor += offset_to_next;
    }

    // Reached the end: final record terminates the chain.
    if let Some(last) = written_at {
        put_u64(buffer, last + device_item::NEXT_OFFSET, 0);
    }
    Ok(())
}
