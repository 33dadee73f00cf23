//! Entity handles: what a process's open-entity table holds.
//!
//! A handle wraps something a process can act on (a filesystem entry or
//! a registered device) behind a uniform operation set. Which of the
//! operations a given handle supports is advertised up front so the
//! syscall layer can reject mismatches with `ENOTSUP` before touching the
//! object.

use alloc::sync::Arc;

use bekos_core::sync::SpinLock;
use bekos_core::{SysError, SysResult};
use bitflags::bitflags;

use crate::drivers::device::Device;
use crate::fs::EntryRef;

bitflags! {
    /// Operations an entity handle may support.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleOps: u8 {
        /// `sys_read`.
        const READ = 1 << 0;
        /// `sys_write`.
        const WRITE = 1 << 1;
        /// `sys_seek`.
        const SEEK = 1 << 2;
        /// `sys_message_device`.
        const MESSAGE = 1 << 3;
    }
}

/// Where a seek is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SeekLocation {
    /// From the start of the object.
    Set = 0,
    /// From the current cursor.
    Current = 1,
    /// From the end of the object.
    End = 2,
}

impl SeekLocation {
    /// Decodes the wire value.
    #[must_use]
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Set),
            1 => Some(Self::Current),
            2 => Some(Self::End),
            _ => None,
        }
    }
}

/// One open entity.
pub trait EntityHandle: Send + Sync {
    /// The operations this handle supports.
    fn supported_operations(&self) -> HandleOps;

    /// Reads at an explicit offset.
    ///
    /// # Errors
    ///
    /// `ENOTSUP` unless [`HandleOps::READ`] is supported.
    fn read(&self, offset: u64, buffer: &mut [u8]) -> SysResult<usize> {
        let _ = (offset, buffer);
        Err(SysError::NotSupported)
    }

    /// Writes at an explicit offset.
    ///
    /// # Errors
    ///
    /// `ENOTSUP` unless [`HandleOps::WRITE`] is supported.
    fn write(&self, offset: u64, buffer: &[u8]) -> SysResult<usize> {
        let _ = (offset, buffer);
        Err(SysError::NotSupported)
    }

    /// Moves the handle's cursor, returning the new absolute position.
    ///
    /// # Errors
    ///
    /// `ENOTSUP` unless [`HandleOps::SEEK`] is supported; `EINVAL` for a
    /// position before the start.
    fn seek(&self, location: SeekLocation, offset: i64) -> SysResult<u64> {
        let _ = (location, offset);
        Err(SysError::NotSupported)
    }

    /// Sends a protocol message.
    ///
    /// # Errors
    ///
    /// `ENOTSUP` unless [`HandleOps::MESSAGE`] is supported.
    fn message(&self, message_id: u64, buffer: &mut [u8]) -> SysResult<i64> {
        let _ = (message_id, buffer);
        Err(SysError::NotSupported)
    }

    /// Returns the wrapped filesystem entry for handles that have one;
    /// used by directory enumeration and stat.
    fn entry(&self) -> Option<EntryRef> {
        None
    }
}

/// A handle over a filesystem entry.
pub struct FileHandle {
    entry: EntryRef,
    cursor: SpinLock<u64>,
}

impl FileHandle {
    /// Opens `entry`.
    #[must_use]
    pub fn new(entry: EntryRef) -> Arc<Self> {
        Arc::new(Self {
            entry,
            cursor: SpinLock::new(0),
        })
    }
}

impl EntityHandle for FileHandle {
    fn supported_operations(&self) -> HandleOps {
        HandleOps::READ | HandleOps::WRITE | HandleOps::SEEK
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> SysResult<usize> {
        self.entry.read(offset, buffer)
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> SysResult<usize> {
        self.entry.write(offset, buffer)
    }

    fn seek(&self, location: SeekLocation, offset: i64) -> SysResult<u64> {
        let mut cursor = self.cursor.lock();
        let base = match location {
            SeekLocation::Set => 0,
            SeekLocation::Current => *cursor as i64,
            SeekLocation::End => self.entry.size() as i64,
        };
        let target = base.checked_add(offset).ok_or(SysError::InvalidArgument)?;
        if target < 0 {
            return Err(SysError::InvalidArgument);
        }
        *cursor = target as u64;
        Ok(*cursor)
    }

    fn entry(&self) -> Option<EntryRef> {
        Some(self.entry.clone())
    }
}

/// A handle over a registered device.
pub struct DeviceHandle {
    device: Arc<dyn Device>,
}

impl DeviceHandle {
    /// Opens `device`.
    #[must_use]
    pub fn new(device: Arc<dyn Device>) -> Arc<Self> {
        Arc::new(Self { device })
    }
}

impl EntityHandle for DeviceHandle {
    fn supported_operations(&self) -> HandleOps {
        HandleOps::MESSAGE
    }

    fn message(&self, message_id: u64, buffer: &mut [u8]) -> SysResult<i64> {
        self.device.message(message_id, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemEntry;

    #[test]
    fn file_handle_read_write() {
        let file = MemEntry::file("f", b"abcdef".to_vec());
        let handle = FileHandle::new(file);
        assert!(handle.supported_operations().contains(HandleOps::READ));

        let mut buf = [0u8; 3];
        assert_eq!(handle.read(2, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"cde");

        assert_eq!(handle.write(6, b"gh").unwrap(), 2);
        let mut buf = [0u8; 8];
        assert_eq!(handle.read(0, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"abcdefgh");
    }

    #[test]
    fn file_handle_seek_variants() {
        let file = MemEntry::file("f", alloc::vec![0u8; 100]);
        let handle = FileHandle::new(file);
        assert_eq!(handle.seek(SeekLocation::Set, 10).unwrap(), 10);
        assert_eq!(handle.seek(SeekLocation::Current, 5).unwrap(), 15);
        assert_eq!(handle.seek(SeekLocation::End, -20).unwrap(), 80);
        assert_eq!(
            handle.seek(SeekLocation::Set, -1),
            Err(SysError::InvalidArgument)
        );
    }

    #[test]
    fn file_handle_rejects_message() {
        let handle = FileHandle::new(MemEntry::file("f", Vec::new()));
        let mut buf = [0u8; 4];
        assert_eq!(handle.message(0, &mut buf), Err(SysError::NotSupported));
    }

    use alloc::vec::Vec;

    struct EchoDevice;
    impl Device for EchoDevice {
        fn kind(&self) -> crate::drivers::device::DeviceKind {
            crate::drivers::device::DeviceKind::Keyboard
        }
        fn message(&self, message_id: u64, buffer: &mut [u8]) -> SysResult<i64> {
            buffer.fill(message_id as u8);
            Ok(buffer.len() as i64)
        }
    }

    #[test]
    fn device_handle_routes_messages() {
        let handle = DeviceHandle::new(Arc::new(EchoDevice));
        assert_eq!(handle.supported_operations(), HandleOps::MESSAGE);
        let mut buf = [0u8; 4];
        assert_eq!(handle.message(7, &mut buf), Ok(4));
        assert_eq!(buf, [7; 4]);
        assert_eq!(handle.read(0, &mut buf), Err(SysError::NotSupported));
    }
}
