//! Filesystem-facing interfaces.
//!
//! The concrete filesystem lives outside this core; the kernel consumes it
//! through [`Entry`] (a file or directory in some mounted filesystem) and
//! [`BlockDevice`] (the storage a filesystem driver sits on). Path syntax
//! and lookup over those interfaces are implemented here.

pub mod path;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bekos_core::{SysError, SysResult};

use path::Path;

/// What kind of object a directory entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FileKind {
    /// A regular file.
    File = 1,
    /// A directory.
    Directory = 2,
}

/// The stat record reported to userspace.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Stat {
    /// Size of the object in bytes.
    pub size: u64,
    /// File or directory.
    pub kind: FileKind,
}

/// Shared handle to a filesystem entry.
pub type EntryRef = Arc<dyn Entry>;

/// One entry (file or directory) in a mounted filesystem.
pub trait Entry: Send + Sync {
    /// The entry's name within its parent.
    fn name(&self) -> &str;

    /// File or directory.
    fn kind(&self) -> FileKind;

    /// Size in bytes (0 for directories unless the filesystem reports one).
    fn size(&self) -> u64;

    /// Returns `true` for directories.
    fn is_directory(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    /// Reads up to `buffer.len()` bytes at `offset`. Returns bytes read.
    ///
    /// # Errors
    ///
    /// `ENOTSUP` for directories; `EIO` on media failure.
    fn read(&self, offset: u64, buffer: &mut [u8]) -> SysResult<usize>;

    /// Writes `buffer` at `offset`. Returns bytes written.
    ///
    /// # Errors
    ///
    /// `ENOTSUP` for directories or read-only filesystems.
    fn write(&self, offset: u64, buffer: &[u8]) -> SysResult<usize>;

    /// Looks up a direct child by name.
    ///
    /// # Errors
    ///
    /// `ENOTDIR` for files, `ENOENT` if absent.
    fn lookup(&self, name: &str) -> SysResult<EntryRef>;

    /// Returns the parent directory, or `None` at a filesystem root.
    fn parent(&self) -> Option<EntryRef>;

    /// Lists every direct child, in filesystem order.
    ///
    /// # Errors
    ///
    /// `ENOTDIR` for files.
    fn all_children(&self) -> SysResult<Vec<EntryRef>>;

    /// Creates a child entry (create-on-open support).
    ///
    /// # Errors
    ///
    /// `ENOTSUP` for read-only filesystems, `ENOTDIR` for files,
    /// `EEXIST` if the name is taken.
    fn add_child(&self, name: &str, directory: bool) -> SysResult<EntryRef> {
        let _ = (name, directory);
        Err(SysError::NotSupported)
    }
}

/// A block device a filesystem driver can mount.
pub trait BlockDevice: Send + Sync {
    /// Logical block size in bytes.
    fn block_size(&self) -> usize;

    /// Number of logical blocks.
    fn block_count(&self) -> u64;

    /// Reads whole blocks starting at `block` into `buffer`.
    ///
    /// # Errors
    ///
    /// `EINVAL` for a misaligned buffer, `EIO` on media failure.
    fn read_blocks(&self, block: u64, buffer: &mut [u8]) -> SysResult<()>;

    /// Writes whole blocks starting at `block` from `buffer`.
    ///
    /// # Errors
    ///
    /// As [`read_blocks`](Self::read_blocks).
    fn write_blocks(&self, block: u64, buffer: &[u8]) -> SysResult<()>;
}

/// Resolves a filesystem-root for a disk specifier (`/(disk0)/...`).
///
/// Registered by the filesystem layer at mount time; the lookup path
/// consults it only when a path carries a specifier.
pub trait RootResolver: Send + Sync {
    /// Returns the root entry of the named filesystem.
    ///
    /// # Errors
    ///
    /// `ENOENT` if no mounted filesystem has that name.
    fn resolve_root(&self, name: &str) -> SysResult<EntryRef>;
}

static ROOT_RESOLVER: bekos_core::sync::SpinLock<Option<Arc<dyn RootResolver>>> =
    bekos_core::sync::SpinLock::new(None);

/// Installs the mounted-filesystem resolver.
pub fn set_root_resolver(resolver: Arc<dyn RootResolver>) {
    *ROOT_RESOLVER.lock() = Some(resolver);
}

/// Walks `path` starting from `base`.
///
/// `..` steps to the parent (clamped at the root), `.` stays put. When
/// `parent_out` is given, it receives the entry one short of the final
/// component even when the final lookup fails (used by create-on-open).
///
/// # Errors
///
/// `ENOENT` when a component is missing, `ENOTDIR` when a non-final
/// component is a file.
pub fn full_path_lookup(
    base: &EntryRef,
    path: &Path,
    mut parent_out: Option<&mut Option<EntryRef>>,
) -> SysResult<EntryRef> {
    let mut current: EntryRef = if let Some(disk) = path.disk_specifier() {
        let guard = ROOT_RESOLVER.lock();
        let resolver = guard.as_ref().ok_or(SysError::NoEntry)?;
        resolver.resolve_root(disk)?
    } else if path.is_absolute() {
        // Climb to the root of the current filesystem.
        let mut root = base.clone();
        while let Some(parent) = root.parent() {
            root = parent;
        }
        root
    } else {
        base.clone()
    };

    let segments = path.segments();
    for (index, segment) in segments.iter().enumerate() {
        let is_last = index + 1 == segments.len();
        match *segment {
            "." => continue,
            ".." => {
                if let Some(parent) = current.parent() {
                    current = parent;
                }
            }
            name => {
                if !current.is_directory() {
                    return Err(SysError::NotDirectory);
                }
                if is_last {
                    if let Some(out) = parent_out.as_deref_mut() {
                        *out = Some(current.clone());
                    }
                }
                current = current.lookup(name)?;
            }
        }
    }
    Ok(current)
}

/// An in-memory entry tree; the test stand-in for a mounted filesystem,
/// also used by boot-time ramdisk staging.
pub struct MemEntry {
    name: String,
    kind: FileKind,
    data: bekos_core::sync::SpinLock<Vec<u8>>,
    children: bekos_core::sync::SpinLock<Vec<EntryRef>>,
    parent: bekos_core::sync::SpinLock<Option<alloc::sync::Weak<MemEntry>>>,
}

impl MemEntry {
    /// Creates a file entry holding `data`.
    #[must_use]
    pub fn file(name: &str, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            kind: FileKind::File,
            data: bekos_core::sync::SpinLock::new(data),
            children: bekos_core::sync::SpinLock::new(Vec::new()),
            parent: bekos_core::sync::SpinLock::new(None),
        })
    }

    /// Creates an empty directory entry.
    #[must_use]
    pub fn dir(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: String::from(name),
            kind: FileKind::Directory,
            data: bekos_core::sync::SpinLock::new(Vec::new()),
            children: bekos_core::sync::SpinLock::new(Vec::new()),
            parent: bekos_core::sync::SpinLock::new(None),
        })
    }

    /// Attaches `child` under `self`.
    pub fn add_child(self: &Arc<Self>, child: Arc<MemEntry>) {
        *child.parent.lock() = Some(Arc::downgrade(self));
        self.children.lock().push(child);
    }
}

impl Entry for MemEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> FileKind {
        self.kind
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> SysResult<usize> {
        if self.kind == FileKind::Directory {
            return Err(SysError::NotSupported);
        }
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buffer.len().min(data.len() - offset);
        buffer[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> SysResult<usize> {
        if self.kind == FileKind::Directory {
            return Err(SysError::NotSupported);
        }
        let mut data = self.data.lock();
        let offset = offset as usize;
        let end = offset + buffer.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buffer);
        Ok(buffer.len())
    }

    fn lookup(&self, name: &str) -> SysResult<EntryRef> {
        if self.kind != FileKind::Directory {
            return Err(SysError::NotDirectory);
        }
        self.children
            .lock()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or(SysError::NoEntry)
    }

    fn parent(&self) -> Option<EntryRef> {
        self.parent
            .lock()
            .as_ref()
            .and_then(alloc::sync::Weak::upgrade)
            .map(|p| p as EntryRef)
    }

    fn all_children(&self) -> SysResult<Vec<EntryRef>> {
        if self.kind != FileKind::Directory {
            return Err(SysError::NotDirectory);
        }
        Ok(self.children.lock().clone())
    }

    fn add_child(&self, name: &str, directory: bool) -> SysResult<EntryRef> {
        if self.kind != FileKind::Directory {
            return Err(SysError::NotDirectory);
        }
        let mut children = self.children.lock();
        if children.iter().any(|c| c.name() == name) {
            return Err(SysError::Exists);
        }
        let child = if directory {
            MemEntry::dir(name)
        } else {
            MemEntry::file(name, Vec::new())
        };
        children.push(child.clone());
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn sample_tree() -> Arc<MemEntry> {
        let root = MemEntry::dir("");
        let etc = MemEntry::dir("etc");
        let motd = MemEntry::file("motd", b"welcome\n".to_vec());
        etc.add_child(motd);
        root.add_child(etc);
        root.add_child(MemEntry::file("kernel.img", vec![0u8; 16]));
        root
    }

    fn lookup(root: &Arc<MemEntry>, path: &str) -> SysResult<EntryRef> {
        let parsed = Path::parse(path).unwrap();
        let base: EntryRef = root.clone();
        full_path_lookup(&base, &parsed, None)
    }

    #[test]
    fn absolute_lookup() {
        let root = sample_tree();
        let motd = lookup(&root, "/etc/motd").unwrap();
        assert_eq!(motd.name(), "motd");
        assert_eq!(motd.size(), 8);
    }

    #[test]
    fn relative_lookup_from_subdir() {
        let root = sample_tree();
        let etc = lookup(&root, "/etc").unwrap();
        let parsed = Path::parse("motd").unwrap();
        let motd = full_path_lookup(&etc, &parsed, None).unwrap();
        assert_eq!(motd.name(), "motd");
    }

    #[test]
    fn dot_and_dotdot() {
        let root = sample_tree();
        let motd = lookup(&root, "/etc/./../etc/motd").unwrap();
        assert_eq!(motd.name(), "motd");
        // `..` at the root stays at the root.
        let etc = lookup(&root, "/../etc").unwrap();
        assert_eq!(etc.name(), "etc");
    }

    #[test]
    fn missing_component() {
        let root = sample_tree();
        assert_eq!(lookup(&root, "/etc/passwd").err(), Some(SysError::NoEntry));
    }

    #[test]
    fn file_used_as_directory() {
        let root = sample_tree();
        assert_eq!(
            lookup(&root, "/kernel.img/x").err(),
            Some(SysError::NotDirectory)
        );
    }

    #[test]
    fn parent_out_filled_even_on_missing_final() {
        let root = sample_tree();
        let parsed = Path::parse("/etc/newfile").unwrap();
        let base: EntryRef = root.clone();
        let mut parent = None;
        let result = full_path_lookup(&base, &parsed, Some(&mut parent));
        assert!(result.is_err());
        assert_eq!(parent.unwrap().name(), "etc");
    }

    #[test]
    fn read_write_round_trip() {
        let file = MemEntry::file("f", Vec::new());
        assert_eq!(file.write(0, b"hello").unwrap(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(file.read(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        // Read past the end returns zero bytes.
        assert_eq!(file.read(100, &mut buf).unwrap(), 0);
    }
}
