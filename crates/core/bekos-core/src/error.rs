//! Kernel-wide error codes.
//!
//! Every fallible kernel API returns [`SysResult`], and the syscall
//! dispatcher turns an `Err` into `-errno` for userspace.

use core::fmt;

/// The kernel error code set.
///
/// Discriminants are the errno values delivered to userspace (negated).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum SysError {
    /// Invalid argument.
    InvalidArgument = 1,
    /// Out of memory.
    NoMemory = 2,
    /// Operation not supported.
    NotSupported = 3,
    /// No such file, directory, or device.
    NoEntry = 4,
    /// Entity already exists.
    Exists = 5,
    /// Bad entity handle.
    BadHandle = 6,
    /// Not a directory.
    NotDirectory = 7,
    /// Address already in use.
    AddressInUse = 8,
    /// Bad user-space address.
    BadAddress = 9,
    /// Input/output error.
    Io = 10,
    /// No such device.
    NoDevice = 11,
    /// Not an executable.
    NotExecutable = 12,
    /// Value too large for the provided buffer.
    Overflow = 13,
    /// Unspecified internal failure.
    Failed = 14,
}

impl SysError {
    /// Returns the errno value delivered to userspace (positive).
    #[inline]
    #[must_use]
    pub const fn errno(self) -> i64 {
        self as i64
    }

    /// Returns a short human-readable name for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::InvalidArgument => "EINVAL",
            Self::NoMemory => "ENOMEM",
            Self::NotSupported => "ENOTSUP",
            Self::NoEntry => "ENOENT",
            Self::Exists => "EEXIST",
            Self::BadHandle => "EBADF",
            Self::NotDirectory => "ENOTDIR",
            Self::AddressInUse => "EADDRINUSE",
            Self::BadAddress => "EFAULT",
            Self::Io => "EIO",
            Self::NoDevice => "ENODEV",
            Self::NotExecutable => "ENOEXEC",
            Self::Overflow => "EOVERFLOW",
            Self::Failed => "EFAIL",
        }
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result alias used by every fallible kernel API.
pub type SysResult<T> = Result<T, SysError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_distinct_and_positive() {
        let all = [
            SysError::InvalidArgument,
            SysError::NoMemory,
            SysError::NotSupported,
            SysError::NoEntry,
            SysError::Exists,
            SysError::BadHandle,
            SysError::NotDirectory,
            SysError::AddressInUse,
            SysError::BadAddress,
            SysError::Io,
            SysError::NoDevice,
            SysError::NotExecutable,
            SysError::Overflow,
            SysError::Failed,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.errno() > 0);
            for b in &all[i + 1..] {
                assert_ne!(a.errno(), b.errno());
            }
        }
    }

    #[test]
    fn names_match_convention() {
        assert_eq!(SysError::NoMemory.name(), "ENOMEM");
        assert_eq!(SysError::AddressInUse.name(), "EADDRINUSE");
    }
}
