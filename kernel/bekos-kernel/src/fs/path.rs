//! Path parsing.
//!
//! Syntax: `/name` is absolute, `name` relative, `..` parent, `.` self.
//! An absolute path may begin with a disk specifier, `/(disk0)/rest`,
//! selecting the root of a named filesystem.

use alloc::string::String;
use alloc::vec::Vec;

use bekos_core::{SysError, SysResult};

/// A parsed path: owned string plus segment ranges into it.
#[derive(Debug)]
pub struct Path {
    raw: String,
    /// Byte ranges of each segment within `raw`.
    segments: Vec<(usize, usize)>,
    /// Byte range of the disk specifier, if present.
    disk: Option<(usize, usize)>,
    absolute: bool,
}

impl Path {
    /// Parses a path string.
    ///
    /// # Errors
    ///
    /// `EINVAL` for an unclosed disk specifier or a specifier not followed
    /// by `/`.
    pub fn parse(raw: &str) -> SysResult<Self> {
        let bytes = raw.as_bytes();
        let mut cursor = 0usize;
        let absolute = bytes.first() == Some(&b'/');
        let mut disk = None;

        if absolute {
            cursor += 1;
            if bytes.get(cursor) == Some(&b'(') {
                cursor += 1;
                let disk_start = cursor;
                while cursor < bytes.len() && bytes[cursor] != b')' {
                    cursor += 1;
                }
                if cursor == bytes.len() {
                    // Unclosed specifier.
                    return Err(SysError::InvalidArgument);
                }
                disk = Some((disk_start, cursor));
                cursor += 1;
                if bytes.get(cursor) != Some(&b'/') {
                    return Err(SysError::InvalidArgument);
                }
                cursor += 1;
            }
        }

        let mut segments = Vec::new();
        let mut segment_start = cursor;
        while cursor < bytes.len() {
            if bytes[cursor] == b'/' {
                if cursor > segment_start {
                    segments.push((segment_start, cursor));
                }
                segment_start = cursor + 1;
            }
            cursor += 1;
        }
        if cursor > segment_start {
            segments.push((segment_start, cursor));
        }

        Ok(Self {
            raw: String::from(raw),
            segments,
            disk,
            absolute,
        })
    }

    /// Returns `true` if the path starts with `/`.
    #[must_use]
    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// Returns the disk specifier, if the path named one.
    #[must_use]
    pub fn disk_specifier(&self) -> Option<&str> {
        self.disk.map(|(start, end)| &self.raw[start..end])
    }

    /// Returns the path's segments in order.
    #[must_use]
    pub fn segments(&self) -> Vec<&str> {
        self.segments
            .iter()
            .map(|&(start, end)| &self.raw[start..end])
            .collect()
    }

    /// Returns the original string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}
