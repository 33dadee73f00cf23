//! Program-header iteration over `PT_LOAD` segments.

use crate::header::{ELF64_PHDR_SIZE, Elf64Header, Elf64ProgramHeader, ElfError};

/// Segment type: loadable.
pub const PT_LOAD: u32 = 1;
/// Segment type: interpreter request.
pub const PT_INTERP: u32 = 3;

/// Segment flag: executable.
pub const PF_X: u32 = 1;
/// Segment flag: writable.
pub const PF_W: u32 = 2;
/// Segment flag: readable.
pub const PF_R: u32 = 4;

/// A parsed ELF64 executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfFile<'a> {
    data: &'a [u8],
    header: Elf64Header,
}

/// A loadable segment extracted from an ELF64 file.
#[derive(Debug)]
pub struct LoadSegment<'a> {
    /// Virtual address where this segment must be mapped.
    pub vaddr: u64,
    /// File content of this segment; shorter than `memsz` when the segment
    /// has a `.bss`-like zero-fill tail.
    pub data: &'a [u8],
    /// Total size of the segment in memory.
    pub memsz: u64,
    /// Permission flags (`PF_R` / `PF_W` / `PF_X`).
    pub flags: u32,
}

impl<'a> ElfFile<'a> {
    /// Parses an ELF64 executable from raw bytes.
    ///
    /// Validates the file header and rejects executables that request an
    /// interpreter.
    ///
    /// # Errors
    ///
    /// Returns an [`ElfError`] if the header is invalid, the machine or
    /// object type is unsupported, or a `PT_INTERP` segment is present.
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        let header = Elf64Header::parse(data)?;
        let file = Self { data, header };
        if file.program_headers().any(|p| p.p_type == PT_INTERP) {
            return Err(ElfError::HasInterpreter);
        }
        Ok(file)
    }

    /// Returns the virtual address of the entry point.
    #[must_use]
    pub fn entry_point(&self) -> u64 {
        self.header.e_entry
    }

    /// Returns the parsed file header.
    #[must_use]
    pub fn header(&self) -> &Elf64Header {
        &self.header
    }

    fn program_headers(&self) -> impl Iterator<Item = Elf64ProgramHeader> + 'a {
        let data = self.data;
        let phoff = self.header.e_phoff as usize;
        let phentsize = self.header.e_phentsize as usize;
        (0..self.header.e_phnum as usize).filter_map(move |i| {
            let offset = phoff + i * phentsize;
            if offset + ELF64_PHDR_SIZE > data.len() {
                return None;
            }
            Some(Elf64ProgramHeader::parse(data, offset))
        })
    }

    /// Returns an iterator over `PT_LOAD` segments.
    ///
    /// Segments whose file data falls outside the blob are skipped.
    pub fn load_segments(&self) -> impl Iterator<Item = LoadSegment<'a>> + 'a {
        let data = self.data;
        self.program_headers().filter_map(move |phdr| {
            if phdr.p_type != PT_LOAD {
                return None;
            }
            let start = usize::try_from(phdr.p_offset).ok()?;
            let len = usize::try_from(phdr.p_filesz).ok()?;
            let bytes = data.get(start..start.checked_add(len)?)?;
            Some(LoadSegment {
                vaddr: phdr.p_vaddr,
                data: bytes,
                memsz: phdr.p_memsz.max(phdr.p_filesz),
                flags: phdr.p_flags,
            })
        })
    }
}
