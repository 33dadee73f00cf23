//! ELF64 file-header parsing and validation.

/// ELF magic bytes.
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// `e_ident[EI_CLASS]` value for 64-bit objects.
pub const ELFCLASS64: u8 = 2;
/// `e_ident[EI_DATA]` value for little-endian objects.
pub const ELFDATA2LSB: u8 = 1;
/// `e_type` value for executable files.
pub const ET_EXEC: u16 = 2;
/// `e_machine` value for AArch64.
pub const EM_AARCH64: u16 = 0xB7;

/// Size of the ELF64 file header in bytes.
pub const ELF64_EHDR_SIZE: usize = 64;
/// Size of an ELF64 program header in bytes.
pub const ELF64_PHDR_SIZE: usize = 56;

/// Errors from ELF parsing and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// The data is shorter than a structure it must contain.
    Truncated,
    /// The magic bytes are not `\x7fELF`.
    BadMagic,
    /// Not a 64-bit little-endian object.
    WrongFormat,
    /// `e_machine` is not AArch64.
    WrongMachine,
    /// `e_type` is not `ET_EXEC`.
    NotExecutable,
    /// The file requests an interpreter (`PT_INTERP`); dynamic executables
    /// are not supported.
    HasInterpreter,
    /// A declared offset or size falls outside the file data.
    BadOffset,
}

fn le16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes: [u8; 2] = data.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_le_bytes(bytes))
}

fn le32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn le64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes: [u8; 8] = data.get(offset..offset + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Parsed ELF64 file header (the fields the loader needs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Header {
    /// Entry point virtual address.
    pub e_entry: u64,
    /// Program header table file offset.
    pub e_phoff: u64,
    /// Size of one program header entry.
    pub e_phentsize: u16,
    /// Number of program header entries.
    pub e_phnum: u16,
}

impl Elf64Header {
    /// Parses and validates the file header.
    ///
    /// # Errors
    ///
    /// Returns an [`ElfError`] describing the first failed check.
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < ELF64_EHDR_SIZE {
            return Err(ElfError::Truncated);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(ElfError::WrongFormat);
        }

        let e_type = le16(data, 16).ok_or(ElfError::Truncated)?;
        let e_machine = le16(data, 18).ok_or(ElfError::Truncated)?;
        if e_machine != EM_AARCH64 {
            return Err(ElfError::WrongMachine);
        }
        if e_type != ET_EXEC {
            return Err(ElfError::NotExecutable);
        }

        let e_entry = le64(data, 24).ok_or(ElfError::Truncated)?;
        let e_phoff = le64(data, 32).ok_or(ElfError::Truncated)?;
        let e_phentsize = le16(data, 54).ok_or(ElfError::Truncated)?;
        let e_phnum = le16(data, 56).ok_or(ElfError::Truncated)?;

        if (e_phentsize as usize) < ELF64_PHDR_SIZE {
            return Err(ElfError::BadOffset);
        }
        let table_len = (e_phentsize as u64)
            .checked_mul(u64::from(e_phnum))
            .ok_or(ElfError::BadOffset)?;
        let table_end = e_phoff.checked_add(table_len).ok_or(ElfError::BadOffset)?;
        if table_end > data.len() as u64 {
            return Err(ElfError::BadOffset);
        }

        Ok(Self {
            e_entry,
            e_phoff,
            e_phentsize,
            e_phnum,
        })
    }
}

/// A raw ELF64 program header.
#[derive(Debug, Clone, Copy)]
pub struct Elf64ProgramHeader {
    /// Segment type (`PT_LOAD`, `PT_INTERP`, ...).
    pub p_type: u32,
    /// Segment permission flags.
    pub p_flags: u32,
    /// File offset of segment data.
    pub p_offset: u64,
    /// Target virtual address.
    pub p_vaddr: u64,
    /// Bytes of segment data present in the file.
    pub p_filesz: u64,
    /// Total size of the segment in memory.
    pub p_memsz: u64,
}

impl Elf64ProgramHeader {
    /// Reads the program header starting at `offset`.
    ///
    /// The caller must have bounds-checked `offset + ELF64_PHDR_SIZE`
    /// already (done by [`Elf64Header::parse`] for table entries).
    #[must_use]
    pub fn parse(data: &[u8], offset: usize) -> Self {
        Self {
            p_type: le32(data, offset).unwrap_or(0),
            p_flags: le32(data, offset + 4).unwrap_or(0),
            p_offset: le64(data, offset + 8).unwrap_or(0),
            p_vaddr: le64(data, offset + 16).unwrap_or(0),
            p_filesz: le64(data, offset + 32).unwrap_or(0),
            p_memsz: le64(data, offset + 40).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::tests::build_elf;

    #[test]
    fn parse_minimal_valid() {
        let elf = build_elf(0x40_0000, &[]);
        let hdr = Elf64Header::parse(&elf).unwrap();
        assert_eq!(hdr.e_entry, 0x40_0000);
        assert_eq!(hdr.e_phnum, 0);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut elf = build_elf(0, &[]);
        elf[0] = 0;
        assert_eq!(Elf64Header::parse(&elf), Err(ElfError::BadMagic));
    }

    #[test]
    fn rejects_32bit() {
        let mut elf = build_elf(0, &[]);
        elf[4] = 1; // ELFCLASS32
        assert_eq!(Elf64Header::parse(&elf), Err(ElfError::WrongFormat));
    }

    #[test]
    fn rejects_big_endian() {
        let mut elf = build_elf(0, &[]);
        elf[5] = 2;
        assert_eq!(Elf64Header::parse(&elf), Err(ElfError::WrongFormat));
    }

    #[test]
    fn rejects_wrong_machine() {
        let mut elf = build_elf(0, &[]);
        elf[18..20].copy_from_slice(&0x3Eu16.to_le_bytes()); // EM_X86_64
        assert_eq!(Elf64Header::parse(&elf), Err(ElfError::WrongMachine));
    }

    #[test]
    fn rejects_shared_object() {
        let mut elf = build_elf(0, &[]);
        elf[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        assert_eq!(Elf64Header::parse(&elf), Err(ElfError::NotExecutable));
    }

    #[test]
    fn rejects_truncated() {
        let elf = build_elf(0, &[]);
        assert_eq!(Elf64Header::parse(&elf[..32]), Err(ElfError::Truncated));
    }
}
