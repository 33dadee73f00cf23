//! `bekos-elf` --- minimal ELF64 parser for the bekOS program loader.
//!
//! Parses ELF64 headers and `PT_LOAD` segments from raw byte slices using
//! safe field extraction (`from_le_bytes`). No unsafe code, no allocations.
//!
//! The loader only accepts what the kernel can run: 64-bit, little-endian,
//! AArch64, `ET_EXEC`, and no `PT_INTERP` (static executables only).
//!
//! # Usage
//!
//! ```
//! use bekos_elf::ElfFile;
//!
//! fn load(data: &[u8]) {
//!     if let Ok(elf) = ElfFile::parse(data) {
//!         let entry = elf.entry_point();
//!         for seg in elf.load_segments() {
//!             // Map seg.data at seg.vaddr, zero-fill to seg.memsz.
//!         }
//!         let _ = entry;
//!     }
//! }
//! ```

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

pub mod header;
pub mod segment;

pub use header::{Elf64Header, ElfError};
pub use segment::{ElfFile, LoadSegment, PF_R, PF_W, PF_X};
