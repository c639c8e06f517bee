//! ELF32 Executable Format
//!
//! Parses and checks the executable header and program headers of 32-bit
//! little-endian x86 executables. Headers are decoded field by field from
//! byte buffers read out of the file, never by casting file bytes.

use core::fmt;

use bitflags::bitflags;

use crate::mm::address::{is_user_vaddr, round_up_page, PAGE_MASK, PAGE_SIZE};

/// Size of the executable header on disk.
pub const EHDR_SIZE: usize = 52;
/// Size of one program header on disk.
pub const PHDR_SIZE: usize = 32;
/// Upper bound on the program header count; more means a corrupt file.
pub const MAX_PHNUM: u16 = 1024;

/// Magic, 32-bit class, little-endian, current version.
pub const ELF_IDENT: [u8; 7] = [0x7F, b'E', b'L', b'F', 1, 1, 1];
/// Object type: executable
pub const ET_EXEC: u16 = 2;
/// Machine type: Intel 80386
pub const EM_386: u16 = 3;
/// Object file version
pub const EV_CURRENT: u32 = 1;

/// Program header type: ignore
pub const PT_NULL: u32 = 0;
/// Program header type: loadable segment
pub const PT_LOAD: u32 = 1;
/// Program header type: dynamic linking info
pub const PT_DYNAMIC: u32 = 2;
/// Program header type: name of dynamic loader
pub const PT_INTERP: u32 = 3;
/// Program header type: auxiliary info
pub const PT_NOTE: u32 = 4;
/// Program header type: reserved
pub const PT_SHLIB: u32 = 5;
/// Program header type: program header table
pub const PT_PHDR: u32 = 6;
/// Program header type: stack segment
pub const PT_STACK: u32 = 0x6474_E551;

bitflags! {
    /// Segment permission flags (`p_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const X = 1;
        const W = 2;
        const R = 4;
    }
}

#[inline]
fn u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

#[inline]
fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Executable header errors. All of them abort the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// The file is shorter than the header being read.
    Truncated,
    /// Not a 32-bit little-endian ELF file.
    InvalidMagic,
    /// Relocatable or shared object instead of an executable.
    NotExecutable,
    /// Built for another machine.
    WrongMachine,
    /// Unknown ELF version.
    WrongVersion,
    /// Program header entries are not the expected size.
    BadProgramHeaderSize,
    /// Implausibly many program headers.
    TooManyProgramHeaders,
    /// Program header table offset lies outside the file.
    ProgramHeaderOutOfFile,
    /// Dynamic linking or reserved segment type.
    UnsupportedSegment(u32),
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated header"),
            Self::InvalidMagic => write!(f, "not a 32-bit little-endian ELF file"),
            Self::NotExecutable => write!(f, "not an executable"),
            Self::WrongMachine => write!(f, "wrong machine type"),
            Self::WrongVersion => write!(f, "wrong ELF version"),
            Self::BadProgramHeaderSize => write!(f, "bad program header size"),
            Self::TooManyProgramHeaders => write!(f, "too many program headers"),
            Self::ProgramHeaderOutOfFile => write!(f, "program header outside file"),
            Self::UnsupportedSegment(t) => write!(f, "unsupported segment type {:#x}", t),
        }
    }
}

/// ELF32 executable header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf32Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Elf32Header {
    pub fn parse(bytes: &[u8; EHDR_SIZE]) -> Self {
        let mut e_ident = [0u8; 16];
        e_ident.copy_from_slice(&bytes[..16]);
        Self {
            e_ident,
            e_type: u16_at(bytes, 16),
            e_machine: u16_at(bytes, 18),
            e_version: u32_at(bytes, 20),
            e_entry: u32_at(bytes, 24),
            e_phoff: u32_at(bytes, 28),
            e_shoff: u32_at(bytes, 32),
            e_flags: u32_at(bytes, 36),
            e_ehsize: u16_at(bytes, 40),
            e_phentsize: u16_at(bytes, 42),
            e_phnum: u16_at(bytes, 44),
            e_shentsize: u16_at(bytes, 46),
            e_shnum: u16_at(bytes, 48),
            e_shstrndx: u16_at(bytes, 50),
        }
    }

    /// Check that this is an executable the kernel can run.
    pub fn validate(&self) -> Result<(), ElfError> {
        if self.e_ident[..ELF_IDENT.len()] != ELF_IDENT {
            return Err(ElfError::InvalidMagic);
        }
        if self.e_type != ET_EXEC {
            return Err(ElfError::NotExecutable);
        }
        if self.e_machine != EM_386 {
            return Err(ElfError::WrongMachine);
        }
        if self.e_version != EV_CURRENT {
            return Err(ElfError::WrongVersion);
        }
        if usize::from(self.e_phentsize) != PHDR_SIZE {
            return Err(ElfError::BadProgramHeaderSize);
        }
        if self.e_phnum > MAX_PHNUM {
            return Err(ElfError::TooManyProgramHeaders);
        }
        Ok(())
    }
}

/// What the loader does with a program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Load,
    Ignore,
    /// Needs dynamic linking, or is reserved.
    Unsupported,
}

/// ELF32 program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf32ProgramHeader {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

impl Elf32ProgramHeader {
    pub fn parse(bytes: &[u8; PHDR_SIZE]) -> Self {
        Self {
            p_type: u32_at(bytes, 0),
            p_offset: u32_at(bytes, 4),
            p_vaddr: u32_at(bytes, 8),
            p_paddr: u32_at(bytes, 12),
            p_filesz: u32_at(bytes, 16),
            p_memsz: u32_at(bytes, 20),
            p_flags: u32_at(bytes, 24),
            p_align: u32_at(bytes, 28),
        }
    }

    pub fn kind(&self) -> SegmentKind {
        match self.p_type {
            PT_LOAD => SegmentKind::Load,
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => SegmentKind::Unsupported,
            // PT_NULL, PT_NOTE, PT_PHDR, PT_STACK and anything unknown
            _ => SegmentKind::Ignore,
        }
    }

    pub fn flags(&self) -> SegmentFlags {
        SegmentFlags::from_bits_truncate(self.p_flags)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.flags().contains(SegmentFlags::W)
    }
}

/// Reasons a loadable segment is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentError {
    /// File offset and virtual address have different page offsets.
    PageOffsetMismatch,
    /// File offset lies beyond the end of the file.
    OffsetPastEnd,
    /// In-memory size is smaller than the on-disk size.
    MemorySmallerThanFile,
    /// Zero-sized segment.
    Empty,
    /// Start or end lies outside user space.
    OutsideUserSpace,
    /// The address range wraps around.
    Wraparound,
    /// The segment would map page zero.
    MapsPageZero,
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::PageOffsetMismatch => "offset and address page offsets differ",
            Self::OffsetPastEnd => "offset past end of file",
            Self::MemorySmallerThanFile => "memory size smaller than file size",
            Self::Empty => "empty segment",
            Self::OutsideUserSpace => "segment outside user space",
            Self::Wraparound => "segment wraps around",
            Self::MapsPageZero => "segment maps page zero",
        };
        f.write_str(msg)
    }
}

/// Check that `phdr` describes a loadable segment of a file `file_len`
/// bytes long.
pub fn validate_segment(phdr: &Elf32ProgramHeader, file_len: u32) -> Result<(), SegmentError> {
    if phdr.p_offset & PAGE_MASK != phdr.p_vaddr & PAGE_MASK {
        return Err(SegmentError::PageOffsetMismatch);
    }
    if phdr.p_offset > file_len {
        return Err(SegmentError::OffsetPastEnd);
    }
    if phdr.p_memsz < phdr.p_filesz {
        return Err(SegmentError::MemorySmallerThanFile);
    }
    if phdr.p_memsz == 0 {
        return Err(SegmentError::Empty);
    }

    let end = phdr.p_vaddr.wrapping_add(phdr.p_memsz);
    if !is_user_vaddr(phdr.p_vaddr) || !is_user_vaddr(end) {
        return Err(SegmentError::OutsideUserSpace);
    }
    if end < phdr.p_vaddr {
        return Err(SegmentError::Wraparound);
    }
    if (phdr.p_vaddr as usize) < PAGE_SIZE {
        return Err(SegmentError::MapsPageZero);
    }
    Ok(())
}

/// Page-granular description of how to populate a validated segment.
///
/// `read_bytes + zero_bytes` is a whole number of pages starting at
/// `mem_page`; the first `read_bytes` come from the file at `file_page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    pub file_page: u32,
    pub mem_page: u32,
    pub read_bytes: u32,
    pub zero_bytes: u32,
    pub writable: bool,
}

impl SegmentPlan {
    /// Plan a segment that has passed [`validate_segment`].
    pub fn new(phdr: &Elf32ProgramHeader) -> Self {
        let page_offset = phdr.p_vaddr & PAGE_MASK;
        let total = round_up_page(page_offset + phdr.p_memsz);
        let read_bytes = if phdr.p_filesz > 0 {
            page_offset + phdr.p_filesz
        } else {
            // Entirely zero: nothing to read from disk.
            0
        };
        Self {
            file_page: phdr.p_offset & !PAGE_MASK,
            mem_page: phdr.p_vaddr & !PAGE_MASK,
            read_bytes,
            zero_bytes: total - read_bytes,
            writable: phdr.is_writable(),
        }
    }
}
