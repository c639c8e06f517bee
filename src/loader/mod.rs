//! Executable Loader
//!
//! Builds a process image from an ELF32 executable on disk:
//! 1. Create and activate a fresh page directory for the process
//! 2. Open the executable and deny writes to it while the process lives
//! 3. Check the executable header, then walk the program headers
//! 4. Validate each loadable segment and map it page by page
//! 5. Map one stack page below `PHYS_BASE` holding `argc`/`argv`
//!
//! # Security Considerations
//! - Dynamically linked executables are rejected
//! - Segments cannot map page zero or reach into kernel space
//! - A page that cannot be filled or mapped is returned to its pool

pub mod elf;
pub mod stack;

use core::fmt;

use crate::fs::File;
use crate::kernel::Kernel;
use crate::mm::address::{VirtAddr, PAGE_SIZE, PHYS_BASE};
use crate::mm::frame::{AllocFlags, Frame};
use crate::mm::pagedir::{MappingError, PageDirectory};
use crate::process::Process;
use crate::trap::UserEntry;

use elf::{
    validate_segment, Elf32Header, Elf32ProgramHeader, ElfError, SegmentError, SegmentKind,
    SegmentPlan, EHDR_SIZE, PHDR_SIZE,
};
use stack::ArgError;

/// Reasons a process image could not be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// Bad command line or arguments that do not fit the stack page.
    Args(ArgError),
    /// No page directory could be created.
    NoAddressSpace,
    /// The executable could not be opened.
    OpenFailed,
    /// Bad executable or program header.
    Elf(ElfError),
    /// A loadable segment failed validation.
    Segment(SegmentError),
    /// The file ended before the expected bytes were read.
    ShortRead,
    /// No page available for a segment or the stack.
    OutOfMemory,
    /// A page could not be installed.
    Mapping(MappingError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Args(e) => write!(f, "{}", e),
            Self::NoAddressSpace => write!(f, "cannot create page directory"),
            Self::OpenFailed => write!(f, "open failed"),
            Self::Elf(e) => write!(f, "error loading executable: {}", e),
            Self::Segment(e) => write!(f, "error loading executable: {}", e),
            Self::ShortRead => write!(f, "short read"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Mapping(e) => write!(f, "{}", e),
        }
    }
}

impl From<ArgError> for LoadError {
    fn from(e: ArgError) -> Self {
        Self::Args(e)
    }
}

impl From<ElfError> for LoadError {
    fn from(e: ElfError) -> Self {
        Self::Elf(e)
    }
}

impl From<SegmentError> for LoadError {
    fn from(e: SegmentError) -> Self {
        Self::Segment(e)
    }
}

impl From<MappingError> for LoadError {
    fn from(e: MappingError) -> Self {
        Self::Mapping(e)
    }
}

/// Load the program named by the first token of `cmdline` into `process`.
///
/// On success the process owns its page directory and its write-denied
/// executable, and the returned entry describes where it starts. On
/// failure the executable is closed again; the page directory, if one was
/// created, stays with the process and is destroyed when it exits.
pub fn load(kernel: &Kernel, process: &mut Process, cmdline: &str) -> Result<UserEntry, LoadError> {
    load_executable(kernel, process, cmdline).map_err(|err| {
        if let Some(mut file) = process.executable.take() {
            kernel.serialized(move || {
                file.allow_write();
                drop(file);
            });
        }
        let name = stack::program_name(cmdline).unwrap_or(cmdline);
        log::warn!("load: {}: {}", name, err);
        err
    })
}

fn load_executable(
    kernel: &Kernel,
    process: &mut Process,
    cmdline: &str,
) -> Result<UserEntry, LoadError> {
    let args = stack::tokenize(cmdline)?;
    let name = args[0];

    let dir = kernel.mmu().create().ok_or(LoadError::NoAddressSpace)?;
    let dir = process.pagedir.insert(dir);
    kernel.mmu().activate(Some(&**dir));

    let file = kernel
        .with_filesys(|fs| fs.open(name))
        .ok_or(LoadError::OpenFailed)?;
    let file = process.executable.insert(file);
    kernel.serialized(|| file.deny_write());

    let mut buf = [0u8; EHDR_SIZE];
    read_at(kernel, &mut **file, 0, &mut buf).map_err(|_| ElfError::Truncated)?;
    let ehdr = Elf32Header::parse(&buf);
    ehdr.validate()?;

    let file_len = kernel.serialized(|| file.length());
    let mut file_ofs = ehdr.e_phoff;
    for _ in 0..ehdr.e_phnum {
        if file_ofs > file_len {
            return Err(ElfError::ProgramHeaderOutOfFile.into());
        }
        let mut buf = [0u8; PHDR_SIZE];
        read_at(kernel, &mut **file, file_ofs, &mut buf)?;
        file_ofs = file_ofs.saturating_add(PHDR_SIZE as u32);

        let phdr = Elf32ProgramHeader::parse(&buf);
        match phdr.kind() {
            SegmentKind::Ignore => {}
            SegmentKind::Unsupported => {
                return Err(ElfError::UnsupportedSegment(phdr.p_type).into());
            }
            SegmentKind::Load => {
                validate_segment(&phdr, file_len)?;
                load_segment(kernel, &mut **file, &mut **dir, &SegmentPlan::new(&phdr))?;
            }
        }
    }

    let esp = setup_stack(kernel, &mut **dir, &args)?;
    log::debug!(
        "load: {}: entry {:#010x}, esp {:#010x}",
        name,
        ehdr.e_entry,
        esp
    );

    Ok(UserEntry {
        eip: ehdr.e_entry,
        esp,
    })
}

/// Read exactly `buf.len()` bytes at `offset`.
fn read_at(kernel: &Kernel, file: &mut dyn File, offset: u32, buf: &mut [u8]) -> Result<(), LoadError> {
    let read = kernel.serialized(|| {
        file.seek(offset);
        file.read(buf)
    });
    if read == buf.len() {
        Ok(())
    } else {
        Err(LoadError::ShortRead)
    }
}

/// Populate and map the pages described by `plan`.
fn load_segment(
    kernel: &Kernel,
    file: &mut dyn File,
    dir: &mut dyn PageDirectory,
    plan: &SegmentPlan,
) -> Result<(), LoadError> {
    kernel.serialized(|| file.seek(plan.file_page));

    let mut read_bytes = plan.read_bytes as usize;
    let mut zero_bytes = plan.zero_bytes as usize;
    let mut upage = VirtAddr::new(plan.mem_page);

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read_bytes = read_bytes.min(PAGE_SIZE);
        let page_zero_bytes = PAGE_SIZE - page_read_bytes;

        let mut frame = Frame::alloc(kernel.pages(), AllocFlags::USER)
            .ok_or(LoadError::OutOfMemory)?;
        let bytes = frame.as_mut_slice();
        if page_read_bytes > 0 {
            let read = kernel.serialized(|| file.read(&mut bytes[..page_read_bytes]));
            if read != page_read_bytes {
                return Err(LoadError::ShortRead);
            }
        }
        bytes[page_read_bytes..].fill(0);

        dir.install(upage, frame, plan.writable)?;

        read_bytes -= page_read_bytes;
        zero_bytes -= page_zero_bytes;
        upage = upage.add(PAGE_SIZE as u32);
    }
    Ok(())
}

/// Map a zeroed stack page just below `PHYS_BASE` with the arguments laid
/// out on it, returning the initial stack pointer.
fn setup_stack(kernel: &Kernel, dir: &mut dyn PageDirectory, args: &[&str]) -> Result<u32, LoadError> {
    let mut frame = Frame::alloc(kernel.pages(), AllocFlags::USER | AllocFlags::ZERO)
        .ok_or(LoadError::OutOfMemory)?;
    let esp = stack::build_arg_stack(args, frame.as_mut_slice(), PHYS_BASE)?;
    dir.install(VirtAddr::new(PHYS_BASE - PAGE_SIZE as u32), frame, true)?;
    Ok(esp)
}
