//! User Page Directories
//!
//! A page directory maps the user pages of one process to the frames that
//! back them. The loader installs pages through it, and the system call
//! layer looks pages up through it before touching user memory.
//!
//! # Security Properties
//! - A virtual page can be installed only once; remapping is an error
//! - Only user addresses can be mapped
//! - Destroying a directory returns every frame it owns to its pool

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::ptr::NonNull;

use bitflags::bitflags;

use super::address::VirtAddr;
use super::frame::Frame;

bitflags! {
    /// Flags recorded for each installed page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
    }
}

/// Error type for page mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// The virtual address is already mapped.
    AlreadyMapped,
    /// The address is not properly aligned.
    MisalignedAddress,
    /// Attempted to map an address outside user space.
    NotUserAddress,
}

impl core::fmt::Display for MappingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyMapped => write!(f, "virtual address already mapped"),
            Self::MisalignedAddress => write!(f, "address not properly aligned"),
            Self::NotUserAddress => write!(f, "address outside user space"),
        }
    }
}

/// Result of looking up a user page.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    /// Kernel address of the first byte of the backing frame.
    pub kpage: NonNull<u8>,
    pub flags: PageFlags,
}

impl Mapping {
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PageFlags::WRITABLE)
    }
}

/// One process's user address space.
///
/// Dropping the directory destroys it and frees every installed frame.
pub trait PageDirectory: Send {
    /// Look up the frame backing the page that contains `addr`.
    fn lookup(&self, addr: VirtAddr) -> Option<Mapping>;

    /// Map `frame` at the page-aligned user address `upage`.
    ///
    /// On failure the frame is dropped, which returns it to its pool.
    fn install(&mut self, upage: VirtAddr, frame: Frame, writable: bool)
        -> Result<(), MappingError>;
}

/// Creates and activates page directories.
pub trait Mmu: Send + Sync {
    /// Create an empty user address space.
    fn create(&self) -> Option<Box<dyn PageDirectory>>;

    /// Make `dir` the active address space, or switch to the kernel-only
    /// address space when `dir` is `None`.
    fn activate(&self, dir: Option<&dyn PageDirectory>);
}

/// A page directory walked in software.
///
/// Suitable for hosted builds where user pages are ordinary kernel memory.
#[derive(Debug, Default)]
pub struct SoftPageDirectory {
    pages: BTreeMap<u32, (Frame, PageFlags)>,
}

impl SoftPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PageDirectory for SoftPageDirectory {
    fn lookup(&self, addr: VirtAddr) -> Option<Mapping> {
        if !addr.is_user() {
            return None;
        }
        self.pages
            .get(&addr.page_number())
            .map(|(frame, flags)| Mapping {
                kpage: frame.kernel_ptr(),
                flags: *flags,
            })
    }

    fn install(
        &mut self,
        upage: VirtAddr,
        frame: Frame,
        writable: bool,
    ) -> Result<(), MappingError> {
        if !upage.is_aligned() {
            return Err(MappingError::MisalignedAddress);
        }
        if !upage.is_user() {
            return Err(MappingError::NotUserAddress);
        }
        if self.pages.contains_key(&upage.page_number()) {
            return Err(MappingError::AlreadyMapped);
        }

        let mut flags = PageFlags::PRESENT | PageFlags::USER;
        if writable {
            flags |= PageFlags::WRITABLE;
        }
        self.pages.insert(upage.page_number(), (frame, flags));
        Ok(())
    }
}

/// [`Mmu`] handing out [`SoftPageDirectory`] instances.
///
/// There is no hardware to program, so activation is only traced.
#[derive(Debug, Default)]
pub struct SoftMmu;

impl Mmu for SoftMmu {
    fn create(&self) -> Option<Box<dyn PageDirectory>> {
        Some(Box::new(SoftPageDirectory::new()))
    }

    fn activate(&self, dir: Option<&dyn PageDirectory>) {
        log::trace!("activate page directory (user: {})", dir.is_some());
    }
}
