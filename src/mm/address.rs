//! User Virtual Address Types
//!
//! Type-safe wrapper for addresses inside a process's 32-bit user address
//! space, plus the constants that describe its layout.
//!
//! # Layout
//! ```text
//! 0xFFFF_FFFF +----------------------+
//!             |   kernel (no access) |
//! PHYS_BASE   +----------------------+ <- initial user stack pointer
//!             |   user stack page    |
//!             |         ...          |
//! CODE_BASE   |   code / data        |
//!             |         ...          |
//! PAGE_SIZE   +----------------------+
//!             |   page 0 (unmapped)  |
//! 0x0000_0000 +----------------------+
//! ```

use core::fmt;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: u32 = PAGE_SIZE as u32 - 1;
/// Bits to shift for page number
pub const PAGE_SHIFT: u32 = 12;

/// First address above user space. Everything at or above it belongs to
/// the kernel.
pub const PHYS_BASE: u32 = 0xC000_0000;

/// Lowest address a system call argument may point at.
pub const CODE_BASE: u32 = 0x0804_8000;

/// Returns true if `addr` lies below [`PHYS_BASE`].
#[inline]
pub const fn is_user_vaddr(addr: u32) -> bool {
    addr < PHYS_BASE
}

/// A virtual address in a user address space.
///
/// Arithmetic on these addresses wraps the way the 32-bit hardware does;
/// callers that care about wraparound check for it explicitly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        (self.0 & PAGE_MASK) as usize
    }

    /// Get the virtual page number.
    #[inline]
    pub const fn page_number(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    /// Add an offset to this address, wrapping at 4 GiB.
    #[inline]
    pub const fn add(self, offset: u32) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Check if this is a user address.
    #[inline]
    pub const fn is_user(self) -> bool {
        is_user_vaddr(self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Round `value` up to the next multiple of [`PAGE_SIZE`].
#[inline]
pub const fn round_up_page(value: u32) -> u32 {
    (value + PAGE_MASK) & !PAGE_MASK
}
