//! Memory management for user processes
//!
//! Provides:
//! - User virtual address types and layout constants
//! - Page frames and page pools
//! - Per-process page directories
//!
//! # Security Principles
//! - Page zero is never mapped
//! - User mappings never reach into kernel space
//! - Frames are owned, so error paths cannot leak them

pub mod address;
pub mod frame;
pub mod pagedir;

pub use address::{VirtAddr, CODE_BASE, PAGE_SIZE, PHYS_BASE};
pub use frame::{AllocFlags, Frame, HeapPagePool, PagePool};
pub use pagedir::{Mapping, MappingError, Mmu, PageDirectory, SoftMmu, SoftPageDirectory};
