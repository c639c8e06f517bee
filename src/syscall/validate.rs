//! System Call Input Validation
//!
//! Every pointer a process passes to the kernel is checked against the
//! process's own page directory before a single byte behind it is read or
//! written.
//!
//! # Security Principles
//! - Validate ALL inputs before use
//! - Fail-secure: an unmapped or kernel address kills the caller
//! - Buffers are checked in full before any copy, so a buffer that runs
//!   into an unmapped page leaves no partial effect
//! - Data is copied into kernel memory before use (no TOCTOU on user bytes)
//! - Strings are walked one byte at a time, checking each address first

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::mm::address::{VirtAddr, CODE_BASE, PAGE_SIZE, PHYS_BASE};
use crate::mm::pagedir::{Mapping, PageDirectory};

/// A system call argument the caller is killed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The address is null, outside user space or not mapped.
    BadAddress(u32),
    /// The caller needs write access and the page is read-only.
    ReadOnly(u32),
    /// No such system call.
    UnknownSyscall(u32),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadAddress(addr) => write!(f, "bad user address {:#010x}", addr),
            Self::ReadOnly(addr) => write!(f, "write to read-only page at {:#010x}", addr),
            Self::UnknownSyscall(nr) => write!(f, "unknown system call {}", nr),
        }
    }
}

/// Checked access to one process's user memory.
#[derive(Clone, Copy)]
pub struct UserMemory<'a> {
    dir: Option<&'a dyn PageDirectory>,
}

impl<'a> UserMemory<'a> {
    /// Access through `dir`. A process without an address space has no
    /// valid user addresses at all.
    pub fn new(dir: Option<&'a dyn PageDirectory>) -> Self {
        Self { dir }
    }

    /// Check one address and return the page that backs it.
    ///
    /// Valid addresses are non-null, at or above [`CODE_BASE`], below
    /// [`PHYS_BASE`] and mapped.
    pub fn check_ptr(&self, addr: u32) -> Result<Mapping, Fault> {
        if addr == 0 || addr < CODE_BASE || addr >= PHYS_BASE {
            return Err(Fault::BadAddress(addr));
        }
        self.dir
            .and_then(|dir| dir.lookup(VirtAddr::new(addr)))
            .ok_or(Fault::BadAddress(addr))
    }

    /// Check every address in `[addr, addr + len)`.
    ///
    /// With `write` set, every page must also be writable. An empty
    /// buffer is always valid.
    pub fn check_buffer(&self, addr: u32, len: u32, write: bool) -> Result<(), Fault> {
        if len == 0 {
            return Ok(());
        }
        let last = addr.checked_add(len - 1).ok_or(Fault::BadAddress(addr))?;
        self.for_each_page(addr, last, |at, mapping| {
            if write && !mapping.is_writable() {
                return Err(Fault::ReadOnly(at));
            }
            Ok(())
        })
    }

    /// Call `f` for the first address of every page touched by
    /// `[first, last]`, after checking that address.
    fn for_each_page(
        &self,
        first: u32,
        last: u32,
        mut f: impl FnMut(u32, Mapping) -> Result<(), Fault>,
    ) -> Result<(), Fault> {
        let mut at = first;
        loop {
            let mapping = self.check_ptr(at)?;
            f(at, mapping)?;
            let next = VirtAddr::new(at).align_down().as_u32().wrapping_add(PAGE_SIZE as u32);
            if next == 0 || next > last {
                return Ok(());
            }
            at = next;
        }
    }

    /// Read a little-endian word, such as a system call argument.
    pub fn read_u32(&self, addr: u32) -> Result<u32, Fault> {
        let mut word = [0u8; 4];
        self.copy_in(addr, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Copy `len` bytes out of user memory.
    pub fn read_bytes(&self, addr: u32, len: u32) -> Result<Vec<u8>, Fault> {
        self.check_buffer(addr, len, false)?;
        let mut data = alloc::vec![0u8; len as usize];
        self.copy_in(addr, &mut data)?;
        Ok(data)
    }

    /// Read a NUL-terminated string, checking each byte's address before
    /// reading it.
    ///
    /// The whole string is checked even when it is not UTF-8; such a
    /// string yields `None` and names nothing.
    pub fn read_cstr(&self, addr: u32) -> Result<Option<String>, Fault> {
        let mut bytes = Vec::new();
        let mut at = addr;
        loop {
            let byte = self.byte_at(at)?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            at = at.checked_add(1).ok_or(Fault::BadAddress(at))?;
        }
        Ok(String::from_utf8(bytes).ok())
    }

    /// Copy `data` into user memory. The whole range must be writable.
    pub fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<(), Fault> {
        let len = u32::try_from(data.len()).map_err(|_| Fault::BadAddress(addr))?;
        self.check_buffer(addr, len, true)?;

        let mut done = 0;
        while done < data.len() {
            let at = addr + done as u32;
            let mapping = self.check_ptr(at)?;
            let offset = VirtAddr::new(at).page_offset();
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            // SAFETY: The mapping covers a whole live frame and
            // `offset + chunk` stays within it.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data[done..].as_ptr(),
                    mapping.kpage.as_ptr().add(offset),
                    chunk,
                );
            }
            done += chunk;
        }
        Ok(())
    }

    fn copy_in(&self, addr: u32, buf: &mut [u8]) -> Result<(), Fault> {
        let len = u32::try_from(buf.len()).map_err(|_| Fault::BadAddress(addr))?;
        self.check_buffer(addr, len, false)?;

        let mut done = 0;
        while done < buf.len() {
            let at = addr + done as u32;
            let mapping = self.check_ptr(at)?;
            let offset = VirtAddr::new(at).page_offset();
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            // SAFETY: As in `write_bytes`.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    mapping.kpage.as_ptr().add(offset),
                    buf[done..].as_mut_ptr(),
                    chunk,
                );
            }
            done += chunk;
        }
        Ok(())
    }

    fn byte_at(&self, addr: u32) -> Result<u8, Fault> {
        let mapping = self.check_ptr(addr)?;
        let offset = VirtAddr::new(addr).page_offset();
        // SAFETY: `offset` is below PAGE_SIZE and the frame is live.
        Ok(unsafe { *mapping.kpage.as_ptr().add(offset) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::{AllocFlags, Frame, PagePool};
    use crate::mm::pagedir::SoftPageDirectory;
    use crate::testing::page_pool;
    use alloc::sync::Arc;

    const DATA: u32 = 0x0804_8000;

    /// Two pages at `DATA`: the first read-only, the second writable.
    fn directory() -> SoftPageDirectory {
        let pool: Arc<dyn PagePool> = page_pool(4);
        let mut dir = SoftPageDirectory::new();
        for (i, writable) in [(0u32, false), (1, true)] {
            let mut frame = Frame::alloc(&pool, AllocFlags::ZERO).unwrap();
            frame.as_mut_slice()[..5].copy_from_slice(b"page\0");
            dir.install(VirtAddr::new(DATA + i * PAGE_SIZE as u32), frame, writable)
                .unwrap();
        }
        dir
    }

    #[test]
    fn test_rejects_null_low_and_kernel_addresses() {
        let dir = directory();
        let mem = UserMemory::new(Some(&dir));
        assert_eq!(mem.check_ptr(0).err(), Some(Fault::BadAddress(0)));
        assert_eq!(mem.check_ptr(DATA - 1).err(), Some(Fault::BadAddress(DATA - 1)));
        assert_eq!(mem.check_ptr(PHYS_BASE).err(), Some(Fault::BadAddress(PHYS_BASE)));
        assert!(mem.check_ptr(DATA).is_ok());
    }

    #[test]
    fn test_no_address_space() {
        let mem = UserMemory::new(None);
        assert!(mem.check_ptr(DATA).is_err());
        assert!(mem.check_buffer(DATA, 0, false).is_ok());
    }

    #[test]
    fn test_buffer_into_unmapped_page() {
        let dir = directory();
        let mem = UserMemory::new(Some(&dir));
        let end = DATA + 2 * PAGE_SIZE as u32;

        assert!(mem.check_buffer(end - 8, 8, false).is_ok());
        assert_eq!(mem.check_buffer(end - 8, 9, false), Err(Fault::BadAddress(end)));
        assert!(mem.read_bytes(end - 4, 8).is_err());
    }

    #[test]
    fn test_overflowing_buffer() {
        let dir = directory();
        let mem = UserMemory::new(Some(&dir));
        assert!(mem.check_buffer(DATA, u32::MAX, false).is_err());
    }

    #[test]
    fn test_write_needs_writable_pages() {
        let dir = directory();
        let mem = UserMemory::new(Some(&dir));
        let second = DATA + PAGE_SIZE as u32;

        assert_eq!(mem.write_bytes(DATA, b"x"), Err(Fault::ReadOnly(DATA)));
        // Straddling from the read-only page fails before anything is copied.
        assert!(mem.write_bytes(second - 2, b"abcd").is_err());
        assert_eq!(mem.read_bytes(second, 4).unwrap(), b"page");

        mem.write_bytes(second + 10, b"hello").unwrap();
        assert_eq!(mem.read_bytes(second + 10, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_read_across_pages() {
        let dir = directory();
        let mem = UserMemory::new(Some(&dir));
        let second = DATA + PAGE_SIZE as u32;
        let bytes = mem.read_bytes(second - 2, 6).unwrap();
        assert_eq!(bytes, [0, 0, b'p', b'a', b'g', b'e']);
        assert_eq!(mem.read_u32(second).unwrap(), u32::from_le_bytes(*b"page"));
    }

    #[test]
    fn test_read_cstr() {
        let dir = directory();
        let mem = UserMemory::new(Some(&dir));
        assert_eq!(mem.read_cstr(DATA).unwrap().as_deref(), Some("page"));

        // Runs off the end of the mapped region without a terminator.
        let second = DATA + PAGE_SIZE as u32;
        mem.write_bytes(second + PAGE_SIZE as u32 - 3, b"abc").unwrap();
        assert_eq!(
            mem.read_cstr(second + PAGE_SIZE as u32 - 3),
            Err(Fault::BadAddress(second + PAGE_SIZE as u32))
        );
    }

    #[test]
    fn test_read_cstr_not_utf8() {
        let dir = directory();
        let mem = UserMemory::new(Some(&dir));
        let second = DATA + PAGE_SIZE as u32;

        mem.write_bytes(second + 16, b"\xff\0\xfe\0").unwrap();
        assert_eq!(mem.read_cstr(second + 16), Ok(None));
        assert_eq!(mem.read_cstr(second + 18), Ok(None));

        // A bad address still faults when the bytes before it are not UTF-8.
        mem.write_bytes(second + PAGE_SIZE as u32 - 1, b"\xff").unwrap();
        assert_eq!(
            mem.read_cstr(second + PAGE_SIZE as u32 - 1),
            Err(Fault::BadAddress(second + PAGE_SIZE as u32))
        );
    }
}
