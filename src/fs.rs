//! File system interface
//!
//! The subsystem only consumes a file system. All calls into it are
//! serialized by the kernel-wide file system lock held in
//! [`Kernel`](crate::kernel::Kernel).

use alloc::boxed::Box;

/// An open file.
///
/// Closing a file is dropping its handle.
pub trait File: Send {
    /// Read into `buf` from the current position, returning the number of
    /// bytes read.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Write `buf` at the current position, returning the number of bytes
    /// written. Returns 0 while writes to the file are denied.
    fn write(&mut self, buf: &[u8]) -> usize;

    /// Move the position to `pos` bytes from the start.
    fn seek(&mut self, pos: u32);

    /// Current position in bytes from the start.
    fn tell(&self) -> u32;

    /// Length of the file in bytes.
    fn length(&self) -> u32;

    /// Prevent writes to the underlying file until `allow_write`.
    fn deny_write(&mut self);

    /// Undo a previous `deny_write` from this handle.
    fn allow_write(&mut self);
}

/// Path-level file system operations.
pub trait FileSystem: Send + Sync {
    fn open(&self, name: &str) -> Option<Box<dyn File>>;

    /// Create a file named `name` with `initial_size` zero bytes.
    fn create(&self, name: &str, initial_size: u32) -> bool;

    fn remove(&self, name: &str) -> bool;
}
