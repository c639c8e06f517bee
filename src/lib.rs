//! PantherOS user programs
//!
//! The part of the kernel that runs user programs on a 32-bit x86 user
//! ABI: it loads ELF executables, lays out their arguments, tracks parent
//! and child processes, and serves their system calls.
//!
//! # Components
//! - [`loader`]: ELF32 validation, segment mapping, initial stack
//! - [`process`]: process creation, wait and exit, descriptor tables
//! - [`syscall`]: system call dispatch and checked user memory access
//! - [`mm`]: user address layout, page frames and page directories
//!
//! # Security Features
//! - Every user pointer is checked against the caller's page directory
//! - A running executable cannot be written to
//! - Exit status records are shared, so a late child never writes into
//!   freed memory
//!
//! The scheduler, file system, console, MMU and user-mode switch belong to
//! the rest of the kernel and are reached through the traits gathered in
//! [`kernel::Services`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod console;
pub mod fs;
pub mod kernel;
pub mod loader;
pub mod mm;
pub mod process;
pub mod syscall;
pub mod trap;

#[cfg(test)]
mod testing;

pub use kernel::{Kernel, Services, Tid};
pub use process::{ExecError, Process, WaitError, EXIT_FAILURE};
pub use syscall::{dispatch, SyscallFlow};
pub use trap::{IntrFrame, UserEntry};

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
