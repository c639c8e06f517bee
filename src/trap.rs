//! User trap frames
//!
//! Register state the platform saves when a process traps into the kernel,
//! reduced to what the system call layer reads and writes. The platform
//! owns the actual switch into and out of user mode.

use alloc::sync::Arc;

use crate::kernel::Kernel;
use crate::process::Process;

/// Saved user register state at a system call trap.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntrFrame {
    /// User stack pointer; system call arguments start here.
    pub esp: u32,
    /// User instruction pointer to resume at.
    pub eip: u32,
    /// Return value register.
    pub eax: u32,
}

/// Where a freshly loaded process starts executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserEntry {
    /// Entry point from the executable header.
    pub eip: u32,
    /// Initial stack pointer, pointing at the fake return address.
    pub esp: u32,
}

impl UserEntry {
    /// The frame the process starts from.
    pub fn frame(&self) -> IntrFrame {
        IntrFrame {
            esp: self.esp,
            eip: self.eip,
            eax: 0,
        }
    }
}

/// Runs a loaded process in user mode.
///
/// The implementation switches to user mode at `entry` and delivers every
/// system call trap to [`syscall::dispatch`](crate::syscall::dispatch) with
/// the process and its frame. It returns once the process must terminate:
/// `dispatch` asked for it, or the process faulted. The caller then runs
/// process exit.
pub trait UserMode: Send + Sync {
    fn run(&self, kernel: &Arc<Kernel>, process: &mut Process, entry: UserEntry);
}
