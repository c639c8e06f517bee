//! System Call Interface
//!
//! Entry point for every system call a user process makes.
//!
//! # Security Model
//! - Whitelist approach: only the calls in [`numbers`] exist
//! - All pointer parameters are validated against the caller's page
//!   directory before use
//! - Invalid pointers kill the caller; they never reach the kernel as
//!   errors and never panic
//!
//! # Calls
//! - 0: halt() - power off the machine
//! - 1: exit(status) - terminate the current process
//! - 2: exec(cmdline) - start a child process, returns its tid or -1
//! - 3: wait(tid) - collect a child's exit code, or -1
//! - 4: create(name, size) / 5: remove(name) - returns success
//! - 6: open(name) - returns a descriptor or -1
//! - 7: filesize(fd), 8: read(fd, buf, len), 9: write(fd, buf, len)
//! - 10: seek(fd, pos), 11: tell(fd), 12: close(fd)
//! - 13: increment(n) - returns n + 1

mod handler;
pub mod validate;

pub use handler::{dispatch, name, numbers, SyscallFlow};
pub use validate::{Fault, UserMemory};
