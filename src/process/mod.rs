//! User Processes
//!
//! A [`Process`] is the user-level state of one execution context: its
//! address space, open files, running executable and children.
//!
//! # Lifecycle
//! - The parent calls [`Process::execute`], which spawns a context that
//!   loads the program and runs it in user mode
//! - The parent collects the exit code with [`Process::wait`]
//! - Every process ends in [`Process::exit`], which consumes it
//!
//! A parent and each of its children share an [`Arc<ChildStatus>`], so a
//! child that outlives its parent still posts into a live record.

pub mod fd_table;
pub mod lifecycle;
pub mod status;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::fs::File;
use crate::kernel::Tid;
use crate::mm::pagedir::PageDirectory;

pub use fd_table::{FdError, FdTable, MAX_FILES};
pub use lifecycle::{ExecError, WaitError};
pub use status::{ChildStatus, LoadHandshake};

/// Exit code of a process that was killed or never reported one.
pub const EXIT_FAILURE: i32 = -1;

/// User-level state of one execution context.
pub struct Process {
    tid: Tid,
    name: String,
    /// Owned address space, destroyed at exit.
    pub(crate) pagedir: Option<Box<dyn PageDirectory>>,
    pub(crate) files: FdTable,
    /// The running executable, held open and write-denied.
    pub(crate) executable: Option<Box<dyn File>>,
    /// One record per spawned child not yet waited for.
    pub(crate) children: Vec<Arc<ChildStatus>>,
    /// This process's own record in its parent. `None` for the root.
    pub(crate) status: Option<Arc<ChildStatus>>,
    exit_code: i32,
}

impl Process {
    /// The initial process, which has no parent.
    pub fn root(tid: Tid, name: &str) -> Self {
        Self::new(tid, name, None)
    }

    pub(crate) fn child(tid: Tid, name: &str, status: Arc<ChildStatus>) -> Self {
        Self::new(tid, name, Some(status))
    }

    fn new(tid: Tid, name: &str, status: Option<Arc<ChildStatus>>) -> Self {
        Self {
            tid,
            name: String::from(name),
            pagedir: None,
            files: FdTable::new(),
            executable: None,
            children: Vec::new(),
            status,
            exit_code: EXIT_FAILURE,
        }
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Program name, as printed in the exit line.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Record the code reported to the parent at exit.
    #[inline]
    pub fn set_exit_code(&mut self, code: i32) {
        self.exit_code = code;
    }

    /// The process's address space, once the loader has created it.
    pub fn pagedir(&self) -> Option<&dyn PageDirectory> {
        self.pagedir.as_deref()
    }

    /// Number of children whose records this process still holds.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Number of open file descriptors.
    pub fn open_files(&self) -> usize {
        self.files.open_count()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("files", &self.files.open_count())
            .field("children", &self.children.len())
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

impl Drop for Process {
    /// A process dropped without running exit still releases its parent.
    fn drop(&mut self) {
        if let Some(status) = self.status.take() {
            status.post_exit(self.exit_code);
        }
    }
}
