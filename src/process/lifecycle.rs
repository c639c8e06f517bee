//! Process creation, waiting and exit.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use log::{debug, error, warn};

use super::status::{ChildStatus, LoadHandshake};
use super::Process;
use crate::kernel::{Kernel, Tid};
use crate::kprintln;
use crate::loader::{self, stack};

/// Reasons `execute` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// The command line names no program.
    BadCommandLine,
    /// No execution context could be created.
    SpawnFailed,
    /// The child started but its program could not be loaded.
    LoadFailed,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadCommandLine => write!(f, "empty command line"),
            Self::SpawnFailed => write!(f, "could not create thread"),
            Self::LoadFailed => write!(f, "could not load program"),
        }
    }
}

/// Reasons `wait` fails. Neither blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// No live child with that identity.
    NotChild,
    /// The child has already been waited for.
    AlreadyWaited,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotChild => write!(f, "not a child of this process"),
            Self::AlreadyWaited => write!(f, "child already waited for"),
        }
    }
}

impl Process {
    /// Start the program named by `cmdline` as a child of this process.
    ///
    /// Blocks until the child has either loaded its program or given up.
    /// The child's record is in place before the child can run, so the
    /// child can always post its exit status.
    pub fn execute(&mut self, kernel: &Arc<Kernel>, cmdline: &str) -> Result<Tid, ExecError> {
        let name = stack::program_name(cmdline).ok_or(ExecError::BadCommandLine)?;

        let status = Arc::new(ChildStatus::new());
        self.children.push(Arc::clone(&status));
        let handshake = Arc::new(LoadHandshake::new());

        let entry = {
            let kernel = Arc::clone(kernel);
            let cmdline = String::from(cmdline);
            let status = Arc::clone(&status);
            let handshake = Arc::clone(&handshake);
            Box::new(move |tid| start_process(kernel, tid, cmdline, status, handshake))
        };

        let Some(tid) = kernel.scheduler().spawn(name, entry) else {
            self.children.retain(|child| !Arc::ptr_eq(child, &status));
            warn!("exec: {}: could not create thread", name);
            return Err(ExecError::SpawnFailed);
        };
        status.set_tid(tid);

        if handshake.wait(kernel.scheduler()) {
            debug!("exec: {} started as {}", name, tid);
            Ok(tid)
        } else {
            // The child has already exited and has no tid worth waiting on.
            self.children.retain(|child| !Arc::ptr_eq(child, &status));
            Err(ExecError::LoadFailed)
        }
    }

    /// Wait for the child `child` to exit and return its exit code.
    ///
    /// Fails at once if `child` is not a child of this process or has
    /// already been waited for. A child's record is dropped after its
    /// code is collected. While the child runs, the caller yields to the
    /// kernel's scheduler.
    pub fn wait(&mut self, kernel: &Kernel, child: Tid) -> Result<i32, WaitError> {
        let index = self
            .children
            .iter()
            .position(|status| status.tid() == Some(child))
            .ok_or(WaitError::NotChild)?;

        let status = &self.children[index];
        if !status.mark_waited() {
            return Err(WaitError::AlreadyWaited);
        }
        let code = status.wait_exit(kernel.scheduler());
        self.children.remove(index);
        Ok(code)
    }

    /// Tear the process down and report its exit code to the parent.
    ///
    /// Prints the exit line, closes every file, releases the executable,
    /// forgets the children and destroys the address space. The parent is
    /// released last, once nothing of the process remains in use.
    pub fn exit(mut self, kernel: &Kernel) {
        if self.status.is_some() {
            kprintln!(kernel.console(), "{}: exit({})", self.name, self.exit_code);
        }

        let files: Vec<_> = self.files.drain().collect();
        if !files.is_empty() {
            kernel.serialized(move || drop(files));
        }
        if let Some(mut file) = self.executable.take() {
            kernel.serialized(move || {
                file.allow_write();
                drop(file);
            });
        }

        // Children that are still running keep their records alive.
        self.children.clear();

        if let Some(dir) = self.pagedir.take() {
            kernel.mmu().activate(None);
            drop(dir);
        }

        if let Some(status) = self.status.take() {
            if !status.post_exit(self.exit_code) {
                error!("exit: {}: exit status already posted", self.name);
            }
        }
    }
}

/// Body of a freshly spawned process.
fn start_process(
    kernel: Arc<Kernel>,
    tid: Tid,
    cmdline: String,
    status: Arc<ChildStatus>,
    handshake: Arc<LoadHandshake>,
) {
    status.set_tid(tid);
    let name = stack::program_name(&cmdline).unwrap_or(&cmdline);
    let mut process = Process::child(tid, name, status);

    match loader::load(&kernel, &mut process, &cmdline) {
        Ok(entry) => {
            handshake.complete(true);
            drop(handshake);
            kernel.user_mode().run(&kernel, &mut process, entry);
            process.exit(&kernel);
        }
        Err(_) => {
            process.exit(&kernel);
            handshake.complete(false);
        }
    }
}
