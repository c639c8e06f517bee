//! Kernel services consumed by the user-process subsystem
//!
//! The scheduler, MMU, page pool, file system, console and machine control
//! are provided by the rest of the kernel. They are bundled in [`Kernel`],
//! which is shared by every process as an `Arc<Kernel>`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;

use spin::Mutex;

use crate::console::Console;
use crate::fs::FileSystem;
use crate::mm::{Mmu, PagePool};
use crate::trap::UserMode;

/// Identity of an execution context.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Tid(u32);

impl Tid {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({})", self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry function of a new execution context. Receives its own identity.
pub type ThreadEntry = Box<dyn FnOnce(Tid) + Send + 'static>;

/// Creates execution contexts.
pub trait Scheduler: Send + Sync {
    /// Create a schedulable context named `name` that runs `entry`.
    ///
    /// Returns `None` when no context could be created. The new context
    /// may run, and even finish, before this returns.
    fn spawn(&self, name: &str, entry: ThreadEntry) -> Option<Tid>;

    /// Let other contexts run. Called in a loop by a context that is
    /// waiting for another one to post a result.
    fn yield_now(&self);
}

/// Whole-machine control.
pub trait Machine: Send + Sync {
    fn power_off(&self);
}

/// The collaborators a [`Kernel`] is built from.
pub struct Services {
    pub filesys: Arc<dyn FileSystem>,
    pub pages: Arc<dyn PagePool>,
    pub mmu: Arc<dyn Mmu>,
    pub scheduler: Arc<dyn Scheduler>,
    pub user_mode: Arc<dyn UserMode>,
    pub console: Arc<dyn Console>,
    pub machine: Arc<dyn Machine>,
}

/// Shared kernel state for the user-process subsystem.
pub struct Kernel {
    services: Services,
    /// Serializes every file system call across all processes.
    filesys_lock: Mutex<()>,
}

impl Kernel {
    pub fn new(services: Services) -> Arc<Self> {
        Arc::new(Self {
            services,
            filesys_lock: Mutex::new(()),
        })
    }

    /// Run `op` on the file system while holding the file system lock.
    ///
    /// Keep `op` to the file system call itself: no user memory access and
    /// nothing that blocks.
    pub fn with_filesys<R>(&self, op: impl FnOnce(&dyn FileSystem) -> R) -> R {
        let _guard = self.filesys_lock.lock();
        op(&*self.services.filesys)
    }

    /// Run `op` while holding the file system lock, for operations on an
    /// already open file handle.
    pub fn serialized<R>(&self, op: impl FnOnce() -> R) -> R {
        let _guard = self.filesys_lock.lock();
        op()
    }

    pub fn pages(&self) -> &Arc<dyn PagePool> {
        &self.services.pages
    }

    pub fn mmu(&self) -> &dyn Mmu {
        &*self.services.mmu
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        &*self.services.scheduler
    }

    pub fn user_mode(&self) -> &dyn UserMode {
        &*self.services.user_mode
    }

    pub fn console(&self) -> &dyn Console {
        &*self.services.console
    }

    pub fn machine(&self) -> &dyn Machine {
        &*self.services.machine
    }
}
