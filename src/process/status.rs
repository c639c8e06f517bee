//! Cross-thread status records
//!
//! [`ChildStatus`] carries a child's exit code to its parent. Both hold an
//! `Arc` to it, so the record outlives whichever side lets go first: a
//! child exiting after its parent still posts into a live record.
//!
//! [`LoadHandshake`] carries the load result from a new process back to
//! the thread blocked in `execute`.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Once;

use crate::kernel::{Scheduler, Tid};

/// Exit status of one child, shared between the child and its parent.
#[derive(Debug)]
pub struct ChildStatus {
    tid: Once<Tid>,
    waited: AtomicBool,
    /// Set exactly once, when the child exits. Setting it is the exit
    /// signal, so the code is visible together with the signal.
    exit: Once<i32>,
}

impl ChildStatus {
    pub const fn new() -> Self {
        Self {
            tid: Once::new(),
            waited: AtomicBool::new(false),
            exit: Once::new(),
        }
    }

    /// The child's identity, once the scheduler has assigned one.
    pub fn tid(&self) -> Option<Tid> {
        self.tid.get().copied()
    }

    pub(crate) fn set_tid(&self, tid: Tid) {
        self.tid.call_once(|| tid);
    }

    /// True once a parent has started waiting on this child.
    pub fn is_waited(&self) -> bool {
        self.waited.load(Ordering::Acquire)
    }

    /// Claim the right to wait. Returns false if it was already claimed.
    pub(crate) fn mark_waited(&self) -> bool {
        !self.waited.swap(true, Ordering::AcqRel)
    }

    /// The exit code, or `None` while the child is still running.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.get().copied()
    }

    /// Record the exit code and raise the exit signal.
    ///
    /// Returns false, leaving the first code in place, if the signal had
    /// already been raised.
    pub(crate) fn post_exit(&self, code: i32) -> bool {
        let mut posted = false;
        self.exit.call_once(|| {
            posted = true;
            code
        });
        posted
    }

    /// Block until the child has exited and return its exit code,
    /// yielding to `scheduler` between checks.
    pub(crate) fn wait_exit(&self, scheduler: &dyn Scheduler) -> i32 {
        loop {
            if let Some(code) = self.exit.get() {
                return *code;
            }
            scheduler.yield_now();
        }
    }
}

impl Default for ChildStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot report of whether a new process loaded.
#[derive(Debug)]
pub struct LoadHandshake {
    loaded: Once<bool>,
}

impl LoadHandshake {
    pub const fn new() -> Self {
        Self {
            loaded: Once::new(),
        }
    }

    /// Report the load outcome. Only the first report counts.
    pub fn complete(&self, success: bool) {
        self.loaded.call_once(|| success);
    }

    /// Block until the outcome is reported and return it, yielding to
    /// `scheduler` between checks.
    pub fn wait(&self, scheduler: &dyn Scheduler) -> bool {
        loop {
            if let Some(loaded) = self.loaded.get() {
                return *loaded;
            }
            scheduler.yield_now();
        }
    }
}

impl Default for LoadHandshake {
    fn default() -> Self {
        Self::new()
    }
}
