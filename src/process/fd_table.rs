//! File Descriptor Table
//!
//! Per-process table from small integers to open files.
//!
//! # Design
//! - Fixed number of slots, indexed by descriptor number
//! - Slots 0 and 1 are the console and never hold a file
//! - New descriptors come from a counter that only moves forward, so a
//!   descriptor number is never reused within one process
//! - Empty is an explicit slot state; lookups return a typed error

use alloc::boxed::Box;
use core::fmt;

use crate::fs::File;

/// Number of descriptor slots per process.
pub const MAX_FILES: usize = 128;

/// Standard input descriptor (console keyboard).
pub const STDIN_FILENO: i32 = 0;
/// Standard output descriptor (console display).
pub const STDOUT_FILENO: i32 = 1;
/// First descriptor handed out for files.
pub const FIRST_FILE_FD: i32 = 2;

/// Error type for descriptor table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdError {
    /// The descriptor is negative or beyond the table.
    InvalidDescriptor,
    /// The descriptor names the console, not a file.
    Console,
    /// The slot holds no file.
    SlotEmpty,
    /// Every descriptor number has been handed out.
    TableFull,
}

impl fmt::Display for FdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDescriptor => write!(f, "invalid descriptor"),
            Self::Console => write!(f, "descriptor refers to the console"),
            Self::SlotEmpty => write!(f, "descriptor not open"),
            Self::TableFull => write!(f, "descriptor table full"),
        }
    }
}

/// State of one descriptor slot.
pub enum Slot {
    Stdin,
    Stdout,
    Empty,
    Open(Box<dyn File>),
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Stdin => write!(f, "Stdin"),
            Slot::Stdout => write!(f, "Stdout"),
            Slot::Empty => write!(f, "Empty"),
            Slot::Open(_) => write!(f, "Open"),
        }
    }
}

/// A process's open files.
#[derive(Debug)]
pub struct FdTable {
    slots: [Slot; MAX_FILES],
    next_fd: usize,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|i| match i as i32 {
                STDIN_FILENO => Slot::Stdin,
                STDOUT_FILENO => Slot::Stdout,
                _ => Slot::Empty,
            }),
            next_fd: FIRST_FILE_FD as usize,
        }
    }

    fn index(fd: i32) -> Result<usize, FdError> {
        usize::try_from(fd)
            .ok()
            .filter(|&i| i < MAX_FILES)
            .ok_or(FdError::InvalidDescriptor)
    }

    /// Give `file` the next descriptor number.
    ///
    /// When the table is full the file comes back with the error so the
    /// caller can close it.
    pub fn insert(&mut self, file: Box<dyn File>) -> Result<i32, (FdError, Box<dyn File>)> {
        if self.next_fd >= MAX_FILES {
            return Err((FdError::TableFull, file));
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        self.slots[fd] = Slot::Open(file);
        Ok(fd as i32)
    }

    /// Look up the open file behind `fd`.
    pub fn get_mut(&mut self, fd: i32) -> Result<&mut dyn File, FdError> {
        match &mut self.slots[Self::index(fd)?] {
            Slot::Open(file) => Ok(&mut **file),
            Slot::Stdin | Slot::Stdout => Err(FdError::Console),
            Slot::Empty => Err(FdError::SlotEmpty),
        }
    }

    /// Take the file out of `fd`, leaving the slot empty.
    pub fn remove(&mut self, fd: i32) -> Result<Box<dyn File>, FdError> {
        let index = Self::index(fd)?;
        match &self.slots[index] {
            Slot::Open(_) => {}
            Slot::Stdin | Slot::Stdout => return Err(FdError::Console),
            Slot::Empty => return Err(FdError::SlotEmpty),
        }
        match core::mem::replace(&mut self.slots[index], Slot::Empty) {
            Slot::Open(file) => Ok(file),
            _ => Err(FdError::SlotEmpty),
        }
    }

    /// Take every open file out of the table.
    pub fn drain(&mut self) -> impl Iterator<Item = Box<dyn File>> + '_ {
        self.slots.iter_mut().filter_map(|slot| match slot {
            Slot::Open(_) => match core::mem::replace(slot, Slot::Empty) {
                Slot::Open(file) => Some(file),
                _ => None,
            },
            _ => None,
        })
    }

    /// Number of open files.
    pub fn open_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Open(_)))
            .count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
