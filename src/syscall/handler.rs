//! System Call Handler
//!
//! Dispatches system calls and implements individual syscall handlers.
//!
//! The call number sits at the trap frame's stack pointer and the
//! arguments in the words above it. The return value goes in `eax`.
//!
//! # Security Considerations
//! - The stack pointer and every argument word are validated before use
//! - Pointer arguments are validated in full before any side effect
//! - An invalid pointer or unknown call number kills the caller with -1
//! - The file system lock is held only around the file system call itself

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use log::{trace, warn};

use super::validate::{Fault, UserMemory};
use crate::fs::File;
use crate::kernel::{Kernel, Tid};
use crate::process::fd_table::{FdTable, STDIN_FILENO, STDOUT_FILENO};
use crate::process::{Process, EXIT_FAILURE};
use crate::trap::IntrFrame;

/// System call numbers
pub mod numbers {
    pub const SYS_HALT: u32 = 0;
    pub const SYS_EXIT: u32 = 1;
    pub const SYS_EXEC: u32 = 2;
    pub const SYS_WAIT: u32 = 3;
    pub const SYS_CREATE: u32 = 4;
    pub const SYS_REMOVE: u32 = 5;
    pub const SYS_OPEN: u32 = 6;
    pub const SYS_FILESIZE: u32 = 7;
    pub const SYS_READ: u32 = 8;
    pub const SYS_WRITE: u32 = 9;
    pub const SYS_SEEK: u32 = 10;
    pub const SYS_TELL: u32 = 11;
    pub const SYS_CLOSE: u32 = 12;
    pub const SYS_INCREMENT: u32 = 13;
}

use numbers::*;

/// `-1` as a return word.
const ERROR: u32 = EXIT_FAILURE as u32;

/// What the caller of [`dispatch`] does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallFlow {
    /// Resume the process; the result is in `eax`.
    Return,
    /// Terminate the process. Its exit code is already recorded.
    Exit,
    /// The machine was asked to power off. Terminate the process.
    Halt,
}

/// Dispatch the system call described by `frame`.
///
/// # Security
/// - A fault in any argument kills the caller with exit code -1
/// - Operational failures come back as -1 or false in `eax`
pub fn dispatch(kernel: &Arc<Kernel>, process: &mut Process, frame: &mut IntrFrame) -> SyscallFlow {
    match handle(kernel, process, frame) {
        Ok(flow) => flow,
        Err(fault) => {
            warn!("{}: killed: {}", process.name(), fault);
            process.set_exit_code(EXIT_FAILURE);
            SyscallFlow::Exit
        }
    }
}

fn handle(
    kernel: &Arc<Kernel>,
    process: &mut Process,
    frame: &mut IntrFrame,
) -> Result<SyscallFlow, Fault> {
    let mem = UserMemory::new(process.pagedir.as_deref());
    let esp = frame.esp;
    let arg = |n: u32| mem.read_u32(esp.wrapping_add(4 * n));

    let nr = arg(0)?;
    trace!("{}: {}", process.name(), name(nr).unwrap_or("unknown syscall"));

    let ret = match nr {
        SYS_HALT => {
            kernel.machine().power_off();
            return Ok(SyscallFlow::Halt);
        }
        SYS_EXIT => {
            let code = arg(1)? as i32;
            process.set_exit_code(code);
            return Ok(SyscallFlow::Exit);
        }
        SYS_EXEC => match mem.read_cstr(arg(1)?)? {
            Some(cmdline) => sys_exec(kernel, process, &cmdline),
            None => ERROR,
        },
        SYS_WAIT => {
            let tid = Tid::new(arg(1)?);
            process.wait(kernel, tid).unwrap_or(EXIT_FAILURE) as u32
        }
        SYS_CREATE => {
            let name = mem.read_cstr(arg(1)?)?;
            let size = arg(2)?;
            match name {
                Some(name) => kernel.with_filesys(|fs| fs.create(&name, size)) as u32,
                None => 0,
            }
        }
        SYS_REMOVE => match mem.read_cstr(arg(1)?)? {
            Some(name) => kernel.with_filesys(|fs| fs.remove(&name)) as u32,
            None => 0,
        },
        SYS_OPEN => match mem.read_cstr(arg(1)?)? {
            Some(name) => sys_open(kernel, &mut process.files, &name),
            None => ERROR,
        },
        SYS_FILESIZE => {
            let fd = arg(1)? as i32;
            match process.files.get_mut(fd) {
                Ok(file) => kernel.serialized(|| file.length()),
                Err(_) => ERROR,
            }
        }
        SYS_READ => {
            let (fd, buf, len) = (arg(1)? as i32, arg(2)?, arg(3)?);
            sys_read(kernel, &mem, &mut process.files, fd, buf, len)?
        }
        SYS_WRITE => {
            let (fd, buf, len) = (arg(1)? as i32, arg(2)?, arg(3)?);
            sys_write(kernel, &mem, &mut process.files, fd, buf, len)?
        }
        SYS_SEEK => {
            let (fd, pos) = (arg(1)? as i32, arg(2)?);
            if let Ok(file) = process.files.get_mut(fd) {
                kernel.serialized(|| file.seek(pos));
            }
            0
        }
        SYS_TELL => {
            let fd = arg(1)? as i32;
            match process.files.get_mut(fd) {
                Ok(file) => kernel.serialized(|| file.tell()),
                Err(_) => ERROR,
            }
        }
        SYS_CLOSE => {
            let fd = arg(1)? as i32;
            if let Ok(file) = process.files.remove(fd) {
                kernel.serialized(move || drop(file));
            }
            0
        }
        SYS_INCREMENT => arg(1)?.wrapping_add(1),
        _ => return Err(Fault::UnknownSyscall(nr)),
    };

    frame.eax = ret;
    Ok(SyscallFlow::Return)
}

fn sys_exec(kernel: &Arc<Kernel>, process: &mut Process, cmdline: &str) -> u32 {
    match process.execute(kernel, cmdline) {
        Ok(tid) => tid.as_u32(),
        Err(_) => ERROR,
    }
}

fn sys_open(kernel: &Kernel, files: &mut FdTable, name: &str) -> u32 {
    let Some(file) = kernel.with_filesys(|fs| fs.open(name)) else {
        return ERROR;
    };
    match files.insert(file) {
        Ok(fd) => fd as u32,
        Err((err, file)) => {
            trace!("open: {}: {}", name, err);
            kernel.serialized(move || drop(file));
            ERROR
        }
    }
}

/// Read into a user buffer.
///
/// The buffer is checked for write access before anything is consumed
/// from the console or the file.
fn sys_read(
    kernel: &Kernel,
    mem: &UserMemory<'_>,
    files: &mut FdTable,
    fd: i32,
    buf: u32,
    len: u32,
) -> Result<u32, Fault> {
    mem.check_buffer(buf, len, true)?;

    let data = if fd == STDIN_FILENO {
        read_console_line(kernel, len as usize)
    } else {
        let file: &mut dyn File = match files.get_mut(fd) {
            Ok(file) => file,
            Err(_) => return Ok(ERROR),
        };
        let mut data = vec![0u8; len as usize];
        let read = kernel.serialized(|| file.read(&mut data));
        data.truncate(read);
        data
    };

    mem.write_bytes(buf, &data)?;
    Ok(data.len() as u32)
}

/// Read up to `len` bytes of keyboard input, stopping after a newline.
/// Carriage returns are delivered as newlines.
fn read_console_line(kernel: &Kernel, len: usize) -> Vec<u8> {
    let mut line = Vec::with_capacity(len);
    while line.len() < len {
        let byte = match kernel.console().get_byte() {
            b'\r' => b'\n',
            byte => byte,
        };
        line.push(byte);
        if byte == b'\n' {
            break;
        }
    }
    line
}

/// Write from a user buffer.
///
/// The bytes are copied into the kernel before the console or the file
/// system sees them.
fn sys_write(
    kernel: &Kernel,
    mem: &UserMemory<'_>,
    files: &mut FdTable,
    fd: i32,
    buf: u32,
    len: u32,
) -> Result<u32, Fault> {
    let data = mem.read_bytes(buf, len)?;

    if fd == STDOUT_FILENO {
        kernel.console().put_bytes(&data);
        return Ok(len);
    }
    match files.get_mut(fd) {
        Ok(file) => Ok(kernel.serialized(|| file.write(&data)) as u32),
        Err(_) => Ok(ERROR),
    }
}

/// Name for a call number, for diagnostics.
pub fn name(nr: u32) -> Option<&'static str> {
    let name = match nr {
        SYS_HALT => "halt",
        SYS_EXIT => "exit",
        SYS_EXEC => "exec",
        SYS_WAIT => "wait",
        SYS_CREATE => "create",
        SYS_REMOVE => "remove",
        SYS_OPEN => "open",
        SYS_FILESIZE => "filesize",
        SYS_READ => "read",
        SYS_WRITE => "write",
        SYS_SEEK => "seek",
        SYS_TELL => "tell",
        SYS_CLOSE => "close",
        SYS_INCREMENT => "increment",
        _ => return None,
    };
    Some(name)
}
