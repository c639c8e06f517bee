//! Initial User Stack
//!
//! Lays out `argc`/`argv` on the first stack page the way the process entry
//! point expects them under the i386 calling convention:
//!
//! ```text
//! top ->  | "echo\0" "hello\0" ... |  argument strings, last one highest
//!         | 0..3 bytes              |  word alignment
//!         | 0..15 bytes             |  alignment padding
//!         | NULL                    |  argv[argc]
//!         | argv[argc-1] .. argv[0] |
//!         | argv                    |  pointer to argv[0]'s slot
//!         | argc                    |  16-byte aligned
//! esp ->  | 0                       |  fake return address
//! ```
//!
//! The layout is a pure function of the argument list, so it works on the
//! page's bytes before the page is mapped anywhere.

use alloc::vec::Vec;
use core::fmt;

use crate::mm::address::PAGE_SIZE;

/// Maximum number of command-line tokens.
pub const MAX_ARGS: usize = 128;

/// Size of a user stack word.
const WORD: usize = 4;

/// Required alignment of the `argc` slot.
const STACK_ALIGN: u32 = 16;

/// Reasons argument setup fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgError {
    /// The command line has no program name.
    Empty,
    /// More than [`MAX_ARGS`] tokens.
    TooManyArgs,
    /// The arguments do not fit in one stack page.
    TooLong,
}

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty command line"),
            Self::TooManyArgs => write!(f, "more than {} arguments", MAX_ARGS),
            Self::TooLong => write!(f, "arguments too long"),
        }
    }
}

/// Split a command line into whitespace-separated tokens.
pub fn tokenize(cmdline: &str) -> Result<Vec<&str>, ArgError> {
    let args: Vec<&str> = cmdline.split_ascii_whitespace().collect();
    if args.is_empty() {
        return Err(ArgError::Empty);
    }
    if args.len() > MAX_ARGS {
        return Err(ArgError::TooManyArgs);
    }
    Ok(args)
}

/// The program name: the first token of the command line.
pub fn program_name(cmdline: &str) -> Option<&str> {
    cmdline.split_ascii_whitespace().next()
}

/// Bytes the argument block needs, before alignment padding.
pub fn footprint(args: &[&str]) -> usize {
    let strings: usize = args.iter().map(|a| a.len() + 1).sum();
    // argv[0..argc] + NULL sentinel, argv, argc, return address
    strings + WORD * (args.len() + 1) + WORD * 3
}

/// Downward-growing cursor over one stack page.
struct StackWriter<'a> {
    page: &'a mut [u8],
    /// User address of `page[0]`.
    base: u32,
    /// Offset of the current stack pointer within `page`.
    sp: usize,
}

impl StackWriter<'_> {
    fn esp(&self) -> u32 {
        self.base + self.sp as u32
    }

    fn reserve(&mut self, len: usize) -> Result<usize, ArgError> {
        self.sp = self.sp.checked_sub(len).ok_or(ArgError::TooLong)?;
        Ok(self.sp)
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> Result<u32, ArgError> {
        let at = self.reserve(bytes.len())?;
        self.page[at..at + bytes.len()].copy_from_slice(bytes);
        Ok(self.esp())
    }

    fn push_word(&mut self, word: u32) -> Result<(), ArgError> {
        self.push_bytes(&word.to_le_bytes()).map(|_| ())
    }

    fn pad(&mut self, len: usize) -> Result<(), ArgError> {
        let at = self.reserve(len)?;
        self.page[at..at + len].fill(0);
        Ok(())
    }
}

/// Lay out `args` at the top of `page` and return the new stack pointer.
///
/// `page` is the stack page whose end corresponds to user address `top`.
pub fn build_arg_stack(args: &[&str], page: &mut [u8], top: u32) -> Result<u32, ArgError> {
    debug_assert_eq!(page.len(), PAGE_SIZE);
    if args.is_empty() {
        return Err(ArgError::Empty);
    }
    if args.len() > MAX_ARGS {
        return Err(ArgError::TooManyArgs);
    }
    if footprint(args) > PAGE_SIZE {
        return Err(ArgError::TooLong);
    }

    let mut stack = StackWriter {
        base: top.wrapping_sub(PAGE_SIZE as u32),
        sp: page.len(),
        page,
    };

    let mut addrs = [0u32; MAX_ARGS];
    for (i, arg) in args.iter().enumerate().rev() {
        stack.reserve(1)?;
        let nul = stack.sp;
        stack.page[nul] = 0;
        addrs[i] = stack.push_bytes(arg.as_bytes())?;
    }

    let word_pad = stack.sp % WORD;
    stack.pad(word_pad)?;

    // NULL, argv[..], argv and argc end on a 16-byte boundary.
    let block = ((args.len() + 3) * WORD) as u32;
    let padding = stack.esp().wrapping_sub(block) % STACK_ALIGN;
    stack.pad(padding as usize)?;

    stack.push_word(0)?;
    for &addr in addrs[..args.len()].iter().rev() {
        stack.push_word(addr)?;
    }
    let argv = stack.esp();
    stack.push_word(argv)?;
    stack.push_word(args.len() as u32)?;
    stack.push_word(0)?;

    Ok(stack.esp())
}
