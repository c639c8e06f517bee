//! In-memory collaborators for host tests.
//!
//! Stands up a whole [`Kernel`] on the host: OS threads play kernel
//! threads, Rust closures play user programs, and every page a process
//! touches comes from a real [`HeapPagePool`].

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use crate::console::Console;
use crate::fs::{File, FileSystem};
use crate::kernel::{Kernel, Machine, Scheduler, Services, ThreadEntry, Tid};
use crate::loader::elf::{
    SegmentFlags, ELF_IDENT, EHDR_SIZE, EM_386, ET_EXEC, EV_CURRENT, PHDR_SIZE, PT_LOAD,
};
use crate::mm::address::{VirtAddr, CODE_BASE, PAGE_SIZE};
use crate::mm::frame::HeapPagePool;
use crate::mm::pagedir::SoftMmu;
use crate::process::Process;
use crate::syscall::{dispatch, numbers::SYS_EXIT, SyscallFlow};
use crate::trap::{IntrFrame, UserEntry, UserMode};

/// A pool of `pages` page-aligned pages, leaked for the rest of the test
/// run.
pub fn page_pool(pages: usize) -> Arc<HeapPagePool> {
    let size = pages * PAGE_SIZE;
    let layout = match core::alloc::Layout::from_size_align(size, PAGE_SIZE) {
        Ok(layout) => layout,
        Err(e) => panic!("bad pool layout: {}", e),
    };
    // SAFETY: `layout` has a non-zero size.
    let start = unsafe { std::alloc::alloc(layout) };
    assert!(!start.is_null(), "host allocation failed");
    // SAFETY: The region is fresh, exclusively ours and never freed.
    Arc::new(unsafe { HeapPagePool::new(start, size) })
}

// ---------------------------------------------------------------------------
// File system
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inode {
    data: Vec<u8>,
    deny_write: usize,
    handles: usize,
}

/// A flat in-memory file system.
///
/// Removing a file unlinks its name; handles that are still open keep
/// working on the unlinked contents.
#[derive(Default)]
pub struct MemFs {
    files: Mutex<BTreeMap<String, Arc<Mutex<Inode>>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace `name` with `data`.
    pub fn put(&self, name: &str, data: &[u8]) {
        let inode = Inode {
            data: data.to_vec(),
            ..Inode::default()
        };
        self.files
            .lock()
            .insert(String::from(name), Arc::new(Mutex::new(inode)));
    }

    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.inode(name).map(|inode| inode.lock().data.clone())
    }

    pub fn is_write_denied(&self, name: &str) -> bool {
        self.inode(name)
            .map(|inode| inode.lock().deny_write > 0)
            .unwrap_or(false)
    }

    /// Number of open handles on `name`.
    pub fn open_handles(&self, name: &str) -> usize {
        self.inode(name).map(|inode| inode.lock().handles).unwrap_or(0)
    }

    fn inode(&self, name: &str) -> Option<Arc<Mutex<Inode>>> {
        self.files.lock().get(name).cloned()
    }
}

impl FileSystem for MemFs {
    fn open(&self, name: &str) -> Option<Box<dyn File>> {
        let inode = self.inode(name)?;
        inode.lock().handles += 1;
        Some(Box::new(MemFile {
            inode,
            pos: 0,
            denied: false,
        }))
    }

    fn create(&self, name: &str, initial_size: u32) -> bool {
        let mut files = self.files.lock();
        if name.is_empty() || files.contains_key(name) {
            return false;
        }
        let inode = Inode {
            data: vec![0; initial_size as usize],
            ..Inode::default()
        };
        files.insert(String::from(name), Arc::new(Mutex::new(inode)));
        true
    }

    fn remove(&self, name: &str) -> bool {
        self.files.lock().remove(name).is_some()
    }
}

struct MemFile {
    inode: Arc<Mutex<Inode>>,
    pos: u32,
    denied: bool,
}

impl File for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let inode = self.inode.lock();
        let start = (self.pos as usize).min(inode.data.len());
        let n = buf.len().min(inode.data.len() - start);
        buf[..n].copy_from_slice(&inode.data[start..start + n]);
        self.pos += n as u32;
        n
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        let mut inode = self.inode.lock();
        if inode.deny_write > 0 {
            return 0;
        }
        let start = self.pos as usize;
        let end = start + buf.len();
        if inode.data.len() < end {
            inode.data.resize(end, 0);
        }
        inode.data[start..end].copy_from_slice(buf);
        self.pos = end as u32;
        buf.len()
    }

    fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    fn tell(&self) -> u32 {
        self.pos
    }

    fn length(&self) -> u32 {
        self.inode.lock().data.len() as u32
    }

    fn deny_write(&mut self) {
        if !self.denied {
            self.denied = true;
            self.inode.lock().deny_write += 1;
        }
    }

    fn allow_write(&mut self) {
        if self.denied {
            self.denied = false;
            self.inode.lock().deny_write -= 1;
        }
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        self.allow_write();
        self.inode.lock().handles -= 1;
    }
}

// ---------------------------------------------------------------------------
// Console, machine, scheduler
// ---------------------------------------------------------------------------

/// Console that records output and replays scripted keyboard input.
#[derive(Default)]
pub struct TestConsole {
    output: Mutex<Vec<u8>>,
    input: Mutex<VecDeque<u8>>,
}

impl TestConsole {
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output.lock()).into_owned()
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.input.lock().extend(bytes.iter().copied());
    }

    pub fn pending_input(&self) -> usize {
        self.input.lock().len()
    }
}

impl Console for TestConsole {
    fn put_bytes(&self, bytes: &[u8]) {
        self.output.lock().extend_from_slice(bytes);
    }

    fn get_byte(&self) -> u8 {
        loop {
            if let Some(byte) = self.input.lock().pop_front() {
                return byte;
            }
            std::thread::yield_now();
        }
    }
}

#[derive(Default)]
pub struct TestMachine {
    off: AtomicBool,
}

impl TestMachine {
    pub fn powered_off(&self) -> bool {
        self.off.load(Ordering::Acquire)
    }
}

impl Machine for TestMachine {
    fn power_off(&self) {
        self.off.store(true, Ordering::Release);
    }
}

/// Runs every execution context on its own OS thread.
pub struct ThreadScheduler {
    next_tid: AtomicU32,
    failing: AtomicBool,
    yields: AtomicUsize,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        Self {
            next_tid: AtomicU32::new(2),
            failing: AtomicBool::new(false),
            yields: AtomicUsize::new(0),
        }
    }

    /// Make every later spawn fail.
    pub fn fail_spawns(&self, fail: bool) {
        self.failing.store(fail, Ordering::Release);
    }

    /// How many times a waiting context has yielded so far.
    pub fn yields(&self) -> usize {
        self.yields.load(Ordering::Acquire)
    }
}

impl Scheduler for ThreadScheduler {
    fn spawn(&self, name: &str, entry: ThreadEntry) -> Option<Tid> {
        if self.failing.load(Ordering::Acquire) {
            return None;
        }
        let tid = Tid::new(self.next_tid.fetch_add(1, Ordering::Relaxed));
        std::thread::Builder::new()
            .name(String::from(name))
            .spawn(move || entry(tid))
            .ok()?;
        Some(tid)
    }

    fn yield_now(&self) {
        self.yields.fetch_add(1, Ordering::AcqRel);
        std::thread::yield_now();
    }
}

// ---------------------------------------------------------------------------
// User mode
// ---------------------------------------------------------------------------

/// The process was terminated by the system call it just made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped;

type Program = Arc<dyn Fn(&mut UserContext<'_>) -> Result<i32, Stopped> + Send + Sync>;

/// Runs registered Rust closures as user programs, looked up by name.
///
/// A program that returns `Ok(code)` makes an exit system call with
/// `code`. A loaded process with no registered program exits at once.
#[derive(Default)]
pub struct ScriptedUserMode {
    programs: Mutex<BTreeMap<String, Program>>,
}

impl ScriptedUserMode {
    pub fn register(&self, name: &str, program: Program) {
        self.programs.lock().insert(String::from(name), program);
    }
}

impl UserMode for ScriptedUserMode {
    fn run(&self, kernel: &Arc<Kernel>, process: &mut Process, entry: UserEntry) {
        let program = self.programs.lock().get(process.name()).cloned();
        let Some(program) = program else {
            return;
        };
        let mut ctx = UserContext {
            kernel,
            process,
            frame: entry.frame(),
            entry,
            stopped: false,
        };
        if let Ok(code) = program(&mut ctx) {
            let _ = ctx.syscall(SYS_EXIT, &[code as u32]);
        }
    }
}

/// What a user program sees: its stack and the system call trap.
pub struct UserContext<'a> {
    kernel: &'a Arc<Kernel>,
    process: &'a mut Process,
    frame: IntrFrame,
    entry: UserEntry,
    stopped: bool,
}

impl UserContext<'_> {
    /// Push `bytes` onto the user stack and return their address.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> u32 {
        let len = (bytes.len() as u32 + 3) & !3;
        self.frame.esp -= len;
        self.poke(self.frame.esp, bytes);
        self.frame.esp
    }

    /// Push a NUL-terminated copy of `s`.
    pub fn push_str(&mut self, s: &str) -> u32 {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.push_bytes(&bytes)
    }

    pub fn set_esp(&mut self, esp: u32) {
        self.frame.esp = esp;
    }

    /// Push the call number and arguments and trap into the kernel.
    pub fn syscall(&mut self, nr: u32, args: &[u32]) -> Result<u32, Stopped> {
        let saved = self.frame.esp;
        for &arg in args.iter().rev() {
            self.push_bytes(&arg.to_le_bytes());
        }
        self.push_bytes(&nr.to_le_bytes());
        let result = self.syscall_raw();
        self.frame.esp = saved;
        result
    }

    /// Trap into the kernel with the stack as it is.
    pub fn syscall_raw(&mut self) -> Result<u32, Stopped> {
        if self.stopped {
            return Err(Stopped);
        }
        match dispatch(self.kernel, self.process, &mut self.frame) {
            SyscallFlow::Return => Ok(self.frame.eax),
            SyscallFlow::Exit | SyscallFlow::Halt => {
                self.stopped = true;
                Err(Stopped)
            }
        }
    }

    /// The program's arguments, decoded from the initial stack.
    pub fn args(&self) -> Vec<String> {
        let argc = self.peek_u32(self.entry.esp + 4);
        let argv = self.peek_u32(self.entry.esp + 8);
        (0..argc)
            .map(|i| {
                let mut at = self.peek_u32(argv + 4 * i);
                let mut bytes = Vec::new();
                loop {
                    let byte = self.peek(at, 1)[0];
                    if byte == 0 {
                        break;
                    }
                    bytes.push(byte);
                    at += 1;
                }
                String::from_utf8_lossy(&bytes).into_owned()
            })
            .collect()
    }

    /// Read user memory directly, as the program itself would.
    pub fn read_user(&self, addr: u32, len: usize) -> Vec<u8> {
        self.peek(addr, len)
    }

    fn peek_u32(&self, addr: u32) -> u32 {
        let bytes = self.peek(addr, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn peek(&self, addr: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let ptr = self.user_byte(addr + i as u32);
                // SAFETY: `user_byte` points into a mapped live frame.
                unsafe { *ptr }
            })
            .collect()
    }

    fn poke(&mut self, addr: u32, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            let ptr = self.user_byte(addr + i as u32);
            // SAFETY: As in `peek`; the process owns the frame.
            unsafe { *ptr = byte };
        }
    }

    fn user_byte(&self, addr: u32) -> *mut u8 {
        let addr = VirtAddr::new(addr);
        let mapping = self
            .process
            .pagedir()
            .and_then(|dir| dir.lookup(addr))
            .unwrap_or_else(|| panic!("user program touched unmapped {}", addr));
        // SAFETY: The offset is within the page.
        unsafe { mapping.kpage.as_ptr().add(addr.page_offset()) }
    }
}

// ---------------------------------------------------------------------------
// ELF images
// ---------------------------------------------------------------------------

enum ImageHeader {
    Segment {
        vaddr: u32,
        data: Vec<u8>,
        memsz: u32,
        writable: bool,
    },
    Raw(u32),
}

/// Builds ELF32 executables for the loader.
pub struct ElfImage {
    entry: u32,
    headers: Vec<ImageHeader>,
}

impl ElfImage {
    pub fn new(entry: u32) -> Self {
        Self {
            entry,
            headers: Vec::new(),
        }
    }

    /// A loadable segment at `vaddr` holding `data`, `memsz` bytes long
    /// in memory.
    pub fn segment(mut self, vaddr: u32, data: &[u8], memsz: u32, writable: bool) -> Self {
        self.headers.push(ImageHeader::Segment {
            vaddr,
            data: data.to_vec(),
            memsz,
            writable,
        });
        self
    }

    /// A program header of type `p_type` with every other field zero.
    pub fn raw_header(mut self, p_type: u32) -> Self {
        self.headers.push(ImageHeader::Raw(p_type));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let phoff = EHDR_SIZE;
        let mut image = vec![0u8; phoff + PHDR_SIZE * self.headers.len()];

        image[..ELF_IDENT.len()].copy_from_slice(&ELF_IDENT);
        put_u16(&mut image, 16, ET_EXEC);
        put_u16(&mut image, 18, EM_386);
        put_u32(&mut image, 20, EV_CURRENT);
        put_u32(&mut image, 24, self.entry);
        put_u32(&mut image, 28, phoff as u32);
        put_u16(&mut image, 40, EHDR_SIZE as u16);
        put_u16(&mut image, 42, PHDR_SIZE as u16);
        put_u16(&mut image, 44, self.headers.len() as u16);

        for (i, header) in self.headers.iter().enumerate() {
            let at = phoff + i * PHDR_SIZE;
            match header {
                ImageHeader::Raw(p_type) => put_u32(&mut image, at, *p_type),
                ImageHeader::Segment {
                    vaddr,
                    data,
                    memsz,
                    writable,
                } => {
                    // Place the data where its page offset matches vaddr's.
                    let page_offset = VirtAddr::new(*vaddr).page_offset();
                    let offset = image.len().next_multiple_of(PAGE_SIZE) + page_offset;
                    image.resize(offset, 0);
                    image.extend_from_slice(data);

                    let flags = if *writable {
                        SegmentFlags::R | SegmentFlags::W
                    } else {
                        SegmentFlags::R | SegmentFlags::X
                    };
                    put_u32(&mut image, at, PT_LOAD);
                    put_u32(&mut image, at + 4, offset as u32);
                    put_u32(&mut image, at + 8, *vaddr);
                    put_u32(&mut image, at + 12, *vaddr);
                    put_u32(&mut image, at + 16, data.len() as u32);
                    put_u32(&mut image, at + 20, *memsz);
                    put_u32(&mut image, at + 24, flags.bits());
                    put_u32(&mut image, at + 28, PAGE_SIZE as u32);
                }
            }
        }
        image
    }

    pub fn install(&self, fs: &MemFs, name: &str) {
        fs.put(name, &self.build());
    }
}

fn put_u16(image: &mut [u8], at: usize, value: u16) {
    image[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(image: &mut [u8], at: usize, value: u32) {
    image[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

// ---------------------------------------------------------------------------
// Whole kernel
// ---------------------------------------------------------------------------

/// A kernel wired to in-memory collaborators.
pub struct TestWorld {
    pub kernel: Arc<Kernel>,
    pub fs: Arc<MemFs>,
    pub pool: Arc<HeapPagePool>,
    pub console: Arc<TestConsole>,
    pub machine: Arc<TestMachine>,
    pub scheduler: Arc<ThreadScheduler>,
    pub user: Arc<ScriptedUserMode>,
}

impl TestWorld {
    pub fn new() -> Self {
        Self::with_pages(64)
    }

    pub fn with_pages(pages: usize) -> Self {
        let fs = Arc::new(MemFs::new());
        let pool = page_pool(pages);
        let console = Arc::new(TestConsole::default());
        let machine = Arc::new(TestMachine::default());
        let scheduler = Arc::new(ThreadScheduler::new());
        let user = Arc::new(ScriptedUserMode::default());

        let kernel = Kernel::new(Services {
            filesys: fs.clone(),
            pages: pool.clone(),
            mmu: Arc::new(SoftMmu),
            scheduler: scheduler.clone(),
            user_mode: user.clone(),
            console: console.clone(),
            machine: machine.clone(),
        });

        Self {
            kernel,
            fs,
            pool,
            console,
            machine,
            scheduler,
            user,
        }
    }

    /// Install a one-page executable called `name` whose behavior is
    /// `body`.
    pub fn program<F>(&self, name: &str, body: F)
    where
        F: Fn(&mut UserContext<'_>) -> Result<i32, Stopped> + Send + Sync + 'static,
    {
        self.user.register(name, Arc::new(body));
        ElfImage::new(CODE_BASE)
            .segment(CODE_BASE, &[0x90; 16], PAGE_SIZE as u32, false)
            .install(&self.fs, name);
    }
}
