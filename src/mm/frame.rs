//! Page Frames
//!
//! Pages handed to user address spaces come from a [`PagePool`]. Each page
//! is wrapped in a [`Frame`], an owning handle that gives the page back to
//! its pool when dropped.
//!
//! # Security Properties
//! - Pages requested with [`AllocFlags::ZERO`] never expose stale data
//! - Error paths cannot leak a page: dropping the handle frees it
//! - Double free is impossible because [`Frame`] is not `Clone`

use alloc::sync::Arc;
use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;
use linked_list_allocator::Heap;
use spin::Mutex;

use super::address::PAGE_SIZE;

bitflags! {
    /// Allocation options for [`PagePool::alloc_page`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u8 {
        /// Take the page from the pool reserved for user processes.
        const USER = 1 << 0;
        /// Zero the page before returning it.
        const ZERO = 1 << 1;
    }
}

/// Source of physical pages.
///
/// Pages are identified by the kernel address through which the kernel
/// reads and writes them.
pub trait PagePool: Send + Sync {
    /// Obtain one page, or `None` if the pool is exhausted.
    fn alloc_page(&self, flags: AllocFlags) -> Option<NonNull<u8>>;

    /// Return a page to the pool.
    ///
    /// # Safety
    /// `page` must have come from `alloc_page` on this pool and must not be
    /// used afterwards.
    unsafe fn free_page(&self, page: NonNull<u8>);
}

/// An owned page obtained from a [`PagePool`].
pub struct Frame {
    page: NonNull<u8>,
    pool: Arc<dyn PagePool>,
}

// SAFETY: A Frame is the only handle to its page, so moving it between
// threads moves exclusive access with it.
unsafe impl Send for Frame {}

impl Frame {
    /// Allocate a page from `pool`.
    pub fn alloc(pool: &Arc<dyn PagePool>, flags: AllocFlags) -> Option<Self> {
        let page = pool.alloc_page(flags)?;
        Some(Self {
            page,
            pool: Arc::clone(pool),
        })
    }

    /// Kernel address of the page.
    #[inline]
    pub fn kernel_ptr(&self) -> NonNull<u8> {
        self.page
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: The page is PAGE_SIZE bytes and exclusively owned by self.
        unsafe { core::slice::from_raw_parts(self.page.as_ptr(), PAGE_SIZE) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: As above, and &mut self guarantees no other borrow.
        unsafe { core::slice::from_raw_parts_mut(self.page.as_ptr(), PAGE_SIZE) }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:p})", self.page.as_ptr())
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        // SAFETY: The page came from this pool and self is going away.
        unsafe { self.pool.free_page(self.page) }
    }
}

/// Heap wrapper so the pool can live behind a lock shared across threads.
struct PoolHeap(Heap);

// SAFETY: The heap only manages memory handed to HeapPagePool::new, and all
// access goes through the surrounding Mutex.
unsafe impl Send for PoolHeap {}

/// A page pool carved out of one contiguous memory region.
///
/// Uses `linked_list_allocator` with page-sized, page-aligned layouts, so
/// the region does not itself need to be page aligned.
pub struct HeapPagePool {
    heap: Mutex<PoolHeap>,
    free_pages: Mutex<usize>,
}

impl HeapPagePool {
    const PAGE_LAYOUT: Layout = match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
        Ok(layout) => layout,
        Err(_) => panic!("invalid page layout"),
    };

    /// Create a pool managing `size` bytes starting at `start`.
    ///
    /// # Safety
    /// The region must be valid for reads and writes, unused by anything
    /// else, and live for as long as the pool and every page it hands out.
    pub unsafe fn new(start: *mut u8, size: usize) -> Self {
        let mut heap = Heap::empty();
        // SAFETY: Forwarded from the caller.
        unsafe { heap.init(start, size) };

        // Alignment padding can eat part of the first page.
        let aligned = (start as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let usable = (start as usize + size).saturating_sub(aligned);

        Self {
            heap: Mutex::new(PoolHeap(heap)),
            free_pages: Mutex::new(usable / PAGE_SIZE),
        }
    }

    /// Number of pages that can still be handed out.
    pub fn free_pages(&self) -> usize {
        *self.free_pages.lock()
    }
}

impl PagePool for HeapPagePool {
    fn alloc_page(&self, flags: AllocFlags) -> Option<NonNull<u8>> {
        let page = self
            .heap
            .lock()
            .0
            .allocate_first_fit(Self::PAGE_LAYOUT)
            .ok()?;

        {
            let mut free = self.free_pages.lock();
            *free = free.saturating_sub(1);
        }

        if flags.contains(AllocFlags::ZERO) {
            // SAFETY: The allocation is PAGE_SIZE bytes and owned by us.
            unsafe { core::ptr::write_bytes(page.as_ptr(), 0, PAGE_SIZE) };
        }

        Some(page)
    }

    unsafe fn free_page(&self, page: NonNull<u8>) {
        // SAFETY: Forwarded from the caller: the page came from this heap
        // with PAGE_LAYOUT.
        unsafe { self.heap.lock().0.deallocate(page, Self::PAGE_LAYOUT) };
        *self.free_pages.lock() += 1;
    }
}
