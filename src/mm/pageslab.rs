//! Fixed-granularity page slab: a free-list stack of whole pages, used to
//! hand out level-2 page tables and kernel stacks without going through the
//! general-purpose kernel heap (§4.4).
//!
//! The free list is intrusive: each free page's first four bytes hold the
//! frame number of the next free page (`u32::MAX` terminates the list), so
//! no separate bookkeeping allocation is needed. `free` zeroes the page
//! before linking it in, which both satisfies the "push" and turns any
//! stale pointer still held by a caller into an access to all-zero memory
//! instead of silently-reused data.

use crate::error::{KernelError, KResult};
use crate::mm::phys::{frame_ptr, Frame};
use crate::mm::frame::FrameAlloc;
use crate::param::PAGE_SIZE;
use crate::sync::Spinlock;

const NIL: u32 = u32::MAX;

pub struct PageSlab {
    head: Spinlock<u32>,
}

impl PageSlab {
    pub const fn new() -> Self {
        Self {
            head: Spinlock::new("page_slab", NIL),
        }
    }

    /// Draws `capacity` frames from `allocator` and chains them into the
    /// slab's free list. Called once at boot with `&FRAMES`; tests pass a
    /// freshly constructed `FrameAlloc` so they don't share allocator state
    /// with other tests running concurrently.
    pub fn init(&self, allocator: &FrameAlloc, capacity: usize) -> KResult<()> {
        let mut head = self.head.acquire();
        for _ in 0..capacity {
            let f = allocator.alloc()?;
            self.write_next(f, *head);
            *head = f.0;
        }
        Ok(())
    }

    pub fn alloc(&self) -> KResult<Frame> {
        let mut head = self.head.acquire();
        if *head == NIL {
            return Err(KernelError::OutOfPageSlab);
        }
        let f = Frame(*head);
        *head = self.read_next(f);
        Ok(f)
    }

    pub fn free(&self, f: Frame) {
        self.zero(f);
        let mut head = self.head.acquire();
        self.write_next(f, *head);
        *head = f.0;
    }

    fn write_next(&self, f: Frame, next: u32) {
        // SAFETY: `f` is exclusively owned by the slab while on/entering
        // the free list, and the write stays within the page.
        unsafe {
            (frame_ptr(f) as *mut u32).write(next);
        }
    }

    fn read_next(&self, f: Frame) -> u32 {
        // SAFETY: `f` is a page currently on the free list.
        unsafe { (frame_ptr(f) as *const u32).read() }
    }

    fn zero(&self, f: Frame) {
        // SAFETY: `f` is exclusively owned by the caller returning it.
        unsafe {
            core::ptr::write_bytes(frame_ptr(f), 0, PAGE_SIZE);
        }
    }
}

impl Default for PageSlab {
    fn default() -> Self {
        Self::new()
    }
}

pub static PAGE_SLAB: PageSlab = PageSlab::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_pops_then_exhausts() {
        let fa = FrameAlloc::new();
        fa.init();
        let slab = PageSlab::new();
        slab.init(&fa, 4).unwrap();
        let mut got = std::collections::BTreeSet::new();
        for _ in 0..4 {
            let f = slab.alloc().unwrap();
            assert!(got.insert(f));
        }
        assert_eq!(slab.alloc(), Err(KernelError::OutOfPageSlab));
    }

    #[test]
    fn freed_page_is_zeroed_and_reusable() {
        let fa = FrameAlloc::new();
        fa.init();
        let slab = PageSlab::new();
        slab.init(&fa, 1).unwrap();
        let f = slab.alloc().unwrap();
        unsafe {
            frame_ptr(f).write(0xAB);
        }
        slab.free(f);
        let back = slab.alloc().unwrap();
        assert_eq!(back, f);
        unsafe {
            assert_eq!(frame_ptr(back).add(1).read(), 0);
        }
    }
}
