//! Access to physical RAM through the kernel's identity-mapped window.
//!
//! The kernel keeps `[0x0, KERNEL_WINDOW_END)` mapped 1:1 in every address
//! space (§3), so any physical frame can be touched by casting its address
//! straight to a pointer — no temporary mapping dance is needed, unlike a
//! kernel that only maps a fraction of RAM at a time.
//!
//! The host test build has no real physical memory to identity-map, so it
//! substitutes a static byte array playing the part of RAM. Every
//! `Frame`-indexed structure in `mm` (page tables, the page slab, inode
//! cache buffers staged through `BlockIo`) goes through this trait, so the
//! same algorithm runs against real hardware or the fake.

use crate::param::PAGE_SIZE;

/// A physical frame number (frame `n` covers bytes `[n * PAGE_SIZE, (n+1) * PAGE_SIZE)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(pub u32);

impl Frame {
    pub fn addr(self) -> u32 {
        self.0 * PAGE_SIZE as u32
    }
}

/// Total number of frames backing the simulated/real physical address space.
#[cfg(not(test))]
pub const TOTAL_FRAMES: usize = 32 * 1024; // 128 MiB at 4 KiB pages.
#[cfg(test)]
pub const TOTAL_FRAMES: usize = 4096; // 16 MiB: plenty for unit tests.

/// Frames below this index back the kernel identity map and are reserved at
/// boot; the frame allocator never hands them out.
pub const RESERVED_FRAMES: usize = 256; // first 1 MiB.

/// Returns a raw pointer to the start of the given physical frame.
///
/// # Safety
/// The caller must not alias this pointer with a conflicting `&mut` and must
/// keep all accesses within `PAGE_SIZE` bytes of the returned pointer.
#[cfg(not(test))]
pub unsafe fn frame_ptr(frame: Frame) -> *mut u8 {
    frame.addr() as usize as *mut u8
}

#[cfg(test)]
pub unsafe fn frame_ptr(frame: Frame) -> *mut u8 {
    fake::frame_ptr(frame)
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::cell::RefCell;

    // `cargo test` runs each test on its own OS thread by default; tests
    // build their own `FrameAlloc`/`PageSlab` instances rather than sharing
    // the kernel's global singletons (see `mm::frame::tests`), so giving
    // each thread its own fake RAM keeps those independently-numbered
    // frames from aliasing the same backing bytes across tests.
    thread_local! {
        static RAM: RefCell<Box<[u8; TOTAL_FRAMES * PAGE_SIZE]>> =
            RefCell::new(Box::new([0u8; TOTAL_FRAMES * PAGE_SIZE]));
    }

    pub unsafe fn frame_ptr(frame: Frame) -> *mut u8 {
        assert!((frame.0 as usize) < TOTAL_FRAMES, "frame out of fake RAM range");
        RAM.with(|ram| {
            let base = ram.borrow_mut().as_mut_ptr();
            unsafe { base.add(frame.0 as usize * PAGE_SIZE) }
        })
    }
}
