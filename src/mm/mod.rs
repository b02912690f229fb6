//! Virtual memory management: physical frames, page tables, the page slab,
//! and the kernel heap (§4).

pub mod bitmap;
pub mod frame;
pub mod kheap;
pub mod pageslab;
pub mod pagetable;
pub mod phys;

use crate::error::KResult;
use crate::param::USER_MAX;

pub use frame::{FrameAlloc, FRAMES};
pub use kheap::{KHeap, KHEAP};
pub use pageslab::{PageSlab, PAGE_SLAB};
pub use pagetable::PageDirectory;
pub use phys::{frame_ptr, Frame};

/// The canonical kernel identity-map directory, built once at boot by
/// mapping `[0, KERNEL_WINDOW_END)` 1:1 with `PageDirectory::new_boot`.
/// Every later `PageDirectory` shares its leaf tables for that range rather
/// than rebuilding them (§3). Host tests never populate this: the fake
/// `frame_ptr` indexes a thread-local buffer directly and has no notion of
/// an active CR3, so the sharing step is skipped under `cfg(test)`.
pub static KERNEL_DIR: spin::Once<PageDirectory> = spin::Once::new();

/// One process's virtual address space: its page directory plus the
/// current extent of its heap/stack region, enough to validate and grow
/// `sbrk`-style requests (§4.11, §6).
pub struct AddressSpace {
    dir: PageDirectory,
    /// One past the highest mapped byte of the user image + heap.
    brk: u32,
}

impl AddressSpace {
    pub fn new(slab: &PageSlab, image_end: u32) -> KResult<Self> {
        let dir = PageDirectory::new(slab)?;
        #[cfg(not(test))]
        if let Some(kernel_dir) = KERNEL_DIR.get() {
            dir.share_kernel_window(kernel_dir);
        }
        Ok(Self { dir, brk: image_end })
    }

    /// Wraps an already-built page directory (e.g. `exec`'s freshly loaded
    /// image) with its break, bypassing `new`'s own directory allocation.
    pub fn from_parts(dir: PageDirectory, brk: u32) -> Self {
        Self { dir, brk }
    }

    pub fn directory(&self) -> &PageDirectory {
        &self.dir
    }

    pub fn brk(&self) -> u32 {
        self.brk
    }

    /// Grows (or shrinks, if `delta` is negative) the break by `delta`
    /// bytes, mapping or unmapping whole pages as the break crosses page
    /// boundaries. Refuses to grow past `STACK_FLOOR` or shrink below the
    /// fixed user image.
    pub fn grow_brk(
        &mut self,
        slab: &PageSlab,
        frames: &FrameAlloc,
        delta: i32,
        image_end: u32,
        floor: u32,
    ) -> KResult<u32> {
        let old = self.brk;
        let new = (old as i64 + delta as i64) as i64;
        if new < image_end as i64 || new > floor as i64 || new > USER_MAX as i64 {
            return Err(crate::error::KernelError::InvalidArgument);
        }
        let new = new as u32;
        let old_page = page_align_up(old);
        let new_page = page_align_up(new);
        if new_page > old_page {
            let mut vaddr = old_page;
            while vaddr < new_page {
                if let Err(e) = self.dir.map_user(slab, frames, vaddr, true) {
                    self.dir.unmap_range(slab, frames, old_page, vaddr);
                    return Err(e);
                }
                vaddr += crate::param::PAGE_SIZE as u32;
            }
        } else if new_page < old_page {
            self.dir.unmap_range(slab, frames, new_page, old_page);
        }
        self.brk = new;
        Ok(old)
    }

    pub fn destroy(self, slab: &PageSlab, frames: &FrameAlloc, image_base: u32) {
        // The stack lives in [stack_low, USER_MAX), entirely above the heap
        // region this address space's `brk` tracks, so the full user half
        // must be unmapped here, not just up to the heap's growth ceiling.
        self.dir.unmap_range(slab, frames, image_base, USER_MAX);
        self.dir.destroy(slab);
    }
}

/// Maps every page in `[new_low, old_low)`, growing a process's stack
/// downward one or more pages for `PageFault`-driven stack growth (§4.1a,
/// §7). Both bounds must already be page-aligned. Rolls back everything
/// this call mapped if allocation fails partway through, mirroring
/// `AddressSpace::grow_brk`'s own rollback on its growth path.
pub fn grow_stack_down(dir: &PageDirectory, slab: &PageSlab, frames: &FrameAlloc, new_low: u32, old_low: u32) -> KResult<()> {
    let mut vaddr = new_low;
    while vaddr < old_low {
        if let Err(e) = dir.map_user(slab, frames, vaddr, true) {
            dir.unmap_range(slab, frames, new_low, vaddr);
            return Err(e);
        }
        vaddr += crate::param::PAGE_SIZE as u32;
    }
    Ok(())
}

fn page_align_up(addr: u32) -> u32 {
    let mask = crate::param::PAGE_SIZE as u32 - 1;
    (addr + mask) & !mask
}

/// Copies `dst.len()` bytes from user address `vaddr` in `dir` into `dst`,
/// one page at a time. Fails on the first unmapped page it meets, rather
/// than performing a partial copy the caller would have to unwind (§4.11
/// "user pointer validation").
pub fn copy_in(dir: &PageDirectory, slab: &PageSlab, vaddr: u32, dst: &mut [u8]) -> KResult<()> {
    copy_user(dir, slab, vaddr, dst, false)
}

/// Copies `src` into user address `vaddr` in `dir`, one page at a time.
pub fn copy_out(dir: &PageDirectory, slab: &PageSlab, vaddr: u32, src: &[u8]) -> KResult<()> {
    let src_mut = src.as_ptr() as *mut u8;
    // SAFETY: `copy_user` only reads through this pointer in the `true`
    // direction branch below; the cast exists to share one page-walking
    // loop between the in and out directions.
    let slice = unsafe { core::slice::from_raw_parts_mut(src_mut, src.len()) };
    copy_user(dir, slab, vaddr, slice, true)
}

fn copy_user(dir: &PageDirectory, slab: &PageSlab, vaddr: u32, buf: &mut [u8], out: bool) -> KResult<()> {
    use crate::error::KernelError;
    use crate::param::PAGE_SIZE;

    let mut done = 0;
    while done < buf.len() {
        let cur = vaddr.wrapping_add(done as u32);
        let frame = dir.translate(slab, cur).ok_or(KernelError::InvalidUserPointer)?;
        let page_off = cur as usize % PAGE_SIZE;
        let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
        // SAFETY: `frame` is a present user mapping just validated above;
        // the kernel's identity map makes its contents addressable here.
        unsafe {
            let kptr = frame_ptr(frame).add(page_off);
            if out {
                core::ptr::copy_nonoverlapping(buf.as_ptr().add(done), kptr, chunk);
            } else {
                core::ptr::copy_nonoverlapping(kptr, buf.as_mut_ptr().add(done), chunk);
            }
        }
        done += chunk;
    }
    Ok(())
}

/// Typed sibling of `copy_in`/`copy_out` for fixed-size values (a `u32`
/// argv pointer, say) instead of a byte slice, mirroring the teacher's own
/// generic `UserPageTable::copy_in<T: AsBytes + FromBytes>`/`copy_out`.
pub fn copy_in_val<T: zerocopy::FromBytes>(dir: &PageDirectory, slab: &PageSlab, vaddr: u32) -> KResult<T> {
    let mut val = core::mem::MaybeUninit::<T>::zeroed();
    // SAFETY: `T: FromBytes` guarantees every all-zero bit pattern (written
    // by `zeroed` above) is already a valid `T`, so reading it back out is
    // sound even before `copy_in` overwrites it.
    let buf = unsafe {
        core::slice::from_raw_parts_mut(val.as_mut_ptr() as *mut u8, core::mem::size_of::<T>())
    };
    copy_in(dir, slab, vaddr, buf)?;
    Ok(unsafe { val.assume_init() })
}

pub fn copy_out_val<T: zerocopy::AsBytes>(dir: &PageDirectory, slab: &PageSlab, vaddr: u32, val: &T) -> KResult<()> {
    copy_out(dir, slab, vaddr, val.as_bytes())
}

/// Copies a NUL-terminated string from user address `vaddr` into `buf`,
/// stopping at the first NUL or when `buf` fills up without finding one
/// (`InvalidArgument`, mirroring the teacher's `fetchstr` overflow case).
pub fn copy_in_str<'a>(dir: &PageDirectory, slab: &PageSlab, vaddr: u32, buf: &'a mut [u8]) -> KResult<&'a [u8]> {
    use crate::error::KernelError;

    for (i, byte) in buf.iter_mut().enumerate() {
        copy_in(dir, slab, vaddr.wrapping_add(i as u32), core::slice::from_mut(byte))?;
        if *byte == 0 {
            return Ok(&buf[..i]);
        }
    }
    Err(KernelError::InvalidArgument)
}
