//! Two-level page tables: 1024 directory entries, each pointing at a
//! 1024-entry leaf table, 4 KiB pages (§3, §4.3).
//!
//! Level-2 (leaf) tables are allocated from the page slab on demand by
//! `walk`. Before the slab exists, `PageDirectory::new_boot` draws leaf
//! tables from the frame allocator directly instead — the "boot path
//! variant" of §4.3 — so the same `walk` logic serves both.

use bitflags::bitflags;

use crate::error::{KernelError, KResult};
use crate::mm::frame::FrameAlloc;
use crate::mm::pageslab::PageSlab;
use crate::mm::phys::{frame_ptr, Frame};
use crate::param::{PAGE_SIZE, PTE_PER_TABLE};

bitflags! {
    pub struct PteFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct Pte(u32);

impl Pte {
    const NULL: Pte = Pte(0);

    fn new(frame: Frame, flags: PteFlags) -> Self {
        Pte((frame.0 << 12) | flags.bits())
    }

    fn frame(self) -> Frame {
        Frame(self.0 >> 12)
    }

    fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0xFFF)
    }

    fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }
}

fn vpn1(vaddr: u32) -> usize {
    (vaddr >> 22) as usize & (PTE_PER_TABLE - 1)
}

fn vpn0(vaddr: u32) -> usize {
    (vaddr >> 12) as usize & (PTE_PER_TABLE - 1)
}

/// Reads/writes a page-table-sized page of `Pte`s in place, through the
/// physical identity map.
struct Table(Frame);

impl Table {
    fn entry(&self, idx: usize) -> Pte {
        assert!(idx < PTE_PER_TABLE);
        // SAFETY: every page-table frame is exactly one page, `idx` is in range.
        unsafe { (frame_ptr(self.0) as *const Pte).add(idx).read() }
    }

    fn set_entry(&self, idx: usize, pte: Pte) {
        assert!(idx < PTE_PER_TABLE);
        // SAFETY: as above.
        unsafe {
            (frame_ptr(self.0) as *mut Pte).add(idx).write(pte);
        }
    }

    fn zero(&self) {
        // SAFETY: the frame is exactly one page.
        unsafe {
            core::ptr::write_bytes(frame_ptr(self.0), 0, PAGE_SIZE);
        }
    }
}

/// A process's page directory: the root of its address translation.
pub struct PageDirectory {
    dir: Frame,
}

impl PageDirectory {
    /// Allocates a fresh, all-absent directory from the page slab.
    pub fn new(slab: &PageSlab) -> KResult<Self> {
        let dir = slab.alloc()?;
        let table = Table(dir);
        table.zero();
        Ok(Self { dir })
    }

    /// Boot-path variant: allocate the directory (and, transitively, any
    /// leaf tables `walk` creates) straight from the frame allocator,
    /// before the page slab has been initialized.
    pub fn new_boot(frames: &FrameAlloc) -> KResult<Self> {
        let dir = frames.alloc()?;
        let table = Table(dir);
        table.zero();
        Ok(Self { dir })
    }

    pub fn frame(&self) -> Frame {
        self.dir
    }

    /// Copies the kernel's identity-map PDEs for `[0, KERNEL_WINDOW_END)`
    /// into `self`, sharing the same leaf tables rather than duplicating
    /// them. Every fresh address space needs this before it is ever loaded
    /// into CR3: the kernel's own code, and `frame_ptr`'s direct
    /// physical-address casts, both execute through whichever directory is
    /// currently active (§3 "identity map").
    pub fn share_kernel_window(&self, kernel_dir: &PageDirectory) {
        let top = Table(self.dir);
        let kernel_top = Table(kernel_dir.dir);
        let last = (crate::param::KERNEL_WINDOW_END >> 22) as usize;
        for i in 0..last {
            top.set_entry(i, kernel_top.entry(i));
        }
    }

    fn l2_for(
        &self,
        vaddr: u32,
        allocate: bool,
        alloc_leaf: &mut dyn FnMut() -> KResult<Frame>,
    ) -> KResult<Option<Table>> {
        let top = Table(self.dir);
        let pde = top.entry(vpn1(vaddr));
        if pde.is_present() {
            return Ok(Some(Table(pde.frame())));
        }
        if !allocate {
            return Ok(None);
        }
        let leaf = alloc_leaf()?;
        Table(leaf).zero();
        top.set_entry(
            vpn1(vaddr),
            Pte::new(leaf, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER),
        );
        Ok(Some(Table(leaf)))
    }

    /// Walks to the leaf PTE for `vaddr`, allocating the level-2 table from
    /// `slab` if absent and `allocate` is set. Returns `Ok(None)` if the
    /// mapping is absent and `allocate` was false, or if allocation failed
    /// because the slab is exhausted.
    fn walk(&self, slab: &PageSlab, vaddr: u32, allocate: bool) -> Option<(Table, usize)> {
        let mut alloc_leaf = || slab.alloc();
        match self.l2_for(vaddr, allocate, &mut alloc_leaf) {
            Ok(Some(table)) => Some((table, vpn0(vaddr))),
            _ => None,
        }
    }

    fn walk_boot(&self, frames: &FrameAlloc, vaddr: u32, allocate: bool) -> Option<(Table, usize)> {
        let mut alloc_leaf = || frames.alloc();
        match self.l2_for(vaddr, allocate, &mut alloc_leaf) {
            Ok(Some(table)) => Some((table, vpn0(vaddr))),
            _ => None,
        }
    }

    /// Maps `vaddr` to a freshly claimed frame, user-accessible, optionally
    /// writable. Returns the physical frame on success.
    pub fn map_user(
        &self,
        slab: &PageSlab,
        frames: &FrameAlloc,
        vaddr: u32,
        writable: bool,
    ) -> KResult<Frame> {
        let (leaf, idx) = self
            .walk(slab, vaddr, true)
            .ok_or(KernelError::OutOfPageSlab)?;
        let frame = frames.alloc()?;
        let mut flags = PteFlags::PRESENT | PteFlags::USER;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        leaf.set_entry(idx, Pte::new(frame, flags));
        Ok(frame)
    }

    /// Maps `vaddr` to a specific physical frame as kernel-only
    /// (non-user, non-writable from user mode; the kernel can still write
    /// through its own ring-0 privilege regardless of the writable bit).
    pub fn map_kernel(&self, slab: &PageSlab, vaddr: u32, paddr: Frame) -> KResult<()> {
        let (leaf, idx) = self
            .walk(slab, vaddr, true)
            .ok_or(KernelError::OutOfPageSlab)?;
        leaf.set_entry(idx, Pte::new(paddr, PteFlags::PRESENT));
        Ok(())
    }

    /// Boot-path kernel mapping, used before the page slab exists.
    pub fn map_kernel_boot(&self, frames: &FrameAlloc, vaddr: u32, paddr: Frame) -> KResult<()> {
        let (leaf, idx) = self
            .walk_boot(frames, vaddr, true)
            .ok_or(KernelError::OutOfFrames)?;
        leaf.set_entry(idx, Pte::new(paddr, PteFlags::PRESENT));
        Ok(())
    }

    pub fn translate(&self, slab: &PageSlab, vaddr: u32) -> Option<Frame> {
        let (leaf, idx) = self.walk(slab, vaddr, false)?;
        let pte = leaf.entry(idx);
        pte.is_present().then(|| pte.frame())
    }

    /// For every present leaf page in `[lo, hi)`, frees its frame and
    /// clears the entry. Never frees the level-2 tables themselves.
    pub fn unmap_range(&self, slab: &PageSlab, frames: &FrameAlloc, lo: u32, hi: u32) {
        let mut vaddr = lo & !((PAGE_SIZE as u32) - 1);
        while vaddr < hi {
            if let Some((leaf, idx)) = self.walk(slab, vaddr, false) {
                let pte = leaf.entry(idx);
                if pte.is_present() {
                    frames.free(pte.frame());
                    leaf.set_entry(idx, Pte::NULL);
                }
            }
            vaddr = vaddr.wrapping_add(PAGE_SIZE as u32);
        }
    }

    /// For every present user page in `src`'s `[lo, hi)`, allocates a frame
    /// in `self` and copies the page, preserving writability. On any
    /// failure, unmaps everything this call mapped in `self` and reports
    /// the error — partial copies never linger (§4.3, property 4 of §8).
    pub fn copy_range(
        &self,
        slab: &PageSlab,
        frames: &FrameAlloc,
        src: &PageDirectory,
        lo: u32,
        hi: u32,
    ) -> KResult<()> {
        let mut vaddr = lo & !((PAGE_SIZE as u32) - 1);
        while vaddr < hi {
            if let Some((src_leaf, idx)) = src.walk(slab, vaddr, false) {
                let pte = src_leaf.entry(idx);
                if pte.is_present() {
                    let writable = pte.flags().contains(PteFlags::WRITABLE);
                    match self.map_user(slab, frames, vaddr, writable) {
                        Ok(dst_frame) => unsafe {
                            core::ptr::copy_nonoverlapping(
                                frame_ptr(pte.frame()),
                                frame_ptr(dst_frame),
                                PAGE_SIZE,
                            );
                        },
                        Err(e) => {
                            self.unmap_range(slab, frames, lo, hi);
                            return Err(e);
                        }
                    }
                }
            }
            vaddr = vaddr.wrapping_add(PAGE_SIZE as u32);
        }
        Ok(())
    }

    /// Returns every level-2 table and the directory itself to the page
    /// slab. Caller must have already unmapped any user frames.
    ///
    /// Leaf tables covering `[0, KERNEL_WINDOW_END)` are never freed here:
    /// `share_kernel_window` points every address space's low PDEs at the
    /// same leaf tables as `KERNEL_DIR`, so freeing them on one process's
    /// exit would pull the kernel window out from under every other
    /// process still running.
    pub fn destroy(self, slab: &PageSlab) {
        let top = Table(self.dir);
        let shared_end = (crate::param::KERNEL_WINDOW_END >> 22) as usize;
        for i in shared_end..PTE_PER_TABLE {
            let pde = top.entry(i);
            if pde.is_present() {
                slab.free(pde.frame());
            }
        }
        slab.free(self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::USER_BASE;

    fn setup() -> (FrameAlloc, PageSlab) {
        let frames = FrameAlloc::new();
        frames.init();
        let slab = PageSlab::new();
        slab.init(&frames, 64).unwrap();
        (frames, slab)
    }

    #[test]
    fn map_then_translate_roundtrip() {
        let (frames, slab) = setup();
        let dir = PageDirectory::new(&slab).unwrap();
        let frame = dir.map_user(&slab, &frames, USER_BASE, true).unwrap();
        assert_eq!(dir.translate(&slab, USER_BASE), Some(frame));
    }

    #[test]
    fn copy_range_is_independent_of_source() {
        let (frames, slab) = setup();
        let src = PageDirectory::new(&slab).unwrap();
        let dst = PageDirectory::new(&slab).unwrap();
        let vaddr = USER_BASE;
        let pf = src.map_user(&slab, &frames, vaddr, true).unwrap();
        unsafe {
            frame_ptr(pf).write(0x42);
        }
        dst.copy_range(&slab, &frames, &src, vaddr, vaddr + PAGE_SIZE as u32)
            .unwrap();
        let dst_frame = dst.translate(&slab, vaddr).unwrap();
        assert_ne!(dst_frame, pf);
        unsafe {
            assert_eq!(frame_ptr(dst_frame).read(), 0x42);
            // Writing through dst must not alter src.
            frame_ptr(dst_frame).write(0x99);
            assert_eq!(frame_ptr(pf).read(), 0x42);
        }
    }

    #[test]
    fn unmap_range_clears_and_frees() {
        let (frames, slab) = setup();
        let dir = PageDirectory::new(&slab).unwrap();
        let vaddr = USER_BASE;
        let before = frames.used_count();
        dir.map_user(&slab, &frames, vaddr, true).unwrap();
        assert_eq!(frames.used_count(), before + 1);
        dir.unmap_range(&slab, &frames, vaddr, vaddr + PAGE_SIZE as u32);
        assert_eq!(frames.used_count(), before);
        assert_eq!(dir.translate(&slab, vaddr), None);
    }
}
