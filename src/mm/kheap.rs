//! Kernel heap: a next-fit allocator over a circular free list of
//! magic-tagged headers (§4.4). Backs `kalloc`/`kfree`-style kernel-internal
//! allocations that are too small or too short-lived to justify a whole
//! page from the slab (process table auxiliary buffers, path-walk scratch).
//!
//! The heap itself lives in a fixed-size static array rather than on pages
//! drawn from the frame allocator, since the kernel carries no general
//! dynamic memory growth (§9): once `KHEAP_BYTES` is exhausted, allocation
//! fails rather than requesting more pages.

use core::mem::size_of;

use crate::error::{KernelError, KResult};
use crate::sync::Spinlock;

const MAGIC: u32 = 0x4B48_4541; // "KHEA"
const KHEAP_BYTES: usize = 256 * 1024;

#[derive(Clone, Copy)]
struct Header {
    magic: u32,
    size: usize, // payload size in `Header` units, not counting this header
    next: usize, // index (in `Header` units) of the next free block, circular
}

struct Heap {
    storage: [Header; KHEAP_BYTES / size_of::<Header>()],
    free_ptr: usize, // index of a block known free, or usize::MAX if none yet
    base_len: usize, // number of `Header`-sized units in `storage`
}

const EMPTY_HEADER: Header = Header { magic: 0, size: 0, next: 0 };

impl Heap {
    const fn new() -> Self {
        Self {
            storage: [EMPTY_HEADER; KHEAP_BYTES / size_of::<Header>()],
            free_ptr: usize::MAX,
            base_len: KHEAP_BYTES / size_of::<Header>(),
        }
    }

    fn init(&mut self) {
        // One giant free block spanning the whole arena, minus its own header.
        self.storage[0] = Header {
            magic: MAGIC,
            size: self.base_len - 1,
            next: 0,
        };
        self.free_ptr = 0;
    }

    fn units_for(bytes: usize) -> usize {
        (bytes + size_of::<Header>() - 1) / size_of::<Header>()
    }

    /// Next-fit search starting from `free_ptr`, splitting the first block
    /// found that's large enough.
    fn alloc(&mut self, bytes: usize) -> KResult<usize> {
        if self.free_ptr == usize::MAX {
            return Err(KernelError::OutOfKHeap);
        }
        let want = Self::units_for(bytes).max(1);
        let start = self.free_ptr;
        let mut p = start;
        loop {
            let hdr = self.storage[p];
            assert_eq!(hdr.magic, MAGIC, "kheap: corrupted free list");
            if hdr.size >= want {
                if hdr.size > want + 1 {
                    // Split: carve `want` units off the front, leave the
                    // remainder as a smaller free block at p + 1 + want.
                    let rest = p + 1 + want;
                    self.storage[rest] = Header {
                        magic: MAGIC,
                        size: hdr.size - want - 1,
                        next: hdr.next,
                    };
                    self.storage[p] = Header {
                        magic: MAGIC,
                        size: want,
                        next: rest,
                    };
                    self.relink_free_ptr_if(p, rest);
                } else {
                    self.unlink(p);
                }
                return Ok(p + 1); // payload starts right after the header
            }
            p = hdr.next;
            if p == start {
                return Err(KernelError::OutOfKHeap);
            }
        }
    }

    fn relink_free_ptr_if(&mut self, old: usize, new: usize) {
        if self.free_ptr == old {
            self.free_ptr = new;
        }
    }

    fn unlink(&mut self, p: usize) {
        let next = self.storage[p].next;
        if next == p {
            self.free_ptr = usize::MAX;
            return;
        }
        // Find predecessor in the circular list and splice `p` out.
        let mut q = next;
        while self.storage[q].next != p {
            q = self.storage[q].next;
        }
        self.storage[q].next = next;
        if self.free_ptr == p {
            self.free_ptr = next;
        }
    }

    fn free(&mut self, payload_idx: usize) {
        let hdr_idx = payload_idx - 1;
        assert_eq!(self.storage[hdr_idx].magic, MAGIC, "kheap: free of bad pointer");
        if self.free_ptr == usize::MAX {
            self.storage[hdr_idx].next = hdr_idx;
            self.free_ptr = hdr_idx;
            return;
        }
        let next = self.storage[self.free_ptr].next;
        self.storage[self.free_ptr].next = hdr_idx;
        self.storage[hdr_idx].next = next;
    }
}

pub struct KHeap {
    inner: Spinlock<Heap>,
}

impl KHeap {
    pub const fn new() -> Self {
        Self {
            inner: Spinlock::new("kheap", Heap::new()),
        }
    }

    pub fn init(&self) {
        self.inner.acquire().init();
    }

    /// Allocates at least `bytes` bytes, returning a header-unit index.
    /// Kept as an index rather than a raw pointer so host tests can exercise
    /// the allocator without `unsafe`; `crate::mm` wraps this for real use.
    pub fn alloc_units(&self, bytes: usize) -> KResult<usize> {
        self.inner.acquire().alloc(bytes)
    }

    pub fn free_units(&self, payload_idx: usize) {
        self.inner.acquire().free(payload_idx)
    }
}

impl Default for KHeap {
    fn default() -> Self {
        Self::new()
    }
}

pub static KHEAP: KHeap = KHeap::new();

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> KHeap {
        let h = KHeap::new();
        h.init();
        h
    }

    #[test]
    fn alloc_then_free_allows_reuse() {
        let h = fresh();
        let a = h.alloc_units(64).unwrap();
        h.free_units(a);
        let b = h.alloc_units(64).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn many_small_allocations_stay_disjoint() {
        let h = fresh();
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..50 {
            let idx = h.alloc_units(32).unwrap();
            assert!(seen.insert(idx), "kheap handed out overlapping block");
        }
    }

    #[test]
    fn exhaustion_reports_out_of_kheap() {
        let h = fresh();
        let mut err = None;
        for _ in 0..10_000 {
            if h.alloc_units(64).is_err() {
                err = Some(());
                break;
            }
        }
        assert!(err.is_some(), "kheap never reported exhaustion");
    }
}
