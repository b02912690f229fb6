//! Physical frame allocator: one bit per frame, serialized by a spinlock.
//! Used both for user/kernel page frames and (via the same `Bitmap` type)
//! for the on-disk inode and data bitmaps in `crate::fs`.

use crate::error::{KernelError, KResult};
use crate::mm::bitmap::Bitmap;
use crate::mm::phys::{Frame, RESERVED_FRAMES, TOTAL_FRAMES};
use crate::sync::Spinlock;

const WORDS: usize = TOTAL_FRAMES.div_ceil(32);

pub struct FrameAlloc {
    bitmap: Spinlock<Bitmap<WORDS>>,
}

impl FrameAlloc {
    pub const fn new() -> Self {
        Self {
            bitmap: Spinlock::new("frame_bitmap", Bitmap::new(TOTAL_FRAMES)),
        }
    }

    /// Reserves the low region covering the kernel identity map. Must be
    /// called exactly once, at boot, before any other allocation.
    pub fn init(&self) {
        self.bitmap.acquire().reserve_low(RESERVED_FRAMES);
    }

    pub fn alloc(&self) -> KResult<Frame> {
        let mut bm = self.bitmap.acquire();
        let idx = bm.alloc();
        if idx >= bm.slots() {
            return Err(KernelError::OutOfFrames);
        }
        Ok(Frame(idx as u32))
    }

    pub fn free(&self, frame: Frame) {
        self.bitmap.acquire().clear(frame.0 as usize);
    }

    pub fn used_count(&self) -> usize {
        self.bitmap.acquire().count_used()
    }
}

impl Default for FrameAlloc {
    fn default() -> Self {
        Self::new()
    }
}

pub static FRAMES: FrameAlloc = FrameAlloc::new();
