//! Byte-addressed disk I/O and the data-block allocator (§4.8).
//!
//! Bridges the file system's byte offsets to the block queue's whole-block
//! transfers, and owns the data bitmap (persisted alongside the frame
//! bitmap's in-memory sibling, per §9's open question: the bitmap gets its
//! own backing storage, loaded from disk at boot rather than written
//! through a dangling pointer).

use crate::error::{KernelError, KResult};
use crate::mm::bitmap::Bitmap;
use crate::param::{BLOCK_SIZE, DATA_BITMAP_START, DATA_BLOCKS, DATA_START, WORDS_PER_BLOCK};
use crate::sync::Spinlock;

use super::{BlockQ, BlockReq};

const BITMAP_WORDS: usize = (DATA_BLOCKS as usize).div_ceil(32);

pub struct BlockIo {
    queue: &'static BlockQ,
    data_bitmap: Spinlock<Bitmap<BITMAP_WORDS>>,
}

impl BlockIo {
    pub const fn new(queue: &'static BlockQ) -> Self {
        Self {
            queue,
            data_bitmap: Spinlock::new("data_bitmap", Bitmap::new(DATA_BLOCKS as usize)),
        }
    }

    /// Loads the on-disk data bitmap into the in-memory copy. Called once
    /// at boot after the block queue and device are initialized.
    pub fn load_bitmap_from_disk(&self) -> KResult<()> {
        let mut words = [0u32; BITMAP_WORDS];
        for block_idx in 0..words.len().div_ceil(WORDS_PER_BLOCK) {
            let req = self.queue.submit_blocking_poll(BlockReq::read(DATA_BITMAP_START + block_idx as u32))?;
            for w in 0..WORDS_PER_BLOCK {
                let dst = block_idx * WORDS_PER_BLOCK + w;
                if dst >= words.len() {
                    break;
                }
                let b = w * 4;
                words[dst] = u32::from_le_bytes(req.data[b..b + 4].try_into().unwrap());
            }
        }
        self.data_bitmap.acquire().load_words(&words);
        Ok(())
    }

    fn persist_bitmap_block(&self, block_idx: usize) -> KResult<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        {
            let bm = self.data_bitmap.acquire();
            let words = bm.as_words();
            for w in 0..WORDS_PER_BLOCK {
                let src = block_idx * WORDS_PER_BLOCK + w;
                let word = words.get(src).copied().unwrap_or(0);
                buf[w * 4..w * 4 + 4].copy_from_slice(&word.to_le_bytes());
            }
        }
        self.queue.submit_blocking_poll(BlockReq::write(DATA_BITMAP_START + block_idx as u32, buf))?;
        Ok(())
    }

    /// Allocates a free data block, zero-fills it on disk, and returns its
    /// absolute block number.
    pub fn block_alloc(&self) -> KResult<u32> {
        let idx = {
            let mut bm = self.data_bitmap.acquire();
            let idx = bm.alloc();
            if idx >= bm.slots() {
                return Err(KernelError::OutOfDiskBlocks);
            }
            idx
        };
        self.persist_bitmap_block(idx / (WORDS_PER_BLOCK * 32))?;
        let block_no = DATA_START + idx as u32;
        self.write_block(block_no, [0u8; BLOCK_SIZE])?;
        Ok(block_no)
    }

    pub fn block_free(&self, block_no: u32) {
        let idx = (block_no - DATA_START) as usize;
        self.data_bitmap.acquire().clear(idx);
        let _ = self.persist_bitmap_block(idx / (WORDS_PER_BLOCK * 32));
        let _ = self.write_block(block_no, [0u8; BLOCK_SIZE]);
    }

    pub fn read_block(&self, block_no: u32) -> KResult<[u8; BLOCK_SIZE]> {
        let req = self.queue.submit_blocking_poll(BlockReq::read(block_no))?;
        if !req.succeeded() {
            return Err(KernelError::Io);
        }
        Ok(req.data)
    }

    pub fn write_block(&self, block_no: u32, data: [u8; BLOCK_SIZE]) -> KResult<()> {
        let req = self.queue.submit_blocking_poll(BlockReq::write(block_no, data))?;
        if !req.succeeded() {
            return Err(KernelError::Io);
        }
        Ok(())
    }

    /// Copies `dst.len()` bytes starting at `offset_in_block` of `block_no`
    /// into `dst`. `offset_in_block + dst.len()` must not exceed `BLOCK_SIZE`
    /// (callers are expected to have already split a longer range at block
    /// boundaries, per §4.8).
    pub fn read_range(&self, block_no: u32, offset_in_block: usize, dst: &mut [u8]) -> KResult<()> {
        assert!(offset_in_block + dst.len() <= BLOCK_SIZE);
        let block = self.read_block(block_no)?;
        dst.copy_from_slice(&block[offset_in_block..offset_in_block + dst.len()]);
        Ok(())
    }

    /// Writes `src` into `block_no` at `offset_in_block`. When `src` does
    /// not cover the whole block, performs a read-modify-write so bytes
    /// outside the slice are preserved (§4.8).
    pub fn write_range(&self, block_no: u32, offset_in_block: usize, src: &[u8]) -> KResult<()> {
        assert!(offset_in_block + src.len() <= BLOCK_SIZE);
        let mut block = if src.len() == BLOCK_SIZE {
            [0u8; BLOCK_SIZE]
        } else {
            self.read_block(block_no)?
        };
        block[offset_in_block..offset_in_block + src.len()].copy_from_slice(src);
        self.write_block(block_no, block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::Mutex;

    struct FakeDisk {
        blocks: Mutex<RefCell<std::collections::HashMap<u32, [u8; BLOCK_SIZE]>>>,
        last_cmd: Mutex<RefCell<Option<super::BlockReq>>>,
    }

    impl FakeDisk {
        fn new() -> Self {
            Self {
                blocks: Mutex::new(RefCell::new(std::collections::HashMap::new())),
                last_cmd: Mutex::new(RefCell::new(None)),
            }
        }
    }

    impl super::super::BlockDevice for FakeDisk {
        fn start(&self, req: &BlockReq) {
            if req.dirty {
                self.blocks.lock().unwrap().borrow_mut().insert(req.block_no, req.data);
            }
            *self.last_cmd.lock().unwrap().borrow_mut() = Some(req.clone());
        }

        fn poll_ready(&self) -> bool {
            true
        }

        fn poll_error(&self) -> bool {
            false
        }

        fn finish_read(&self, data: &mut [u8; BLOCK_SIZE]) {
            let cmd = self.last_cmd.lock().unwrap().borrow().clone().unwrap();
            let stored = self.blocks.lock().unwrap().borrow().get(&cmd.block_no).copied().unwrap_or([0u8; BLOCK_SIZE]);
            *data = stored;
        }
    }

    fn setup() -> (&'static BlockQ, BlockIo) {
        let device: &'static FakeDisk = Box::leak(Box::new(FakeDisk::new()));
        let queue: &'static BlockQ = Box::leak(Box::new(BlockQ::new()));
        queue.init(device);
        let io = BlockIo::new(queue);
        (queue, io)
    }

    #[test]
    fn write_then_read_range_round_trips() {
        let (_q, io) = setup();
        io.write_range(DATA_START, 10, b"hello").unwrap();
        let mut buf = [0u8; 5];
        io.read_range(DATA_START, 10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn partial_write_preserves_surrounding_bytes() {
        let (_q, io) = setup();
        io.write_block(DATA_START, [0x42; BLOCK_SIZE]).unwrap();
        io.write_range(DATA_START, 4, b"AB").unwrap();
        let block = io.read_block(DATA_START).unwrap();
        assert_eq!(&block[0..4], &[0x42; 4]);
        assert_eq!(&block[4..6], b"AB");
        assert_eq!(block[6], 0x42);
    }

    #[test]
    fn block_alloc_then_free_allows_reuse() {
        let (_q, io) = setup();
        let a = io.block_alloc().unwrap();
        io.block_free(a);
        let b = io.block_alloc().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn block_alloc_returns_distinct_blocks() {
        let (_q, io) = setup();
        let a = io.block_alloc().unwrap();
        let b = io.block_alloc().unwrap();
        assert_ne!(a, b);
    }
}
