//! On-disk superblock (§3, §4.9, §6).
//!
//! This implementation parses and asserts the layout fields rather than
//! relying solely on the compile-time constants (`spec.md` §3 permits
//! either); `[ADD] §4.9a` gives the property test something concrete to
//! check against a corrupted-superblock fixture.

use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::block::io::BlockIo;
use crate::error::{KernelError, KResult};
use crate::param::{
    DATA_BLOCKS, DATA_START, INODE_BITMAP_START, INODE_TABLE_START, SUPERBLOCK_NO, TOTAL_BLOCKS,
};

pub const MAGIC: u32 = 0x4B43_4653; // "KCFS"

/// All-`u32` and packed with no padding, so it can go straight through
/// `zerocopy` rather than a hand-rolled byte-offset reader (x86 is
/// little-endian natively, matching the on-disk layout's byte order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, AsBytes)]
#[repr(C)]
pub struct Superblock {
    pub magic: u32,
    pub total_blocks: u32,
    pub inode_bitmap_start: u32,
    pub inode_table_start: u32,
    pub data_bitmap_start: u32,
    pub data_start: u32,
    pub data_blocks: u32,
}

impl Superblock {
    pub const fn fixed_layout() -> Self {
        Self {
            magic: MAGIC,
            total_blocks: TOTAL_BLOCKS,
            inode_bitmap_start: INODE_BITMAP_START,
            inode_table_start: INODE_TABLE_START,
            data_bitmap_start: crate::param::DATA_BITMAP_START,
            data_start: DATA_START,
            data_blocks: DATA_BLOCKS,
        }
    }

    fn to_bytes(self) -> [u8; crate::param::BLOCK_SIZE] {
        let mut buf = [0u8; crate::param::BLOCK_SIZE];
        buf[..core::mem::size_of::<Self>()].copy_from_slice(self.as_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; crate::param::BLOCK_SIZE]) -> Self {
        *LayoutVerified::<_, Self>::new(&buf[..core::mem::size_of::<Self>()])
            .expect("superblock-sized prefix")
    }

    /// Reads block 0 and validates it against the layout this kernel was
    /// built for. Fails closed: a superblock written by a different layout
    /// (or a garbage/zeroed block) is reported rather than silently trusted.
    pub fn load(io: &BlockIo) -> KResult<Self> {
        let block = io.read_block(SUPERBLOCK_NO)?;
        let sb = Self::from_bytes(&block);
        if sb != Self::fixed_layout() {
            return Err(KernelError::Io);
        }
        Ok(sb)
    }

    /// Formats block 0 with this kernel's fixed layout; used by the
    /// boot-time `mkfs` path and by tests that build a fresh volume.
    pub fn format(io: &BlockIo) -> KResult<Self> {
        let sb = Self::fixed_layout();
        io.write_block(SUPERBLOCK_NO, sb.to_bytes())?;
        Ok(sb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockDevice, BlockQ, BlockReq};
    use crate::param::BLOCK_SIZE;
    use std::sync::Mutex;

    struct RamDisk {
        blocks: Mutex<std::collections::HashMap<u32, [u8; BLOCK_SIZE]>>,
        last: Mutex<Option<BlockReq>>,
    }

    impl RamDisk {
        fn new() -> Self {
            Self { blocks: Mutex::new(std::collections::HashMap::new()), last: Mutex::new(None) }
        }
    }

    impl BlockDevice for RamDisk {
        fn start(&self, req: &BlockReq) {
            if req.dirty {
                self.blocks.lock().unwrap().insert(req.block_no, req.data);
            }
            *self.last.lock().unwrap() = Some(req.clone());
        }
        fn poll_ready(&self) -> bool {
            true
        }
        fn poll_error(&self) -> bool {
            false
        }
        fn finish_read(&self, data: &mut [u8; BLOCK_SIZE]) {
            let cmd = self.last.lock().unwrap().clone().unwrap();
            *data = self.blocks.lock().unwrap().get(&cmd.block_no).copied().unwrap_or([0; BLOCK_SIZE]);
        }
    }

    #[test]
    fn format_then_load_round_trips() {
        let disk: &'static RamDisk = Box::leak(Box::new(RamDisk::new()));
        let q: &'static BlockQ = Box::leak(Box::new(BlockQ::new()));
        q.init(disk);
        let io = BlockIo::new(q);
        Superblock::format(&io).unwrap();
        let sb = Superblock::load(&io).unwrap();
        assert_eq!(sb, Superblock::fixed_layout());
    }

    #[test]
    fn unformatted_disk_fails_to_load() {
        let disk: &'static RamDisk = Box::leak(Box::new(RamDisk::new()));
        let q: &'static BlockQ = Box::leak(Box::new(BlockQ::new()));
        q.init(disk);
        let io = BlockIo::new(q);
        assert!(Superblock::load(&io).is_err());
    }
}
