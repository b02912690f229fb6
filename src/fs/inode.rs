//! On-disk inode format, the in-memory inode cache, and the block-index
//! walk (§3, §4.9).
//!
//! Matches the teacher's split of "ref_count guarded by a cache-wide
//! spinlock" from "contents guarded by the inode's own blocking lock":
//! `inode_get`/`inode_put` only ever touch `meta`; reading or modifying the
//! cached on-disk record requires `lock`, which returns a `ParkLockGuard`
//! exactly like any other blocking lock in this kernel.

use crate::block::io::BlockIo;
use crate::error::{KernelError, KResult};
use crate::param::{
    ADDRS_PER_BLOCK, BLOCK_SIZE, INODES_PER_BLOCK, INODE_SIZE, INODE_TABLE_START, NDIRECT, NINDIRECT1, NINODE,
};
use crate::sync::{ParkLock, ParkLockGuard, Spinlock};

static_assertions::const_assert!(8 + NDIRECT * 4 + NINDIRECT1 * 4 + 4 <= INODE_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum InodeType {
    Empty = 0,
    File = 1,
    Dir = 2,
}

impl InodeType {
    fn from_u16(v: u16) -> Self {
        match v {
            1 => InodeType::File,
            2 => InodeType::Dir,
            _ => InodeType::Empty,
        }
    }
}

/// Exactly 128 bytes on disk (§6): type, size, 16 direct + 8 singly-indirect
/// + 1 doubly-indirect block pointers, with the tail zeroed on allocation.
#[derive(Debug, Clone, Copy)]
pub struct Dinode {
    pub itype: InodeType,
    pub size: u32,
    pub direct: [u32; NDIRECT],
    pub indirect1: [u32; NINDIRECT1],
    pub indirect2: u32,
}

impl Dinode {
    pub const EMPTY: Self =
        Self { itype: InodeType::Empty, size: 0, direct: [0; NDIRECT], indirect1: [0; NINDIRECT1], indirect2: 0 };

    fn to_bytes(self) -> [u8; INODE_SIZE] {
        let mut b = [0u8; INODE_SIZE];
        b[0..2].copy_from_slice(&(self.itype as u16).to_le_bytes());
        b[4..8].copy_from_slice(&self.size.to_le_bytes());
        let mut off = 8;
        for d in self.direct {
            b[off..off + 4].copy_from_slice(&d.to_le_bytes());
            off += 4;
        }
        for d in self.indirect1 {
            b[off..off + 4].copy_from_slice(&d.to_le_bytes());
            off += 4;
        }
        b[off..off + 4].copy_from_slice(&self.indirect2.to_le_bytes());
        b
    }

    fn from_bytes(b: &[u8; INODE_SIZE]) -> Self {
        let w = |r: core::ops::Range<usize>| u32::from_le_bytes(b[r.clone()].try_into().unwrap());
        let itype = InodeType::from_u16(u16::from_le_bytes(b[0..2].try_into().unwrap()));
        let size = w(4..8);
        let mut direct = [0u32; NDIRECT];
        let mut off = 8;
        for d in direct.iter_mut() {
            *d = w(off..off + 4);
            off += 4;
        }
        let mut indirect1 = [0u32; NINDIRECT1];
        for d in indirect1.iter_mut() {
            *d = w(off..off + 4);
            off += 4;
        }
        let indirect2 = w(off..off + 4);
        Self { itype, size, direct, indirect1, indirect2 }
    }
}

fn inode_location(inumber: u32) -> (u32, usize) {
    let block = INODE_TABLE_START + inumber / INODES_PER_BLOCK as u32;
    let offset = (inumber as usize % INODES_PER_BLOCK) * INODE_SIZE;
    (block, offset)
}

pub fn read_dinode(io: &BlockIo, inumber: u32) -> KResult<Dinode> {
    let (block, offset) = inode_location(inumber);
    let raw = io.read_block(block)?;
    Ok(Dinode::from_bytes(raw[offset..offset + INODE_SIZE].try_into().unwrap()))
}

pub fn write_dinode(io: &BlockIo, inumber: u32, dinode: Dinode) -> KResult<()> {
    let (block, offset) = inode_location(inumber);
    let mut raw = io.read_block(block)?;
    raw[offset..offset + INODE_SIZE].copy_from_slice(&dinode.to_bytes());
    io.write_block(block, raw)
}

pub struct CachedInode {
    pub valid: bool,
    pub inumber: u32,
    pub dinode: Dinode,
}

#[derive(Clone, Copy)]
struct Meta {
    ref_count: u32,
    inumber: u32,
}

/// In-memory inode cache (§3, §4.9). Fixed-size, mirroring the ptable's
/// discipline: ownership lives entirely in this table, never behind a
/// heap-allocated handle.
pub struct ICache {
    meta: Spinlock<[Meta; NINODE]>,
    content: [ParkLock<CachedInode>; NINODE],
}

impl ICache {
    pub const fn new() -> Self {
        const EMPTY_META: Meta = Meta { ref_count: 0, inumber: 0 };
        const EMPTY_CONTENT: ParkLock<CachedInode> =
            ParkLock::new("inode_content", CachedInode { valid: false, inumber: 0, dinode: Dinode::EMPTY });
        Self { meta: Spinlock::new("icache_meta", [EMPTY_META; NINODE]), content: [EMPTY_CONTENT; NINODE] }
    }

    pub fn inumber_of(&self, slot: usize) -> u32 {
        self.meta.acquire()[slot].inumber
    }

    /// Finds or creates a cache entry for `inumber`, bumping its ref count.
    /// Does not touch disk; loading happens lazily the first time the slot
    /// is `lock`ed (§4.9, teacher's `Inode::lock` / `ip->valid`).
    pub fn get(&self, inumber: u32) -> KResult<usize> {
        {
            let mut meta = self.meta.acquire();
            if let Some(slot) = meta.iter().position(|m| m.ref_count > 0 && m.inumber == inumber) {
                meta[slot].ref_count += 1;
                return Ok(slot);
            }
        }
        let slot = {
            let mut meta = self.meta.acquire();
            let slot = meta.iter().position(|m| m.ref_count == 0).ok_or(KernelError::InodeTableFull)?;
            meta[slot] = Meta { ref_count: 1, inumber };
            slot
        };
        // A fresh claim may be reusing a slot that held a different inode;
        // invalidate so the next `lock` reloads from disk instead of
        // handing back stale content.
        let mut c = self.content[slot].acquire();
        c.valid = false;
        c.inumber = inumber;
        Ok(slot)
    }

    /// Bumps the ref count of an already-held slot (used by `fork`-style
    /// sharing of an open file's inode).
    pub fn dup(&self, slot: usize) {
        self.meta.acquire()[slot].ref_count += 1;
    }

    /// Drops a reference. Forbidden while the caller holds `slot`'s content
    /// lock (§4.9); there is no way to express that statically here, so
    /// callers must simply not call `put` from inside a `lock` guard's
    /// scope.
    pub fn put(&self, slot: usize) {
        self.meta.acquire()[slot].ref_count -= 1;
    }

    pub fn lock<'a>(&'a self, io: &BlockIo, slot: usize) -> KResult<ParkLockGuard<'a, CachedInode>> {
        let mut g = self.content[slot].acquire();
        if !g.valid {
            let inumber = g.inumber;
            g.dinode = read_dinode(io, inumber)?;
            g.valid = true;
        }
        Ok(g)
    }

    pub fn flush(&self, io: &BlockIo, slot: usize, guard: &CachedInode) -> KResult<()> {
        write_dinode(io, guard.inumber, guard.dinode)
    }

    /// Allocates a fresh on-disk inode of `itype`, returning its number.
    /// Scans the inode table linearly for a slot whose stored type is
    /// `Empty` (§4.2's bitmap idiom is reserved for frames/data blocks;
    /// the teacher's own inode allocator is this same linear scan).
    pub fn alloc(&self, io: &BlockIo, total_inodes: u32, itype: InodeType) -> KResult<u32> {
        for inumber in 0..total_inodes {
            let existing = read_dinode(io, inumber)?;
            if existing.itype == InodeType::Empty {
                let fresh = Dinode { itype, size: 0, ..Dinode::EMPTY };
                write_dinode(io, inumber, fresh)?;
                return Ok(inumber);
            }
        }
        Err(KernelError::InodeTableFull)
    }

    pub fn free(&self, io: &BlockIo, slot: usize, guard: &mut CachedInode) -> KResult<()> {
        for i in 0..num_blocks(guard.dinode.size) {
            let addr = walk_readonly(io, &guard.dinode, i)?;
            if addr != 0 {
                io.block_free(addr);
            }
        }
        for addr in guard.dinode.indirect1 {
            if addr != 0 {
                io.block_free(addr);
            }
        }
        if guard.dinode.indirect2 != 0 {
            let block = io.read_block(guard.dinode.indirect2)?;
            for chunk in block.chunks_exact(4) {
                let a = u32::from_le_bytes(chunk.try_into().unwrap());
                if a != 0 {
                    io.block_free(a);
                }
            }
            io.block_free(guard.dinode.indirect2);
        }
        guard.dinode = Dinode::EMPTY;
        self.flush(io, slot, guard)
    }
}

impl Default for ICache {
    fn default() -> Self {
        Self::new()
    }
}

fn num_blocks(size: u32) -> u32 {
    (size as usize).div_ceil(BLOCK_SIZE) as u32
}

/// `walk(inode, idx)` (§4.9): direct / singly-indirect / doubly-indirect
/// index translation. Allocates on demand; modifications to indirect
/// blocks are written back immediately.
pub fn walk(io: &BlockIo, dinode: &mut Dinode, idx: u32) -> KResult<u32> {
    let idx = idx as usize;
    if idx < NDIRECT {
        if dinode.direct[idx] == 0 {
            dinode.direct[idx] = io.block_alloc()?;
        }
        return Ok(dinode.direct[idx]);
    }
    let idx = idx - NDIRECT;
    if idx < NINDIRECT1 * ADDRS_PER_BLOCK {
        let which = idx / ADDRS_PER_BLOCK;
        let within = idx % ADDRS_PER_BLOCK;
        if dinode.indirect1[which] == 0 {
            dinode.indirect1[which] = io.block_alloc()?;
        }
        return walk_indirect_leaf(io, dinode.indirect1[which], within);
    }
    let idx = idx - NINDIRECT1 * ADDRS_PER_BLOCK;
    if idx < ADDRS_PER_BLOCK * ADDRS_PER_BLOCK {
        if dinode.indirect2 == 0 {
            dinode.indirect2 = io.block_alloc()?;
        }
        let which = idx / ADDRS_PER_BLOCK;
        let within = idx % ADDRS_PER_BLOCK;
        let inner = read_indirect_slot(io, dinode.indirect2, which)?;
        let inner = if inner == 0 {
            let fresh = io.block_alloc()?;
            write_indirect_slot(io, dinode.indirect2, which, fresh)?;
            fresh
        } else {
            inner
        };
        return walk_indirect_leaf(io, inner, within);
    }
    Err(KernelError::InvalidArgument)
}

/// Non-allocating variant used by `free`: reads an existing mapping without
/// creating new blocks for holes.
fn walk_readonly(io: &BlockIo, dinode: &Dinode, idx: u32) -> KResult<u32> {
    let idx = idx as usize;
    if idx < NDIRECT {
        return Ok(dinode.direct[idx]);
    }
    let idx = idx - NDIRECT;
    if idx < NINDIRECT1 * ADDRS_PER_BLOCK {
        let which = idx / ADDRS_PER_BLOCK;
        let within = idx % ADDRS_PER_BLOCK;
        if dinode.indirect1[which] == 0 {
            return Ok(0);
        }
        return read_indirect_slot(io, dinode.indirect1[which], within);
    }
    let idx = idx - NINDIRECT1 * ADDRS_PER_BLOCK;
    if dinode.indirect2 == 0 {
        return Ok(0);
    }
    let which = idx / ADDRS_PER_BLOCK;
    let within = idx % ADDRS_PER_BLOCK;
    let inner = read_indirect_slot(io, dinode.indirect2, which)?;
    if inner == 0 {
        return Ok(0);
    }
    read_indirect_slot(io, inner, within)
}

fn walk_indirect_leaf(io: &BlockIo, block: u32, within: usize) -> KResult<u32> {
    let leaf = read_indirect_slot(io, block, within)?;
    if leaf != 0 {
        return Ok(leaf);
    }
    let fresh = io.block_alloc()?;
    write_indirect_slot(io, block, within, fresh)?;
    Ok(fresh)
}

fn read_indirect_slot(io: &BlockIo, block: u32, idx: usize) -> KResult<u32> {
    let raw = io.read_block(block)?;
    Ok(u32::from_le_bytes(raw[idx * 4..idx * 4 + 4].try_into().unwrap()))
}

fn write_indirect_slot(io: &BlockIo, block: u32, idx: usize, value: u32) -> KResult<()> {
    let mut raw = io.read_block(block)?;
    raw[idx * 4..idx * 4 + 4].copy_from_slice(&value.to_le_bytes());
    io.write_block(block, raw)
}

/// `inode_read` (§4.9): clamps `len` to `size - offset`, loops per-block.
pub fn inode_read(io: &BlockIo, dinode: &mut Dinode, dst: &mut [u8], offset: u32) -> KResult<usize> {
    if offset >= dinode.size {
        return Ok(0);
    }
    let len = (dst.len() as u32).min(dinode.size - offset) as usize;
    let mut done = 0;
    while done < len {
        let pos = offset as usize + done;
        let block_idx = (pos / BLOCK_SIZE) as u32;
        let in_block = pos % BLOCK_SIZE;
        let chunk = (BLOCK_SIZE - in_block).min(len - done);
        let addr = walk_readonly(io, dinode, block_idx)?;
        if addr == 0 {
            dst[done..done + chunk].fill(0);
        } else {
            io.read_range(addr, in_block, &mut dst[done..done + chunk])?;
        }
        done += chunk;
    }
    Ok(done)
}

/// `inode_write` (§4.9): no sparse holes — `offset` must not exceed the
/// current size. Extends `size` and flushes the inode when growing.
pub fn inode_write(io: &BlockIo, dinode: &mut Dinode, src: &[u8], offset: u32) -> KResult<usize> {
    if offset > dinode.size {
        return Err(KernelError::InvalidArgument);
    }
    let mut done = 0;
    while done < src.len() {
        let pos = offset as usize + done;
        let block_idx = (pos / BLOCK_SIZE) as u32;
        let in_block = pos % BLOCK_SIZE;
        let chunk = (BLOCK_SIZE - in_block).min(src.len() - done);
        let addr = walk(io, dinode, block_idx)?;
        io.write_range(addr, in_block, &src[done..done + chunk])?;
        done += chunk;
    }
    let new_end = offset as usize + done;
    if new_end as u32 > dinode.size {
        dinode.size = new_end as u32;
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockDevice, BlockQ, BlockReq};
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

    fn setup() -> BlockIo {
        let disk: &'static RamDisk = Box::leak(Box::new(RamDisk::new()));
        let q: &'static BlockQ = Box::leak(Box::new(BlockQ::new()));
        q.init(disk);
        BlockIo::new(q)
    }

    #[test]
    fn walk_same_index_twice_returns_same_address() {
        let io = setup();
        let mut d = Dinode::EMPTY;
        let a = walk(&io, &mut d, 3).unwrap();
        let b = walk(&io, &mut d, 3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn walk_indirect_index_allocates_through_indirect_block() {
        let io = setup();
        let mut d = Dinode::EMPTY;
        let idx = (NDIRECT + 5) as u32;
        let a = walk(&io, &mut d, idx).unwrap();
        let b = walk(&io, &mut d, idx).unwrap();
        assert_eq!(a, b);
        assert_ne!(d.indirect1[0], 0);
    }

    #[test]
    fn write_then_read_round_trips() {
        let io = setup();
        let mut d = Dinode { itype: InodeType::File, ..Dinode::EMPTY };
        let n = inode_write(&io, &mut d, b"hello world", 0).unwrap();
        assert_eq!(n, 11);
        let mut buf = [0u8; 11];
        let read = inode_read(&io, &mut d, &mut buf, 0).unwrap();
        assert_eq!(read, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn read_past_end_is_clamped() {
        let io = setup();
        let mut d = Dinode { itype: InodeType::File, ..Dinode::EMPTY };
        inode_write(&io, &mut d, b"abc", 0).unwrap();
        let mut buf = [0u8; 10];
        let n = inode_read(&io, &mut d, &mut buf, 0).unwrap();
        assert_eq!(n, 3);
    }

    /// `ICache::get` takes a content `ParkLock` to invalidate a freshly
    /// claimed slot, which requires a current process context (it records
    /// the acquiring PID); tests therefore run inside a fake single-process
    /// scheduler context exactly like `crate::proc`'s own tests.
    fn with_running_process<R>(f: impl FnOnce() -> R) -> R {
        use crate::mm::{FrameAlloc, PageSlab};
        use crate::proc::{self, spawn_initial};
        use crate::sync::cpu::set_running_slot;
        use crate::mm::AddressSpace;
        use crate::param::{USER_BASE, USER_MAX};

        let _g = proc::test_guard();
        proc::reset_ptable_for_test();
        let frames = FrameAlloc::new();
        frames.init();
        let slab = PageSlab::new();
        slab.init(&frames, 16).unwrap();
        let space = AddressSpace::new(&slab, USER_BASE).unwrap();
        let slot = spawn_initial(&slab, "t", 4, space, 0x1000, USER_MAX - 4).unwrap();
        set_running_slot(Some(slot));
        let result = f();
        set_running_slot(None);
        result
    }

    #[test]
    fn icache_get_is_idempotent_for_same_inumber() {
        with_running_process(|| {
            let icache = ICache::new();
            let slot_a = icache.get(7).unwrap();
            let slot_b = icache.get(7).unwrap();
            assert_eq!(slot_a, slot_b);
            icache.put(slot_a);
            icache.put(slot_b);
        });
    }

    #[test]
    fn icache_reuses_freed_slot_for_new_inumber() {
        with_running_process(|| {
            let icache = ICache::new();
            let slot = icache.get(1).unwrap();
            icache.put(slot);
            let slot2 = icache.get(2).unwrap();
            assert_eq!(slot, slot2);
        });
    }
}
