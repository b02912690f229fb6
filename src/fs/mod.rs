//! The file system (§3, §4.9): block-addressed storage underneath, inode
//! cache and directory tree built on top. Five layers as in the teacher's
//! design — blocks, inodes, directories, paths, open files — collapsed
//! into four modules since this kernel has no write-ahead log (§1
//! Non-goals: crash recovery is out of scope).

pub mod dir;
pub mod file;
pub mod inode;
pub mod path;
pub mod superblock;

use crate::block::io::BlockIo;
use crate::block::BlockQ;
use crate::error::{KernelError, KResult};
use crate::param::ROOT_INODE;

use file::FTABLE;
use inode::{ICache, InodeType};
use superblock::Superblock;

pub static BLOCKQ: BlockQ = BlockQ::new();

pub struct Fs {
    pub io: BlockIo,
    pub icache: ICache,
}

impl Fs {
    const fn new() -> Self {
        Self { io: BlockIo::new(&BLOCKQ), icache: ICache::new() }
    }
}

pub static FS: Fs = Fs::new();

/// Brings up the file system on a fresh device: registers the driver,
/// loads the data bitmap, and validates the superblock. Called once at
/// boot (§4.9).
pub fn mount(device: &'static dyn crate::block::BlockDevice) -> KResult<Superblock> {
    BLOCKQ.init(device);
    FS.io.load_bitmap_from_disk()?;
    Superblock::load(&FS.io)
}

/// Formats a fresh device and creates the root directory. Used by the
/// boot-time `mkfs` path and by tests that build a volume from scratch.
pub fn mkfs(device: &'static dyn crate::block::BlockDevice) -> KResult<Superblock> {
    BLOCKQ.init(device);
    let sb = Superblock::format(&FS.io)?;
    FS.io.load_bitmap_from_disk()?;
    let inumber = FS.icache.alloc(&FS.io, crate::param::TOTAL_INODES, InodeType::Dir)?;
    debug_assert_eq!(inumber, ROOT_INODE);
    let slot = FS.icache.get(ROOT_INODE)?;
    {
        let mut guard = FS.icache.lock(&FS.io, slot)?;
        dir::init_entries(&FS.io, &mut guard.dinode, ROOT_INODE, ROOT_INODE)?;
        FS.icache.flush(&FS.io, slot, &guard)?;
    }
    FS.icache.put(slot);
    Ok(sb)
}

/// Opens (optionally creating) the file named by `path`, returning a slot
/// in the system-wide open file table. `cwd_inumber` anchors a relative
/// path; mirrors the `open`/`O_CREATE` syscall's core logic (§4.10).
pub fn open(cwd_inumber: u32, raw_path: &[u8], create: bool, readable: bool, writable: bool) -> KResult<usize> {
    let inode_slot = if create {
        match path::resolve(&FS.icache, &FS.io, cwd_inumber, raw_path) {
            Ok(slot) => slot,
            Err(KernelError::NotFound) => create_file(cwd_inumber, raw_path, InodeType::File)?,
            Err(e) => return Err(e),
        }
    } else {
        path::resolve(&FS.icache, &FS.io, cwd_inumber, raw_path)?
    };

    let guard = match FS.icache.lock(&FS.io, inode_slot) {
        Ok(g) => g,
        Err(e) => {
            FS.icache.put(inode_slot);
            return Err(e);
        }
    };
    if guard.dinode.itype == InodeType::Dir && writable {
        drop(guard);
        FS.icache.put(inode_slot);
        return Err(KernelError::IsADirectory);
    }
    drop(guard);

    match FTABLE.acquire().alloc(inode_slot, readable, writable) {
        Ok(file_slot) => Ok(file_slot),
        Err(e) => {
            FS.icache.put(inode_slot);
            Err(e)
        }
    }
}

/// Creates a new file or empty directory at `path` (§4.9). Fails if an
/// entry with that name already exists.
pub fn create_file(cwd_inumber: u32, raw_path: &[u8], itype: InodeType) -> KResult<usize> {
    let (parent_slot, name) = path::resolve_parent(&FS.icache, &FS.io, cwd_inumber, raw_path)?;
    let result = (|| {
        let mut parent_guard = FS.icache.lock(&FS.io, parent_slot)?;
        if parent_guard.dinode.itype != InodeType::Dir {
            return Err(KernelError::NotADirectory);
        }
        if dir::lookup(&FS.io, &mut parent_guard.dinode, name).is_ok() {
            return Err(KernelError::FileExists);
        }
        let inumber = FS.icache.alloc(&FS.io, crate::param::TOTAL_INODES, itype)?;
        dir::link(&FS.io, &mut parent_guard.dinode, name, inumber)?;
        FS.icache.flush(&FS.io, parent_slot, &parent_guard)?;

        if itype == InodeType::Dir {
            let parent_inumber = FS.icache.inumber_of(parent_slot);
            let child_slot = FS.icache.get(inumber)?;
            let mut child_guard = FS.icache.lock(&FS.io, child_slot)?;
            dir::init_entries(&FS.io, &mut child_guard.dinode, inumber, parent_inumber)?;
            FS.icache.flush(&FS.io, child_slot, &child_guard)?;
            drop(child_guard);
            FS.icache.put(child_slot);
        }
        Ok(inumber)
    })();
    FS.icache.put(parent_slot);
    result.map(|inumber| inumber as usize)
}

/// Removes the directory entry named by `path`. Directories must be empty
/// (§4.9 invariant); the backing inode is freed once its ref count and
/// link count both reach zero.
pub fn unlink(cwd_inumber: u32, raw_path: &[u8]) -> KResult<()> {
    let (parent_slot, name) = path::resolve_parent(&FS.icache, &FS.io, cwd_inumber, raw_path)?;
    let result = (|| {
        let mut parent_guard = FS.icache.lock(&FS.io, parent_slot)?;
        let (inumber, _) = dir::lookup(&FS.io, &mut parent_guard.dinode, name)?;
        let target_slot = FS.icache.get(inumber)?;
        let free_result = (|| {
            let mut target_guard = FS.icache.lock(&FS.io, target_slot)?;
            if target_guard.dinode.itype == InodeType::Dir && !dir::is_empty(&FS.io, &mut target_guard.dinode)? {
                return Err(KernelError::DirectoryNotEmpty);
            }
            dir::unlink(&FS.io, &mut parent_guard.dinode, name)?;
            FS.icache.flush(&FS.io, parent_slot, &parent_guard)?;
            FS.icache.free(&FS.io, target_slot, &mut target_guard)
        })();
        FS.icache.put(target_slot);
        free_result
    })();
    FS.icache.put(parent_slot);
    result
}

/// Reads up to `dst.len()` bytes from an open file, advancing its offset.
pub fn read(file_slot: usize, dst: &mut [u8]) -> KResult<usize> {
    let (inode_slot, offset, readable) = {
        let f = FTABLE.acquire().get(file_slot);
        (f.inode_slot, f.offset, f.readable)
    };
    if !readable {
        return Err(KernelError::BadFileDescriptor);
    }
    let mut guard = FS.icache.lock(&FS.io, inode_slot)?;
    let n = inode::inode_read(&FS.io, &mut guard.dinode, dst, offset)?;
    FTABLE.acquire().advance_offset(file_slot, n as u32);
    Ok(n)
}

/// Writes `src` to an open file at its current offset, extending it.
pub fn write(file_slot: usize, src: &[u8]) -> KResult<usize> {
    let (inode_slot, offset, writable) = {
        let f = FTABLE.acquire().get(file_slot);
        (f.inode_slot, f.offset, f.writable)
    };
    if !writable {
        return Err(KernelError::BadFileDescriptor);
    }
    let mut guard = FS.icache.lock(&FS.io, inode_slot)?;
    let n = inode::inode_write(&FS.io, &mut guard.dinode, src, offset)?;
    FS.icache.flush(&FS.io, inode_slot, &guard)?;
    drop(guard);
    FTABLE.acquire().advance_offset(file_slot, n as u32);
    Ok(n)
}

/// Closes a process's reference to an open file, releasing the backing
/// inode once the file table's ref count reaches zero.
pub fn close(file_slot: usize) {
    if let Some(inode_slot) = FTABLE.acquire().close(file_slot) {
        FS.icache.put(inode_slot);
    }
}

/// Metadata reported by `fstat` (§6). Field order matches `to_bytes`, the
/// layout `sys_fstat` copies out to the caller's `stat*`.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub inumber: u32,
    pub itype: InodeType,
    pub size: u32,
}

pub const STAT_SIZE: usize = 4 + 2 + 4;

impl Stat {
    pub fn to_bytes(self) -> [u8; STAT_SIZE] {
        let mut buf = [0u8; STAT_SIZE];
        buf[0..4].copy_from_slice(&self.inumber.to_le_bytes());
        buf[4..6].copy_from_slice(&(self.itype as u16).to_le_bytes());
        buf[6..10].copy_from_slice(&self.size.to_le_bytes());
        buf
    }
}

/// Reads back an open file's inode metadata.
pub fn fstat(file_slot: usize) -> KResult<Stat> {
    let inode_slot = FTABLE.acquire().get(file_slot).inode_slot;
    let inumber = FS.icache.inumber_of(inode_slot);
    let guard = FS.icache.lock(&FS.io, inode_slot)?;
    Ok(Stat { inumber, itype: guard.dinode.itype, size: guard.dinode.size })
}

/// Repositions an open file's read/write offset (§6 `seek`). Negative or
/// past-end-of-file offsets are rejected; this kernel has no sparse holes
/// on write (§4.9), so only forward seeks within `[0, size]` are valid.
pub fn seek(file_slot: usize, offset: u32) -> KResult<()> {
    let inode_slot = FTABLE.acquire().get(file_slot).inode_slot;
    let size = {
        let guard = FS.icache.lock(&FS.io, inode_slot)?;
        guard.dinode.size
    };
    if offset > size {
        return Err(KernelError::InvalidArgument);
    }
    FTABLE.acquire().set_offset(file_slot, offset);
    Ok(())
}

/// Reconstructs an absolute path for a process's current working directory
/// (§6 `getcwd`); see `path::getcwd` for the walk-up algorithm.
pub fn getcwd(cwd_inumber: u32, buf: &mut [u8]) -> KResult<usize> {
    path::getcwd(&FS.icache, &FS.io, cwd_inumber, buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockDevice, BlockReq};
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

    /// `Fs`/`FTABLE`/`BLOCKQ` are process-wide singletons (like `PTABLE`),
    /// so file-system tests serialize on `proc::test_guard` even though
    /// they never touch the process table directly, just the `ParkLock`s
    /// that the inode cache uses internally.
    fn with_fresh_volume<R>(f: impl FnOnce() -> R) -> R {
        use crate::mm::{AddressSpace, FrameAlloc, PageSlab};
        use crate::param::{USER_BASE, USER_MAX};
        use crate::proc::{self, spawn_initial};
        use crate::sync::cpu::set_running_slot;

        let _g = proc::test_guard();
        proc::reset_ptable_for_test();
        let frames = FrameAlloc::new();
        frames.init();
        let slab = PageSlab::new();
        slab.init(&frames, 16).unwrap();
        let space = AddressSpace::new(&slab, USER_BASE).unwrap();
        let slot = spawn_initial(&slab, "t", 4, space, 0x1000, USER_MAX - 4).unwrap();
        set_running_slot(Some(slot));

        let disk: &'static RamDisk = Box::leak(Box::new(RamDisk::new()));
        mkfs(disk).unwrap();

        let result = f();
        set_running_slot(None);
        result
    }

    #[test]
    fn create_then_open_and_write_read_round_trips() {
        with_fresh_volume(|| {
            let file_slot = open(ROOT_INODE, b"/greeting", true, true, true).unwrap();
            let n = write(file_slot, b"hello fs").unwrap();
            assert_eq!(n, 8);
            close(file_slot);

            let read_slot = open(ROOT_INODE, b"/greeting", false, true, false).unwrap();
            let mut buf = [0u8; 8];
            let n = read(read_slot, &mut buf).unwrap();
            assert_eq!(n, 8);
            assert_eq!(&buf, b"hello fs");
            close(read_slot);
        });
    }

    #[test]
    fn unlink_removes_entry_and_prevents_reopen_by_name() {
        with_fresh_volume(|| {
            let file_slot = open(ROOT_INODE, b"/doomed", true, true, false).unwrap();
            close(file_slot);
            unlink(ROOT_INODE, b"/doomed").unwrap();
            assert_eq!(open(ROOT_INODE, b"/doomed", false, true, false).unwrap_err(), KernelError::NotFound);
        });
    }

    #[test]
    fn unlink_nonempty_directory_fails() {
        with_fresh_volume(|| {
            create_file(ROOT_INODE, b"/sub", InodeType::Dir).unwrap();
            let file_slot = open(ROOT_INODE, b"/sub/inner", true, true, false).unwrap();
            close(file_slot);
            assert_eq!(unlink(ROOT_INODE, b"/sub").unwrap_err(), KernelError::DirectoryNotEmpty);
        });
    }

    #[test]
    fn opening_a_directory_for_write_fails() {
        with_fresh_volume(|| {
            create_file(ROOT_INODE, b"/adir", InodeType::Dir).unwrap();
            assert_eq!(open(ROOT_INODE, b"/adir", false, true, true).unwrap_err(), KernelError::IsADirectory);
        });
    }

    #[test]
    fn fstat_reports_size_after_write() {
        with_fresh_volume(|| {
            let file_slot = open(ROOT_INODE, b"/sized", true, true, true).unwrap();
            write(file_slot, b"12345").unwrap();
            let st = fstat(file_slot).unwrap();
            assert_eq!(st.size, 5);
            assert_eq!(st.itype, InodeType::File);
        });
    }

    #[test]
    fn seek_then_read_starts_at_new_offset() {
        with_fresh_volume(|| {
            let file_slot = open(ROOT_INODE, b"/seekable", true, true, true).unwrap();
            write(file_slot, b"0123456789").unwrap();
            seek(file_slot, 5).unwrap();
            let mut buf = [0u8; 4];
            let n = read(file_slot, &mut buf).unwrap();
            assert_eq!(n, 4);
            assert_eq!(&buf, b"5678");
            assert_eq!(seek(file_slot, 100).unwrap_err(), KernelError::InvalidArgument);
        });
    }

    #[test]
    fn getcwd_reconstructs_nested_path() {
        with_fresh_volume(|| {
            let sub = create_file(ROOT_INODE, b"/a", InodeType::Dir).unwrap() as u32;
            let leaf = create_file(sub, b"b", InodeType::Dir).unwrap() as u32;
            let mut buf = [0u8; 64];
            let n = getcwd(leaf, &mut buf).unwrap();
            assert_eq!(&buf[..n], b"/a/b");
            let n = getcwd(ROOT_INODE, &mut buf).unwrap();
            assert_eq!(&buf[..n], b"/");
        });
    }
}
