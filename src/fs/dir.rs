//! Directory contents: a flat array of fixed-size entries, scanned linearly
//! (§3, §4.9). No hashing or B-trees, matching the teacher's `dirlookup`.

use crate::block::io::BlockIo;
use crate::error::{KernelError, KResult};
use crate::param::{DIRENT_SIZE, DIRNAME_LEN, ROOT_INODE};

use super::inode::{Dinode, InodeType};

#[derive(Clone, Copy)]
pub struct DirEntry {
    pub inumber: u32,
    pub name: [u8; DIRNAME_LEN],
}

impl DirEntry {
    pub const EMPTY: Self = Self { inumber: 0, name: [0; DIRNAME_LEN] };

    fn to_bytes(self) -> [u8; DIRENT_SIZE] {
        let mut buf = [0u8; DIRENT_SIZE];
        buf[0..4].copy_from_slice(&self.inumber.to_le_bytes());
        buf[4..4 + DIRNAME_LEN].copy_from_slice(&self.name);
        buf
    }

    fn from_bytes(buf: &[u8; DIRENT_SIZE]) -> Self {
        let inumber = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let mut name = [0u8; DIRNAME_LEN];
        name.copy_from_slice(&buf[4..4 + DIRNAME_LEN]);
        Self { inumber, name }
    }

    fn name_str(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        &self.name[..len]
    }

    fn in_use(&self) -> bool {
        self.inumber != 0
    }
}

fn encode_name(name: &[u8], out: &mut [u8; DIRNAME_LEN]) -> KResult<()> {
    if name.len() >= DIRNAME_LEN {
        return Err(KernelError::NameTooLong);
    }
    out[..name.len()].copy_from_slice(name);
    out[name.len()..].fill(0);
    Ok(())
}

static_assertions::const_assert!(4 + DIRNAME_LEN == DIRENT_SIZE);

fn num_entries(size: u32) -> u32 {
    size / DIRENT_SIZE as u32
}

fn read_entry(io: &BlockIo, dinode: &mut Dinode, idx: u32) -> KResult<DirEntry> {
    let mut buf = [0u8; DIRENT_SIZE];
    super::inode::inode_read(io, dinode, &mut buf, idx * DIRENT_SIZE as u32)?;
    Ok(DirEntry::from_bytes(&buf))
}

fn write_entry(io: &BlockIo, dinode: &mut Dinode, idx: u32, entry: DirEntry) -> KResult<()> {
    super::inode::inode_write(io, dinode, &entry.to_bytes(), idx * DIRENT_SIZE as u32)?;
    Ok(())
}

/// Linear scan for `name`; returns its inode number and entry index.
pub fn lookup(io: &BlockIo, dinode: &mut Dinode, name: &[u8]) -> KResult<(u32, u32)> {
    if dinode.itype != InodeType::Dir {
        return Err(KernelError::NotADirectory);
    }
    for idx in 0..num_entries(dinode.size) {
        let entry = read_entry(io, dinode, idx)?;
        if entry.in_use() && entry.name_str() == name {
            return Ok((entry.inumber, idx));
        }
    }
    Err(KernelError::NotFound)
}

/// Appends a new entry, reusing the first free slot if one exists.
pub fn link(io: &BlockIo, dinode: &mut Dinode, name: &[u8], inumber: u32) -> KResult<()> {
    if lookup(io, dinode, name).is_ok() {
        return Err(KernelError::FileExists);
    }
    let mut encoded = [0u8; DIRNAME_LEN];
    encode_name(name, &mut encoded)?;
    let entry = DirEntry { inumber, name: encoded };

    for idx in 0..num_entries(dinode.size) {
        if !read_entry(io, dinode, idx)?.in_use() {
            return write_entry(io, dinode, idx, entry);
        }
    }
    write_entry(io, dinode, num_entries(dinode.size), entry)
}

/// Clears the entry matching `name`, leaving a hole for `link` to reuse.
pub fn unlink(io: &BlockIo, dinode: &mut Dinode, name: &[u8]) -> KResult<u32> {
    let (inumber, idx) = lookup(io, dinode, name)?;
    write_entry(io, dinode, idx, DirEntry::EMPTY)?;
    Ok(inumber)
}

/// True once only `.` and `..` remain (§4.9 directory-removal invariant).
pub fn is_empty(io: &BlockIo, dinode: &mut Dinode) -> KResult<bool> {
    for idx in 0..num_entries(dinode.size) {
        let entry = read_entry(io, dinode, idx)?;
        if entry.in_use() && entry.name_str() != b"." && entry.name_str() != b".." {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Finds the name under which `target_inumber` appears in `dinode`,
/// skipping `.`/`..` (used by `getcwd` to walk a path back up from `..`).
pub fn name_of(io: &BlockIo, dinode: &mut Dinode, target_inumber: u32) -> KResult<Option<[u8; DIRNAME_LEN]>> {
    for idx in 0..num_entries(dinode.size) {
        let entry = read_entry(io, dinode, idx)?;
        if entry.in_use() && entry.inumber == target_inumber && entry.name_str() != b"." && entry.name_str() != b".." {
            return Ok(Some(entry.name));
        }
    }
    Ok(None)
}

/// Seeds a freshly allocated directory inode with `.` and `..` entries.
pub fn init_entries(io: &BlockIo, dinode: &mut Dinode, self_inumber: u32, parent_inumber: u32) -> KResult<()> {
    link(io, dinode, b".", self_inumber)?;
    link(io, dinode, b"..", parent_inumber)
}

pub const ROOT_PARENT: u32 = ROOT_INODE;

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

    fn setup() -> BlockIo {
        let disk: &'static RamDisk = Box::leak(Box::new(RamDisk::new()));
        let q: &'static BlockQ = Box::leak(Box::new(BlockQ::new()));
        q.init(disk);
        BlockIo::new(q)
    }

    #[test]
    fn link_then_lookup_round_trips() {
        let io = setup();
        let mut d = Dinode { itype: InodeType::Dir, ..Dinode::EMPTY };
        link(&io, &mut d, b"hello.txt", 5).unwrap();
        let (inumber, _idx) = lookup(&io, &mut d, b"hello.txt").unwrap();
        assert_eq!(inumber, 5);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let io = setup();
        let mut d = Dinode { itype: InodeType::Dir, ..Dinode::EMPTY };
        link(&io, &mut d, b"a", 1).unwrap();
        assert_eq!(link(&io, &mut d, b"a", 2), Err(KernelError::FileExists));
    }

    #[test]
    fn unlink_then_link_reuses_hole() {
        let io = setup();
        let mut d = Dinode { itype: InodeType::Dir, ..Dinode::EMPTY };
        link(&io, &mut d, b"a", 1).unwrap();
        link(&io, &mut d, b"b", 2).unwrap();
        unlink(&io, &mut d, b"a").unwrap();
        assert!(lookup(&io, &mut d, b"a").is_err());
        link(&io, &mut d, b"c", 3).unwrap();
        assert_eq!(num_entries(d.size), 2);
    }

    #[test]
    fn is_empty_ignores_dot_entries() {
        let io = setup();
        let mut d = Dinode { itype: InodeType::Dir, ..Dinode::EMPTY };
        init_entries(&io, &mut d, 10, 0).unwrap();
        assert!(is_empty(&io, &mut d).unwrap());
        link(&io, &mut d, b"file", 11).unwrap();
        assert!(!is_empty(&io, &mut d).unwrap());
    }
}
