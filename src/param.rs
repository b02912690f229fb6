//! Compile-time kernel configuration constants.
//!
//! Collected in one module so the sizes of the fixed-capacity tables
//! (process table, file table, inode cache, ...) are visible at a glance.

/// Maximum number of processes the process table can hold at once.
pub const MAX_PROCS: usize = 32;

/// Maximum number of simultaneously open files, system-wide.
pub const NFILE: usize = 100;

/// Maximum number of file descriptors per process.
pub const MAX_FILES_PER_PROC: usize = 16;

/// Maximum number of cached in-memory inodes.
pub const NINODE: usize = 50;

/// Length of a process name, including the NUL terminator.
pub const PROC_NAME_LEN: usize = 16;

/// Maximum length of a path component / directory entry filename,
/// including the NUL terminator.
pub const DIRNAME_LEN: usize = 124;

/// Maximum number of `argv` entries accepted by `exec`.
pub const MAXARG: usize = 32;

/// Maximum length of a path string accepted by any syscall, including the
/// NUL terminator.
pub const MAXPATH: usize = 128;

/// Disk block size, in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Hardware sector size, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sectors per block; the block request protocol streams this many
/// `BLOCK_SIZE / 4` word groups per request.
pub const SECTORS_PER_BLOCK: usize = BLOCK_SIZE / SECTOR_SIZE;

/// Superblock lives at block 0.
pub const SUPERBLOCK_NO: u32 = 0;

/// Inode bitmap: blocks 1..=6 (6 blocks).
pub const INODE_BITMAP_START: u32 = 1;
pub const INODE_BITMAP_BLOCKS: u32 = 6;

/// Data bitmap: blocks 7..=38 (32 blocks).
pub const DATA_BITMAP_START: u32 = 7;
pub const DATA_BITMAP_BLOCKS: u32 = 32;

/// Inode table: blocks 39..=6143.
pub const INODE_TABLE_START: u32 = 39;
pub const INODE_TABLE_BLOCKS: u32 = 6144 - 39;

/// Data region: blocks 6144..=262143.
pub const DATA_START: u32 = 6144;
pub const DATA_BLOCKS: u32 = 262144 - 6144;

/// Total number of blocks on the volume.
pub const TOTAL_BLOCKS: u32 = 262144;

/// On-disk inode size, in bytes. Must divide `BLOCK_SIZE` evenly.
pub const INODE_SIZE: usize = 128;

/// Inodes per block.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

/// Total number of on-disk inode slots the inode table can hold.
pub const TOTAL_INODES: u32 = INODE_TABLE_BLOCKS * INODES_PER_BLOCK as u32;

/// Directory entry size, in bytes. Must divide `BLOCK_SIZE` evenly.
pub const DIRENT_SIZE: usize = 128;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 16;
/// Singly-indirect block pointers per inode.
pub const NINDIRECT1: usize = 8;
/// Doubly-indirect block pointers per inode (always 1, per spec).
pub const NINDIRECT2: usize = 1;
/// Block addresses per indirect block.
pub const ADDRS_PER_BLOCK: usize = BLOCK_SIZE / core::mem::size_of::<u32>();

/// Inode number of the root directory.
pub const ROOT_INODE: u32 = 0;

/// Page size, in bytes (4 KiB pages, x86 protected-mode paging).
pub const PAGE_SIZE: usize = 4096;

/// Page table entries per level.
pub const PTE_PER_TABLE: usize = 1024;

/// Kernel identity-map window: [0x0, KERNEL_WINDOW_END).
pub const KERNEL_WINDOW_END: u32 = 0x2000_0000;

/// User text/data/bss base.
pub const USER_BASE: u32 = 0x2000_0000;

/// Upper bound on ELF text/data/bss size (1 MiB).
pub const USER_IMAGE_MAX: u32 = USER_BASE + 0x0010_0000;

/// Top of the user address space.
pub const USER_MAX: u32 = 0x4000_0000;

/// Stack may not grow below this address (4 MiB stack cap).
pub const STACK_FLOOR: u32 = 0x3FC0_0000;

/// Maximum number of block requests the disk queue can hold in flight at
/// once (queued-plus-completed-but-not-yet-collected).
pub const MAX_INFLIGHT_REQS: usize = 16;

/// 32-bit words per on-disk block; the block request protocol streams
/// exactly this many words per transfer.
pub const WORDS_PER_BLOCK: usize = BLOCK_SIZE / core::mem::size_of::<u32>();
