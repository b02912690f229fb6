//! Kernel-internal error type.
//!
//! Every fallible subsystem operation returns `Result<T, KernelError>`.
//! Syscall dispatch collapses any `Err` into the distinguished `-1` return
//! value; only a handful of kinds are ever allowed to reach a syscall
//! boundary unconverted (see `crate::syscall`).

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfFrames,
    OutOfKHeap,
    OutOfPageSlab,
    InvalidUserPointer,
    InvalidSyscall,
    InodeTableFull,
    FileTableFull,
    TooManyProcs,
    TooManyOpenFiles,
    Io,
    NotFound,
    NotADirectory,
    IsADirectory,
    NameTooLong,
    FileExists,
    DirectoryNotEmpty,
    BadFileDescriptor,
    StackOverflow,
    InvalidArgument,
    OutOfDiskBlocks,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelError::OutOfFrames => "out of physical frames",
            KernelError::OutOfKHeap => "kernel heap exhausted",
            KernelError::OutOfPageSlab => "page slab exhausted",
            KernelError::InvalidUserPointer => "invalid user pointer",
            KernelError::InvalidSyscall => "invalid syscall",
            KernelError::InodeTableFull => "inode cache full",
            KernelError::FileTableFull => "open file table full",
            KernelError::TooManyProcs => "process table full",
            KernelError::TooManyOpenFiles => "too many open files for process",
            KernelError::Io => "i/o error",
            KernelError::NotFound => "no such file or directory",
            KernelError::NotADirectory => "not a directory",
            KernelError::IsADirectory => "is a directory",
            KernelError::NameTooLong => "name too long",
            KernelError::FileExists => "file exists",
            KernelError::DirectoryNotEmpty => "directory not empty",
            KernelError::BadFileDescriptor => "bad file descriptor",
            KernelError::StackOverflow => "stack overflow",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::OutOfDiskBlocks => "data bitmap exhausted",
        };
        f.write_str(s)
    }
}

pub type KResult<T> = Result<T, KernelError>;

/// Every syscall handler returns this; `Ok` values and `Err` are both
/// collapsed to a machine word by `crate::syscall::dispatch`, with `Err`
/// becoming the distinguished `-1`.
pub type SysResult = Result<i32, KernelError>;
