//! File and directory syscalls: `open`, `close`, `create`, `remove`,
//! `read`, `write`, `chdir`, `getcwd`, `exec`, `fstat`, `seek` (§6).
//!
//! Translates between the process's small per-fd index array (`Pcb.files`)
//! and the system-wide `fs` open-file/inode tables, the same split the
//! teacher draws between `CurrentProcMut`'s `open_files` and `Kernel`'s
//! `itable`/`ftable`.

use crate::error::{KernelError, SysResult};
use crate::fs::{self, inode::InodeType, path, FS};
use crate::param::{MAXPATH, MAX_FILES_PER_PROC, ROOT_INODE};
use crate::proc::PTABLE;
use crate::trapstate::TrapState;

use super::{
    current_slot, sysarg_get_mem_at, sysarg_get_str, sysarg_int, sysarg_put_mem, sysarg_put_mem_at, CREATE_DIR,
    O_RDWR, O_WRONLY,
};

/// Reads the `n`th argument as a path string into a stack buffer sized
/// `MAXPATH`, returning the buffer alongside the string's length.
macro_rules! path_arg {
    ($trap_state:expr, $n:expr) => {{
        let mut buf = [0u8; MAXPATH];
        let len = sysarg_get_str($trap_state, $n, &mut buf)?.len();
        (buf, len)
    }};
}

fn current_cwd_inumber() -> u32 {
    let t = PTABLE.acquire();
    match t.get(current_slot()).cwd {
        Some(slot) => FS.icache.inumber_of(slot as usize),
        None => ROOT_INODE,
    }
}

fn alloc_fd(inode_file_slot: usize) -> SysResult {
    let slot = current_slot();
    let mut t = PTABLE.acquire();
    let p = t.get_mut(slot);
    let fd = p.files.iter().position(|f| f.is_none()).ok_or(KernelError::TooManyOpenFiles)?;
    p.files[fd] = Some(inode_file_slot);
    Ok(fd as i32)
}

fn resolve_fd(fd: i32) -> Result<usize, KernelError> {
    if fd < 0 || fd as usize >= MAX_FILES_PER_PROC {
        return Err(KernelError::BadFileDescriptor);
    }
    let t = PTABLE.acquire();
    t.get(current_slot()).files[fd as usize].ok_or(KernelError::BadFileDescriptor)
}

pub fn sys_open(trap_state: &TrapState) -> SysResult {
    let (buf, len) = path_arg!(trap_state, 0);
    let mode = sysarg_int(trap_state, 1)?;
    let (readable, writable) = match mode {
        m if m == super::O_RDONLY => (true, false),
        m if m == O_WRONLY => (false, true),
        m if m == O_RDWR => (true, true),
        _ => return Err(KernelError::InvalidArgument),
    };
    let cwd = current_cwd_inumber();
    let file_slot = fs::open(cwd, &buf[..len], false, readable, writable)?;
    match alloc_fd(file_slot) {
        Ok(fd) => Ok(fd),
        Err(e) => {
            fs::close(file_slot);
            Err(e)
        }
    }
}

pub fn sys_close(trap_state: &TrapState) -> SysResult {
    let fd = sysarg_int(trap_state, 0)?;
    let file_slot = resolve_fd(fd)?;
    fs::close(file_slot);
    let mut t = PTABLE.acquire();
    t.get_mut(current_slot()).files[fd as usize] = None;
    Ok(0)
}

pub fn sys_create(trap_state: &TrapState) -> SysResult {
    let (buf, len) = path_arg!(trap_state, 0);
    let kind = sysarg_int(trap_state, 1)?;
    let itype = if kind == CREATE_DIR { InodeType::Dir } else { InodeType::File };
    let cwd = current_cwd_inumber();
    fs::create_file(cwd, &buf[..len], itype)?;
    Ok(0)
}

pub fn sys_remove(trap_state: &TrapState) -> SysResult {
    let (buf, len) = path_arg!(trap_state, 0);
    let cwd = current_cwd_inumber();
    fs::unlink(cwd, &buf[..len])?;
    Ok(0)
}

/// Streams through a bounded stack buffer rather than trusting a
/// user-supplied length to size a kernel allocation (§4.11).
const CHUNK: usize = 512;

pub fn sys_read(trap_state: &TrapState) -> SysResult {
    let fd = sysarg_int(trap_state, 0)?;
    let len = sysarg_int(trap_state, 2)?;
    if len < 0 {
        return Err(KernelError::InvalidArgument);
    }
    let file_slot = resolve_fd(fd)?;
    let mut local = [0u8; CHUNK];
    let mut total = 0usize;
    let want = len as usize;
    while total < want {
        let chunk = (want - total).min(local.len());
        let n = fs::read(file_slot, &mut local[..chunk])?;
        if n == 0 {
            break;
        }
        sysarg_put_mem_at(trap_state, 1, total, &local[..n])?;
        total += n;
        if n < chunk {
            break;
        }
    }
    Ok(total as i32)
}

pub fn sys_write(trap_state: &TrapState) -> SysResult {
    let fd = sysarg_int(trap_state, 0)?;
    let len = sysarg_int(trap_state, 2)?;
    if len < 0 {
        return Err(KernelError::InvalidArgument);
    }
    let file_slot = resolve_fd(fd)?;
    let mut local = [0u8; CHUNK];
    let mut total = 0usize;
    let want = len as usize;
    while total < want {
        let chunk = (want - total).min(local.len());
        sysarg_get_mem_at(trap_state, 1, total, &mut local[..chunk])?;
        let n = fs::write(file_slot, &local[..chunk])?;
        total += n;
        if n < chunk {
            break;
        }
    }
    Ok(total as i32)
}

pub fn sys_chdir(trap_state: &TrapState) -> SysResult {
    let (buf, len) = path_arg!(trap_state, 0);
    let cwd = current_cwd_inumber();
    let new_slot = path::resolve(&FS.icache, &FS.io, cwd, &buf[..len])?;
    let guard = match FS.icache.lock(&FS.io, new_slot) {
        Ok(g) => g,
        Err(e) => {
            FS.icache.put(new_slot);
            return Err(e);
        }
    };
    if guard.dinode.itype != InodeType::Dir {
        drop(guard);
        FS.icache.put(new_slot);
        return Err(KernelError::NotADirectory);
    }
    drop(guard);

    let slot = current_slot();
    let mut t = PTABLE.acquire();
    let p = t.get_mut(slot);
    let old = p.cwd.replace(new_slot as u32);
    drop(t);
    if let Some(old_slot) = old {
        FS.icache.put(old_slot as usize);
    }
    Ok(0)
}

pub fn sys_getcwd(trap_state: &TrapState) -> SysResult {
    let limit = sysarg_int(trap_state, 1)?;
    if limit < 2 {
        return Err(KernelError::InvalidArgument);
    }
    let cwd = current_cwd_inumber();
    let mut buf = [0u8; MAXPATH];
    let cap = (limit as usize - 1).min(buf.len());
    let n = fs::getcwd(cwd, &mut buf[..cap])?;
    sysarg_put_mem(trap_state, 0, &buf[..n])?;
    sysarg_put_mem_at(trap_state, 0, n, &[0u8])?;
    Ok(n as i32 + 1)
}

pub fn sys_exec(trap_state: &mut TrapState) -> SysResult {
    let (path_buf, path_len) = path_arg!(trap_state, 0);
    let argv_addr = super::sysarg_addr(trap_state, 1)?;
    let argc = crate::exec::exec(trap_state, &path_buf[..path_len], argv_addr)?;
    Ok(argc as i32)
}

pub fn sys_fstat(trap_state: &TrapState) -> SysResult {
    let fd = sysarg_int(trap_state, 0)?;
    let file_slot = resolve_fd(fd)?;
    let st = fs::fstat(file_slot)?;
    sysarg_put_mem(trap_state, 1, &st.to_bytes())?;
    Ok(0)
}

pub fn sys_seek(trap_state: &TrapState) -> SysResult {
    let fd = sysarg_int(trap_state, 0)?;
    let offset = sysarg_int(trap_state, 1)?;
    if offset < 0 {
        return Err(KernelError::InvalidArgument);
    }
    let file_slot = resolve_fd(fd)?;
    fs::seek(file_slot, offset as u32)?;
    Ok(0)
}
