//! System call dispatch (§4.10, §6).
//!
//! The x86 `int` convention this kernel uses has no argument registers:
//! the syscall number arrives in `trap_state.eax`, and arguments were
//! pushed onto the user stack by the calling stub, sitting just above
//! `trap_state.esp` (return address at `esp`, first argument at `esp+4`,
//! second at `esp+8`, ...). `sysarg_int`/`sysarg_addr`/`sysarg_str` fetch
//! them from there through `mm::copy_in`, mirroring the teacher's
//! `argint`/`argaddr`/`argstr` trio but adapted to a stack-based ABI
//! instead of `argraw`'s register lookup.

mod sysfile;
mod sysio;
mod sysproc;

use crate::error::{KernelError, KResult};
use crate::mm::{self, PageDirectory, PageSlab};
use crate::proc::PTABLE;
use crate::sync::cpu::current_running_slot;
use crate::trapstate::TrapState;

const SYS_GETPID: u32 = 1;
const SYS_FORK: u32 = 2;
const SYS_EXIT: u32 = 3;
const SYS_SLEEP: u32 = 4;
const SYS_WAIT: u32 = 5;
const SYS_KILL: u32 = 6;
const SYS_SHUTDOWN: u32 = 7;
const SYS_SETHEAP: u32 = 8;
const SYS_OPEN: u32 = 9;
const SYS_CLOSE: u32 = 10;
const SYS_CREATE: u32 = 11;
const SYS_REMOVE: u32 = 12;
const SYS_READ: u32 = 13;
const SYS_WRITE: u32 = 14;
const SYS_CHDIR: u32 = 15;
const SYS_GETCWD: u32 = 16;
const SYS_EXEC: u32 = 17;
const SYS_FSTAT: u32 = 18;
const SYS_SEEK: u32 = 19;
const SYS_UPTIME: u32 = 20;
const SYS_KBDSTR: u32 = 21;
const SYS_TPRINT: u32 = 22;

/// Open-file mode bits for `sys_open`'s second argument (§6).
pub const O_RDONLY: i32 = 0;
pub const O_WRONLY: i32 = 1;
pub const O_RDWR: i32 = 2;

/// Entry record for `sys_create`'s second argument (§6).
pub const CREATE_FILE: i32 = 0;
pub const CREATE_DIR: i32 = 1;

/// The distinguished failure value for every integer-returning syscall
/// (§6). `dispatch` collapses any `Err` into this rather than propagating
/// `KernelError` past the user/kernel boundary.
pub const FAIL: i32 = -1;

/// Looks up `num` (from `trap_state.eax`) and runs the matching handler,
/// writing its return value back into `trap_state.eax`. Unknown syscall
/// numbers fail closed rather than panicking (§4.10: user code is never
/// trusted).
pub fn dispatch(trap_state: &mut TrapState) {
    let num = trap_state.eax;
    let result = match num {
        SYS_GETPID => sysproc::sys_getpid(),
        SYS_FORK => sysproc::sys_fork(trap_state),
        SYS_EXIT => sysproc::sys_exit(trap_state),
        SYS_SLEEP => sysproc::sys_sleep(trap_state),
        SYS_WAIT => sysproc::sys_wait(),
        SYS_KILL => sysproc::sys_kill(trap_state),
        SYS_SHUTDOWN => sysproc::sys_shutdown(),
        SYS_SETHEAP => sysproc::sys_setheap(trap_state),
        SYS_OPEN => sysfile::sys_open(trap_state),
        SYS_CLOSE => sysfile::sys_close(trap_state),
        SYS_CREATE => sysfile::sys_create(trap_state),
        SYS_REMOVE => sysfile::sys_remove(trap_state),
        SYS_READ => sysfile::sys_read(trap_state),
        SYS_WRITE => sysfile::sys_write(trap_state),
        SYS_CHDIR => sysfile::sys_chdir(trap_state),
        SYS_GETCWD => sysfile::sys_getcwd(trap_state),
        SYS_EXEC => sysfile::sys_exec(trap_state),
        SYS_FSTAT => sysfile::sys_fstat(trap_state),
        SYS_SEEK => sysfile::sys_seek(trap_state),
        SYS_UPTIME => sysproc::sys_uptime(),
        SYS_KBDSTR => sysio::sys_kbdstr(trap_state),
        SYS_TPRINT => sysio::sys_tprint(trap_state),
        _ => Err(KernelError::InvalidSyscall),
    };
    trap_state.eax = match result {
        Ok(v) => v as u32,
        Err(_) => FAIL as u32,
    };
}

fn current_slot() -> usize {
    current_running_slot().expect("syscall: no process running")
}

/// Runs `f` with the current process's page directory and the shared page
/// slab, the two pieces every `mm::copy_*` call needs (§4.11).
pub(super) fn with_current_dir<R>(f: impl FnOnce(&PageDirectory, &PageSlab) -> KResult<R>) -> KResult<R> {
    let t = PTABLE.acquire();
    let p = t.get(current_slot());
    let space = p.pgdir.as_ref().ok_or(KernelError::InvalidUserPointer)?;
    f(space.directory(), &mm::PAGE_SLAB)
}

fn fetch_raw(trap_state: &TrapState, n: usize) -> KResult<u32> {
    let addr = trap_state.esp.wrapping_add(4 + 4 * n as u32);
    let mut buf = [0u8; 4];
    with_current_dir(|dir, slab| mm::copy_in(dir, slab, addr, &mut buf))?;
    Ok(u32::from_le_bytes(buf))
}

/// Fetches the `n`th 32-bit syscall argument as a signed integer.
pub fn sysarg_int(trap_state: &TrapState, n: usize) -> KResult<i32> {
    Ok(fetch_raw(trap_state, n)? as i32)
}

/// Fetches the `n`th syscall argument as a raw user address. Legality is
/// left to whatever `copy_in`/`copy_out` call eventually dereferences it
/// (§4.11, matching the teacher's `argaddr`).
pub fn sysarg_addr(trap_state: &TrapState, n: usize) -> KResult<u32> {
    fetch_raw(trap_state, n)
}

/// Fetches the `n`th syscall argument as a user pointer and copies `len`
/// bytes from it into `dst`.
pub fn sysarg_get_mem(trap_state: &TrapState, n: usize, dst: &mut [u8]) -> KResult<()> {
    let addr = sysarg_addr(trap_state, n)?;
    with_current_dir(|dir, slab| mm::copy_in(dir, slab, addr, dst))
}

/// Copies `src` out to the user pointer given by the `n`th argument.
pub fn sysarg_put_mem(trap_state: &TrapState, n: usize, src: &[u8]) -> KResult<()> {
    let addr = sysarg_addr(trap_state, n)?;
    with_current_dir(|dir, slab| mm::copy_out(dir, slab, addr, src))
}

/// Fetches the `n`th syscall argument as a NUL-terminated string, copied
/// into `buf`. Mirrors the teacher's `argstr`.
pub fn sysarg_get_str<'a>(trap_state: &TrapState, n: usize, buf: &'a mut [u8]) -> KResult<&'a [u8]> {
    let addr = sysarg_addr(trap_state, n)?;
    with_current_dir(|dir, slab| mm::copy_in_str(dir, slab, addr, buf))
}

/// Like `sysarg_get_mem` but reads starting `offset` bytes past the `n`th
/// argument's address, letting `read` stream a large user buffer through a
/// small fixed-size kernel chunk without refetching the base pointer.
pub fn sysarg_get_mem_at(trap_state: &TrapState, n: usize, offset: usize, dst: &mut [u8]) -> KResult<()> {
    let addr = sysarg_addr(trap_state, n)?.wrapping_add(offset as u32);
    with_current_dir(|dir, slab| mm::copy_in(dir, slab, addr, dst))
}

/// Like `sysarg_put_mem` but writes starting `offset` bytes past the `n`th
/// argument's address.
pub fn sysarg_put_mem_at(trap_state: &TrapState, n: usize, offset: usize, src: &[u8]) -> KResult<()> {
    let addr = sysarg_addr(trap_state, n)?.wrapping_add(offset as u32);
    with_current_dir(|dir, slab| mm::copy_out(dir, slab, addr, src))
}
