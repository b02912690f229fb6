//! Process-control syscalls: `getpid`, `fork`, `exit`, `sleep`, `wait`,
//! `kill`, `shutdown`, `setheap`, `uptime` (§6).
//!
//! `fork`/`exit` close the layering gap `crate::proc` leaves open: the
//! process table only moves the raw fd/cwd index array around, and it is
//! this module's job (per `proc::fork`'s and `proc::exit`'s own doc
//! comments) to bump or release the `fs` reference counts those indices
//! point at.

use crate::error::{KernelError, SysResult};
use crate::fs::file::FTABLE;
use crate::fs::FS;
use crate::mm::{FRAMES, PAGE_SLAB};
use crate::proc::{self, Pid, PTABLE};
use crate::trapstate::TrapState;

use super::{current_slot, sysarg_int};

pub fn sys_getpid() -> SysResult {
    Ok(proc::current_pid().0 as i32)
}

/// `fork` (§6): spawns a child sharing the parent's open files and cwd.
/// `proc::fork` only duplicates the raw index arrays; this wrapper bumps
/// the `fs`-side ref counts those indices actually point at, so closing a
/// file in one of the two processes doesn't yank it out from under the
/// other.
pub fn sys_fork(trap_state: &TrapState) -> SysResult {
    let timeslice = sysarg_int(trap_state, 0)?;
    if !(0..=16).contains(&timeslice) {
        return Err(KernelError::InvalidArgument);
    }
    let parent_slot = current_slot();
    let child_pid = proc::fork(parent_slot, timeslice as u32, &PAGE_SLAB, &FRAMES)?;

    let (files, cwd) = {
        let t = PTABLE.acquire();
        let child_slot = t.find_by_pid(child_pid).expect("sys_fork: child vanished from ptable");
        let p = t.get(child_slot);
        (p.files, p.cwd)
    };
    for fd in files.into_iter().flatten() {
        FTABLE.acquire().dup(fd);
    }
    if let Some(cwd_slot) = cwd {
        FS.icache.dup(cwd_slot as usize);
    }
    Ok(child_pid.0 as i32)
}

/// `exit` (§6): releases every open fd and the cwd reference before handing
/// off to `proc::exit`, which never returns.
pub fn sys_exit(_trap_state: &TrapState) -> SysResult {
    let slot = current_slot();
    let (files, cwd) = {
        let t = PTABLE.acquire();
        let p = t.get(slot);
        (p.files, p.cwd)
    };
    for fd in files.into_iter().flatten() {
        crate::fs::close(fd);
    }
    if let Some(cwd_slot) = cwd {
        FS.icache.put(cwd_slot as usize);
    }
    let initproc_slot = proc::initproc_slot();
    proc::exit(slot, initproc_slot);
}

pub fn sys_sleep(trap_state: &TrapState) -> SysResult {
    let millis = sysarg_int(trap_state, 0)?;
    if millis < 0 {
        return Err(KernelError::InvalidArgument);
    }
    let until = proc::ticks() + crate::arch::ms_to_ticks(millis as u32);
    proc::sleep(until);
    Ok(0)
}

pub fn sys_wait() -> SysResult {
    let slot = current_slot();
    match proc::wait(slot, &PAGE_SLAB, &FRAMES) {
        Some(pid) => Ok(pid.0 as i32),
        None => Err(KernelError::InvalidArgument),
    }
}

pub fn sys_kill(trap_state: &TrapState) -> SysResult {
    let pid = sysarg_int(trap_state, 0)?;
    if pid < 0 {
        return Err(KernelError::InvalidArgument);
    }
    if proc::kill(Pid(pid as u32)) {
        Ok(0)
    } else {
        Err(KernelError::InvalidArgument)
    }
}

/// `shutdown` (§6): never returns on success, matching the teacher's
/// `sys_poweroff`.
pub fn sys_shutdown() -> SysResult {
    crate::arch::power_off();
}

/// `setheap` (§6): an `sbrk`-style absolute-target heap resize. `new_top`
/// is the desired one-past-the-end address; the delta handed to
/// `AddressSpace::grow_brk` may be negative to shrink.
pub fn sys_setheap(trap_state: &TrapState) -> SysResult {
    let new_top = super::sysarg_addr(trap_state, 0)?;
    let slot = current_slot();
    let mut t = PTABLE.acquire();
    let p = t.get_mut(slot);
    let image_end = p.image_end;
    let space = p.pgdir.as_mut().ok_or(KernelError::InvalidUserPointer)?;
    let delta = new_top as i64 - space.brk() as i64;
    space.grow_brk(
        &PAGE_SLAB,
        &FRAMES,
        delta.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
        image_end,
        crate::param::STACK_FLOOR,
    )?;
    Ok(0)
}

pub fn sys_uptime() -> SysResult {
    Ok(proc::ticks() as i32)
}
