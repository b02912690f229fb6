//! Console syscalls: `kbdstr`, `tprint` (§6).

use crate::console;
use crate::error::{KernelError, SysResult};
use crate::trapstate::TrapState;

use super::{sysarg_get_str, sysarg_int, sysarg_put_mem};

/// Maximum length of one keyboard line and one `tprint` string, matching
/// `MAXPATH` since neither has its own natural bound.
const MAXLINE: usize = crate::param::MAXPATH;

/// Copies the next completed keyboard line out to the caller's buffer,
/// returning the number of bytes copied.
pub fn sys_kbdstr(trap_state: &TrapState) -> SysResult {
    let limit = sysarg_int(trap_state, 1)?;
    if limit < 0 {
        return Err(KernelError::InvalidArgument);
    }
    let mut line = [0u8; MAXLINE];
    let cap = (limit as usize).min(line.len());
    let n = console::read_line(&mut line[..cap]);
    sysarg_put_mem(trap_state, 0, &line[..n])?;
    Ok(n as i32)
}

/// Prints a user string in a given VGA foreground color.
pub fn sys_tprint(trap_state: &TrapState) -> SysResult {
    let color = sysarg_int(trap_state, 0)?;
    if !(0..=15).contains(&color) {
        return Err(KernelError::InvalidArgument);
    }
    let mut buf = [0u8; MAXLINE];
    let bytes = sysarg_get_str(trap_state, 1, &mut buf)?;
    let s = core::str::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument)?;
    console::print_colored(color as u8, s);
    Ok(s.len() as i32)
}
