//! Path resolution: split on `/`, walk component by component from either
//! the root or a process's current working directory (§4.9, teacher's
//! `namex`/`skipelem`).

use crate::block::io::BlockIo;
use crate::error::{KernelError, KResult};
use crate::param::ROOT_INODE;

use super::dir;
use super::inode::{ICache, InodeType};

/// Splits the first `/`-delimited component off `path`, skipping any
/// leading or trailing run of slashes. Returns `None` once nothing is
/// left.
fn skip_elem(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = path.iter().position(|&c| c != b'/')?;
    let rest = &path[start..];
    let len = rest.iter().position(|&c| c == b'/').unwrap_or(rest.len());
    let name = &rest[..len];
    let after = &rest[len..];
    let next_start = after.iter().position(|&c| c != b'/').unwrap_or(after.len());
    Some((&after[next_start..], name))
}

fn is_absolute(path: &[u8]) -> bool {
    path.first() == Some(&b'/')
}

/// Resolves `path` to an inode slot, bumping its cache ref count on
/// success. `cwd_inumber` anchors relative lookups; ignored for absolute
/// paths.
///
/// When `stop_before_last` is set, resolution stops one component short
/// and returns `(parent_slot, last_component)` instead — used by `create`
/// and `unlink`, which need the containing directory rather than the
/// target itself.
pub fn resolve(
    icache: &ICache,
    io: &BlockIo,
    cwd_inumber: u32,
    path: &[u8],
) -> KResult<usize> {
    let start_inumber = if is_absolute(path) { ROOT_INODE } else { cwd_inumber };
    let mut slot = icache.get(start_inumber)?;
    let mut rest = path;
    loop {
        let Some((next_rest, name)) = skip_elem(rest) else { break };
        rest = next_rest;
        let child_inumber = {
            let mut guard = icache.lock(io, slot)?;
            if guard.dinode.itype != InodeType::Dir {
                drop(guard);
                icache.put(slot);
                return Err(KernelError::NotADirectory);
            }
            let result = dir::lookup(io, &mut guard.dinode, name);
            icache.flush(io, slot, &guard)?;
            result
        };
        icache.put(slot);
        let child_inumber = match child_inumber {
            Ok((inumber, _idx)) => inumber,
            Err(e) => return Err(e),
        };
        slot = icache.get(child_inumber)?;
    }
    Ok(slot)
}

/// Resolves everything but the final component, returning the parent
/// directory's slot together with the final component's bytes.
pub fn resolve_parent<'a>(
    icache: &ICache,
    io: &BlockIo,
    cwd_inumber: u32,
    path: &'a [u8],
) -> KResult<(usize, &'a [u8])> {
    let start_inumber = if is_absolute(path) { ROOT_INODE } else { cwd_inumber };
    let mut slot = icache.get(start_inumber)?;
    let mut rest = path;
    loop {
        let Some((next_rest, name)) = skip_elem(rest) else {
            return Err(KernelError::InvalidArgument);
        };
        if skip_elem(next_rest).is_none() {
            return Ok((slot, name));
        }
        let child_inumber = {
            let mut guard = icache.lock(io, slot)?;
            if guard.dinode.itype != InodeType::Dir {
                drop(guard);
                icache.put(slot);
                return Err(KernelError::NotADirectory);
            }
            let result = dir::lookup(io, &mut guard.dinode, name);
            icache.flush(io, slot, &guard)?;
            result
        };
        icache.put(slot);
        let child_inumber = child_inumber?.0;
        slot = icache.get(child_inumber)?;
        rest = next_rest;
    }
}

/// Reconstructs an absolute path for `cwd_inumber` by walking `..` links up
/// to the root, looking up each step's own name in its parent along the
/// way. Writes into `buf` back-to-front since the length isn't known until
/// the walk reaches the root, then shifts the result to the front.
pub fn getcwd(icache: &ICache, io: &BlockIo, cwd_inumber: u32, buf: &mut [u8]) -> KResult<usize> {
    if buf.len() < 2 {
        return Err(KernelError::InvalidArgument);
    }
    if cwd_inumber == ROOT_INODE {
        buf[0] = b'/';
        return Ok(1);
    }

    let mut write_pos = buf.len();
    let mut current = cwd_inumber;
    loop {
        let slot = icache.get(current)?;
        let (parent_inumber, name) = {
            let mut guard = icache.lock(io, slot)?;
            let parent_result = dir::lookup(io, &mut guard.dinode, b"..");
            let parent_inumber = match parent_result {
                Ok((inumber, _)) => inumber,
                Err(e) => {
                    drop(guard);
                    icache.put(slot);
                    return Err(e);
                }
            };
            let parent_slot = icache.get(parent_inumber)?;
            let name = {
                let mut parent_guard = icache.lock(io, parent_slot)?;
                dir::name_of(io, &mut parent_guard.dinode, current)?
            };
            icache.put(parent_slot);
            (parent_inumber, name)
        };
        icache.put(slot);
        let name = name.ok_or(KernelError::NotFound)?;
        let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        if write_pos < len + 1 {
            return Err(KernelError::InvalidArgument);
        }
        write_pos -= len;
        buf[write_pos..write_pos + len].copy_from_slice(&name[..len]);
        write_pos -= 1;
        buf[write_pos] = b'/';
        if parent_inumber == ROOT_INODE {
            break;
        }
        current = parent_inumber;
    }
    let total = buf.len() - write_pos;
    buf.copy_within(write_pos.., 0);
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_elem_splits_components() {
        assert_eq!(skip_elem(b"a/bb/c"), Some((&b"bb/c"[..], &b"a"[..])));
        assert_eq!(skip_elem(b"///a//bb"), Some((&b"bb"[..], &b"a"[..])));
        assert_eq!(skip_elem(b"a"), Some((&b""[..], &b"a"[..])));
        assert_eq!(skip_elem(b""), None);
        assert_eq!(skip_elem(b"////"), None);
    }

    #[test]
    fn is_absolute_checks_leading_slash() {
        assert!(is_absolute(b"/a/b"));
        assert!(!is_absolute(b"a/b"));
    }
}
