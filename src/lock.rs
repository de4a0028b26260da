//! Advisory record locks on the configuration file.
//!
//! A running daemon holds a read lock on its config for its whole
//! lifetime. Because a write lock would be blocked by any read lock,
//! probing with `F_GETLK`/`F_WRLCK` both detects a running instance and
//! reveals its pid, which is how `-k` finds the daemon to signal.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use crate::{Error, Result};

fn flock_template(kind: libc::c_short) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;
    fl
}

/// Pid of the process whose lock would block a write lock, if any.
pub fn write_lock_holder(file: &File) -> Result<Option<i32>> {
    let mut fl = flock_template(libc::F_WRLCK as libc::c_short);
    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETLK, &mut fl) } < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    if fl.l_type == libc::F_UNLCK as libc::c_short {
        return Ok(None);
    }
    Ok(Some(fl.l_pid as i32))
}

/// Takes a non-blocking read lock; `false` means another process holds a
/// conflicting lock.
pub fn acquire_read_lock(file: &File) -> Result<bool> {
    let fl = flock_template(libc::F_RDLCK as libc::c_short);
    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EACCES || code == libc::EAGAIN => Ok(false),
        _ => Err(Error::Io(err)),
    }
}
