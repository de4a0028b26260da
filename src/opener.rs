//! Transport attachment for console endpoints.
//!
//! The engine and link manager only ever see file descriptors; how a
//! console's `dev` string becomes an fd is behind this capability so
//! blocking dials can later move to a worker pool without touching the
//! graph.

use std::ffi::CString;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::obj::ConsoleAux;
use crate::{Error, Result};

pub trait Opener {
    fn open(&self, console: &ConsoleAux) -> Result<OwnedFd>;
}

/// Baud rates accepted for `BPS=` and applied by [`TtyOpener`].
pub const SUPPORTED_BAUD: &[u32] = &[
    300, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200,
];

fn baud_constant(bps: u32) -> Option<libc::speed_t> {
    match bps {
        300 => Some(libc::B300),
        1200 => Some(libc::B1200),
        2400 => Some(libc::B2400),
        4800 => Some(libc::B4800),
        9600 => Some(libc::B9600),
        19200 => Some(libc::B19200),
        38400 => Some(libc::B38400),
        57600 => Some(libc::B57600),
        115200 => Some(libc::B115200),
        _ => None,
    }
}

/// Opens a local serial device (or any path) nonblocking; when the target
/// is a tty it is switched to raw mode at the configured baud rate.
pub struct TtyOpener;

impl Opener for TtyOpener {
    fn open(&self, console: &ConsoleAux) -> Result<OwnedFd> {
        let path = CString::new(console.dev.as_bytes())
            .map_err(|_| Error::OpenFailed(format!("\"{}\": embedded NUL", console.dev)))?;
        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_NOCTTY,
            )
        };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            return Err(Error::OpenFailed(format!("\"{}\": {err}", console.dev)));
        }
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        if unsafe { libc::isatty(owned.as_raw_fd()) } == 1 {
            set_raw(owned.as_raw_fd(), console)?;
        }
        Ok(owned)
    }
}

fn set_raw(fd: RawFd, console: &ConsoleAux) -> Result<()> {
    let speed = baud_constant(console.bps).ok_or_else(|| {
        Error::OpenFailed(format!(
            "\"{}\": unsupported baud rate {}",
            console.dev, console.bps
        ))
    })?;

    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(fd, &mut tio) } < 0 {
        return Err(Error::OpenFailed(format!(
            "\"{}\": {}",
            console.dev,
            std::io::Error::last_os_error()
        )));
    }
    unsafe {
        libc::cfmakeraw(&mut tio);
        libc::cfsetispeed(&mut tio, speed);
        libc::cfsetospeed(&mut tio, speed);
    }
    tio.c_cflag |= libc::CLOCAL | libc::CREAD;
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } < 0 {
        return Err(Error::OpenFailed(format!(
            "\"{}\": {}",
            console.dev,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}
