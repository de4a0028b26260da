//! Readiness-driven I/O scheduling.
//!
//! One tick polls every open fd in the registry, drains readable fds into
//! the readers' rings (client data passes through the control scrubber
//! first), then drains non-empty rings back out to their fds. Reads
//! precede fan-out which precedes writes, so a byte read from a console
//! reaches a subscriber's fd no earlier than the next tick.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::control;
use crate::link::close;
use crate::obj::{Aux, ObjKind};
use crate::registry::{ObjId, Registry};
use crate::ring::DEFAULT_CAP;
use crate::timestr;
use crate::{Error, Result};

const READ_BUF: usize = DEFAULT_CAP - 1;

pub struct Engine {
    timeout: Duration,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_millis(500))
    }

    /// `timeout` bounds the readiness wait so signal flags and idle
    /// policy are serviced promptly.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs one tick. Returns whether the external wake fd was readable.
    pub fn tick(&self, reg: &mut Registry, wake: Option<RawFd>) -> Result<bool> {
        let mut ids: Vec<ObjId> = Vec::new();
        let mut pfds: Vec<libc::pollfd> = Vec::new();

        for (id, obj) in reg.iter() {
            let Some(fd) = obj.fd() else { continue };
            let mut events: libc::c_short = 0;
            if obj.kind() != ObjKind::LogFile {
                events |= libc::POLLIN;
            }
            {
                let ring = obj.lock_ring()?;
                if !ring.is_empty() || ring.eof() {
                    events |= libc::POLLOUT;
                }
            }
            if events != 0 {
                ids.push(id);
                pfds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
            }
        }
        if let Some(fd) = wake {
            pfds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }
        if pfds.is_empty() {
            std::thread::sleep(self.timeout);
            return Ok(false);
        }

        let rc = unsafe {
            libc::poll(
                pfds.as_mut_ptr(),
                pfds.len() as libc::nfds_t,
                self.timeout.as_millis() as libc::c_int,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(false);
            }
            return Err(Error::Io(err));
        }
        if rc == 0 {
            return Ok(false);
        }

        for (i, id) in ids.iter().enumerate() {
            let wants_read = pfds[i].events & libc::POLLIN != 0;
            let readable =
                pfds[i].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0;
            if wants_read && readable {
                read_obj(reg, *id)?;
            }
        }
        for (i, id) in ids.iter().enumerate() {
            if pfds[i].revents & libc::POLLOUT != 0 {
                write_obj(reg, *id)?;
            }
        }

        let wake_ready = wake.is_some()
            && pfds
                .last()
                .map(|pfd| pfd.revents & libc::POLLIN != 0)
                .unwrap_or(false);
        Ok(wake_ready)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains a readable fd and fans the payload out to every reader's ring.
fn read_obj(reg: &mut Registry, id: ObjId) -> Result<()> {
    let (fd, is_client) = match reg.get(id) {
        Some(obj) => match obj.fd() {
            Some(fd) => (fd, obj.kind() == ObjKind::Client),
            None => return Ok(()),
        },
        None => return Ok(()),
    };

    let mut buf = [0u8; READ_BUF];
    let n = loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            break n as usize;
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EINTR => continue,
            Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                return Ok(())
            }
            _ => return Err(Error::Io(err)),
        }
    };
    if n == 0 {
        return close(reg, id);
    }

    let mut len = n;
    if is_client {
        let now = timestr::now()?;
        if let Some(obj) = reg.get_mut(id) {
            obj.touch_last_read(now);
            if let Aux::Client(aux) = &mut obj.aux {
                control::scrub(&mut aux.control, &mut buf[..n], &mut len);
            }
        }
    }
    if len == 0 {
        return Ok(());
    }

    let readers = match reg.get(id) {
        Some(obj) => obj.readers().to_vec(),
        None => return Ok(()),
    };
    for r in readers {
        if let Some(reader) = reg.get(r) {
            match reader.write_in(&buf[..len]) {
                Ok(_) | Err(Error::Closed) => {}
                Err(err) => return Err(err),
            }
        }
    }
    Ok(())
}

/// Drains an object's ring to its fd, completing a deferred close once
/// the ring runs dry.
fn write_obj(reg: &mut Registry, id: ObjId) -> Result<()> {
    let finished = {
        let obj = match reg.get(id) {
            Some(obj) => obj,
            None => return Ok(()),
        };
        let fd = match obj.fd() {
            Some(fd) => fd,
            None => return Ok(()),
        };
        let mut ring = obj.lock_ring()?;
        ring.drain(fd)?;
        ring.eof() && ring.is_empty()
    };
    if finished {
        close(reg, id)?;
    }
    Ok(())
}
