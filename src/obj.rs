//! Typed endpoints of the data-flow graph.
//!
//! An object owns one file descriptor, one ring buffer, an optional back
//! reference to its writer, and forward references to its readers. Console
//! and log-file objects are created inactive and persist until daemon
//! shutdown; client objects are born active (their fd is an accepted
//! connection) and are destroyed when closed.

use std::cmp::Ordering;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::control::ControlState;
use crate::opener::Opener;
use crate::registry::{ObjId, Registry};
use crate::ring::Ring;
use crate::timestr;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjKind {
    Console,
    LogFile,
    Client,
}

impl ObjKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjKind::Console => "console",
            ObjKind::LogFile => "logfile",
            ObjKind::Client => "client",
        }
    }
}

pub struct ConsoleAux {
    pub dev: String,
    pub bps: u32,
    pub rst: Option<String>,
}

pub struct ClientAux {
    pub control: ControlState,
    pub time_last_read: SystemTime,
}

pub enum Aux {
    Console(ConsoleAux),
    LogFile,
    Client(ClientAux),
}

pub struct Obj {
    pub(crate) name: String,
    pub(crate) aux: Aux,
    pub(crate) fd: Option<OwnedFd>,
    pub(crate) ring: Mutex<Ring>,
    pub(crate) writer: Option<ObjId>,
    pub(crate) readers: Vec<ObjId>,
}

impl Obj {
    fn new(name: String, aux: Aux, fd: Option<OwnedFd>) -> Self {
        Self {
            name,
            aux,
            fd,
            ring: Mutex::new(Ring::new()),
            writer: None,
            readers: Vec::new(),
        }
    }

    /// Creates an inactive console endpoint.
    pub fn console(name: &str, dev: &str, bps: u32, rst: Option<String>) -> Self {
        debug_assert!(!name.is_empty());
        debug_assert!(!dev.is_empty());
        Self::new(
            name.to_string(),
            Aux::Console(ConsoleAux {
                dev: dev.to_string(),
                bps,
                rst,
            }),
            None,
        )
    }

    /// Creates an inactive log-file endpoint; the name is the log path.
    pub fn logfile(name: &str) -> Self {
        debug_assert!(!name.is_empty());
        Self::new(name.to_string(), Aux::LogFile, None)
    }

    /// Creates an active client endpoint named `user@host`.
    pub fn client(user: &str, host: &str, fd: OwnedFd) -> Result<Self> {
        let now = timestr::now()?;
        Ok(Self::new(
            format!("{user}@{host}"),
            Aux::Client(ClientAux {
                control: ControlState::default(),
                time_last_read: now,
            }),
            Some(fd),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ObjKind {
        match self.aux {
            Aux::Console(_) => ObjKind::Console,
            Aux::LogFile => ObjKind::LogFile,
            Aux::Client(_) => ObjKind::Client,
        }
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn writer(&self) -> Option<ObjId> {
        self.writer
    }

    pub fn readers(&self) -> &[ObjId] {
        &self.readers
    }

    pub fn ring(&self) -> &Mutex<Ring> {
        &self.ring
    }

    pub(crate) fn lock_ring(&self) -> Result<MutexGuard<'_, Ring>> {
        self.ring
            .lock()
            .map_err(|_| Error::Internal("ring lock poisoned"))
    }

    /// Admits bytes into this object's ring, logging the overwrite
    /// diagnostic when unconsumed data is displaced.
    pub fn write_in(&self, src: &[u8]) -> Result<usize> {
        let outcome = self.lock_ring()?.push(src)?;
        if outcome.overwrote > 0 {
            log::debug!("[{}] overwrote {} bytes", self.name, outcome.overwrote);
        }
        Ok(outcome.written)
    }

    /// Lexicographic name order; used for stable listings.
    pub fn cmp_name(&self, other: &Obj) -> Ordering {
        self.name.cmp(&other.name)
    }

    pub fn last_read(&self) -> Option<SystemTime> {
        match &self.aux {
            Aux::Client(aux) => Some(aux.time_last_read),
            _ => None,
        }
    }

    pub(crate) fn touch_last_read(&mut self, at: SystemTime) {
        if let Aux::Client(aux) = &mut self.aux {
            aux.time_last_read = at;
        }
    }

    pub(crate) fn close_fd(&mut self) {
        // Dropping the OwnedFd closes it; repeated calls are a no-op.
        self.fd.take();
    }
}

/// Activates an object; already-open objects return success.
///
/// Log files open create+append+nonblock (truncated first when
/// `zero_logs`) and admit their header line into their own ring. Consoles
/// delegate transport attachment to the `Opener` capability. Clients are
/// born open.
pub fn open_obj(
    reg: &mut Registry,
    id: ObjId,
    opener: &dyn Opener,
    zero_logs: bool,
) -> Result<()> {
    let obj = reg
        .get(id)
        .ok_or(Error::Internal("open of destroyed object"))?;
    if obj.is_open() {
        return Ok(());
    }

    match &obj.aux {
        Aux::Console(aux) => {
            let fd = opener.open(aux)?;
            if let Some(obj) = reg.get_mut(id) {
                obj.fd = Some(fd);
            }
            Ok(())
        }
        Aux::LogFile => {
            let writer_name = obj
                .writer
                .and_then(|w| reg.get(w))
                .map(|w| w.name.clone())
                .ok_or(Error::Internal("logfile opened without a console writer"))?;
            let path = obj.name.clone();

            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .append(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&path)
                .map_err(|err| Error::OpenFailed(format!("log \"{path}\": {err}")))?;
            if zero_logs {
                file.set_len(0)
                    .map_err(|err| Error::OpenFailed(format!("log \"{path}\": {err}")))?;
            }

            let header = format!(
                "* Console [{}] log started on {}.\n\n",
                writer_name,
                timestr::now_string()?
            );
            let obj = reg
                .get_mut(id)
                .ok_or(Error::Internal("open of destroyed object"))?;
            obj.write_in(header.as_bytes())?;
            obj.fd = Some(OwnedFd::from(file));
            Ok(())
        }
        Aux::Client(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_fds() -> (OwnedFd, OwnedFd) {
        use std::os::unix::io::FromRawFd;
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn console_starts_inactive() {
        let obj = Obj::console("web4", "/dev/ttyS0", 9600, None);
        assert_eq!(obj.kind(), ObjKind::Console);
        assert!(!obj.is_open());
        assert!(obj.writer().is_none());
        assert!(obj.readers().is_empty());
    }

    #[test]
    fn client_name_is_user_at_host() {
        let (r, _w) = pipe_fds();
        let obj = Obj::client("dun", "mgmt1", r).expect("client");
        assert_eq!(obj.name(), "dun@mgmt1");
        assert_eq!(obj.kind(), ObjKind::Client);
        assert!(obj.is_open());
        assert!(obj.last_read().is_some());
    }

    #[test]
    fn write_in_reports_admitted_bytes() {
        let obj = Obj::logfile("/tmp/x.log");
        assert_eq!(obj.write_in(b"hello").expect("write_in"), 5);
        assert_eq!(
            obj.ring().lock().expect("ring").contents(),
            b"hello".to_vec()
        );
    }

    #[test]
    fn name_ordering_is_lexicographic() {
        let a = Obj::logfile("alpha");
        let b = Obj::logfile("beta");
        assert_eq!(a.cmp_name(&b), Ordering::Less);
        assert_eq!(b.cmp_name(&a), Ordering::Greater);
    }

    #[test]
    fn close_fd_is_idempotent() {
        let (r, w) = pipe_fds();
        drop(w);
        let mut obj = Obj::client("u", "h", r).expect("client");
        obj.close_fd();
        assert!(!obj.is_open());
        obj.close_fd();
        assert!(!obj.is_open());
    }
}
