//! Writer→readers graph edits.
//!
//! All topology mutation funnels through this module: attaching a data
//! source to a sink (with the steal protocol when the sink is already
//! claimed), detaching, and the drain-then-close teardown that cascades
//! through objects left with neither a writer nor readers.

use crate::obj::{open_obj, ObjKind};
use crate::opener::Opener;
use crate::registry::{ObjId, Registry};
use crate::timestr;
use crate::{Error, Result};

/// Makes `src` write to `dst`.
///
/// If `dst` already has a writer, that edge is stolen: the displaced
/// writer's ring receives an in-band notice and the displaced writer is
/// closed (destroying it once the notice drains, if it is a client). Both
/// endpoints are then activated; an `OpenFailed` from either side rolls
/// the new edge back and propagates, aborting the attach.
pub fn attach(
    reg: &mut Registry,
    src: ObjId,
    dst: ObjId,
    opener: &dyn Opener,
    zero_logs: bool,
) -> Result<()> {
    {
        let (src_obj, dst_obj) = reg
            .get2_mut(src, dst)
            .ok_or(Error::Internal("attach on destroyed object"))?;
        debug_assert!(matches!(
            src_obj.kind(),
            ObjKind::Client | ObjKind::Console
        ));
        debug_assert!(matches!(
            dst_obj.kind(),
            ObjKind::Console | ObjKind::LogFile
        ));
        debug_assert!(
            dst_obj.kind() != ObjKind::Console || src_obj.kind() == ObjKind::Client
        );
        debug_assert!(
            dst_obj.kind() != ObjKind::LogFile || src_obj.kind() == ObjKind::Console
        );
        if dst_obj.writer() == Some(src) {
            return Ok(());
        }
    }

    if let Some(displaced) = reg.get(dst).and_then(|obj| obj.writer()) {
        let dst_name = reg.get(dst).map(|o| o.name().to_string()).unwrap_or_default();
        let src_name = reg.get(src).map(|o| o.name().to_string()).unwrap_or_default();
        let notice = format!(
            "\nConsole '{}' stolen by <{}> at {}.\n",
            dst_name,
            src_name,
            timestr::now_string()?
        );
        if let Some(old) = reg.get(displaced) {
            log::info!("[{}] stolen from [{}]", dst_name, old.name());
            match old.write_in(notice.as_bytes()) {
                Ok(_) | Err(Error::Closed) => {}
                Err(err) => return Err(err),
            }
        }
        close(reg, displaced)?;
    }

    {
        let (src_obj, dst_obj) = reg
            .get2_mut(src, dst)
            .ok_or(Error::Internal("attach on destroyed object"))?;
        dst_obj.writer = Some(src);
        src_obj.readers.push(dst);
    }

    for end in [src, dst] {
        if let Err(err) = open_obj(reg, end, opener, zero_logs) {
            unlink(reg, src, dst);
            return Err(err);
        }
    }
    Ok(())
}

/// Removes `obj` from its writer's readers and clears the back-pointer.
pub fn detach(reg: &mut Registry, id: ObjId) {
    let writer = match reg.get_mut(id) {
        Some(obj) => obj.writer.take(),
        None => return,
    };
    if let Some(w) = writer {
        if let Some(writer_obj) = reg.get_mut(w) {
            writer_obj.readers.retain(|r| *r != id);
        }
    }
}

fn unlink(reg: &mut Registry, src: ObjId, dst: ObjId) {
    if let Some(dst_obj) = reg.get_mut(dst) {
        if dst_obj.writer == Some(src) {
            dst_obj.writer = None;
        }
    }
    if let Some(src_obj) = reg.get_mut(src) {
        src_obj.readers.retain(|r| *r != dst);
    }
}

/// Drain-then-close teardown.
///
/// Unlinks the object from its writer and readers (recursively closing
/// any neighbor left fully orphaned), then either defers (a non-empty
/// ring marks eof and waits for the engine to finish draining) or closes
/// the fd now. Clients are destroyed on close; consoles and log files
/// merely go inactive.
pub fn close(reg: &mut Registry, id: ObjId) -> Result<()> {
    let writer = match reg.get_mut(id) {
        Some(obj) => obj.writer.take(),
        None => return Ok(()),
    };
    if let Some(w) = writer {
        let orphaned = match reg.get_mut(w) {
            Some(writer_obj) => {
                writer_obj.readers.retain(|r| *r != id);
                writer_obj.writer.is_none() && writer_obj.readers.is_empty()
            }
            None => false,
        };
        if orphaned {
            close(reg, w)?;
        }
    }

    loop {
        let reader = match reg.get_mut(id) {
            Some(obj) => obj.readers.pop(),
            None => return Ok(()),
        };
        let Some(r) = reader else { break };
        let cascade = match reg.get_mut(r) {
            Some(reader_obj) => {
                if reader_obj.writer == Some(id) {
                    reader_obj.writer = None;
                    reader_obj.readers.is_empty()
                } else {
                    false
                }
            }
            None => false,
        };
        if cascade {
            close(reg, r)?;
        }
    }

    let destroy = {
        let obj = match reg.get_mut(id) {
            Some(obj) => obj,
            None => return Ok(()),
        };
        let mut ring = obj.lock_ring()?;
        if !ring.is_empty() {
            // The engine finishes draining, then re-invokes close.
            ring.set_eof();
            return Ok(());
        }
        ring.clear_eof();
        drop(ring);
        obj.close_fd();
        obj.kind() == ObjKind::Client
    };
    if destroy {
        if let Some(obj) = reg.remove(id) {
            log::debug!("[{}] destroyed", obj.name());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::Obj;
    use crate::opener::TtyOpener;
    use std::os::unix::io::{FromRawFd, OwnedFd};

    fn pipe_client(reg: &mut Registry, user: &str) -> (ObjId, OwnedFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read, write) = unsafe {
            (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))
        };
        let id = reg
            .insert(Obj::client(user, "host", read).expect("client"))
            .expect("insert client");
        (id, write)
    }

    fn null_console(reg: &mut Registry, name: &str) -> ObjId {
        reg.insert(Obj::console(name, "/dev/null", 9600, None))
            .expect("insert console")
    }

    #[test]
    fn attach_links_both_directions() {
        let mut reg = Registry::new();
        let (client, _w) = pipe_client(&mut reg, "u1");
        let console = null_console(&mut reg, "c1");

        attach(&mut reg, client, console, &TtyOpener, false).expect("attach");

        assert_eq!(reg.get(console).expect("console").writer(), Some(client));
        assert_eq!(reg.get(client).expect("client").readers(), &[console]);
        assert!(reg.get(console).expect("console").is_open());
    }

    #[test]
    fn attach_is_idempotent_for_current_writer() {
        let mut reg = Registry::new();
        let (client, _w) = pipe_client(&mut reg, "u1");
        let console = null_console(&mut reg, "c1");

        attach(&mut reg, client, console, &TtyOpener, false).expect("attach");
        attach(&mut reg, client, console, &TtyOpener, false).expect("re-attach");

        assert_eq!(reg.get(client).expect("client").readers(), &[console]);
    }

    #[test]
    fn steal_notices_and_closes_displaced_writer() {
        let mut reg = Registry::new();
        let (a, _wa) = pipe_client(&mut reg, "u1");
        let (b, _wb) = pipe_client(&mut reg, "u2");
        let console = null_console(&mut reg, "c1");

        attach(&mut reg, a, console, &TtyOpener, false).expect("attach a");
        attach(&mut reg, b, console, &TtyOpener, false).expect("attach b");

        assert_eq!(reg.get(console).expect("console").writer(), Some(b));
        // The displaced client holds the notice in its ring with eof set;
        // it is destroyed only after the engine drains it.
        let displaced = reg.get(a).expect("displaced still live");
        let ring = displaced.ring().lock().expect("ring");
        let notice = String::from_utf8(ring.contents()).expect("utf8 notice");
        assert!(notice.starts_with("\nConsole 'c1' stolen by <u2@host> at "));
        assert!(notice.ends_with(".\n"));
        assert!(ring.eof());
    }

    #[test]
    fn steal_preserves_prior_readers() {
        let mut reg = Registry::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("c1.log");
        let (a, _wa) = pipe_client(&mut reg, "u1");
        let (b, _wb) = pipe_client(&mut reg, "u2");
        let console = null_console(&mut reg, "c1");
        let log = reg
            .insert(Obj::logfile(log_path.to_str().expect("path")))
            .expect("insert log");

        attach(&mut reg, console, log, &TtyOpener, false).expect("attach log");
        attach(&mut reg, a, console, &TtyOpener, false).expect("attach a");
        attach(&mut reg, b, console, &TtyOpener, false).expect("attach b");

        assert_eq!(reg.get(console).expect("console").writer(), Some(b));
        assert_eq!(reg.get(log).expect("log").writer(), Some(console));
        assert!(reg
            .get(console)
            .expect("console")
            .readers()
            .contains(&log));
    }

    #[test]
    fn closing_client_detaches_console_but_keeps_log() {
        let mut reg = Registry::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("c1.log");
        let (client, _w) = pipe_client(&mut reg, "u1");
        let console = null_console(&mut reg, "c1");
        let log = reg
            .insert(Obj::logfile(log_path.to_str().expect("path")))
            .expect("insert log");

        attach(&mut reg, console, log, &TtyOpener, false).expect("attach log");
        attach(&mut reg, client, console, &TtyOpener, false).expect("attach client");

        // Drain the client's ring first so close destroys it immediately.
        close(&mut reg, client).expect("close client");

        assert!(reg.get(client).is_none(), "client destroyed");
        let console_obj = reg.get(console).expect("console persists");
        assert_eq!(console_obj.writer(), None);
        assert_eq!(console_obj.readers(), &[log]);
        assert_eq!(reg.get(log).expect("log").writer(), Some(console));
    }

    #[test]
    fn closing_sole_client_of_unwatched_console_cascades() {
        let mut reg = Registry::new();
        let (client, _w) = pipe_client(&mut reg, "u1");
        let console = null_console(&mut reg, "c1");

        attach(&mut reg, client, console, &TtyOpener, false).expect("attach");
        close(&mut reg, client).expect("close");

        assert!(reg.get(client).is_none(), "client destroyed");
        let console_obj = reg.get(console).expect("console persists");
        assert!(!console_obj.is_open(), "console went inactive");
        assert_eq!(console_obj.writer(), None);
        assert!(console_obj.readers().is_empty());
    }

    #[test]
    fn closing_logfile_orphans_and_closes_unwatched_console() {
        let mut reg = Registry::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("c1.log");
        let console = null_console(&mut reg, "c1");
        let log = reg
            .insert(Obj::logfile(log_path.to_str().expect("path")))
            .expect("insert log");

        attach(&mut reg, console, log, &TtyOpener, false).expect("attach log");
        // Flush the header so the log can close without deferring.
        reg.get(log)
            .expect("log")
            .ring()
            .lock()
            .expect("ring")
            .drain(reg.get(log).expect("log").fd().expect("fd"))
            .expect("drain header");

        close(&mut reg, log).expect("close log");

        let console_obj = reg.get(console).expect("console persists");
        assert!(!console_obj.is_open());
        assert!(console_obj.readers().is_empty());
        let log_obj = reg.get(log).expect("log persists");
        assert!(!log_obj.is_open());
        assert_eq!(log_obj.writer(), None);
    }

    #[test]
    fn close_with_pending_data_defers() {
        let mut reg = Registry::new();
        let (client, _w) = pipe_client(&mut reg, "u1");
        reg.get(client)
            .expect("client")
            .write_in(b"pending")
            .expect("write_in");

        close(&mut reg, client).expect("close");

        let obj = reg.get(client).expect("client still live");
        assert!(obj.is_open(), "fd untouched while data is pending");
        assert!(obj.ring().lock().expect("ring").eof());
    }
}
