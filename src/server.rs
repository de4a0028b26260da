//! Daemon assembly: listener, signal flags, engine loop, shutdown.
//!
//! The engine tick is the only blocking point; the listener fd rides
//! along in the same poll set as the external wake fd. Accepted
//! connections become client objects; the wire protocol that names the
//! user and requests a console attach is layered on top of this loop.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGTERM};
use signal_hook::flag;

use crate::conf::ServerConf;
use crate::engine::Engine;
use crate::link;
use crate::obj::{Obj, ObjKind};
use crate::registry::Registry;
use crate::timestr;
use crate::{Error, Result};

/// Extra ticks spent flushing non-empty rings during shutdown.
const SHUTDOWN_DRAIN_TICKS: usize = 8;

pub struct Server {
    conf: ServerConf,
    reg: Registry,
    engine: Engine,
    listener: TcpListener,
    term: Arc<AtomicBool>,
    hup: Arc<AtomicBool>,
}

impl Server {
    pub fn new(conf: ServerConf, reg: Registry) -> Result<Self> {
        let bind_ip = if conf.loopback {
            Ipv4Addr::LOCALHOST
        } else {
            Ipv4Addr::UNSPECIFIED
        };
        let addr = SocketAddr::from((bind_ip, conf.port));
        let listener = TcpListener::bind(addr)
            .map_err(|err| Error::Config(format!("unable to bind {addr}: {err}")))?;
        listener.set_nonblocking(true)?;

        // Broken-pipe errors must surface as EPIPE from write, not a signal.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

        let term = Arc::new(AtomicBool::new(false));
        let hup = Arc::new(AtomicBool::new(false));
        flag::register(SIGTERM, Arc::clone(&term))?;
        flag::register(SIGHUP, Arc::clone(&hup))?;

        Ok(Self {
            conf,
            reg,
            engine: Engine::new(),
            listener,
            term,
            hup,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.reg
    }

    pub fn run(&mut self) -> Result<()> {
        log::info!(
            "listening on {} (configuration \"{}\")",
            self.listener.local_addr()?,
            self.conf.filename.display()
        );

        while !self.term.load(Ordering::Relaxed) {
            if self.hup.swap(false, Ordering::Relaxed) {
                log::info!("SIGHUP received; configuration reload not yet implemented");
            }
            let accept_ready = self
                .engine
                .tick(&mut self.reg, Some(self.listener.as_raw_fd()))?;
            if accept_ready {
                self.accept_clients()?;
            }
            self.sweep_idle()?;
        }
        self.shutdown()
    }

    fn accept_clients(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(true)?;
                    if self.conf.keepalive {
                        set_keepalive(stream.as_raw_fd());
                    }
                    // The wire protocol supplies the real user later; the
                    // peer address keeps the synthetic name unique.
                    let client =
                        Obj::client("unknown", &peer.to_string(), OwnedFd::from(stream))?;
                    let name = client.name().to_string();
                    match self.reg.insert(client) {
                        Ok(_) => log::info!("[{name}] connected"),
                        Err(err) => log::warn!("rejected connection from {peer}: {err}"),
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::warn!("accept failed: {err}");
                    return Ok(());
                }
            }
        }
    }

    fn sweep_idle(&mut self) -> Result<()> {
        let Some(limit) = self.conf.idle_timeout else {
            return Ok(());
        };
        let now = timestr::now()?;
        let idle: Vec<_> = self
            .reg
            .iter()
            .filter(|(_, obj)| obj.kind() == ObjKind::Client)
            .filter(|(_, obj)| {
                obj.last_read()
                    .and_then(|at| now.duration_since(at).ok())
                    .map(|elapsed| elapsed > limit)
                    .unwrap_or(false)
            })
            .map(|(id, obj)| (id, obj.name().to_string()))
            .collect();
        for (id, name) in idle {
            log::info!("[{name}] closed after idle timeout");
            link::close(&mut self.reg, id)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        log::info!("SIGTERM received; shutting down");
        for id in self.reg.ids() {
            link::close(&mut self.reg, id)?;
        }
        for _ in 0..SHUTDOWN_DRAIN_TICKS {
            if !self.has_pending_output()? {
                break;
            }
            self.engine.tick(&mut self.reg, None)?;
        }
        Ok(())
    }

    fn has_pending_output(&self) -> Result<bool> {
        for (_, obj) in self.reg.iter() {
            if obj.is_open() && !obj.lock_ring()?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn set_keepalive(fd: libc::c_int) {
    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        log::warn!(
            "unable to enable keepalive: {}",
            std::io::Error::last_os_error()
        );
    }
}
