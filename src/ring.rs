//! Bounded circular byte buffer with producer-overwrites-consumer semantics.
//!
//! Each object in the graph owns one ring. A slow or stalled consumer never
//! blocks the producer: when a payload does not fit, the oldest unconsumed
//! bytes are overwritten and the read cursor is advanced past them. The ring
//! is empty when `in_ == out`, so at most `capacity - 1` bytes are usable.

use std::os::unix::io::RawFd;

use crate::{Error, Result};

pub const DEFAULT_CAP: usize = 4096;

/// Outcome of a `push`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Push {
    /// Bytes admitted (the requested length, bounded by `capacity - 1`).
    pub written: usize,
    /// Bytes of the request that displaced unconsumed data (or were never
    /// stored because the request exceeded the usable capacity).
    pub overwrote: usize,
}

/// Outcome of a `drain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Bytes written to the fd (zero when the ring was empty).
    Written(usize),
    /// The fd would block; ring state unchanged.
    WouldBlock,
    /// The peer is gone (`EPIPE`); `eof` is now set and the ring is empty.
    Eof,
}

pub struct Ring {
    buf: Box<[u8]>,
    in_: usize,
    out: usize,
    eof: bool,
}

impl Ring {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAP)
    }

    pub fn with_capacity(cap: usize) -> Self {
        assert!(cap >= 2, "ring needs room for at least one byte");
        Self {
            buf: vec![0u8; cap].into_boxed_slice(),
            in_: 0,
            out: 0,
            eof: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        let cap = self.buf.len();
        (self.in_ + cap - self.out) % cap
    }

    pub fn is_empty(&self) -> bool {
        self.in_ == self.out
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    pub fn clear_eof(&mut self) {
        self.eof = false;
    }

    /// Admits `src` into the ring without ever blocking.
    ///
    /// If `src` exceeds the free space, the oldest unconsumed bytes are
    /// overwritten; after the copy the ring holds the last `capacity - 1`
    /// bytes of the logical stream. Fails with `Closed` once `eof` is set.
    pub fn push(&mut self, src: &[u8]) -> Result<Push> {
        if self.eof {
            return Err(Error::Closed);
        }
        if src.is_empty() {
            return Ok(Push {
                written: 0,
                overwrote: 0,
            });
        }

        let cap = self.buf.len();
        let usable = cap - 1;
        let free = usable - self.len();

        // Only the tail of an oversized payload can survive.
        let keep = if src.len() > usable {
            &src[src.len() - usable..]
        } else {
            src
        };

        let first = keep.len().min(cap - self.in_);
        self.buf[self.in_..self.in_ + first].copy_from_slice(&keep[..first]);
        self.in_ = (self.in_ + first) % cap;
        let rest = keep.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&keep[first..]);
            self.in_ = rest;
        }

        let overwrote = src.len().saturating_sub(free);
        if overwrote > 0 {
            self.out = (self.in_ + 1) % cap;
        }

        Ok(Push {
            written: keep.len(),
            overwrote,
        })
    }

    /// Writes the contiguous prefix of buffered data to `fd`.
    ///
    /// One `write(2)` per call; data that wraps past the end of the buffer
    /// is written on the next invocation. Retries `EINTR`. `EPIPE` sets
    /// `eof` and empties the ring. `EAGAIN`/`EWOULDBLOCK` leaves state
    /// unchanged. Any other error is fatal.
    pub fn drain(&mut self, fd: RawFd) -> Result<Drain> {
        let cap = self.buf.len();
        let avail = if self.in_ >= self.out {
            self.in_ - self.out
        } else {
            cap - self.out
        };
        if avail == 0 {
            return Ok(Drain::Written(0));
        }

        loop {
            let n = unsafe {
                libc::write(
                    fd,
                    self.buf[self.out..].as_ptr() as *const libc::c_void,
                    avail,
                )
            };
            if n >= 0 {
                self.out += n as usize;
                if self.out == cap {
                    self.out = 0;
                }
                return Ok(Drain::Written(n as usize));
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::EINTR => continue,
                Some(code) if code == libc::EPIPE => {
                    self.eof = true;
                    self.in_ = 0;
                    self.out = 0;
                    return Ok(Drain::Eof);
                }
                Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                    return Ok(Drain::WouldBlock)
                }
                _ => return Err(Error::Io(err)),
            }
        }
    }

    /// Copies out the buffered bytes in FIFO order without consuming them.
    pub fn contents(&self) -> Vec<u8> {
        let cap = self.buf.len();
        let mut v = Vec::with_capacity(self.len());
        let mut at = self.out;
        while at != self.in_ {
            v.push(self.buf[at]);
            at = (at + 1) % cap;
        }
        v
    }
}

impl Default for Ring {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn starts_empty() {
        let ring = Ring::with_capacity(16);
        assert!(ring.is_empty());
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.capacity(), 16);
    }

    #[test]
    fn push_drain_round_trip() {
        let mut ring = Ring::with_capacity(64);
        let outcome = ring.push(b"hello\n").expect("push");
        assert_eq!(outcome.written, 6);
        assert_eq!(outcome.overwrote, 0);
        assert_eq!(ring.len(), 6);

        let mut file = tempfile::tempfile().expect("tempfile");
        match ring.drain(file.as_raw_fd()).expect("drain") {
            Drain::Written(n) => assert_eq!(n, 6),
            other => panic!("unexpected drain outcome: {other:?}"),
        }
        assert!(ring.is_empty());

        file.seek(SeekFrom::Start(0)).expect("seek");
        let mut got = Vec::new();
        file.read_to_end(&mut got).expect("read back");
        assert_eq!(got, b"hello\n");
    }

    #[test]
    fn wrapped_data_takes_two_drains() {
        let mut ring = Ring::with_capacity(8);
        ring.push(b"abcdef").expect("push");
        let mut file = tempfile::tempfile().expect("tempfile");
        ring.drain(file.as_raw_fd()).expect("drain");
        assert!(ring.is_empty());

        // Cursors sit at 6; this payload wraps.
        ring.push(b"wxyz").expect("push");
        assert_eq!(ring.len(), 4);
        match ring.drain(file.as_raw_fd()).expect("first drain") {
            Drain::Written(n) => assert_eq!(n, 2),
            other => panic!("unexpected drain outcome: {other:?}"),
        }
        match ring.drain(file.as_raw_fd()).expect("second drain") {
            Drain::Written(n) => assert_eq!(n, 2),
            other => panic!("unexpected drain outcome: {other:?}"),
        }
        assert!(ring.is_empty());

        file.seek(SeekFrom::Start(0)).expect("seek");
        let mut got = Vec::new();
        file.read_to_end(&mut got).expect("read back");
        assert_eq!(got, b"abcdefwxyz");
    }

    #[test]
    fn oversized_push_keeps_tail() {
        let mut ring = Ring::with_capacity(16);
        let input = b"0123456789abcdef0123456789abcdef01234567";
        let outcome = ring.push(input).expect("push");
        assert_eq!(outcome.written, 15);
        assert_eq!(outcome.overwrote, 25);
        assert_eq!(ring.contents(), b"9abcdef01234567");
    }

    #[test]
    fn repeated_pushes_keep_last_cap_minus_one() {
        let mut ring = Ring::with_capacity(16);
        let input = b"0123456789abcdef0123456789abcdef01234567";
        let mut overwrote = 0;
        for chunk in input.chunks(7) {
            overwrote += ring.push(chunk).expect("push").overwrote;
        }
        assert_eq!(overwrote, 25);
        assert_eq!(ring.contents(), b"9abcdef01234567");
    }

    #[test]
    fn push_after_eof_is_closed() {
        let mut ring = Ring::with_capacity(16);
        ring.set_eof();
        match ring.push(b"x") {
            Err(Error::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn epipe_sets_eof_and_empties() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { libc::close(fds[0]) };

        // SIGPIPE must not kill the test process.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

        let mut ring = Ring::with_capacity(16);
        ring.push(b"doomed").expect("push");
        match ring.drain(fds[1]).expect("drain") {
            Drain::Eof => {}
            other => panic!("expected Eof, got {other:?}"),
        }
        assert!(ring.eof());
        assert!(ring.is_empty());
        unsafe { libc::close(fds[1]) };
    }

    #[test]
    fn drain_empty_writes_nothing() {
        let mut ring = Ring::with_capacity(16);
        let file = tempfile::tempfile().expect("tempfile");
        match ring.drain(file.as_raw_fd()).expect("drain") {
            Drain::Written(0) => {}
            other => panic!("expected Written(0), got {other:?}"),
        }
    }

    #[test]
    fn cursor_bounds_hold() {
        let mut ring = Ring::with_capacity(8);
        let file = tempfile::tempfile().expect("tempfile");
        for round in 0..50 {
            ring.push(&[round as u8; 5]).expect("push");
            ring.drain(file.as_raw_fd()).expect("drain");
            assert!(ring.len() < ring.capacity());
        }
    }
}
