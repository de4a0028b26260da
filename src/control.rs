//! Client control-byte scrubbing.
//!
//! Applied to data read from a client socket before fan-out. The scrubber
//! is a pure function over the buffer plus a small per-client state struct,
//! so control sequences that straddle a read boundary are resumed on the
//! next buffer. It performs no I/O; side-band requests surface as
//! [`ControlCmd`] values for the link manager to act on.

/// Telnet interpret-as-command escape byte.
pub const IAC: u8 = 0xff;

/// Per-client scrub state, carried across read boundaries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    /// A bare IAC ended the previous buffer.
    pub got_iac: bool,
}

/// Side-band command extracted from a client stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCmd {
    /// Release write privilege on the attached console.
    Detach,
    /// Request write privilege on the named console.
    Attach(String),
    /// Send a message to every client of the attached console.
    Broadcast,
}

/// Removes control sequences from `buf[..*len]` in place, shrinking `*len`.
///
/// `IAC IAC` collapses to one literal `0xff`; `IAC <cmd>` is deleted; a
/// bare trailing `IAC` is held in `state` and consumed by the next call.
/// Payloads containing no `0xff` pass through untouched.
pub fn scrub(state: &mut ControlState, buf: &mut [u8], len: &mut usize) -> Vec<ControlCmd> {
    let cmds = Vec::new();
    let mut w = 0;
    let mut r = 0;

    if state.got_iac && r < *len {
        if buf[r] == IAC {
            buf[w] = IAC;
            w += 1;
        }
        r += 1;
        state.got_iac = false;
    }

    while r < *len {
        if buf[r] != IAC {
            buf[w] = buf[r];
            w += 1;
            r += 1;
            continue;
        }
        if r + 1 == *len {
            // Sequence resumes in the next buffer.
            state.got_iac = true;
            r += 1;
            break;
        }
        if buf[r + 1] == IAC {
            buf[w] = IAC;
            w += 1;
        }
        r += 2;
    }

    *len = w;
    cmds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(state: &mut ControlState, input: &[u8]) -> Vec<u8> {
        let mut buf = input.to_vec();
        let mut len = buf.len();
        scrub(state, &mut buf, &mut len);
        buf.truncate(len);
        buf
    }

    #[test]
    fn clean_payload_is_untouched() {
        let mut state = ControlState::default();
        assert_eq!(run(&mut state, b"make menuconfig\r"), b"make menuconfig\r");
        assert!(!state.got_iac);
    }

    #[test]
    fn doubled_iac_collapses_to_literal() {
        let mut state = ControlState::default();
        assert_eq!(run(&mut state, &[b'a', IAC, IAC, b'b']), &[b'a', IAC, b'b']);
    }

    #[test]
    fn command_byte_is_deleted() {
        let mut state = ControlState::default();
        assert_eq!(run(&mut state, &[b'a', IAC, 0xf4, b'b']), b"ab");
    }

    #[test]
    fn trailing_iac_spans_buffers() {
        let mut state = ControlState::default();
        assert_eq!(run(&mut state, &[b'a', IAC]), b"a");
        assert!(state.got_iac);
        assert_eq!(run(&mut state, &[IAC, b'b']), &[IAC, b'b']);
        assert!(!state.got_iac);
    }

    #[test]
    fn split_command_is_deleted() {
        let mut state = ControlState::default();
        assert_eq!(run(&mut state, &[IAC]), b"");
        assert!(state.got_iac);
        assert_eq!(run(&mut state, &[0xf4, b'x']), b"x");
        assert!(!state.got_iac);
    }

    #[test]
    fn scrub_is_idempotent_without_iac() {
        let mut state = ControlState::default();
        let once = run(&mut state, b"status\n");
        let twice = run(&mut state, &once);
        assert_eq!(once, twice);
    }
}
