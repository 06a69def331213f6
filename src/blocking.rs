//! Blocking-I/O helpers over non-blocking descriptors (spec §4.2).
//!
//! Every helper is bounded by a busy-timeout drawn from the session options
//! and retried locally on EINTR/EWOULDBLOCK; a timeout or any other error is
//! terminal for the helper (and the caller surfaces it as a negotiation or
//! session failure).

use std::io::{Read, Write};
use std::os::unix::io::RawFd;

use crate::poll::{PollSet, WaitOutcome};

const MAX_LINE: usize = 512;

/// Write the full buffer to `fd`, looping on poll-for-write + a single
/// `write(2)` retrying EINTR/EWOULDBLOCK, bounded by `busy_timeout`.
pub fn write_all(fd: RawFd, mut stream: impl Write, buf: &[u8], busy_timeout: f64) -> std::io::Result<()> {
    let mut written = 0;
    let mut poll = PollSet::new();
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write_all: peer closed for writing",
                ))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                poll.zero();
                poll.add(fd, false, true);
                match poll.wait(busy_timeout)? {
                    WaitOutcome::Timeout => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "write_all: busy timeout",
                        ))
                    }
                    WaitOutcome::Ready(_) => continue,
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes from `fd`. EOF before the buffer is full
/// is a failure.
pub fn read_exact(fd: RawFd, mut stream: impl Read, buf: &mut [u8], busy_timeout: f64) -> std::io::Result<()> {
    let mut filled = 0;
    let mut poll = PollSet::new();
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "read_exact: EOF before length",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                poll.zero();
                poll.add(fd, true, false);
                match poll.wait(busy_timeout)? {
                    WaitOutcome::Timeout => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "read_exact: busy timeout",
                        ))
                    }
                    WaitOutcome::Ready(_) => continue,
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Format one line (bounded length), append CRLF, write it, and log it.
/// Fails if the formatted line would exceed `MAX_LINE`.
pub fn write_line(fd: RawFd, stream: impl Write, line: &str, busy_timeout: f64) -> std::io::Result<()> {
    if line.len() + 2 > MAX_LINE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "write_line: line too long",
        ));
    }
    let mut out = Vec::with_capacity(line.len() + 2);
    out.extend_from_slice(line.as_bytes());
    out.extend_from_slice(b"\r\n");
    write_all(fd, stream, &out, busy_timeout)?;
    tracing::debug!(line, "-> sent line");
    Ok(())
}

/// Read a single line, byte at a time, stopping at LF (CR immediately
/// preceding LF is stripped). Bounded by `MAX_LINE` and `busy_timeout`.
pub fn read_line(fd: RawFd, mut stream: impl Read, busy_timeout: f64) -> std::io::Result<String> {
    let mut line = Vec::with_capacity(64);
    let mut poll = PollSet::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "read_line: EOF before LF",
                ))
            }
            Ok(_) => {
                if byte[0] == b'\n' {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    break;
                }
                if line.len() >= MAX_LINE {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "read_line: line too long",
                    ));
                }
                line.push(byte[0]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                poll.zero();
                poll.add(fd, true, false);
                match poll.wait(busy_timeout)? {
                    WaitOutcome::Timeout => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "read_line: busy timeout",
                        ))
                    }
                    WaitOutcome::Ready(_) => continue,
                }
            }
            Err(e) => return Err(e),
        }
    }
    let text = String::from_utf8_lossy(&line).into_owned();
    tracing::debug!(line = %text, "<- received line");
    Ok(text)
}

/// Match `line` against a literal prefix, retrying once with both sides
/// lowercased if the first match fails (spec §4.2: "tolerates servers that
/// lowercase verbs").
pub fn starts_with_ci_retry(line: &str, prefix: &str) -> bool {
    if line.starts_with(prefix) {
        return true;
    }
    line.to_ascii_lowercase().starts_with(&prefix.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn write_then_read_line_roundtrip() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        write_line(a.as_raw_fd(), &a, "220 hello", 1.0).unwrap();
        let line = read_line(b.as_raw_fd(), &b, 1.0).unwrap();
        assert_eq!(line, "220 hello");
    }

    #[test]
    fn read_exact_fails_on_early_eof() {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        drop(a);
        let mut buf = [0u8; 4];
        let err = read_exact(b.as_raw_fd(), &b, &mut buf, 1.0).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn case_insensitive_retry_matches_lowercase() {
        assert!(starts_with_ci_retry("250 ok", "250 "));
        assert!(starts_with_ci_retry("starttls", "STARTTLS"));
        assert!(!starts_with_ci_retry("554 no", "220 "));
    }

    #[test]
    fn write_all_eventually_times_out_when_peer_never_drains() {
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let chunk = vec![0u8; 1 << 20];
        let mut last = Ok(());
        for _ in 0..8 {
            last = write_all(a.as_raw_fd(), &a, &chunk, 0.05);
            if last.is_err() {
                break;
            }
        }
        assert_eq!(last.unwrap_err().kind(), std::io::ErrorKind::TimedOut);
    }
}
