//! SMTP / RFC 2487 STARTTLS negotiation. Wire literals are reproduced
//! byte-for-byte from `examples/original_source/protocol.c`.

use super::NegotiationIo;
use crate::blocking::{read_line, starts_with_ci_retry, write_line};
use crate::poll::readable_now;

pub fn client(io: &NegotiationIo) -> Result<(), String> {
    let fd = io.remote.raw_fd();

    // Copy the (possibly multi-line) 220 greeting.
    loop {
        let line = read_line(fd, io.remote, io.busy_timeout).map_err(|e| e.to_string())?;
        write_line(io.local_wfd.raw_fd(), io.local_wfd, &line, io.busy_timeout)
            .map_err(|e| e.to_string())?;
        if !line.starts_with("220-") {
            break;
        }
    }

    write_line(fd, io.remote, "EHLO localhost", io.busy_timeout).map_err(|e| e.to_string())?;
    let mut line;
    loop {
        line = read_line(fd, io.remote, io.busy_timeout).map_err(|e| e.to_string())?;
        if !line.starts_with("250-") {
            break;
        }
    }
    if !starts_with_ci_retry(&line, "250 ") {
        return Err("remote server is not RFC 1425 compliant".into());
    }

    write_line(fd, io.remote, "STARTTLS", io.busy_timeout).map_err(|e| e.to_string())?;
    loop {
        line = read_line(fd, io.remote, io.busy_timeout).map_err(|e| e.to_string())?;
        if !line.starts_with("220-") {
            break;
        }
    }
    if !starts_with_ci_retry(&line, "220 ") {
        return Err("remote server is not RFC 2487 compliant".into());
    }
    Ok(())
}

pub fn server(io: &NegotiationIo) -> Result<(), String> {
    // Zero-timeout readiness probe on the local read fd (spec §4.3 /
    // Design Note 2): not ready => RFC 2487 branch; already-ready => the
    // peer already started a raw TLS handshake, skip negotiation. This is
    // deliberately racy against a slow client; preserved as documented in
    // the original source.
    let probe = readable_now(io.local_rfd.raw_fd()).map_err(|e| e.to_string())?;
    if probe {
        tracing::debug!("RFC 2487 not detected, treating as raw TLS");
        return Ok(());
    }
    tracing::debug!("RFC 2487 detected");

    let remote_fd = io.remote.raw_fd();
    let local_fd = io.local_rfd.raw_fd();

    let greeting = read_line(remote_fd, io.remote, io.busy_timeout).map_err(|e| e.to_string())?;
    let rest = greeting
        .strip_prefix("220")
        .ok_or_else(|| "unknown server welcome".to_string())?;
    write_line(
        io.local_wfd.raw_fd(),
        io.local_wfd,
        &format!("220{rest} + {}", io.service_name),
        io.busy_timeout,
    )
    .map_err(|e| e.to_string())?;

    let ehlo = read_line(local_fd, io.local_rfd, io.busy_timeout).map_err(|e| e.to_string())?;
    let domain = ehlo
        .strip_prefix("EHLO ")
        .ok_or_else(|| "unknown client EHLO".to_string())?;
    write_line(
        io.local_wfd.raw_fd(),
        io.local_wfd,
        &format!("250-{domain} Welcome"),
        io.busy_timeout,
    )
    .map_err(|e| e.to_string())?;
    write_line(io.local_wfd.raw_fd(), io.local_wfd, "250 STARTTLS", io.busy_timeout)
        .map_err(|e| e.to_string())?;

    let starttls = read_line(local_fd, io.local_rfd, io.busy_timeout).map_err(|e| e.to_string())?;
    if !starts_with_ci_retry(&starttls, "STARTTLS") {
        return Err("STARTTLS expected".into());
    }
    write_line(io.local_wfd.raw_fd(), io.local_wfd, "220 Go ahead", io.busy_timeout)
        .map_err(|e| e.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::duplex_pair;
    use std::io::Write as _;
    use std::thread;

    fn io<'a>(local: &'a crate::endpoint::Endpoint, remote: &'a crate::endpoint::Endpoint) -> NegotiationIo<'a> {
        NegotiationIo {
            local_rfd: local,
            local_wfd: local,
            remote,
            busy_timeout: 2.0,
            service_name: "tunnel",
        }
    }

    #[test]
    fn s1_client_negotiation_succeeds() {
        let (remote_near, remote_far) = duplex_pair();
        let (local_near, _local_far) = duplex_pair();
        let t = thread::spawn(move || {
            let mut f = &remote_far;
            write!(f, "220-one\r\n220 ready\r\n").unwrap();
            let mut buf = [0u8; 256];
            let _ = std::io::Read::read(&mut &remote_far, &mut buf);
            write!(&remote_far, "250-hello\r\n250 OK\r\n").unwrap();
            let _ = std::io::Read::read(&mut &remote_far, &mut buf);
            write!(&remote_far, "220 go\r\n").unwrap();
        });
        let negotiation = io(&local_near, &remote_near);
        let result = client(&negotiation);
        t.join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn s1_client_negotiation_fails_on_non_2487_reply() {
        let (remote_near, remote_far) = duplex_pair();
        let (local_near, _local_far) = duplex_pair();
        let t = thread::spawn(move || {
            write!(&remote_far, "220 ready\r\n").unwrap();
            let mut buf = [0u8; 256];
            let _ = std::io::Read::read(&mut &remote_far, &mut buf);
            write!(&remote_far, "250 OK\r\n").unwrap();
            let _ = std::io::Read::read(&mut &remote_far, &mut buf);
            write!(&remote_far, "554 no\r\n").unwrap();
        });
        let negotiation = io(&local_near, &remote_near);
        let result = client(&negotiation);
        t.join().unwrap();
        assert_eq!(result.unwrap_err(), "remote server is not RFC 2487 compliant");
    }

    #[test]
    fn s4_probe_skips_negotiation_when_bytes_pending() {
        let (local_near, local_far) = duplex_pair();
        let (remote_near, _remote_far) = duplex_pair();
        write!(&local_far, "\x16\x03\x01").unwrap(); // looks like a TLS record
        std::thread::sleep(std::time::Duration::from_millis(20));
        let negotiation = io(&local_near, &remote_near);
        assert!(server(&negotiation).is_ok());
    }
}
