//! POP3 STARTTLS (STLS, RFC 2595) client-side negotiation.

use super::NegotiationIo;
use crate::blocking::{read_line, starts_with_ci_retry, write_line};

pub fn client(io: &NegotiationIo) -> Result<(), String> {
    let fd = io.remote.raw_fd();

    let greeting = read_line(fd, io.remote, io.busy_timeout).map_err(|e| e.to_string())?;
    if !starts_with_ci_retry(&greeting, "+OK ") {
        return Err("unknown server welcome".into());
    }
    write_line(io.local_wfd.raw_fd(), io.local_wfd, &greeting, io.busy_timeout)
        .map_err(|e| e.to_string())?;

    write_line(fd, io.remote, "STLS", io.busy_timeout).map_err(|e| e.to_string())?;
    let reply = read_line(fd, io.remote, io.busy_timeout).map_err(|e| e.to_string())?;
    if !starts_with_ci_retry(&reply, "+OK ") {
        return Err("server does not support TLS".into());
    }
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
    fn s2_stls_accepted() {
        let (remote_near, remote_far) = duplex_pair();
        let (local_near, _local_far) = duplex_pair();
        let t = thread::spawn(move || {
            write!(&remote_far, "+OK ready\r\n").unwrap();
            let mut buf = [0u8; 64];
            let _ = std::io::Read::read(&mut &remote_far, &mut buf);
            write!(&remote_far, "+OK begin\r\n").unwrap();
        });
        let negotiation = io(&local_near, &remote_near);
        let result = client(&negotiation);
        t.join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn s2_stls_rejected() {
        let (remote_near, remote_far) = duplex_pair();
        let (local_near, _local_far) = duplex_pair();
        let t = thread::spawn(move || {
            write!(&remote_far, "+OK ready\r\n").unwrap();
            let mut buf = [0u8; 64];
            let _ = std::io::Read::read(&mut &remote_far, &mut buf);
            write!(&remote_far, "-ERR nope\r\n").unwrap();
        });
        let negotiation = io(&local_near, &remote_near);
        let result = client(&negotiation);
        t.join().unwrap();
        assert_eq!(result.unwrap_err(), "server does not support TLS");
    }
}
