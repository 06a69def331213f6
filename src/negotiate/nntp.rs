//! NNTP STARTTLS (RFC 4642) client-side negotiation.

use super::NegotiationIo;
use crate::blocking::{read_line, write_line};

pub fn client(io: &NegotiationIo) -> Result<(), String> {
    let fd = io.remote.raw_fd();

    let greeting = read_line(fd, io.remote, io.busy_timeout).map_err(|e| e.to_string())?;
    if !greeting.starts_with("200 ") && !greeting.starts_with("201 ") {
        return Err("unknown server welcome".into());
    }
    write_line(io.local_wfd.raw_fd(), io.local_wfd, &greeting, io.busy_timeout)
        .map_err(|e| e.to_string())?;

    write_line(fd, io.remote, "STARTTLS", io.busy_timeout).map_err(|e| e.to_string())?;
    let reply = read_line(fd, io.remote, io.busy_timeout).map_err(|e| e.to_string())?;
    if !reply.starts_with("382 ") {
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
    fn s3_accepts_200_and_201() {
        for greeting in ["200 ok\r\n", "201 ok\r\n"] {
            let (remote_near, remote_far) = duplex_pair();
            let (local_near, _local_far) = duplex_pair();
            let greeting = greeting.to_string();
            let t = thread::spawn(move || {
                let mut f = &remote_far;
                use std::io::Write;
                write!(f, "{greeting}").unwrap();
                let mut buf = [0u8; 64];
                let _ = std::io::Read::read(&mut f, &mut buf);
                write!(f, "382 ok\r\n").unwrap();
            });
            let negotiation = io(&local_near, &remote_near);
            let result = client(&negotiation);
            t.join().unwrap();
            assert!(result.is_ok());
        }
    }

    #[test]
    fn s3_rejects_unknown_greeting() {
        let (remote_near, remote_far) = duplex_pair();
        let (local_near, _local_far) = duplex_pair();
        let t = thread::spawn(move || {
            write!(&remote_far, "400 bye\r\n").unwrap();
        });
        let negotiation = io(&local_near, &remote_near);
        let result = client(&negotiation);
        t.join().unwrap();
        assert_eq!(result.unwrap_err(), "unknown server welcome");
    }
}
