//! RFC 1413 (IDENT) client (spec §4.4 "access-control collaborator",
//! §6 "Access control"). Grounded on
//! `examples/original_source/src/client.c`'s `auth_user`: connect to the
//! peer's `auth` (113) port, send `"<peer-port> , <local-port>"`, and
//! require the returned `USERID` to match the configured username.

use std::net::SocketAddr;

use crate::blocking::{read_line, write_line};
use crate::connect::{connect_remote, AddressList};

pub const IDENT_PORT: u16 = 113;

/// Connect to the peer's IDENT service and check the resolved username
/// against `expected`. Returns `Ok(())` on match, `Err` otherwise (refused
/// connection, malformed reply, or mismatch).
pub fn check_user(peer: SocketAddr, local_port: u16, expected: &str, connect_timeout: f64, busy_timeout: f64) -> Result<(), String> {
    let ident_addr = SocketAddr::new(peer.ip(), IDENT_PORT);
    let list = AddressList::new(vec![ident_addr]);
    let ep = connect_remote(&list, None, connect_timeout).map_err(|e| e.to_string())?;

    let query = format!("{} , {}", peer.port(), local_port);
    write_line(ep.raw_fd(), &ep, &query, busy_timeout).map_err(|e| e.to_string())?;
    let reply = read_line(ep.raw_fd(), &ep, busy_timeout).map_err(|e| e.to_string())?;

    let userid = parse_userid(&reply).ok_or_else(|| "incorrect data from IDENT server".to_string())?;
    if userid == expected {
        tracing::info!(userid, "IDENT resolved remote user");
        Ok(())
    } else {
        Err(format!("IDENT user mismatch: got {userid:?}, expected {expected:?}"))
    }
}

/// Parse a reply of the shape `"<port>, <port> : USERID : <os> : <name>"`.
fn parse_userid(line: &str) -> Option<String> {
    let name = line.split(':').nth(3)?;
    Some(name.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_reply() {
        let line = "6191, 23 : USERID : UNIX : stunnel";
        assert_eq!(parse_userid(line).as_deref(), Some("stunnel"));
    }

    #[test]
    fn rejects_malformed_reply() {
        assert!(parse_userid("not an ident reply").is_none());
    }
}
