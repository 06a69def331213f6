//! Application-protocol STARTTLS negotiation (spec §4.3). Runs strictly
//! before TLS establishment, on the remote or the local descriptor
//! depending on `Role`.

mod nntp;
mod pop3;
mod smtp;
mod unsupported;

use crate::endpoint::Endpoint;

/// Which side of the tunnel is performing the negotiation: the side that
/// speaks the plaintext protocol *as a client* of the remote service, or
/// the side that speaks it *as a server* to the local plaintext peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// The supported STARTTLS-capable application protocols, plus the named
/// stubs that are explicitly unsupported in certain roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Smtp,
    Pop3,
    Nntp,
    Smb,
    Telnet,
}

impl Protocol {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "smtp" => Some(Protocol::Smtp),
            "pop3" => Some(Protocol::Pop3),
            "nntp" => Some(Protocol::Nntp),
            "smb" => Some(Protocol::Smb),
            "telnet" => Some(Protocol::Telnet),
            _ => None,
        }
    }
}

/// The two descriptors negotiation needs: the local plaintext peer (read
/// and write may be the same descriptor) and the remote socket.
pub struct NegotiationIo<'a> {
    pub local_rfd: &'a Endpoint,
    pub local_wfd: &'a Endpoint,
    pub remote: &'a Endpoint,
    pub busy_timeout: f64,
    pub service_name: &'a str,
}

/// Dispatch one negotiation round. Unknown protocol names, and
/// unsupported role/protocol pairs, fail with a diagnostic (spec §4.3).
pub fn negotiate(protocol: Protocol, role: Role, io: &NegotiationIo) -> Result<(), String> {
    tracing::debug!(?protocol, ?role, "negotiation started");
    match (protocol, role) {
        (Protocol::Smtp, Role::Client) => smtp::client(io),
        (Protocol::Smtp, Role::Server) => smtp::server(io),
        (Protocol::Pop3, Role::Client) => pop3::client(io),
        (Protocol::Nntp, Role::Client) => nntp::client(io),
        (Protocol::Pop3, Role::Server) => unsupported::fail("pop3", "server"),
        (Protocol::Nntp, Role::Server) => unsupported::fail("nntp", "server"),
        (Protocol::Smb, _) => unsupported::fail("smb", role_name(role)),
        (Protocol::Telnet, _) => unsupported::fail("telnet", role_name(role)),
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Client => "client",
        Role::Server => "server",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_protocol_name_fails_to_parse() {
        assert!(Protocol::parse("imap").is_none());
    }

    #[test]
    fn pop3_server_role_is_unsupported() {
        let (a, b) = crate::testutil::duplex_pair();
        let io = NegotiationIo {
            local_rfd: &a,
            local_wfd: &a,
            remote: &b,
            busy_timeout: 1.0,
            service_name: "svc",
        };
        assert!(negotiate(Protocol::Pop3, Role::Server, &io).is_err());
    }
}
