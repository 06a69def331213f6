//! Test doubles for driving the negotiation state machines and the data
//! pump without real network I/O. Standing in for the role `bolero`/
//! `io-testing` play in `s2n-quic-platform`, scaled down to what this
//! crate's deterministic unit tests need.

#![cfg(test)]

use crate::endpoint::Endpoint;

/// A connected pair of non-blocking endpoints, backed by `UnixStream::pair`.
/// Each side can be read from and written to independently, same as a real
/// socket, which is all the negotiation/pump code requires.
pub fn duplex_pair() -> (Endpoint, Endpoint) {
    let (a, b) = std::os::unix::net::UnixStream::pair().expect("socketpair");
    (
        Endpoint::from_unix_stream(a).expect("nonblocking"),
        Endpoint::from_unix_stream(b).expect("nonblocking"),
    )
}
