//! Protocol/role combinations this crate does not implement
//! (§4.3: POP3/NNTP/TELNET/SMB server and TELNET/SMB client).

pub fn fail(protocol: &str, role: &str) -> Result<(), String> {
    let msg = format!("protocol {protocol} not supported in {role} mode");
    tracing::error!("{msg}");
    Err(msg)
}
