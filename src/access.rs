//! Host-based access control (spec §4.4, §6 "Access control"; §5 shared-
//! state item (d), "an IP-access library that is not reentrant"). Grounded
//! on `examples/original_source/src/client.c`'s `auth_libwrap`: the
//! original defers to the system's TCP wrappers library, which has no
//! equivalent crate in this dependency stack, so the rule evaluation below
//! is a direct reimplementation of `hosts_access(5)`'s allow/deny-list
//! semantics, held behind a single process-wide lock since the
//! collaborator is not reentrant (§5 item (d)).
use std::net::IpAddr;
use std::sync::Mutex;

/// One `hosts.allow`/`hosts.deny`-style rule: match everything, a single
/// address, or a CIDR-ish prefix (first N dotted octets).
#[derive(Debug, Clone)]
pub enum HostRule {
    Any,
    Exact(IpAddr),
    Prefix(Vec<u8>),
}

impl HostRule {
    fn matches(&self, addr: &IpAddr) -> bool {
        match self {
            HostRule::Any => true,
            HostRule::Exact(a) => a == addr,
            HostRule::Prefix(prefix) => match addr {
                IpAddr::V4(v4) => v4.octets().starts_with(prefix.as_slice()),
                IpAddr::V6(_) => false,
            },
        }
    }
}

/// Process-wide allow/deny rule set, guarded by a single lock since the
/// underlying rule evaluation is not reentrant (§5 item (d)).
pub struct AccessControl {
    inner: Mutex<Rules>,
}

struct Rules {
    allow: Vec<HostRule>,
    deny: Vec<HostRule>,
}

impl AccessControl {
    /// `allow` wins when both lists are empty (default permit). When the
    /// allow list is non-empty, only its matches are permitted; the deny
    /// list always rejects on match regardless.
    pub fn new(allow: Vec<HostRule>, deny: Vec<HostRule>) -> Self {
        Self {
            inner: Mutex::new(Rules { allow, deny }),
        }
    }

    pub fn permits(&self, addr: IpAddr) -> bool {
        let rules = self.inner.lock().expect("access-control lock poisoned");
        if rules.deny.iter().any(|r| r.matches(&addr)) {
            return false;
        }
        if rules.allow.is_empty() {
            return true;
        }
        rules.allow.iter().any(|r| r.matches(&addr))
    }
}

impl Default for AccessControl {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_permits_everything() {
        let ac = AccessControl::default();
        assert!(ac.permits("203.0.113.5".parse().unwrap()));
    }

    #[test]
    fn deny_rule_overrides_allow() {
        let addr: IpAddr = "10.0.0.7".parse().unwrap();
        let ac = AccessControl::new(vec![HostRule::Any], vec![HostRule::Exact(addr)]);
        assert!(!ac.permits(addr));
        assert!(ac.permits("10.0.0.8".parse().unwrap()));
    }

    #[test]
    fn non_empty_allow_list_restricts_to_matches() {
        let ac = AccessControl::new(vec![HostRule::Prefix(vec![10, 0])], Vec::new());
        assert!(ac.permits("10.0.5.5".parse().unwrap()));
        assert!(!ac.permits("192.168.1.1".parse().unwrap()));
    }
}
