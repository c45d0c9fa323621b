//! Forged sender identities and the ident/host syntax rules they rely on.

use std::fmt;
use std::net::Ipv6Addr;

/// Longest accepted ident, matching the common `IDENTMAX` default.
pub const MAX_IDENT_LEN: usize = 10;

/// Longest accepted host.
pub const MAX_HOST_LEN: usize = 64;

/// A `nick!ident@host` triple presented as the sender of a relayed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgedIdentity {
    pub nick: String,
    pub ident: String,
    pub host: String,
}

impl ForgedIdentity {
    /// Full hostmask, suitable as a message prefix.
    pub fn mask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.ident, self.host)
    }
}

impl fmt::Display for ForgedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}@{}", self.nick, self.ident, self.host)
    }
}

/// Compose the sender identity. Inputs are validated elsewhere.
pub fn forge(nick: &str, ident: &str, host: &str) -> ForgedIdentity {
    ForgedIdentity {
        nick: nick.to_owned(),
        ident: ident.to_owned(),
        host: host.to_owned(),
    }
}

/// Ident syntax: 1..=10 bytes of letters, digits, `-`, `.` and `[\]^_`{|}`.
pub fn is_valid_ident(ident: &str) -> bool {
    !ident.is_empty()
        && ident.len() <= MAX_IDENT_LEN
        && ident
            .bytes()
            .all(|b| (b'A'..=b'}').contains(&b) || b.is_ascii_digit() || b == b'-' || b == b'.')
}

/// Host syntax: labels of letters, digits, `-` and `_` joined by `.` or
/// `/` (cloaks), or an IPv6 literal.
///
/// Needs at least one separator so clients can tell a host from a
/// server-less short name.
pub fn is_valid_host(host: &str) -> bool {
    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return false;
    }
    if host.contains(':') {
        return host.parse::<Ipv6Addr>().is_ok();
    }
    if !host.contains(['.', '/']) {
        return false;
    }
    host.split(['.', '/']).all(|label| {
        !label.is_empty()
            && !label.starts_with(['-', '_'])
            && !label.ends_with(['-', '_'])
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forge_is_literal_concatenation() {
        let id = forge("relay/alice", "relay", "lagoon.lagun.co");
        assert_eq!(id.mask(), "relay/alice!relay@lagoon.lagun.co");
        assert_eq!(id.to_string(), id.mask());
    }

    #[test]
    fn forge_never_validates() {
        // Garbage in, garbage out: the forger is total.
        let id = forge("", "", "");
        assert_eq!(id.mask(), "!@");
        assert_eq!(forge("a b", "!", "@").mask(), "a b!!@@");
    }

    #[test]
    fn ident_rules() {
        assert!(is_valid_ident("relay"));
        assert!(is_valid_ident("br[i]dge-1"));
        assert!(is_valid_ident("a.b"));
        assert!(!is_valid_ident(""));
        assert!(!is_valid_ident("way-too-long"));
        assert!(!is_valid_ident("re lay"));
        assert!(!is_valid_ident("re@lay"));
        assert!(!is_valid_ident("~relay"));
    }

    #[test]
    fn host_rules() {
        assert!(is_valid_host("lagoon.lagun.co"));
        assert!(is_valid_host("relay-1.example.org"));
        assert!(is_valid_host("200.fcf.205.9dec"));
        assert!(!is_valid_host("localhost"));
        assert!(!is_valid_host(".lagun.co"));
        assert!(!is_valid_host("lagun..co"));
        assert!(!is_valid_host("-bad.lagun.co"));
        assert!(!is_valid_host("bad-.lagun.co"));
        assert!(!is_valid_host("_under.co"));
        assert!(!is_valid_host(&format!("{}.co", "a".repeat(MAX_HOST_LEN))));
    }

    #[test]
    fn cloak_and_ipv6_hosts_are_accepted() {
        assert!(is_valid_host("relay_gw.example"));
        assert!(is_valid_host("lagun/bridge/relay"));
        assert!(is_valid_host("2001:db8::1"));
        assert!(!is_valid_host("2001:db8:::1"));
        assert!(!is_valid_host("lagun//relay"));
        assert!(!is_valid_host("relay/"));
        assert!(!is_valid_host("relay_gw"));
    }

    #[test]
    fn host_rules_are_not_ident_rules() {
        // A valid ident is not automatically a valid host, and vice versa.
        assert!(is_valid_ident("relay"));
        assert!(!is_valid_host("relay"));
        assert!(is_valid_host("relay.lagun.co"));
        assert!(!is_valid_ident("relay.lagun.co"));
    }
}
