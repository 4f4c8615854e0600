//! Identity resolution for inbound requests.

use std::net::SocketAddr;

/// What an identity was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    /// A caller-supplied access token
    Token,
    /// The source network address
    Ip,
}

/// The key a quota is tracked against.
///
/// The key is used verbatim as the counter key in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    kind: IdentityKind,
    key: String,
}

impl Identity {
    /// An identity keyed by an access token.
    pub fn token(token: &str) -> Self {
        Self {
            kind: IdentityKind::Token,
            key: token.to_string(),
        }
    }

    /// An identity keyed by the host part of a `host:port` remote address.
    ///
    /// Bracketed IPv6 addresses (`[::1]:8080`) are unwrapped. An address with
    /// no port is used as-is.
    pub fn from_remote_addr(remote_addr: &str) -> Self {
        Self {
            kind: IdentityKind::Ip,
            key: host_of(remote_addr).to_string(),
        }
    }

    /// What this identity was derived from.
    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    /// The counter key for this identity.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key)
    }
}

fn host_of(remote_addr: &str) -> &str {
    if remote_addr.parse::<SocketAddr>().is_ok() {
        if let Some((host, _port)) = remote_addr.rsplit_once(':') {
            return host.trim_start_matches('[').trim_end_matches(']');
        }
    }

    // Bare IPv6 addresses contain colons but no port.
    if remote_addr.matches(':').count() > 1 {
        return remote_addr.trim_start_matches('[').trim_end_matches(']');
    }

    match remote_addr.split_once(':') {
        Some((host, _port)) => host,
        None => remote_addr,
    }
}
