//! Client identity resolution
//!
//! `x-forwarded-for` is only believed when the direct peer is a configured
//! proxy. The chain is then walked from the right (the entry appended by the
//! nearest proxy) past every trusted hop; the first untrusted address is the
//! client. Anything a client writes on the left of the chain is ignored.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid trusted proxy '{0}': expected an IP address or CIDR block")]
pub struct InvalidProxy(String);

/// One trusted proxy entry: a single address or a CIDR block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyNet {
    base: IpAddr,
    prefix: u8,
}

impl ProxyNet {
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.base, addr) {
            (IpAddr::V4(base), IpAddr::V4(addr)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(base) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(base), IpAddr::V6(addr)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(base) & mask == u128::from(addr) & mask
            }
            // IPv4-mapped IPv6 peers are compared as IPv4
            (IpAddr::V4(_), IpAddr::V6(v6)) => v6
                .to_ipv4_mapped()
                .is_some_and(|v4| self.contains(IpAddr::V4(v4))),
            (IpAddr::V6(_), IpAddr::V4(_)) => false,
        }
    }
}

impl FromStr for ProxyNet {
    type Err = InvalidProxy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || InvalidProxy(s.to_string());
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let base: IpAddr = addr.parse().map_err(|_| invalid())?;
        let max = if base.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { base, prefix })
    }
}

impl fmt::Display for ProxyNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

/// The set of proxies allowed to assert a client address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedProxies {
    nets: Vec<ProxyNet>,
}

impl TrustedProxies {
    pub fn new(nets: Vec<ProxyNet>) -> Self {
        Self { nets }
    }

    /// Parse a comma-separated list such as `10.0.0.0/8, 192.168.1.10`
    pub fn parse_list(list: &str) -> Result<Self, InvalidProxy> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ProxyNet::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn is_trusted(&self, addr: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(addr))
    }

    /// The address the request should be attributed to
    ///
    /// `forwarded_for` is the raw `x-forwarded-for` value, if any. An entry
    /// that does not parse as an IP address ends the walk at the last hop
    /// that did.
    pub fn resolve_client_ip(&self, peer: IpAddr, forwarded_for: Option<&str>) -> IpAddr {
        if !self.is_trusted(peer) {
            return peer;
        }
        let Some(chain) = forwarded_for else {
            return peer;
        };

        let mut client = peer;
        for entry in chain.rsplit(',') {
            let Ok(hop) = entry.trim().parse::<IpAddr>() else {
                break;
            };
            client = hop;
            if !self.is_trusted(hop) {
                break;
            }
        }
        client
    }
}

/// Who a request is attributed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub ip: IpAddr,
    /// Present when the request carries a valid session
    pub user_id: Option<String>,
}

impl ClientIdentity {
    /// `(scope, identifier)` pairs to rate limit: always the IP, plus the user when known
    pub fn identifiers(&self) -> Vec<(IdentifierKind, String)> {
        let mut ids = vec![(IdentifierKind::Ip, self.ip.to_string())];
        if let Some(user) = &self.user_id {
            ids.push((IdentifierKind::User, user.clone()));
        }
        ids
    }

    /// The single identifier a request belongs to: the user when known, else the IP
    pub fn principal(&self) -> String {
        match &self.user_id {
            Some(user) => format!("{}:{user}", IdentifierKind::User.as_str()),
            None => format!("{}:{}", IdentifierKind::Ip.as_str(), self.ip),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    Ip,
    User,
}

impl IdentifierKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentifierKind::Ip => "ip",
            IdentifierKind::User => "user",
        }
    }
}
