//! Upstream resolver descriptors.
//!
//! An upstream is described by a spec string in one of two forms:
//!
//! - `host[:port]` — legacy form, protocol defaults to UDP (or TCP when the
//!   caller forces TCP-only)
//! - `proto[+proto]@host[:port][/path]` — protocols tried left to right,
//!   the next one only after the previous failed
//!
//! UDP and TCP upstreams must be literal IPs: this forwarder never resolves
//! its own upstreams through DNS. DoH upstreams are absolute URLs.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;
use url::Url;

/// Transport protocol for one upstream exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
    Doh,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Doh => "doh",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, SpecError> {
        match s {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            "doh" => Ok(Protocol::Doh),
            other => Err(SpecError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Error parsing an upstream spec string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("unknown protocol [{0}]")]
    UnknownProtocol(String),
    #[error("invalid resolver address [{proto}@{addr}]")]
    InvalidResolver { proto: Protocol, addr: String },
    #[error("cannot parse host and port from [{0}]")]
    BadHostPort(String),
    #[error("no protocols in [{0}]")]
    EmptyProtocols(String),
}

/// A single upstream DNS server: its address and the ordered protocol list.
///
/// For [`Protocol::Udp`] and [`Protocol::Tcp`] the address is `ip:port`; for
/// [`Protocol::Doh`] it is the full URL. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    addr: String,
    protocols: Vec<Protocol>,
}

impl Upstream {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    /// The socket address of a UDP/TCP upstream. DoH upstreams have none.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.addr.parse().ok()
    }

    /// For DoH upstreams, the hostname or IP component of the URL.
    pub fn doh_host(&self) -> Option<String> {
        if !self.protocols.contains(&Protocol::Doh) {
            return None;
        }
        Url::parse(&self.addr)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, proto) in self.protocols.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{proto}")?;
        }
        write!(f, "@{}", self.addr)
    }
}

/// Parse one upstream spec string.
///
/// `tcp_only` selects the default protocol for legacy `host[:port]` specs.
pub fn parse_upstream(spec: &str, tcp_only: bool) -> Result<Upstream, SpecError> {
    let (protocols, addr) = match spec.split_once('@') {
        None => {
            let proto = if tcp_only { Protocol::Tcp } else { Protocol::Udp };
            (vec![proto], spec)
        }
        Some((proto_part, addr)) => {
            if proto_part.is_empty() {
                return Err(SpecError::EmptyProtocols(spec.to_string()));
            }
            let mut protocols = Vec::new();
            for token in proto_part.to_ascii_lowercase().split('+') {
                let proto = token.parse::<Protocol>()?;
                if !protocols.contains(&proto) {
                    protocols.push(proto);
                }
            }
            (protocols, addr)
        }
    };

    let wants_socket = protocols
        .iter()
        .any(|p| matches!(p, Protocol::Udp | Protocol::Tcp));

    let addr = if wants_socket {
        normalize_host_port(addr)?
    } else {
        addr.to_string()
    };

    for &proto in &protocols {
        check_protocol_addr(proto, &addr)?;
    }

    Ok(Upstream { addr, protocols })
}

/// Append `item` to `pool` unless an upstream with the same address exists.
pub fn append_unique(pool: &mut Vec<Upstream>, item: Upstream) {
    if !pool.iter().any(|u| u.addr == item.addr) {
        pool.push(item);
    }
}

/// Normalize a UDP/TCP address to `ip:port`, defaulting the port to 53.
/// Bare and bracketed IPv6 literals both come out bracketed.
fn normalize_host_port(addr: &str) -> Result<String, SpecError> {
    if addr.parse::<SocketAddr>().is_ok() {
        return Ok(addr.to_string());
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(match ip {
            IpAddr::V4(v4) => format!("{v4}:53"),
            IpAddr::V6(v6) => format!("[{v6}]:53"),
        });
    }
    if let Some(inner) = addr.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        if let Ok(v6) = inner.parse::<Ipv6Addr>() {
            return Ok(format!("[{v6}]:53"));
        }
    }
    Err(SpecError::BadHostPort(addr.to_string()))
}

/// Reject protocol/address pairs that cannot work together.
fn check_protocol_addr(proto: Protocol, addr: &str) -> Result<(), SpecError> {
    let invalid = || SpecError::InvalidResolver {
        proto,
        addr: addr.to_string(),
    };
    match proto {
        Protocol::Udp | Protocol::Tcp => addr
            .parse::<SocketAddr>()
            .map(|_| ())
            .map_err(|_| invalid()),
        Protocol::Doh => {
            let url = Url::parse(addr).map_err(|_| invalid())?;
            match url.host_str() {
                Some(host) if !host.is_empty() => Ok(()),
                _ => Err(invalid()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(addr: &str, protocols: Vec<Protocol>) -> Upstream {
        Upstream {
            addr: addr.to_string(),
            protocols,
        }
    }

    #[test]
    fn legacy_form_defaults_to_udp() {
        let got = parse_upstream("8.8.8.8:53", false).unwrap();
        assert_eq!(got, upstream("8.8.8.8:53", vec![Protocol::Udp]));
    }

    #[test]
    fn legacy_form_honors_tcp_only() {
        let got = parse_upstream("8.8.8.8", true).unwrap();
        assert_eq!(got, upstream("8.8.8.8:53", vec![Protocol::Tcp]));
    }

    #[test]
    fn explicit_protocol_and_port() {
        let got = parse_upstream("udp@8.8.8.8:54", false).unwrap();
        assert_eq!(got, upstream("8.8.8.8:54", vec![Protocol::Udp]));
    }

    #[test]
    fn protocol_list_is_lowercased_and_ordered() {
        let got = parse_upstream("UDP+tcp@8.8.8.8:53", false).unwrap();
        assert_eq!(
            got,
            upstream("8.8.8.8:53", vec![Protocol::Udp, Protocol::Tcp])
        );

        let got = parse_upstream("tcp+udp@8.8.8.8:53", false).unwrap();
        assert_eq!(
            got,
            upstream("8.8.8.8:53", vec![Protocol::Tcp, Protocol::Udp])
        );
    }

    #[test]
    fn duplicate_protocols_keep_first_occurrence() {
        let got = parse_upstream("UDP+udp+tcp@8.8.8.8:53", false).unwrap();
        assert_eq!(
            got,
            upstream("8.8.8.8:53", vec![Protocol::Udp, Protocol::Tcp])
        );
    }

    #[test]
    fn empty_protocol_segment_fails() {
        assert_eq!(
            parse_upstream("@8.8.8.8:53", false),
            Err(SpecError::EmptyProtocols("@8.8.8.8:53".to_string()))
        );
    }

    #[test]
    fn unknown_protocols_fail() {
        assert!(matches!(
            parse_upstream("asdf@8.8.8.8:53", false),
            Err(SpecError::UnknownProtocol(_))
        ));
        assert!(matches!(
            parse_upstream("wut+tcp@8.8.8.8:53", false),
            Err(SpecError::UnknownProtocol(_))
        ));
    }

    #[test]
    fn hostnames_are_rejected_for_udp_and_tcp() {
        assert!(parse_upstream("dns.example.com", false).is_err());
        assert!(parse_upstream("udp@dns.example.com:53", false).is_err());
    }

    #[test]
    fn ipv6_literals_are_bracketed_and_given_a_port() {
        let want = upstream("[2a09::]:53", vec![Protocol::Udp]);
        assert_eq!(parse_upstream("2a09::", false).unwrap(), want);
        assert_eq!(parse_upstream("[2a09::]", false).unwrap(), want);

        let got = parse_upstream("[2a09::]:123", false).unwrap();
        assert_eq!(got, upstream("[2a09::]:123", vec![Protocol::Udp]));

        let got = parse_upstream("tcp+udp@2a09::", false).unwrap();
        assert_eq!(
            got,
            upstream("[2a09::]:53", vec![Protocol::Tcp, Protocol::Udp])
        );
    }

    #[test]
    fn doh_takes_an_absolute_url() {
        let got = parse_upstream("doh@https://doh.serv/query", false).unwrap();
        assert_eq!(got, upstream("https://doh.serv/query", vec![Protocol::Doh]));
        assert_eq!(got.doh_host().as_deref(), Some("doh.serv"));
    }

    #[test]
    fn doh_rejects_non_urls() {
        assert!(matches!(
            parse_upstream("doh@8.8.8.8:53", false),
            Err(SpecError::InvalidResolver { .. })
        ));
    }

    #[test]
    fn display_round_trips() {
        for spec in [
            "udp@8.8.8.8:53",
            "udp+tcp@8.8.8.8:53",
            "tcp@[2a09::]:123",
            "doh@https://doh.serv/query",
        ] {
            let parsed = parse_upstream(spec, false).unwrap();
            let reparsed = parse_upstream(&parsed.to_string(), false).unwrap();
            assert_eq!(parsed, reparsed);
        }
    }

    #[test]
    fn append_unique_dedups_by_address() {
        let mut pool = Vec::new();
        append_unique(&mut pool, parse_upstream("8.8.8.8", false).unwrap());
        append_unique(&mut pool, parse_upstream("tcp@8.8.8.8:53", false).unwrap());
        append_unique(&mut pool, parse_upstream("1.1.1.1", false).unwrap());
        assert_eq!(pool.len(), 2);
        assert_eq!(pool[0].protocols(), &[Protocol::Udp]);
    }
}
