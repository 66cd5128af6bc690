//! Prefix set over IP addresses.
//!
//! Backs both the region set (drives resolver partitioning and the
//! answer-accept policy) and the IP blacklist. Populated from files at
//! startup, read-only afterwards.

use std::net::IpAddr;

use ipnet::IpNet;

/// A set of IPv4/IPv6 networks with point-in-set lookup.
#[derive(Debug, Default, Clone)]
pub struct IpSet {
    nets: Vec<IpNet>,
}

impl IpSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, net: IpNet) {
        self.nets.push(net);
    }

    /// Parse one list line: a CIDR network, or a bare IP which is treated
    /// as a host-length prefix (/32 or /128).
    pub fn insert_entry(&mut self, entry: &str) -> Result<(), ipnet::AddrParseError> {
        match entry.parse::<IpNet>() {
            Ok(net) => {
                self.nets.push(net);
                Ok(())
            }
            Err(err) => match entry.parse::<IpAddr>() {
                Ok(ip) => {
                    self.nets.push(IpNet::from(ip));
                    Ok(())
                }
                Err(_) => Err(err),
            },
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&ip))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }
}
