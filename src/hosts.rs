//! Local hosts-file lookup.
//!
//! DoH upstreams are named by URL, but partitioning them into the trusted or
//! untrusted pool needs an IP. Resolving the hostname through DNS would
//! create a bootstrap cycle, so the only source consulted is the local hosts
//! file.

use std::io;
use std::net::IpAddr;
use std::path::Path;

#[cfg(unix)]
const HOSTS_PATH: &str = "/etc/hosts";
#[cfg(windows)]
const HOSTS_PATH: &str = r"C:\Windows\System32\drivers\etc\hosts";

/// Parsed hosts file: `(ip, [names])` per line.
#[derive(Debug, Default)]
pub struct HostsFile {
    entries: Vec<(IpAddr, Vec<String>)>,
}

impl HostsFile {
    /// Load the platform hosts file. A missing or unreadable file yields an
    /// empty map; DoH partitioning then falls back to the trusted pool.
    pub fn system() -> io::Result<Self> {
        Self::load(Path::new(HOSTS_PATH))
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    fn parse(content: &str) -> Self {
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(ip) = fields.next().and_then(|f| f.parse::<IpAddr>().ok()) else {
                continue;
            };
            let names: Vec<String> = fields.map(|f| f.to_ascii_lowercase()).collect();
            if !names.is_empty() {
                entries.push((ip, names));
            }
        }
        Self { entries }
    }

    /// First IP mapped to `host`, if any. Matching is case-insensitive.
    pub fn lookup(&self, host: &str) -> Option<IpAddr> {
        let host = host.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(_, names)| names.iter().any(|n| *n == host))
            .map(|(ip, _)| *ip)
    }
}
