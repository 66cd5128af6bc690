//! Configuration assembly.
//!
//! Building a [`Config`] is explicitly ordered: the match sets load first,
//! resolver specs parse second, and partitioning into pools happens at
//! proxy startup once both are present. List files hold one entry per
//! line; blank lines and `#` comments are skipped.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::filter::{DomainSet, IpSet};
use crate::upstream::{append_unique, parse_upstream, SpecError, Upstream};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}:{line}: cannot parse {entry:?} as a network")]
    BadNetwork {
        path: PathBuf,
        line: usize,
        entry: String,
    },
    #[error("bad resolver spec: {0}")]
    Spec(#[from] SpecError),
}

/// Everything the proxy needs to start. The heavyweight sets live behind
/// `Arc` so the supervisor can restart the proxy without reloading files.
#[derive(Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub region: Arc<IpSet>,
    pub ip_blacklist: Arc<IpSet>,
    pub domain_blacklist: Arc<DomainSet>,
    pub polluted: Arc<DomainSet>,
    /// Resolvers partitioned by region membership at startup.
    pub servers: Vec<Upstream>,
    /// Resolvers forced into the trusted pool.
    pub trusted_servers: Vec<Upstream>,
    pub bidirectional: bool,
    pub mutation: bool,
    pub reuse_port: bool,
    pub skip_refine: bool,
    pub timeout: Duration,
    pub delay: Duration,
    pub udp_max_size: u16,
    pub test_domains: Vec<String>,
}

/// Phase-ordered builder for [`Config`].
#[derive(Debug)]
pub struct ConfigBuilder {
    listen: SocketAddr,
    region: IpSet,
    ip_blacklist: IpSet,
    domain_blacklist: DomainSet,
    polluted: DomainSet,
    servers: Vec<Upstream>,
    trusted_servers: Vec<Upstream>,
    bidirectional: bool,
    mutation: bool,
    reuse_port: bool,
    skip_refine: bool,
    timeout: Duration,
    delay: Duration,
    udp_max_size: u16,
    test_domains: Vec<String>,
}

impl ConfigBuilder {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            region: IpSet::new(),
            ip_blacklist: IpSet::new(),
            domain_blacklist: DomainSet::new(),
            polluted: DomainSet::new(),
            servers: Vec::new(),
            trusted_servers: Vec::new(),
            bidirectional: true,
            mutation: false,
            reuse_port: true,
            skip_refine: false,
            timeout: Duration::from_secs(1),
            delay: Duration::from_millis(100),
            udp_max_size: 4096,
            test_domains: vec!["example.com".to_string()],
        }
    }

    /// Load the region CIDR list. Strict: every non-comment line must be a
    /// network.
    pub fn region_file(mut self, path: &Path) -> Result<Self, ConfigError> {
        for (line_no, entry) in read_entries(path)? {
            self.region
                .insert_entry(&entry)
                .map_err(|_| ConfigError::BadNetwork {
                    path: path.to_path_buf(),
                    line: line_no,
                    entry,
                })?;
        }
        Ok(self)
    }

    /// Load the IP blacklist; bare IPs count as host-length prefixes.
    pub fn ip_blacklist_file(mut self, path: &Path) -> Result<Self, ConfigError> {
        for (line_no, entry) in read_entries(path)? {
            self.ip_blacklist
                .insert_entry(&entry)
                .map_err(|_| ConfigError::BadNetwork {
                    path: path.to_path_buf(),
                    line: line_no,
                    entry,
                })?;
        }
        Ok(self)
    }

    pub fn domain_blacklist_file(mut self, path: &Path) -> Result<Self, ConfigError> {
        for (_, entry) in read_entries(path)? {
            self.domain_blacklist.insert(&entry);
        }
        Ok(self)
    }

    pub fn polluted_file(mut self, path: &Path) -> Result<Self, ConfigError> {
        for (_, entry) in read_entries(path)? {
            self.polluted.insert(&entry);
        }
        Ok(self)
    }

    pub fn resolvers(mut self, specs: &[String], tcp_only: bool) -> Result<Self, ConfigError> {
        for spec in specs {
            append_unique(&mut self.servers, parse_upstream(spec, tcp_only)?);
        }
        Ok(self)
    }

    pub fn trusted_resolvers(
        mut self,
        specs: &[String],
        tcp_only: bool,
    ) -> Result<Self, ConfigError> {
        for spec in specs {
            append_unique(&mut self.trusted_servers, parse_upstream(spec, tcp_only)?);
        }
        Ok(self)
    }

    pub fn bidirectional(mut self, on: bool) -> Self {
        self.bidirectional = on;
        self
    }

    pub fn mutation(mut self, on: bool) -> Self {
        self.mutation = on;
        self
    }

    pub fn reuse_port(mut self, on: bool) -> Self {
        self.reuse_port = on;
        self
    }

    pub fn skip_refine(mut self, on: bool) -> Self {
        self.skip_refine = on;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn udp_max_size(mut self, size: u16) -> Self {
        self.udp_max_size = size;
        self
    }

    pub fn test_domains(mut self, domains: Vec<String>) -> Self {
        if !domains.is_empty() {
            self.test_domains = domains;
        }
        self
    }

    pub fn build(self) -> Config {
        Config {
            listen: self.listen,
            region: Arc::new(self.region),
            ip_blacklist: Arc::new(self.ip_blacklist),
            domain_blacklist: Arc::new(self.domain_blacklist),
            polluted: Arc::new(self.polluted),
            servers: self.servers,
            trusted_servers: self.trusted_servers,
            bidirectional: self.bidirectional,
            mutation: self.mutation,
            reuse_port: self.reuse_port,
            skip_refine: self.skip_refine,
            timeout: self.timeout,
            delay: self.delay,
            udp_max_size: self.udp_max_size,
            test_domains: self.test_domains,
        }
    }
}

fn read_entries(path: &Path) -> Result<Vec<(usize, String)>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(content
        .lines()
        .enumerate()
        .filter_map(|(i, line)| {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                None
            } else {
                Some((i + 1, line.to_string()))
            }
        })
        .collect())
}
