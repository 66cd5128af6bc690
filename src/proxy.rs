//! Proxy orchestration.
//!
//! Assembles the upstream client, partitions and refines the resolver
//! pools, wires up the decision engine, and runs the UDP and TCP front
//! ends until one of them fails.

use std::sync::Arc;

use tracing::{info, warn};

use crate::client::Client;
use crate::config::Config;
use crate::hosts::HostsFile;
use crate::probe::{partition, pool_display, refine_pools};
use crate::resolver::Resolver;
use crate::transport::{tcp::TcpTransport, udp::UdpTransport};

/// Run the forwarder with the given configuration. Returns only on
/// listener failure; the caller decides whether to restart.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let client = Arc::new(Client::new(config.timeout, config.udp_max_size, true)?);

    let hosts = HostsFile::system().unwrap_or_else(|err| {
        warn!(%err, "cannot read the hosts file, doh hostnames will not partition");
        HostsFile::default()
    });
    let (mut trusted, mut untrusted) = partition(
        config.servers.clone(),
        config.trusted_servers.clone(),
        &config.region,
        &hosts,
    );
    info!(
        trusted = pool_display(&trusted),
        untrusted = pool_display(&untrusted),
        "partitioned resolvers"
    );

    if config.skip_refine {
        info!("keeping operator-given resolver order");
    } else {
        refine_pools(
            &mut trusted,
            &mut untrusted,
            client.as_ref(),
            &config.test_domains,
            config.bidirectional,
        )
        .await;
    }

    let resolver = Arc::new(Resolver {
        exchange: client,
        trusted: Arc::new(trusted),
        untrusted: Arc::new(untrusted),
        region: config.region.clone(),
        ip_blacklist: config.ip_blacklist.clone(),
        domain_blacklist: config.domain_blacklist.clone(),
        polluted: config.polluted.clone(),
        bidirectional: config.bidirectional,
        mutation: config.mutation,
        delay: config.delay,
        timeout: config.timeout,
    });

    let udp = UdpTransport::bind(config.listen, config.reuse_port)?;
    let tcp = TcpTransport::bind(config.listen, config.reuse_port)?;
    info!(listen = %config.listen, "serving dns on udp and tcp");

    tokio::try_join!(
        udp.run(resolver.clone(), config.udp_max_size),
        tcp.run(resolver),
    )?;
    Ok(())
}
