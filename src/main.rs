//! Shunt - a split-horizon DNS forwarder.
//!
//! Forwards DNS queries to trusted and in-region upstream pools in
//! parallel and cross-validates the answers against a region CIDR set.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use shunt::config::{Config, ConfigBuilder};
use shunt::proxy;

#[derive(Parser)]
#[command(name = "shunt")]
#[command(about = "Split-horizon DNS forwarder", version)]
struct Args {
    /// Bind address
    #[arg(short, long, default_value = "::")]
    bind: IpAddr,

    /// Listening port
    #[arg(short, long, default_value_t = 53)]
    port: u16,

    /// Path to the region CIDR list, one network per line
    #[arg(short = 'c', long)]
    region_file: PathBuf,

    /// Path to the IP blacklist file (CIDR or bare IP, one per line)
    #[arg(short = 'l', long)]
    ip_blacklist: Option<PathBuf>,

    /// Path to the domain blacklist file
    #[arg(long)]
    domain_blacklist: Option<PathBuf>,

    /// Path to the polluted-domain list; these never reach in-region resolvers
    #[arg(long)]
    domain_polluted: Option<PathBuf>,

    /// Upstream resolver specs, e.g. udp+tcp@1.2.4.8 or doh@https://doh.pub/dns-query.
    /// Trust is decided by region membership of the address.
    #[arg(short = 's', long = "server", required = true)]
    servers: Vec<String>,

    /// Resolvers forced into the trusted pool regardless of address
    #[arg(long = "trusted-server")]
    trusted_servers: Vec<String>,

    /// Force TCP for resolvers given in bare ip[:port] form
    #[arg(long)]
    force_tcp: bool,

    /// Enable compression pointer mutation for trusted queries
    #[arg(short = 'm', long)]
    mutation: bool,

    /// Disable cross-checking of trusted answers that lie inside the region
    #[arg(long)]
    no_bidirectional: bool,

    /// Disable SO_REUSEPORT on the listeners
    #[arg(long)]
    no_reuse_port: bool,

    /// Keep the operator-given resolver order, skip startup probing
    #[arg(long)]
    skip_refine: bool,

    /// Per-exchange timeout in seconds
    #[arg(long, default_value_t = 1.0)]
    timeout: f64,

    /// Delay in seconds before the next resolver in a pool is started
    #[arg(short = 'y', long, default_value_t = 0.1)]
    delay: f64,

    /// DNS max message size announced on UDP
    #[arg(long, default_value_t = 4096)]
    udp_max_bytes: u16,

    /// Domains used to probe resolver health at startup, comma separated
    #[arg(long, default_value = "example.com", value_delimiter = ',')]
    test_domains: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "shunt=debug" } else { "shunt=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = load_config(&args)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(supervise(config));

    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let listen = SocketAddr::new(args.bind, args.port);

    // Sets first, then resolvers; the proxy partitions at startup.
    let mut builder = ConfigBuilder::new(listen).region_file(&args.region_file)?;
    if let Some(path) = &args.ip_blacklist {
        builder = builder.ip_blacklist_file(path)?;
    }
    if let Some(path) = &args.domain_blacklist {
        builder = builder.domain_blacklist_file(path)?;
    }
    if let Some(path) = &args.domain_polluted {
        builder = builder.polluted_file(path)?;
    }
    let builder = builder
        .resolvers(&args.servers, args.force_tcp)?
        .trusted_resolvers(&args.trusted_servers, args.force_tcp)?
        .bidirectional(!args.no_bidirectional)
        .mutation(args.mutation)
        .reuse_port(!args.no_reuse_port)
        .skip_refine(args.skip_refine)
        .timeout(Duration::from_secs_f64(args.timeout))
        .delay(Duration::from_secs_f64(args.delay))
        .udp_max_size(args.udp_max_bytes)
        .test_domains(args.test_domains.clone());

    Ok(builder.build())
}

/// Keep the proxy running. Listener failures restart it with exponential
/// backoff; a clean run resets the gap.
async fn supervise(config: Config) {
    const MIN_GAP: Duration = Duration::from_millis(100);
    const MAX_GAP: Duration = Duration::from_secs(16);

    let mut gap = MIN_GAP;
    loop {
        match proxy::run(config.clone()).await {
            Ok(()) => gap = MIN_GAP,
            Err(err) => error!(%err, "server exited"),
        }
        tokio::time::sleep(gap).await;
        gap = (gap * 2).min(MAX_GAP);
    }
}
