//! Startup probing: partition the resolvers into pools, then rank each pool
//! by measured health.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use tracing::{error, info, warn};

use crate::client::Exchange;
use crate::filter::IpSet;
use crate::hosts::HostsFile;
use crate::upstream::{append_unique, Upstream};

/// Probe iterations per resolver per test domain.
const PROBE_ROUNDS: usize = 3;

/// Split resolvers into the trusted and untrusted pools.
///
/// Declared-trusted resolvers are forced into the trusted pool. The rest
/// partition by address: in-region resolvers are the untrusted pool (near,
/// possibly tampered), out-of-region ones the trusted pool. DoH resolvers
/// named by hostname resolve through the local hosts file only; when that
/// fails they are assumed trusted, with a warning. Pools dedup by address.
pub fn partition(
    servers: Vec<Upstream>,
    declared_trusted: Vec<Upstream>,
    region: &IpSet,
    hosts: &HostsFile,
) -> (Vec<Upstream>, Vec<Upstream>) {
    let mut trusted = Vec::new();
    let mut untrusted = Vec::new();

    for upstream in declared_trusted {
        append_unique(&mut trusted, upstream);
    }
    for upstream in servers {
        if trusted.iter().any(|u| u.addr() == upstream.addr()) {
            continue;
        }
        match partition_ip(&upstream, hosts) {
            Some(ip) if region.contains(ip) => append_unique(&mut untrusted, upstream),
            Some(_) => append_unique(&mut trusted, upstream),
            None => {
                warn!(upstream = %upstream, "no address to partition by, assuming trusted");
                append_unique(&mut trusted, upstream);
            }
        }
    }
    (trusted, untrusted)
}

fn partition_ip(upstream: &Upstream, hosts: &HostsFile) -> Option<IpAddr> {
    if let Some(addr) = upstream.socket_addr() {
        return Some(addr.ip());
    }
    let host = upstream.doh_host()?;
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    hosts.lookup(&host)
}

/// Probe every resolver in `pool` and reorder it ascending by
/// `(error count, mean RTT)`. Chronically failing resolvers stay in the
/// pool; the returned count of healthy members lets the caller warn when a
/// pool has none.
pub async fn refine(
    pool: &mut Vec<Upstream>,
    exchange: &dyn Exchange,
    test_domains: &[String],
) -> usize {
    struct Tally {
        err_cnt: usize,
        rtt_avg: Duration,
    }

    let samples = PROBE_ROUNDS * test_domains.len();
    let mut tallies = Vec::with_capacity(pool.len());

    for upstream in pool.iter() {
        let mut err_cnt = 0;
        let mut rtt_sum = Duration::ZERO;
        for _ in 0..PROBE_ROUNDS {
            for domain in test_domains {
                match exchange.lookup(probe_query(domain), upstream).await {
                    Ok((_, rtt)) => rtt_sum += rtt,
                    Err(_) => err_cnt += 1,
                }
            }
        }
        let ok = samples - err_cnt;
        let rtt_avg = if ok > 0 {
            rtt_sum / ok as u32
        } else {
            Duration::ZERO
        };
        info!(upstream = %upstream, ?rtt_avg, err_cnt, "probed");
        tallies.push(Tally { err_cnt, rtt_avg });
    }

    let mut order: Vec<usize> = (0..pool.len()).collect();
    order.sort_by_key(|&i| (tallies[i].err_cnt, tallies[i].rtt_avg));
    *pool = order.iter().map(|&i| pool[i].clone()).collect();

    tallies.iter().filter(|t| t.err_cnt <= samples / 2).count()
}

/// Refine both pools and warn the operator about pools with no healthy
/// member.
pub async fn refine_pools(
    trusted: &mut Vec<Upstream>,
    untrusted: &mut Vec<Upstream>,
    exchange: &dyn Exchange,
    test_domains: &[String],
    bidirectional: bool,
) {
    let healthy_trusted = refine(trusted, exchange, test_domains).await;
    let healthy_untrusted = refine(untrusted, exchange, test_domains).await;

    if healthy_trusted == 0 {
        error!("no healthy trusted resolver; the server may not behave properly");
    }
    if healthy_untrusted == 0 && bidirectional {
        error!("no healthy untrusted resolver; bidirectional mode may not behave properly");
    }
    info!(pool = pool_display(trusted), "refined trusted resolvers");
    info!(pool = pool_display(untrusted), "refined untrusted resolvers");
}

pub fn pool_display(pool: &[Upstream]) -> String {
    pool.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn probe_query(domain: &str) -> Message {
    let mut msg = Message::new();
    msg.set_id(fastrand::u16(..));
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    if let Ok(name) = Name::from_str(domain) {
        let mut query = Query::new();
        query.set_name(name);
        query.set_query_type(RecordType::A);
        msg.add_query(query);
    }
    msg
}
