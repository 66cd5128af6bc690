//! Cross-validation of racing trusted and untrusted replies.
//!
//! Every query fans out to both pools at once. Whichever reply lands first
//! is judged against the region set and the IP blacklist; a suspicious
//! answer is held while the other pool gets a chance to do better, and
//! becomes the fallback if the other pool never delivers.
//!
//! The rules, from the perspective of the first A/AAAA answer:
//!
//! - untrusted + in-region: the geographically optimal answer, use it
//! - untrusted + outside region: in-region resolvers rarely hand out
//!   overseas addresses legitimately, hold for the trusted reply
//! - trusted: use it, unless bidirectional mode is on and the answer is
//!   in-region (a distant resolver naming an in-region address is unlikely
//!   to be the nearest mirror), then hold for the untrusted reply
//! - either side + blacklisted answer: hold for the other side
//!
//! Replies whose answers are all CNAMEs or other record types are accepted
//! as they are.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::RData;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Exchange;
use crate::filter::{DomainSet, IpSet};
use crate::race::{race, LookupKind};
use crate::upstream::Upstream;

/// The decision engine. Shared by every in-flight query; everything in here
/// is read-only after startup.
pub struct Resolver {
    pub exchange: Arc<dyn Exchange>,
    pub trusted: Arc<Vec<Upstream>>,
    pub untrusted: Arc<Vec<Upstream>>,
    pub region: Arc<IpSet>,
    pub ip_blacklist: Arc<IpSet>,
    pub domain_blacklist: Arc<DomainSet>,
    pub polluted: Arc<DomainSet>,
    /// Double-check trusted replies whose answers are in-region.
    pub bidirectional: bool,
    /// Send compression-pointer-mutated queries to the trusted pool.
    pub mutation: bool,
    /// Stagger between resolver starts within one pool.
    pub delay: Duration,
    /// Budget for the whole decision, fan-outs included.
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Trusted,
    Untrusted,
}

impl Resolver {
    /// Answer one query. Always produces a reply: when neither pool
    /// delivers, a minimal empty reply with the original ID is synthesized.
    pub async fn resolve(&self, req: &Message) -> Message {
        let Some(question) = req.queries().first() else {
            return minimal_reply(req);
        };
        let qname = question.name().to_ascii();

        if self.domain_blacklist.contains(&qname) {
            debug!(question = %qname, "question is blacklisted");
            return minimal_reply(req);
        }

        let parent = CancellationToken::new();
        let trusted_token = parent.child_token();
        let untrusted_token = parent.child_token();
        let (trusted_tx, mut trusted_rx) = mpsc::channel(1);
        let (untrusted_tx, mut untrusted_rx) = mpsc::channel(1);

        let kind = if self.mutation {
            LookupKind::Mutated
        } else {
            LookupKind::Plain
        };

        let mut fanouts = JoinSet::new();
        fanouts.spawn(race(
            self.exchange.clone(),
            self.trusted.clone(),
            req.clone(),
            self.delay,
            kind,
            trusted_tx,
            trusted_token.clone(),
        ));
        if self.polluted.contains(&qname) {
            debug!(question = %qname, "question is polluted, untrusted pool skipped");
            untrusted_token.cancel();
        } else {
            fanouts.spawn(race(
                self.exchange.clone(),
                self.untrusted.clone(),
                req.clone(),
                self.delay,
                LookupKind::Plain,
                untrusted_tx,
                untrusted_token.clone(),
            ));
        }

        // The wait ends when both fan-outs are finished or the per-query
        // budget runs out, whichever is first.
        {
            let parent = parent.clone();
            let budget = self.timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = async {
                        trusted_token.cancelled().await;
                        untrusted_token.cancelled().await;
                    } => {}
                    _ = tokio::time::sleep(budget) => {}
                }
                parent.cancel();
            });
        }

        // A reply that is already buffered beats a cancellation that lands
        // in the same instant.
        let first = tokio::select! {
            biased;
            Some(rep) = untrusted_rx.recv() => Some((rep, Side::Untrusted)),
            Some(rep) = trusted_rx.recv() => Some((rep, Side::Trusted)),
            _ = parent.cancelled() => None,
        };
        let reply = match first {
            Some((rep, Side::Untrusted)) => {
                Some(self.judge(rep, Side::Untrusted, Some(&mut trusted_rx), &parent).await)
            }
            Some((rep, Side::Trusted)) => {
                Some(self.judge(rep, Side::Trusted, Some(&mut untrusted_rx), &parent).await)
            }
            None => None,
        };
        parent.cancel();
        while fanouts.join_next().await.is_some() {}

        reply.unwrap_or_else(|| minimal_reply(req))
    }

    /// Judge one reply; possibly hold it while waiting on the other pool.
    /// The counterpart reply is judged in turn, but without a channel of its
    /// own — a second hold resolves once the parent context ends.
    async fn judge(
        &self,
        reply: Message,
        side: Side,
        other: Option<&mut mpsc::Receiver<Message>>,
        parent: &CancellationToken,
    ) -> Message {
        let Some(answer) = first_address(&reply) else {
            return reply;
        };

        let hold = match side {
            Side::Untrusted => self.hold_untrusted(answer),
            Side::Trusted => self.hold_trusted(answer),
        };
        if !hold {
            return reply;
        }

        let counterpart = match side {
            Side::Trusted => Side::Untrusted,
            Side::Untrusted => Side::Trusted,
        };
        match other {
            Some(rx) => {
                tokio::select! {
                    biased;
                    Some(rep) = rx.recv() => {
                        Box::pin(self.judge(rep, counterpart, None, parent)).await
                    }
                    _ = parent.cancelled() => {
                        debug!(?side, "no counterpart reply, using held reply as fallback");
                        reply
                    }
                }
            }
            None => {
                parent.cancelled().await;
                reply
            }
        }
    }

    /// Whether an untrusted answer should be held for cross-checking.
    fn hold_untrusted(&self, answer: IpAddr) -> bool {
        if self.ip_blacklist.contains(answer) {
            debug!(%answer, "untrusted answer hit the blacklist, holding");
            return true;
        }
        if self.region.contains(answer) {
            debug!(%answer, "untrusted answer is in-region, using it");
            return false;
        }
        debug!(%answer, "untrusted answer is outside the region, holding");
        true
    }

    /// Whether a trusted answer should be held for cross-checking.
    fn hold_trusted(&self, answer: IpAddr) -> bool {
        if self.ip_blacklist.contains(answer) {
            debug!(%answer, "trusted answer hit the blacklist, holding");
            return true;
        }
        if !self.bidirectional {
            debug!(%answer, "trusted answer, using it");
            return false;
        }
        if !self.region.contains(answer) {
            debug!(%answer, "trusted answer is outside the region, using it");
            return false;
        }
        debug!(%answer, "trusted answer is in-region, holding for a nearer one");
        true
    }
}

/// First A/AAAA address in the answer section, skipping leading CNAMEs.
/// `None` means the reply carries no address to judge and is accepted as-is.
fn first_address(reply: &Message) -> Option<IpAddr> {
    let answers = reply.answers();
    for (i, record) in answers.iter().enumerate() {
        match record.data() {
            RData::A(a) => return Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => return Some(IpAddr::V6(aaaa.0)),
            RData::CNAME(target) => {
                if i < answers.len() - 1 {
                    continue;
                }
                debug!(cname = %target.to_utf8(), "reply ends in a cname");
                return None;
            }
            _ => return None,
        }
    }
    None
}

/// An empty NOERROR reply mirroring the request's ID and question.
pub fn minimal_reply(req: &Message) -> Message {
    let mut reply = Message::new();
    reply.set_id(req.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(req.op_code());
    reply.set_recursion_desired(req.recursion_desired());
    reply.set_recursion_available(true);
    reply.add_queries(req.queries().to_vec());
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LookupError;
    use crate::upstream::parse_upstream;
    use async_trait::async_trait;
    use hickory_proto::op::{OpCode, Query};
    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_proto::rr::{Name, Record, RecordType};
    use std::collections::HashMap;
    use std::str::FromStr;

    const DELAY: Duration = Duration::from_millis(100);
    const TIMEOUT: Duration = Duration::from_secs(1);

    fn query(name: &str) -> Message {
        let mut q = Query::new();
        q.set_name(Name::from_str(name).unwrap());
        q.set_query_type(RecordType::A);
        let mut msg = Message::new();
        msg.set_id(0x1d0c);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(q);
        msg
    }

    fn address_reply(req: &Message, ip: IpAddr) -> Message {
        let mut reply = minimal_reply(req);
        let name = req.queries()[0].name().clone();
        let rdata = match ip {
            IpAddr::V4(v4) => RData::A(A(v4)),
            IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
        };
        reply.add_answer(Record::from_rdata(name, 300, rdata));
        reply
    }

    /// Per-upstream script: reply after a latency, or fail.
    struct Script {
        latency: Duration,
        answer: Option<IpAddr>,
    }

    struct ScriptedExchange {
        scripts: HashMap<String, Script>,
    }

    impl ScriptedExchange {
        fn new(scripts: Vec<(&str, u64, Option<&str>)>) -> Arc<Self> {
            Arc::new(Self {
                scripts: scripts
                    .into_iter()
                    .map(|(addr, ms, ip)| {
                        (
                            addr.to_string(),
                            Script {
                                latency: Duration::from_millis(ms),
                                answer: ip.map(|s| s.parse().unwrap()),
                            },
                        )
                    })
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl Exchange for ScriptedExchange {
        async fn lookup(
            &self,
            req: Message,
            upstream: &Upstream,
        ) -> Result<(Message, Duration), LookupError> {
            let script = &self.scripts[upstream.addr()];
            tokio::time::sleep(script.latency).await;
            match script.answer {
                Some(ip) => Ok((address_reply(&req, ip), script.latency)),
                None => Err(LookupError::Timeout),
            }
        }

        async fn lookup_mutated(
            &self,
            req: Message,
            upstream: &Upstream,
        ) -> Result<(Message, Duration), LookupError> {
            self.lookup(req, upstream).await
        }
    }

    struct Fixture {
        trusted: &'static str,
        untrusted: &'static str,
        region: Vec<&'static str>,
        ip_blacklist: Vec<&'static str>,
        domain_blacklist: Vec<&'static str>,
        polluted: Vec<&'static str>,
        bidirectional: bool,
    }

    impl Default for Fixture {
        fn default() -> Self {
            Self {
                trusted: "8.8.8.8:53",
                untrusted: "114.114.114.114:53",
                region: vec!["1.0.0.0/8"],
                ip_blacklist: vec![],
                domain_blacklist: vec![],
                polluted: vec![],
                bidirectional: true,
            }
        }
    }

    impl Fixture {
        fn resolver(self, exchange: Arc<ScriptedExchange>) -> Resolver {
            let mut region = IpSet::new();
            for net in self.region {
                region.insert_entry(net).unwrap();
            }
            let mut ip_blacklist = IpSet::new();
            for net in self.ip_blacklist {
                ip_blacklist.insert_entry(net).unwrap();
            }
            let mut domain_blacklist = DomainSet::new();
            for d in self.domain_blacklist {
                domain_blacklist.insert(d);
            }
            let mut polluted = DomainSet::new();
            for d in self.polluted {
                polluted.insert(d);
            }
            Resolver {
                exchange,
                trusted: Arc::new(vec![parse_upstream(self.trusted, false).unwrap()]),
                untrusted: Arc::new(vec![parse_upstream(self.untrusted, false).unwrap()]),
                region: Arc::new(region),
                ip_blacklist: Arc::new(ip_blacklist),
                domain_blacklist: Arc::new(domain_blacklist),
                polluted: Arc::new(polluted),
                bidirectional: self.bidirectional,
                mutation: false,
                delay: DELAY,
                timeout: TIMEOUT,
            }
        }
    }

    fn answers(reply: &Message) -> Vec<IpAddr> {
        reply
            .answers()
            .iter()
            .filter_map(|r| match r.data() {
                RData::A(a) => Some(IpAddr::V4(a.0)),
                RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn in_region_untrusted_answer_wins() {
        // Trusted answers overseas, untrusted answers in-region: the
        // untrusted reply is the geographically optimal one.
        let exchange = ScriptedExchange::new(vec![
            ("8.8.8.8:53", 50, Some("203.0.113.5")),
            ("114.114.114.114:53", 10, Some("1.2.3.4")),
        ]);
        let resolver = Fixture::default().resolver(exchange);

        let reply = resolver.resolve(&query("example.cn.")).await;
        assert_eq!(answers(&reply), vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test(start_paused = true)]
    async fn overseas_untrusted_answer_is_held_for_trusted() {
        let exchange = ScriptedExchange::new(vec![
            ("8.8.8.8:53", 50, Some("198.51.100.7")),
            ("114.114.114.114:53", 10, Some("9.9.9.9")),
        ]);
        let resolver = Fixture::default().resolver(exchange);

        let reply = resolver.resolve(&query("example.org.")).await;
        assert_eq!(
            answers(&reply),
            vec!["198.51.100.7".parse::<IpAddr>().unwrap()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polluted_domain_skips_the_untrusted_pool() {
        // The untrusted resolver would answer faster and in-region, but for
        // a polluted domain it must never be consulted.
        let exchange = ScriptedExchange::new(vec![
            ("8.8.8.8:53", 50, Some("203.0.113.5")),
            ("114.114.114.114:53", 10, Some("1.2.3.4")),
        ]);
        let resolver = Fixture {
            polluted: vec!["blocked.example"],
            ..Fixture::default()
        }
        .resolver(exchange);

        let reply = resolver.resolve(&query("blocked.example.")).await;
        assert_eq!(
            answers(&reply),
            vec!["203.0.113.5".parse::<IpAddr>().unwrap()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn blacklisted_domain_answers_empty_without_upstream_traffic() {
        let exchange = ScriptedExchange::new(vec![]);
        let resolver = Fixture {
            domain_blacklist: vec!["ads.example"],
            ..Fixture::default()
        }
        .resolver(exchange);

        let req = query("tracker.ads.example.");
        let reply = resolver.resolve(&req).await;
        assert_eq!(reply.id(), req.id());
        assert!(reply.answers().is_empty());
        assert_eq!(reply.queries(), req.queries());
    }

    #[tokio::test(start_paused = true)]
    async fn blacklisted_answer_waits_for_the_other_side() {
        let exchange = ScriptedExchange::new(vec![
            ("8.8.8.8:53", 50, Some("198.51.100.7")),
            ("114.114.114.114:53", 10, Some("10.10.10.10")),
        ]);
        let resolver = Fixture {
            ip_blacklist: vec!["10.10.10.10"],
            ..Fixture::default()
        }
        .resolver(exchange);

        let reply = resolver.resolve(&query("example.com.")).await;
        assert_eq!(
            answers(&reply),
            vec!["198.51.100.7".parse::<IpAddr>().unwrap()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn all_resolvers_failing_synthesizes_an_empty_reply() {
        let exchange = ScriptedExchange::new(vec![
            ("8.8.8.8:53", 10, None),
            ("114.114.114.114:53", 10, None),
        ]);
        let resolver = Fixture::default().resolver(exchange);

        let req = query("example.com.");
        let reply = resolver.resolve(&req).await;
        assert_eq!(reply.id(), req.id());
        assert_eq!(
            reply.response_code(),
            hickory_proto::op::ResponseCode::NoError
        );
        assert!(reply.answers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn held_untrusted_reply_is_the_fallback() {
        // Untrusted answers overseas, trusted never answers: after both
        // fan-outs finish the held reply is all there is.
        let exchange = ScriptedExchange::new(vec![
            ("8.8.8.8:53", 10, None),
            ("114.114.114.114:53", 10, Some("9.9.9.9")),
        ]);
        let resolver = Fixture::default().resolver(exchange);

        let reply = resolver.resolve(&query("example.com.")).await;
        assert_eq!(answers(&reply), vec!["9.9.9.9".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test(start_paused = true)]
    async fn trusted_reply_is_immediate_without_bidirectional() {
        let exchange = ScriptedExchange::new(vec![
            ("8.8.8.8:53", 10, Some("1.2.3.4")),
            ("114.114.114.114:53", 50, Some("1.9.9.9")),
        ]);
        let resolver = Fixture {
            bidirectional: false,
            ..Fixture::default()
        }
        .resolver(exchange);

        let reply = resolver.resolve(&query("example.com.")).await;
        assert_eq!(answers(&reply), vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test(start_paused = true)]
    async fn bidirectional_holds_in_region_trusted_answers() {
        // A trusted resolver naming an in-region address is probably not
        // the nearest mirror; prefer the untrusted in-region answer.
        let exchange = ScriptedExchange::new(vec![
            ("8.8.8.8:53", 10, Some("1.2.3.4")),
            ("114.114.114.114:53", 50, Some("1.9.9.9")),
        ]);
        let resolver = Fixture::default().resolver(exchange);

        let reply = resolver.resolve(&query("example.com.")).await;
        assert_eq!(answers(&reply), vec!["1.9.9.9".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test(start_paused = true)]
    async fn bidirectional_keeps_overseas_trusted_answers() {
        let exchange = ScriptedExchange::new(vec![
            ("8.8.8.8:53", 10, Some("203.0.113.5")),
            ("114.114.114.114:53", 50, Some("1.9.9.9")),
        ]);
        let resolver = Fixture::default().resolver(exchange);

        let reply = resolver.resolve(&query("example.org.")).await;
        assert_eq!(
            answers(&reply),
            vec!["203.0.113.5".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn cname_only_replies_carry_no_address() {
        let req = query("alias.example.");
        let mut reply = minimal_reply(&req);
        reply.add_answer(Record::from_rdata(
            Name::from_str("alias.example.").unwrap(),
            300,
            RData::CNAME(CNAME(Name::from_str("target.example.").unwrap())),
        ));
        assert_eq!(first_address(&reply), None);
    }

    #[test]
    fn first_address_skips_leading_cnames() {
        let req = query("alias.example.");
        let mut reply = minimal_reply(&req);
        reply.add_answer(Record::from_rdata(
            Name::from_str("alias.example.").unwrap(),
            300,
            RData::CNAME(CNAME(Name::from_str("target.example.").unwrap())),
        ));
        reply.add_answer(Record::from_rdata(
            Name::from_str("target.example.").unwrap(),
            300,
            RData::A(A("1.2.3.4".parse().unwrap())),
        ));
        assert_eq!(
            first_address(&reply),
            Some("1.2.3.4".parse::<IpAddr>().unwrap())
        );
    }
}
