//! Staggered-start racing of one resolver pool.
//!
//! Resolvers start in pool order. Each start waits for a free start token or
//! the next tick of a `delay`-period ticker, whichever comes first; a failed
//! resolver releases a fresh token so the next one starts immediately
//! instead of waiting out the tick. First success wins, is delivered
//! non-blockingly to the result channel, and cancels the rest.

use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Exchange;
use crate::upstream::Upstream;

/// Which lookup flavor the race drives against each resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Plain,
    Mutated,
}

/// Race the pool for one reply.
///
/// At most one message is delivered to `results` (its capacity is one, and
/// sends never block). `token` is cancelled when a reply is delivered and,
/// regardless of outcome, when the race returns — the decision engine reads
/// that as "this fan-out is finished". The race itself returns only after
/// every task it started has exited.
pub async fn race(
    exchange: Arc<dyn Exchange>,
    pool: Arc<Vec<Upstream>>,
    req: Message,
    delay: Duration,
    kind: LookupKind,
    results: mpsc::Sender<Message>,
    token: CancellationToken,
) {
    // Signals fan-out completion even on early return.
    let _done = token.clone().drop_guard();
    if pool.is_empty() {
        return;
    }

    let mut ticker = interval_at(Instant::now() + delay, delay);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // One seed token; error handlers put fresh ones back.
    let (next_tx, mut next_rx) = mpsc::channel::<()>(pool.len());
    let _ = next_tx.try_send(());

    let mut tasks = JoinSet::new();
    for upstream in pool.iter().cloned() {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = next_rx.recv() => {}
            _ = ticker.tick() => {}
        }

        let exchange = exchange.clone();
        let req = req.clone();
        let results = results.clone();
        let token = token.clone();
        let next_tx = next_tx.clone();
        tasks.spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => return,
                outcome = async {
                    match kind {
                        LookupKind::Plain => exchange.lookup(req, &upstream).await,
                        LookupKind::Mutated => exchange.lookup_mutated(req, &upstream).await,
                    }
                } => outcome,
            };
            match outcome {
                Ok((reply, rtt)) => {
                    debug!(upstream = %upstream, ?rtt, "query rtt");
                    let _ = results.try_send(reply);
                    token.cancel();
                }
                // Failure details were logged at the exchange; release a
                // start token so the next resolver goes now.
                Err(_) => {
                    let _ = next_tx.try_send(());
                }
            }
        });
    }

    while tasks.join_next().await.is_some() {}
}
