//! Upstream exchanges: one query to one resolver.
//!
//! A resolver lists its transport protocols in order; the next protocol is
//! attempted only after the previous one failed. The reported RTT is
//! cumulative across the attempted protocols, so a resolver that keeps
//! failing over looks as slow as it really is to the prober.

pub mod doh;
pub mod mutation;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Edns, Message};
use hickory_proto::ProtoError;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::warn;

use crate::upstream::{Protocol, Upstream};
use doh::DohClient;

/// Smallest UDP payload every DNS implementation must accept (RFC 1035).
pub const MIN_UDP_SIZE: u16 = 512;

/// Failure of a single upstream exchange. The fan-out treats any of these as
/// a signal to accelerate the next resolver.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("exchange timed out")]
    Timeout,
    #[error("reply id does not match request id")]
    IdMismatch,
    #[error("codec failure: {0}")]
    Proto(#[from] ProtoError),
    #[error("doh transport failure: {0}")]
    Http(#[from] reqwest::Error),
    #[error("doh endpoint returned status {0}")]
    DohStatus(u16),
    #[error("not allowed to query myself")]
    QueryMyself,
    #[error("no usable protocol for this resolver")]
    NoProtocol,
}

/// The lookup surface the fan-out and decision engines run against.
///
/// Split out as a trait so the policy machinery can be exercised with
/// scripted replies instead of sockets.
#[async_trait]
pub trait Exchange: Send + Sync + 'static {
    /// Query `upstream`, trying its protocols in declared order.
    async fn lookup(
        &self,
        req: Message,
        upstream: &Upstream,
    ) -> Result<(Message, Duration), LookupError>;

    /// Like [`Exchange::lookup`], but the packed query bytes are rewritten
    /// with a QNAME compression pointer before sending.
    async fn lookup_mutated(
        &self,
        req: Message,
        upstream: &Upstream,
    ) -> Result<(Message, Duration), LookupError>;
}

/// Socket-backed upstream client shared by every in-flight query. Holds no
/// per-query state; TCP and DoH use one connection per exchange and UDP
/// binds an ephemeral socket per exchange.
pub struct Client {
    timeout: Duration,
    udp_max_size: u16,
    doh: DohClient,
}

impl Client {
    pub fn new(
        timeout: Duration,
        udp_max_size: u16,
        skip_query_self: bool,
    ) -> Result<Self, LookupError> {
        Ok(Self {
            timeout,
            udp_max_size,
            doh: DohClient::new(timeout, skip_query_self)?,
        })
    }

    async fn udp_exchange(
        &self,
        req: &mut Message,
        addr: SocketAddr,
    ) -> Result<Message, LookupError> {
        let size = apply_udp_size(req, self.udp_max_size);
        let packet = req.to_vec()?;

        let socket = ephemeral_udp_socket(addr).await?;
        socket.connect(addr).await?;
        timeout(self.timeout, socket.send(&packet))
            .await
            .map_err(|_| LookupError::Timeout)??;

        let mut buf = vec![0u8; size as usize];
        let n = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| LookupError::Timeout)??;

        let reply = Message::from_vec(&buf[..n])?;
        if reply.id() != req.id() {
            return Err(LookupError::IdMismatch);
        }
        Ok(reply)
    }

    async fn tcp_exchange(&self, req: &Message, addr: SocketAddr) -> Result<Message, LookupError> {
        let packet = req.to_vec()?;
        let mut stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| LookupError::Timeout)??;

        let mut framed = Vec::with_capacity(packet.len() + 2);
        framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        framed.extend_from_slice(&packet);
        timeout(self.timeout, stream.write_all(&framed))
            .await
            .map_err(|_| LookupError::Timeout)??;

        let len = timeout(self.timeout, stream.read_u16())
            .await
            .map_err(|_| LookupError::Timeout)??;
        let mut buf = vec![0u8; len as usize];
        timeout(self.timeout, stream.read_exact(&mut buf))
            .await
            .map_err(|_| LookupError::Timeout)??;

        let reply = Message::from_vec(&buf)?;
        if reply.id() != req.id() {
            return Err(LookupError::IdMismatch);
        }
        Ok(reply)
    }
}

#[async_trait]
impl Exchange for Client {
    async fn lookup(
        &self,
        mut req: Message,
        upstream: &Upstream,
    ) -> Result<(Message, Duration), LookupError> {
        let mut rtt = Duration::ZERO;
        let mut truncated_reply = None;
        let mut last_err = LookupError::NoProtocol;

        for (i, &proto) in upstream.protocols().iter().enumerate() {
            let begin = Instant::now();
            let attempt = match proto {
                Protocol::Udp => match upstream.socket_addr() {
                    Some(addr) => self.udp_exchange(&mut req, addr).await,
                    None => Err(LookupError::NoProtocol),
                },
                Protocol::Tcp => match upstream.socket_addr() {
                    Some(addr) => self.tcp_exchange(&req, addr).await,
                    None => Err(LookupError::NoProtocol),
                },
                Protocol::Doh => self.doh.exchange(&req, upstream.addr()).await,
            };
            rtt += begin.elapsed();

            match attempt {
                Ok(reply) => {
                    let more_left = i + 1 < upstream.protocols().len();
                    if reply.truncated() && proto == Protocol::Udp && more_left {
                        warn!(upstream = %upstream, "truncated reply, trying next protocol");
                        truncated_reply = Some(reply);
                        continue;
                    }
                    return Ok((reply, rtt));
                }
                Err(err) => {
                    warn!(upstream = %upstream, proto = %proto, error = %err, "exchange failed");
                    last_err = err;
                }
            }
        }

        // Every later protocol failed outright; a truncated reply beats none.
        match truncated_reply {
            Some(reply) => Ok((reply, rtt)),
            None => Err(last_err),
        }
    }

    async fn lookup_mutated(
        &self,
        req: Message,
        upstream: &Upstream,
    ) -> Result<(Message, Duration), LookupError> {
        let packet = mutation::mutate_question(&req.to_vec()?);
        let recv_size = announced_udp_size(&req);

        let begin = Instant::now();
        let mut truncated_reply = None;
        let mut last_err = LookupError::NoProtocol;

        for (i, &proto) in upstream.protocols().iter().enumerate() {
            let Some(addr) = upstream.socket_addr() else {
                last_err = LookupError::NoProtocol;
                break;
            };
            let attempt = match proto {
                Protocol::Udp => {
                    mutation::raw_udp_exchange(&packet, addr, req.id(), self.timeout, recv_size)
                        .await
                }
                Protocol::Tcp => {
                    mutation::raw_tcp_exchange(&packet, addr, req.id(), self.timeout).await
                }
                Protocol::Doh => {
                    warn!(upstream = %upstream, "mutation lookup has no doh transport");
                    last_err = LookupError::NoProtocol;
                    continue;
                }
            };

            match attempt {
                Ok(reply) => {
                    let more_left = i + 1 < upstream.protocols().len();
                    if reply.truncated() && proto == Protocol::Udp && more_left {
                        warn!(upstream = %upstream, "truncated reply, trying next protocol");
                        truncated_reply = Some(reply);
                        continue;
                    }
                    return Ok((reply, begin.elapsed()));
                }
                Err(err) => {
                    warn!(upstream = %upstream, proto = %proto, error = %err, "mutated exchange failed");
                    last_err = err;
                }
            }
        }

        match truncated_reply {
            Some(reply) => Ok((reply, begin.elapsed())),
            None => Err(last_err),
        }
    }
}

/// Bind an ephemeral UDP socket in the same address family as `peer`.
pub(crate) async fn ephemeral_udp_socket(peer: SocketAddr) -> std::io::Result<UdpSocket> {
    let bind: SocketAddr = if peer.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    UdpSocket::bind(bind).await
}

/// Raise (or create) the EDNS0 OPT record so the upstream may answer with
/// payloads up to `size`. An already-larger announced size wins. Returns the
/// effective receive-buffer size; never below the 512-byte floor.
pub fn apply_udp_size(req: &mut Message, size: u16) -> u16 {
    if size <= MIN_UDP_SIZE {
        return MIN_UDP_SIZE;
    }
    if let Some(edns) = req.extensions_mut() {
        if edns.max_payload() >= size {
            return edns.max_payload();
        }
    }
    req.extensions_mut()
        .get_or_insert_with(Edns::new)
        .set_max_payload(size);
    size
}

/// The payload size a query announces, used to size raw receive buffers.
pub fn announced_udp_size(req: &Message) -> u16 {
    match req.extensions() {
        Some(edns) if edns.max_payload() > MIN_UDP_SIZE => edns.max_payload(),
        _ => MIN_UDP_SIZE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode};

    fn bare_query() -> Message {
        let mut msg = Message::new();
        msg.set_id(1);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg
    }

    #[test]
    fn apply_udp_size_creates_opt_when_absent() {
        let mut req = bare_query();
        assert_eq!(apply_udp_size(&mut req, 4096), 4096);
        assert_eq!(req.extensions().as_ref().unwrap().max_payload(), 4096);
    }

    #[test]
    fn apply_udp_size_raises_smaller_opt() {
        let mut req = bare_query();
        let mut edns = Edns::new();
        edns.set_max_payload(1232);
        req.set_edns(edns);
        assert_eq!(apply_udp_size(&mut req, 4096), 4096);
        assert_eq!(req.extensions().as_ref().unwrap().max_payload(), 4096);
    }

    #[test]
    fn apply_udp_size_keeps_larger_opt() {
        let mut req = bare_query();
        let mut edns = Edns::new();
        edns.set_max_payload(8192);
        req.set_edns(edns);
        assert_eq!(apply_udp_size(&mut req, 4096), 8192);
        assert_eq!(req.extensions().as_ref().unwrap().max_payload(), 8192);
    }

    #[test]
    fn apply_udp_size_floors_at_minimum() {
        let mut req = bare_query();
        assert_eq!(apply_udp_size(&mut req, 256), MIN_UDP_SIZE);
        assert!(req.extensions().is_none());
    }

    #[test]
    fn announced_udp_size_defaults_to_minimum() {
        assert_eq!(announced_udp_size(&bare_query()), MIN_UDP_SIZE);
    }
}
