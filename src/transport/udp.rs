//! UDP front end.

use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tracing::{debug, error};

use super::MAX_DNS_PACKET_SIZE;
use crate::client::apply_udp_size;
use crate::resolver::Resolver;

/// UDP listener. One socket shared by the receive loop and every in-flight
/// reply writer.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr, reuse_port: bool) -> io::Result<Self> {
        Ok(Self {
            socket: Arc::new(bind_udp(addr, reuse_port)?),
        })
    }

    /// Receive queries forever. Queries arriving over UDP get their EDNS0
    /// payload size raised (or an OPT created) to `udp_max_size` before
    /// they reach the upstream pools.
    pub async fn run(self, resolver: Arc<Resolver>, udp_max_size: u16) -> io::Result<()> {
        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        loop {
            let (n, src) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(err) => {
                    error!(%err, "udp recv error");
                    continue;
                }
            };
            let Ok(mut req) = Message::from_vec(&buf[..n]) else {
                debug!(%src, "dropping unparseable query");
                continue;
            };
            apply_udp_size(&mut req, udp_max_size);

            let socket = self.socket.clone();
            let resolver = resolver.clone();
            tokio::spawn(async move {
                let reply = match AssertUnwindSafe(resolver.resolve(&req)).catch_unwind().await {
                    Ok(reply) => reply,
                    Err(_) => {
                        error!(%src, "query handler panicked");
                        return;
                    }
                };
                match reply.to_vec() {
                    Ok(packet) => {
                        if let Err(err) = socket.send_to(&packet, src).await {
                            error!(%err, %src, "udp reply write failed");
                        }
                    }
                    Err(err) => error!(%err, "failed to encode reply"),
                }
            });
        }
    }
}

fn bind_udp(addr: SocketAddr, reuse_port: bool) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_to_an_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(UdpTransport::bind(addr, false).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reuse_port_allows_a_second_binding() {
        let addr: SocketAddr = "127.0.0.1:15359".parse().unwrap();
        let first = UdpTransport::bind(addr, true).unwrap();
        let second = UdpTransport::bind(addr, true);
        drop(first);
        assert!(second.is_ok());
    }
}
