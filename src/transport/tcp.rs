//! TCP front end.
//!
//! TCP DNS messages carry a two-byte big-endian length prefix. Each
//! connection is served on its own task and may carry several queries in
//! sequence; the connection closes on the first framing error or EOF.

use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

use super::MAX_DNS_PACKET_SIZE;
use crate::resolver::Resolver;

/// TCP listener; accepts connections and serves each on its own task.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    pub fn bind(addr: SocketAddr, reuse_port: bool) -> io::Result<Self> {
        Ok(Self {
            listener: bind_tcp(addr, reuse_port)?,
        })
    }

    pub async fn run(self, resolver: Arc<Resolver>) -> io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(handle_connection(stream, resolver.clone()));
                }
                Err(err) => {
                    error!(%err, "tcp accept error");
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, resolver: Arc<Resolver>) {
    loop {
        let Ok(len) = stream.read_u16().await else {
            return;
        };
        if len as usize > MAX_DNS_PACKET_SIZE {
            debug!("oversized tcp query, closing");
            return;
        }
        let mut buf = vec![0u8; len as usize];
        if stream.read_exact(&mut buf).await.is_err() {
            return;
        }
        let Ok(req) = Message::from_vec(&buf) else {
            debug!("dropping unparseable query");
            return;
        };

        let reply = match AssertUnwindSafe(resolver.resolve(&req)).catch_unwind().await {
            Ok(reply) => reply,
            Err(_) => {
                error!("query handler panicked");
                return;
            }
        };
        let packet = match reply.to_vec() {
            Ok(packet) => packet,
            Err(err) => {
                error!(%err, "failed to encode reply");
                return;
            }
        };

        let mut framed = Vec::with_capacity(packet.len() + 2);
        framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        framed.extend_from_slice(&packet);
        if stream.write_all(&framed).await.is_err() {
            return;
        }
    }
}

fn bind_tcp(addr: SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}
