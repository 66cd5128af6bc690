//! Compression-pointer mutation of outgoing queries.
//!
//! Tampering middleboxes tend to match the QNAME bytes literally and do not
//! follow DNS message-compression pointers (RFC 1035 §4.1.4). Rewriting the
//! query so its name ends in a pointer leaves it perfectly readable for a
//! real resolver while the middlebox no longer recognizes the question.
//!
//! Offset 6 is the high byte of ANCOUNT, which is always zero in a query, so
//! a pointer there reads as the root label and terminates the name.

use std::net::SocketAddr;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{ephemeral_udp_socket, LookupError};

const HEADER_LEN: usize = 12;

/// Rewrite a packed query so the QNAME terminator becomes a compression
/// pointer to offset 6. Only the wire bytes change; callers keep using the
/// structured message for IDs and EDNS bookkeeping.
///
/// A packet too short to hold a question, an already-compressed name, or a
/// name with no terminator in range is returned unchanged.
pub fn mutate_question(packet: &[u8]) -> Vec<u8> {
    // Smallest mutable query: header, one label, terminator, type, class.
    if packet.len() <= 16 {
        return packet.to_vec();
    }

    let mut offset = HEADER_LEN;
    let mut found = false;
    while offset < packet.len() - 4 {
        let len = packet[offset];
        if len & 0xC0 != 0 {
            break;
        }
        if len == 0 {
            found = true;
            break;
        }
        offset += len as usize + 1;
    }
    if !found {
        return packet.to_vec();
    }

    // The terminator at `offset` becomes the two pointer bytes.
    let mut out = Vec::with_capacity(packet.len() + 1);
    out.extend_from_slice(&packet[..offset]);
    out.extend_from_slice(&[0xC0, 0x06]);
    out.extend_from_slice(&packet[offset + 1..]);
    out
}

/// One UDP exchange of pre-packed bytes, bypassing the message codec on the
/// send side. Read and write are both bounded by `deadline`.
pub async fn raw_udp_exchange(
    packet: &[u8],
    addr: SocketAddr,
    expect_id: u16,
    deadline: Duration,
    recv_size: u16,
) -> Result<Message, LookupError> {
    let socket = ephemeral_udp_socket(addr).await?;
    socket.connect(addr).await?;

    timeout(deadline, socket.send(packet))
        .await
        .map_err(|_| LookupError::Timeout)??;

    let mut buf = vec![0u8; recv_size as usize];
    let n = timeout(deadline, socket.recv(&mut buf))
        .await
        .map_err(|_| LookupError::Timeout)??;

    check_reply_id(Message::from_vec(&buf[..n])?, expect_id)
}

/// One TCP exchange of pre-packed bytes with the usual two-byte length
/// framing.
pub async fn raw_tcp_exchange(
    packet: &[u8],
    addr: SocketAddr,
    expect_id: u16,
    deadline: Duration,
) -> Result<Message, LookupError> {
    let mut stream = timeout(deadline, TcpStream::connect(addr))
        .await
        .map_err(|_| LookupError::Timeout)??;

    let mut framed = Vec::with_capacity(packet.len() + 2);
    framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    framed.extend_from_slice(packet);
    timeout(deadline, stream.write_all(&framed))
        .await
        .map_err(|_| LookupError::Timeout)??;

    let len = timeout(deadline, stream.read_u16())
        .await
        .map_err(|_| LookupError::Timeout)??;
    let mut buf = vec![0u8; len as usize];
    timeout(deadline, stream.read_exact(&mut buf))
        .await
        .map_err(|_| LookupError::Timeout)??;

    check_reply_id(Message::from_vec(&buf)?, expect_id)
}

fn check_reply_id(reply: Message, expect_id: u16) -> Result<Message, LookupError> {
    if reply.id() != expect_id {
        return Err(LookupError::IdMismatch);
    }
    Ok(reply)
}
