//! One query/response exchange with one nameserver.
//!
//! UDP sends a single datagram and waits for a matching reply; TCP uses the
//! two-byte length prefix framing. Every wait goes through the injected
//! [`Selector`] and is bounded by the caller's deadline.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::proto_utils::{is_reply_to, parse_header_quick};
use crate::selector::{Selector, Watched};

/// Largest datagram we accept.
const MAX_UDP_RESPONSE_SIZE: usize = 65535;

/// Why a single exchange produced no usable response.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting for a response")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed response: {0}")]
    Malformed(#[from] ProtoError),

    #[error("connection closed by server")]
    Closed,
}

/// Builds a recursive query with a random id.
pub fn build_query(name: &Name, rtype: RecordType, rclass: DNSClass) -> Message {
    let mut query = Query::query(name.clone(), rtype);
    query.set_query_class(rclass);

    let mut msg = Message::new();
    msg.set_id(rand::random::<u16>());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(query);
    msg
}

/// True when `response` answers `query`: same id, QR set, same question.
pub fn is_response_to(query: &Message, response: &Message) -> bool {
    response.id() == query.id()
        && response.message_type() == MessageType::Response
        && response.queries() == query.queries()
}

fn new_udp_socket(server: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if server.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_recv_buffer_size(256 * 1024) {
        warn!(target = "transport", error = %e, "failed to set udp recv buffer size");
    }
    let bind: SocketAddr = if server.is_ipv4() {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    socket.bind(&bind.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Sends `wire` (the encoding of `query`) over UDP and waits for the reply.
///
/// Datagrams that don't answer `query` are ignored and the wait continues
/// until `deadline`.
pub async fn udp(
    query: &Message,
    wire: &[u8],
    server: SocketAddr,
    selector: &dyn Selector,
    deadline: Instant,
) -> Result<Message, TransportError> {
    let sock = new_udp_socket(server)?;
    // Connecting filters out datagrams from other sources and surfaces ICMP
    // unreachable as a recv error.
    sock.connect(server).await?;
    timeout_at(deadline, sock.send(wire))
        .await
        .map_err(|_| TransportError::Timeout)??;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    loop {
        if !selector.wait_for_readable(Watched::Udp(&sock), deadline).await? {
            return Err(TransportError::Timeout);
        }
        let len = timeout_at(deadline, sock.recv(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let packet = Bytes::copy_from_slice(&buf[..len]);

        if !is_reply_to(&packet, query.id()) {
            debug!(target = "transport", server = %server, len, "ignoring datagram with foreign id");
            continue;
        }
        let response = Message::from_vec(&packet)?;
        if !is_response_to(query, &response) {
            debug!(target = "transport", server = %server, "ignoring reply to a different question");
            continue;
        }
        return Ok(response);
    }
}

/// Sends `wire` over a fresh TCP connection and reads one framed reply.
pub async fn tcp(
    query: &Message,
    wire: &[u8],
    server: SocketAddr,
    selector: &dyn Selector,
    deadline: Instant,
) -> Result<Message, TransportError> {
    let mut stream = timeout_at(deadline, TcpStream::connect(server))
        .await
        .map_err(|_| TransportError::Timeout)??;
    let _ = stream.set_nodelay(true);

    let len = u16::try_from(wire.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "query too large for tcp"))?;
    let mut out = Vec::with_capacity(2 + wire.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(wire);
    timeout_at(deadline, stream.write_all(&out))
        .await
        .map_err(|_| TransportError::Timeout)??;

    loop {
        if !selector.wait_for_readable(Watched::Tcp(&stream), deadline).await? {
            return Err(TransportError::Timeout);
        }
        let body = timeout_at(deadline, read_frame(&mut stream))
            .await
            .map_err(|_| TransportError::Timeout)??;

        if !is_reply_to(&body, query.id()) {
            let header = parse_header_quick(&body);
            debug!(target = "transport", server = %server, ?header, "ignoring tcp frame with foreign id");
            continue;
        }
        let response = Message::from_vec(&body)?;
        if !is_response_to(query, &response) {
            continue;
        }
        return Ok(response);
    }
}

async fn read_frame(stream: &mut TcpStream) -> Result<Bytes, TransportError> {
    let mut len_buf = [0u8; 2];
    if let Err(err) = stream.read_exact(&mut len_buf).await {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Err(TransportError::Closed);
        }
        return Err(err.into());
    }
    let frame_len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; frame_len];
    if let Err(err) = stream.read_exact(&mut buf).await {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Err(TransportError::Closed);
        }
        return Err(err.into());
    }
    Ok(Bytes::from(buf))
}
