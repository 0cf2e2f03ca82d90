//! In-process nameserver and record builders for tests.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, CNAME, SOA};
use hickory_proto::rr::{Name, RData, Record};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

pub(crate) fn name(s: &str) -> Name {
    Name::from_str(s).unwrap()
}

pub(crate) fn a_record(owner: &str, ttl: u32, ip: [u8; 4]) -> Record {
    Record::from_rdata(name(owner), ttl, RData::A(A(Ipv4Addr::from(ip))))
}

pub(crate) fn cname_record(owner: &str, ttl: u32, target: &str) -> Record {
    Record::from_rdata(name(owner), ttl, RData::CNAME(CNAME(name(target))))
}

pub(crate) fn soa_record(zone: &str, ttl: u32, minimum: u32) -> Record {
    let soa = SOA::new(
        name("ns1.invalid."),
        name("hostmaster.invalid."),
        1,
        3600,
        600,
        86400,
        minimum,
    );
    Record::from_rdata(name(zone), ttl, RData::SOA(soa))
}

/// A response echoing the id and question of `req`.
pub(crate) fn reply(req: &Message, rcode: ResponseCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_authoritative(true);
    msg.set_response_code(rcode);
    msg.add_queries(req.queries().to_vec());
    msg
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Proto {
    Udp,
    Tcp,
}

pub(crate) enum Reply {
    Message(Message),
    Raw(Vec<u8>),
    /// Several datagrams in order (UDP only).
    Burst(Vec<Vec<u8>>),
    Drop,
}

type Handler = dyn Fn(&Message, Proto) -> Reply + Send + Sync;

/// A scripted nameserver listening on the same port for UDP and TCP.
pub(crate) struct FakeNameserver {
    pub addr: SocketAddr,
    udp_hits: Arc<AtomicUsize>,
    tcp_hits: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeNameserver {
    pub async fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&Message, Proto) -> Reply + Send + Sync + 'static,
    {
        let handler: Arc<Handler> = Arc::new(handler);
        let (udp, tcp) = bind_pair().await;
        let addr = udp.local_addr().unwrap();
        let udp_hits = Arc::new(AtomicUsize::new(0));
        let tcp_hits = Arc::new(AtomicUsize::new(0));

        let udp_task = {
            let handler = Arc::clone(&handler);
            let hits = Arc::clone(&udp_hits);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65535];
                loop {
                    let Ok((len, peer)) = udp.recv_from(&mut buf).await else {
                        continue;
                    };
                    let Ok(req) = Message::from_vec(&buf[..len]) else {
                        continue;
                    };
                    hits.fetch_add(1, Ordering::SeqCst);
                    for datagram in encode(handler(&req, Proto::Udp)) {
                        let _ = udp.send_to(&datagram, peer).await;
                    }
                }
            })
        };

        let tcp_task = {
            let handler = Arc::clone(&handler);
            let hits = Arc::clone(&tcp_hits);
            tokio::spawn(async move {
                loop {
                    let Ok((mut stream, _)) = tcp.accept().await else {
                        continue;
                    };
                    let handler = Arc::clone(&handler);
                    let hits = Arc::clone(&hits);
                    tokio::spawn(async move {
                        let mut len_buf = [0u8; 2];
                        while stream.read_exact(&mut len_buf).await.is_ok() {
                            let mut body = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                            if stream.read_exact(&mut body).await.is_err() {
                                return;
                            }
                            let Ok(req) = Message::from_vec(&body) else {
                                return;
                            };
                            hits.fetch_add(1, Ordering::SeqCst);
                            for frame in encode(handler(&req, Proto::Tcp)) {
                                let mut out = (frame.len() as u16).to_be_bytes().to_vec();
                                out.extend_from_slice(&frame);
                                if stream.write_all(&out).await.is_err() {
                                    return;
                                }
                            }
                        }
                    });
                }
            })
        };

        Self {
            addr,
            udp_hits,
            tcp_hits,
            tasks: vec![udp_task, tcp_task],
        }
    }

    /// Answers every A query with `ip`, TTL 300.
    pub async fn answering(ip: [u8; 4]) -> Self {
        Self::spawn(move |req, _| {
            let mut resp = reply(req, ResponseCode::NoError);
            let q = &req.queries()[0];
            resp.add_answer(a_record(&q.name().to_string(), 300, ip));
            Reply::Message(resp)
        })
        .await
    }

    pub async fn silent() -> Self {
        Self::spawn(|_, _| Reply::Drop).await
    }

    pub fn udp_hits(&self) -> usize {
        self.udp_hits.load(Ordering::SeqCst)
    }

    pub fn tcp_hits(&self) -> usize {
        self.tcp_hits.load(Ordering::SeqCst)
    }

    pub fn hits(&self) -> usize {
        self.udp_hits() + self.tcp_hits()
    }
}

impl Drop for FakeNameserver {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// An address nothing listens on.
pub(crate) async fn closed_port() -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sock.local_addr().unwrap()
}

fn encode(reply: Reply) -> Vec<Vec<u8>> {
    match reply {
        Reply::Message(msg) => vec![msg.to_vec().unwrap()],
        Reply::Raw(bytes) => vec![bytes],
        Reply::Burst(datagrams) => datagrams,
        Reply::Drop => Vec::new(),
    }
}

async fn bind_pair() -> (UdpSocket, TcpListener) {
    for _ in 0..32 {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = tcp.local_addr().unwrap().port();
        if let Ok(udp) = UdpSocket::bind(("127.0.0.1", port)).await {
            return (udp, tcp);
        }
    }
    panic!("no free port for fake nameserver");
}
