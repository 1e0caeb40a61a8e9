#![allow(dead_code)]

//! Shared machinery for the end-to-end scenarios: an in-memory
//! signaling hub, a fake STUN server pair, a fake SOCKS5 proxy, and
//! small HTTP helpers.

use async_trait::async_trait;
use chorus::config::Config;
use chorus::context::TransportContext;
use chorus::port_mapping::NoPortMapper;
use chorus::protocols::pseudo_tcp::PseudoTcpStream;
use chorus::protocols::stun::{
    AddressValue, Attribute, MessageKind, StunMessage, StunServers, StunSession,
};
use chorus::protocols::stunt::{StuntRegistry, StuntSession, StuntHint};
use chorus::protocols::turn::{StaticStreamhosts, TurnSession};
use chorus::signaling::{
    SignalingChannel, SignalingError, SignalingMessage, SignalingRouter, Streamhost, StuntSignal,
    StuntSignalKind, SIGNALING_VERSION,
};
use chorus::telemetry::NullReportSink;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

/// Routes signaling envelopes between test peers in memory.
pub struct Hub {
    routers: Mutex<HashMap<String, Arc<SignalingRouter>>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routers: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a peer and returns its router plus the queue of
    /// session-opening messages addressed to it.
    pub fn join(self: &Arc<Self>, jid: &str) -> (Arc<SignalingRouter>, mpsc::Receiver<SignalingMessage>) {
        let channel = Arc::new(HubChannel {
            from: jid.to_string(),
            hub: self.clone(),
        });
        let (router, invites) = SignalingRouter::new(channel);
        self.routers
            .lock()
            .unwrap()
            .insert(jid.to_string(), router.clone());
        (router, invites)
    }
}

struct HubChannel {
    from: String,
    hub: Arc<Hub>,
}

#[async_trait]
impl SignalingChannel for HubChannel {
    async fn send_envelope(&self, to: &str, xml: String) -> Result<(), SignalingError> {
        let router = self.hub.routers.lock().unwrap().get(to).cloned();
        match router {
            Some(router) => router.on_envelope(&self.from, &xml).await,
            // Envelopes to parties that never joined (e.g. a proxy
            // activation) vanish, as they would on a real chat channel.
            None => Ok(()),
        }
    }
}

/// A pair of UDP sockets answering binding requests the way a classic
/// STUN server with an alternate address does. On loopback there is no
/// translation, so sessions classify the "router" as none.
pub async fn start_fake_stun() -> StunServers {
    let primary = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let alternate = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let primary_addr = primary.local_addr().unwrap();
    let alternate_addr = alternate.local_addr().unwrap();

    for socket in [primary.clone(), alternate.clone()] {
        let alternate_addr = alternate_addr;
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 2048];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buffer).await else {
                    return;
                };
                let Ok(request) = StunMessage::decode(&buffer[..len]) else {
                    continue;
                };
                if request.kind != MessageKind::BindingRequest {
                    continue;
                }
                let (SocketAddr::V4(from_v4), SocketAddr::V4(alt_v4)) = (from, alternate_addr)
                else {
                    continue;
                };
                let mut response = StunMessage::with_transaction_id(
                    MessageKind::BindingResponse,
                    request.transaction_id,
                );
                response.add_attribute(Attribute::MappedAddress(AddressValue::new(
                    *from_v4.ip(),
                    from_v4.port(),
                )));
                response.add_attribute(Attribute::ChangedAddress(AddressValue::new(
                    *alt_v4.ip(),
                    alt_v4.port(),
                )));
                let _ = socket.send_to(&response.encode(), from).await;
            }
        });
    }

    StunServers {
        primary: primary_addr,
        alternate: Some(alternate_addr),
    }
}

/// Servers nobody answers at, for scenarios where STUN must fail.
pub fn dead_stun() -> StunServers {
    StunServers {
        primary: "127.0.0.1:1".parse().unwrap(),
        alternate: Some("127.0.0.1:2".parse().unwrap()),
    }
}

pub fn make_context(
    jid: &str,
    router: Arc<SignalingRouter>,
    stun_servers: StunServers,
    streamhosts: Vec<Streamhost>,
) -> Arc<TransportContext> {
    let config = Config {
        initial_stun_rto: Duration::from_millis(200),
        initial_rto: Duration::from_millis(250),
        validation_timeout: Duration::from_secs(5),
        ..Config::default()
    };
    Arc::new(TransportContext {
        config: Arc::new(config),
        local_jid: jid.to_string(),
        signaling: router,
        port_mapper: Arc::new(NoPortMapper),
        stun_servers,
        streamhosts: Arc::new(StaticStreamhosts(streamhosts)),
        stunt_registry: Arc::new(StuntRegistry::new()),
        reports: Arc::new(NullReportSink),
    })
}

/// Answers every session-opening message a peer receives, then serves
/// HTTP on whatever stream the session produces.
pub fn spawn_responder(
    ctx: Arc<TransportContext>,
    mut invites: mpsc::Receiver<SignalingMessage>,
    body: Vec<u8>,
    accept_stunt: bool,
) {
    tokio::spawn(async move {
        while let Some(invite) = invites.recv().await {
            let ctx = ctx.clone();
            let body = body.clone();
            match invite {
                SignalingMessage::Stun(signal) => {
                    tokio::spawn(async move {
                        let session = StunSession::respond(signal, ctx.clone());
                        if let Ok(outcome) = session.run().await {
                            if let Ok(stream) =
                                PseudoTcpStream::accept(outcome.socket, outcome.peer, &ctx.config)
                                    .await
                            {
                                serve_http(stream, body).await;
                            }
                        }
                    });
                }
                SignalingMessage::Stunt(signal) => {
                    if accept_stunt {
                        tokio::spawn(async move {
                            let session =
                                StuntSession::respond(signal, StuntHint::default(), ctx);
                            if let Ok(stream) = session.run().await {
                                serve_http(stream, body).await;
                            }
                        });
                    } else {
                        let refusal = SignalingMessage::Stunt(StuntSignal {
                            to: signal.from.clone(),
                            from: ctx.local_jid.clone(),
                            kind: StuntSignalKind::Ack,
                            uuid: signal.uuid.clone(),
                            version: SIGNALING_VERSION.to_string(),
                            ip4: None,
                            ip6: None,
                            predicted_port: None,
                            server_port: None,
                            error: Some("hole punching disabled".into()),
                        });
                        let _ = ctx.signaling.send(&refusal).await;
                    }
                }
                SignalingMessage::Turn(signal) => {
                    tokio::spawn(async move {
                        let session = TurnSession::respond(signal, ctx);
                        if let Ok(stream) = session.run().await {
                            serve_http(stream, body).await;
                        }
                    });
                }
            }
        }
    });
}

/// A minimal HTTP/1.1 server loop over any byte stream: every request
/// gets a 200 with the fixed body and Content-Length framing.
pub async fn serve_http<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S, body: Vec<u8>) {
    let mut buffer = Vec::new();
    while read_http_head(&mut stream, &mut buffer).await.is_some() {
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
            body.len()
        );
        if stream.write_all(head.as_bytes()).await.is_err() {
            return;
        }
        if stream.write_all(&body).await.is_err() {
            return;
        }
        let _ = stream.flush().await;
    }
}

/// A loopback TCP library server; returns its port and a counter of
/// accepted connections.
pub async fn start_tcp_library(body: Vec<u8>) -> (u16, Arc<std::sync::atomic::AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = connections.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::spawn(serve_http(stream, body.clone()));
        }
    });
    (port, connections)
}

/// Reads one HTTP head (through the blank line). Extra bytes stay in
/// `buffer`.
pub async fn read_http_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
) -> Option<Vec<u8>> {
    loop {
        if let Some(position) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
            return Some(buffer.drain(..position + 4).collect());
        }
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
    }
}

pub fn header_value(head: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(head);
    for line in text.lines().skip(1) {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

pub fn status_code(head: &[u8]) -> u16 {
    let text = String::from_utf8_lossy(head);
    text.split_whitespace().nth(1).unwrap_or("0").parse().unwrap_or(0)
}

/// Issues one GET on an existing connection and returns the response
/// head and exactly Content-Length bytes of body.
pub async fn get_on<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
    path: &str,
    extra_headers: &str,
) -> (Vec<u8>, Vec<u8>) {
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost{extra_headers}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
    let head = read_http_head(stream, buffer).await.expect("response head");
    let length: usize = header_value(&head, "Content-Length")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    let mut body = Vec::with_capacity(length);
    while body.len() < length {
        if !buffer.is_empty() {
            let take = buffer.len().min(length - body.len());
            body.extend(buffer.drain(..take));
            continue;
        }
        let mut chunk = [0u8; 8192];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed mid-body");
        buffer.extend_from_slice(&chunk[..n]);
    }
    (head, body)
}

/// One-shot GET against a loopback port.
pub async fn http_get(port: u16, path: &str) -> (Vec<u8>, Vec<u8>) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut buffer = Vec::new();
    get_on(&mut stream, &mut buffer, path, "").await
}

/// A SOCKS5 bytestream proxy good enough for the relay scenario: the
/// two halves of a session present the same digest and are bridged.
pub async fn start_fake_proxy() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let pending: Arc<Mutex<HashMap<String, TcpStream>>> = Arc::new(Mutex::new(HashMap::new()));
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let pending = pending.clone();
            tokio::spawn(async move {
                if let Ok((stream, digest)) = proxy_handshake(stream).await {
                    let other = pending.lock().unwrap().remove(&digest);
                    match other {
                        Some(mut first) => {
                            let mut second = stream;
                            let _ = tokio::io::copy_bidirectional(&mut first, &mut second).await;
                        }
                        None => {
                            pending.lock().unwrap().insert(digest, stream);
                        }
                    }
                }
            });
        }
    });
    address
}

async fn proxy_handshake(mut stream: TcpStream) -> std::io::Result<(TcpStream, String)> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[0x05, 0x00]).await?;

    let mut head = [0u8; 5];
    stream.read_exact(&mut head).await?;
    let mut rest = vec![0u8; head[4] as usize + 2];
    stream.read_exact(&mut rest).await?;
    let digest = String::from_utf8_lossy(&rest[..head[4] as usize]).into_owned();
    stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok((stream, digest))
}
