//! The loopback HTTP gateway: a local listener whose connections are
//! serviced over whatever transport can reach the peer.
//!
//! Remote streams are found in this order: an idle stream from the
//! pool, then direct TCP, with TCP hole punching and STUN+PseudoTcp
//! joining the race two seconds after TCP fails to connect, and the
//! SOCKS5 relay as the last resort once every direct path has failed.

use crate::connector::{ConnectError, SocketConnector};
use crate::context::TransportContext;
use crate::protocols::pseudo_tcp::PseudoTcpStream;
use crate::protocols::stun::{StunError, StunSession};
use crate::protocols::stunt::{StuntError, StuntHint, StuntSession};
use crate::protocols::turn::{TurnError, TurnSession};
use crate::stream::{StreamKind, StreamSocket};
use crate::telemetry::{CounterSnapshot, SessionKind, TransportCounters};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod auth;
mod connection;
mod http;

/// Grace period direct TCP gets before the NAT-traversal sessions are
/// launched alongside it.
const TCP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, ThisError)]
pub enum GatewayError {
    #[error("the remote host requires authentication")]
    AuthRequired,
    #[error("authentication attempts exhausted")]
    AuthExhausted,
    #[error("the upstream connection closed prematurely")]
    UpstreamClosed,
    #[error("the upstream response could not be parsed")]
    BadResponse,
    #[error("no transport could reach the peer")]
    NoRoute,
    #[error("the gateway is shutting down")]
    Canceled,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// What the gateway connects its local clients to.
#[derive(Debug, Clone)]
pub enum GatewayTarget {
    /// A plain host and port, reachable by TCP only.
    Host { host: String, port: u16 },
    /// A peer identity on the signaling channel, with whatever
    /// addresses it has published for direct connections.
    Peer {
        jid: String,
        addresses: Vec<SocketAddr>,
    },
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub target: GatewayTarget,
    pub is_secure: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Peers that never advertised the NAT-traversal namespaces are
    /// not raced over them.
    pub remote_supports_stun: bool,
    pub remote_supports_turn: bool,
}

impl GatewayConfig {
    pub fn for_host(host: impl Into<String>, port: u16) -> Self {
        Self {
            target: GatewayTarget::Host {
                host: host.into(),
                port,
            },
            is_secure: false,
            username: None,
            password: None,
            remote_supports_stun: false,
            remote_supports_turn: false,
        }
    }

    pub fn for_peer(jid: impl Into<String>, addresses: Vec<SocketAddr>) -> Self {
        Self {
            target: GatewayTarget::Peer {
                jid: jid.into(),
                addresses,
            },
            is_secure: false,
            username: None,
            password: None,
            remote_supports_stun: true,
            remote_supports_turn: true,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self.is_secure = true;
        self
    }

    fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
            _ => None,
        }
    }
}

/// A loopback listener multiplexing local HTTP connections onto remote
/// streams.
pub struct GatewayServer {
    inner: Arc<GatewayInner>,
    local_port: u16,
}

pub(crate) struct GatewayInner {
    pub(crate) uuid: String,
    pub(crate) config: GatewayConfig,
    pub(crate) ctx: Arc<TransportContext>,
    pool: Mutex<Pool>,
    pub(crate) counters: TransportCounters,
    pub(crate) cancel: CancellationToken,
}

#[derive(Default)]
struct Pool {
    tcp: Vec<StreamSocket>,
    udp: Vec<StreamSocket>,
    proxy: Vec<StreamSocket>,
}

impl GatewayInner {
    pub(crate) fn pool_pop(&self) -> Option<StreamSocket> {
        let mut pool = self.pool.lock().unwrap();
        pool.tcp
            .pop()
            .or_else(|| pool.udp.pop())
            .or_else(|| pool.proxy.pop())
    }

    pub(crate) fn pool_push(&self, stream: StreamSocket) {
        let mut pool = self.pool.lock().unwrap();
        match stream.kind() {
            StreamKind::Tcp => pool.tcp.push(stream),
            StreamKind::Udp => pool.udp.push(stream),
            StreamKind::Proxy => pool.proxy.push(stream),
        }
    }
}

impl GatewayServer {
    /// Binds an ephemeral loopback port and starts accepting.
    pub async fn open(
        config: GatewayConfig,
        ctx: Arc<TransportContext>,
    ) -> io::Result<GatewayServer> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let local_port = listener.local_addr()?.port();
        let inner = Arc::new(GatewayInner {
            uuid: Uuid::new_v4().to_string(),
            config,
            ctx,
            pool: Mutex::new(Pool::default()),
            counters: TransportCounters::default(),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(accept_loop(listener, inner.clone()));
        tracing::info!(local_port, uuid = %inner.uuid, "gateway listening");
        Ok(GatewayServer { inner, local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.inner.counters.snapshot()
    }

    /// Stops accepting and drops the pool. In-flight connections end
    /// as their sockets close.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        let mut pool = self.inner.pool.lock().unwrap();
        pool.tcp.clear();
        pool.udp.clear();
        pool.proxy.clear();
    }
}

impl Drop for GatewayServer {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

async fn accept_loop(listener: TcpListener, inner: Arc<GatewayInner>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(connection::handle(stream, inner.clone()));
                    }
                    Err(error) => {
                        tracing::warn!(%error, "gateway accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

/// One finished transport attempt.
struct Attempt {
    kind: SessionKind,
    outcome: Result<StreamSocket, AttemptFailure>,
}

struct AttemptFailure {
    canceled: bool,
    reason: String,
}

impl AttemptFailure {
    fn failed(reason: impl ToString) -> Self {
        Self {
            canceled: false,
            reason: reason.to_string(),
        }
    }
}

/// Obtains a fresh remote stream for one request, racing transports as
/// described in the module documentation.
pub(crate) async fn acquire_stream(inner: &Arc<GatewayInner>) -> Result<StreamSocket, GatewayError> {
    if inner.cancel.is_cancelled() {
        return Err(GatewayError::Canceled);
    }
    match &inner.config.target {
        GatewayTarget::Host { host, port } => {
            let addresses: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), *port))
                .await
                .map_err(|_| GatewayError::NoRoute)?
                .collect();
            let connector = SocketConnector::new(addresses);
            match connector.run().await {
                Ok(stream) => {
                    inner.counters.record(SessionKind::Tcp, true);
                    Ok(StreamSocket::Tcp(stream))
                }
                Err(error) => {
                    inner.counters.record(SessionKind::Tcp, false);
                    tracing::info!(%error, %host, "direct connection failed");
                    Err(GatewayError::NoRoute)
                }
            }
        }
        GatewayTarget::Peer { jid, addresses } => race_peer(inner, jid, addresses).await,
    }
}

async fn race_peer(
    inner: &Arc<GatewayInner>,
    jid: &str,
    addresses: &[SocketAddr],
) -> Result<StreamSocket, GatewayError> {
    let cancel = CancellationToken::new();
    let (results_tx, mut results) = mpsc::channel::<Attempt>(8);
    let mut pending = 0usize;

    if !addresses.is_empty() {
        pending += 1;
        spawn_tcp_attempt(addresses.to_vec(), &cancel, results_tx.clone());
    }

    let nat_available = inner.config.remote_supports_stun;
    let mut nat_started = false;
    let mut grace = Box::pin(tokio::time::sleep(if pending == 0 {
        Duration::ZERO
    } else {
        TCP_GRACE
    }));

    let winner = loop {
        tokio::select! {
            _ = grace.as_mut(), if !nat_started => {
                nat_started = true;
                if nat_available {
                    pending += 2;
                    spawn_stunt_attempt(inner, jid, &cancel, results_tx.clone());
                    spawn_stun_attempt(inner, jid, &cancel, results_tx.clone());
                } else if pending == 0 {
                    break None;
                }
            }
            attempt = results.recv() => {
                let Some(Attempt { kind, outcome }) = attempt else { break None };
                pending -= 1;
                match outcome {
                    Ok(stream) => {
                        inner.counters.record(kind, true);
                        break Some(stream);
                    }
                    Err(failure) => {
                        if !failure.canceled {
                            inner.counters.record(kind, false);
                            tracing::info!(?kind, reason = %failure.reason, "transport attempt failed");
                        }
                        if pending == 0 {
                            if nat_started {
                                break None;
                            }
                            // Direct TCP died before the grace ran out;
                            // no reason to keep waiting.
                            grace.as_mut().reset(tokio::time::Instant::now());
                        }
                    }
                }
            }
        }
    };

    // Whatever is still racing lost; abandon it.
    cancel.cancel();

    if let Some(stream) = winner {
        return Ok(stream);
    }

    if inner.config.remote_supports_turn {
        let session = TurnSession::initiate(jid, inner.ctx.clone());
        let token = session.cancel_token();
        let gateway_cancel = inner.cancel.clone();
        let guard = tokio::spawn(async move {
            gateway_cancel.cancelled().await;
            token.cancel();
        });
        let result = session.run().await;
        guard.abort();
        match result {
            Ok(stream) => {
                inner.counters.record(SessionKind::Turn, true);
                return Ok(StreamSocket::Relay(stream));
            }
            Err(TurnError::Canceled) => return Err(GatewayError::Canceled),
            Err(error) => {
                inner.counters.record(SessionKind::Turn, false);
                tracing::info!(%error, "relay attempt failed");
            }
        }
    }

    Err(GatewayError::NoRoute)
}

fn spawn_tcp_attempt(
    addresses: Vec<SocketAddr>,
    cancel: &CancellationToken,
    results: mpsc::Sender<Attempt>,
) {
    let connector = SocketConnector::new(addresses);
    let token = connector.cancel_token();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let abort = tokio::spawn(async move {
            cancel.cancelled().await;
            token.cancel();
        });
        let outcome = match connector.run().await {
            Ok(stream) => Ok(StreamSocket::Tcp(stream)),
            Err(ConnectError::Canceled) => Err(AttemptFailure {
                canceled: true,
                reason: String::new(),
            }),
            Err(error) => Err(AttemptFailure::failed(error)),
        };
        abort.abort();
        let _ = results
            .send(Attempt {
                kind: SessionKind::Tcp,
                outcome,
            })
            .await;
    });
}

fn spawn_stunt_attempt(
    inner: &Arc<GatewayInner>,
    jid: &str,
    cancel: &CancellationToken,
    results: mpsc::Sender<Attempt>,
) {
    let session = StuntSession::initiate(jid, StuntHint::default(), inner.ctx.clone());
    let token = session.cancel_token();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let abort = tokio::spawn(async move {
            cancel.cancelled().await;
            token.cancel();
        });
        let outcome = match session.run().await {
            Ok(stream) => Ok(StreamSocket::Tcp(stream)),
            Err(StuntError::Canceled) => Err(AttemptFailure {
                canceled: true,
                reason: String::new(),
            }),
            Err(error) => Err(AttemptFailure::failed(error)),
        };
        abort.abort();
        let _ = results
            .send(Attempt {
                kind: SessionKind::Stunt,
                outcome,
            })
            .await;
    });
}

fn spawn_stun_attempt(
    inner: &Arc<GatewayInner>,
    jid: &str,
    cancel: &CancellationToken,
    results: mpsc::Sender<Attempt>,
) {
    let session = StunSession::initiate(jid, inner.ctx.clone());
    let token = session.cancel_token();
    let cancel = cancel.clone();
    let config = inner.ctx.config.clone();
    tokio::spawn(async move {
        let abort = tokio::spawn(async move {
            cancel.cancelled().await;
            token.cancel();
        });
        let outcome = match session.run().await {
            Ok(outcome) => {
                // The validated UDP path carries a PseudoTcp stream;
                // the initiating side opens it actively.
                let stream = if outcome.is_client {
                    PseudoTcpStream::connect(outcome.socket, outcome.peer, &config).await
                } else {
                    PseudoTcpStream::accept(outcome.socket, outcome.peer, &config).await
                };
                match stream {
                    Ok(stream) => Ok(StreamSocket::PseudoTcp(stream)),
                    Err(error) => Err(AttemptFailure::failed(error)),
                }
            }
            Err(StunError::Canceled) => Err(AttemptFailure {
                canceled: true,
                reason: String::new(),
            }),
            Err(error) => Err(AttemptFailure::failed(error)),
        };
        abort.abort();
        let _ = results
            .send(Attempt {
                kind: SessionKind::Stun,
                outcome,
            })
            .await;
    });
}
