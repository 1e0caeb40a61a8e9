//! TCP hole punching by simultaneous open.
//!
//! Each side listens on a local port and, from that same port (plus an
//! ephemeral spare), dials the peer's predicted and server ports. The
//! first TCP handshake to complete in either direction carries a short
//! HTTP-shaped validation exchange and becomes the connection; every
//! other socket of the cycle is abandoned.

use crate::context::TransportContext;
use crate::protocols::stun::local_ipv4_towards;
use crate::signaling::{
    SignalingError, SignalingMessage, StuntSignal, StuntSignalKind, SIGNALING_VERSION,
};
use crate::telemetry::{SessionKind, SessionReport, Validation};
use crate::FxDashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Window for one full punch cycle.
const CYCLE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long to wait for the peer's signaling reply.
const SIGNALING_TIMEOUT: Duration = Duration::from_secs(30);

/// Size cap when reading the validation exchange.
const PREAMBLE_CAP: usize = 4 * 1024;

#[derive(Debug, ThisError)]
pub enum StuntError {
    #[error("no external address is known for this host")]
    NoMapping,
    #[error("no TCP handshake completed in either direction")]
    ValidationFailure,
    #[error("peer reported: {0}")]
    PeerError(String),
    #[error("timed out waiting for the peer's signaling reply")]
    SignalingTimeout,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("the session was aborted")]
    Canceled,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Knowledge a recent STUN characterization contributes: the external
/// address, and a predicted external port when the router allocates
/// predictably.
#[derive(Debug, Clone, Default)]
pub struct StuntHint {
    pub external_ip: Option<Ipv4Addr>,
    pub predicted_port: Option<u16>,
}

/// Rendezvous for connections that arrive at the application's own
/// HTTP listener instead of the session's: a specially formed request
/// names the session uuid, and [`handle_stunt_request`] hands the
/// already-accepted socket over.
#[derive(Default)]
pub struct StuntRegistry {
    waiting: FxDashMap<String, mpsc::Sender<TcpStream>>,
}

impl StuntRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, uuid: &str) -> mpsc::Receiver<TcpStream> {
        let (tx, rx) = mpsc::channel(1);
        self.waiting.insert(uuid.to_string(), tx);
        rx
    }

    fn unregister(&self, uuid: &str) {
        self.waiting.remove(uuid);
    }
}

/// Recognizes the validation request line, returning the session uuid
/// it names.
pub fn parse_stunt_request(request_line: &str) -> Option<&str> {
    let mut parts = request_line.split_whitespace();
    if parts.next()? != "STUNT" {
        return None;
    }
    let target = parts.next()?;
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    target.strip_prefix('/')
}

/// Routes an accepted socket whose request line named a STUNT session
/// to that session. The caller must have consumed the request head and
/// nothing else. Returns false when no session claims the uuid.
pub async fn handle_stunt_request(
    registry: &StuntRegistry,
    uuid: &str,
    stream: TcpStream,
) -> bool {
    let Some(waiting) = registry.waiting.get(uuid).map(|entry| entry.clone()) else {
        return false;
    };
    waiting.send(stream).await.is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

pub struct StuntSession {
    uuid: String,
    role: Role,
    peer_jid: String,
    start: Option<StuntSignal>,
    hint: StuntHint,
    ctx: Arc<TransportContext>,
    messages: mpsc::Receiver<SignalingMessage>,
    passthrough: mpsc::Receiver<TcpStream>,
    cancel: CancellationToken,
}

impl StuntSession {
    pub fn initiate(
        peer_jid: impl Into<String>,
        hint: StuntHint,
        ctx: Arc<TransportContext>,
    ) -> Self {
        let uuid = Uuid::new_v4().to_string();
        Self::new(uuid, Role::Client, peer_jid.into(), None, hint, ctx)
    }

    pub fn respond(start: StuntSignal, hint: StuntHint, ctx: Arc<TransportContext>) -> Self {
        let uuid = start.uuid.clone();
        let peer = start.from.clone();
        Self::new(uuid, Role::Server, peer, Some(start), hint, ctx)
    }

    fn new(
        uuid: String,
        role: Role,
        peer_jid: String,
        start: Option<StuntSignal>,
        hint: StuntHint,
        ctx: Arc<TransportContext>,
    ) -> Self {
        let messages = ctx.signaling.register(&uuid);
        let passthrough = ctx.stunt_registry.register(&uuid);
        Self {
            uuid,
            role,
            peer_jid,
            start,
            hint,
            ctx,
            messages,
            passthrough,
            cancel: CancellationToken::new(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(mut self) -> Result<TcpStream, StuntError> {
        let started = Instant::now();
        let cancel = self.cancel.clone();
        let mut mapping_protocol = None;
        let mut cycle = 0;
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(StuntError::Canceled),
            outcome = self.run_inner(&mut mapping_protocol, &mut cycle) => outcome,
        };
        self.ctx.signaling.unregister(&self.uuid);
        self.ctx.stunt_registry.unregister(&self.uuid);
        self.ctx.reports.report(SessionReport {
            uuid: self.uuid.clone(),
            kind: SessionKind::Stunt,
            success: result.is_ok(),
            cycle,
            validation: if result.is_ok() {
                Validation::Success
            } else {
                Validation::Failure
            },
            duration: started.elapsed(),
            failure_reason: result.as_ref().err().map(|error| error.to_string()),
            port_mapping_protocol: mapping_protocol,
            via_server: false,
        });
        result
    }

    async fn run_inner(
        &mut self,
        mapping_protocol: &mut Option<String>,
        cycle_out: &mut u32,
    ) -> Result<TcpStream, StuntError> {
        let listener = bind_reusable_listener()?;
        let server_port = listener.local_addr()?.port();

        // Port-mapping accelerator: a router-installed mapping makes
        // the predicted port exact.
        let mapped_port = match self.ctx.port_mapper.add_mapping(server_port).await {
            Ok(port) => {
                *mapping_protocol = self
                    .ctx
                    .port_mapper
                    .protocol_name()
                    .map(|name| name.to_string());
                Some(port)
            }
            Err(error) => {
                tracing::debug!(%error, "no router port mapping");
                None
            }
        };
        let predicted_port = mapped_port
            .or(self.hint.predicted_port)
            .unwrap_or(server_port);
        let external_ip = self
            .hint
            .external_ip
            .unwrap_or_else(|| local_ipv4_towards(self.ctx.stun_servers.primary));
        if external_ip.is_unspecified() {
            return Err(StuntError::NoMapping);
        }

        let local = StuntSignal {
            to: self.peer_jid.clone(),
            from: self.ctx.local_jid.clone(),
            kind: if self.role == Role::Client {
                StuntSignalKind::Start
            } else {
                StuntSignalKind::Ack
            },
            uuid: self.uuid.clone(),
            version: SIGNALING_VERSION.to_string(),
            ip4: Some(external_ip),
            ip6: None,
            predicted_port: Some(predicted_port),
            server_port: Some(server_port),
            error: None,
        };

        let remote = match self.role {
            Role::Client => {
                self.ctx
                    .signaling
                    .send(&SignalingMessage::Stunt(local))
                    .await?;
                self.await_peer_signal().await?
            }
            Role::Server => {
                let start = self.start.clone().ok_or(StuntError::SignalingTimeout)?;
                self.ctx
                    .signaling
                    .send(&SignalingMessage::Stunt(local))
                    .await?;
                start
            }
        };
        if let Some(message) = remote.error {
            return Err(StuntError::PeerError(message));
        }
        let remote_ip = remote.ip4.ok_or(StuntError::NoMapping)?;
        let remote_predicted = remote.predicted_port;
        let remote_server = remote.server_port;

        let result = {
            let mut last_error = StuntError::ValidationFailure;
            let mut won = None;
            for cycle in 0..self.ctx.config.attempt_budget {
                *cycle_out = cycle + 1;
                match self
                    .punch_cycle(&listener, server_port, remote_ip, remote_predicted, remote_server)
                    .await
                {
                    Ok(stream) => {
                        won = Some(stream);
                        break;
                    }
                    Err(error) => {
                        tracing::info!(uuid = %self.uuid, cycle, %error, "punch cycle failed");
                        last_error = error;
                    }
                }
            }
            won.ok_or(last_error)
        };

        if mapped_port.is_some() && result.is_err() {
            self.ctx.port_mapper.remove_mapping(server_port).await;
        }
        result
    }

    async fn await_peer_signal(&mut self) -> Result<StuntSignal, StuntError> {
        let deadline = tokio::time::Instant::now() + SIGNALING_TIMEOUT;
        loop {
            let message = tokio::time::timeout_at(deadline, self.messages.recv())
                .await
                .map_err(|_| StuntError::SignalingTimeout)?
                .ok_or(StuntError::SignalingTimeout)?;
            if let SignalingMessage::Stunt(signal) = message {
                return Ok(signal);
            }
        }
    }

    /// One cycle: an accept loop on our listener, the application
    /// passthrough, and four outbound dials racing for the first
    /// validated connection.
    async fn punch_cycle(
        &mut self,
        listener: &TcpListener,
        server_port: u16,
        remote_ip: Ipv4Addr,
        remote_predicted: Option<u16>,
        remote_server: Option<u16>,
    ) -> Result<TcpStream, StuntError> {
        let stop = CancellationToken::new();
        let (winners_tx, mut winners) = mpsc::channel::<TcpStream>(1);
        let uuid = Arc::new(self.uuid.clone());

        let mut remote_ports = Vec::new();
        if let Some(port) = remote_predicted {
            remote_ports.push(port);
        }
        if let Some(port) = remote_server {
            if !remote_ports.contains(&port) {
                remote_ports.push(port);
            }
        }
        if remote_ports.is_empty() {
            return Err(StuntError::NoMapping);
        }

        // The initiator validates actively on every socket and the
        // responder passively, so both sides settle on the same
        // four-tuple no matter which handshake lands first.
        let active = self.role == Role::Client;

        let mut tasks = Vec::new();
        for remote_port in remote_ports {
            let remote = SocketAddr::from((remote_ip, remote_port));
            for local_port in [Some(server_port), None] {
                let stop = stop.clone();
                let winners_tx = winners_tx.clone();
                let uuid = uuid.clone();
                tasks.push(tokio::spawn(async move {
                    let attempt = async {
                        let stream = connect_from(local_port, remote).await.ok()?;
                        validate(stream, &uuid, active).await.ok()
                    };
                    tokio::select! {
                        _ = stop.cancelled() => {}
                        validated = attempt => {
                            if let Some(stream) = validated {
                                let _ = winners_tx.send(stream).await;
                            }
                        }
                    }
                }));
            }
        }

        let outcome = {
            let accept_uuid = uuid.clone();
            let accepted = async {
                loop {
                    match listener.accept().await {
                        Ok((stream, from)) => {
                            tracing::debug!(%from, "accepted during punch");
                            if let Ok(stream) = validate(stream, &accept_uuid, active).await {
                                return stream;
                            }
                        }
                        Err(error) => {
                            tracing::debug!(%error, "accept failed during punch");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            };
            tokio::select! {
                stream = accepted => Ok(stream),
                passthrough = self.passthrough.recv() => {
                    passthrough.ok_or(StuntError::ValidationFailure)
                }
                outbound = winners.recv() => {
                    outbound.ok_or(StuntError::ValidationFailure)
                }
                _ = tokio::time::sleep(CYCLE_TIMEOUT) => Err(StuntError::ValidationFailure),
            }
        };

        // Kill the losers first: the responder confirms exactly one
        // socket, so the peer converges on the same pair.
        stop.cancel();
        for task in tasks {
            let _ = task.await;
        }

        match outcome {
            Ok(mut stream) => {
                if !active {
                    stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
                }
                Ok(stream)
            }
            Err(error) => Err(error),
        }
    }
}

fn bind_reusable_listener() -> Result<TcpListener, StuntError> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
    Ok(socket.listen(16)?)
}

/// Dials `remote`, optionally from a specific already-bound local
/// port. Reuse flags let the dial share the listener's port.
async fn connect_from(local_port: Option<u16>, remote: SocketAddr) -> io::Result<TcpStream> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    if let Some(port) = local_port {
        socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
    }
    socket.connect(remote).await
}

async fn read_preamble(stream: &mut TcpStream) -> Result<String, StuntError> {
    let mut buffer = Vec::new();
    let mut byte = [0u8; 1];
    while !buffer.ends_with(b"\r\n\r\n") {
        if buffer.len() >= PREAMBLE_CAP {
            return Err(StuntError::ValidationFailure);
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(StuntError::ValidationFailure);
        }
        buffer.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Runs this side's half of the validation exchange on a connected
/// socket. The initiator sends `STUNT /<uuid>` and waits for the 200;
/// the responder reads and checks the request but leaves the 200 to
/// the cycle's single winner selection, so only one socket is ever
/// confirmed.
async fn validate(mut stream: TcpStream, uuid: &str, active: bool) -> Result<TcpStream, StuntError> {
    if active {
        let request = format!("STUNT /{uuid} HTTP/1.1\r\n\r\n");
        stream.write_all(request.as_bytes()).await?;
        let preamble = read_preamble(&mut stream).await?;
        let first_line = preamble.lines().next().unwrap_or_default();
        if first_line.starts_with("HTTP/") && first_line.contains(" 200") {
            return Ok(stream);
        }
        Err(StuntError::ValidationFailure)
    } else {
        let preamble = read_preamble(&mut stream).await?;
        let first_line = preamble.lines().next().unwrap_or_default();
        if parse_stunt_request(first_line) != Some(uuid) {
            return Err(StuntError::ValidationFailure);
        }
        Ok(stream)
    }
}
