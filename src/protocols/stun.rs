//! NAT characterization and validated UDP hole punching.
//!
//! A [`StunSession`] discovers how the local router maps UDP, trades
//! that knowledge with the peer over the signaling channel, and then
//! punches: both sides spray validation nonces at the other's candidate
//! ports until a round trip is confirmed in both directions. The
//! session's product is a UDP socket with a working path to the peer;
//! the caller layers PseudoTcp on top of it.

use crate::config::Config;
use crate::context::TransportContext;
use crate::signaling::{
    SignalingError, SignalingMessage, StunSignal, StunSignalKind, SIGNALING_VERSION,
};
use crate::telemetry::{SessionKind, SessionReport, Validation};
use crate::FxDashMap;
use rand::RngCore;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod message;
pub use message::{AddressValue, Attribute, MessageKind, StunCodecError, StunMessage};

pub mod nat;
pub use nat::{predict_port, PortAllocation, Prediction, ProbeResults, RouterType};

/// The canonical STUN server endpoints. `alternate` is (IP_B, Port_B);
/// when absent it is learned from the first response's CHANGED-ADDRESS.
#[derive(Debug, Clone)]
pub struct StunServers {
    pub primary: SocketAddr,
    pub alternate: Option<SocketAddr>,
}

/// Maximum transmissions of one binding request.
const TRANSACTION_ATTEMPTS: u32 = 9;

/// Transmissions granted to the advisory filtering probes.
const FILTERING_ATTEMPTS: u32 = 3;

/// How long to wait for the peer's signaling reply.
const SIGNALING_TIMEOUT: Duration = Duration::from_secs(30);

/// Validation nonces are this many random bytes.
const NONCE_LEN: usize = 32;

/// Resend cadence during the hole punch.
const PUNCH_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bounds keeping a hostile port range from ballooning the punch.
const MAX_CANDIDATES: usize = 64;
const MAX_POOL: usize = 16;

#[derive(Debug, ThisError)]
pub enum StunError {
    #[error("no usable mapping: the STUN servers did not answer")]
    NoMapping,
    #[error("the router allocates by address; no port prediction is possible")]
    PredictionUnavailable,
    #[error("hole punch validation failed in both directions")]
    ValidationFailure,
    #[error("hole punch validation completed in only one direction")]
    ValidationPartial,
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

/// Outcome of a successful session: a socket with a validated path.
pub struct StunOutcome {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
    /// The initiator opens the PseudoTcp connection actively.
    pub is_client: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

pub struct StunSession {
    uuid: String,
    role: Role,
    peer_jid: String,
    invite: Option<StunSignal>,
    ctx: Arc<TransportContext>,
    messages: mpsc::Receiver<SignalingMessage>,
    cancel: CancellationToken,
}

impl StunSession {
    /// Starts a session toward `peer_jid`; this side sends the invite.
    pub fn initiate(peer_jid: impl Into<String>, ctx: Arc<TransportContext>) -> Self {
        let uuid = Uuid::new_v4().to_string();
        let messages = ctx.signaling.register(&uuid);
        Self {
            uuid,
            role: Role::Client,
            peer_jid: peer_jid.into(),
            invite: None,
            ctx,
            messages,
            cancel: CancellationToken::new(),
        }
    }

    /// Builds the responding side of a session from a received invite.
    pub fn respond(invite: StunSignal, ctx: Arc<TransportContext>) -> Self {
        let messages = ctx.signaling.register(&invite.uuid);
        Self {
            uuid: invite.uuid.clone(),
            role: Role::Server,
            peer_jid: invite.from.clone(),
            invite: Some(invite),
            ctx,
            messages,
            cancel: CancellationToken::new(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    /// Token that [`StunSession::run`] races against; cancel it to
    /// abort. Aborting is idempotent and produces exactly one
    /// `Canceled` outcome.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(mut self) -> Result<StunOutcome, StunError> {
        let started = Instant::now();
        let cancel = self.cancel.clone();
        let mut validation = Validation::None;
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(StunError::Canceled),
            outcome = self.run_inner(&mut validation) => outcome,
        };
        self.ctx.signaling.unregister(&self.uuid);
        self.ctx.reports.report(SessionReport {
            uuid: self.uuid.clone(),
            kind: SessionKind::Stun,
            success: result.is_ok(),
            cycle: self.ctx.config.attempt_budget,
            validation,
            duration: started.elapsed(),
            failure_reason: result.as_ref().err().map(|error| error.to_string()),
            port_mapping_protocol: None,
            via_server: false,
        });
        result
    }

    async fn run_inner(&mut self, validation: &mut Validation) -> Result<StunOutcome, StunError> {
        let mut last_error = StunError::ValidationFailure;
        for attempt in 0..self.ctx.config.attempt_budget {
            tracing::info!(uuid = %self.uuid, attempt, role = ?self.role, "stun attempt");
            match self.attempt(validation).await {
                Ok(outcome) => return Ok(outcome),
                Err(StunError::PeerError(message)) => return Err(StunError::PeerError(message)),
                Err(error) => {
                    tracing::info!(uuid = %self.uuid, %error, "stun attempt failed");
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    async fn attempt(&mut self, validation: &mut Validation) -> Result<StunOutcome, StunError> {
        if self.role == Role::Server {
            // A retrying initiator re-characterizes and re-invites;
            // punch at its freshest candidates.
            while let Ok(message) = self.messages.try_recv() {
                if let SignalingMessage::Stun(signal) = message {
                    if signal.kind == StunSignalKind::Invite {
                        self.invite = Some(signal);
                    }
                }
            }
        }
        let config = self.ctx.config.clone();
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let probe = characterize(socket.clone(), &self.ctx.stun_servers, &config).await?;
        let (router_type, allocation) = probe.classify();
        let prediction = predict_port(&probe);
        tracing::info!(
            uuid = %self.uuid,
            router = %router_type,
            allocation = %allocation,
            external = %probe.external_address(),
            "characterized local router"
        );

        let local = StunSignal {
            to: self.peer_jid.clone(),
            from: self.ctx.local_jid.clone(),
            kind: if self.role == Role::Client {
                StunSignalKind::Invite
            } else {
                StunSignalKind::Accept
            },
            uuid: self.uuid.clone(),
            version: SIGNALING_VERSION.to_string(),
            router_type,
            ip: Some(IpAddr::V4(probe.external_address())),
            port: prediction.port().or(Some(probe.external_port())),
            port_range: Some(prediction.range()),
            error: None,
        };

        let remote = match self.role {
            Role::Client => {
                self.ctx
                    .signaling
                    .send(&SignalingMessage::Stun(local))
                    .await?;
                self.await_peer_signal().await?
            }
            Role::Server => {
                let invite = self.invite.clone().ok_or(StunError::SignalingTimeout)?;
                self.ctx
                    .signaling
                    .send(&SignalingMessage::Stun(local))
                    .await?;
                invite
            }
        };
        if let Some(message) = remote.error {
            return Err(StunError::PeerError(message));
        }

        let candidates = candidate_addresses(&remote);
        if candidates.is_empty() {
            return Err(StunError::PredictionUnavailable);
        }

        // The characterization socket joins the punch pool: for cone
        // routers its mapping is exactly the one the peer was told.
        punch(
            socket,
            candidates,
            config.validation_timeout,
            validation,
        )
        .await
        .map(|(socket, peer)| StunOutcome {
            socket,
            peer,
            is_client: self.role == Role::Client,
        })
    }

    async fn await_peer_signal(&mut self) -> Result<StunSignal, StunError> {
        let deadline = tokio::time::Instant::now() + SIGNALING_TIMEOUT;
        loop {
            let message = tokio::time::timeout_at(deadline, self.messages.recv())
                .await
                .map_err(|_| StunError::SignalingTimeout)?
                .ok_or(StunError::SignalingTimeout)?;
            if let SignalingMessage::Stun(signal) = message {
                return Ok(signal);
            }
        }
    }
}

/// The candidate `(ip, port)` set a peer signal describes.
fn candidate_addresses(signal: &StunSignal) -> Vec<SocketAddr> {
    let Some(ip) = signal.ip else {
        return Vec::new();
    };
    let mut ports = Vec::new();
    if let Some(port) = signal.port {
        ports.push(port);
    }
    if let Some((start, end)) = signal.port_range {
        if start <= end {
            // Spiral outward from the middle so the likeliest ports go
            // first.
            let mid = start + (end - start) / 2;
            for offset in 0..=(end - start) {
                let candidate = if offset % 2 == 0 {
                    mid.checked_add(offset / 2 + offset % 2)
                } else {
                    mid.checked_sub(offset / 2 + 1)
                };
                if let Some(port) = candidate {
                    if (start..=end).contains(&port) {
                        ports.push(port);
                    }
                }
            }
        }
    }
    let mut seen = Vec::new();
    for port in ports {
        if port != 0 && !seen.contains(&port) {
            seen.push(port);
        }
    }
    seen.truncate(MAX_CANDIDATES);
    seen.into_iter().map(|port| SocketAddr::new(ip, port)).collect()
}

/// Runs the four canonical binding probes plus the two filtering
/// probes against the configured servers.
async fn characterize(
    socket: Arc<UdpSocket>,
    servers: &StunServers,
    config: &Config,
) -> Result<ProbeResults, StunError> {
    let transactions = StunTransactions::spawn(socket.clone());
    let result = characterize_inner(&transactions, socket, servers, config).await;
    transactions.shutdown().await;
    result
}

async fn characterize_inner(
    transactions: &StunTransactions,
    socket: Arc<UdpSocket>,
    servers: &StunServers,
    config: &Config,
) -> Result<ProbeResults, StunError> {
    let primary = servers.primary;
    let (first, _) = transactions
        .request(primary, Vec::new(), config.initial_stun_rto, TRANSACTION_ATTEMPTS)
        .await?;
    let first_mapping = first.external_address().ok_or(StunError::NoMapping)?;

    let alternate = servers
        .alternate
        .or_else(|| {
            first
                .changed_address()
                .map(|value| SocketAddr::new(IpAddr::V4(value.address), value.port))
        })
        .ok_or(StunError::NoMapping)?;

    let endpoints = [
        primary,
        SocketAddr::new(primary.ip(), alternate.port()),
        SocketAddr::new(alternate.ip(), primary.port()),
        alternate,
    ];

    let mut mappings = [(Ipv4Addr::UNSPECIFIED, 0); 4];
    mappings[0] = (first_mapping.address, first_mapping.port);
    for (slot, endpoint) in mappings.iter_mut().zip(endpoints.iter()).skip(1) {
        let (response, _) = transactions
            .request(
                *endpoint,
                Vec::new(),
                config.initial_stun_rto,
                TRANSACTION_ATTEMPTS,
            )
            .await?;
        let mapping = response.external_address().ok_or(StunError::NoMapping)?;
        *slot = (mapping.address, mapping.port);
    }

    // Filtering probes: ask the server to answer from its other
    // address and its other port. What comes back (or does not) tells
    // the filtering class.
    let unsolicited_received = match transactions
        .request(
            primary,
            vec![Attribute::ChangeRequest {
                change_ip: true,
                change_port: true,
            }],
            config.initial_stun_rto,
            FILTERING_ATTEMPTS,
        )
        .await
    {
        Ok((_, from)) if from == alternate => Some(true),
        Ok(_) => None,
        Err(_) => Some(false),
    };
    let changed_port_received = match transactions
        .request(
            primary,
            vec![Attribute::ChangeRequest {
                change_ip: false,
                change_port: true,
            }],
            config.initial_stun_rto,
            FILTERING_ATTEMPTS,
        )
        .await
    {
        Ok((_, from)) if from == SocketAddr::new(primary.ip(), alternate.port()) => Some(true),
        Ok(_) => None,
        Err(_) => Some(false),
    };

    Ok(ProbeResults {
        local_address: local_ipv4_towards(primary),
        local_port: socket.local_addr()?.port(),
        mappings,
        unsolicited_received,
        changed_port_received,
    })
}

/// The interface address the OS routes toward `server` from.
pub(crate) fn local_ipv4_towards(server: SocketAddr) -> Ipv4Addr {
    let probe = || -> io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(server)?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(IpAddr::V4(address)) => address,
        _ => Ipv4Addr::UNSPECIFIED,
    }
}

/// Demultiplexer for STUN transactions sharing one UDP socket: inbound
/// responses are routed to their waiters by transaction id, and the
/// session owns at most one outstanding request per server endpoint.
struct StunTransactions {
    socket: Arc<UdpSocket>,
    pending: Arc<FxDashMap<[u8; 16], oneshot::Sender<(StunMessage, SocketAddr)>>>,
    pump: JoinHandle<()>,
}

impl StunTransactions {
    fn spawn(socket: Arc<UdpSocket>) -> Self {
        let pending: Arc<FxDashMap<[u8; 16], oneshot::Sender<(StunMessage, SocketAddr)>>> =
            Default::default();
        let pump = {
            let socket = socket.clone();
            let pending = pending.clone();
            tokio::spawn(async move {
                let mut buffer = vec![0u8; 2048];
                loop {
                    let Ok((len, from)) = socket.recv_from(&mut buffer).await else {
                        return;
                    };
                    match StunMessage::decode(&buffer[..len]) {
                        Ok(response) => {
                            if let Some((_, waiter)) = pending.remove(&response.transaction_id) {
                                let _ = waiter.send((response, from));
                            } else {
                                tracing::trace!(%from, "response for unknown transaction");
                            }
                        }
                        Err(error) => {
                            tracing::trace!(%from, %error, "non-STUN datagram during probing");
                        }
                    }
                }
            })
        };
        Self {
            socket,
            pending,
            pump,
        }
    }

    /// Sends one binding request and waits for its response, doubling
    /// the timeout on each retransmission. The RTT of the first clean
    /// round trip is traced for diagnostics.
    async fn request(
        &self,
        dest: SocketAddr,
        attributes: Vec<Attribute>,
        initial_rto: Duration,
        attempts: u32,
    ) -> Result<(StunMessage, SocketAddr), StunError> {
        let mut request = StunMessage::new(MessageKind::BindingRequest);
        for attribute in attributes {
            request.add_attribute(attribute);
        }
        let transaction_id = request.transaction_id;
        let encoded = request.encode();

        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(transaction_id, tx);

        let sent_at = Instant::now();
        let mut rto = initial_rto;
        for attempt in 0..attempts {
            self.socket.send_to(&encoded, dest).await?;
            match timeout(rto, &mut rx).await {
                Ok(Ok((response, from))) => {
                    if attempt == 0 {
                        tracing::debug!(
                            %dest,
                            rtt_ms = sent_at.elapsed().as_millis() as u64,
                            "binding transaction round trip"
                        );
                    }
                    return Ok((response, from));
                }
                Ok(Err(_)) => break,
                Err(_) => rto *= 2,
            }
        }
        self.pending.remove(&transaction_id);
        Err(StunError::NoMapping)
    }

    async fn shutdown(self) {
        self.pump.abort();
        let _ = self.pump.await;
    }
}

/// One datagram of the validation exchange: our nonce, then the last
/// nonce we saw from the peer (zeros until one arrives). Seeing our own
/// nonce come back proves the outbound path; seeing any peer nonce
/// proves the inbound one.
fn punch_datagram(local_nonce: &[u8; NONCE_LEN], peer_nonce: &Option<[u8; NONCE_LEN]>) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(NONCE_LEN * 2);
    datagram.extend_from_slice(local_nonce);
    datagram.extend_from_slice(&peer_nonce.unwrap_or([0u8; NONCE_LEN]));
    datagram
}

async fn punch(
    first_socket: Arc<UdpSocket>,
    candidates: Vec<SocketAddr>,
    validation_timeout: Duration,
    validation: &mut Validation,
) -> Result<(Arc<UdpSocket>, SocketAddr), StunError> {
    let mut local_nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut local_nonce);

    let pool_size = candidates.len().clamp(1, MAX_POOL);
    let mut sockets = vec![first_socket];
    for _ in 1..pool_size {
        sockets.push(Arc::new(UdpSocket::bind("0.0.0.0:0").await?));
    }

    // Every pool socket forwards what it hears onto one queue.
    let stop = CancellationToken::new();
    let (datagrams_tx, mut datagrams) = mpsc::channel::<(usize, Vec<u8>, SocketAddr)>(64);
    let mut receivers = Vec::new();
    for (index, socket) in sockets.iter().cloned().enumerate() {
        let stop = stop.clone();
        let datagrams_tx = datagrams_tx.clone();
        receivers.push(tokio::spawn(async move {
            let mut buffer = vec![0u8; 2048];
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    received = socket.recv_from(&mut buffer) => {
                        let Ok((len, from)) = received else { return };
                        if datagrams_tx
                            .send((index, buffer[..len].to_vec(), from))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
        }));
    }

    let deadline = tokio::time::Instant::now() + validation_timeout;
    let mut resend = tokio::time::interval(PUNCH_INTERVAL);
    let mut peer_nonce: Option<[u8; NONCE_LEN]> = None;
    let mut read_validated = false;
    let mut write_validated = false;
    let mut winner: Option<(usize, SocketAddr)> = None;

    let outcome = loop {
        if read_validated && write_validated {
            break Ok(winner.expect("validated without a source"));
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                *validation = if read_validated != write_validated {
                    Validation::Partial
                } else {
                    Validation::Failure
                };
                break Err(if read_validated != write_validated {
                    StunError::ValidationPartial
                } else {
                    StunError::ValidationFailure
                });
            }
            _ = resend.tick() => {
                let datagram = punch_datagram(&local_nonce, &peer_nonce);
                for socket in &sockets {
                    for candidate in &candidates {
                        let _ = socket.send_to(&datagram, candidate).await;
                    }
                }
            }
            received = datagrams.recv() => {
                let Some((index, data, from)) = received else {
                    break Err(StunError::ValidationFailure);
                };
                if data.len() < NONCE_LEN {
                    continue;
                }
                let mut nonce = [0u8; NONCE_LEN];
                nonce.copy_from_slice(&data[..NONCE_LEN]);
                peer_nonce = Some(nonce);
                read_validated = true;
                winner = Some((index, from));
                if data.len() >= NONCE_LEN * 2 && data[NONCE_LEN..NONCE_LEN * 2] == local_nonce {
                    write_validated = true;
                }
                // Echo straight back so the peer's outbound validation
                // completes from the address it is talking to.
                let datagram = punch_datagram(&local_nonce, &peer_nonce);
                let _ = sockets[index].send_to(&datagram, from).await;
            }
        }
    };

    // Quiesce the pool before handing the winning socket over, so no
    // reader competes with the stream that will own it.
    stop.cancel();
    for receiver in receivers {
        let _ = receiver.await;
    }

    match outcome {
        Ok((index, peer)) => {
            *validation = Validation::Success;
            tracing::info!(%peer, "hole punch validated in both directions");
            Ok((sockets.swap_remove(index), peer))
        }
        Err(error) => Err(error),
    }
}
